use std::path::PathBuf;
use std::time::Duration;

/// Pool settings for the Postgres backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub connect_attempts: u32,
}

/// Process configuration, read once at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database: Option<DbConfig>,
    /// Upper bound on one unit of work, acquisition included.
    pub unit_timeout: Duration,
    pub data_dir: Option<PathBuf>,
    pub cors_origins: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty =
            |name: &str| get(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let u32_env = |name: &str, default: u32| {
            non_empty(name).and_then(|v| v.parse().ok()).unwrap_or(default)
        };
        let secs_env = |name: &str, default: u64| {
            Duration::from_secs(non_empty(name).and_then(|v| v.parse().ok()).unwrap_or(default))
        };

        let database = non_empty("DATABASE_URL").map(|url| DbConfig {
            url,
            max_connections: u32_env("DB_MAX_CONNECTIONS", 16).max(1),
            acquire_timeout: secs_env("DB_ACQUIRE_TIMEOUT_SECS", 5),
            connect_attempts: u32_env("DB_CONNECT_ATTEMPTS", 15).max(1),
        });

        Self {
            bind_addr: non_empty("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:5000".to_string()),
            database,
            unit_timeout: secs_env("UNIT_TIMEOUT_SECS", 30),
            data_dir: non_empty("FORUM_DATA_DIR").map(PathBuf::from),
            cors_origins: non_empty("CORS_ALLOWED_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|o| !o.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}
