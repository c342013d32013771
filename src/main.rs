use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware::Compress, web, App, HttpServer};
use anyhow::Context;
use tracing::{info, Level};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi; // bring trait into scope for ApiDoc::openapi()
use utoipa_swagger_ui::SwaggerUi;

use forum::openapi::ApiDoc;
use forum::repo::Store;
use forum::{config, AppConfig, AppState, ForumService};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load .env automatically only in debug builds; deployments set the environment themselves.
    if cfg!(debug_assertions) {
        let _ = dotenv::dotenv();
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let cfg = AppConfig::from_env();
    info!(
        bind = %cfg.bind_addr,
        unit_timeout_secs = cfg.unit_timeout.as_secs(),
        "Bootstrapping forum server"
    );

    let store = build_store(&cfg).await?;
    let service = ForumService::new(store, cfg.unit_timeout);
    let openapi = ApiDoc::openapi();
    let origins = cfg.cors_origins.clone();

    let server = HttpServer::new(move || {
        let cors = origins.iter().fold(
            Cors::default()
                .allow_any_header()
                .allowed_methods(["GET", "POST", "OPTIONS"])
                .max_age(3600),
            |c, origin| c.allowed_origin(origin),
        );

        App::new()
            .wrap(TracingLogger::default())
            .wrap(Compress::default())
            .wrap(cors)
            .app_data(web::Data::new(AppState { service: service.clone() }))
            .configure(config)
            .service(SwaggerUi::new("/docs/{_:.*}").url("/docs/openapi.json", openapi.clone()))
    })
    .bind(cfg.bind_addr.as_str())
    .with_context(|| format!("binding {}", cfg.bind_addr))?;

    info!("Listening on http://{}", cfg.bind_addr);
    server.run().await?;
    Ok(())
}

async fn build_store(cfg: &AppConfig) -> anyhow::Result<Arc<dyn Store>> {
    #[cfg(feature = "postgres-store")]
    if let Some(db) = &cfg.database {
        let repo = forum::repo::pg::PgRepo::connect(db).await.context("connecting to postgres")?;
        info!(max_connections = db.max_connections, "Using Postgres repository backend");
        return Ok(Arc::new(repo));
    }

    fallback_store(cfg)
}

#[cfg(feature = "inmem-store")]
fn fallback_store(cfg: &AppConfig) -> anyhow::Result<Arc<dyn Store>> {
    use forum::repo::inmem::InMemRepo;
    let repo = match &cfg.data_dir {
        Some(dir) => InMemRepo::with_snapshot(dir),
        None => InMemRepo::new(),
    };
    info!(snapshot_dir = ?cfg.data_dir, "Using in-memory repository backend");
    Ok(Arc::new(repo))
}

#[cfg(not(feature = "inmem-store"))]
fn fallback_store(_cfg: &AppConfig) -> anyhow::Result<Arc<dyn Store>> {
    Err(anyhow::anyhow!(
        "no storage backend: set DATABASE_URL, or build with the inmem-store feature"
    ))
}
