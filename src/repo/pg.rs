use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Transaction};
use tracing::{debug, info, warn};

use super::*;
use crate::config::DbConfig;
use crate::hierarchy::{PostQuery, SortMode};

const USER_COLUMNS: &str = "nickname, fullname, about, email";
const THREAD_COLUMNS: &str = "id, title, author, forum, message, votes, slug, created";
const POST_COLUMNS: &str = "id, parent, author, message, is_edited, forum, thread, created, path";
// Nine binds per row keeps one statement under the 65535 parameter cap.
const POSTS_PER_INSERT: usize = 5000;

impl From<sqlx::Error> for RepoError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::PoolTimedOut => RepoError::Timeout,
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                RepoError::Conflict(db.constraint().unwrap_or("unique").to_string())
            }
            _ => RepoError::Internal(e.to_string()),
        }
    }
}

#[derive(sqlx::FromRow)]
struct PostRow {
    id: Id,
    parent: Id,
    author: String,
    message: String,
    is_edited: bool,
    forum: String,
    thread: Id,
    created: DateTime<Utc>,
    path: Vec<Id>,
}

impl From<PostRow> for Post {
    fn from(r: PostRow) -> Self {
        Post {
            id: r.id,
            parent: r.parent,
            author: r.author,
            message: r.message,
            is_edited: r.is_edited,
            forum: r.forum,
            thread: r.thread,
            created: r.created,
            path: r.path.into(),
        }
    }
}

#[derive(Clone)]
pub struct PgRepo {
    pool: PgPool,
}

impl PgRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open the pool, retrying while the server comes up, then apply pending migrations.
    pub async fn connect(cfg: &DbConfig) -> RepoResult<Self> {
        let mut delay = Duration::from_millis(200);
        let mut attempt = 1;
        let pool = loop {
            let res = PgPoolOptions::new()
                .max_connections(cfg.max_connections)
                .acquire_timeout(cfg.acquire_timeout)
                .connect(&cfg.url)
                .await;
            match res {
                Ok(pool) => break pool,
                Err(e) if attempt < cfg.connect_attempts => {
                    warn!(attempt, error = %e, "postgres not reachable yet");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(5));
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| RepoError::Internal(format!("migration failed: {e}")))?;
        info!(attempts = attempt, "connected to postgres");
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgRepo {
    async fn begin(&self, access: Access) -> RepoResult<Box<dyn Unit>> {
        let mut tx = self.pool.begin().await?;
        if access == Access::ReadOnly {
            sqlx::query("SET TRANSACTION READ ONLY").execute(&mut *tx).await?;
        }
        Ok(Box::new(PgUnit { tx: Some(tx) }))
    }
}

/// One transaction. Dropped without commit, sqlx rolls it back.
pub struct PgUnit {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgUnit {
    fn conn(&mut self) -> RepoResult<&mut PgConnection> {
        self.tx.as_deref_mut().ok_or_else(|| RepoError::Internal("unit already finished".into()))
    }
}

#[async_trait]
impl UserRepo for PgUnit {
    async fn get_user(&mut self, nickname: &str) -> RepoResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE LOWER(nickname) = LOWER($1)");
        Ok(sqlx::query_as::<_, User>(&sql).bind(nickname).fetch_optional(self.conn()?).await?)
    }

    async fn find_users(&mut self, nickname: &str, email: &str) -> RepoResult<Vec<User>> {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM users
             WHERE LOWER(nickname) = LOWER($1) OR LOWER(email) = LOWER($2)
             ORDER BY LOWER(nickname)"
        );
        Ok(sqlx::query_as::<_, User>(&sql)
            .bind(nickname)
            .bind(email)
            .fetch_all(self.conn()?)
            .await?)
    }

    async fn save_user(&mut self, user: &User) -> RepoResult<()> {
        sqlx::query("INSERT INTO users (nickname, fullname, about, email) VALUES ($1, $2, $3, $4)")
            .bind(&user.nickname)
            .bind(&user.fullname)
            .bind(&user.about)
            .bind(&user.email)
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn update_user(&mut self, user: &User) -> RepoResult<()> {
        sqlx::query(
            "UPDATE users SET fullname = $2, about = $3, email = $4
             WHERE LOWER(nickname) = LOWER($1)",
        )
        .bind(&user.nickname)
        .bind(&user.fullname)
        .bind(&user.about)
        .bind(&user.email)
        .execute(self.conn()?)
        .await?;
        Ok(())
    }

    async fn forum_users(&mut self, forum: &str, page: &UserPage) -> RepoResult<Vec<User>> {
        let (cmp, dir) = if page.desc { ("<", "DESC") } else { (">", "ASC") };
        let sql = format!(
            r#"
            SELECT {USER_COLUMNS} FROM users
            WHERE LOWER(nickname) IN (
                SELECT LOWER(author) FROM threads WHERE forum = $1
                UNION
                SELECT LOWER(author) FROM posts WHERE forum = $1
            )
              AND ($2::text IS NULL OR LOWER(nickname) COLLATE "C" {cmp} LOWER($2) COLLATE "C")
            ORDER BY LOWER(nickname) COLLATE "C" {dir}
            LIMIT $3
            "#
        );
        Ok(sqlx::query_as::<_, User>(&sql)
            .bind(forum)
            .bind(page.since.as_deref())
            .bind(page.limit)
            .fetch_all(self.conn()?)
            .await?)
    }
}

#[async_trait]
impl ForumRepo for PgUnit {
    async fn get_forum(&mut self, slug: &str) -> RepoResult<Option<Forum>> {
        let forum = sqlx::query_as::<_, Forum>(
            r#"
            SELECT f.slug, f.title, f.owner AS "user",
                   (SELECT COUNT(*) FROM posts p WHERE p.forum = f.slug) AS posts,
                   (SELECT COUNT(*) FROM threads t WHERE t.forum = f.slug) AS threads
            FROM forums f
            WHERE LOWER(f.slug) = LOWER($1)
            "#,
        )
        .bind(slug)
        .fetch_optional(self.conn()?)
        .await?;
        Ok(forum)
    }

    async fn save_forum(&mut self, new: &NewForum) -> RepoResult<()> {
        sqlx::query("INSERT INTO forums (slug, title, owner) VALUES ($1, $2, $3)")
            .bind(&new.slug)
            .bind(&new.title)
            .bind(&new.user)
            .execute(self.conn()?)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ThreadRepo for PgUnit {
    async fn get_thread(&mut self, id: Id) -> RepoResult<Option<Thread>> {
        let sql = format!("SELECT {THREAD_COLUMNS} FROM threads WHERE id = $1");
        Ok(sqlx::query_as::<_, Thread>(&sql).bind(id).fetch_optional(self.conn()?).await?)
    }

    async fn get_thread_by_slug(&mut self, slug: &str) -> RepoResult<Option<Thread>> {
        let sql = format!("SELECT {THREAD_COLUMNS} FROM threads WHERE LOWER(slug) = LOWER($1)");
        Ok(sqlx::query_as::<_, Thread>(&sql).bind(slug).fetch_optional(self.conn()?).await?)
    }

    async fn save_thread(&mut self, draft: &ThreadDraft) -> RepoResult<Thread> {
        let sql = format!(
            "INSERT INTO threads (title, author, forum, message, slug, created)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {THREAD_COLUMNS}"
        );
        Ok(sqlx::query_as::<_, Thread>(&sql)
            .bind(&draft.title)
            .bind(&draft.author)
            .bind(&draft.forum)
            .bind(&draft.message)
            .bind(draft.slug.as_deref())
            .bind(draft.created)
            .fetch_one(self.conn()?)
            .await?)
    }

    async fn update_thread(&mut self, thread: &Thread) -> RepoResult<()> {
        sqlx::query("UPDATE threads SET title = $2, message = $3 WHERE id = $1")
            .bind(thread.id)
            .bind(&thread.title)
            .bind(&thread.message)
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn forum_threads(&mut self, forum: &str, page: &ThreadPage) -> RepoResult<Vec<Thread>> {
        let (cmp, dir) = if page.desc { ("<=", "DESC") } else { (">=", "ASC") };
        let sql = format!(
            "SELECT {THREAD_COLUMNS} FROM threads
             WHERE forum = $1 AND ($2::timestamptz IS NULL OR created {cmp} $2)
             ORDER BY created {dir}, id {dir}
             LIMIT $3"
        );
        Ok(sqlx::query_as::<_, Thread>(&sql)
            .bind(forum)
            .bind(page.since)
            .bind(page.limit)
            .fetch_all(self.conn()?)
            .await?)
    }
}

#[async_trait]
impl PostRepo for PgUnit {
    async fn get_post(&mut self, id: Id) -> RepoResult<Option<Post>> {
        let sql = format!("SELECT {POST_COLUMNS} FROM posts WHERE id = $1");
        let row = sqlx::query_as::<_, PostRow>(&sql)
            .bind(id)
            .fetch_optional(self.conn()?)
            .await?;
        Ok(row.map(Post::from))
    }

    async fn reserve_post_ids(&mut self, n: usize) -> RepoResult<Vec<Id>> {
        let mut ids: Vec<Id> = sqlx::query_scalar(
            "SELECT nextval(pg_get_serial_sequence('posts', 'id')) FROM generate_series(1, $1)",
        )
        .bind(n as i64)
        .fetch_all(self.conn()?)
        .await?;
        ids.sort_unstable();
        Ok(ids)
    }

    async fn insert_posts(&mut self, posts: &[Post]) -> RepoResult<()> {
        for chunk in posts.chunks(POSTS_PER_INSERT) {
            let mut insert =
                QueryBuilder::<Postgres>::new(format!("INSERT INTO posts ({POST_COLUMNS}) "));
            insert.push_values(chunk, |mut row, post| {
                row.push_bind(post.id)
                    .push_bind(post.parent)
                    .push_bind(post.author.as_str())
                    .push_bind(post.message.as_str())
                    .push_bind(post.is_edited)
                    .push_bind(post.forum.as_str())
                    .push_bind(post.thread)
                    .push_bind(post.created)
                    .push_bind(post.path.as_slice());
            });
            insert.build().execute(self.conn()?).await?;
        }
        debug!(count = posts.len(), "inserted posts");
        Ok(())
    }

    async fn update_post_message(&mut self, id: Id, message: &str) -> RepoResult<()> {
        sqlx::query("UPDATE posts SET message = $2, is_edited = TRUE WHERE id = $1")
            .bind(id)
            .bind(message)
            .execute(self.conn()?)
            .await?;
        Ok(())
    }

    async fn thread_posts(&mut self, thread: Id, query: &PostQuery) -> RepoResult<Vec<Post>> {
        let (cmp, dir) = if query.desc { ("<", "DESC") } else { (">", "ASC") };
        // A cursor outside the thread makes the subselect NULL, so hierarchical modes return
        // nothing.
        let sql = match query.sort {
            SortMode::Flat => format!(
                "SELECT {POST_COLUMNS} FROM posts
                 WHERE thread = $1 AND ($2::bigint IS NULL OR id {cmp} $2)
                 ORDER BY id {dir}
                 LIMIT $3"
            ),
            SortMode::Tree => format!(
                "SELECT {POST_COLUMNS} FROM posts
                 WHERE thread = $1
                   AND ($2::bigint IS NULL
                        OR path {cmp} (SELECT path FROM posts WHERE id = $2 AND thread = $1))
                 ORDER BY path {dir}
                 LIMIT $3"
            ),
            SortMode::ParentTree => format!(
                "WITH roots AS (
                     SELECT id FROM posts
                     WHERE thread = $1 AND parent = 0
                       AND ($2::bigint IS NULL
                            OR id {cmp} (SELECT path[1] FROM posts WHERE id = $2 AND thread = $1))
                     ORDER BY id {dir}
                     LIMIT $3
                 )
                 SELECT {POST_COLUMNS} FROM posts
                 WHERE thread = $1 AND path[1] IN (SELECT id FROM roots)
                 ORDER BY path[1] {dir}, path ASC"
            ),
        };
        let rows = sqlx::query_as::<_, PostRow>(&sql)
            .bind(thread)
            .bind(query.since)
            .bind(query.limit)
            .fetch_all(self.conn()?)
            .await?;
        Ok(rows.into_iter().map(Post::from).collect())
    }
}

#[async_trait]
impl VoteRepo for PgUnit {
    async fn lock_thread(&mut self, thread: Id) -> RepoResult<()> {
        let locked: Option<Id> =
            sqlx::query_scalar("SELECT id FROM threads WHERE id = $1 FOR UPDATE")
                .bind(thread)
                .fetch_optional(self.conn()?)
                .await?;
        locked.map(|_| ()).ok_or_else(|| RepoError::Internal(format!("thread {thread} vanished")))
    }

    async fn upsert_vote(&mut self, thread: Id, vote: &Vote) -> RepoResult<Option<i32>> {
        let previous: Option<i32> =
            sqlx::query_scalar("SELECT voice FROM votes WHERE thread = $1 AND nickname = $2")
                .bind(thread)
                .bind(&vote.nickname)
                .fetch_optional(self.conn()?)
                .await?;
        sqlx::query(
            "INSERT INTO votes (thread, nickname, voice) VALUES ($1, $2, $3)
             ON CONFLICT (thread, nickname) DO UPDATE SET voice = EXCLUDED.voice",
        )
        .bind(thread)
        .bind(&vote.nickname)
        .bind(vote.voice)
        .execute(self.conn()?)
        .await?;
        Ok(previous)
    }

    async fn add_votes(&mut self, thread: Id, delta: i64) -> RepoResult<i64> {
        Ok(sqlx::query_scalar(
            "UPDATE threads SET votes = votes + $2 WHERE id = $1 RETURNING votes",
        )
        .bind(thread)
        .bind(delta)
        .fetch_one(self.conn()?)
        .await?)
    }
}

#[async_trait]
impl ServiceRepo for PgUnit {
    async fn status(&mut self) -> RepoResult<Status> {
        let (user, forum, thread, post): (i64, i64, i64, i64) = sqlx::query_as(
            "SELECT (SELECT COUNT(*) FROM users), (SELECT COUNT(*) FROM forums),
                    (SELECT COUNT(*) FROM threads), (SELECT COUNT(*) FROM posts)",
        )
        .fetch_one(self.conn()?)
        .await?;
        Ok(Status { user, forum, thread, post })
    }

    async fn clear(&mut self) -> RepoResult<()> {
        sqlx::query("TRUNCATE votes, posts, threads, forums, users RESTART IDENTITY CASCADE")
            .execute(self.conn()?)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Transactional for PgUnit {
    async fn commit(&mut self) -> RepoResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| RepoError::Internal("unit already finished".into()))?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> RepoResult<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}
