//! Storage boundary. Every call is scoped to a unit of work opened through [`Store::begin`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::hierarchy::PostQuery;
use crate::models::*;

#[cfg(feature = "inmem-store")]
pub mod inmem;
#[cfg(feature = "postgres-store")]
pub mod pg;

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("timed out waiting for a storage unit")]
    Timeout,
    #[error("internal: {0}")]
    Internal(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

/// Cursor window over the users active in a forum, ordered by case-folded nickname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPage {
    pub limit: i64,
    pub since: Option<String>, // exclusive
    pub desc: bool,
}

/// Window over a forum's threads, ordered by creation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadPage {
    pub limit: i64,
    pub since: Option<DateTime<Utc>>, // inclusive
    pub desc: bool,
}

/// A thread whose references are already canonical.
#[derive(Debug, Clone)]
pub struct ThreadDraft {
    pub title: String,
    pub author: String,
    pub forum: String,
    pub message: String,
    pub slug: Option<String>,
    pub created: DateTime<Utc>,
}

#[async_trait]
pub trait UserRepo: Send {
    async fn get_user(&mut self, nickname: &str) -> RepoResult<Option<User>>;
    /// Users holding either the nickname or the email.
    async fn find_users(&mut self, nickname: &str, email: &str) -> RepoResult<Vec<User>>;
    async fn save_user(&mut self, user: &User) -> RepoResult<()>;
    async fn update_user(&mut self, user: &User) -> RepoResult<()>;
    /// Users who authored a thread or a post in `forum` (canonical slug).
    async fn forum_users(&mut self, forum: &str, page: &UserPage) -> RepoResult<Vec<User>>;
}

#[async_trait]
pub trait ForumRepo: Send {
    /// Forum with post and thread counts aggregated inside the unit.
    async fn get_forum(&mut self, slug: &str) -> RepoResult<Option<Forum>>;
    async fn save_forum(&mut self, new: &NewForum) -> RepoResult<()>;
}

#[async_trait]
pub trait ThreadRepo: Send {
    async fn get_thread(&mut self, id: Id) -> RepoResult<Option<Thread>>;
    async fn get_thread_by_slug(&mut self, slug: &str) -> RepoResult<Option<Thread>>;
    async fn save_thread(&mut self, draft: &ThreadDraft) -> RepoResult<Thread>;
    async fn update_thread(&mut self, thread: &Thread) -> RepoResult<()>;
    async fn forum_threads(&mut self, forum: &str, page: &ThreadPage) -> RepoResult<Vec<Thread>>;
}

#[async_trait]
pub trait PostRepo: Send {
    async fn get_post(&mut self, id: Id) -> RepoResult<Option<Post>>;
    /// `n` fresh post ids, strictly increasing.
    async fn reserve_post_ids(&mut self, n: usize) -> RepoResult<Vec<Id>>;
    async fn insert_posts(&mut self, posts: &[Post]) -> RepoResult<()>;
    async fn update_post_message(&mut self, id: Id, message: &str) -> RepoResult<()>;
    async fn thread_posts(&mut self, thread: Id, query: &PostQuery) -> RepoResult<Vec<Post>>;
}

#[async_trait]
pub trait VoteRepo: Send {
    /// Serialize voters on one thread until the unit ends.
    async fn lock_thread(&mut self, thread: Id) -> RepoResult<()>;
    /// Insert-or-replace; returns the replaced voice, if any.
    async fn upsert_vote(&mut self, thread: Id, vote: &Vote) -> RepoResult<Option<i32>>;
    /// Apply `delta` to the running total and return the new total.
    async fn add_votes(&mut self, thread: Id, delta: i64) -> RepoResult<i64>;
}

#[async_trait]
pub trait ServiceRepo: Send {
    async fn status(&mut self) -> RepoResult<Status>;
    async fn clear(&mut self) -> RepoResult<()>;
}

#[async_trait]
pub trait Transactional: Send {
    async fn commit(&mut self) -> RepoResult<()>;
    async fn rollback(&mut self) -> RepoResult<()>;
}

pub trait Unit:
    UserRepo + ForumRepo + ThreadRepo + PostRepo + VoteRepo + ServiceRepo + Transactional
{
}

impl<T> Unit for T where
    T: UserRepo + ForumRepo + ThreadRepo + PostRepo + VoteRepo + ServiceRepo + Transactional
{
}

/// Hands out units of work. Dropping a unit without committing discards its writes.
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self, access: Access) -> RepoResult<Box<dyn Unit>>;
}
