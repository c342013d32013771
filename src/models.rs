use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::hierarchy::PostPath;

// Always Postgres-shaped ids, in-memory backend included
pub type Id = i64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct User {
    pub nickname: String,
    pub fullname: String,
    pub about: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewUser {
    pub fullname: String,
    #[serde(default)]
    pub about: String,
    pub email: String,
}

/// Partial profile update; absent or empty fields keep their stored value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdateUser {
    pub fullname: Option<String>,
    pub about: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Forum {
    pub slug: String,
    pub title: String,
    pub user: String,
    pub posts: i64,   // aggregated, never stored
    pub threads: i64, // aggregated, never stored
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewForum {
    pub slug: String,
    pub title: String,
    pub user: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
pub struct Thread {
    pub id: Id,
    pub title: String,
    pub author: String,
    pub forum: String,
    pub message: String,
    pub votes: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewThread {
    pub title: String,
    pub author: String,
    pub message: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
}

impl NewThread {
    /// Empty slug is the "no slug" state.
    pub fn slug(&self) -> Option<&str> {
        self.slug.as_deref().filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdateThread {
    pub title: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Post {
    pub id: Id,
    pub parent: Id, // 0 = top-level
    pub author: String,
    pub message: String,
    #[serde(rename = "isEdited")]
    pub is_edited: bool,
    pub forum: String,
    pub thread: Id,
    pub created: DateTime<Utc>,
    #[serde(skip)]
    pub path: PostPath, // ordering index, hidden from API clients
}

impl Post {
    pub fn parent_id(&self) -> Option<Id> {
        (self.parent != 0).then_some(self.parent)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewPost {
    #[serde(default)]
    pub parent: Id,
    pub author: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdatePost {
    pub message: Option<String>,
}

/// Post with the related entities requested through `related=user,forum,thread`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PostDetails {
    pub post: Post,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<User>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread: Option<Thread>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forum: Option<Forum>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Vote {
    pub nickname: String,
    pub voice: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Status {
    pub user: i64,
    pub forum: i64,
    pub thread: i64,
    pub post: i64,
}
