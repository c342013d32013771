use std::fmt;

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;
use utoipa::ToSchema;

use crate::models::{Forum, Id, Thread, User};
use crate::repo::RepoError;

#[derive(Debug, Serialize, ToSchema)]
pub struct ApiErrorBody {
    pub message: String,
}

/// What a failed reference lookup was resolving; renders the reason half of a 404 message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    User,
    Forum,
    Thread,
    Post,
    ThreadAuthor,
    ThreadForum,
    PostAuthor,
}

impl fmt::Display for Lookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Lookup::User => "Can't find user by nickname",
            Lookup::Forum => "Can't find forum with slug",
            Lookup::Thread => "Can't find thread by slug or id",
            Lookup::Post => "Can't find post with id",
            Lookup::ThreadAuthor => "Can't find thread author by nickname",
            Lookup::ThreadForum => "Can't find thread forum by slug",
            Lookup::PostAuthor => "Can't find post author by nickname",
        };
        f.write_str(reason)
    }
}

/// The existing state a write collided with. Resource-bearing variants are returned verbatim.
#[derive(Debug, Clone, PartialEq)]
pub enum Conflict {
    Forum(Forum),
    Thread(Thread),
    Users(Vec<User>),
    EmailTaken { nickname: String },
    ForeignParent { parent: Id },
    Duplicate(String),
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conflict::Forum(forum) => write!(f, "Forum already exists: {}", forum.slug),
            Conflict::Thread(thread) => write!(f, "Thread already exists: {}", thread.id),
            Conflict::Users(users) => {
                let names: Vec<&str> = users.iter().map(|u| u.nickname.as_str()).collect();
                write!(f, "User already exists: {}", names.join(","))
            }
            Conflict::EmailTaken { nickname } => {
                write!(f, "This email is already registered by user: {nickname}")
            }
            Conflict::ForeignParent { parent } => {
                write!(f, "Parent post was created in another thread: {parent}")
            }
            Conflict::Duplicate(what) => write!(f, "Duplicate entry: {what}"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ForumError {
    #[error("{what}: {key}")]
    NotFound { what: Lookup, key: String },
    #[error("{0}")]
    Conflict(Conflict),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ForumError {
    pub fn not_found(what: Lookup, key: impl fmt::Display) -> Self {
        ForumError::NotFound { what, key: key.to_string() }
    }

    pub fn bad_request(reason: impl Into<String>) -> Self {
        ForumError::BadRequest(reason.into())
    }
}

impl From<Conflict> for ForumError {
    fn from(c: Conflict) -> Self {
        ForumError::Conflict(c)
    }
}

impl From<RepoError> for ForumError {
    fn from(e: RepoError) -> Self {
        match e {
            RepoError::Conflict(what) => ForumError::Conflict(Conflict::Duplicate(what)),
            RepoError::Timeout => ForumError::Internal("storage unit timed out".into()),
            RepoError::Internal(msg) => ForumError::Internal(msg),
        }
    }
}

impl ResponseError for ForumError {
    fn status_code(&self) -> StatusCode {
        match self {
            ForumError::NotFound { .. } => StatusCode::NOT_FOUND,
            ForumError::Conflict(_) => StatusCode::CONFLICT,
            ForumError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ForumError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut res = HttpResponse::build(self.status_code());
        match self {
            ForumError::NotFound { .. } => res.json(ApiErrorBody { message: self.to_string() }),
            ForumError::Conflict(Conflict::Forum(forum)) => res.json(forum),
            ForumError::Conflict(Conflict::Thread(thread)) => res.json(thread),
            ForumError::Conflict(Conflict::Users(users)) => res.json(users),
            ForumError::Conflict(other) => res.json(ApiErrorBody { message: other.to_string() }),
            ForumError::BadRequest(reason) => {
                tracing::debug!(%reason, "rejected request");
                res.finish()
            }
            ForumError::Internal(msg) => {
                tracing::error!(error = %msg, "request failed");
                res.finish()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_message_names_the_key() {
        let err = ForumError::not_found(Lookup::User, "j.sparrow");
        assert_eq!(err.to_string(), "Can't find user by nickname: j.sparrow");
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn storage_failures_map_to_taxonomy() {
        let err: ForumError = RepoError::Conflict("users_email_key".into()).into();
        assert!(matches!(err, ForumError::Conflict(Conflict::Duplicate(_))));
        assert_eq!(err.status_code(), StatusCode::CONFLICT);

        let err: ForumError = RepoError::Timeout.into();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
