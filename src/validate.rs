//! Resolves references against the active unit and returns their canonical records.

use crate::error::{Conflict, ForumError, Lookup};
use crate::hierarchy::PostPath;
use crate::models::{Forum, Id, Post, Thread, User};
use crate::repo::{ForumRepo, PostRepo, ThreadRepo, Unit, UserRepo};

pub async fn user(unit: &mut dyn Unit, nickname: &str, what: Lookup) -> Result<User, ForumError> {
    unit.get_user(nickname).await?.ok_or_else(|| ForumError::not_found(what, nickname))
}

pub async fn forum(unit: &mut dyn Unit, slug: &str, what: Lookup) -> Result<Forum, ForumError> {
    unit.get_forum(slug).await?.ok_or_else(|| ForumError::not_found(what, slug))
}

/// A reference made only of digits is a thread id; anything else is a slug.
pub async fn thread(unit: &mut dyn Unit, slug_or_id: &str) -> Result<Thread, ForumError> {
    if slug_or_id.is_empty() {
        return Err(ForumError::bad_request("empty thread reference"));
    }
    let found = match parse_id(slug_or_id) {
        Some(id) => unit.get_thread(id).await?,
        None => unit.get_thread_by_slug(slug_or_id).await?,
    };
    found.ok_or_else(|| ForumError::not_found(Lookup::Thread, slug_or_id))
}

pub async fn post(unit: &mut dyn Unit, id: Id) -> Result<Post, ForumError> {
    unit.get_post(id).await?.ok_or_else(|| ForumError::not_found(Lookup::Post, id))
}

/// Path of `parent`, which must be a post of `thread`.
pub async fn parent_post(
    unit: &mut dyn Unit,
    thread: &Thread,
    parent: Id,
) -> Result<PostPath, ForumError> {
    match unit.get_post(parent).await? {
        Some(post) if post.thread == thread.id => Ok(post.path),
        _ => Err(Conflict::ForeignParent { parent }.into()),
    }
}

fn parse_id(s: &str) -> Option<Id> {
    if s.bytes().all(|b| b.is_ascii_digit()) {
        s.parse().ok()
    } else {
        None
    }
}
