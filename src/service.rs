//! Forum operations. Each public method is exactly one unit of work.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use tracing::info;

use crate::error::{Conflict, ForumError, Lookup};
use crate::hierarchy::{self, PostPath, PostQuery};
use crate::models::*;
use crate::repo::{
    ForumRepo, PostRepo, ServiceRepo, Store, ThreadDraft, ThreadPage, ThreadRepo, UserPage,
    UserRepo,
};
use crate::tx::Coordinator;
use crate::{validate, votes};

/// Entities that can be attached to a post's details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Related {
    User,
    Forum,
    Thread,
}

impl Related {
    /// Parse `related=user,forum`; unknown names are ignored.
    pub fn parse_list(raw: &str) -> Vec<Related> {
        raw.split(',')
            .filter_map(|name| match name.trim() {
                "user" => Some(Related::User),
                "forum" => Some(Related::Forum),
                "thread" => Some(Related::Thread),
                _ => None,
            })
            .collect()
    }
}

#[derive(Clone)]
pub struct ForumService {
    tx: Coordinator,
}

fn keep_or_replace(current: &mut String, update: Option<String>) -> bool {
    match update {
        Some(v) if !v.is_empty() && v != *current => {
            *current = v;
            true
        }
        _ => false,
    }
}

impl ForumService {
    pub fn new(store: Arc<dyn Store>, unit_timeout: Duration) -> Self {
        Self { tx: Coordinator::new(store, unit_timeout) }
    }

    // ---------------- users ----------------

    pub async fn create_user(&self, nickname: &str, new: NewUser) -> Result<User, ForumError> {
        let user = User {
            nickname: nickname.to_string(),
            fullname: new.fullname,
            about: new.about,
            email: new.email,
        };
        let created = self
            .tx
            .write(move |unit| {
                Box::pin(async move {
                    let taken = unit.find_users(&user.nickname, &user.email).await?;
                    if !taken.is_empty() {
                        return Err(Conflict::Users(taken).into());
                    }
                    unit.save_user(&user).await?;
                    Ok(user)
                })
            })
            .await?;
        info!(nickname = %created.nickname, "user created");
        Ok(created)
    }

    pub async fn get_user(&self, nickname: &str) -> Result<User, ForumError> {
        let nickname = nickname.to_string();
        self.tx
            .read(move |unit| {
                Box::pin(async move { validate::user(unit, &nickname, Lookup::User).await })
            })
            .await
    }

    pub async fn update_user(
        &self,
        nickname: &str,
        update: UpdateUser,
    ) -> Result<User, ForumError> {
        let nickname = nickname.to_string();
        self.tx
            .write(move |unit| {
                Box::pin(async move {
                    let mut user = validate::user(unit, &nickname, Lookup::User).await?;
                    let current = user.email.to_lowercase();
                    let email_changed = update
                        .email
                        .as_deref()
                        .is_some_and(|e| !e.is_empty() && e.to_lowercase() != current);
                    let mut changed = keep_or_replace(&mut user.fullname, update.fullname);
                    changed |= keep_or_replace(&mut user.about, update.about);
                    changed |= keep_or_replace(&mut user.email, update.email);
                    if email_changed {
                        let holders = unit.find_users(&user.nickname, &user.email).await?;
                        let other = holders
                            .into_iter()
                            .find(|u| !u.nickname.eq_ignore_ascii_case(&user.nickname));
                        if let Some(other) = other {
                            return Err(Conflict::EmailTaken { nickname: other.nickname }.into());
                        }
                    }
                    if changed {
                        unit.update_user(&user).await?;
                    }
                    Ok(user)
                })
            })
            .await
    }

    // ---------------- forums ----------------

    pub async fn create_forum(&self, new: NewForum) -> Result<Forum, ForumError> {
        let forum = self
            .tx
            .write(move |unit| {
                Box::pin(async move {
                    let owner = validate::user(unit, &new.user, Lookup::User).await?;
                    if let Some(existing) = unit.get_forum(&new.slug).await? {
                        return Err(Conflict::Forum(existing).into());
                    }
                    let new = NewForum { user: owner.nickname, ..new };
                    unit.save_forum(&new).await?;
                    validate::forum(unit, &new.slug, Lookup::Forum).await
                })
            })
            .await?;
        info!(slug = %forum.slug, owner = %forum.user, "forum created");
        Ok(forum)
    }

    pub async fn get_forum(&self, slug: &str) -> Result<Forum, ForumError> {
        let slug = slug.to_string();
        self.tx
            .read(move |unit| {
                Box::pin(async move { validate::forum(unit, &slug, Lookup::Forum).await })
            })
            .await
    }

    pub async fn forum_users(
        &self,
        slug: &str,
        limit: Option<i64>,
        since: Option<String>,
        desc: bool,
    ) -> Result<Vec<User>, ForumError> {
        let page = UserPage { limit: hierarchy::validate_limit(limit)?, since, desc };
        let slug = slug.to_string();
        self.tx
            .read(move |unit| {
                Box::pin(async move {
                    let forum = validate::forum(unit, &slug, Lookup::Forum).await?;
                    Ok(unit.forum_users(&forum.slug, &page).await?)
                })
            })
            .await
    }

    pub async fn forum_threads(
        &self,
        slug: &str,
        limit: Option<i64>,
        since: Option<DateTime<Utc>>,
        desc: bool,
    ) -> Result<Vec<Thread>, ForumError> {
        let page = ThreadPage { limit: hierarchy::validate_limit(limit)?, since, desc };
        let slug = slug.to_string();
        self.tx
            .read(move |unit| {
                Box::pin(async move {
                    let forum = validate::forum(unit, &slug, Lookup::Forum).await?;
                    Ok(unit.forum_threads(&forum.slug, &page).await?)
                })
            })
            .await
    }

    // ---------------- threads ----------------

    pub async fn create_thread(&self, forum: &str, new: NewThread) -> Result<Thread, ForumError> {
        let forum = forum.to_string();
        let thread = self
            .tx
            .write(move |unit| {
                Box::pin(async move {
                    let author = validate::user(unit, &new.author, Lookup::ThreadAuthor).await?;
                    let forum = validate::forum(unit, &forum, Lookup::ThreadForum).await?;
                    if let Some(slug) = new.slug() {
                        if let Some(existing) = unit.get_thread_by_slug(slug).await? {
                            return Err(Conflict::Thread(existing).into());
                        }
                    }
                    let draft = ThreadDraft {
                        slug: new.slug().map(str::to_string),
                        created: new.created.unwrap_or_else(Utc::now),
                        title: new.title,
                        author: author.nickname,
                        forum: forum.slug,
                        message: new.message,
                    };
                    Ok(unit.save_thread(&draft).await?)
                })
            })
            .await?;
        info!(id = thread.id, forum = %thread.forum, "thread created");
        Ok(thread)
    }

    pub async fn get_thread(&self, slug_or_id: &str) -> Result<Thread, ForumError> {
        let key = slug_or_id.to_string();
        self.tx
            .read(move |unit| Box::pin(async move { validate::thread(unit, &key).await }))
            .await
    }

    pub async fn update_thread(
        &self,
        slug_or_id: &str,
        update: UpdateThread,
    ) -> Result<Thread, ForumError> {
        let key = slug_or_id.to_string();
        self.tx
            .write(move |unit| {
                Box::pin(async move {
                    let mut thread = validate::thread(unit, &key).await?;
                    let mut changed = keep_or_replace(&mut thread.title, update.title);
                    changed |= keep_or_replace(&mut thread.message, update.message);
                    if changed {
                        unit.update_thread(&thread).await?;
                    }
                    Ok(thread)
                })
            })
            .await
    }

    pub async fn vote(&self, slug_or_id: &str, vote: Vote) -> Result<Thread, ForumError> {
        let key = slug_or_id.to_string();
        self.tx
            .write(move |unit| Box::pin(async move { votes::set_vote(unit, &key, &vote).await }))
            .await
    }

    // ---------------- posts ----------------

    /// Insert a batch of posts into one thread. Every post is checked in submission order, author
    /// first, and the first failure rejects the whole batch.
    pub async fn create_posts(
        &self,
        slug_or_id: &str,
        batch: Vec<NewPost>,
    ) -> Result<Vec<Post>, ForumError> {
        let key = slug_or_id.to_string();
        let posts = self
            .tx
            .write(move |unit| {
                Box::pin(async move {
                    let thread = validate::thread(unit, &key).await?;
                    if batch.is_empty() {
                        return Ok(Vec::new());
                    }
                    let ids = unit.reserve_post_ids(batch.len()).await?;
                    let mut batch = batch;
                    let mut parents: HashMap<Id, PostPath> = HashMap::new();
                    let mut earlier: HashSet<Id> = HashSet::with_capacity(batch.len());
                    for (new, &id) in batch.iter_mut().zip(&ids) {
                        let author = validate::user(unit, &new.author, Lookup::PostAuthor).await?;
                        new.author = author.nickname;
                        let known =
                            earlier.contains(&new.parent) || parents.contains_key(&new.parent);
                        if new.parent != 0 && !known {
                            let path = validate::parent_post(unit, &thread, new.parent).await?;
                            parents.insert(new.parent, path);
                        }
                        earlier.insert(id);
                    }
                    let created = Utc::now().trunc_subsecs(3);
                    let posts = hierarchy::assign(&thread, created, batch, &ids, &parents)?;
                    unit.insert_posts(&posts).await?;
                    Ok(posts)
                })
            })
            .await?;
        if let Some(first) = posts.first() {
            info!(thread = first.thread, count = posts.len(), "posts created");
        }
        Ok(posts)
    }

    pub async fn thread_posts(
        &self,
        slug_or_id: &str,
        query: PostQuery,
    ) -> Result<Vec<Post>, ForumError> {
        let key = slug_or_id.to_string();
        self.tx
            .read(move |unit| {
                Box::pin(async move {
                    let thread = validate::thread(unit, &key).await?;
                    Ok(unit.thread_posts(thread.id, &query).await?)
                })
            })
            .await
    }

    pub async fn post_details(
        &self,
        id: Id,
        related: Vec<Related>,
    ) -> Result<PostDetails, ForumError> {
        self.tx
            .read(move |unit| {
                Box::pin(async move {
                    let post = validate::post(unit, id).await?;
                    let mut details = PostDetails { post, author: None, thread: None, forum: None };
                    for what in related {
                        match what {
                            Related::User if details.author.is_none() => {
                                let author = &details.post.author;
                                let user = validate::user(unit, author, Lookup::User).await?;
                                details.author = Some(user);
                            }
                            Related::Thread if details.thread.is_none() => {
                                let id = details.post.thread;
                                let thread = unit.get_thread(id).await?;
                                let thread = thread
                                    .ok_or_else(|| ForumError::not_found(Lookup::Thread, id))?;
                                details.thread = Some(thread);
                            }
                            Related::Forum if details.forum.is_none() => {
                                let slug = &details.post.forum;
                                let forum = validate::forum(unit, slug, Lookup::Forum).await?;
                                details.forum = Some(forum);
                            }
                            _ => {}
                        }
                    }
                    Ok(details)
                })
            })
            .await
    }

    /// Absent, empty or unchanged message leaves the post untouched.
    pub async fn update_post(&self, id: Id, update: UpdatePost) -> Result<Post, ForumError> {
        self.tx
            .write(move |unit| {
                Box::pin(async move {
                    let mut post = validate::post(unit, id).await?;
                    if keep_or_replace(&mut post.message, update.message) {
                        unit.update_post_message(post.id, &post.message).await?;
                        post.is_edited = true;
                    }
                    Ok(post)
                })
            })
            .await
    }

    // ---------------- service ----------------

    pub async fn status(&self) -> Result<Status, ForumError> {
        self.tx.read(|unit| Box::pin(async move { Ok(unit.status().await?) })).await
    }

    pub async fn clear(&self) -> Result<(), ForumError> {
        self.tx.write(|unit| Box::pin(async move { Ok(unit.clear().await?) })).await?;
        info!("all data cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn related_list_ignores_unknown_names() {
        let parsed = Related::parse_list("user, thread,bogus");
        assert_eq!(parsed, vec![Related::User, Related::Thread]);
        assert!(Related::parse_list("").is_empty());
    }

    #[test]
    fn empty_update_keeps_value() {
        let mut v = "old".to_string();
        assert!(!keep_or_replace(&mut v, None));
        assert!(!keep_or_replace(&mut v, Some(String::new())));
        assert!(!keep_or_replace(&mut v, Some("old".into())));
        assert!(keep_or_replace(&mut v, Some("new".into())));
        assert_eq!(v, "new");
    }
}
