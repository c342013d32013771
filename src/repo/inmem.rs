use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, error, info, warn};

use super::*;
use crate::hierarchy::{self, PostPath, PostQuery};

const SNAPSHOT_FILE: &str = "state.json";
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ForumRow {
    slug: String,
    title: String,
    user: String,
}

// Case-insensitive keys are stored folded; records keep the submitted casing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct State {
    users: BTreeMap<String, User>,
    forums: BTreeMap<String, ForumRow>,
    threads: BTreeMap<Id, Thread>,
    posts: BTreeMap<Id, Post>,
    votes: BTreeMap<Id, BTreeMap<String, i32>>,
    last_thread_id: Id,
    last_post_id: Id,
}

fn fold(s: &str) -> String {
    s.to_lowercase()
}

impl State {
    fn forum(&self, key: &str) -> Option<Forum> {
        let row = self.forums.get(key)?;
        let threads = self.threads.values().filter(|t| t.forum == row.slug).count();
        let posts = self.posts.values().filter(|p| p.forum == row.slug).count();
        Some(Forum {
            slug: row.slug.clone(),
            title: row.title.clone(),
            user: row.user.clone(),
            posts: posts as i64,
            threads: threads as i64,
        })
    }

    // Paths are an index over parent links and are not part of the snapshot.
    fn rebuild_paths(&mut self) {
        let mut paths: HashMap<Id, PostPath> = HashMap::with_capacity(self.posts.len());
        for post in self.posts.values_mut() {
            let path = match post.parent_id().and_then(|parent| paths.get(&parent)) {
                Some(parent_path) => parent_path.child(post.id),
                None => PostPath::top_level(post.id),
            };
            paths.insert(post.id, path.clone());
            post.path = path;
        }
    }
}

/// Whole-state store guarded by one async RwLock: read units share it, write units own it.
#[derive(Clone)]
pub struct InMemRepo {
    state: Arc<RwLock<State>>,
    snapshot_path: Option<Arc<PathBuf>>,
    acquire_timeout: Duration,
}

impl InMemRepo {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
            snapshot_path: None,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    /// Load `dir/state.json` if present and persist there after every committed write.
    pub fn with_snapshot(dir: impl AsRef<Path>) -> Self {
        let path = dir.as_ref().join(SNAPSHOT_FILE);
        let state = Self::load_state_from(&path);
        Self {
            state: Arc::new(RwLock::new(state)),
            snapshot_path: Some(Arc::new(path)),
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    fn load_state_from(path: &Path) -> State {
        match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<State>(&bytes) {
                Ok(mut s) => {
                    s.rebuild_paths();
                    info!(path = %path.display(), "loaded snapshot");
                    s
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "failed to parse snapshot, starting empty"
                    );
                    State::default()
                }
            },
            Err(e) => {
                info!(path = %path.display(), error = %e, "no snapshot, starting empty");
                State::default()
            }
        }
    }
}

impl Default for InMemRepo {
    fn default() -> Self {
        Self::new()
    }
}

fn persist(path: &Path, state: &State) {
    match serde_json::to_vec_pretty(state) {
        Ok(bytes) => {
            if let Some(dir) = path.parent() {
                if let Err(e) = std::fs::create_dir_all(dir) {
                    warn!(dir = %dir.display(), error = %e, "failed to create snapshot dir");
                }
            }
            if let Err(e) = std::fs::write(path, bytes) {
                error!(path = %path.display(), error = %e, "failed to write snapshot");
            }
        }
        Err(e) => error!(error = %e, "failed to encode snapshot"),
    }
}

#[async_trait]
impl Store for InMemRepo {
    async fn begin(&self, access: Access) -> RepoResult<Box<dyn Unit>> {
        let lock = self.state.clone();
        let guard = match access {
            Access::ReadOnly => {
                let g = tokio::time::timeout(self.acquire_timeout, lock.read_owned())
                    .await
                    .map_err(|_| RepoError::Timeout)?;
                Guard::Read(g)
            }
            Access::ReadWrite => {
                let g = tokio::time::timeout(self.acquire_timeout, lock.write_owned())
                    .await
                    .map_err(|_| RepoError::Timeout)?;
                Guard::Write { guard: g, undo: Vec::new() }
            }
        };
        Ok(Box::new(InMemUnit {
            guard: Some(guard),
            snapshot_path: self.snapshot_path.clone(),
        }))
    }
}

/// Inverse of one in-place write, holding what the touched entry was before it.
enum Undo {
    User(String, Option<User>),
    Forum(String, Option<ForumRow>),
    Thread(Id, Option<Thread>),
    Post(Id, Option<Post>),
    Vote(Id, String, Option<i32>),
    Counters { thread: Id, post: Id },
    Cleared(Box<State>),
}

fn restore<K: Ord, V>(map: &mut BTreeMap<K, V>, key: K, prev: Option<V>) {
    match prev {
        Some(v) => {
            map.insert(key, v);
        }
        None => {
            map.remove(&key);
        }
    }
}

impl Undo {
    fn revert(self, s: &mut State) {
        match self {
            Undo::User(key, prev) => restore(&mut s.users, key, prev),
            Undo::Forum(key, prev) => restore(&mut s.forums, key, prev),
            Undo::Thread(id, prev) => restore(&mut s.threads, id, prev),
            Undo::Post(id, prev) => restore(&mut s.posts, id, prev),
            Undo::Vote(thread, key, prev) => {
                let voters = s.votes.entry(thread).or_default();
                restore(voters, key, prev);
                if voters.is_empty() {
                    s.votes.remove(&thread);
                }
            }
            Undo::Counters { thread, post } => {
                s.last_thread_id = thread;
                s.last_post_id = post;
            }
            Undo::Cleared(prev) => *s = *prev,
        }
    }
}

enum Guard {
    Read(OwnedRwLockReadGuard<State>),
    // Writes land in the guarded state directly; the log replays them backwards on rollback.
    Write { guard: OwnedRwLockWriteGuard<State>, undo: Vec<Undo> },
}

/// Unit of work over [`InMemRepo`]. Dropping an uncommitted write unit reverts its writes
/// before the lock is released.
pub struct InMemUnit {
    guard: Option<Guard>,
    snapshot_path: Option<Arc<PathBuf>>,
}

impl InMemUnit {
    fn state(&self) -> RepoResult<&State> {
        match &self.guard {
            Some(Guard::Read(g)) => Ok(&**g),
            Some(Guard::Write { guard, .. }) => Ok(&**guard),
            None => Err(RepoError::Internal("unit already finished".into())),
        }
    }

    fn state_mut(&mut self) -> RepoResult<(&mut State, &mut Vec<Undo>)> {
        match &mut self.guard {
            Some(Guard::Write { guard, undo }) => Ok((&mut **guard, undo)),
            Some(Guard::Read(_)) => {
                Err(RepoError::Internal("write attempted in a read-only unit".into()))
            }
            None => Err(RepoError::Internal("unit already finished".into())),
        }
    }

    fn revert(&mut self) {
        if let Some(Guard::Write { mut guard, undo }) = self.guard.take() {
            if !undo.is_empty() {
                debug!(steps = undo.len(), "reverting uncommitted writes");
            }
            for step in undo.into_iter().rev() {
                step.revert(&mut guard);
            }
        }
    }
}

impl Drop for InMemUnit {
    fn drop(&mut self) {
        self.revert();
    }
}

#[async_trait]
impl UserRepo for InMemUnit {
    async fn get_user(&mut self, nickname: &str) -> RepoResult<Option<User>> {
        Ok(self.state()?.users.get(&fold(nickname)).cloned())
    }

    async fn find_users(&mut self, nickname: &str, email: &str) -> RepoResult<Vec<User>> {
        let (nick, mail) = (fold(nickname), fold(email));
        let s = self.state()?;
        Ok(s.users
            .iter()
            .filter(|(key, u)| **key == nick || fold(&u.email) == mail)
            .map(|(_, u)| u.clone())
            .collect())
    }

    async fn save_user(&mut self, user: &User) -> RepoResult<()> {
        let (s, undo) = self.state_mut()?;
        let key = fold(&user.nickname);
        let mail = fold(&user.email);
        if s.users.contains_key(&key) || s.users.values().any(|u| fold(&u.email) == mail) {
            return Err(RepoError::Conflict("users".into()));
        }
        let prev = s.users.insert(key.clone(), user.clone());
        undo.push(Undo::User(key, prev));
        Ok(())
    }

    async fn update_user(&mut self, user: &User) -> RepoResult<()> {
        let (s, undo) = self.state_mut()?;
        let key = fold(&user.nickname);
        let mail = fold(&user.email);
        if s.users.iter().any(|(k, u)| *k != key && fold(&u.email) == mail) {
            return Err(RepoError::Conflict("users_email".into()));
        }
        let stored = s
            .users
            .get_mut(&key)
            .ok_or_else(|| RepoError::Internal(format!("user {} vanished", user.nickname)))?;
        undo.push(Undo::User(key, Some(stored.clone())));
        stored.fullname = user.fullname.clone();
        stored.about = user.about.clone();
        stored.email = user.email.clone();
        Ok(())
    }

    async fn forum_users(&mut self, forum: &str, page: &UserPage) -> RepoResult<Vec<User>> {
        let s = self.state()?;
        let mut keys: BTreeSet<String> = s
            .threads
            .values()
            .filter(|t| t.forum == forum)
            .map(|t| fold(&t.author))
            .collect();
        keys.extend(s.posts.values().filter(|p| p.forum == forum).map(|p| fold(&p.author)));

        let since = page.since.as_deref().map(fold);
        let in_window = |key: &String| match &since {
            None => true,
            Some(c) if page.desc => key < c,
            Some(c) => key > c,
        };
        let limit = usize::try_from(page.limit).unwrap_or(usize::MAX);
        let ordered: Box<dyn Iterator<Item = &String>> = if page.desc {
            Box::new(keys.iter().rev())
        } else {
            Box::new(keys.iter())
        };
        Ok(ordered
            .filter(|k| in_window(*k))
            .filter_map(|k| s.users.get(k).cloned())
            .take(limit)
            .collect())
    }
}

#[async_trait]
impl ForumRepo for InMemUnit {
    async fn get_forum(&mut self, slug: &str) -> RepoResult<Option<Forum>> {
        Ok(self.state()?.forum(&fold(slug)))
    }

    async fn save_forum(&mut self, new: &NewForum) -> RepoResult<()> {
        let (s, undo) = self.state_mut()?;
        let key = fold(&new.slug);
        if s.forums.contains_key(&key) {
            return Err(RepoError::Conflict("forums".into()));
        }
        let row = ForumRow {
            slug: new.slug.clone(),
            title: new.title.clone(),
            user: new.user.clone(),
        };
        let prev = s.forums.insert(key.clone(), row);
        undo.push(Undo::Forum(key, prev));
        Ok(())
    }
}

fn slug_taken(s: &State, slug: &str) -> bool {
    let key = fold(slug);
    s.threads.values().any(|t| t.slug.as_deref().map(fold).as_deref() == Some(key.as_str()))
}

#[async_trait]
impl ThreadRepo for InMemUnit {
    async fn get_thread(&mut self, id: Id) -> RepoResult<Option<Thread>> {
        Ok(self.state()?.threads.get(&id).cloned())
    }

    async fn get_thread_by_slug(&mut self, slug: &str) -> RepoResult<Option<Thread>> {
        let key = fold(slug);
        Ok(self
            .state()?
            .threads
            .values()
            .find(|t| t.slug.as_deref().map(fold).as_deref() == Some(key.as_str()))
            .cloned())
    }

    async fn save_thread(&mut self, draft: &ThreadDraft) -> RepoResult<Thread> {
        let (s, undo) = self.state_mut()?;
        if draft.slug.as_deref().is_some_and(|slug| slug_taken(s, slug)) {
            return Err(RepoError::Conflict("threads_slug".into()));
        }
        undo.push(Undo::Counters { thread: s.last_thread_id, post: s.last_post_id });
        s.last_thread_id += 1;
        let thread = Thread {
            id: s.last_thread_id,
            title: draft.title.clone(),
            author: draft.author.clone(),
            forum: draft.forum.clone(),
            message: draft.message.clone(),
            votes: 0,
            slug: draft.slug.clone(),
            created: draft.created,
        };
        let prev = s.threads.insert(thread.id, thread.clone());
        undo.push(Undo::Thread(thread.id, prev));
        Ok(thread)
    }

    async fn update_thread(&mut self, thread: &Thread) -> RepoResult<()> {
        let (s, undo) = self.state_mut()?;
        let stored = s
            .threads
            .get_mut(&thread.id)
            .ok_or_else(|| RepoError::Internal(format!("thread {} vanished", thread.id)))?;
        undo.push(Undo::Thread(thread.id, Some(stored.clone())));
        stored.title = thread.title.clone();
        stored.message = thread.message.clone();
        Ok(())
    }

    async fn forum_threads(&mut self, forum: &str, page: &ThreadPage) -> RepoResult<Vec<Thread>> {
        let s = self.state()?;
        let mut threads: Vec<Thread> = s
            .threads
            .values()
            .filter(|t| t.forum == forum)
            .filter(|t| match page.since {
                None => true,
                Some(since) if page.desc => t.created <= since,
                Some(since) => t.created >= since,
            })
            .cloned()
            .collect();
        threads.sort_by(|a, b| a.created.cmp(&b.created).then(a.id.cmp(&b.id)));
        if page.desc {
            threads.reverse();
        }
        threads.truncate(usize::try_from(page.limit).unwrap_or(usize::MAX));
        Ok(threads)
    }
}

#[async_trait]
impl PostRepo for InMemUnit {
    async fn get_post(&mut self, id: Id) -> RepoResult<Option<Post>> {
        Ok(self.state()?.posts.get(&id).cloned())
    }

    async fn reserve_post_ids(&mut self, n: usize) -> RepoResult<Vec<Id>> {
        let (s, undo) = self.state_mut()?;
        undo.push(Undo::Counters { thread: s.last_thread_id, post: s.last_post_id });
        let first = s.last_post_id + 1;
        s.last_post_id += n as Id;
        Ok((first..=s.last_post_id).collect())
    }

    async fn insert_posts(&mut self, posts: &[Post]) -> RepoResult<()> {
        let (s, undo) = self.state_mut()?;
        for post in posts {
            let prev = s.posts.insert(post.id, post.clone());
            let taken = prev.is_some();
            undo.push(Undo::Post(post.id, prev));
            if taken {
                return Err(RepoError::Conflict(format!("posts_pkey {}", post.id)));
            }
        }
        debug!(count = posts.len(), "inserted posts");
        Ok(())
    }

    async fn update_post_message(&mut self, id: Id, message: &str) -> RepoResult<()> {
        let (s, undo) = self.state_mut()?;
        let post = s
            .posts
            .get_mut(&id)
            .ok_or_else(|| RepoError::Internal(format!("post {id} vanished")))?;
        undo.push(Undo::Post(id, Some(post.clone())));
        post.message = message.to_string();
        post.is_edited = true;
        Ok(())
    }

    async fn thread_posts(&mut self, thread: Id, query: &PostQuery) -> RepoResult<Vec<Post>> {
        let posts: Vec<Post> = self
            .state()?
            .posts
            .values()
            .filter(|p| p.thread == thread)
            .cloned()
            .collect();
        Ok(hierarchy::window(posts, query))
    }
}

#[async_trait]
impl VoteRepo for InMemUnit {
    // A write unit already owns the whole state exclusively.
    async fn lock_thread(&mut self, thread: Id) -> RepoResult<()> {
        let (s, _) = self.state_mut()?;
        if !s.threads.contains_key(&thread) {
            return Err(RepoError::Internal(format!("thread {thread} vanished")));
        }
        Ok(())
    }

    async fn upsert_vote(&mut self, thread: Id, vote: &Vote) -> RepoResult<Option<i32>> {
        let (s, undo) = self.state_mut()?;
        let key = fold(&vote.nickname);
        let prev = s.votes.entry(thread).or_default().insert(key.clone(), vote.voice);
        undo.push(Undo::Vote(thread, key, prev));
        Ok(prev)
    }

    async fn add_votes(&mut self, thread: Id, delta: i64) -> RepoResult<i64> {
        let (s, undo) = self.state_mut()?;
        let t = s
            .threads
            .get_mut(&thread)
            .ok_or_else(|| RepoError::Internal(format!("thread {thread} vanished")))?;
        undo.push(Undo::Thread(thread, Some(t.clone())));
        t.votes += delta;
        Ok(t.votes)
    }
}

#[async_trait]
impl ServiceRepo for InMemUnit {
    async fn status(&mut self) -> RepoResult<Status> {
        let s = self.state()?;
        Ok(Status {
            user: s.users.len() as i64,
            forum: s.forums.len() as i64,
            thread: s.threads.len() as i64,
            post: s.posts.len() as i64,
        })
    }

    async fn clear(&mut self) -> RepoResult<()> {
        let (s, undo) = self.state_mut()?;
        undo.push(Undo::Cleared(Box::new(std::mem::take(s))));
        Ok(())
    }
}

#[async_trait]
impl Transactional for InMemUnit {
    async fn commit(&mut self) -> RepoResult<()> {
        match self.guard.take() {
            Some(Guard::Write { guard, undo }) => {
                match &self.snapshot_path {
                    Some(path) if !undo.is_empty() => persist(path, &guard),
                    _ => {}
                }
                Ok(())
            }
            Some(Guard::Read(_)) => Ok(()),
            None => Err(RepoError::Internal("unit already finished".into())),
        }
    }

    async fn rollback(&mut self) -> RepoResult<()> {
        self.revert();
        self.guard = None;
        Ok(())
    }
}
