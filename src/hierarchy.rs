//! Post identity and ordering for threads.
//!
//! Every post carries a materialized path: its ancestor chain from the top-level post down to
//! itself. Lexicographic order over paths is a depth-first preorder of the thread, so the three
//! listing modes reduce to sorting and windowing by either the id or the path.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::ForumError;
use crate::models::{Id, NewPost, Post, Thread};

pub const DEFAULT_LIMIT: i64 = 100;

/// Ancestor ids of a post, ending in the post's own id.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PostPath(Vec<Id>);

impl PostPath {
    pub fn top_level(id: Id) -> Self {
        PostPath(vec![id])
    }

    pub fn child(&self, id: Id) -> Self {
        let mut ids = Vec::with_capacity(self.0.len() + 1);
        ids.extend_from_slice(&self.0);
        ids.push(id);
        PostPath(ids)
    }

    /// Id of the top-level post this path descends from.
    pub fn root(&self) -> Option<Id> {
        self.0.first().copied()
    }

    /// Strict prefix test.
    pub fn is_ancestor_of(&self, other: &PostPath) -> bool {
        self.0.len() < other.0.len() && other.0.starts_with(&self.0)
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[Id] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<Id> {
        self.0
    }
}

impl From<Vec<Id>> for PostPath {
    fn from(ids: Vec<Id>) -> Self {
        PostPath(ids)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SortMode {
    #[default]
    Flat,
    Tree,
    ParentTree,
}

impl FromStr for SortMode {
    type Err = ForumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flat" => Ok(SortMode::Flat),
            "tree" => Ok(SortMode::Tree),
            "parent_tree" => Ok(SortMode::ParentTree),
            other => Err(ForumError::bad_request(format!("unknown sort mode {other:?}"))),
        }
    }
}

/// A validated listing request for one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostQuery {
    pub sort: SortMode,
    /// Records in flat/tree mode, top-level conversations in parent_tree mode.
    pub limit: i64,
    /// Exclusive cursor: id of a post the caller has already seen. Never `Some(0)`.
    pub since: Option<Id>,
    pub desc: bool,
}

impl PostQuery {
    /// `since = 0` names no post and reads as "no cursor" in every mode.
    pub fn new(
        sort: SortMode,
        limit: Option<i64>,
        since: Option<Id>,
        desc: bool,
    ) -> Result<Self, ForumError> {
        let limit = validate_limit(limit)?;
        let since = since.filter(|&id| id != 0);
        Ok(Self { sort, limit, since, desc })
    }

    fn take(&self) -> usize {
        usize::try_from(self.limit).unwrap_or(usize::MAX)
    }
}

impl Default for PostQuery {
    fn default() -> Self {
        Self { sort: SortMode::Flat, limit: DEFAULT_LIMIT, since: None, desc: false }
    }
}

/// `limit` must be a positive integer; absent means [`DEFAULT_LIMIT`].
pub fn validate_limit(limit: Option<i64>) -> Result<i64, ForumError> {
    match limit {
        None => Ok(DEFAULT_LIMIT),
        Some(n) if n > 0 => Ok(n),
        Some(n) => Err(ForumError::bad_request(format!("limit must be positive, got {n}"))),
    }
}

/// Build the rows of a batch insert.
///
/// `ids` are freshly reserved, strictly increasing, one per submitted post, and are handed out in
/// submission order. `parents` holds the path of every already-validated parent referenced by the
/// batch. A post may also reply to an earlier member of the same batch.
pub fn assign(
    thread: &Thread,
    created: DateTime<Utc>,
    batch: Vec<NewPost>,
    ids: &[Id],
    parents: &HashMap<Id, PostPath>,
) -> Result<Vec<Post>, ForumError> {
    if ids.len() != batch.len() {
        return Err(ForumError::Internal(format!(
            "reserved {} post ids for a batch of {}",
            ids.len(),
            batch.len()
        )));
    }
    let mut local: HashMap<Id, PostPath> = HashMap::with_capacity(batch.len());
    let mut out = Vec::with_capacity(batch.len());
    for (new, &id) in batch.into_iter().zip(ids) {
        let path = if new.parent == 0 {
            PostPath::top_level(id)
        } else {
            let parent = parents
                .get(&new.parent)
                .or_else(|| local.get(&new.parent))
                .ok_or_else(|| {
                    ForumError::Internal(format!("parent {} was not resolved", new.parent))
                })?;
            parent.child(id)
        };
        local.insert(id, path.clone());
        out.push(Post {
            id,
            parent: new.parent,
            author: new.author,
            message: new.message,
            is_edited: false,
            forum: thread.forum.clone(),
            thread: thread.id,
            created,
            path,
        });
    }
    Ok(out)
}

/// Order and window every post of one thread according to `query`.
///
/// A tree/parent_tree cursor that does not name a post of this thread yields an empty page.
pub fn window(mut posts: Vec<Post>, query: &PostQuery) -> Vec<Post> {
    match query.sort {
        SortMode::Flat => {
            posts.sort_by_key(|p| p.id);
            if query.desc {
                posts.reverse();
            }
            posts
                .into_iter()
                .filter(|p| match query.since {
                    None => true,
                    Some(since) if query.desc => p.id < since,
                    Some(since) => p.id > since,
                })
                .take(query.take())
                .collect()
        }
        SortMode::Tree => {
            let cursor = match cursor_path(&posts, query.since) {
                Ok(c) => c,
                Err(()) => return Vec::new(),
            };
            posts.sort_by(|a, b| a.path.cmp(&b.path));
            if query.desc {
                posts.reverse();
            }
            posts
                .into_iter()
                .filter(|p| match &cursor {
                    None => true,
                    Some(c) if query.desc => p.path < *c,
                    Some(c) => p.path > *c,
                })
                .take(query.take())
                .collect()
        }
        SortMode::ParentTree => {
            let cursor_root = match cursor_path(&posts, query.since) {
                Ok(c) => c.and_then(|path| path.root()),
                Err(()) => return Vec::new(),
            };
            let mut roots: Vec<Id> = posts.iter().filter(|p| p.parent == 0).map(|p| p.id).collect();
            roots.sort_unstable();
            if query.desc {
                roots.reverse();
            }
            let roots: Vec<Id> = roots
                .into_iter()
                .filter(|&root| match cursor_root {
                    None => true,
                    Some(c) if query.desc => root < c,
                    Some(c) => root > c,
                })
                .take(query.take())
                .collect();

            let rank: HashMap<Id, usize> = roots.iter().enumerate().map(|(i, &r)| (r, i)).collect();
            let mut selected: Vec<Post> = posts
                .into_iter()
                .filter(|p| p.path.root().is_some_and(|r| rank.contains_key(&r)))
                .collect();
            // Roots in page order, each subtree always in ascending path order.
            selected.sort_by(|a, b| {
                let ra = a.path.root().and_then(|r| rank.get(&r)).copied().unwrap_or(usize::MAX);
                let rb = b.path.root().and_then(|r| rank.get(&r)).copied().unwrap_or(usize::MAX);
                ra.cmp(&rb).then_with(|| a.path.cmp(&b.path))
            });
            selected
        }
    }
}

fn cursor_path(posts: &[Post], since: Option<Id>) -> Result<Option<PostPath>, ()> {
    match since {
        None => Ok(None),
        Some(id) => posts.iter().find(|p| p.id == id).map(|p| Some(p.path.clone())).ok_or(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread() -> Thread {
        Thread {
            id: 1,
            title: "t".into(),
            author: "a".into(),
            forum: "bugs".into(),
            message: "m".into(),
            votes: 0,
            slug: None,
            created: Utc::now(),
        }
    }

    fn reply(parent: Id) -> NewPost {
        NewPost { parent, author: "a".into(), message: format!("re {parent}") }
    }

    //  1 ── 4 ── 6
    //   └── 5
    //  2 ── 7
    //  3
    fn fixture() -> Vec<Post> {
        let t = thread();
        let now = Utc::now();
        let mut parents = HashMap::new();
        let roots = vec![reply(0), reply(0), reply(0)];
        let mut all = assign(&t, now, roots, &[1, 2, 3], &parents).unwrap();
        for p in &all {
            parents.insert(p.id, p.path.clone());
        }
        let replies = vec![reply(1), reply(1), reply(4), reply(2)];
        all.extend(assign(&t, now, replies, &[4, 5, 6, 7], &parents).unwrap());
        all
    }

    fn ids(posts: &[Post]) -> Vec<Id> {
        posts.iter().map(|p| p.id).collect()
    }

    fn query(sort: SortMode, limit: i64, since: Option<Id>, desc: bool) -> PostQuery {
        PostQuery::new(sort, Some(limit), since, desc).unwrap()
    }

    #[test]
    fn child_paths_extend_parent_paths() {
        let posts = fixture();
        let by_id: HashMap<Id, &Post> = posts.iter().map(|p| (p.id, p)).collect();
        for p in &posts {
            assert_eq!(p.path.as_slice().last(), Some(&p.id));
            if let Some(parent) = p.parent_id() {
                assert!(by_id[&parent].path.is_ancestor_of(&p.path));
            } else {
                assert_eq!(p.path.depth(), 1);
            }
        }
        assert_eq!(by_id[&6].path.as_slice(), &[1, 4, 6]);
    }

    #[test]
    fn batch_may_reply_to_its_own_members() {
        let batch = vec![reply(0), reply(10)];
        let posts = assign(&thread(), Utc::now(), batch, &[10, 11], &HashMap::new()).unwrap();
        assert_eq!(posts[1].path.as_slice(), &[10, 11]);
        assert!(posts.iter().all(|p| p.created == posts[0].created));
    }

    #[test]
    fn unresolved_parent_is_not_dropped() {
        let err =
            assign(&thread(), Utc::now(), vec![reply(99)], &[1], &HashMap::new()).unwrap_err();
        assert!(matches!(err, ForumError::Internal(_)));
    }

    #[test]
    fn flat_pages_have_no_gaps_or_overlap() {
        let mut seen = Vec::new();
        let mut since = None;
        loop {
            let page = window(fixture(), &query(SortMode::Flat, 3, since, false));
            if page.is_empty() {
                break;
            }
            since = page.last().map(|p| p.id);
            seen.extend(ids(&page));
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5, 6, 7]);

        let page = window(fixture(), &query(SortMode::Flat, 10, Some(4), true));
        assert_eq!(ids(&page), vec![3, 2, 1]);
    }

    #[test]
    fn tree_is_preorder() {
        let page = window(fixture(), &query(SortMode::Tree, 100, None, false));
        assert_eq!(ids(&page), vec![1, 4, 6, 5, 2, 7, 3]);

        let page = window(fixture(), &query(SortMode::Tree, 100, None, true));
        assert_eq!(ids(&page), vec![3, 7, 2, 5, 6, 4, 1]);

        let page = window(fixture(), &query(SortMode::Tree, 3, Some(6), false));
        assert_eq!(ids(&page), vec![5, 2, 7]);

        let page = window(fixture(), &query(SortMode::Tree, 2, Some(2), true));
        assert_eq!(ids(&page), vec![5, 6]);
    }

    #[test]
    fn tree_ancestors_come_first() {
        let page = window(fixture(), &query(SortMode::Tree, 100, None, false));
        for (i, a) in page.iter().enumerate() {
            for b in &page[i + 1..] {
                let (child, ancestor) = (a.id, b.id);
                assert!(
                    !b.path.is_ancestor_of(&a.path),
                    "{child} listed before its ancestor {ancestor}"
                );
            }
        }
    }

    #[test]
    fn parent_tree_limits_roots_not_posts() {
        let page = window(fixture(), &query(SortMode::ParentTree, 2, None, false));
        assert_eq!(ids(&page), vec![1, 4, 6, 5, 2, 7]);

        let page = window(fixture(), &query(SortMode::ParentTree, 2, None, true));
        assert_eq!(ids(&page), vec![3, 2, 7]);

        let page = window(fixture(), &query(SortMode::ParentTree, 1, Some(6), false));
        assert_eq!(ids(&page), vec![2, 7]);

        let page = window(fixture(), &query(SortMode::ParentTree, 5, Some(2), true));
        assert_eq!(ids(&page), vec![1, 4, 6, 5]);
    }

    #[test]
    fn unknown_cursor_yields_empty_hierarchical_page() {
        assert!(window(fixture(), &query(SortMode::Tree, 10, Some(42), false)).is_empty());
        assert!(window(fixture(), &query(SortMode::ParentTree, 10, Some(42), false)).is_empty());
        assert_eq!(window(fixture(), &query(SortMode::Flat, 10, Some(42), true)).len(), 7);
    }

    #[test]
    fn zero_cursor_means_from_the_start() {
        for sort in [SortMode::Flat, SortMode::Tree, SortMode::ParentTree] {
            for desc in [false, true] {
                let zero = query(sort, 100, Some(0), desc);
                assert_eq!(zero.since, None);
                let from_zero = window(fixture(), &zero);
                let uncursored = window(fixture(), &query(sort, 100, None, desc));
                assert_eq!(from_zero.len(), 7, "{sort:?} desc={desc}");
                assert_eq!(ids(&from_zero), ids(&uncursored), "{sort:?} desc={desc}");
            }
        }
    }

    #[test]
    fn limit_and_sort_are_validated() {
        assert_eq!(validate_limit(None).unwrap(), DEFAULT_LIMIT);
        assert!(validate_limit(Some(0)).is_err());
        assert!(validate_limit(Some(-5)).is_err());
        assert_eq!("parent_tree".parse::<SortMode>().unwrap(), SortMode::ParentTree);
        assert!("random".parse::<SortMode>().is_err());
    }
}
