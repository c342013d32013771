#![cfg(feature = "postgres-store")]

use std::sync::Arc;
use std::time::Duration;

use forum::config::DbConfig;
use forum::error::{Conflict, ForumError};
use forum::hierarchy::{PostQuery, SortMode};
use forum::models::*;
use forum::repo::pg::PgRepo;
use forum::ForumService;
use serial_test::serial;

async fn pg_service() -> Option<ForumService> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let cfg = DbConfig {
        url,
        max_connections: 4,
        acquire_timeout: Duration::from_secs(5),
        connect_attempts: 1,
    };
    let repo = PgRepo::connect(&cfg).await.ok()?;
    let svc = ForumService::new(Arc::new(repo), Duration::from_secs(10));
    svc.clear().await.ok()?;
    Some(svc)
}

async fn seed(svc: &ForumService) {
    for nick in ["Pat", "quinn"] {
        let new = NewUser {
            fullname: nick.into(),
            about: String::new(),
            email: format!("{nick}@example.org"),
        };
        svc.create_user(nick, new).await.unwrap();
    }
    let forum = NewForum { slug: "pg".into(), title: "Postgres".into(), user: "pat".into() };
    svc.create_forum(forum).await.unwrap();
    let thread = NewThread {
        title: "t".into(),
        author: "PAT".into(),
        message: "m".into(),
        slug: Some("pg-t".into()),
        created: None,
    };
    svc.create_thread("pg", thread).await.unwrap();
}

fn reply(parent: Id, author: &str) -> NewPost {
    NewPost { parent, author: author.into(), message: "m".into() }
}

fn ids(posts: &[Post]) -> Vec<Id> {
    posts.iter().map(|p| p.id).collect()
}

#[tokio::test]
#[serial]
async fn pg_tree_modes_match_paths() {
    let Some(svc) = pg_service().await else { eprintln!("skip: no DATABASE_URL"); return; };
    seed(&svc).await;

    let batch = vec![reply(0, "pat"), reply(0, "quinn"), reply(0, "pat")];
    let roots = ids(&svc.create_posts("pg-t", batch).await.unwrap());
    let batch = vec![reply(roots[0], "quinn"), reply(roots[1], "pat")];
    let a = ids(&svc.create_posts("pg-t", batch).await.unwrap());
    let b = ids(&svc.create_posts("pg-t", vec![reply(a[0], "pat")]).await.unwrap());

    let q = |sort, limit, since, desc| PostQuery::new(sort, Some(limit), since, desc).unwrap();

    let tree = svc.thread_posts("pg-t", q(SortMode::Tree, 100, None, false)).await.unwrap();
    assert_eq!(ids(&tree), vec![roots[0], a[0], b[0], roots[1], a[1], roots[2]]);

    let page = svc.thread_posts("pg-t", q(SortMode::Tree, 2, Some(b[0]), true)).await.unwrap();
    assert_eq!(ids(&page), vec![a[0], roots[0]]);

    let parents = svc.thread_posts("pg-t", q(SortMode::ParentTree, 2, None, true)).await.unwrap();
    assert_eq!(ids(&parents), vec![roots[2], roots[1], a[1]]);

    let parents =
        svc.thread_posts("pg-t", q(SortMode::ParentTree, 1, Some(b[0]), false)).await.unwrap();
    assert_eq!(ids(&parents), vec![roots[1], a[1]]);

    let unknown =
        svc.thread_posts("pg-t", q(SortMode::Tree, 10, Some(1_000_000), false)).await.unwrap();
    assert!(unknown.is_empty());

    let forum = svc.get_forum("PG").await.unwrap();
    assert_eq!((forum.threads, forum.posts), (1, 6));

    let users = svc.forum_users("pg", None, None, true).await.unwrap();
    let nicks: Vec<&str> = users.iter().map(|u| u.nickname.as_str()).collect();
    assert_eq!(nicks, vec!["quinn", "Pat"]);
}

#[tokio::test]
#[serial]
async fn pg_failed_batch_writes_nothing() {
    let Some(svc) = pg_service().await else { eprintln!("skip: no DATABASE_URL"); return; };
    seed(&svc).await;

    let batch = vec![reply(0, "pat"), reply(424242, "pat")];
    let err = svc.create_posts("pg-t", batch).await.unwrap_err();
    assert!(matches!(err, ForumError::Conflict(Conflict::ForeignParent { parent: 424242 })));
    assert_eq!(svc.status().await.unwrap().post, 0);
}

#[tokio::test]
#[serial]
async fn pg_one_batch_stores_nested_replies() {
    let Some(svc) = pg_service().await else { eprintln!("skip: no DATABASE_URL"); return; };
    seed(&svc).await;

    let mut batch = vec![reply(0, "pat")];
    for _ in 0..40 {
        batch.push(reply(0, "quinn"));
    }
    let created = svc.create_posts("pg-t", batch).await.unwrap();
    assert_eq!(created.len(), 41);
    let first = created[0].id;
    let nested = vec![reply(first, "quinn"), reply(first, "pat"), reply(created[1].id, "pat")];
    let replies = svc.create_posts("pg-t", nested).await.unwrap();
    assert_eq!(replies[0].path.as_slice(), &[first, replies[0].id]);

    let stored = svc.post_details(replies[2].id, Vec::new()).await.unwrap().post;
    assert_eq!(stored.author, "Pat");
    assert_eq!(stored.path.as_slice(), &[created[1].id, replies[2].id]);
    assert_eq!(stored.created, replies[2].created);

    let query = PostQuery::new(SortMode::Tree, Some(4), None, false).unwrap();
    let tree = ids(&svc.thread_posts("pg-t", query).await.unwrap());
    assert_eq!(tree, vec![first, replies[0].id, replies[1].id, created[1].id]);
    assert_eq!(svc.status().await.unwrap().post, 44);
}

#[tokio::test]
#[serial]
async fn pg_votes_follow_latest_voice() {
    let Some(svc) = pg_service().await else { eprintln!("skip: no DATABASE_URL"); return; };
    seed(&svc).await;

    svc.vote("pg-t", Vote { nickname: "pat".into(), voice: 1 }).await.unwrap();
    svc.vote("pg-t", Vote { nickname: "quinn".into(), voice: 1 }).await.unwrap();
    let t = svc.vote("PG-T", Vote { nickname: "Pat".into(), voice: -1 }).await.unwrap();
    assert_eq!(t.votes, 0);
    assert_eq!(svc.get_thread("pg-t").await.unwrap().votes, 0);
}
