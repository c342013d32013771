#![cfg(feature = "inmem-store")]

use std::sync::Arc;
use std::time::Duration;

use forum::error::{Conflict, ForumError, Lookup};
use forum::hierarchy::{PostQuery, SortMode};
use forum::models::*;
use forum::repo::inmem::InMemRepo;
use forum::repo::UserRepo;
use forum::tx::Coordinator;
use forum::ForumService;

fn service_over(repo: InMemRepo) -> ForumService {
    ForumService::new(Arc::new(repo), Duration::from_secs(5))
}

fn user(nickname: &str) -> (String, NewUser) {
    let new = NewUser {
        fullname: format!("{nickname} full"),
        about: String::new(),
        email: format!("{nickname}@example.org"),
    };
    (nickname.to_string(), new)
}

/// User `j.sparrow`, forum `bugs`, thread `t1`.
async fn seed(svc: &ForumService) -> Thread {
    let (nick, new) = user("j.sparrow");
    svc.create_user(&nick, new).await.unwrap();
    let forum = NewForum { slug: "bugs".into(), title: "Bugs".into(), user: "J.Sparrow".into() };
    svc.create_forum(forum).await.unwrap();
    svc.create_thread("bugs", thread("First", Some("t1"))).await.unwrap()
}

fn thread(title: &str, slug: Option<&str>) -> NewThread {
    NewThread {
        title: title.into(),
        author: "j.sparrow".into(),
        message: "hi".into(),
        slug: slug.map(Into::into),
        created: None,
    }
}

fn post(parent: Id) -> NewPost {
    NewPost { parent, author: "j.sparrow".into(), message: format!("reply to {parent}") }
}

fn ids(posts: &[Post]) -> Vec<Id> {
    posts.iter().map(|p| p.id).collect()
}

#[tokio::test]
async fn failed_unit_leaves_no_trace() {
    let repo = InMemRepo::new();
    let coordinator = Coordinator::new(Arc::new(repo.clone()), Duration::from_secs(5));
    let (nick, new) = user("ghost");
    let record =
        User { nickname: nick, fullname: new.fullname, about: new.about, email: new.email };

    let res: Result<(), ForumError> = coordinator
        .write(move |unit| {
            Box::pin(async move {
                unit.save_user(&record).await?;
                Err(ForumError::bad_request("abort after write"))
            })
        })
        .await;
    assert!(matches!(res, Err(ForumError::BadRequest(_))));

    let svc = service_over(repo);
    let err = svc.get_user("ghost").await.unwrap_err();
    assert!(matches!(err, ForumError::NotFound { what: Lookup::User, .. }));
}

#[tokio::test]
async fn unit_past_its_deadline_is_rolled_back() {
    let repo = InMemRepo::new();
    let coordinator = Coordinator::new(Arc::new(repo.clone()), Duration::from_millis(50));
    let (nick, new) = user("slowpoke");
    let record =
        User { nickname: nick, fullname: new.fullname, about: new.about, email: new.email };

    let res: Result<(), ForumError> = coordinator
        .write(move |unit| {
            Box::pin(async move {
                unit.save_user(&record).await?;
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(())
            })
        })
        .await;
    assert!(matches!(res, Err(ForumError::Internal(_))));

    let status = service_over(repo).status().await.unwrap();
    assert_eq!(status.user, 0);
}

#[tokio::test]
async fn reply_paths_and_tree_order() {
    let svc = service_over(InMemRepo::new());
    seed(&svc).await;

    let tops = svc.create_posts("t1", vec![post(0), post(0)]).await.unwrap();
    let (p1, p2) = (tops[0].id, tops[1].id);
    assert!(p1 < p2);
    assert_eq!(tops[0].created, tops[1].created);

    let replies = svc.create_posts("t1", vec![post(p1)]).await.unwrap();
    let p3 = replies[0].id;
    assert_eq!(replies[0].path.as_slice(), &[p1, p3]);
    assert_eq!(replies[0].forum, "bugs");

    let tree_query = PostQuery::new(SortMode::Tree, None, None, false).unwrap();
    let tree = svc.thread_posts("t1", tree_query).await.unwrap();
    assert_eq!(ids(&tree), vec![p1, p3, p2]);

    let flat = svc.thread_posts("T1", PostQuery::default()).await.unwrap();
    assert_eq!(ids(&flat), vec![p1, p2, p3]);
}

#[tokio::test]
async fn batch_is_all_or_nothing() {
    let svc = service_over(InMemRepo::new());
    seed(&svc).await;

    let mut batch = vec![post(0), post(0)];
    batch[1].author = "nobody".into();
    let err = svc.create_posts("t1", batch).await.unwrap_err();
    match err {
        ForumError::NotFound { what, key } => {
            assert_eq!(what, Lookup::PostAuthor);
            assert_eq!(key, "nobody");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(svc.status().await.unwrap().post, 0);
}

#[tokio::test]
async fn parent_from_another_thread_is_a_conflict() {
    let svc = service_over(InMemRepo::new());
    seed(&svc).await;
    let other = svc.create_thread("bugs", thread("Second", None)).await.unwrap();
    let foreign = svc.create_posts(&other.id.to_string(), vec![post(0)]).await.unwrap();

    let err = svc.create_posts("t1", vec![post(0), post(foreign[0].id)]).await.unwrap_err();
    assert!(matches!(err, ForumError::Conflict(Conflict::ForeignParent { .. })));

    let err = svc.create_posts("t1", vec![post(999)]).await.unwrap_err();
    assert!(matches!(err, ForumError::Conflict(Conflict::ForeignParent { parent: 999 })));
    assert_eq!(svc.status().await.unwrap().post, 1);
}

#[tokio::test]
async fn forum_counts_follow_rows() {
    let svc = service_over(InMemRepo::new());
    seed(&svc).await;
    svc.create_posts("t1", vec![post(0), post(0), post(0)]).await.unwrap();

    let forum = svc.get_forum("BUGS").await.unwrap();
    assert_eq!(forum.slug, "bugs");
    assert_eq!(forum.user, "j.sparrow");
    assert_eq!((forum.threads, forum.posts), (1, 3));
}

#[tokio::test]
async fn lookups_ignore_case_and_keep_stored_casing() {
    let svc = service_over(InMemRepo::new());
    let (nick, new) = user("Captain");
    svc.create_user(&nick, new).await.unwrap();

    assert_eq!(svc.get_user("cAPTAIN").await.unwrap().nickname, "Captain");

    let (_, mut dup) = user("someone-else");
    dup.email = "CAPTAIN@example.org".into();
    let err = svc.create_user("someone-else", dup).await.unwrap_err();
    match err {
        ForumError::Conflict(Conflict::Users(users)) => assert_eq!(users[0].nickname, "Captain"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn profile_update_rejects_taken_email() {
    let svc = service_over(InMemRepo::new());
    for name in ["alice", "bob"] {
        let (nick, new) = user(name);
        svc.create_user(&nick, new).await.unwrap();
    }

    let steal = UpdateUser { email: Some("ALICE@example.org".into()), ..Default::default() };
    let err = svc.update_user("bob", steal).await.unwrap_err();
    match err {
        ForumError::Conflict(Conflict::EmailTaken { nickname }) => assert_eq!(nickname, "alice"),
        other => panic!("unexpected {other:?}"),
    }

    let partial = UpdateUser {
        about: Some("builder".into()),
        fullname: Some(String::new()),
        email: None,
    };
    let bob = svc.update_user("bob", partial).await.unwrap();
    assert_eq!(bob.about, "builder");
    assert_eq!(bob.fullname, "bob full");
}

#[tokio::test]
async fn snapshot_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let first_ids = {
        let svc = service_over(InMemRepo::with_snapshot(dir.path()));
        seed(&svc).await;
        let tops = svc.create_posts("t1", vec![post(0), post(0)]).await.unwrap();
        let reply = svc.create_posts("t1", vec![post(tops[0].id)]).await.unwrap();
        vec![tops[0].id, reply[0].id, tops[1].id]
    };

    let svc = service_over(InMemRepo::with_snapshot(dir.path()));
    let forum = svc.get_forum("bugs").await.unwrap();
    assert_eq!((forum.threads, forum.posts), (1, 3));

    let tree_query = PostQuery::new(SortMode::Tree, None, None, false).unwrap();
    let tree = svc.thread_posts("t1", tree_query).await.unwrap();
    assert_eq!(ids(&tree), first_ids);

    let next = svc.create_posts("t1", vec![post(first_ids[1])]).await.unwrap();
    assert!(next[0].id > *first_ids.iter().max().unwrap());
    assert_eq!(next[0].path.depth(), 3);
}

#[tokio::test]
async fn clear_resets_everything() {
    let svc = service_over(InMemRepo::new());
    seed(&svc).await;
    svc.create_posts("t1", vec![post(0)]).await.unwrap();
    assert_ne!(svc.status().await.unwrap(), Status::default());

    svc.clear().await.unwrap();
    assert_eq!(svc.status().await.unwrap(), Status::default());
}

#[tokio::test]
async fn empty_thread_reference_is_a_bad_request() {
    let svc = service_over(InMemRepo::new());
    seed(&svc).await;

    let err = svc.get_thread("").await.unwrap_err();
    assert!(matches!(err, ForumError::BadRequest(_)), "got {err:?}");

    let err = svc.create_posts("", vec![post(0)]).await.unwrap_err();
    assert!(matches!(err, ForumError::BadRequest(_)), "got {err:?}");

    let err = svc.thread_posts("", PostQuery::default()).await.unwrap_err();
    assert!(matches!(err, ForumError::BadRequest(_)), "got {err:?}");
    assert_eq!(svc.status().await.unwrap().post, 0);
}

#[tokio::test]
async fn zero_since_lists_from_the_start_in_every_mode() {
    let svc = service_over(InMemRepo::new());
    seed(&svc).await;
    let tops = svc.create_posts("t1", vec![post(0), post(0)]).await.unwrap();
    svc.create_posts("t1", vec![post(tops[0].id)]).await.unwrap();

    for sort in [SortMode::Flat, SortMode::Tree, SortMode::ParentTree] {
        for desc in [false, true] {
            let zero = PostQuery::new(sort, None, Some(0), desc).unwrap();
            let none = PostQuery::new(sort, None, None, desc).unwrap();
            let from_zero = svc.thread_posts("t1", zero).await.unwrap();
            let uncursored = svc.thread_posts("t1", none).await.unwrap();
            assert_eq!(from_zero.len(), 3, "{sort:?} desc={desc}");
            assert_eq!(ids(&from_zero), ids(&uncursored), "{sort:?} desc={desc}");
        }
    }
}
