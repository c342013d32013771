use std::fmt::Display;

use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use utoipa::IntoParams;

use crate::error::{ApiErrorBody, ForumError};
use crate::hierarchy::{PostQuery, SortMode};
use crate::models::*;
use crate::service::{ForumService, Related};

// Extractor failures answer 400 like any other invalid input.
fn bad_input(err: impl Display) -> actix_web::Error {
    ForumError::bad_request(err.to_string()).into()
}

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .app_data(web::JsonConfig::default().error_handler(|err, _| bad_input(err)))
            .app_data(web::QueryConfig::default().error_handler(|err, _| bad_input(err)))
            .app_data(web::PathConfig::default().error_handler(|err, _| bad_input(err)))
            .service(web::resource("/forum/create").route(web::post().to(create_forum)))
            .service(web::resource("/forum/{slug}/details").route(web::get().to(forum_details)))
            .service(web::resource("/forum/{slug}/create").route(web::post().to(create_thread)))
            .service(web::resource("/forum/{slug}/users").route(web::get().to(forum_users)))
            .service(web::resource("/forum/{slug}/threads").route(web::get().to(forum_threads)))
            .service(
                web::resource("/thread/{slug_or_id}/create").route(web::post().to(create_posts)),
            )
            .service(web::resource("/thread/{slug_or_id}/vote").route(web::post().to(vote)))
            .service(
                web::resource("/thread/{slug_or_id}/details")
                    .route(web::get().to(thread_details))
                    .route(web::post().to(update_thread)),
            )
            .service(web::resource("/thread/{slug_or_id}/posts").route(web::get().to(thread_posts)))
            .service(
                web::resource("/post/{id}/details")
                    .route(web::get().to(post_details))
                    .route(web::post().to(update_post)),
            )
            .service(web::resource("/user/{nickname}/create").route(web::post().to(create_user)))
            .service(
                web::resource("/user/{nickname}/profile")
                    .route(web::get().to(user_profile))
                    .route(web::post().to(update_user)),
            )
            .service(web::resource("/service/status").route(web::get().to(status)))
            .service(web::resource("/service/clear").route(web::post().to(clear))),
    );
}

#[derive(Clone)]
pub struct AppState {
    pub service: ForumService,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct UserListParams {
    /// Positive page size, default 100.
    pub limit: Option<i64>,
    /// Nickname the previous page ended with.
    pub since: Option<String>,
    pub desc: Option<bool>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ThreadListParams {
    pub limit: Option<i64>,
    /// RFC 3339 timestamp, inclusive.
    pub since: Option<DateTime<Utc>>,
    pub desc: Option<bool>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct PostListParams {
    pub limit: Option<i64>,
    /// Id of the last post already seen.
    pub since: Option<Id>,
    /// `flat`, `tree` or `parent_tree`.
    pub sort: Option<String>,
    pub desc: Option<bool>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct RelatedParams {
    /// Comma separated subset of `user,forum,thread`.
    pub related: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/forum/create",
    tag = "forums",
    request_body = NewForum,
    responses(
        (status = 201, description = "Forum created", body = Forum),
        (status = 404, description = "Owner not found", body = ApiErrorBody),
        (status = 409, description = "Forum exists; the existing forum is returned", body = Forum)
    )
)]
pub async fn create_forum(
    data: web::Data<AppState>,
    payload: web::Json<NewForum>,
) -> Result<HttpResponse, ForumError> {
    let forum = data.service.create_forum(payload.into_inner()).await?;
    Ok(HttpResponse::Created().json(forum))
}

#[utoipa::path(
    get,
    path = "/api/forum/{slug}/details",
    tag = "forums",
    params(("slug" = String, Path, description = "Forum slug")),
    responses(
        (status = 200, description = "Forum with post and thread counts", body = Forum),
        (status = 404, description = "Forum not found", body = ApiErrorBody)
    )
)]
pub async fn forum_details(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ForumError> {
    let forum = data.service.get_forum(&path).await?;
    Ok(HttpResponse::Ok().json(forum))
}

#[utoipa::path(
    post,
    path = "/api/forum/{slug}/create",
    tag = "threads",
    params(("slug" = String, Path, description = "Forum slug")),
    request_body = NewThread,
    responses(
        (status = 201, description = "Thread created", body = Thread),
        (status = 404, description = "Author or forum not found", body = ApiErrorBody),
        (status = 409, description = "Slug taken; the existing thread is returned", body = Thread)
    )
)]
pub async fn create_thread(
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<NewThread>,
) -> Result<HttpResponse, ForumError> {
    let thread = data.service.create_thread(&path, payload.into_inner()).await?;
    Ok(HttpResponse::Created().json(thread))
}

#[utoipa::path(
    get,
    path = "/api/forum/{slug}/users",
    tag = "forums",
    params(("slug" = String, Path, description = "Forum slug"), UserListParams),
    responses(
        (status = 200, description = "Users who wrote in the forum", body = [User]),
        (status = 404, description = "Forum not found", body = ApiErrorBody)
    )
)]
pub async fn forum_users(
    data: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<UserListParams>,
) -> Result<HttpResponse, ForumError> {
    let q = query.into_inner();
    let users = data.service.forum_users(&path, q.limit, q.since, q.desc.unwrap_or(false)).await?;
    Ok(HttpResponse::Ok().json(users))
}

#[utoipa::path(
    get,
    path = "/api/forum/{slug}/threads",
    tag = "threads",
    params(("slug" = String, Path, description = "Forum slug"), ThreadListParams),
    responses(
        (status = 200, description = "Threads by creation time", body = [Thread]),
        (status = 404, description = "Forum not found", body = ApiErrorBody)
    )
)]
pub async fn forum_threads(
    data: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<ThreadListParams>,
) -> Result<HttpResponse, ForumError> {
    let q = query.into_inner();
    let desc = q.desc.unwrap_or(false);
    let threads = data.service.forum_threads(&path, q.limit, q.since, desc).await?;
    Ok(HttpResponse::Ok().json(threads))
}

#[utoipa::path(
    post,
    path = "/api/thread/{slug_or_id}/create",
    tag = "posts",
    params(("slug_or_id" = String, Path, description = "Thread slug or numeric id")),
    request_body = [NewPost],
    responses(
        (status = 201, description = "Posts created in submission order", body = [Post]),
        (status = 404, description = "Thread or author not found", body = ApiErrorBody),
        (status = 409, description = "Parent post belongs to another thread", body = ApiErrorBody)
    )
)]
pub async fn create_posts(
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<Vec<NewPost>>,
) -> Result<HttpResponse, ForumError> {
    let posts = data.service.create_posts(&path, payload.into_inner()).await?;
    Ok(HttpResponse::Created().json(posts))
}

#[utoipa::path(
    post,
    path = "/api/thread/{slug_or_id}/vote",
    tag = "threads",
    params(("slug_or_id" = String, Path, description = "Thread slug or numeric id")),
    request_body = Vote,
    responses(
        (status = 200, description = "Thread with updated vote total", body = Thread),
        (status = 404, description = "Thread or user not found", body = ApiErrorBody)
    )
)]
pub async fn vote(
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<Vote>,
) -> Result<HttpResponse, ForumError> {
    let thread = data.service.vote(&path, payload.into_inner()).await?;
    Ok(HttpResponse::Ok().json(thread))
}

#[utoipa::path(
    get,
    path = "/api/thread/{slug_or_id}/details",
    tag = "threads",
    params(("slug_or_id" = String, Path, description = "Thread slug or numeric id")),
    responses(
        (status = 200, description = "Thread", body = Thread),
        (status = 404, description = "Thread not found", body = ApiErrorBody)
    )
)]
pub async fn thread_details(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ForumError> {
    let thread = data.service.get_thread(&path).await?;
    Ok(HttpResponse::Ok().json(thread))
}

#[utoipa::path(
    post,
    path = "/api/thread/{slug_or_id}/details",
    tag = "threads",
    params(("slug_or_id" = String, Path, description = "Thread slug or numeric id")),
    request_body = UpdateThread,
    responses(
        (status = 200, description = "Updated thread", body = Thread),
        (status = 404, description = "Thread not found", body = ApiErrorBody)
    )
)]
pub async fn update_thread(
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<UpdateThread>,
) -> Result<HttpResponse, ForumError> {
    let thread = data.service.update_thread(&path, payload.into_inner()).await?;
    Ok(HttpResponse::Ok().json(thread))
}

#[utoipa::path(
    get,
    path = "/api/thread/{slug_or_id}/posts",
    tag = "posts",
    params(
        ("slug_or_id" = String, Path, description = "Thread slug or numeric id"),
        PostListParams
    ),
    responses(
        (status = 200, description = "One page of the thread's posts", body = [Post]),
        (status = 404, description = "Thread not found", body = ApiErrorBody)
    )
)]
pub async fn thread_posts(
    data: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<PostListParams>,
) -> Result<HttpResponse, ForumError> {
    let q = query.into_inner();
    let sort = match q.sort.as_deref() {
        None | Some("") => SortMode::default(),
        Some(s) => s.parse()?,
    };
    let query = PostQuery::new(sort, q.limit, q.since, q.desc.unwrap_or(false))?;
    let posts = data.service.thread_posts(&path, query).await?;
    Ok(HttpResponse::Ok().json(posts))
}

#[utoipa::path(
    get,
    path = "/api/post/{id}/details",
    tag = "posts",
    params(("id" = Id, Path, description = "Post id"), RelatedParams),
    responses(
        (status = 200, description = "Post with requested related entities", body = PostDetails),
        (status = 404, description = "Post not found", body = ApiErrorBody)
    )
)]
pub async fn post_details(
    data: web::Data<AppState>,
    path: web::Path<Id>,
    query: web::Query<RelatedParams>,
) -> Result<HttpResponse, ForumError> {
    let related = query.related.as_deref().map(Related::parse_list).unwrap_or_default();
    let details = data.service.post_details(path.into_inner(), related).await?;
    Ok(HttpResponse::Ok().json(details))
}

#[utoipa::path(
    post,
    path = "/api/post/{id}/details",
    tag = "posts",
    params(("id" = Id, Path, description = "Post id")),
    request_body = UpdatePost,
    responses(
        (status = 200, description = "Post after the edit", body = Post),
        (status = 404, description = "Post not found", body = ApiErrorBody)
    )
)]
pub async fn update_post(
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: web::Json<UpdatePost>,
) -> Result<HttpResponse, ForumError> {
    let post = data.service.update_post(path.into_inner(), payload.into_inner()).await?;
    Ok(HttpResponse::Ok().json(post))
}

#[utoipa::path(
    post,
    path = "/api/user/{nickname}/create",
    tag = "users",
    params(("nickname" = String, Path, description = "Nickname")),
    request_body = NewUser,
    responses(
        (status = 201, description = "User created", body = User),
        (status = 409, description = "Users holding the nickname or email", body = [User])
    )
)]
pub async fn create_user(
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<NewUser>,
) -> Result<HttpResponse, ForumError> {
    let user = data.service.create_user(&path, payload.into_inner()).await?;
    Ok(HttpResponse::Created().json(user))
}

#[utoipa::path(
    get,
    path = "/api/user/{nickname}/profile",
    tag = "users",
    params(("nickname" = String, Path, description = "Nickname")),
    responses(
        (status = 200, description = "User", body = User),
        (status = 404, description = "User not found", body = ApiErrorBody)
    )
)]
pub async fn user_profile(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ForumError> {
    let user = data.service.get_user(&path).await?;
    Ok(HttpResponse::Ok().json(user))
}

#[utoipa::path(
    post,
    path = "/api/user/{nickname}/profile",
    tag = "users",
    params(("nickname" = String, Path, description = "Nickname")),
    request_body = UpdateUser,
    responses(
        (status = 200, description = "Updated user", body = User),
        (status = 404, description = "User not found", body = ApiErrorBody),
        (status = 409, description = "Email belongs to another user", body = ApiErrorBody)
    )
)]
pub async fn update_user(
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: web::Json<UpdateUser>,
) -> Result<HttpResponse, ForumError> {
    let user = data.service.update_user(&path, payload.into_inner()).await?;
    Ok(HttpResponse::Ok().json(user))
}

#[utoipa::path(
    get,
    path = "/api/service/status",
    tag = "service",
    responses((status = 200, description = "Row counts", body = Status))
)]
pub async fn status(data: web::Data<AppState>) -> Result<HttpResponse, ForumError> {
    Ok(HttpResponse::Ok().json(data.service.status().await?))
}

#[utoipa::path(
    post,
    path = "/api/service/clear",
    tag = "service",
    responses((status = 200, description = "All data removed"))
)]
pub async fn clear(data: web::Data<AppState>) -> Result<HttpResponse, ForumError> {
    data.service.clear().await?;
    Ok(HttpResponse::Ok().finish())
}
