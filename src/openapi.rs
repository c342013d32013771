use crate::error::ApiErrorBody;
use crate::hierarchy::SortMode;
use crate::models::{
    Forum, NewForum, NewPost, NewThread, NewUser, Post, PostDetails, Status, Thread, UpdatePost,
    UpdateThread, UpdateUser, User, Vote,
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::create_forum,
        crate::routes::forum_details,
        crate::routes::create_thread,
        crate::routes::forum_users,
        crate::routes::forum_threads,
        crate::routes::create_posts,
        crate::routes::vote,
        crate::routes::thread_details,
        crate::routes::update_thread,
        crate::routes::thread_posts,
        crate::routes::post_details,
        crate::routes::update_post,
        crate::routes::create_user,
        crate::routes::user_profile,
        crate::routes::update_user,
        crate::routes::status,
        crate::routes::clear,
    ),
    components(schemas(
        User, NewUser, UpdateUser, Forum, NewForum, Thread, NewThread, UpdateThread,
        Post, NewPost, UpdatePost, PostDetails, Vote, Status, SortMode, ApiErrorBody
    )),
    tags(
        (name = "forums", description = "Forum operations"),
        (name = "threads", description = "Thread operations and voting"),
        (name = "posts", description = "Post trees and listings"),
        (name = "users", description = "User profiles"),
        (name = "service", description = "Maintenance"),
    )
)]
pub struct ApiDoc;
