use super::cookie::REFRESH_COOKIE;
use super::error::*;
use super::filters::*;
use super::handler;
use crate::server::*;
use std::sync::Arc;
use warp::filters::BoxedFilter;
use warp::reply::Response;
use warp::{Filter, Reply};

/// Every route, with error recovery and CORS applied.
pub fn app(server: Arc<Server>) -> BoxedFilter<(Response,)> {
    let cors = warp::cors()
        .allow_origin(server.policy.cors_origin.as_str())
        .allow_methods(vec!["GET", "POST", "PATCH", "DELETE", "OPTIONS"])
        .allow_headers(vec!["content-type", "authorization"])
        .allow_credentials(true)
        .build();

    routes(server)
        .recover(recover_error)
        .with(cors)
        .map(Reply::into_response)
        .boxed()
}

pub fn routes(server: Arc<Server>) -> BoxedFilter<(Response,)> {
    auth_routes(server.clone())
        .or(stream_routes(server.clone()))
        .unify()
        .or(channel_routes(server.clone()))
        .unify()
        .or(user_routes(server.clone()))
        .unify()
        .or(probe_routes(server))
        .unify()
        .boxed()
}

fn auth_routes(server: Arc<Server>) -> BoxedFilter<(Response,)> {
    let limiter = server.rate_limiter.clone();

    let register = warp::post()
        .and(warp::path!("auth" / "register"))
        .and(rate_limited(limiter.clone()))
        .and(with(server.clone()))
        .and(limited_body(MAX_BODY_BYTES))
        .and_then(handler::register);

    let login = warp::post()
        .and(warp::path!("auth" / "login"))
        .and(rate_limited(limiter.clone()))
        .and(with(server.clone()))
        .and(limited_body(MAX_BODY_BYTES))
        .and_then(handler::login);

    let refresh = warp::post()
        .and(warp::path!("auth" / "refresh"))
        .and(rate_limited(limiter))
        .and(with(server.clone()))
        .and(warp::cookie::optional::<String>(REFRESH_COOKIE))
        .and_then(handler::refresh);

    let logout = warp::post()
        .and(warp::path!("auth" / "logout"))
        .and(with(server.clone()))
        .and(warp::cookie::optional::<String>(REFRESH_COOKIE))
        .and_then(handler::logout);

    let me = warp::get()
        .and(warp::path!("auth" / "me"))
        .and(with(server.clone()))
        .and(require_identity(server))
        .and_then(handler::me);

    register
        .or(login)
        .unify()
        .or(refresh)
        .unify()
        .or(logout)
        .unify()
        .or(me)
        .unify()
        .boxed()
}

fn stream_routes(server: Arc<Server>) -> BoxedFilter<(Response,)> {
    let publish = warp::post()
        .and(warp::path!("publish"))
        .and(with(server.clone()))
        .and(warp::query::<handler::SubjectQuery>())
        .and(with_identity(server.clone()))
        .and(limited_body(MAX_BODY_BYTES))
        .and_then(handler::publish);

    let events = warp::get()
        .and(warp::path!("events"))
        .and(with(server.clone()))
        .and(warp::query::<handler::SubjectQuery>())
        .and(with_identity(server.clone()))
        .and_then(handler::events);

    let ws = warp::get()
        .and(warp::path!("ws"))
        .and(warp::ws())
        .and(warp::query::<handler::StreamQuery>())
        .and(with_ws_identity(server.clone()))
        .and(with(server))
        .and_then(handler::websocket);

    publish.or(events).unify().or(ws).unify().boxed()
}

fn channel_routes(server: Arc<Server>) -> BoxedFilter<(Response,)> {
    let list = warp::get()
        .and(warp::path!("channels"))
        .and(with(server.clone()))
        .and(with_identity(server.clone()))
        .and_then(handler::list_channels);

    let create = warp::post()
        .and(warp::path!("channels"))
        .and(with(server.clone()))
        .and(require_identity(server.clone()))
        .and(limited_body(MAX_BODY_BYTES))
        .and_then(handler::create_channel);

    let post_message = warp::post()
        .and(warp::path!("channels" / String / "messages"))
        .and(with(server.clone()))
        .and(require_identity(server.clone()))
        .and(warp::header::optional::<String>("content-type"))
        .and(limited_body(MAX_BODY_BYTES))
        .and_then(handler::post_message);

    let list_messages = warp::get()
        .and(warp::path!("channels" / String / "messages"))
        .and(with(server.clone()))
        .and(with_identity(server))
        .and(warp::query::<handler::HistoryQuery>())
        .and_then(handler::list_messages);

    list.or(create)
        .unify()
        .or(post_message)
        .unify()
        .or(list_messages)
        .unify()
        .boxed()
}

fn user_routes(server: Arc<Server>) -> BoxedFilter<(Response,)> {
    let list = warp::get()
        .and(warp::path!("users"))
        .and(with(server.clone()))
        .and(with_identity(server.clone()))
        .and_then(handler::list_users);

    let get = warp::get()
        .and(warp::path!("users" / String))
        .and(with(server.clone()))
        .and(with_identity(server.clone()))
        .and_then(handler::get_user);

    let create = warp::post()
        .and(warp::path!("users"))
        .and(with(server.clone()))
        .and(with_identity(server.clone()))
        .and(limited_body(MAX_BODY_BYTES))
        .and_then(handler::post_user);

    let patch = warp::patch()
        .and(warp::path!("users" / String))
        .and(with(server.clone()))
        .and(with_identity(server.clone()))
        .and(limited_body(MAX_BODY_BYTES))
        .and_then(handler::patch_user);

    let delete = warp::delete()
        .and(warp::path!("users" / String))
        .and(with(server.clone()))
        .and(with_identity(server))
        .and_then(handler::delete_user);

    list.or(get)
        .unify()
        .or(create)
        .unify()
        .or(patch)
        .unify()
        .or(delete)
        .unify()
        .boxed()
}

fn probe_routes(server: Arc<Server>) -> BoxedFilter<(Response,)> {
    let healthz = warp::get()
        .and(warp::path!("healthz"))
        .and_then(handler::healthz);

    let ping = warp::get()
        .and(warp::path!("ping-nats"))
        .and(with(server.clone()))
        .and_then(handler::ping_bus);

    let metrics = warp::get()
        .and(warp::path!("metrics"))
        .and(with(server))
        .and_then(handler::render_metrics);

    healthz.or(ping).unify().or(metrics).unify().boxed()
}
