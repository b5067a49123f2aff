use super::cookie::*;
use super::error::*;
use crate::application_port::*;
use crate::domain_model::*;
use crate::domain_port::*;
use crate::metrics;
use crate::server::Server;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use warp::http::{StatusCode, header};
use warp::reply::Response;
use warp::{Rejection, Reply};

const DEFAULT_PUBLISH_BODY: &[u8] = br#"{"msg":"hello from gateway"}"#;
const DEFAULT_HISTORY_LIMIT: i64 = 50;
const MAX_HISTORY_LIMIT: i64 = 200;

fn store(server: &Server) -> Result<&Arc<dyn Store>, ApiErrorCode> {
    server.store.as_ref().ok_or(NO_STORE)
}

fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiErrorCode> {
    serde_json::from_slice(body).map_err(|_| ApiErrorCode::bad_request("invalid payload"))
}

fn json_reply<T: Serialize>(value: &T, status: StatusCode) -> Response {
    warp::reply::with_status(warp::reply::json(value), status).into_response()
}

fn text_reply(text: &'static str, status: StatusCode) -> Response {
    warp::reply::with_status(text, status).into_response()
}

#[derive(Debug, Serialize)]
struct StatusBody {
    status: &'static str,
}

// region auth

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub display_name: String,
}

async fn create_user(server: &Server, body: &[u8]) -> Result<Response, ApiErrorCode> {
    let store = store(server)?;
    let request: CreateUserRequest = parse_json(body)?;
    let user_id = request.user_id.trim();
    let password = request.password.trim();
    if user_id.is_empty() || password.is_empty() {
        return Err(ApiErrorCode::bad_request("user_id and password required"));
    }

    let user = store
        .create_user(&UserId::from(user_id), password, &request.display_name)
        .await
        .map_err(|e| match e {
            StoreError::Conflict => ApiErrorCode::Conflict("user already exists"),
            e => ApiErrorCode::from(e),
        })?;
    info!(user_id = %user.id, "user created");
    Ok(json_reply(&user, StatusCode::CREATED))
}

pub async fn register(server: Arc<Server>, body: Bytes) -> Result<Response, Rejection> {
    Ok(create_user(&server, &body).await?)
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub password: String,
}

pub async fn login(server: Arc<Server>, body: Bytes) -> Result<Response, Rejection> {
    let store = store(&server)?;
    let request: LoginRequest = parse_json(&body)?;

    let user = store
        .verify_user_password(
            &UserId::from(request.user_id.trim()),
            request.password.trim(),
        )
        .await
        .map_err(|e| match e {
            StoreError::Backend(e) => ApiErrorCode::internal(e),
            _ => ApiErrorCode::Unauthorized,
        })?;

    let session = server
        .sessions
        .issue(&user.id)
        .await
        .map_err(ApiErrorCode::from)?;

    let mut response = json_reply(&user, StatusCode::OK);
    append_cookies(&mut response, &session_cookies(&session, &server.policy))?;
    Ok(response)
}

pub async fn refresh(
    server: Arc<Server>,
    refresh_token: Option<String>,
) -> Result<Response, Rejection> {
    store(&server)?;
    let refresh_token = refresh_token
        .filter(|t| !t.is_empty())
        .ok_or(ApiErrorCode::Unauthorized)?;

    let session = server
        .sessions
        .rotate_refresh(&refresh_token)
        .await
        .map_err(ApiErrorCode::from)?;

    let mut response = json_reply(&StatusBody { status: "refreshed" }, StatusCode::OK);
    append_cookies(&mut response, &session_cookies(&session, &server.policy))?;
    Ok(response)
}

pub async fn logout(
    server: Arc<Server>,
    refresh_token: Option<String>,
) -> Result<Response, Rejection> {
    if let Some(token) = refresh_token.filter(|t| !t.is_empty()) {
        server.sessions.revoke(&token).await;
    }
    let mut response = json_reply(&StatusBody { status: "logged out" }, StatusCode::OK);
    append_cookies(&mut response, &cleared_cookies(&server.policy))?;
    Ok(response)
}

pub async fn me(server: Arc<Server>, user_id: UserId) -> Result<Response, Rejection> {
    let store = store(&server)?;
    let user = store.get_user(&user_id).await.map_err(|e| match e {
        StoreError::NotFound => ApiErrorCode::NotFound("user not found"),
        e => ApiErrorCode::from(e),
    })?;
    Ok(json_reply(&user, StatusCode::OK))
}

// endregion

// region streaming

#[derive(Debug, Deserialize)]
pub struct SubjectQuery {
    pub subject: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub subject: Option<String>,
    pub channel_id: Option<String>,
}

pub async fn publish(
    server: Arc<Server>,
    query: SubjectQuery,
    _user_id: Option<UserId>,
    body: Bytes,
) -> Result<Response, Rejection> {
    let subject = StreamTarget::subject_only(query.subject.as_deref()).map_err(ApiErrorCode::from)?;
    let body = if body.is_empty() {
        Bytes::from_static(DEFAULT_PUBLISH_BODY)
    } else {
        body
    };

    if let Err(e) = server.bus.publish(&subject, body.clone()).await {
        metrics::record_publish_failure();
        return Err(ApiErrorCode::from(e).into());
    }
    metrics::record_message("inbound");

    if server.store.is_some() {
        server.tasks.submit(PersistTask::SaveSubjectMessage {
            subject,
            payload: body,
        });
    }
    Ok(text_reply("published", StatusCode::ACCEPTED))
}

pub async fn events(
    server: Arc<Server>,
    query: SubjectQuery,
    _user_id: Option<UserId>,
) -> Result<Response, Rejection> {
    let subject = StreamTarget::subject_only(query.subject.as_deref()).map_err(ApiErrorCode::from)?;
    let stream = server
        .bridge
        .sse_stream(subject)
        .await
        .map_err(ApiErrorCode::from)?;

    let mut response = Response::new(warp::hyper::Body::wrap_stream(stream));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-cache"),
    );
    headers.insert(
        header::CONNECTION,
        header::HeaderValue::from_static("keep-alive"),
    );
    headers.insert(
        "x-accel-buffering",
        header::HeaderValue::from_static("no"),
    );
    Ok(response)
}

pub async fn websocket(
    ws: warp::ws::Ws,
    query: StreamQuery,
    user_id: Option<UserId>,
    server: Arc<Server>,
) -> Result<Response, Rejection> {
    let target = StreamTarget::resolve(query.subject.as_deref(), query.channel_id.as_deref())
        .map_err(ApiErrorCode::from)?;
    let bridge = server.bridge.clone();

    Ok(ws
        .max_message_size(super::filters::MAX_BODY_BYTES)
        .on_upgrade(move |socket| async move {
            use futures_util::StreamExt;
            let (sender, receiver) = socket.split();
            bridge
                .serve_ws(Box::new(sender), Box::new(receiver), user_id, target)
                .await;
        })
        .into_response())
}

// endregion

// region channels

#[derive(Debug, Deserialize)]
pub struct CreateChannelRequest {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct MessagePayload {
    #[serde(default)]
    pub payload: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<String>,
}

fn parse_channel_id(raw: &str) -> Result<ChannelId, ApiErrorCode> {
    raw.parse()
        .map_err(|_| ApiErrorCode::bad_request("invalid channel id"))
}

/// Raw body, or the `payload` field when the body is declared as JSON.
fn message_payload(content_type: Option<&str>, body: Bytes) -> Result<Bytes, ApiErrorCode> {
    if body.is_empty() {
        return Err(ApiErrorCode::bad_request("empty payload"));
    }
    if !content_type.is_some_and(|ct| ct.starts_with("application/json")) {
        return Ok(body);
    }
    let message: MessagePayload = serde_json::from_slice(&body)
        .map_err(|_| ApiErrorCode::bad_request("invalid json payload"))?;
    if message.payload.trim().is_empty() {
        return Err(ApiErrorCode::bad_request("empty payload"));
    }
    Ok(Bytes::from(message.payload))
}

fn history_limit(raw: Option<&str>) -> usize {
    raw.and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT) as usize
}

pub async fn list_channels(
    server: Arc<Server>,
    _user_id: Option<UserId>,
) -> Result<Response, Rejection> {
    let store = store(&server)?;
    let channels = store.list_channels().await.map_err(ApiErrorCode::from)?;
    Ok(json_reply(&channels, StatusCode::OK))
}

pub async fn create_channel(
    server: Arc<Server>,
    user_id: UserId,
    body: Bytes,
) -> Result<Response, Rejection> {
    let store = store(&server)?;
    let request: CreateChannelRequest = parse_json(&body)?;
    let name = request.name.trim();
    if name.is_empty() {
        return Err(ApiErrorCode::bad_request("invalid payload").into());
    }

    store.ensure_user(&user_id).await.map_err(ApiErrorCode::from)?;
    let channel = store
        .create_channel(name, &user_id)
        .await
        .map_err(|e| match e {
            StoreError::Conflict => ApiErrorCode::Conflict("channel already exists"),
            e => ApiErrorCode::from(e),
        })?;
    if let Err(e) = store.ensure_member(channel.id, &user_id).await {
        warn!(channel_id = %channel.id, %user_id, "ensure member failed: {}", e);
    }
    Ok(json_reply(&channel, StatusCode::CREATED))
}

pub async fn post_message(
    raw_id: String,
    server: Arc<Server>,
    user_id: UserId,
    content_type: Option<String>,
    body: Bytes,
) -> Result<Response, Rejection> {
    let store = store(&server)?;
    let channel_id = parse_channel_id(&raw_id)?;

    store.ensure_user(&user_id).await.map_err(ApiErrorCode::from)?;
    if let Err(e) = store.ensure_member(channel_id, &user_id).await {
        warn!(%channel_id, %user_id, "ensure member failed: {}", e);
    }

    let payload = message_payload(content_type.as_deref(), body)?;
    let message = store
        .save_channel_message(channel_id, &user_id, &payload)
        .await
        .map_err(ApiErrorCode::from)?;

    if let Err(e) = server.bus.publish(&message.subject, payload).await {
        warn!(subject = %message.subject, "publish failed: {}", e);
        metrics::record_publish_failure();
    }
    Ok(json_reply(&message, StatusCode::CREATED))
}

pub async fn list_messages(
    raw_id: String,
    server: Arc<Server>,
    _user_id: Option<UserId>,
    query: HistoryQuery,
) -> Result<Response, Rejection> {
    let store = store(&server)?;
    let channel_id = parse_channel_id(&raw_id)?;
    let messages = store
        .list_messages(channel_id, history_limit(query.limit.as_deref()))
        .await
        .map_err(ApiErrorCode::from)?;
    Ok(json_reply(&messages, StatusCode::OK))
}

// endregion

// region users

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub password: String,
}

fn user_not_found(e: StoreError) -> ApiErrorCode {
    match e {
        StoreError::NotFound => ApiErrorCode::NotFound("user not found"),
        e => ApiErrorCode::from(e),
    }
}

fn ensure_owner(caller: Option<&UserId>, target: &str) -> Result<(), ApiErrorCode> {
    match caller {
        Some(caller) if caller.as_str() == target => Ok(()),
        _ => Err(ApiErrorCode::Forbidden),
    }
}

pub async fn list_users(
    server: Arc<Server>,
    _user_id: Option<UserId>,
) -> Result<Response, Rejection> {
    let store = store(&server)?;
    let users = store.list_users().await.map_err(ApiErrorCode::from)?;
    Ok(json_reply(&users, StatusCode::OK))
}

pub async fn get_user(
    id: String,
    server: Arc<Server>,
    _user_id: Option<UserId>,
) -> Result<Response, Rejection> {
    let store = store(&server)?;
    let user = store
        .get_user(&UserId(id))
        .await
        .map_err(user_not_found)?;
    Ok(json_reply(&user, StatusCode::OK))
}

pub async fn post_user(
    server: Arc<Server>,
    _user_id: Option<UserId>,
    body: Bytes,
) -> Result<Response, Rejection> {
    Ok(create_user(&server, &body).await?)
}

pub async fn patch_user(
    id: String,
    server: Arc<Server>,
    user_id: Option<UserId>,
    body: Bytes,
) -> Result<Response, Rejection> {
    let store = store(&server)?;
    ensure_owner(user_id.as_ref(), &id)?;
    let request: UpdateUserRequest = parse_json(&body)?;
    let user = store
        .update_user(&UserId(id), &request.display_name, &request.password)
        .await
        .map_err(user_not_found)?;
    Ok(json_reply(&user, StatusCode::OK))
}

pub async fn delete_user(
    id: String,
    server: Arc<Server>,
    user_id: Option<UserId>,
) -> Result<Response, Rejection> {
    let store = store(&server)?;
    ensure_owner(user_id.as_ref(), &id)?;
    store
        .delete_user(&UserId(id))
        .await
        .map_err(user_not_found)?;
    Ok(json_reply(&StatusBody { status: "deleted" }, StatusCode::OK))
}

// endregion

// region probes

pub async fn healthz() -> Result<Response, Rejection> {
    Ok(text_reply("ok", StatusCode::OK))
}

pub async fn ping_bus(server: Arc<Server>) -> Result<Response, Rejection> {
    if !server.bus.is_connected() {
        return Err(ApiErrorCode::Unavailable("nats not connected").into());
    }
    Ok(text_reply("nats ok", StatusCode::OK))
}

pub async fn render_metrics(server: Arc<Server>) -> Result<Response, Rejection> {
    let handle = server
        .metrics
        .as_ref()
        .ok_or(ApiErrorCode::Unavailable("metrics not installed"))?;
    let mut response = handle.render().into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    Ok(response)
}

// endregion
