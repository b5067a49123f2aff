use super::cookie::ACCESS_COOKIE;
use super::error::*;
use crate::application_impl::{RateLimiter, client_key};
use crate::domain_model::UserId;
use crate::metrics;
use crate::server::Server;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use warp::{Filter, Rejection, reject};

/// Request and message bodies are capped at 1 MiB.
pub const MAX_BODY_BYTES: usize = 1 << 20;

pub(super) fn with<T>(value: Arc<T>) -> impl Filter<Extract = (Arc<T>,), Error = Infallible> + Clone
where
    T: Send + Sync + ?Sized,
{
    warp::any().map(move || value.clone())
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn bearer(header: Option<String>) -> Option<String> {
    header.and_then(|h| h.strip_prefix("Bearer ").map(str::to_owned))
}

/// Validates the presented access token. With auth enabled a missing or
/// invalid token is rejected; otherwise the caller is treated as anonymous.
fn resolve_identity(server: &Server, token: Option<String>) -> Result<Option<UserId>, Rejection> {
    let enabled = server.policy.enabled;
    match token.filter(|t| !t.is_empty()) {
        None if enabled => Err(reject::custom(ApiErrorCode::Unauthorized)),
        None => Ok(None),
        Some(token) => match server.sessions.validate_access(&token) {
            Ok(user_id) => Ok(Some(user_id)),
            Err(_) if enabled => Err(reject::custom(ApiErrorCode::Unauthorized)),
            Err(_) => Ok(None),
        },
    }
}

/// Identity from `Authorization: Bearer`, else the access cookie.
pub(super) fn with_identity(
    server: Arc<Server>,
) -> impl Filter<Extract = (Option<UserId>,), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization")
        .and(warp::cookie::optional::<String>(ACCESS_COOKIE))
        .and_then(move |header: Option<String>, cookie: Option<String>| {
            let server = server.clone();
            async move { resolve_identity(&server, bearer(header).or(cookie)) }
        })
}

/// Like `with_identity`, with the `token` query parameter as a last resort.
pub(super) fn with_ws_identity(
    server: Arc<Server>,
) -> impl Filter<Extract = (Option<UserId>,), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization")
        .and(warp::cookie::optional::<String>(ACCESS_COOKIE))
        .and(warp::query::<TokenQuery>())
        .and_then(
            move |header: Option<String>, cookie: Option<String>, query: TokenQuery| {
                let server = server.clone();
                async move { resolve_identity(&server, bearer(header).or(cookie).or(query.token)) }
            },
        )
}

/// A valid access token is mandatory regardless of the auth toggle.
pub(super) fn require_identity(
    server: Arc<Server>,
) -> impl Filter<Extract = (UserId,), Error = Rejection> + Clone {
    with_identity(server).and_then(|user_id: Option<UserId>| async move {
        user_id.ok_or_else(|| reject::custom(ApiErrorCode::Unauthorized))
    })
}

pub(super) fn rate_limited(
    limiter: Arc<RateLimiter>,
) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::addr::remote()
        .and_then(move |remote: Option<SocketAddr>| {
            let limiter = limiter.clone();
            async move {
                let key = remote
                    .map(|addr| client_key(&addr.to_string()))
                    .unwrap_or_else(|| "unknown".to_string());
                if limiter.admit(&key) {
                    Ok(())
                } else {
                    tracing::debug!(key = %key, "rate limited");
                    metrics::record_rate_limited();
                    Err(reject::custom(ApiErrorCode::RateLimited))
                }
            }
        })
        .untuple_one()
}

/// The whole body, or 413 once it grows past `limit`.
pub(super) fn limited_body(
    limit: usize,
) -> impl Filter<Extract = (Bytes,), Error = Rejection> + Clone {
    warp::header::optional::<u64>("content-length")
        .and_then(move |length: Option<u64>| async move {
            match length {
                Some(length) if length > limit as u64 => {
                    Err(reject::custom(ApiErrorCode::PayloadTooLarge))
                }
                _ => Ok(()),
            }
        })
        .untuple_one()
        .and(warp::body::stream())
        .and_then(move |stream| collect_limited(stream, limit))
}

async fn collect_limited<S, B>(stream: S, limit: usize) -> Result<Bytes, Rejection>
where
    S: Stream<Item = Result<B, warp::Error>> + Send,
    B: Buf + Send,
{
    futures_util::pin_mut!(stream);
    let mut body = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            tracing::debug!("body read failed: {}", e);
            reject::custom(ApiErrorCode::bad_request("cannot read body"))
        })?;
        if body.len() + chunk.remaining() > limit {
            return Err(reject::custom(ApiErrorCode::PayloadTooLarge));
        }
        body.put(chunk);
    }
    Ok(body.freeze())
}
