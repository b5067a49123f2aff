use super::error::ApiErrorCode;
use crate::domain_model::Session;
use crate::server::AuthPolicy;
use chrono::{DateTime, Utc};
use warp::http::header::{HeaderValue, SET_COOKIE};
use warp::reply::Response;

pub const ACCESS_COOKIE: &str = "access_token";
pub const REFRESH_COOKIE: &str = "refresh_token";

const EPOCH_EXPIRES: &str = "Thu, 01 Jan 1970 00:00:00 GMT";

/// `Max-Age` is derived from the token's own expiry, so the cookie never
/// outlives the token it carries.
pub fn session_cookie(
    name: &str,
    value: &str,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
    policy: &AuthPolicy,
) -> String {
    let max_age = (expires_at - now).num_seconds().max(0);
    let expires = expires_at.format("%a, %d %b %Y %H:%M:%S GMT");
    let cookie = format!("{name}={value}; Path=/; Max-Age={max_age}; Expires={expires}");
    with_attributes(cookie, policy)
}

pub fn expired_cookie(name: &str, policy: &AuthPolicy) -> String {
    let cookie = format!("{name}=; Path=/; Max-Age=0; Expires={EPOCH_EXPIRES}");
    with_attributes(cookie, policy)
}

fn with_attributes(mut cookie: String, policy: &AuthPolicy) -> String {
    cookie.push_str("; HttpOnly; SameSite=Lax");
    if let Some(domain) = &policy.cookie_domain {
        cookie.push_str("; Domain=");
        cookie.push_str(domain);
    }
    if policy.cookie_secure {
        cookie.push_str("; Secure");
    }
    cookie
}

pub fn append_cookies(response: &mut Response, cookies: &[String]) -> Result<(), ApiErrorCode> {
    for cookie in cookies {
        let value = HeaderValue::from_str(cookie).map_err(ApiErrorCode::internal)?;
        response.headers_mut().append(SET_COOKIE, value);
    }
    Ok(())
}

pub fn session_cookies(session: &Session, policy: &AuthPolicy) -> Vec<String> {
    let now = Utc::now();
    vec![
        session_cookie(
            ACCESS_COOKIE,
            &session.access_token.0,
            session.access_expires_at,
            now,
            policy,
        ),
        session_cookie(
            REFRESH_COOKIE,
            &session.refresh_token.0,
            session.refresh_expires_at,
            now,
            policy,
        ),
    ]
}

pub fn cleared_cookies(policy: &AuthPolicy) -> Vec<String> {
    vec![
        expired_cookie(ACCESS_COOKIE, policy),
        expired_cookie(REFRESH_COOKIE, policy),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_session_cookie_attributes() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let expires_at = now + chrono::Duration::seconds(900);
        let policy = AuthPolicy {
            cookie_domain: Some("example.com".to_string()),
            cookie_secure: true,
            ..AuthPolicy::default()
        };

        let cookie = session_cookie(ACCESS_COOKIE, "abc", expires_at, now, &policy);
        assert_eq!(
            cookie,
            "access_token=abc; Path=/; Max-Age=900; Expires=Wed, 01 May 2024 12:15:00 GMT; \
             HttpOnly; SameSite=Lax; Domain=example.com; Secure"
        );
    }

    #[test]
    fn test_past_expiry_clamps_max_age() {
        let now = Utc::now();
        let cookie = session_cookie(
            REFRESH_COOKIE,
            "x",
            now - chrono::Duration::seconds(5),
            now,
            &AuthPolicy::default(),
        );
        assert!(cookie.contains("Max-Age=0;"));
        assert!(!cookie.contains("Secure"));
        assert!(!cookie.contains("Domain="));
    }

    #[test]
    fn test_expired_cookie() {
        let cookie = expired_cookie(ACCESS_COOKIE, &AuthPolicy::default());
        assert!(cookie.starts_with("access_token=; Path=/; Max-Age=0;"));
    }
}
