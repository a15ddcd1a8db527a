//! Session cookie contents.

use core::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use axum_extra::extract::cookie::{Cookie, SameSite, SignedCookieJar};
use cookie::time::Duration as CookieDuration;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

pub const COOKIE_SESSION: &str = "reading_diary_session";

/// Claims carried in the signed session cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub iat: u64,
    pub exp: u64,
    /// Hash of the password the session was issued for.
    pub password_hash: String,
}

impl SessionClaims {
    pub fn new(password: &str, ttl: Duration) -> Self {
        let now = now_ts();
        Self {
            iat: now,
            exp: now.saturating_add(ttl.as_secs()),
            password_hash: hash_password(password),
        }
    }

    pub fn is_expired(&self) -> bool {
        now_ts() >= self.exp
    }

    pub fn matches_password(&self, password: &str) -> bool {
        self.password_hash == hash_password(password)
    }
}

pub(super) fn hash_password(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// `HttpOnly`, `SameSite=Strict` cookie holding `claims`. `secure` marks it HTTPS-only,
/// which browsers refuse to store over plain HTTP.
///
/// # Errors
///
/// Returns an error if the claims cannot be serialized.
pub(super) fn session_cookie(
    claims: &SessionClaims,
    ttl: Duration,
    secure: bool,
) -> Result<Cookie<'static>, serde_json::Error> {
    let max_age = CookieDuration::seconds(i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX));
    Ok(Cookie::build((COOKIE_SESSION, serde_json::to_string(claims)?))
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Strict)
        .max_age(max_age)
        .path("/")
        .build())
}

pub(super) fn removal_cookie() -> Cookie<'static> {
    Cookie::build(COOKIE_SESSION).path("/").build()
}

pub(super) fn from_jar(jar: &SignedCookieJar) -> Option<SessionClaims> {
    jar.get(COOKIE_SESSION)
        .and_then(|c| serde_json::from_str(c.value()).ok())
}

pub(super) fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
