//! Password login for the API and the event stream.
//!
//! `POST /api/login` checks the password and sets a signed session cookie. Scripts
//! can skip the cookie and send `Authorization: Bearer <password>` instead. Changing
//! the password invalidates every session, since the cookie carries its hash.

mod middleware;
mod routes;
mod session;

use core::time::Duration;

use axum::http::{HeaderMap, header::AUTHORIZATION};
use axum_extra::extract::cookie::{Key, SignedCookieJar};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use eyre::WrapErr as _;
use rand::{RngExt as _, distr::Alphanumeric};
use secrecy::{ExposeSecret as _, SecretString};
use tracing::{info, warn};

use crate::{
    config::AuthConfig,
    db::{self, DbPool},
};

pub use middleware::{request_is_secure, require};
pub use routes::{LoginRequest, LoginResponse, routes};
pub use session::{COOKIE_SESSION, SessionClaims};

/// Settings key of a generated password.
pub const KEY_PASSWORD: &str = "server_password";
/// Settings key of a generated cookie signing key.
pub const KEY_COOKIE_SECRET: &str = "cookie_secret";

const GENERATED_PASSWORD_LEN: usize = 24;

/// Resolved login settings shared by the middleware and the login routes.
#[derive(Clone)]
pub struct AuthRuntime {
    password: SecretString,
    cookie_key: Key,
    session_ttl: Duration,
}

impl core::fmt::Debug for AuthRuntime {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AuthRuntime")
            .field("session_ttl", &self.session_ttl)
            .finish_non_exhaustive()
    }
}

impl AuthRuntime {
    pub fn new(password: impl Into<SecretString>, cookie_key: Key, session_ttl: Duration) -> Self {
        Self {
            password: password.into(),
            cookie_key,
            session_ttl,
        }
    }

    /// Resolves password and cookie key. Configured values win; otherwise values
    /// stored in the database are used, and generated and stored when missing.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured cookie secret is invalid or the database
    /// cannot be read or written.
    pub async fn from_config(cfg: &AuthConfig, pool: &DbPool) -> eyre::Result<Self> {
        let cookie_key = if let Some(secret) = &cfg.cookie_secret {
            let bytes = BASE64
                .decode(secret)
                .wrap_err("Invalid cookie_secret in config")?;
            Key::try_from(bytes.as_slice())
                .wrap_err("Invalid cookie_secret in config: expected at least 64 bytes")?
        } else {
            stored_cookie_key(pool).await?
        };

        let password = match cfg.password.as_deref() {
            Some(password) if !password.is_empty() => {
                // a stale generated password would be confusing once the config sets one
                db::delete_setting(pool, KEY_PASSWORD).await?;
                info!("Login password: configured");
                password.to_owned()
            }
            _ => {
                if let Some(stored) = db::get_setting(pool, KEY_PASSWORD).await? {
                    info!("Login password (from database): {stored}");
                    stored
                } else {
                    let generated = generate_password();
                    db::set_setting(pool, KEY_PASSWORD, &generated).await?;
                    info!("Login password (generated, stored in database): {generated}");
                    generated
                }
            }
        };

        Ok(Self::new(
            password,
            cookie_key,
            Duration::from_secs(cfg.session_hours.saturating_mul(60 * 60)),
        ))
    }

    pub const fn session_ttl(&self) -> Duration {
        self.session_ttl
    }

    pub fn cookie_key(&self) -> Key {
        self.cookie_key.clone()
    }

    pub fn verify_password(&self, candidate: &str) -> bool {
        session::hash_password(candidate) == session::hash_password(self.password.expose_secret())
    }

    pub fn new_session(&self) -> SessionClaims {
        SessionClaims::new(self.password.expose_secret(), self.session_ttl)
    }

    /// True for a valid bearer password or an unexpired session cookie.
    pub fn is_authorized(&self, headers: &HeaderMap) -> bool {
        if let Some(bearer) = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
        {
            return self.verify_password(bearer.trim());
        }

        let jar = SignedCookieJar::from_headers(headers, self.cookie_key.clone());
        session::from_jar(&jar).is_some_and(|claims| {
            !claims.is_expired() && claims.matches_password(self.password.expose_secret())
        })
    }
}

async fn stored_cookie_key(pool: &DbPool) -> eyre::Result<Key> {
    if let Some(stored) = db::get_setting(pool, KEY_COOKIE_SECRET).await? {
        match BASE64
            .decode(&stored)
            .ok()
            .and_then(|bytes| Key::try_from(bytes.as_slice()).ok())
        {
            Some(key) => return Ok(key),
            None => warn!("Stored cookie key is corrupt, generating a new one"),
        }
    }
    let key = Key::generate();
    db::set_setting(pool, KEY_COOKIE_SECRET, &BASE64.encode(key.master())).await?;
    Ok(key)
}

fn generate_password() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(GENERATED_PASSWORD_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use axum::http::{HeaderValue, header::COOKIE};

    use super::*;

    async fn memory_pool() -> DbPool {
        db::init(Path::new(":memory:")).await.unwrap()
    }

    fn runtime() -> AuthRuntime {
        AuthRuntime::new("hunter2", Key::generate(), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn generated_password_is_stored_and_reused() {
        let pool = memory_pool().await;
        let first = AuthRuntime::from_config(&AuthConfig::default(), &pool)
            .await
            .unwrap();
        let stored = db::get_setting(&pool, KEY_PASSWORD).await.unwrap().unwrap();
        assert_eq!(stored.len(), GENERATED_PASSWORD_LEN, "generated length");
        assert!(first.verify_password(&stored), "stored value is the password");

        let second = AuthRuntime::from_config(&AuthConfig::default(), &pool)
            .await
            .unwrap();
        assert!(second.verify_password(&stored), "reused on the next start");
        assert_eq!(
            first.cookie_key().master(),
            second.cookie_key().master(),
            "cookie key survives restarts"
        );
    }

    #[tokio::test]
    async fn configured_password_replaces_stored_one() {
        let pool = memory_pool().await;
        db::set_setting(&pool, KEY_PASSWORD, "from-db").await.unwrap();
        let cfg = AuthConfig {
            password: Some("configured".to_owned()),
            ..AuthConfig::default()
        };
        let auth = AuthRuntime::from_config(&cfg, &pool).await.unwrap();
        assert!(auth.verify_password("configured"), "config wins");
        assert!(!auth.verify_password("from-db"), "stored value ignored");
        assert_eq!(db::get_setting(&pool, KEY_PASSWORD).await.unwrap(), None, "stored value removed");
    }

    #[tokio::test]
    async fn invalid_configured_cookie_secret_fails() {
        let pool = memory_pool().await;
        let cfg = AuthConfig {
            cookie_secret: Some("not-base64!!".to_owned()),
            ..AuthConfig::default()
        };
        assert!(AuthRuntime::from_config(&cfg, &pool).await.is_err(), "rejected");
    }

    #[test]
    fn bearer_password_is_accepted() {
        let auth = runtime();
        let mut headers = HeaderMap::new();
        assert!(!auth.is_authorized(&headers), "no credentials");

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer wrong"));
        assert!(!auth.is_authorized(&headers), "wrong password");

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer hunter2"));
        assert!(auth.is_authorized(&headers), "right password");
    }

    /// The signed cookie header a browser sends back after login.
    fn session_header(auth: &AuthRuntime) -> HeaderValue {
        let cookie =
            session::session_cookie(&auth.new_session(), auth.session_ttl(), false).unwrap();
        let mut jar = cookie::CookieJar::new();
        jar.signed_mut(&auth.cookie_key()).add(cookie);
        let signed = jar.get(COOKIE_SESSION).unwrap();
        HeaderValue::from_str(&format!("{COOKIE_SESSION}={}", signed.value())).unwrap()
    }

    #[test]
    fn session_cookie_is_accepted_until_password_changes() {
        let auth = runtime();
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, session_header(&auth));
        assert!(auth.is_authorized(&headers), "fresh session");

        let changed = AuthRuntime::new("new-password", auth.cookie_key(), auth.session_ttl());
        assert!(!changed.is_authorized(&headers), "old session after password change");

        let other_key = AuthRuntime::new("hunter2", Key::generate(), auth.session_ttl());
        assert!(!other_key.is_authorized(&headers), "cookie signed with another key");
    }

    #[test]
    fn expired_session_is_rejected() {
        let auth = AuthRuntime::new("hunter2", Key::generate(), Duration::ZERO);
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, session_header(&auth));
        assert!(!auth.is_authorized(&headers), "zero lifetime expires immediately");
    }
}
