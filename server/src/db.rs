//! `SQLite` persistence for server settings.
//!
//! Settings are a plain key/value table; the external-access configuration is
//! stored as three keys and always written together in one transaction.

use core::str::FromStr as _;
use std::path::Path;

use chrono::Utc;
use secrecy::ExposeSecret as _;
use sqlx::{
    Row as _,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions},
};
use thiserror::Error as ThisError;
use tracing::debug;

use crate::external::{
    ConfigInvalid, ExternalAccessConfig, KEY_DOMAIN, KEY_ENABLED, KEY_TOKEN,
};

pub type DbPool = SqlitePool;

#[derive(Debug, ThisError)]
pub enum SettingsError {
    #[error(transparent)]
    Invalid(#[from] ConfigInvalid),
    #[error("settings store failed: {0}")]
    Database(#[from] sqlx::Error),
}

/// Opens (creating if needed) the database and runs migrations.
///
/// # Errors
///
/// Returns an error if the database cannot be opened or migrated.
pub async fn init(path: &Path) -> Result<DbPool, sqlx::Error> {
    let pool = if path == Path::new(":memory:") {
        // Every connection to :memory: is its own database, so keep exactly one.
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?)
            .await?
    } else {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        SqlitePoolOptions::new().connect_with(options).await?
    };

    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

/// Reads a single setting.
///
/// # Errors
///
/// Returns an error if the query fails.
pub async fn get_setting(pool: &DbPool, key: &str) -> Result<Option<String>, sqlx::Error> {
    let row = sqlx::query("SELECT value FROM server_settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    row.map(|r| r.try_get::<String, _>("value")).transpose()
}

/// Writes a single setting, replacing any previous value.
///
/// # Errors
///
/// Returns an error if the write fails.
pub async fn set_setting(pool: &DbPool, key: &str, value: &str) -> Result<(), sqlx::Error> {
    upsert(pool, key, value).await
}

/// Removes a setting. Removing a missing key is not an error.
///
/// # Errors
///
/// Returns an error if the delete fails.
pub async fn delete_setting(pool: &DbPool, key: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM server_settings WHERE key = ?")
        .bind(key)
        .execute(pool)
        .await?;
    Ok(())
}

async fn upsert<'conn, E>(executor: E, key: &str, value: &str) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'conn, Database = sqlx::Sqlite>,
{
    sqlx::query(
        "INSERT INTO server_settings (key, value, updated_at) VALUES (?, ?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(value)
    .bind(Utc::now().to_rfc3339())
    .execute(executor)
    .await?;
    Ok(())
}

/// Loads the external-access configuration. Missing keys read as disabled/empty.
///
/// # Errors
///
/// Returns an error if the query fails.
pub async fn load_external_config(pool: &DbPool) -> Result<ExternalAccessConfig, sqlx::Error> {
    let enabled = get_setting(pool, KEY_ENABLED).await?;
    let hostname = get_setting(pool, KEY_DOMAIN).await?.unwrap_or_default();
    let token = get_setting(pool, KEY_TOKEN).await?.unwrap_or_default();

    Ok(ExternalAccessConfig {
        enabled: enabled.as_deref() == Some("true"),
        hostname_label: hostname,
        dns_token: token.into(),
    })
}

/// Validates and persists the external-access configuration.
///
/// # Errors
///
/// Returns [`SettingsError::Invalid`] when an enabled config lacks hostname or token,
/// or [`SettingsError::Database`] when the write fails.
pub async fn save_external_config(
    pool: &DbPool,
    config: &ExternalAccessConfig,
) -> Result<(), SettingsError> {
    config.validate()?;

    let mut tx = pool.begin().await?;
    upsert(&mut *tx, KEY_ENABLED, if config.enabled { "true" } else { "false" }).await?;
    upsert(&mut *tx, KEY_DOMAIN, &config.hostname_label).await?;
    upsert(&mut *tx, KEY_TOKEN, config.dns_token.expose_secret()).await?;
    tx.commit().await?;

    debug!(enabled = config.enabled, hostname = %config.hostname_label, "Saved external access config");
    Ok(())
}
