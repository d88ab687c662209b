use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use super::{column, format_timestamp, RepositoryError};
use crate::DbPool;

/// Key-value rows in `system_setting`.
pub struct SqlSettingsRepository {
    pool: DbPool,
}

impl SqlSettingsRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, RepositoryError> {
        let row = sqlx::query("SELECT value FROM system_setting WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(|row| column(row, "value")).transpose()
    }

    pub async fn all(&self) -> Result<BTreeMap<String, String>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        load_all(&mut conn).await
    }

    pub async fn set(
        &self,
        key: &str,
        value: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        store(&mut conn, key, value, now).await
    }
}

pub(crate) async fn load_all(
    conn: &mut SqliteConnection,
) -> Result<BTreeMap<String, String>, RepositoryError> {
    let rows = sqlx::query("SELECT key, value FROM system_setting ORDER BY key")
        .fetch_all(&mut *conn)
        .await?;

    rows.iter()
        .map(|row| -> Result<(String, String), RepositoryError> {
            Ok((column(row, "key")?, column(row, "value")?))
        })
        .collect()
}

pub(crate) async fn store(
    conn: &mut SqliteConnection,
    key: &str,
    value: &str,
    now: DateTime<Utc>,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO system_setting (key, value, updated_at) VALUES (?, ?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(value)
    .bind(format_timestamp(now))
    .execute(&mut *conn)
    .await?;
    Ok(())
}
