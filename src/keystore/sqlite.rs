//! SQLite persistence for key slots.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use super::SlotStore;

/// Slot store backed by a `key_slots` table.
pub struct SqliteSlotStore {
    pool: SqlitePool,
}

impl SqliteSlotStore {
    /// Connect and create the table if needed.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store.run_migrations().await?;

        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS key_slots (
                name TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// When the slot was last written, if it holds a value.
    pub async fn updated_at(&self, name: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT updated_at FROM key_slots WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(at,)| at))
    }
}

#[async_trait]
impl SlotStore for SqliteSlotStore {
    async fn load(&self, name: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM key_slots WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(value,)| value))
    }

    async fn save(&self, name: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO key_slots (name, value, updated_at)
            VALUES (?, ?, datetime('now'))
            ON CONFLICT(name) DO UPDATE SET
                value = excluded.value,
                updated_at = datetime('now')
            "#,
        )
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM key_slots WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::keystore::{EphemeralKeySlot, EPHEMERAL_KEY_SLOT};
    use serde_json::json;

    fn temp_database_url() -> (std::path::PathBuf, String) {
        let path = std::env::temp_dir().join(format!("stratbox-{}.db", uuid::Uuid::new_v4()));
        let url = format!("sqlite:{}?mode=rwc", path.display());
        (path, url)
    }

    #[tokio::test]
    async fn test_persists_across_connections() {
        let (path, url) = temp_database_url();

        {
            let store = SqliteSlotStore::new(&url).await.unwrap();
            let slot = EphemeralKeySlot::new(Arc::new(store));
            slot.set(json!({"k": 1})).await.unwrap();
        }

        let store = Arc::new(SqliteSlotStore::new(&url).await.unwrap());
        assert!(store.updated_at(EPHEMERAL_KEY_SLOT).await.unwrap().is_some());

        let slot = EphemeralKeySlot::new(store.clone());
        assert_eq!(slot.get().await.unwrap(), Some(json!({"k": 1})));

        slot.clear().await.unwrap();
        assert_eq!(slot.get().await.unwrap(), None);
        assert_eq!(store.load(EPHEMERAL_KEY_SLOT).await.unwrap(), None);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_save_overwrites() {
        let (path, url) = temp_database_url();
        let store = SqliteSlotStore::new(&url).await.unwrap();

        store.save("slot", "1").await.unwrap();
        store.save("slot", "2").await.unwrap();
        assert_eq!(store.load("slot").await.unwrap(), Some("2".to_string()));

        let _ = std::fs::remove_file(path);
    }
}
