//! SQLite persistence for watches, warehouse state and the warehouse catalog.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use slotwatch_core::{
    Credential, CredentialRecord, PollingInterval, StoredWatch, Threshold, UserId, Warehouse,
    WarehouseId, WarehouseState, WatchConfig,
};
use slotwatch_engine::{StoreError, WatchStore};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Invalid stored value for user {user}: {reason}")]
    Invalid { user: i64, reason: String },
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Sqlx(e) => StoreError::Backend(e.to_string()),
            invalid @ DbError::Invalid { .. } => StoreError::Corrupt(invalid.to_string()),
        }
    }
}

type UserRow = (i64, Option<String>, Option<DateTime<Utc>>, i64, f64);

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect to the SQLite database at `database_url`, creating it if needed.
    pub async fn connect(database_url: &str) -> Result<Self, DbError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        // Every connection to an in-memory URL is a separate database, so
        // keep exactly one open for the lifetime of the pool.
        let pool_options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options.connect_with(options).await?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<(), DbError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                chat_id INTEGER PRIMARY KEY,
                api_key TEXT,
                api_key_updated_at TEXT,
                polling_minutes INTEGER NOT NULL DEFAULT 5,
                threshold REAL NOT NULL DEFAULT 1.0,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_warehouses (
                chat_id INTEGER NOT NULL REFERENCES users(chat_id) ON DELETE CASCADE,
                warehouse_id INTEGER NOT NULL,
                PRIMARY KEY (chat_id, warehouse_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS warehouse_state (
                chat_id INTEGER NOT NULL REFERENCES users(chat_id) ON DELETE CASCADE,
                warehouse_id INTEGER NOT NULL,
                coefficient REAL NOT NULL,
                observed_at TEXT NOT NULL,
                PRIMARY KEY (chat_id, warehouse_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS warehouses (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Load every user with their warehouses and last known states.
    pub async fn load_all(&self) -> Result<Vec<StoredWatch>, DbError> {
        let users = sqlx::query_as::<_, UserRow>(
            "SELECT chat_id, api_key, api_key_updated_at, polling_minutes, threshold FROM users ORDER BY chat_id",
        )
        .fetch_all(&self.pool)
        .await?;

        let memberships = sqlx::query_as::<_, (i64, i64)>(
            "SELECT chat_id, warehouse_id FROM user_warehouses",
        )
        .fetch_all(&self.pool)
        .await?;

        let states = sqlx::query_as::<_, (i64, i64, f64, DateTime<Utc>)>(
            "SELECT chat_id, warehouse_id, coefficient, observed_at FROM warehouse_state",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut watches: Vec<StoredWatch> = Vec::with_capacity(users.len());
        let mut index: HashMap<i64, usize> = HashMap::with_capacity(users.len());
        for row in users {
            let chat_id = row.0;
            index.insert(chat_id, watches.len());
            watches.push(StoredWatch {
                config: config_from_row(row)?,
                states: HashMap::new(),
            });
        }

        for (chat_id, warehouse_id) in memberships {
            if let Some(&i) = index.get(&chat_id) {
                watches[i].config.warehouses.insert(WarehouseId(warehouse_id as u64));
            }
        }

        for (chat_id, warehouse_id, coefficient, observed_at) in states {
            if let Some(&i) = index.get(&chat_id) {
                watches[i].states.insert(
                    WarehouseId(warehouse_id as u64),
                    WarehouseState::new(coefficient, observed_at),
                );
            }
        }

        Ok(watches)
    }

    /// Upsert the user row and replace its warehouse memberships.
    pub async fn upsert_user(&self, config: &WatchConfig) -> Result<(), DbError> {
        let chat_id = config.user.0;
        let (api_key, updated_at) = match &config.credential {
            Some(record) => (Some(record.credential.expose().to_string()), Some(record.updated_at)),
            None => (None, None),
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO users (chat_id, api_key, api_key_updated_at, polling_minutes, threshold)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(chat_id) DO UPDATE SET
                api_key = excluded.api_key,
                api_key_updated_at = excluded.api_key_updated_at,
                polling_minutes = excluded.polling_minutes,
                threshold = excluded.threshold
            "#,
        )
        .bind(chat_id)
        .bind(api_key)
        .bind(updated_at)
        .bind(i64::from(config.interval))
        .bind(config.threshold.value())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM user_warehouses WHERE chat_id = ?")
            .bind(chat_id)
            .execute(&mut *tx)
            .await?;

        for warehouse in &config.warehouses {
            sqlx::query("INSERT INTO user_warehouses (chat_id, warehouse_id) VALUES (?, ?)")
                .bind(chat_id)
                .bind(warehouse.get() as i64)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            r#"
            DELETE FROM warehouse_state
            WHERE chat_id = ?
              AND warehouse_id NOT IN (SELECT warehouse_id FROM user_warehouses WHERE chat_id = ?)
            "#,
        )
        .bind(chat_id)
        .bind(chat_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_user(&self, user: UserId) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await?;
        for table in ["warehouse_state", "user_warehouses", "users"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE chat_id = ?"))
                .bind(user.0)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Write all states of one poll in a single transaction.
    ///
    /// States for warehouses the user no longer watches are skipped.
    pub async fn upsert_states(
        &self,
        user: UserId,
        states: &[(WarehouseId, WarehouseState)],
    ) -> Result<u64, DbError> {
        let mut tx = self.pool.begin().await?;
        let mut written = 0;

        for (warehouse, state) in states {
            let result = sqlx::query(
                r#"
                INSERT INTO warehouse_state (chat_id, warehouse_id, coefficient, observed_at)
                SELECT ?, ?, ?, ?
                WHERE EXISTS (
                    SELECT 1 FROM user_warehouses WHERE chat_id = ? AND warehouse_id = ?
                )
                ON CONFLICT(chat_id, warehouse_id) DO UPDATE SET
                    coefficient = excluded.coefficient,
                    observed_at = excluded.observed_at
                "#,
            )
            .bind(user.0)
            .bind(warehouse.get() as i64)
            .bind(state.coefficient)
            .bind(state.observed_at)
            .bind(user.0)
            .bind(warehouse.get() as i64)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }

        tx.commit().await?;
        debug!(user = %user, written, "Stored warehouse states");
        Ok(written)
    }

    pub async fn upsert_warehouses(&self, warehouses: &[Warehouse]) -> Result<(), DbError> {
        let mut tx = self.pool.begin().await?;
        for warehouse in warehouses {
            sqlx::query(
                r#"
                INSERT INTO warehouses (id, name) VALUES (?, ?)
                ON CONFLICT(id) DO UPDATE SET name = excluded.name, updated_at = CURRENT_TIMESTAMP
                "#,
            )
            .bind(warehouse.id.get() as i64)
            .bind(warehouse.name.as_str())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_warehouses(&self) -> Result<Vec<Warehouse>, DbError> {
        let rows = sqlx::query_as::<_, (i64, String)>("SELECT id, name FROM warehouses ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(id, name)| Warehouse {
                id: WarehouseId(id as u64),
                name: name.into(),
            })
            .collect())
    }
}

fn config_from_row(
    (chat_id, api_key, updated_at, polling_minutes, threshold): UserRow,
) -> Result<WatchConfig, DbError> {
    let invalid = |reason: String| DbError::Invalid {
        user: chat_id,
        reason,
    };

    let mut config = WatchConfig::new(UserId(chat_id));
    config.interval =
        PollingInterval::from_minutes(polling_minutes).map_err(|e| invalid(e.to_string()))?;
    config.threshold = Threshold::new(threshold).map_err(|e| invalid(e.to_string()))?;
    config.credential = api_key.filter(|key| !key.is_empty()).map(|key| CredentialRecord {
        credential: Credential::new(key),
        updated_at: updated_at.unwrap_or_else(Utc::now),
    });
    Ok(config)
}

#[async_trait]
impl WatchStore for Database {
    async fn load_watches(&self) -> Result<Vec<StoredWatch>, StoreError> {
        Ok(self.load_all().await?)
    }

    async fn save_watch(&self, config: &WatchConfig) -> Result<(), StoreError> {
        Ok(self.upsert_user(config).await?)
    }

    async fn delete_watch(&self, user: UserId) -> Result<(), StoreError> {
        Ok(self.delete_user(user).await?)
    }

    async fn save_states(
        &self,
        user: UserId,
        states: &[(WarehouseId, WarehouseState)],
    ) -> Result<(), StoreError> {
        self.upsert_states(user, states).await?;
        Ok(())
    }

    async fn save_warehouses(&self, warehouses: &[Warehouse]) -> Result<(), StoreError> {
        Ok(self.upsert_warehouses(warehouses).await?)
    }

    async fn list_warehouses(&self) -> Result<Vec<Warehouse>, StoreError> {
        Ok(self.get_warehouses().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn watch(chat_id: i64, warehouses: &[u64]) -> WatchConfig {
        let mut config = WatchConfig::new(UserId(chat_id));
        config.credential = Some(CredentialRecord {
            credential: Credential::new("secret-key"),
            updated_at: Utc.with_ymd_and_hms(2024, 9, 1, 12, 0, 0).unwrap(),
        });
        config.warehouses = warehouses.iter().copied().map(WarehouseId).collect();
        config.interval = PollingInterval::from_minutes(10).unwrap();
        config.threshold = Threshold::new(2.5).unwrap();
        config
    }

    #[tokio::test]
    async fn test_database_connect() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        assert!(db.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_watch_round_trip() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let config = watch(123456, &[507, 117986]);
        db.upsert_user(&config).await.unwrap();

        let observed_at = Utc.with_ymd_and_hms(2024, 9, 5, 10, 0, 0).unwrap();
        let state = WarehouseState::new(3.0, observed_at);
        db.upsert_states(UserId(123456), &[(WarehouseId(507), state)])
            .await
            .unwrap();

        let loaded = db.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].config, config);
        assert_eq!(loaded[0].states.get(&WarehouseId(507)), Some(&state));
    }

    #[tokio::test]
    async fn test_user_without_credential() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let config = WatchConfig::new(UserId(-100));
        db.upsert_user(&config).await.unwrap();

        let loaded = db.load_all().await.unwrap();
        assert_eq!(loaded[0].config, config);
        assert!(loaded[0].config.credential.is_none());
    }

    #[tokio::test]
    async fn test_states_only_for_watched_warehouses() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db.upsert_user(&watch(1, &[1])).await.unwrap();

        let now = Utc::now();
        let written = db
            .upsert_states(
                UserId(1),
                &[
                    (WarehouseId(1), WarehouseState::new(1.0, now)),
                    (WarehouseId(2), WarehouseState::new(2.0, now)),
                ],
            )
            .await
            .unwrap();
        assert_eq!(written, 1);
    }

    #[tokio::test]
    async fn test_removing_warehouse_drops_state() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db.upsert_user(&watch(1, &[1, 2])).await.unwrap();
        let now = Utc::now();
        db.upsert_states(
            UserId(1),
            &[
                (WarehouseId(1), WarehouseState::new(1.0, now)),
                (WarehouseId(2), WarehouseState::new(2.0, now)),
            ],
        )
        .await
        .unwrap();

        db.upsert_user(&watch(1, &[2])).await.unwrap();

        let loaded = db.load_all().await.unwrap();
        let states: Vec<_> = loaded[0].states.keys().copied().collect();
        assert_eq!(states, vec![WarehouseId(2)]);
    }

    #[tokio::test]
    async fn test_state_upsert_overwrites() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db.upsert_user(&watch(1, &[1])).await.unwrap();
        let t0 = Utc.with_ymd_and_hms(2024, 9, 5, 10, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 9, 5, 10, 5, 0).unwrap();

        db.upsert_states(UserId(1), &[(WarehouseId(1), WarehouseState::new(8.0, t0))])
            .await
            .unwrap();
        db.upsert_states(UserId(1), &[(WarehouseId(1), WarehouseState::new(4.0, t1))])
            .await
            .unwrap();

        let loaded = db.load_all().await.unwrap();
        assert_eq!(loaded[0].states[&WarehouseId(1)], WarehouseState::new(4.0, t1));
    }

    #[tokio::test]
    async fn test_delete_user() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db.upsert_user(&watch(1, &[1])).await.unwrap();
        db.upsert_user(&watch(2, &[1])).await.unwrap();
        db.upsert_states(UserId(1), &[(WarehouseId(1), WarehouseState::new(1.0, Utc::now()))])
            .await
            .unwrap();

        db.delete_user(UserId(1)).await.unwrap();

        let loaded = db.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].config.user, UserId(2));
    }

    #[tokio::test]
    async fn test_warehouse_catalog() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        db.upsert_warehouses(&[
            Warehouse { id: WarehouseId(507), name: "Коледино".into() },
            Warehouse { id: WarehouseId(117986), name: "Казань".into() },
        ])
        .await
        .unwrap();
        db.upsert_warehouses(&[Warehouse { id: WarehouseId(507), name: "Коледино КБТ".into() }])
            .await
            .unwrap();

        let catalog = db.get_warehouses().await.unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog[0].name.as_str(), "Коледино КБТ");
    }

    #[tokio::test]
    async fn test_invalid_stored_interval_is_reported() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        sqlx::query("INSERT INTO users (chat_id, polling_minutes) VALUES (1, 0)")
            .execute(&db.pool)
            .await
            .unwrap();

        let err = db.load_all().await.unwrap_err();
        assert!(matches!(err, DbError::Invalid { user: 1, .. }));
        assert!(matches!(StoreError::from(err), StoreError::Corrupt(_)));
    }
}
