//! SQLite-backed `Repository` implementation.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;

use crate::error::LedgerError;
use crate::ledger::models::{PendingMessage, ProcessedFile, SyncedFolder};
use crate::ledger::repository::Repository;
use crate::ledger::schema::CREATE_TABLES;

/// Ledger store backed by a single SQLite database file.
///
/// Concurrent inserts/updates serialize at the pool; `record_processed_file`
/// relies on the `(date_folder, filename)` primary key to arbitrate races
/// between a watcher event and a rescan hitting the same file (§5).
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    /// Open (creating if absent) the ledger database at `path` and apply
    /// the schema.
    pub async fn open(path: &Path) -> Result<Self, LedgerError> {
        let options = SqliteConnectOptions::from_str(&path.to_string_lossy())
            .map_err(sqlx::Error::from)?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::query(CREATE_TABLES).execute(&pool).await?;

        Ok(Self { pool })
    }

    /// In-memory ledger for tests — a fresh, empty database per call.
    pub async fn open_in_memory() -> Result<Self, LedgerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::query(CREATE_TABLES).execute(&pool).await?;
        Ok(Self { pool })
    }

    fn row_to_pending(row: &sqlx::sqlite::SqliteRow) -> PendingMessage {
        PendingMessage {
            id: row.get("id"),
            topic: row.get("topic"),
            payload: row.get("payload"),
            timestamp: parse_ts(row.get("timestamp")),
            sent: row.get::<i64, _>("sent") != 0,
            retry_count: row.get("retry_count"),
            connection_state: row.get::<i64, _>("connection_state") != 0,
            processing: row.get::<i64, _>("processing") != 0,
        }
    }
}

fn parse_ts(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc.timestamp_opt(0, 0).single().unwrap_or_default())
}

#[async_trait]
impl Repository for SqliteLedger {
    async fn insert_pending(
        &self,
        topic: &str,
        payload: &[u8],
        connection_state: bool,
    ) -> Result<i64, LedgerError> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "INSERT INTO pending_message (topic, payload, timestamp, sent, retry_count, connection_state, processing)
             VALUES (?, ?, ?, 0, 0, ?, 0)",
        )
        .bind(topic)
        .bind(payload)
        .bind(&now)
        .bind(connection_state as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn get_pending_batch(&self, limit: i64) -> Result<Vec<PendingMessage>, LedgerError> {
        let rows = sqlx::query(
            "SELECT * FROM pending_message WHERE sent = 0 AND processing = 0 ORDER BY id ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(Self::row_to_pending).collect())
    }

    async fn mark_processing(&self, id: i64) -> Result<Option<PendingMessage>, LedgerError> {
        let result = sqlx::query(
            "UPDATE pending_message SET processing = 1 WHERE id = ? AND processing = 0 AND sent = 0",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        let row = sqlx::query("SELECT * FROM pending_message WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| Self::row_to_pending(&r)))
    }

    async fn mark_sent(&self, id: i64) -> Result<(), LedgerError> {
        sqlx::query("UPDATE pending_message SET sent = 1, processing = 0 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_pending(&self, id: i64) -> Result<Option<PendingMessage>, LedgerError> {
        let row = sqlx::query("SELECT * FROM pending_message WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Self::row_to_pending(&r)))
    }

    async fn reset_processing(&self) -> Result<u64, LedgerError> {
        let result = sqlx::query("UPDATE pending_message SET processing = 0 WHERE processing = 1")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count_pending(&self) -> Result<i64, LedgerError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM pending_message WHERE sent = 0")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }

    async fn has_old_pending(&self, older_than: DateTime<Utc>) -> Result<bool, LedgerError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM pending_message WHERE sent = 0 AND timestamp < ?",
        )
        .bind(older_than.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.get("n");
        Ok(n > 0)
    }

    async fn record_processed_file_and_enqueue(
        &self,
        folder: &str,
        filename: &str,
        data_json: &str,
        topic: &str,
        payload: &[u8],
        connection_state: bool,
    ) -> Result<i64, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now().to_rfc3339();

        let insert_result = sqlx::query(
            "INSERT INTO processed_file (date_folder, filename, data_json, processed_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(folder)
        .bind(filename)
        .bind(data_json)
        .bind(&now)
        .execute(&mut *tx)
        .await;

        if let Err(sqlx::Error::Database(db_err)) = &insert_result {
            if db_err.is_unique_violation() {
                tx.rollback().await.ok();
                return Err(LedgerError::Duplicate {
                    folder: folder.to_string(),
                    filename: filename.to_string(),
                });
            }
        }
        insert_result?;

        let pending_result = sqlx::query(
            "INSERT INTO pending_message (topic, payload, timestamp, sent, retry_count, connection_state, processing)
             VALUES (?, ?, ?, 0, 0, ?, 0)",
        )
        .bind(topic)
        .bind(payload)
        .bind(&now)
        .bind(connection_state as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(pending_result.last_insert_rowid())
    }

    async fn is_file_processed(&self, folder: &str, filename: &str) -> Result<bool, LedgerError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM processed_file WHERE date_folder = ? AND filename = ?",
        )
        .bind(folder)
        .bind(filename)
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.get("n");
        Ok(n > 0)
    }

    async fn upsert_synced_folder(
        &self,
        folder: &str,
        total_files: i64,
        fully_synced: bool,
    ) -> Result<(), LedgerError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO synced_folder (folder_name, last_checked, fully_synced, total_files)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(folder_name) DO UPDATE SET
                last_checked = excluded.last_checked,
                fully_synced = excluded.fully_synced,
                total_files = excluded.total_files",
        )
        .bind(folder)
        .bind(&now)
        .bind(fully_synced as i64)
        .bind(total_files)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_synced_folders(&self) -> Result<Vec<SyncedFolder>, LedgerError> {
        let rows = sqlx::query("SELECT * FROM synced_folder ORDER BY folder_name ASC")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|row| SyncedFolder {
                folder_name: row.get("folder_name"),
                last_checked: parse_ts(row.get("last_checked")),
                fully_synced: row.get::<i64, _>("fully_synced") != 0,
                total_files: row.get("total_files"),
            })
            .collect())
    }

    async fn get_processed_file(
        &self,
        folder: &str,
        filename: &str,
    ) -> Result<Option<ProcessedFile>, LedgerError> {
        let row = sqlx::query(
            "SELECT * FROM processed_file WHERE date_folder = ? AND filename = ?",
        )
        .bind(folder)
        .bind(filename)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| ProcessedFile {
            date_folder: row.get("date_folder"),
            filename: row.get("filename"),
            data_json: row.get("data_json"),
            processed_at: parse_ts(row.get("processed_at")),
        }))
    }

    async fn find_pending_by_payload_substring(
        &self,
        needle: &str,
    ) -> Result<Vec<PendingMessage>, LedgerError> {
        let pattern = format!("%{needle}%");
        let rows = sqlx::query(
            "SELECT * FROM pending_message WHERE CAST(payload AS TEXT) LIKE ? ORDER BY id ASC",
        )
        .bind(pattern)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(Self::row_to_pending).collect())
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, LedgerError> {
        let row = sqlx::query("SELECT value FROM setting WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("value")))
    }

    async fn list_processed_filenames(&self, folder: &str) -> Result<Vec<String>, LedgerError> {
        let rows = sqlx::query("SELECT filename FROM processed_file WHERE date_folder = ?")
            .bind(folder)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get("filename")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_and_fetch_pending_round_trips() {
        let ledger = SqliteLedger::open_in_memory().await.unwrap();
        let id = ledger
            .insert_pending("jarvist/data/20240115", b"payload", true)
            .await
            .unwrap();

        let row = ledger.get_pending(id).await.unwrap().unwrap();
        assert_eq!(row.topic, "jarvist/data/20240115");
        assert_eq!(row.payload, b"payload");
        assert!(!row.sent);
        assert!(!row.processing);
    }

    #[tokio::test]
    async fn mark_processing_is_a_one_shot_lease() {
        let ledger = SqliteLedger::open_in_memory().await.unwrap();
        let id = ledger.insert_pending("t", b"p", false).await.unwrap();

        let first = ledger.mark_processing(id).await.unwrap();
        assert!(first.is_some());

        let second = ledger.mark_processing(id).await.unwrap();
        assert!(second.is_none(), "lease must not be granted twice");
    }

    #[tokio::test]
    async fn mark_sent_is_terminal() {
        let ledger = SqliteLedger::open_in_memory().await.unwrap();
        let id = ledger.insert_pending("t", b"p", false).await.unwrap();
        ledger.mark_sent(id).await.unwrap();

        let row = ledger.get_pending(id).await.unwrap().unwrap();
        assert!(row.sent);
        assert!(!row.processing);
        assert_eq!(ledger.count_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reset_processing_clears_all_leases() {
        let ledger = SqliteLedger::open_in_memory().await.unwrap();
        let a = ledger.insert_pending("t", b"a", false).await.unwrap();
        let b = ledger.insert_pending("t", b"b", false).await.unwrap();
        ledger.mark_processing(a).await.unwrap();
        ledger.mark_processing(b).await.unwrap();

        let reset = ledger.reset_processing().await.unwrap();
        assert_eq!(reset, 2);

        assert!(ledger.get_pending(a).await.unwrap().unwrap().processing == false);
    }

    #[tokio::test]
    async fn record_processed_file_is_transactional_with_enqueue() {
        let ledger = SqliteLedger::open_in_memory().await.unwrap();
        let id = ledger
            .record_processed_file_and_enqueue(
                "20240115",
                "20240115/evt1.json.bson",
                "{}",
                "jarvist/data/20240115",
                b"envelope",
                true,
            )
            .await
            .unwrap();

        assert!(ledger.is_file_processed("20240115", "20240115/evt1.json.bson").await.unwrap());
        let pending = ledger.get_pending(id).await.unwrap().unwrap();
        assert_eq!(pending.payload, b"envelope");
    }

    #[tokio::test]
    async fn duplicate_processed_file_is_reported_distinctly() {
        let ledger = SqliteLedger::open_in_memory().await.unwrap();
        ledger
            .record_processed_file_and_enqueue("20240115", "a.json.bson", "{}", "t", b"p", false)
            .await
            .unwrap();

        let second = ledger
            .record_processed_file_and_enqueue("20240115", "a.json.bson", "{}", "t", b"p", false)
            .await;

        assert!(matches!(second, Err(LedgerError::Duplicate { .. })));
        // The losing attempt must not have left a second pending_message row.
        assert_eq!(ledger.count_pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn synced_folder_upsert_overwrites() {
        let ledger = SqliteLedger::open_in_memory().await.unwrap();
        ledger.upsert_synced_folder("20240115", 3, false).await.unwrap();
        ledger.upsert_synced_folder("20240115", 3, true).await.unwrap();

        let folders = ledger.list_synced_folders().await.unwrap();
        assert_eq!(folders.len(), 1);
        assert!(folders[0].fully_synced);
        assert_eq!(folders[0].total_files, 3);
    }
}
