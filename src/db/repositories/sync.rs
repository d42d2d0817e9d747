use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use crate::db::{
    connection::Database,
    helpers::{format_datetime, parse_datetime, to_i64, to_u64},
    models::{SyncLogEntry, UnsyncedRecords},
};

use super::{
    blink_events::{row_to_blink_event, BLINK_COLUMNS},
    metric_samples::{row_to_metric_sample, METRIC_COLUMNS},
    sessions::{row_to_session, SESSION_COLUMNS},
};

const SYNCED_TABLES: [&str; 3] = ["eye_sessions", "metric_samples", "blink_events"];

pub(crate) fn count_unsynced_rows(conn: &Connection) -> Result<u64> {
    let mut total = 0;
    for table in SYNCED_TABLES {
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {table} WHERE synced = 0"),
            [],
            |row| row.get(0),
        )?;
        total += to_u64(count, table)?;
    }
    Ok(total)
}

fn row_to_sync_log(row: &Row) -> Result<SyncLogEntry> {
    let sync_time: String = row.get("sync_time")?;
    let records_synced: i64 = row.get("records_synced")?;
    let success: i64 = row.get("success")?;

    Ok(SyncLogEntry {
        id: row.get("id")?,
        sync_time: parse_datetime(&sync_time, "sync_time")?,
        records_synced: to_u64(records_synced, "records_synced")?,
        success: success != 0,
        error_message: row.get("error_message")?,
    })
}

fn mark_ids_synced(conn: &Connection, table: &str, ids: &[i64]) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }
    let mut stmt = conn.prepare(&format!(
        "UPDATE {table} SET synced = 1 WHERE id = ?1 AND synced = 0"
    ))?;
    let mut changed = 0;
    for id in ids {
        changed += stmt.execute(params![id])? as u64;
    }
    Ok(changed)
}

impl Database {
    /// Unsynced rows across sessions, metric samples and blink events.
    pub async fn count_unsynced(&self) -> Result<u64> {
        self.execute(|conn| count_unsynced_rows(conn)).await
    }

    /// Snapshot of every currently unsynced row, read in one transaction.
    pub async fn collect_unsynced(&self) -> Result<UnsyncedRecords> {
        self.execute(|conn| {
            let tx = conn.transaction()?;
            let mut records = UnsyncedRecords::default();

            {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {SESSION_COLUMNS} FROM eye_sessions WHERE synced = 0 ORDER BY id"
                ))?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    records.sessions.push(row_to_session(row)?);
                }
            }
            {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {METRIC_COLUMNS} FROM metric_samples WHERE synced = 0 ORDER BY id"
                ))?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    records.metric_samples.push(row_to_metric_sample(row)?);
                }
            }
            {
                let mut stmt = tx.prepare(&format!(
                    "SELECT {BLINK_COLUMNS} FROM blink_events WHERE synced = 0 ORDER BY id"
                ))?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    records.blink_events.push(row_to_blink_event(row)?);
                }
            }

            tx.commit()?;
            Ok(records)
        })
        .await
    }

    /// Flips `synced` only on the rows contained in `records`. Rows inserted
    /// after the snapshot was taken stay unsynced.
    pub async fn mark_batch_synced(&self, records: &UnsyncedRecords) -> Result<u64> {
        let session_ids: Vec<i64> = records.sessions.iter().map(|s| s.id).collect();
        let sample_ids: Vec<i64> = records.metric_samples.iter().map(|s| s.id).collect();
        let blink_ids: Vec<i64> = records.blink_events.iter().map(|b| b.id).collect();

        self.execute(move |conn| {
            let tx = conn
                .transaction()
                .context("failed to open mark-synced transaction")?;
            let changed = mark_ids_synced(&tx, "eye_sessions", &session_ids)?
                + mark_ids_synced(&tx, "metric_samples", &sample_ids)?
                + mark_ids_synced(&tx, "blink_events", &blink_ids)?;
            tx.commit().context("failed to commit mark-synced")?;
            Ok(changed)
        })
        .await
    }

    /// Flips `synced` on every row that is unsynced when the transaction runs.
    pub async fn mark_all_synced(&self) -> Result<u64> {
        self.execute(|conn| {
            let tx = conn
                .transaction()
                .context("failed to open mark-synced transaction")?;
            let mut changed = 0;
            for table in SYNCED_TABLES {
                changed += tx.execute(
                    &format!("UPDATE {table} SET synced = 1 WHERE synced = 0"),
                    [],
                )? as u64;
            }
            tx.commit().context("failed to commit mark-synced")?;
            Ok(changed)
        })
        .await
    }

    pub async fn append_sync_log(
        &self,
        records_synced: u64,
        success: bool,
        error_message: Option<String>,
    ) -> Result<i64> {
        self.execute(move |conn| {
            let now = format_datetime(&Utc::now());
            conn.execute(
                "INSERT INTO sync_log (sync_time, records_synced, success, error_message, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    now,
                    to_i64(records_synced)?,
                    success as i64,
                    error_message,
                    now,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Newest first.
    pub async fn recent_sync_log(&self, limit: usize) -> Result<Vec<SyncLogEntry>> {
        let limit = limit as i64;
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sync_time, records_synced, success, error_message
                 FROM sync_log
                 ORDER BY id DESC
                 LIMIT ?1",
            )?;

            let mut rows = stmt.query(params![limit])?;
            let mut entries = Vec::new();
            while let Some(row) = rows.next()? {
                entries.push(row_to_sync_log(row)?);
            }

            Ok(entries)
        })
        .await
    }

    pub async fn last_successful_sync(&self) -> Result<Option<DateTime<Utc>>> {
        self.execute(|conn| {
            let value: Option<String> = conn.query_row(
                "SELECT MAX(sync_time) FROM sync_log WHERE success = 1",
                [],
                |row| row.get(0),
            )?;
            value
                .map(|raw| parse_datetime(&raw, "sync_time"))
                .transpose()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{
        test_support::{metric_sample, temp_database},
        NewBlinkEvent,
    };

    async fn insert_samples(db: &Database, n: usize) {
        for i in 0..n {
            db.insert_metric_sample(&metric_sample("u1", i as f64))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn unsynced_count_tracks_inserts_and_marks() {
        let (_dir, db) = temp_database();
        insert_samples(&db, 4).await;
        assert_eq!(db.count_unsynced().await.unwrap(), 4);

        assert_eq!(db.mark_all_synced().await.unwrap(), 4);
        assert_eq!(db.count_unsynced().await.unwrap(), 0);

        insert_samples(&db, 1).await;
        assert_eq!(db.count_unsynced().await.unwrap(), 1);
        // Already-synced rows are not touched again.
        assert_eq!(db.mark_all_synced().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn batch_marking_leaves_later_rows_unsynced() {
        let (_dir, db) = temp_database();
        let session_id = db.open_session("u1").await.unwrap();
        insert_samples(&db, 2).await;
        db.insert_blink_event(&NewBlinkEvent {
            user_id: "u1".into(),
            session_id: Some(session_id),
            timestamp: Utc::now(),
        })
        .await
        .unwrap();

        let batch = db.collect_unsynced().await.unwrap();
        assert_eq!(batch.sessions.len(), 1);
        assert_eq!(batch.metric_samples.len(), 2);
        assert_eq!(batch.blink_events.len(), 1);

        // Arrives while the batch is in flight.
        insert_samples(&db, 1).await;

        assert_eq!(db.mark_batch_synced(&batch).await.unwrap(), 4);
        assert_eq!(db.count_unsynced().await.unwrap(), 1);
        assert_eq!(db.mark_batch_synced(&batch).await.unwrap(), 0);

        let session = db.get_session(session_id).await.unwrap().unwrap();
        assert!(session.synced);
    }

    #[tokio::test]
    async fn sync_log_is_append_only_and_newest_first() {
        let (_dir, db) = temp_database();
        assert!(db.last_successful_sync().await.unwrap().is_none());

        db.append_sync_log(3, true, None).await.unwrap();
        db.append_sync_log(5, false, Some("endpoint unreachable".into()))
            .await
            .unwrap();

        let log = db.recent_sync_log(10).await.unwrap();
        assert_eq!(log.len(), 2);
        assert!(!log[0].success);
        assert_eq!(log[0].records_synced, 5);
        assert_eq!(log[0].error_message.as_deref(), Some("endpoint unreachable"));
        assert!(log[1].success);
        assert_eq!(
            db.last_successful_sync().await.unwrap(),
            Some(log[1].sync_time)
        );
    }
}
