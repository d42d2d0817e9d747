use anyhow::Result;
use chrono::Utc;
use log::info;
use rusqlite::params;

use crate::db::{
    connection::Database,
    helpers::{days_before, format_datetime, to_u64},
    models::{DatabaseStats, UsageStats},
};

use super::sync::count_unsynced_rows;

impl Database {
    /// Session and host aggregates for `user_id` over the last `days` days.
    pub async fn stats(&self, user_id: &str, days: u32) -> Result<UsageStats> {
        let user_id = user_id.to_string();
        self.execute(move |conn| {
            let cutoff = format_datetime(&days_before(Utc::now(), days));

            let (session_count, avg_blinks, avg_bpm, high_strain): (i64, Option<f64>, Option<f64>, Option<i64>) =
                conn.query_row(
                    "SELECT
                        COUNT(*),
                        AVG(total_blinks),
                        AVG(blinks_per_minute),
                        SUM(CASE WHEN strain_level = 'high' THEN 1 ELSE 0 END)
                     FROM eye_sessions
                     WHERE user_id = ?1 AND start_time >= ?2",
                    params![user_id, cutoff],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )?;

            let (avg_cpu, avg_memory): (Option<f64>, Option<f64>) = conn.query_row(
                "SELECT AVG(cpu_percent), AVG(memory_percent)
                 FROM metric_samples
                 WHERE user_id = ?1 AND timestamp >= ?2",
                params![user_id, cutoff],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;

            Ok(UsageStats {
                session_count: to_u64(session_count, "session_count")?,
                avg_blinks: avg_blinks.unwrap_or(0.0),
                avg_bpm: avg_bpm.unwrap_or(0.0),
                high_strain_sessions: to_u64(high_strain.unwrap_or(0), "high_strain_sessions")?,
                avg_cpu: avg_cpu.unwrap_or(0.0),
                avg_memory: avg_memory.unwrap_or(0.0),
            })
        })
        .await
    }

    pub async fn database_stats(&self) -> Result<DatabaseStats> {
        let mut stats = self
            .execute(|conn| {
                let count = |table: &str| -> Result<u64> {
                    let value: i64 = conn.query_row(
                        &format!("SELECT COUNT(*) FROM {table}"),
                        [],
                        |row| row.get(0),
                    )?;
                    to_u64(value, table)
                };

                Ok(DatabaseStats {
                    total_sessions: count("eye_sessions")?,
                    total_metrics: count("metric_samples")?,
                    total_blinks: count("blink_events")?,
                    unsynced_count: count_unsynced_rows(conn)?,
                    last_sync: None,
                    database_size_bytes: 0,
                })
            })
            .await?;

        stats.last_sync = self.last_successful_sync().await?;
        stats.database_size_bytes = std::fs::metadata(self.path())
            .map(|meta| meta.len())
            .unwrap_or(0);
        Ok(stats)
    }

    /// Deletes synced samples and blink events older than `days`. Unsynced
    /// rows and the sync log are never removed.
    pub async fn purge_synced_before(&self, days: u32) -> Result<u64> {
        self.execute(move |conn| {
            let cutoff = format_datetime(&days_before(Utc::now(), days));
            let tx = conn.transaction()?;

            let samples = tx.execute(
                "DELETE FROM metric_samples WHERE synced = 1 AND timestamp < ?1",
                params![cutoff],
            )?;
            let blinks = tx.execute(
                "DELETE FROM blink_events WHERE synced = 1 AND timestamp < ?1",
                params![cutoff],
            )?;
            tx.commit()?;

            let removed = (samples + blinks) as u64;
            if removed > 0 {
                info!("Retention purge removed {samples} samples and {blinks} blink events");
            }
            Ok(removed)
        })
        .await
    }
}
