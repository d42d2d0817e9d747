use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, Row};

use crate::db::{
    connection::Database,
    helpers::{format_datetime, parse_datetime},
    models::{MetricSample, NewBlinkEvent, NewMetricSample},
};

use super::blink_events::insert_blink_event_row;

pub(crate) const METRIC_COLUMNS: &str = "id, user_id, timestamp, cpu_percent, memory_percent, \
     memory_used_mb, disk_usage_percent, network_available, battery_percent, power_connected, synced";

pub(crate) fn row_to_metric_sample(row: &Row) -> Result<MetricSample> {
    let timestamp: String = row.get("timestamp")?;
    let network_available: i64 = row.get("network_available")?;
    let power_connected: Option<i64> = row.get("power_connected")?;
    let synced: i64 = row.get("synced")?;

    Ok(MetricSample {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        timestamp: parse_datetime(&timestamp, "timestamp")?,
        cpu_percent: row.get("cpu_percent")?,
        memory_percent: row.get("memory_percent")?,
        memory_used_mb: row.get("memory_used_mb")?,
        disk_usage_percent: row.get("disk_usage_percent")?,
        network_available: network_available != 0,
        battery_percent: row.get("battery_percent")?,
        power_connected: power_connected.map(|value| value != 0),
        synced: synced != 0,
    })
}

fn insert_metric_sample_row(conn: &Connection, sample: &NewMetricSample) -> Result<i64> {
    conn.execute(
        "INSERT INTO metric_samples (
            user_id,
            timestamp,
            cpu_percent,
            memory_percent,
            memory_used_mb,
            disk_usage_percent,
            network_available,
            battery_percent,
            power_connected,
            created_at,
            synced
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0)",
        params![
            sample.user_id,
            format_datetime(&sample.timestamp),
            sample.cpu_percent,
            sample.memory_percent,
            sample.memory_used_mb,
            sample.disk_usage_percent,
            sample.network_available as i64,
            sample.battery_percent,
            sample.power_connected.map(|value| value as i64),
            format_datetime(&Utc::now()),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

impl Database {
    pub async fn insert_metric_sample(&self, sample: &NewMetricSample) -> Result<i64> {
        let record = sample.clone();
        self.execute(move |conn| insert_metric_sample_row(conn, &record))
            .await
    }

    /// Appends buffered blink events and metric samples in one transaction.
    pub async fn insert_pending(
        &self,
        blink_events: Vec<NewBlinkEvent>,
        metric_samples: Vec<NewMetricSample>,
    ) -> Result<usize> {
        if blink_events.is_empty() && metric_samples.is_empty() {
            return Ok(0);
        }

        self.execute(move |conn| {
            let tx = conn
                .transaction()
                .context("failed to open flush transaction")?;
            for event in &blink_events {
                insert_blink_event_row(&tx, event)?;
            }
            for sample in &metric_samples {
                insert_metric_sample_row(&tx, sample)?;
            }
            tx.commit().context("failed to commit flush")?;
            Ok(blink_events.len() + metric_samples.len())
        })
        .await
    }

    pub async fn list_metric_samples(&self, user_id: &str, limit: usize) -> Result<Vec<MetricSample>> {
        let user_id = user_id.to_string();
        let limit = limit as i64;
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {METRIC_COLUMNS}
                 FROM metric_samples
                 WHERE user_id = ?1
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?2"
            ))?;

            let mut rows = stmt.query(params![user_id, limit])?;
            let mut samples = Vec::new();
            while let Some(row) = rows.next()? {
                samples.push(row_to_metric_sample(row)?);
            }

            Ok(samples)
        })
        .await
    }
}
