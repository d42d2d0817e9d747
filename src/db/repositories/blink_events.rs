use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, Connection, Row};

use crate::db::{
    connection::Database,
    helpers::{format_datetime, parse_datetime},
    models::{BlinkEvent, NewBlinkEvent},
};

pub(crate) const BLINK_COLUMNS: &str = "id, user_id, session_id, timestamp, synced";

pub(crate) fn row_to_blink_event(row: &Row) -> Result<BlinkEvent> {
    let timestamp: String = row.get("timestamp")?;
    let synced: i64 = row.get("synced")?;

    Ok(BlinkEvent {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        session_id: row.get("session_id")?,
        timestamp: parse_datetime(&timestamp, "timestamp")?,
        synced: synced != 0,
    })
}

pub(crate) fn insert_blink_event_row(conn: &Connection, event: &NewBlinkEvent) -> Result<i64> {
    conn.execute(
        "INSERT INTO blink_events (user_id, session_id, timestamp, created_at, synced)
         VALUES (?1, ?2, ?3, ?4, 0)",
        params![
            event.user_id,
            event.session_id,
            format_datetime(&event.timestamp),
            format_datetime(&Utc::now()),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

impl Database {
    pub async fn insert_blink_event(&self, event: &NewBlinkEvent) -> Result<i64> {
        let record = event.clone();
        self.execute(move |conn| insert_blink_event_row(conn, &record))
            .await
    }

    pub async fn get_blink_events_for_session(&self, session_id: i64) -> Result<Vec<BlinkEvent>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {BLINK_COLUMNS}
                 FROM blink_events
                 WHERE session_id = ?1
                 ORDER BY timestamp ASC, id ASC"
            ))?;

            let mut rows = stmt.query(params![session_id])?;
            let mut events = Vec::new();
            while let Some(row) = rows.next()? {
                events.push(row_to_blink_event(row)?);
            }

            Ok(events)
        })
        .await
    }
}
