use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use log::{info, warn};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::db::{
    connection::Database,
    helpers::{format_datetime, parse_datetime, parse_optional_datetime, parse_strain, to_i64, to_u64},
    models::{blinks_per_minute, Session, StrainLevel},
};

pub(crate) const SESSION_COLUMNS: &str =
    "id, user_id, start_time, end_time, total_blinks, blinks_per_minute, strain_level, synced";

pub(crate) fn row_to_session(row: &Row) -> Result<Session> {
    let start_time: String = row.get("start_time")?;
    let end_time: Option<String> = row.get("end_time")?;
    let total_blinks: i64 = row.get("total_blinks")?;
    let strain_level: String = row.get("strain_level")?;
    let synced: i64 = row.get("synced")?;

    Ok(Session {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        start_time: parse_datetime(&start_time, "start_time")?,
        end_time: parse_optional_datetime(end_time, "end_time")?,
        total_blinks: to_u64(total_blinks, "total_blinks")?,
        blinks_per_minute: row.get("blinks_per_minute")?,
        strain_level: parse_strain(&strain_level)?,
        synced: synced != 0,
    })
}

fn finalize_session(
    conn: &Connection,
    session_id: i64,
    end_time: DateTime<Utc>,
    total_blinks: u64,
    blinks_per_minute: f64,
) -> Result<usize> {
    let strain = StrainLevel::from_bpm(blinks_per_minute);
    let updated = conn.execute(
        "UPDATE eye_sessions
         SET end_time = ?1,
             total_blinks = ?2,
             blinks_per_minute = ?3,
             strain_level = ?4
         WHERE id = ?5 AND end_time IS NULL",
        params![
            format_datetime(&end_time),
            to_i64(total_blinks)?,
            blinks_per_minute,
            strain.as_str(),
            session_id,
        ],
    )?;
    Ok(updated)
}

impl Database {
    pub async fn open_session(&self, user_id: &str) -> Result<i64> {
        let user_id = user_id.to_string();
        self.execute(move |conn| {
            let now = format_datetime(&Utc::now());
            conn.execute(
                "INSERT INTO eye_sessions (user_id, start_time, created_at, synced)
                 VALUES (?1, ?2, ?3, 0)",
                params![user_id, now, now],
            )?;
            let session_id = conn.last_insert_rowid();
            info!("Opened session {session_id} for user {user_id}");
            Ok(session_id)
        })
        .await
    }

    /// Writes the session summary. Returns `false` when the session had
    /// already been closed; the first summary wins.
    pub async fn close_session(
        &self,
        session_id: i64,
        total_blinks: u64,
        blinks_per_minute: f64,
    ) -> Result<bool> {
        self.execute(move |conn| {
            let tx = conn.transaction()?;

            let existing: Option<(String, Option<String>)> = tx
                .query_row(
                    "SELECT start_time, end_time FROM eye_sessions WHERE id = ?1",
                    params![session_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let Some((start_time, end_time)) = existing else {
                bail!("session {session_id} not found");
            };

            if end_time.is_some() {
                warn!("Session {session_id} already closed; keeping the first summary");
                return Ok(false);
            }

            let start_time = parse_datetime(&start_time, "start_time")?;
            let end_time = Utc::now().max(start_time);
            finalize_session(&tx, session_id, end_time, total_blinks, blinks_per_minute)?;
            tx.commit()?;

            info!(
                "Closed session {session_id}: {total_blinks} blinks, {blinks_per_minute:.1} bpm ({})",
                StrainLevel::from_bpm(blinks_per_minute).as_str()
            );
            Ok(true)
        })
        .await
    }

    pub async fn get_session(&self, session_id: i64) -> Result<Option<Session>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM eye_sessions WHERE id = ?1"
            ))?;

            let mut rows = stmt.query(params![session_id])?;
            let session = match rows.next()? {
                Some(row) => Some(row_to_session(row)?),
                None => None,
            };
            Ok(session)
        })
        .await
    }

    pub async fn list_sessions(&self, user_id: &str, limit: usize) -> Result<Vec<Session>> {
        let user_id = user_id.to_string();
        let limit = limit as i64;
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS}
                 FROM eye_sessions
                 WHERE user_id = ?1
                 ORDER BY start_time DESC, id DESC
                 LIMIT ?2"
            ))?;

            let mut rows = stmt.query(params![user_id, limit])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }

            Ok(sessions)
        })
        .await
    }

    /// Closes sessions a previous process left open. The summary is rebuilt
    /// from the session's persisted blink events, ending at its last blink.
    pub async fn recover_open_sessions(&self) -> Result<usize> {
        self.execute(|conn| {
            let tx = conn.transaction()?;

            let orphans = {
                let mut stmt = tx.prepare(
                    "SELECT s.id, s.start_time, COUNT(b.id), MAX(b.timestamp)
                     FROM eye_sessions s
                     LEFT JOIN blink_events b ON b.session_id = s.id
                     WHERE s.end_time IS NULL
                     GROUP BY s.id",
                )?;
                let mut rows = stmt.query([])?;
                let mut orphans = Vec::new();
                while let Some(row) = rows.next()? {
                    let id: i64 = row.get(0)?;
                    let start = parse_datetime(&row.get::<_, String>(1)?, "start_time")?;
                    let total = to_u64(row.get::<_, i64>(2)?, "blink count")?;
                    let last_blink =
                        parse_optional_datetime(row.get::<_, Option<String>>(3)?, "timestamp")?;
                    orphans.push((id, start, total, last_blink));
                }
                orphans
            };

            for (id, start, total, last_blink) in &orphans {
                let end = last_blink.unwrap_or(*start).max(*start);
                let bpm = blinks_per_minute(*total, *start, end);
                finalize_session(&tx, *id, end, *total, bpm)?;
                warn!("Recovered open session {id}: {total} blinks, {bpm:.1} bpm");
            }

            tx.commit()?;
            Ok(orphans.len())
        })
        .await
    }
}
