use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};

use crate::reading::{ErrorKind, QueuedReading, ReadingStatus};

#[derive(Debug)]
pub struct DB {
    conn: Connection,
}

impl DB {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let conn = Connection::open(path.as_ref()).with_context(|| {
            format!("Failed to open database file {}", path.as_ref().display())
        })?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, anyhow::Error> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Ok(Self { conn })
    }

    pub fn init(&self) -> Result<(), anyhow::Error> {
        self.conn
            .execute_batch(
                r"
                CREATE TABLE IF NOT EXISTS queued_readings (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL UNIQUE,
                    kind TEXT NOT NULL,
                    original_reading_id TEXT,
                    project_id TEXT NOT NULL,
                    room_id TEXT NOT NULL,
                    date TEXT NOT NULL,
                    temperature REAL NOT NULL,
                    humidity REAL NOT NULL,
                    created_at TEXT NOT NULL,
                    status TEXT NOT NULL,
                    retry_count INTEGER NOT NULL,
                    error TEXT,
                    error_kind TEXT,
                    last_attempt_at TEXT
                );
                ",
            )
            .context("Failed to create table")?;
        Ok(())
    }

    pub fn insert(&self, data: &QueuedReading) -> Result<(), anyhow::Error> {
        self.conn
            .execute(
                r"
                INSERT INTO queued_readings (
                    id, kind, original_reading_id, project_id, room_id, date,
                    temperature, humidity, created_at, status, retry_count,
                    error, error_kind, last_attempt_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                rusqlite::params![
                    data.id,
                    data.kind.as_str(),
                    data.original_reading_id,
                    data.project_id,
                    data.room_id,
                    data.date.to_rfc3339(),
                    data.temperature,
                    data.humidity,
                    data.created_at.to_rfc3339(),
                    data.status.as_str(),
                    data.retry_count,
                    data.error,
                    data.error_kind.map(|kind| kind.as_str()),
                    data.last_attempt_at.map(|at| at.to_rfc3339()),
                ],
            )
            .with_context(|| format!("Failed to store reading {}", data.id))?;
        Ok(())
    }

    /// Stores the status fields of `data` if the row still has status `from`.
    ///
    /// Returns false when the row is gone or was moved by another process.
    /// Rows are never recreated here.
    pub fn update_status(
        &self,
        data: &QueuedReading,
        from: ReadingStatus,
    ) -> Result<bool, anyhow::Error> {
        let updated = self
            .conn
            .execute(
                r"
                UPDATE queued_readings SET
                    status = ?2,
                    retry_count = ?3,
                    error = ?4,
                    error_kind = ?5,
                    last_attempt_at = ?6
                WHERE id = ?1 AND status = ?7",
                rusqlite::params![
                    data.id,
                    data.status.as_str(),
                    data.retry_count,
                    data.error,
                    data.error_kind.map(|kind| kind.as_str()),
                    data.last_attempt_at.map(|at| at.to_rfc3339()),
                    from.as_str(),
                ],
            )
            .with_context(|| format!("Failed to update reading {}", data.id))?;
        Ok(updated > 0)
    }

    /// Stores the measured values of `data` while the row is pending or failed.
    pub fn update_values(&self, data: &QueuedReading) -> Result<bool, anyhow::Error> {
        let updated = self
            .conn
            .execute(
                r"
                UPDATE queued_readings SET date = ?2, temperature = ?3, humidity = ?4
                WHERE id = ?1 AND status IN (?5, ?6)",
                rusqlite::params![
                    data.id,
                    data.date.to_rfc3339(),
                    data.temperature,
                    data.humidity,
                    ReadingStatus::Pending.as_str(),
                    ReadingStatus::Failed.as_str(),
                ],
            )
            .with_context(|| format!("Failed to update reading {}", data.id))?;
        Ok(updated > 0)
    }

    pub fn delete(&self, id: &str) -> Result<(), anyhow::Error> {
        self.conn
            .execute("DELETE FROM queued_readings WHERE id = ?1", [id])
            .with_context(|| format!("Failed to delete reading {id}"))?;
        Ok(())
    }

    pub fn delete_by_status(&self, status: ReadingStatus) -> Result<usize, anyhow::Error> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM queued_readings WHERE status = ?1",
                [status.as_str()],
            )
            .with_context(|| format!("Failed to delete {status} readings"))?;
        Ok(removed)
    }

    pub fn delete_all(&self) -> Result<usize, anyhow::Error> {
        let removed = self
            .conn
            .execute("DELETE FROM queued_readings", [])
            .context("Failed to delete readings")?;
        Ok(removed)
    }

    pub fn get(&self, id: &str) -> Result<Option<QueuedReading>, anyhow::Error> {
        let raw = self
            .conn
            .query_row(
                &format!("{SELECT_READINGS} WHERE id = ?1"),
                [id],
                RawRow::from_row,
            )
            .optional()
            .with_context(|| format!("Failed to query reading {id}"))?;
        raw.map(RawRow::into_reading).transpose()
    }

    /// Every stored reading in insertion order.
    pub fn load_all(&self) -> Result<Vec<QueuedReading>, anyhow::Error> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_READINGS} ORDER BY seq"))
            .context("Failed to prepare reading query")?;

        let rows = stmt
            .query_map([], RawRow::from_row)
            .context("Failed to query readings")?;

        let mut readings = Vec::new();
        for row in rows {
            let raw = row.context("Failed to read reading row")?;
            readings.push(raw.into_reading()?);
        }
        Ok(readings)
    }
}

const SELECT_READINGS: &str = r"
    SELECT id, kind, original_reading_id, project_id, room_id, date,
           temperature, humidity, created_at, status, retry_count,
           error, error_kind, last_attempt_at
    FROM queued_readings";

/// Column values as stored, before parsing enums and timestamps.
struct RawRow {
    id: String,
    kind: String,
    original_reading_id: Option<String>,
    project_id: String,
    room_id: String,
    date: String,
    temperature: f64,
    humidity: f64,
    created_at: String,
    status: String,
    retry_count: u32,
    error: Option<String>,
    error_kind: Option<String>,
    last_attempt_at: Option<String>,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            original_reading_id: row.get(2)?,
            project_id: row.get(3)?,
            room_id: row.get(4)?,
            date: row.get(5)?,
            temperature: row.get(6)?,
            humidity: row.get(7)?,
            created_at: row.get(8)?,
            status: row.get(9)?,
            retry_count: row.get(10)?,
            error: row.get(11)?,
            error_kind: row.get(12)?,
            last_attempt_at: row.get(13)?,
        })
    }

    fn into_reading(self) -> Result<QueuedReading, anyhow::Error> {
        let context = || format!("Invalid stored reading {}", self.id);
        Ok(QueuedReading {
            kind: self.kind.parse().with_context(context)?,
            original_reading_id: self.original_reading_id.clone(),
            project_id: self.project_id.clone(),
            room_id: self.room_id.clone(),
            date: parse_timestamp(&self.date).with_context(context)?,
            temperature: self.temperature,
            humidity: self.humidity,
            created_at: parse_timestamp(&self.created_at).with_context(context)?,
            status: self.status.parse().with_context(context)?,
            retry_count: self.retry_count,
            error: self.error.clone(),
            error_kind: self
                .error_kind
                .as_deref()
                .map(str::parse::<ErrorKind>)
                .transpose()
                .with_context(context)?,
            last_attempt_at: self
                .last_attempt_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()
                .with_context(context)?,
            id: self.id,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, anyhow::Error> {
    let parsed = DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Failed to parse timestamp {value}"))?;
    Ok(parsed.with_timezone(&Utc))
}

/// A database file in the temp dir, deleted on drop. Lets tests open
/// several connections to the same queue.
#[cfg(test)]
pub(crate) struct TempDb(std::path::PathBuf);

#[cfg(test)]
impl TempDb {
    pub(crate) fn new() -> Self {
        Self(std::env::temp_dir().join(format!("readings-sync-{}.db", uuid::Uuid::new_v4())))
    }

    pub(crate) fn open(&self) -> DB {
        DB::open(&self.0).unwrap()
    }
}

#[cfg(test)]
impl Drop for TempDb {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}
