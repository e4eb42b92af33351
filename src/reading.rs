use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

/// Upload state of a queued reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
}

impl ReadingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReadingStatus::Pending => "pending",
            ReadingStatus::Uploading => "uploading",
            ReadingStatus::Completed => "completed",
            ReadingStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ReadingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReadingStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ReadingStatus::Pending),
            "uploading" => Ok(ReadingStatus::Uploading),
            "completed" => Ok(ReadingStatus::Completed),
            "failed" => Ok(ReadingStatus::Failed),
            other => Err(anyhow::anyhow!("Unknown reading status: {other}")),
        }
    }
}

/// Whether a queued reading creates a new remote reading or edits an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingKind {
    New,
    Edit,
}

impl ReadingKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ReadingKind::New => "new",
            ReadingKind::Edit => "edit",
        }
    }
}

impl FromStr for ReadingKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(ReadingKind::New),
            "edit" => Ok(ReadingKind::Edit),
            other => Err(anyhow::anyhow!("Unknown reading kind: {other}")),
        }
    }
}

/// Classification of the last upload failure.
///
/// Only transient failures are retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
        }
    }
}

impl FromStr for ErrorKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(ErrorKind::Transient),
            "permanent" => Ok(ErrorKind::Permanent),
            other => Err(anyhow::anyhow!("Unknown error kind: {other}")),
        }
    }
}

/// A reading captured on the device, as handed to the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReading {
    pub project_id: String,
    pub room_id: String,
    pub date: DateTime<Utc>,
    pub temperature: f64,
    pub humidity: f64,
    /// Remote id of the reading being edited. `None` for a brand new reading.
    pub original_reading_id: Option<String>,
}

impl NewReading {
    pub fn kind(&self) -> ReadingKind {
        if self.original_reading_id.is_some() {
            ReadingKind::Edit
        } else {
            ReadingKind::New
        }
    }
}

/// Value changes for a reading that has not been uploaded yet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadingPatch {
    pub date: Option<DateTime<Utc>>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
}

impl ReadingPatch {
    pub fn is_empty(&self) -> bool {
        self.date.is_none() && self.temperature.is_none() && self.humidity.is_none()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedReading {
    pub id: String,
    pub kind: ReadingKind,
    pub original_reading_id: Option<String>,
    pub project_id: String,
    pub room_id: String,
    pub date: DateTime<Utc>,
    pub temperature: f64,
    pub humidity: f64,
    pub created_at: DateTime<Utc>,
    pub status: ReadingStatus,
    pub retry_count: u32,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl QueuedReading {
    pub fn new(reading: NewReading) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: reading.kind(),
            original_reading_id: reading.original_reading_id,
            project_id: reading.project_id,
            room_id: reading.room_id,
            date: reading.date,
            temperature: reading.temperature,
            humidity: reading.humidity,
            created_at: Utc::now(),
            status: ReadingStatus::Pending,
            retry_count: 0,
            error: None,
            error_kind: None,
            last_attempt_at: None,
        }
    }

    pub fn apply(&mut self, patch: &ReadingPatch) {
        if let Some(date) = patch.date {
            self.date = date;
        }
        if let Some(temperature) = patch.temperature {
            self.temperature = temperature;
        }
        if let Some(humidity) = patch.humidity {
            self.humidity = humidity;
        }
    }
}

#[cfg(test)]
pub(crate) fn sample(temperature: f64, humidity: f64) -> NewReading {
    NewReading {
        project_id: "project-1".to_string(),
        room_id: "room-1".to_string(),
        date: Utc::now(),
        temperature,
        humidity,
        original_reading_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_reading_starts_pending() {
        let item = QueuedReading::new(sample(70.0, 40.0));
        assert_eq!(item.status, ReadingStatus::Pending);
        assert_eq!(item.retry_count, 0);
        assert_eq!(item.kind, ReadingKind::New);
        assert!(item.error.is_none());
    }

    #[test]
    fn test_edit_kind_follows_original_id() {
        let mut reading = sample(70.0, 40.0);
        reading.original_reading_id = Some("remote-9".to_string());
        let item = QueuedReading::new(reading);
        assert_eq!(item.kind, ReadingKind::Edit);
        assert_eq!(item.original_reading_id.as_deref(), Some("remote-9"));
    }

    #[test]
    fn test_ids_are_unique() {
        let a = QueuedReading::new(sample(70.0, 40.0));
        let b = QueuedReading::new(sample(70.0, 40.0));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_apply_patch_only_touches_given_fields() {
        let mut item = QueuedReading::new(sample(70.0, 40.0));
        item.apply(&ReadingPatch {
            humidity: Some(55.5),
            ..Default::default()
        });
        assert_eq!(item.temperature, 70.0);
        assert_eq!(item.humidity, 55.5);
    }

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [
            ReadingStatus::Pending,
            ReadingStatus::Uploading,
            ReadingStatus::Completed,
            ReadingStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<ReadingStatus>().unwrap(), status);
        }
        assert!("done".parse::<ReadingStatus>().is_err());
    }
}
