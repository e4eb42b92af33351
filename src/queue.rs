use anyhow::Context;
use chrono::{DateTime, Utc};

use crate::db::DB;
use crate::reading::{ErrorKind, NewReading, QueuedReading, ReadingPatch, ReadingStatus};
use crate::retry::RetryPolicy;

pub const INTERRUPTED_ERROR: &str = "interrupted before upload finished";

/// Readings waiting for upload, mirrored from the `queued_readings` table.
///
/// The table is authoritative: other processes may add, change or delete
/// rows at any time. Transitions only touch a row that still has the status
/// they start from, and never recreate a deleted one.
#[derive(Debug)]
pub struct ReadingQueue {
    readings: Vec<QueuedReading>,
    db: DB,
}

impl ReadingQueue {
    /// Restores the queue stored in `db` for an uploader.
    ///
    /// Readings that were still uploading when the process stopped are marked
    /// failed, since the outcome of their request is unknown.
    pub fn open(db: DB) -> Result<Self, anyhow::Error> {
        let mut queue = Self::load(db)?;

        for item in queue.readings.iter_mut() {
            if item.status == ReadingStatus::Uploading {
                log::warn!("Reading {} was interrupted while uploading", item.id);
                item.status = ReadingStatus::Failed;
                item.retry_count += 1;
                item.error = Some(INTERRUPTED_ERROR.to_string());
                item.error_kind = Some(ErrorKind::Transient);
                item.last_attempt_at = Some(Utc::now());
                queue.db.update_status(item, ReadingStatus::Uploading)?;
            }
        }

        log::info!("Restored {} queued readings", queue.readings.len());
        Ok(queue)
    }

    /// Loads the stored queue as it is, leaving in-flight uploads alone.
    pub fn load(db: DB) -> Result<Self, anyhow::Error> {
        db.init().context("Failed to initialize queue table")?;
        let readings = db.load_all().context("Failed to load queued readings")?;
        Ok(Self { readings, db })
    }

    /// Picks up rows added, changed or deleted by other processes.
    pub fn refresh(&mut self) {
        match self.db.load_all() {
            Ok(readings) => self.readings = readings,
            Err(e) => log::error!("{e:#}"),
        }
    }

    /// Replaces the in-memory copy of `id` with the stored row, dropping it if
    /// the row is gone.
    fn reload(&mut self, id: &str) {
        match self.db.get(id) {
            Ok(Some(stored)) => {
                if let Some(item) = self.find_mut(id) {
                    *item = stored;
                }
            }
            Ok(None) => {
                log::info!("Reading {id} is no longer stored");
                self.readings.retain(|item| item.id != id);
            }
            Err(e) => log::error!("{e:#}"),
        }
    }

    /// Stores a status change made to `id` in memory.
    ///
    /// Returns false if the row no longer had status `from`; the in-memory
    /// copy is then reset to what is stored.
    fn persist_transition(&mut self, id: &str, from: ReadingStatus) -> bool {
        let Some(item) = self.readings.iter().find(|item| item.id == id) else {
            return false;
        };
        match self.db.update_status(item, from) {
            Ok(true) => true,
            Ok(false) => {
                self.reload(id);
                false
            }
            Err(e) => {
                log::error!("{e:#}");
                true
            }
        }
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut QueuedReading> {
        self.readings.iter_mut().find(|item| item.id == id)
    }

    fn with_status(&self, status: ReadingStatus) -> Vec<QueuedReading> {
        self.filter(|item| item.status == status)
    }

    fn filter(&self, predicate: impl Fn(&QueuedReading) -> bool) -> Vec<QueuedReading> {
        self.readings
            .iter()
            .filter(|item| predicate(item))
            .cloned()
            .collect()
    }

    /// Adds a reading with status `pending` and returns its id.
    pub fn enqueue(&mut self, reading: NewReading) -> String {
        let item = QueuedReading::new(reading);
        let id = item.id.clone();
        log::info!(
            "Queued {} reading {} for room {} ({}°, {}%)",
            item.kind.as_str(),
            item.id,
            item.room_id,
            item.temperature,
            item.humidity
        );
        if let Err(e) = self.db.insert(&item) {
            log::error!("{e:#}");
        }
        self.readings.push(item);
        id
    }

    pub fn get(&self, id: &str) -> Option<&QueuedReading> {
        self.readings.iter().find(|item| item.id == id)
    }

    pub fn all(&self) -> &[QueuedReading] {
        &self.readings
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn pending(&self) -> Vec<QueuedReading> {
        self.with_status(ReadingStatus::Pending)
    }

    pub fn failed(&self) -> Vec<QueuedReading> {
        self.with_status(ReadingStatus::Failed)
    }

    pub fn completed(&self) -> Vec<QueuedReading> {
        self.with_status(ReadingStatus::Completed)
    }

    pub fn by_room(&self, room_id: &str) -> Vec<QueuedReading> {
        self.filter(|item| item.room_id == room_id)
    }

    pub fn by_project(&self, project_id: &str) -> Vec<QueuedReading> {
        self.filter(|item| item.project_id == project_id)
    }

    /// The queued edit of the remote reading `reading_id`, if any.
    pub fn edit_for_reading(&self, reading_id: &str) -> Option<&QueuedReading> {
        self.readings
            .iter()
            .find(|item| item.original_reading_id.as_deref() == Some(reading_id))
    }

    pub fn new_for_room(&self, room_id: &str) -> Vec<QueuedReading> {
        self.filter(|item| item.room_id == room_id && item.original_reading_id.is_none())
    }

    pub fn edits_for_room(&self, room_id: &str) -> Vec<QueuedReading> {
        self.filter(|item| item.room_id == room_id && item.original_reading_id.is_some())
    }

    /// Changes the values of a reading that has not been uploaded yet.
    ///
    /// Returns whether anything changed. Uploading and completed readings are
    /// left untouched.
    pub fn update_reading(&mut self, id: &str, patch: &ReadingPatch) -> bool {
        if patch.is_empty() {
            return false;
        }
        let Some(item) = self.find_mut(id) else {
            return false;
        };
        if !matches!(item.status, ReadingStatus::Pending | ReadingStatus::Failed) {
            log::warn!("Reading {id} is {} and can no longer be edited", item.status);
            return false;
        }
        item.apply(patch);
        let item = item.clone();
        match self.db.update_values(&item) {
            Ok(true) => true,
            Ok(false) => {
                self.reload(id);
                log::warn!("Reading {id} changed elsewhere and was not edited");
                false
            }
            Err(e) => {
                log::error!("{e:#}");
                true
            }
        }
    }

    /// Moves a failed reading back to `pending`. The retry count is kept.
    pub fn retry(&mut self, id: &str) -> bool {
        let Some(item) = self.find_mut(id) else {
            return false;
        };
        if item.status != ReadingStatus::Failed {
            return false;
        }
        item.status = ReadingStatus::Pending;
        item.error = None;
        item.error_kind = None;
        let attempts = item.retry_count;
        if !self.persist_transition(id, ReadingStatus::Failed) {
            return false;
        }
        log::info!("Retrying reading {id} (attempts so far: {attempts})");
        true
    }

    /// Moves every failed reading back to `pending` and returns how many moved.
    pub fn retry_all_failed(&mut self) -> usize {
        let ids: Vec<String> = self.failed().into_iter().map(|item| item.id).collect();
        ids.iter().filter(|id| self.retry(id)).count()
    }

    /// Automatic retry: re-queues failed readings whose backoff has elapsed.
    pub fn requeue_due(&mut self, policy: &RetryPolicy, now: DateTime<Utc>) -> usize {
        let due: Vec<String> = self
            .readings
            .iter()
            .filter(|item| policy.retry_at(item).is_some_and(|at| at <= now))
            .map(|item| item.id.clone())
            .collect();
        due.iter().filter(|id| self.retry(id)).count()
    }

    /// Earliest moment an automatic retry becomes due.
    pub fn next_retry_at(&self, policy: &RetryPolicy) -> Option<DateTime<Utc>> {
        self.readings
            .iter()
            .filter_map(|item| policy.retry_at(item))
            .min()
    }

    /// Deletes a reading whatever its status.
    pub fn remove(&mut self, id: &str) -> bool {
        let Some(index) = self.readings.iter().position(|item| item.id == id) else {
            return false;
        };
        self.readings.remove(index);
        if let Err(e) = self.db.delete(id) {
            log::error!("{e:#}");
        }
        log::info!("Removed reading {id} from the queue");
        true
    }

    fn clear_status(&mut self, status: ReadingStatus) -> usize {
        let before = self.readings.len();
        self.readings.retain(|item| item.status != status);
        if let Err(e) = self.db.delete_by_status(status) {
            log::error!("{e:#}");
        }
        before - self.readings.len()
    }

    pub fn clear_completed(&mut self) -> usize {
        self.clear_status(ReadingStatus::Completed)
    }

    pub fn clear_failed(&mut self) -> usize {
        self.clear_status(ReadingStatus::Failed)
    }

    pub fn clear_all(&mut self) -> usize {
        let removed = self.readings.len();
        self.readings.clear();
        if let Err(e) = self.db.delete_all() {
            log::error!("{e:#}");
        }
        removed
    }

    /// Marks a pending reading as uploading and returns a snapshot to send.
    ///
    /// The stored row is read first, so values edited elsewhere are the ones
    /// sent. `None` if the reading is gone or no longer pending.
    pub fn begin_upload(&mut self, id: &str) -> Option<QueuedReading> {
        self.reload(id);
        let item = self.find_mut(id)?;
        if item.status != ReadingStatus::Pending {
            return None;
        }
        item.status = ReadingStatus::Uploading;
        let item = item.clone();
        self.persist_transition(id, ReadingStatus::Pending).then_some(item)
    }

    pub fn mark_completed(&mut self, id: &str) {
        let Some(item) = self.find_mut(id) else {
            log::debug!("Reading {id} was removed during upload");
            return;
        };
        item.status = ReadingStatus::Completed;
        item.error = None;
        item.error_kind = None;
        item.last_attempt_at = Some(Utc::now());
        self.persist_transition(id, ReadingStatus::Uploading);
    }

    pub fn mark_failed(&mut self, id: &str, error: String, kind: ErrorKind) {
        let Some(item) = self.find_mut(id) else {
            log::debug!("Reading {id} was removed during upload");
            return;
        };
        item.status = ReadingStatus::Failed;
        item.retry_count += 1;
        item.error = Some(error);
        item.error_kind = Some(kind);
        item.last_attempt_at = Some(Utc::now());
        self.persist_transition(id, ReadingStatus::Uploading);
    }
}

#[cfg(test)]
pub(crate) fn memory_queue() -> ReadingQueue {
    ReadingQueue::open(DB::open_in_memory().unwrap()).unwrap()
}
