use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::ProcessRecord;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("read/write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config store {path} is corrupted: {source}")]
    Corrupted {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialize config store: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Persisted table of process records.
///
/// Pure storage: implementations never probe the OS. Records are keyed by pid;
/// `save` replaces an existing record with the same pid and appends otherwise.
pub trait ProcessRegistry: Send + Sync {
    fn list_all(&self) -> Result<Vec<ProcessRecord>, StoreError>;

    fn save(&self, record: &ProcessRecord) -> Result<(), StoreError>;

    /// Returns whether a record was removed.
    fn delete(&self, pid: u32) -> Result<bool, StoreError>;

    /// Stamps `last_polled_at` on an existing record in one atomic step.
    ///
    /// Returns `false` and writes nothing when the record is gone, so a
    /// concurrent `delete` is never undone.
    fn touch(&self, pid: u32, at: DateTime<Utc>) -> Result<bool, StoreError>;

    fn get(&self, pid: u32) -> Result<Option<ProcessRecord>, StoreError> {
        Ok(self.list_all()?.into_iter().find(|r| r.pid == pid))
    }
}

/// Sets `last_polled_at` on the record for `pid`, if there is one.
pub fn stamp_polled(records: &mut [ProcessRecord], pid: u32, at: DateTime<Utc>) -> bool {
    match records.iter_mut().find(|r| r.pid == pid) {
        Some(r) => {
            r.last_polled_at = Some(at);
            true
        }
        None => false,
    }
}

/// Upsert helper shared by registry implementations.
pub fn upsert(records: &mut Vec<ProcessRecord>, record: &ProcessRecord) {
    match records.iter_mut().find(|r| r.pid == record.pid) {
        Some(existing) => *existing = record.clone(),
        None => records.push(record.clone()),
    }
}

/// Registry that lives only as long as the value. Used by tests and by callers
/// that do not need cross-invocation tracking.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    records: Mutex<Vec<ProcessRecord>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcessRegistry for MemoryRegistry {
    fn list_all(&self) -> Result<Vec<ProcessRecord>, StoreError> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records.clone())
    }

    fn save(&self, record: &ProcessRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        upsert(&mut records, record);
        Ok(())
    }

    fn delete(&self, pid: u32) -> Result<bool, StoreError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let before = records.len();
        records.retain(|r| r.pid != pid);
        Ok(records.len() != before)
    }

    fn touch(&self, pid: u32, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(stamp_polled(&mut records, pid, at))
    }
}
