//! Shared record handle passed between the pipeline and the script VM.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use logtap_types::Record;

/// A [`Record`] behind a shared lock. The pipeline wraps each parsed record
/// in a handle before hook dispatch; the script mutates it in place through
/// the `log_*` builtins, and the caller observes the mutations afterwards.
#[derive(Debug, Clone)]
pub struct RecordHandle(Arc<Mutex<Record>>);

impl RecordHandle {
    /// Wrap a record.
    #[must_use]
    pub fn new(record: Record) -> Self {
        Self(Arc::new(Mutex::new(record)))
    }

    /// Lock the record. Record operations cannot leave it in a torn state,
    /// so a poisoned lock is recovered rather than propagated.
    pub fn lock(&self) -> MutexGuard<'_, Record> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Recover the record, cloning when other handles are still alive.
    #[must_use]
    pub fn into_record(self) -> Record {
        match Arc::try_unwrap(self.0) {
            Ok(mutex) => mutex.into_inner().unwrap_or_else(PoisonError::into_inner),
            Err(shared) => shared
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }
}

impl Default for RecordHandle {
    fn default() -> Self {
        Self::new(Record::new())
    }
}

impl From<Record> for RecordHandle {
    fn from(record: Record) -> Self {
        Self::new(record)
    }
}
