use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::ServiceLogError;

/// Calls waiting for the client's confirmation, keyed by response id.
///
/// Each id is added once and removed once; reading it in between is fine,
/// reading it after removal is an error.
#[derive(Debug)]
pub struct PendingConfirmations<T> {
    entries: Mutex<HashMap<u64, T>>,
}

impl<T> Default for PendingConfirmations<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> PendingConfirmations<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, T>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, response_id: u64, value: T) {
        if self.lock().insert(response_id, value).is_some() {
            tracing::warn!(response_id, "Replaced pending confirmation");
        } else {
            tracing::debug!(response_id, "Added pending confirmation");
        }
    }

    pub fn get(&self, response_id: u64) -> Result<T, ServiceLogError> {
        self.lock()
            .get(&response_id)
            .cloned()
            .ok_or(ServiceLogError::UnknownConfirmation(response_id))
    }

    pub fn remove(&self, response_id: u64) -> Option<T> {
        let removed = self.lock().remove(&response_id);
        tracing::debug!(response_id, found = removed.is_some(), "Removed pending confirmation");
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
