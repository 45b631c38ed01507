//! Cancellation helpers for callers of a [`Connection`](crate::Connection).
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::LspError;

/// One live request per key; starting a new one cancels the old.
///
/// Typical keys are "completion for this editor" or "hover for this
/// editor": only the latest request is worth an answer.
pub struct RequestSlots<K> {
    slots: Mutex<HashMap<K, CancellationToken>>,
}

impl<K: Eq + Hash> Default for RequestSlots<K> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash> RequestSlots<K> {
    /// Empty set of slots.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel whatever is running under `key` and hand out a fresh token.
    pub fn supersede(&self, key: K) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self.slots.lock().insert(key, token.clone()) {
            previous.cancel();
        }
        token
    }

    /// Cancel and forget the request under `key`.
    pub fn cancel(&self, key: &K) {
        if let Some(token) = self.slots.lock().remove(key) {
            token.cancel();
        }
    }

    /// Cancel everything.
    pub fn cancel_all(&self) {
        for (_, token) in self.slots.lock().drain() {
            token.cancel();
        }
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// True when nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

/// Run `fut`, giving up after `limit`.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, LspError>
where
    F: Future<Output = Result<T, LspError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(LspError::Timeout(limit)),
    }
}
