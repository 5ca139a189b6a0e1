use std::{collections::HashMap, sync::Arc};

use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard, RwLock};

use crate::{
    base::{TurnstileError, TurnstileResult},
    registry::TokenRegistry,
    waitlist::Waitlist,
};

/// The mutable half of an entry. Serializes to the wire shape
/// `{"value": …, "lock_id": …}`; the key is deliberately left out.
#[derive(Debug, Default, Serialize)]
struct EntryState {
    value: String,
    lock_id: String,
}

/// One keyed record. An empty `lock_id` means unlocked.
///
/// The state is only ever written by the atomics dispatcher; everything
/// else reads and writes an entry through the [`Atomics`] handle so that
/// lock transitions stay linearized.
///
/// [`Atomics`]: crate::atomic::Atomics
pub struct Entry {
    key: String,
    state: RwLock<EntryState>,
    /// Handler-side exclusive section: two requests working on the same
    /// key serialize their whole check-acquire-write sequence here.
    gate: Mutex<()>,
}

impl Entry {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            state: RwLock::new(EntryState::default()),
            gate: Mutex::new(()),
        }
    }

    /// A pre-populated entry, for callers that fill in value and lock
    /// state before announcing the entry to the store.
    pub fn with_state(
        key: impl Into<String>,
        value: impl Into<String>,
        lock_id: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            state: RwLock::new(EntryState {
                value: value.into(),
                lock_id: lock_id.into(),
            }),
            gate: Mutex::new(()),
        }
    }

    /// The key is immutable after creation.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub(crate) async fn exclusive(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().await
    }

    pub(crate) async fn is_locked(&self) -> bool {
        !self.state.read().await.lock_id.is_empty()
    }

    pub(crate) async fn valid_lock(&self, id: &str) -> bool {
        self.state.read().await.lock_id == id
    }

    pub(crate) async fn lock_id(&self) -> String {
        self.state.read().await.lock_id.clone()
    }

    pub(crate) async fn value(&self) -> String {
        self.state.read().await.value.clone()
    }

    pub(crate) async fn set_value(&self, value: String) {
        self.state.write().await.value = value;
    }

    /// The compare-and-swap at the heart of reservation: the lock id is
    /// assigned only if the entry is currently unlocked.
    pub(crate) async fn set_lock_id(&self, id: &str) -> bool {
        let mut state = self.state.write().await;
        if !state.lock_id.is_empty() {
            return false;
        }
        state.lock_id = id.to_owned();
        true
    }

    /// Clears the lock, returning the id that was held (empty if none).
    pub(crate) async fn clear_lock(&self) -> String {
        let mut state = self.state.write().await;
        std::mem::take(&mut state.lock_id)
    }

    pub(crate) async fn to_json(&self) -> TurnstileResult<Vec<u8>> {
        let state = self.state.read().await;
        Ok(serde_json::to_vec(&*state)?)
    }
}

/// The keyed map of all live entries.
pub struct EntryStore {
    entries: RwLock<HashMap<String, Arc<Entry>>>,
    locks: Arc<TokenRegistry>,
    waitlist: Waitlist,
}

impl EntryStore {
    pub fn new(locks: Arc<TokenRegistry>, waitlist: Waitlist) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            locks,
            waitlist,
        }
    }

    pub async fn exists(&self, key: &str) -> bool {
        self.entries.read().await.contains_key(key)
    }

    /// Creates a fresh unlocked entry under `key`.
    pub async fn create(&self, key: &str) -> TurnstileResult<Arc<Entry>> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(key) {
            return Err(TurnstileError::KeyExists(key.to_owned()));
        }
        let entry = Arc::new(Entry::new(key));
        entries.insert(key.to_owned(), entry.clone());
        Ok(entry)
    }

    /// Inserts a pre-built entry. A born-locked entry has its lock id
    /// registered as live.
    pub async fn add(&self, entry: Entry) -> TurnstileResult<()> {
        let id = entry.lock_id().await;
        let key = entry.key().to_owned();
        {
            let mut entries = self.entries.write().await;
            if entries.contains_key(&key) {
                return Err(TurnstileError::KeyExists(key));
            }
            entries.insert(key, Arc::new(entry));
        }
        if !id.is_empty() {
            self.locks.add(&id).await;
        }
        Ok(())
    }

    pub async fn get(&self, key: &str) -> TurnstileResult<Arc<Entry>> {
        self.entries
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| TurnstileError::KeyNotFound(key.to_owned()))
    }

    /// Removes the entry, retires its live lock id, and fails every waiter
    /// still queued against the key.
    pub async fn delete(&self, key: &str) -> TurnstileResult<()> {
        let entry = self
            .entries
            .write()
            .await
            .remove(key)
            .ok_or_else(|| TurnstileError::KeyNotFound(key.to_owned()))?;
        let id = entry.lock_id().await;
        if !id.is_empty() {
            self.locks.remove(&id).await;
        }
        self.waitlist.cascade(key).await
    }
}
