//! The serialization point for all entry mutation.
//!
//! Every read and write of an [`Entry`]'s fields funnels through a single
//! dispatcher task that drains one bounded queue per operation kind. The
//! compare-and-swap of `set-lock-id` therefore cannot interleave with a
//! lock check, and a release clears the lock and emits the handoff event
//! to the waitlist dispatcher without any other writer getting in between.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::{
    base::{TurnstileError, TurnstileResult},
    entry::Entry,
    registry::TokenRegistry,
};

/// A read of one entry field, answered on a one-shot channel.
pub(crate) struct EntryQuery<R> {
    pub(crate) entry: Arc<Entry>,
    pub(crate) reply: oneshot::Sender<R>,
}

/// A lock validity check: does the entry's current lock id equal `id`?
pub(crate) struct ValidLockQuery {
    pub(crate) entry: Arc<Entry>,
    pub(crate) id: String,
    pub(crate) reply: oneshot::Sender<bool>,
}

/// A write against one entry. `value` carries the payload for value writes
/// and the candidate lock id for lock writes.
pub(crate) struct WriteOp {
    pub(crate) entry: Arc<Entry>,
    pub(crate) value: String,
    pub(crate) reply: oneshot::Sender<TurnstileResult<()>>,
}

/// Messages on the lock-write queue.
///
/// `Set` is the compare-and-swap that only succeeds on an unlocked entry.
/// `Revoke` chases a lock id that was granted to a waiter which has since
/// abandoned its acquisition; it travels on the same queue as `Set` so it
/// is always processed after the grant it is chasing.
pub(crate) enum LockWrite {
    Set(WriteOp),
    Revoke { entry: Arc<Entry>, id: String },
}

/// Cloneable handle submitting operations to the atomics dispatcher.
#[derive(Clone)]
pub struct Atomics {
    is_locked_tx: mpsc::Sender<EntryQuery<bool>>,
    valid_lock_tx: mpsc::Sender<ValidLockQuery>,
    get_lock_id_tx: mpsc::Sender<EntryQuery<String>>,
    get_value_tx: mpsc::Sender<EntryQuery<String>>,
    get_key_tx: mpsc::Sender<EntryQuery<String>>,
    get_json_tx: mpsc::Sender<EntryQuery<TurnstileResult<Vec<u8>>>>,
    set_value_tx: mpsc::Sender<WriteOp>,
    lock_write_tx: mpsc::Sender<LockWrite>,
    unset_lock_tx: mpsc::Sender<EntryQuery<()>>,
}

impl Atomics {
    async fn query<R>(
        tx: &mpsc::Sender<EntryQuery<R>>,
        entry: &Arc<Entry>,
        queue: &'static str,
    ) -> TurnstileResult<R> {
        let (reply, result) = oneshot::channel();
        tx.send(EntryQuery {
            entry: entry.clone(),
            reply,
        })
        .await
        .map_err(|_| TurnstileError::ChannelClosed(queue))?;
        result.await.map_err(|_| TurnstileError::ChannelClosed(queue))
    }

    pub async fn is_locked(&self, entry: &Arc<Entry>) -> TurnstileResult<bool> {
        Self::query(&self.is_locked_tx, entry, "is-locked").await
    }

    pub async fn valid_lock(&self, entry: &Arc<Entry>, id: &str) -> TurnstileResult<bool> {
        let (reply, result) = oneshot::channel();
        self.valid_lock_tx
            .send(ValidLockQuery {
                entry: entry.clone(),
                id: id.to_owned(),
                reply,
            })
            .await
            .map_err(|_| TurnstileError::ChannelClosed("valid-lock"))?;
        result
            .await
            .map_err(|_| TurnstileError::ChannelClosed("valid-lock"))
    }

    pub async fn lock_id(&self, entry: &Arc<Entry>) -> TurnstileResult<String> {
        Self::query(&self.get_lock_id_tx, entry, "get-lock-id").await
    }

    pub async fn value(&self, entry: &Arc<Entry>) -> TurnstileResult<String> {
        Self::query(&self.get_value_tx, entry, "get-value").await
    }

    pub async fn key(&self, entry: &Arc<Entry>) -> TurnstileResult<String> {
        Self::query(&self.get_key_tx, entry, "get-key").await
    }

    /// The entry marshaled as `{"value": …, "lock_id": …}`.
    pub async fn json(&self, entry: &Arc<Entry>) -> TurnstileResult<Vec<u8>> {
        Self::query(&self.get_json_tx, entry, "get-json").await?
    }

    pub async fn set_value(&self, entry: &Arc<Entry>, value: String) -> TurnstileResult<()> {
        let (reply, result) = oneshot::channel();
        self.set_value_tx
            .send(WriteOp {
                entry: entry.clone(),
                value,
                reply,
            })
            .await
            .map_err(|_| TurnstileError::ChannelClosed("set-value"))?;
        result
            .await
            .map_err(|_| TurnstileError::ChannelClosed("set-value"))?
    }

    /// Assigns `id` as the entry's lock id, failing with
    /// [`TurnstileError::AlreadyLocked`] when another id is held.
    pub async fn set_lock_id(&self, entry: &Arc<Entry>, id: &str) -> TurnstileResult<()> {
        let (reply, result) = oneshot::channel();
        self.lock_write_tx
            .send(LockWrite::Set(WriteOp {
                entry: entry.clone(),
                value: id.to_owned(),
                reply,
            }))
            .await
            .map_err(|_| TurnstileError::ChannelClosed("set-lock-id"))?;
        result
            .await
            .map_err(|_| TurnstileError::ChannelClosed("set-lock-id"))?
    }

    /// Clears the entry's lock and hands it to the oldest waiter, if any.
    pub async fn unset_lock_id(&self, entry: &Arc<Entry>) -> TurnstileResult<()> {
        Self::query(&self.unset_lock_tx, entry, "unset-lock-id").await
    }

    pub(crate) fn lock_writes(&self) -> mpsc::Sender<LockWrite> {
        self.lock_write_tx.clone()
    }
}

/// The single task owning all entry mutation.
pub(crate) struct AtomicDispatcher {
    locks: Arc<TokenRegistry>,
    /// Release events out to the waitlist dispatcher, tagged with the key.
    release_tx: mpsc::Sender<String>,
    shutdown: broadcast::Receiver<()>,

    is_locked_rx: mpsc::Receiver<EntryQuery<bool>>,
    valid_lock_rx: mpsc::Receiver<ValidLockQuery>,
    get_lock_id_rx: mpsc::Receiver<EntryQuery<String>>,
    get_value_rx: mpsc::Receiver<EntryQuery<String>>,
    get_key_rx: mpsc::Receiver<EntryQuery<String>>,
    get_json_rx: mpsc::Receiver<EntryQuery<TurnstileResult<Vec<u8>>>>,
    set_value_rx: mpsc::Receiver<WriteOp>,
    lock_write_rx: mpsc::Receiver<LockWrite>,
    unset_lock_rx: mpsc::Receiver<EntryQuery<()>>,
}

impl AtomicDispatcher {
    pub(crate) fn new(
        buffer: usize,
        locks: Arc<TokenRegistry>,
        release_tx: mpsc::Sender<String>,
        shutdown: broadcast::Receiver<()>,
    ) -> (Atomics, Self) {
        let (is_locked_tx, is_locked_rx) = mpsc::channel(buffer);
        let (valid_lock_tx, valid_lock_rx) = mpsc::channel(buffer);
        let (get_lock_id_tx, get_lock_id_rx) = mpsc::channel(buffer);
        let (get_value_tx, get_value_rx) = mpsc::channel(buffer);
        let (get_key_tx, get_key_rx) = mpsc::channel(buffer);
        let (get_json_tx, get_json_rx) = mpsc::channel(buffer);
        let (set_value_tx, set_value_rx) = mpsc::channel(buffer);
        let (lock_write_tx, lock_write_rx) = mpsc::channel(buffer);
        let (unset_lock_tx, unset_lock_rx) = mpsc::channel(buffer);

        let atomics = Atomics {
            is_locked_tx,
            valid_lock_tx,
            get_lock_id_tx,
            get_value_tx,
            get_key_tx,
            get_json_tx,
            set_value_tx,
            lock_write_tx,
            unset_lock_tx,
        };
        let dispatcher = Self {
            locks,
            release_tx,
            shutdown,
            is_locked_rx,
            valid_lock_rx,
            get_lock_id_rx,
            get_value_rx,
            get_key_rx,
            get_json_rx,
            set_value_rx,
            lock_write_rx,
            unset_lock_rx,
        };
        (atomics, dispatcher)
    }

    pub(crate) async fn run(mut self) {
        info!("started atomics dispatcher");
        loop {
            tokio::select! {
                Some(q) = self.is_locked_rx.recv() => {
                    debug!(key = %q.entry.key(), "read is-locked queue");
                    let locked = q.entry.is_locked().await;
                    let _ = q.reply.send(locked);
                }
                Some(q) = self.valid_lock_rx.recv() => {
                    debug!(key = %q.entry.key(), "read valid-lock queue");
                    let valid = q.entry.valid_lock(&q.id).await;
                    let _ = q.reply.send(valid);
                }
                Some(q) = self.get_lock_id_rx.recv() => {
                    debug!(key = %q.entry.key(), "read get-lock-id queue");
                    let id = q.entry.lock_id().await;
                    let _ = q.reply.send(id);
                }
                Some(q) = self.get_value_rx.recv() => {
                    debug!(key = %q.entry.key(), "read get-value queue");
                    let value = q.entry.value().await;
                    let _ = q.reply.send(value);
                }
                Some(q) = self.get_key_rx.recv() => {
                    debug!(key = %q.entry.key(), "read get-key queue");
                    let key = q.entry.key().to_owned();
                    let _ = q.reply.send(key);
                }
                Some(q) = self.get_json_rx.recv() => {
                    debug!(key = %q.entry.key(), "read get-json queue");
                    let json = q.entry.to_json().await;
                    let _ = q.reply.send(json);
                }
                Some(op) = self.set_value_rx.recv() => {
                    debug!(key = %op.entry.key(), "read set-value queue");
                    op.entry.set_value(op.value).await;
                    let _ = op.reply.send(Ok(()));
                }
                Some(msg) = self.lock_write_rx.recv() => self.handle_lock_write(msg).await,
                Some(q) = self.unset_lock_rx.recv() => {
                    debug!(key = %q.entry.key(), "read unset-lock-id queue");
                    self.unset(&q.entry).await;
                    let _ = q.reply.send(());
                }
                _ = self.shutdown.recv() => break,
                else => break,
            }
        }
        info!("stopped atomics dispatcher");
    }

    async fn handle_lock_write(&self, msg: LockWrite) {
        match msg {
            LockWrite::Set(op) => {
                debug!(key = %op.entry.key(), id = %op.value, "read set-lock-id queue");
                if op.entry.set_lock_id(&op.value).await {
                    if !self.locks.add(&op.value).await {
                        debug!(id = %op.value, "lock id was already registered");
                    }
                    let _ = op.reply.send(Ok(()));
                } else {
                    let _ = op
                        .reply
                        .send(Err(TurnstileError::AlreadyLocked(op.entry.key().to_owned())));
                }
            }
            LockWrite::Revoke { entry, id } => {
                debug!(key = %entry.key(), id = %id, "read lock revoke");
                // Only revoke if the abandoned grant is still in effect.
                if entry.valid_lock(&id).await {
                    self.unset(&entry).await;
                }
            }
        }
    }

    /// Clears the lock, retires its id, and emits the release event before
    /// returning to the message loop.
    async fn unset(&self, entry: &Arc<Entry>) {
        let cleared = entry.clear_lock().await;
        if !cleared.is_empty() {
            self.locks.remove(&cleared).await;
        }
        if self.release_tx.send(entry.key().to_owned()).await.is_err() {
            warn!(key = %entry.key(), "waitlist dispatcher is gone, dropping release event");
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{Turnstile, base::TurnstileError, config::AppConfig, tests::setup_tracing};

    #[tokio::test]
    async fn test_lock_cas_through_dispatcher() {
        setup_tracing();
        let turnstile = Turnstile::launch(&AppConfig::for_testing());
        let entry = turnstile.store.create("alpha").await.expect("create");

        assert!(!turnstile.atomics.is_locked(&entry).await.expect("is-locked"));
        turnstile
            .atomics
            .set_lock_id(&entry, "ABCDE")
            .await
            .expect("first lock write should succeed");
        assert!(turnstile.atomics.is_locked(&entry).await.expect("is-locked"));
        assert!(turnstile.locks.exists("ABCDE").await, "lock id becomes live");

        // The CAS refuses a second id while the first is held.
        let refused = turnstile.atomics.set_lock_id(&entry, "XYZZY").await;
        assert!(matches!(refused, Err(TurnstileError::AlreadyLocked(_))));
        assert_eq!(
            turnstile.atomics.lock_id(&entry).await.expect("get-lock-id"),
            "ABCDE",
        );
        assert!(!turnstile.locks.exists("XYZZY").await);
    }

    #[tokio::test]
    async fn test_unset_retires_lock_id() {
        setup_tracing();
        let turnstile = Turnstile::launch(&AppConfig::for_testing());
        let entry = turnstile.store.create("alpha").await.expect("create");

        turnstile
            .atomics
            .set_lock_id(&entry, "ABCDE")
            .await
            .expect("lock write");
        turnstile.atomics.unset_lock_id(&entry).await.expect("unset");
        assert!(!turnstile.atomics.is_locked(&entry).await.expect("is-locked"));
        assert!(!turnstile.locks.exists("ABCDE").await, "lock id retired");

        // A fresh id can now be set.
        turnstile
            .atomics
            .set_lock_id(&entry, "XYZZY")
            .await
            .expect("relock after unset");
    }

    #[tokio::test]
    async fn test_value_and_json_roundtrip() {
        setup_tracing();
        let turnstile = Turnstile::launch(&AppConfig::for_testing());
        let entry = turnstile.store.create("alpha").await.expect("create");

        turnstile
            .atomics
            .set_value(&entry, "v1".to_owned())
            .await
            .expect("set-value");
        assert_eq!(turnstile.atomics.value(&entry).await.expect("get-value"), "v1");
        assert_eq!(turnstile.atomics.key(&entry).await.expect("get-key"), "alpha");
        assert!(turnstile.atomics.valid_lock(&entry, "").await.expect("valid-lock"));

        let json: serde_json::Value =
            serde_json::from_slice(&turnstile.atomics.json(&entry).await.expect("get-json"))
                .expect("entry json should parse");
        assert_eq!(json["value"], "v1");
        assert_eq!(json["lock_id"], "");
    }
}
