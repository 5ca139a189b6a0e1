//! The per-key waitlists of pending lock acquisitions.
//!
//! A second dispatcher task keeps, for every contended key, a FIFO of
//! waiters that lost the lock compare-and-swap. When the current holder
//! releases, the oldest waiter's lock write is forwarded straight into
//! the atomics dispatcher's lock-write queue, so the handoff chain
//! `unset-lock-id → release → set-lock-id` cannot be raced by a new
//! arrival. Timed-out waiters are removed without being signalled; their
//! timeout is reported by [`Waitlist::acquire`] itself.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use tokio::{
    sync::{broadcast, mpsc, oneshot},
    time,
};

use crate::{
    atomic::{LockWrite, WriteOp},
    base::{TurnstileError, TurnstileResult},
    entry::Entry,
};

/// Abandonment notice for a waiter whose acquisition timer fired.
pub(crate) struct Rescind {
    entry: Arc<Entry>,
    id: String,
}

/// Cloneable handle submitting events to the waitlist dispatcher.
#[derive(Clone)]
pub struct Waitlist {
    acquire_tx: mpsc::Sender<WriteOp>,
    rescind_tx: mpsc::Sender<Rescind>,
    cascade_tx: mpsc::Sender<String>,
}

impl Waitlist {
    /// Queues up for the lock on `entry` under the candidate lock id `id`
    /// and waits until the lock is handed over or `timeout` elapses.
    ///
    /// Callers submit an acquisition only after a direct lock write has
    /// failed, so a holder exists and the wait is genuine. After a timeout
    /// the reply channel is never consulted again; a grant that raced the
    /// timer is revoked through the rescind event instead.
    pub async fn acquire(
        &self,
        entry: &Arc<Entry>,
        id: &str,
        timeout: Duration,
    ) -> TurnstileResult<()> {
        let (reply, result) = oneshot::channel();
        self.acquire_tx
            .send(WriteOp {
                entry: entry.clone(),
                value: id.to_owned(),
                reply,
            })
            .await
            .map_err(|_| TurnstileError::ChannelClosed("acquire"))?;

        match time::timeout(timeout, result).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TurnstileError::ChannelClosed("acquire")),
            Err(_elapsed) => {
                self.rescind(entry, id).await?;
                Err(TurnstileError::AcquireTimedOut)
            }
        }
    }

    async fn rescind(&self, entry: &Arc<Entry>, id: &str) -> TurnstileResult<()> {
        self.rescind_tx
            .send(Rescind {
                entry: entry.clone(),
                id: id.to_owned(),
            })
            .await
            .map_err(|_| TurnstileError::ChannelClosed("rescind"))
    }

    /// Fails every waiter queued against `key`; submitted when the entry
    /// is deleted out from under them.
    pub(crate) async fn cascade(&self, key: &str) -> TurnstileResult<()> {
        self.cascade_tx
            .send(key.to_owned())
            .await
            .map_err(|_| TurnstileError::ChannelClosed("cascade"))
    }

    #[cfg(test)]
    pub(crate) async fn rescind_for_testing(
        &self,
        entry: &Arc<Entry>,
        id: &str,
    ) -> TurnstileResult<()> {
        self.rescind(entry, id).await
    }
}

/// The single task owning the waitlist table.
pub(crate) struct WaitlistDispatcher {
    /// Waiters per key, oldest first. A key is present iff its queue is
    /// non-empty.
    waiters: HashMap<String, VecDeque<WriteOp>>,
    lock_write_tx: mpsc::Sender<LockWrite>,
    shutdown: broadcast::Receiver<()>,

    acquire_rx: mpsc::Receiver<WriteOp>,
    release_rx: mpsc::Receiver<String>,
    rescind_rx: mpsc::Receiver<Rescind>,
    cascade_rx: mpsc::Receiver<String>,
}

impl WaitlistDispatcher {
    pub(crate) fn new(
        buffer: usize,
        lock_write_tx: mpsc::Sender<LockWrite>,
        release_rx: mpsc::Receiver<String>,
        shutdown: broadcast::Receiver<()>,
    ) -> (Waitlist, Self) {
        let (acquire_tx, acquire_rx) = mpsc::channel(buffer);
        let (rescind_tx, rescind_rx) = mpsc::channel(buffer);
        let (cascade_tx, cascade_rx) = mpsc::channel(buffer);

        let waitlist = Waitlist {
            acquire_tx,
            rescind_tx,
            cascade_tx,
        };
        let dispatcher = Self {
            waiters: HashMap::new(),
            lock_write_tx,
            shutdown,
            acquire_rx,
            release_rx,
            rescind_rx,
            cascade_rx,
        };
        (waitlist, dispatcher)
    }

    pub(crate) async fn run(mut self) {
        info!("started waitlist dispatcher");
        loop {
            tokio::select! {
                Some(op) = self.acquire_rx.recv() => self.handle_acquire(op),
                Some(key) = self.release_rx.recv() => self.handle_release(key).await,
                Some(rescind) = self.rescind_rx.recv() => self.handle_rescind(rescind).await,
                Some(key) = self.cascade_rx.recv() => self.handle_cascade(key),
                _ = self.shutdown.recv() => break,
                else => break,
            }
        }
        info!("stopped waitlist dispatcher");
    }

    /// A direct lock write already failed for this waiter, so the holder
    /// exists by construction; no immediate grant is attempted.
    fn handle_acquire(&mut self, op: WriteOp) {
        let key = op.entry.key().to_owned();
        debug!(key = %key, id = %op.value, "queueing waiter");
        self.waiters.entry(key).or_default().push_back(op);
    }

    async fn handle_release(&mut self, key: String) {
        debug!(key = %key, "read release queue");
        let Some(queue) = self.waiters.get_mut(&key) else {
            return;
        };
        let waiter = queue.pop_front();
        if queue.is_empty() {
            debug!(key = %key, "cleaning empty waitlist");
            self.waiters.remove(&key);
        }
        let Some(waiter) = waiter else {
            return;
        };
        debug!(key = %key, id = %waiter.value, "handing lock to the oldest waiter");
        // A full lock-write queue blocks this loop on purpose: the handoff
        // must land before any later release is processed.
        if self.lock_write_tx.send(LockWrite::Set(waiter)).await.is_err() {
            warn!(key = %key, "atomics dispatcher is gone, dropping lock handoff");
        }
    }

    async fn handle_rescind(&mut self, rescind: Rescind) {
        let Rescind { entry, id } = rescind;
        let key = entry.key().to_owned();
        let mut removed = false;
        if let Some(queue) = self.waiters.get_mut(&key) {
            if let Some(pos) = queue.iter().position(|waiter| waiter.value == id) {
                queue.remove(pos);
                removed = true;
            }
            if queue.is_empty() {
                debug!(key = %key, "cleaning empty waitlist");
                self.waiters.remove(&key);
            }
        }
        if removed {
            debug!(key = %key, id = %id, "removed timed-out waiter");
            return;
        }
        // The waiter is not queued anymore: its lock write already went
        // out. Chase the grant on the same queue so that by the time the
        // revoke is processed, the grant has landed and can be undone.
        debug!(key = %key, id = %id, "timed-out waiter already granted, revoking");
        if self
            .lock_write_tx
            .send(LockWrite::Revoke { entry, id })
            .await
            .is_err()
        {
            warn!(key = %key, "atomics dispatcher is gone, dropping lock revoke");
        }
    }

    fn handle_cascade(&mut self, key: String) {
        let Some(mut queue) = self.waiters.remove(&key) else {
            return;
        };
        debug!(key = %key, waiters = queue.len(), "failing all waiters for deleted entry");
        for waiter in queue.drain(..) {
            let _ = waiter.reply.send(Err(TurnstileError::DeletedWhileWaiting));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time;

    use crate::{
        Turnstile, base::TurnstileError, config::AppConfig, entry::Entry, tests::setup_tracing,
    };

    const WAIT: Duration = Duration::from_secs(2);

    /// Lets the dispatcher tasks drain whatever is in flight.
    async fn settle() {
        time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_handoff_is_fifo() {
        setup_tracing();
        let turnstile = Turnstile::launch(&AppConfig::for_testing());
        turnstile
            .store
            .add(Entry::with_state("alpha", "v1", "HOLD1"))
            .await
            .expect("seed entry");
        let entry = turnstile.store.get("alpha").await.expect("get");

        let first = {
            let waitlist = turnstile.waitlist.clone();
            let entry = entry.clone();
            tokio::spawn(async move { waitlist.acquire(&entry, "AAAAA", WAIT).await })
        };
        settle().await;
        let second = {
            let waitlist = turnstile.waitlist.clone();
            let entry = entry.clone();
            tokio::spawn(async move { waitlist.acquire(&entry, "BBBBB", WAIT).await })
        };
        settle().await;

        // First release reaches the oldest waiter.
        turnstile.atomics.unset_lock_id(&entry).await.expect("unset");
        first.await.expect("join").expect("first waiter acquires");
        assert_eq!(turnstile.atomics.lock_id(&entry).await.expect("lock id"), "AAAAA");

        turnstile.atomics.unset_lock_id(&entry).await.expect("unset");
        second.await.expect("join").expect("second waiter acquires");
        assert_eq!(turnstile.atomics.lock_id(&entry).await.expect("lock id"), "BBBBB");
    }

    #[tokio::test]
    async fn test_timeout_leaves_holder_and_order_intact() {
        setup_tracing();
        let turnstile = Turnstile::launch(&AppConfig::for_testing());
        turnstile
            .store
            .add(Entry::with_state("alpha", "v1", "HOLD1"))
            .await
            .expect("seed entry");
        let entry = turnstile.store.get("alpha").await.expect("get");

        let impatient = {
            let waitlist = turnstile.waitlist.clone();
            let entry = entry.clone();
            tokio::spawn(
                async move { waitlist.acquire(&entry, "AAAAA", Duration::from_millis(100)).await },
            )
        };
        settle().await;
        let patient = {
            let waitlist = turnstile.waitlist.clone();
            let entry = entry.clone();
            tokio::spawn(async move { waitlist.acquire(&entry, "BBBBB", WAIT).await })
        };

        let err = impatient.await.expect("join").expect_err("first waiter times out");
        assert!(matches!(err, TurnstileError::AcquireTimedOut));
        assert_eq!(
            turnstile.atomics.lock_id(&entry).await.expect("lock id"),
            "HOLD1",
            "a timeout never touches the held lock",
        );

        // The remaining waiter is next in line despite the removal.
        turnstile.atomics.unset_lock_id(&entry).await.expect("unset");
        patient.await.expect("join").expect("second waiter acquires");
        assert_eq!(turnstile.atomics.lock_id(&entry).await.expect("lock id"), "BBBBB");
    }

    #[tokio::test]
    async fn test_rescind_revokes_granted_lock() {
        setup_tracing();
        let turnstile = Turnstile::launch(&AppConfig::for_testing());
        turnstile
            .store
            .add(Entry::with_state("alpha", "v1", "HOLD1"))
            .await
            .expect("seed entry");
        let entry = turnstile.store.get("alpha").await.expect("get");

        let waiter = {
            let waitlist = turnstile.waitlist.clone();
            let entry = entry.clone();
            tokio::spawn(async move { waitlist.acquire(&entry, "AAAAA", WAIT).await })
        };
        settle().await;

        turnstile.atomics.unset_lock_id(&entry).await.expect("unset");
        waiter.await.expect("join").expect("waiter acquires");
        assert_eq!(turnstile.atomics.lock_id(&entry).await.expect("lock id"), "AAAAA");

        // A rescind arriving after the grant revokes it instead of leaving
        // the lock orphaned under an id nobody knows.
        turnstile
            .waitlist
            .rescind_for_testing(&entry, "AAAAA")
            .await
            .expect("rescind");
        settle().await;
        assert!(!turnstile.atomics.is_locked(&entry).await.expect("is-locked"));
        assert!(!turnstile.locks.exists("AAAAA").await, "revoked id retired");
    }

    #[tokio::test]
    async fn test_rescind_after_grant_hands_to_next_waiter() {
        setup_tracing();
        let turnstile = Turnstile::launch(&AppConfig::for_testing());
        turnstile
            .store
            .add(Entry::with_state("alpha", "v1", "HOLD1"))
            .await
            .expect("seed entry");
        let entry = turnstile.store.get("alpha").await.expect("get");

        let abandoned = {
            let waitlist = turnstile.waitlist.clone();
            let entry = entry.clone();
            tokio::spawn(async move { waitlist.acquire(&entry, "AAAAA", WAIT).await })
        };
        settle().await;
        let next = {
            let waitlist = turnstile.waitlist.clone();
            let entry = entry.clone();
            tokio::spawn(async move { waitlist.acquire(&entry, "BBBBB", WAIT).await })
        };
        settle().await;

        turnstile.atomics.unset_lock_id(&entry).await.expect("unset");
        abandoned.await.expect("join").expect("first waiter acquires");

        // Revoking the abandoned grant releases again, so the next waiter
        // inherits the lock.
        turnstile
            .waitlist
            .rescind_for_testing(&entry, "AAAAA")
            .await
            .expect("rescind");
        next.await.expect("join").expect("next waiter acquires");
        assert_eq!(turnstile.atomics.lock_id(&entry).await.expect("lock id"), "BBBBB");
    }

    #[tokio::test]
    async fn test_delete_cascade_fails_all_waiters() {
        setup_tracing();
        let turnstile = Turnstile::launch(&AppConfig::for_testing());
        turnstile
            .store
            .add(Entry::with_state("alpha", "v1", "HOLD1"))
            .await
            .expect("seed entry");
        let entry = turnstile.store.get("alpha").await.expect("get");

        let waiters: Vec<_> = ["AAAAA", "BBBBB", "CCCCC"]
            .into_iter()
            .map(|id| {
                let waitlist = turnstile.waitlist.clone();
                let entry = entry.clone();
                tokio::spawn(async move { waitlist.acquire(&entry, id, WAIT).await })
            })
            .collect();
        settle().await;

        turnstile.store.delete("alpha").await.expect("delete");
        for waiter in waiters {
            let err = waiter.await.expect("join").expect_err("waiter fails");
            assert!(matches!(err, TurnstileError::DeletedWhileWaiting));
        }
        assert!(!turnstile.locks.exists("HOLD1").await, "holder id retired on delete");
        assert!(!turnstile.store.exists("alpha").await);
    }
}
