//! Watch multiplexing engine (fork/recycle pattern).
//!
//! A [`WatcherMgr`] owns exactly one upstream backend subscription for one
//! resource key and fans its events out to any number of [`Watcher`] forks.
//! Forks are passive queue holders drained by their own callers; the last
//! fork to stop tears the manager down, cancelling the subscription task
//! and removing the manager from its owner's keyed index.
//!
//! The engine is generic over the delivered event type: the registry
//! instantiates it with service events, the locator with locate events.
//! Backend-specific subscription loops live with the owning facade; their
//! only obligation is to call [`WatcherMgr::broadcast`].

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::Result;
use crate::WatchError;

/// Invoked (at most once) when the last fork of a manager is recycled, so
/// the owning facade can drop the manager from its keyed index.
type OnCloseFn = Box<dyn FnOnce() + Send>;

pub struct WatcherMgr<E> {
    /// Resource key this manager multiplexes (service name, or a joined
    /// kind set for the locator)
    key: String,

    /// Distinguishes this manager from a successor under the same key
    serial: u64,

    forks: RwLock<ForkTable<E>>,
    next_fork_id: AtomicU64,

    /// Point-in-time event view maintained by the subscription loop;
    /// captured by each new fork for its first delivery. `None` for
    /// resources without snapshot semantics (location watches).
    snapshot: Option<ArcSwap<Vec<E>>>,

    queue_capacity: usize,

    /// Scope of the upstream subscription task; child of the facade scope
    token: CancellationToken,

    on_close: Mutex<Option<OnCloseFn>>,
}

struct ForkTable<E> {
    closed: bool,
    senders: HashMap<u64, mpsc::Sender<Vec<E>>>,
}

impl<E> WatcherMgr<E> {
    pub(crate) fn new(
        key: impl Into<String>,
        serial: u64,
        queue_capacity: usize,
        parent: &CancellationToken,
        initial_snapshot: Option<Vec<E>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key: key.into(),
            serial,
            forks: RwLock::new(ForkTable {
                closed: false,
                senders: HashMap::new(),
            }),
            next_fork_id: AtomicU64::new(0),
            snapshot: initial_snapshot.map(|events| ArcSwap::from_pointee(events)),
            queue_capacity,
            token: parent.child_token(),
            on_close: Mutex::new(None),
        })
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    /// Scope the subscription loop selects on.
    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Register the index-removal callback. Set once by the owning facade
    /// right after the manager wins its slot in the keyed index.
    pub(crate) fn set_on_close(
        &self,
        on_close: OnCloseFn,
    ) {
        *self.on_close.lock() = Some(on_close);
    }

    /// Current snapshot, for point-in-time reads served without a backend
    /// round-trip. `None` when this manager keeps no snapshot.
    pub(crate) fn snapshot(&self) -> Option<Arc<Vec<E>>> {
        self.snapshot.as_ref().map(|s| s.load_full())
    }

    pub(crate) fn store_snapshot(
        &self,
        events: Vec<E>,
    ) {
        if let Some(snapshot) = &self.snapshot {
            snapshot.store(Arc::new(events));
        }
    }

    /// Allocate a new fork.
    ///
    /// Returns `None` once the manager has been recycled; the caller is
    /// expected to drop its reference and create a fresh manager.
    pub(crate) fn fork(self: &Arc<Self>) -> Option<Watcher<E>> {
        let mut table = self.forks.write();
        if table.closed {
            return None;
        }

        let id = self.next_fork_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        table.senders.insert(id, tx);

        // Captured under the table lock so the first delivery reflects the
        // state at fork creation; a broadcast racing in may be seen twice
        // (snapshot and queue), which the at-least-once contract permits.
        let initial = self.snapshot.as_ref().map(|s| s.load_full());

        trace!("forked watcher {} on {}", id, self.key);
        Some(Watcher {
            id,
            mgr: Arc::clone(self),
            rx,
            token: self.token.child_token(),
            initial,
            stopped: false,
        })
    }

    /// Drop one fork from the table, tearing the manager down when the
    /// table empties.
    pub(crate) fn recycle(
        &self,
        fork_id: u64,
    ) {
        let on_close = {
            let mut table = self.forks.write();
            table.senders.remove(&fork_id);
            if table.senders.is_empty() && !table.closed {
                table.closed = true;
                self.token.cancel();
                self.on_close.lock().take()
            } else {
                None
            }
        };

        if let Some(on_close) = on_close {
            trace!("last fork recycled, closing manager for {}", self.key);
            // Runs outside the fork-table lock
            on_close();
        }
    }

    /// Discard a manager that lost the creation race before any fork or
    /// subscription loop existed.
    pub(crate) fn abandon(&self) {
        let mut table = self.forks.write();
        table.closed = true;
        self.token.cancel();
    }

    #[cfg(test)]
    pub(crate) fn fork_count(&self) -> usize {
        self.forks.read().senders.len()
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.forks.read().closed
    }
}

impl<E> WatcherMgr<E>
where
    E: Clone + Send + 'static,
{
    /// Push one translated event batch to every live fork.
    ///
    /// A full fork queue backpressures this call for that fork; stopping
    /// the fork drops its receiver and unblocks the send.
    pub(crate) async fn broadcast(
        &self,
        events: Vec<E>,
    ) {
        if events.is_empty() {
            return;
        }

        let senders: Vec<mpsc::Sender<Vec<E>>> = {
            let table = self.forks.read();
            if table.closed {
                return;
            }
            table.senders.values().cloned().collect()
        };

        for tx in senders {
            // Err means the fork stopped mid-broadcast; recycle removes it
            let _ = tx.send(events.clone()).await;
        }
    }
}

/// An independent consumer handle attached to a shared [`WatcherMgr`].
pub struct Watcher<E> {
    /// Unique within the owning manager
    id: u64,

    mgr: Arc<WatcherMgr<E>>,
    rx: mpsc::Receiver<Vec<E>>,
    token: CancellationToken,

    /// Snapshot served by the first `next` call, when the manager keeps one
    initial: Option<Arc<Vec<E>>>,

    stopped: bool,
}

impl<E> Watcher<E> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stop this fork and recycle its slot. Idempotent.
    pub fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        self.token.cancel();
        self.rx.close();
        self.mgr.recycle(self.id);
        Ok(())
    }
}

impl<E> Watcher<E>
where
    E: Clone,
{
    /// Wait for the next event batch.
    ///
    /// The first call on a snapshot-keeping manager returns the state
    /// captured at fork creation immediately, so a late subscriber is not
    /// silently behind. Blocks otherwise until a broadcast arrives or the
    /// fork's scope is canceled. Callers wanting a deadline wrap this in
    /// `tokio::time::timeout`.
    pub async fn next(&mut self) -> Result<Vec<E>> {
        if self.stopped {
            return Err(WatchError::Canceled.into());
        }

        if let Some(initial) = self.initial.take() {
            return Ok(initial.as_ref().clone());
        }

        tokio::select! {
            _ = self.token.cancelled() => Err(WatchError::Canceled.into()),
            batch = self.rx.recv() => match batch {
                Some(events) => Ok(events),
                // Queue shut down by the manager
                None => Err(WatchError::Canceled.into()),
            },
        }
    }
}

impl<E> Drop for Watcher<E> {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
