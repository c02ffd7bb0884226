//! In-process backend store.
//!
//! Implements the full [`Store`] contract against process-local state:
//! revisioned KV entries, lease deadlines enforced by a sweeper task, and
//! broadcast-channel pub/sub. Used for single-process deployments and as
//! the backend of the crate's scenario tests.

use std::pin::Pin;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::Stream;
use futures::StreamExt;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::EventStream;
use super::KeyValue;
use super::LeaseId;
use super::PayloadStream;
use super::Store;
use super::StoreEvent;
use super::StoreEventType;
use crate::Result;
use crate::StoreError;

/// How often the sweeper checks for expired leases.
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Broadcast capacity per pub/sub channel.
const CHANNEL_CAPACITY: usize = 256;

pub struct MemoryStore {
    inner: Arc<MemoryInner>,
    sweeper_token: CancellationToken,
}

struct MemoryInner {
    revision: AtomicU64,
    lease_seq: AtomicU64,
    watcher_seq: AtomicU64,
    entries: DashMap<String, MemEntry>,
    leases: DashMap<LeaseId, MemLease>,
    watchers: DashMap<u64, MemWatcher>,
    channels: DashMap<String, broadcast::Sender<Vec<u8>>>,
}

struct MemEntry {
    value: Vec<u8>,
    lease: Option<LeaseId>,
}

struct MemLease {
    key: String,
    ttl: Duration,
    deadline: RwLock<Instant>,
}

struct MemWatcher {
    prefix: String,
    tx: mpsc::UnboundedSender<StoreEvent>,
}

impl MemoryStore {
    /// Create a store and start its lease sweeper.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let inner = Arc::new(MemoryInner {
            revision: AtomicU64::new(0),
            lease_seq: AtomicU64::new(0),
            watcher_seq: AtomicU64::new(0),
            entries: DashMap::new(),
            leases: DashMap::new(),
            watchers: DashMap::new(),
            channels: DashMap::new(),
        });

        let sweeper_token = CancellationToken::new();
        Self::start_sweeper(Arc::downgrade(&inner), sweeper_token.clone());

        Self { inner, sweeper_token }
    }

    fn start_sweeper(
        inner: Weak<MemoryInner>,
        token: CancellationToken,
    ) {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {
                        let Some(inner) = inner.upgrade() else { break };
                        inner.sweep_expired();
                    }
                }
            }
        });
    }

    /// Number of live leases, visible for tests.
    #[cfg(test)]
    pub(crate) fn lease_count(&self) -> usize {
        self.inner.leases.len()
    }

    /// Number of registered prefix watchers, visible for tests.
    #[cfg(test)]
    pub(crate) fn watcher_count(&self) -> usize {
        self.inner.watchers.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        self.sweeper_token.cancel();
    }
}

impl MemoryInner {
    fn next_revision(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Fan one change out to every watcher whose prefix matches; watchers
    /// whose stream was dropped are unregistered on the way.
    fn emit(
        &self,
        event: StoreEvent,
    ) {
        let mut dead = Vec::new();
        for watcher in self.watchers.iter() {
            if !event.key.starts_with(watcher.prefix.as_str()) {
                continue;
            }
            if watcher.tx.send(event.clone()).is_err() {
                dead.push(*watcher.key());
            }
        }
        for id in dead {
            self.watchers.remove(&id);
        }
    }

    fn sweep_expired(&self) {
        let now = Instant::now();
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|lease| *lease.deadline.read() <= now)
            .map(|lease| *lease.key())
            .collect();

        for lease_id in expired {
            let Some((_, lease)) = self.leases.remove(&lease_id) else {
                continue;
            };
            // A newer put may own the key by now; only expire our own record
            let removed = self
                .entries
                .remove_if(&lease.key, |_, entry| entry.lease == Some(lease_id));
            if removed.is_some() {
                trace!("lease {} expired, removed key {}", lease_id, lease.key);
                self.emit(StoreEvent {
                    typ: StoreEventType::Delete,
                    key: lease.key.clone(),
                    value: Vec::new(),
                    revision: self.next_revision(),
                });
            }
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<Option<LeaseId>> {
        let lease_id = ttl.map(|ttl| {
            let id = self.inner.lease_seq.fetch_add(1, Ordering::SeqCst) + 1;
            self.inner.leases.insert(
                id,
                MemLease {
                    key: key.to_string(),
                    ttl,
                    deadline: RwLock::new(Instant::now() + ttl),
                },
            );
            id
        });

        let old = self.inner.entries.insert(
            key.to_string(),
            MemEntry {
                value: value.clone(),
                lease: lease_id,
            },
        );
        // An overwritten record releases its previous lease
        if let Some(old_lease) = old.and_then(|e| e.lease) {
            self.inner.leases.remove(&old_lease);
        }

        self.inner.emit(StoreEvent {
            typ: StoreEventType::Put,
            key: key.to_string(),
            value,
            revision: self.inner.next_revision(),
        });

        Ok(lease_id)
    }

    async fn renew(
        &self,
        lease: LeaseId,
    ) -> Result<()> {
        match self.inner.leases.get(&lease) {
            Some(entry) => {
                *entry.deadline.write() = Instant::now() + entry.ttl;
                Ok(())
            }
            None => Err(StoreError::LeaseNotFound(lease).into()),
        }
    }

    async fn delete(
        &self,
        key: &str,
    ) -> Result<()> {
        let Some((_, entry)) = self.inner.entries.remove(key) else {
            return Ok(());
        };
        if let Some(lease) = entry.lease {
            self.inner.leases.remove(&lease);
        }
        self.inner.emit(StoreEvent {
            typ: StoreEventType::Delete,
            key: key.to_string(),
            value: Vec::new(),
            revision: self.inner.next_revision(),
        });
        Ok(())
    }

    async fn read(
        &self,
        prefix: &str,
    ) -> Result<Vec<KeyValue>> {
        let mut records: Vec<KeyValue> = self
            .inner
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| KeyValue {
                key: entry.key().clone(),
                value: entry.value.clone(),
            })
            .collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }

    async fn watch(
        &self,
        prefix: &str,
        _cursor: Option<u64>,
    ) -> Result<EventStream> {
        // No durable history to replay; streams start at the current state
        let id = self.inner.watcher_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.watchers.insert(
            id,
            MemWatcher {
                prefix: prefix.to_string(),
                tx,
            },
        );
        Ok(Box::pin(PrefixWatchStream {
            id,
            rx,
            inner: Arc::downgrade(&self.inner),
        }))
    }

    async fn publish(
        &self,
        channel: &str,
        payload: Vec<u8>,
    ) -> Result<()> {
        if let Some(sender) = self.inner.channels.get(channel) {
            // No receivers is not a failure for fire-and-forget broadcast
            let _ = sender.send(payload);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<PayloadStream> {
        let rx = self
            .inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        let stream = BroadcastStream::new(rx).filter_map(|payload| async move { payload.ok() });
        Ok(Box::pin(stream))
    }
}

/// Watch stream handle; dropping it unregisters the watcher.
struct PrefixWatchStream {
    id: u64,
    rx: mpsc::UnboundedReceiver<StoreEvent>,
    inner: Weak<MemoryInner>,
}

impl Stream for PrefixWatchStream {
    type Item = StoreEvent;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<StoreEvent>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for PrefixWatchStream {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.watchers.remove(&self.id);
        }
    }
}
