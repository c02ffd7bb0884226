//! User-session location directory.
//!
//! Maps a user identity plus a location kind to the instance currently
//! serving it: the gateway binding is single-valued, node bindings hold one
//! value per node kind. Binds are unconditional upserts; unbinds are
//! compare-and-swap, so a slow or stale unbind can never erase a newer,
//! still-valid binding. Every successful change is broadcast over the
//! backend's pub/sub layer, and watches reuse the fork/recycle engine so
//! any number of consumers of one kind combination share one upstream
//! subscription.

use std::collections::BTreeSet;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use futures::stream::select_all;
use futures::stream::SelectAll;
use futures::StreamExt;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::sync::OwnedMutexGuard;
use tokio::time::sleep;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use super::gate_key;
use super::locate_channel;
use super::node_key;
use crate::constants::RESUBSCRIBE_BASE_DELAY_MS;
use crate::constants::RESUBSCRIBE_JITTER_MS;
use crate::LocateError;
use crate::LocateEvent;
use crate::LocateEventType;
use crate::LocatorConfig;
use crate::PayloadStream;
use crate::Result;
use crate::Store;
use crate::Watcher;
use crate::WatcherMgr;
use crate::KIND_GATE;

/// One binding slot: a user identity plus a location kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BindingKey {
    uid: u64,
    kind: String,
}

impl BindingKey {
    fn gate(uid: u64) -> Self {
        Self {
            uid,
            kind: KIND_GATE.to_string(),
        }
    }

    fn node(
        uid: u64,
        kind: &str,
    ) -> Self {
        Self {
            uid,
            kind: kind.to_string(),
        }
    }
}

/// Per-binding critical sections.
///
/// An entry exists only while some caller holds or awaits its lock; the
/// release path removes entries nobody references, so the table tracks
/// in-flight operations rather than every binding ever touched.
struct BindingLocks {
    table: DashMap<BindingKey, Arc<Mutex<()>>>,
}

impl BindingLocks {
    fn new() -> Self {
        Self {
            table: DashMap::new(),
        }
    }

    async fn acquire(
        &self,
        key: &BindingKey,
    ) -> OwnedMutexGuard<()> {
        let lock = self
            .table
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    fn release(
        &self,
        key: &BindingKey,
        guard: OwnedMutexGuard<()>,
    ) {
        drop(guard);
        // A waiter always clones the Arc under the map's shard lock, so a
        // strong count of 1 here means nobody holds or awaits this entry
        self.table.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

pub struct Locator {
    store: Arc<dyn Store>,
    config: LocatorConfig,

    /// Local view of bindings this process looked up, bound, or saw
    /// through a watch delivery; evicted on unbind
    cache: Arc<DashMap<BindingKey, String>>,

    locks: BindingLocks,

    /// One watch manager per sorted kind combination
    managers: Arc<DashMap<String, Arc<WatcherMgr<LocateEvent>>>>,
    manager_seq: AtomicU64,

    /// Root scope; cancelling it cascades to every manager and fork owned
    /// by this locator
    token: CancellationToken,
}

impl Locator {
    pub fn new(
        store: Arc<dyn Store>,
        config: LocatorConfig,
    ) -> Self {
        Self {
            store,
            config,
            cache: Arc::new(DashMap::new()),
            locks: BindingLocks::new(),
            managers: Arc::new(DashMap::new()),
            manager_seq: AtomicU64::new(0),
            token: CancellationToken::new(),
        }
    }

    /// Instance currently serving the user's gateway connection.
    pub async fn locate_gate(
        &self,
        uid: u64,
    ) -> Result<String> {
        self.locate(BindingKey::gate(uid), gate_key(&self.config.namespace, uid))
            .await
    }

    /// Instance currently serving the user on one node kind.
    pub async fn locate_node(
        &self,
        uid: u64,
        kind: &str,
    ) -> Result<String> {
        self.locate(
            BindingKey::node(uid, kind),
            node_key(&self.config.namespace, uid, kind),
        )
        .await
    }

    /// Cache-first lookup; concurrent misses for the same binding collapse
    /// into one backend read.
    async fn locate(
        &self,
        binding: BindingKey,
        key: String,
    ) -> Result<String> {
        if let Some(hit) = self.cache.get(&binding) {
            return Ok(hit.value().clone());
        }

        let guard = self.locks.acquire(&binding).await;
        // A concurrent locate or a watch delivery may have filled the
        // cache while this caller waited on the lock
        let result = match self.cache.get(&binding).map(|hit| hit.value().clone()) {
            Some(hit) => Ok(hit),
            None => match self.read_binding(&key).await {
                Ok(Some(instance_id)) => {
                    self.cache.insert(binding.clone(), instance_id.clone());
                    Ok(instance_id)
                }
                Ok(None) => Err(LocateError::NotFound {
                    uid: binding.uid,
                    kind: binding.kind.clone(),
                }
                .into()),
                Err(e) => Err(e),
            },
        };
        self.locks.release(&binding, guard);
        result
    }

    /// Bind the user's gateway. Unconditional upsert; a previous binding
    /// is overwritten.
    pub async fn bind_gate(
        &self,
        uid: u64,
        gid: &str,
    ) -> Result<()> {
        self.bind(
            BindingKey::gate(uid),
            gate_key(&self.config.namespace, uid),
            gid,
            LocateEventType::BindGate,
        )
        .await
    }

    /// Bind the user on one node kind. Unconditional upsert.
    pub async fn bind_node(
        &self,
        uid: u64,
        kind: &str,
        nid: &str,
    ) -> Result<()> {
        self.bind(
            BindingKey::node(uid, kind),
            node_key(&self.config.namespace, uid, kind),
            nid,
            LocateEventType::BindNode,
        )
        .await
    }

    async fn bind(
        &self,
        binding: BindingKey,
        key: String,
        instance_id: &str,
        typ: LocateEventType,
    ) -> Result<()> {
        let guard = self.locks.acquire(&binding).await;
        let result = self.store.put(&key, instance_id.as_bytes().to_vec(), None).await;
        if result.is_ok() {
            self.cache.insert(binding.clone(), instance_id.to_string());
        }
        self.locks.release(&binding, guard);
        result?;

        // The bind has already succeeded; a notification-layer failure
        // must not roll it back
        self.publish(LocateEvent::new(binding.uid, typ, instance_id, binding.kind))
            .await;
        Ok(())
    }

    /// Remove the user's gateway binding, but only while it still points
    /// at `gid`. A mismatch (the user reconnected elsewhere meanwhile) is
    /// a silent no-op, as is unbinding an absent binding.
    pub async fn unbind_gate(
        &self,
        uid: u64,
        gid: &str,
    ) -> Result<()> {
        self.unbind(
            BindingKey::gate(uid),
            gate_key(&self.config.namespace, uid),
            gid,
            LocateEventType::UnbindGate,
        )
        .await
    }

    /// Remove the user's binding for one node kind, but only while it
    /// still points at `nid`.
    pub async fn unbind_node(
        &self,
        uid: u64,
        kind: &str,
        nid: &str,
    ) -> Result<()> {
        self.unbind(
            BindingKey::node(uid, kind),
            node_key(&self.config.namespace, uid, kind),
            nid,
            LocateEventType::UnbindNode,
        )
        .await
    }

    async fn unbind(
        &self,
        binding: BindingKey,
        key: String,
        instance_id: &str,
        typ: LocateEventType,
    ) -> Result<()> {
        let guard = self.locks.acquire(&binding).await;
        let result = self.unbind_locked(&binding, &key, instance_id).await;
        self.locks.release(&binding, guard);

        if result? {
            self.publish(LocateEvent::new(binding.uid, typ, instance_id, binding.kind))
                .await;
        }
        Ok(())
    }

    /// Compare-and-swap realized as read-check-delete under the binding's
    /// critical section. Returns whether the binding was removed.
    async fn unbind_locked(
        &self,
        binding: &BindingKey,
        key: &str,
        instance_id: &str,
    ) -> Result<bool> {
        match self.read_binding(key).await? {
            Some(current) if current == instance_id => {
                self.store.delete(key).await?;
                self.cache.remove(binding);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Read the exact record of one binding. The store contract is
    /// prefix-based, so sibling keys extending this one are filtered out.
    async fn read_binding(
        &self,
        key: &str,
    ) -> Result<Option<String>> {
        let records = self.store.read(key).await?;
        let Some(record) = records.into_iter().find(|record| record.key == key) else {
            return Ok(None);
        };
        let instance_id = String::from_utf8(record.value)
            .map_err(|_| LocateError::Malformed(format!("binding at {} is not utf-8", key)))?;
        Ok(Some(instance_id))
    }

    /// Best-effort broadcast on the kind's channel.
    async fn publish(
        &self,
        event: LocateEvent,
    ) {
        let channel = locate_channel(&self.config.namespace, &event.instance_kind);
        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("failed to encode locate event for {}: {:?}", channel, e);
                return;
            }
        };
        if let Err(e) = self.store.publish(&channel, payload).await {
            warn!("failed to broadcast locate event on {}: {:?}", channel, e);
        }
    }

    /// Attach a new fork to the watch manager for this kind combination,
    /// creating the manager (one subscription per kind) when the
    /// combination is not watched yet. Two callers watching the same set
    /// of kinds share one manager regardless of argument order.
    ///
    /// Deliveries also maintain the local location cache, giving
    /// cross-process invalidation to any process holding a watch.
    pub async fn watch(
        &self,
        kinds: &[&str],
    ) -> Result<Watcher<LocateEvent>> {
        let kind_set: BTreeSet<String> = kinds.iter().map(|kind| kind.to_string()).collect();
        if kind_set.is_empty() {
            return Err(LocateError::EmptyKinds.into());
        }
        let watch_key = kind_set.iter().cloned().collect::<Vec<_>>().join(",");

        loop {
            if let Some(mgr) = self.managers.get(&watch_key).map(|e| e.value().clone()) {
                if let Some(watcher) = mgr.fork() {
                    return Ok(watcher);
                }
                // Raced the manager's teardown; drop the stale entry unless
                // a successor already owns the slot
                self.managers
                    .remove_if(&watch_key, |_, m| m.serial() == mgr.serial());
                continue;
            }

            let stream =
                subscribe_kinds(self.store.as_ref(), &self.config.namespace, &kind_set).await?;

            // Location watches carry no point-in-time snapshot; the first
            // next() blocks like any other
            let serial = self.manager_seq.fetch_add(1, Ordering::SeqCst) + 1;
            let mgr = WatcherMgr::new(
                watch_key.clone(),
                serial,
                self.config.watch_queue_capacity,
                &self.token,
                None,
            );

            match self.managers.entry(watch_key.clone()) {
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    let Some(watcher) = mgr.fork() else { continue };

                    let managers = Arc::clone(&self.managers);
                    let key = watch_key.clone();
                    mgr.set_on_close(Box::new(move || {
                        managers.remove_if(&key, |_, m| m.serial() == serial);
                    }));
                    slot.insert(Arc::clone(&mgr));

                    tokio::spawn(run_locate_watch_loop(
                        Arc::clone(&mgr),
                        stream,
                        Arc::clone(&self.store),
                        Arc::clone(&self.cache),
                        self.config.namespace.clone(),
                        kind_set,
                    ));

                    debug!("created locate watch manager for kinds {}", mgr.key());
                    return Ok(watcher);
                }
                dashmap::mapref::entry::Entry::Occupied(_) => {
                    // Another caller won the slot; discard ours (its
                    // streams drop here, before any loop started)
                    mgr.abandon();
                    continue;
                }
            }
        }
    }

    /// Cancel every manager and fork owned by this locator. Pending `next`
    /// calls return a cancellation error.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    #[cfg(test)]
    pub(crate) fn manager_count(&self) -> usize {
        self.managers.len()
    }

    #[cfg(test)]
    pub(crate) fn cached(
        &self,
        uid: u64,
        kind: &str,
    ) -> Option<String> {
        self.cache
            .get(&BindingKey::node(uid, kind))
            .map(|hit| hit.value().clone())
    }
}

/// Open one subscription per kind and merge them into a single stream.
async fn subscribe_kinds(
    store: &dyn Store,
    namespace: &str,
    kinds: &BTreeSet<String>,
) -> Result<SelectAll<PayloadStream>> {
    let mut streams = Vec::with_capacity(kinds.len());
    for kind in kinds {
        streams.push(store.subscribe(&locate_channel(namespace, kind)).await?);
    }
    Ok(select_all(streams))
}

/// Consume the merged per-kind subscriptions, maintaining the local cache
/// and fanning decoded events out; resubscribes when the upstream ends.
async fn run_locate_watch_loop(
    mgr: Arc<WatcherMgr<LocateEvent>>,
    mut stream: SelectAll<PayloadStream>,
    store: Arc<dyn Store>,
    cache: Arc<DashMap<BindingKey, String>>,
    namespace: String,
    kinds: BTreeSet<String>,
) {
    loop {
        tokio::select! {
            _ = mgr.token().cancelled() => break,
            maybe_payload = stream.next() => match maybe_payload {
                Some(payload) => {
                    let event: LocateEvent = match serde_json::from_slice(&payload) {
                        Ok(event) => event,
                        Err(e) => {
                            warn!("dropping malformed locate event on {}: {:?}", mgr.key(), e);
                            continue;
                        }
                    };
                    apply_locate_event(&cache, &event);
                    mgr.broadcast(vec![event]).await;
                }
                None => {
                    warn!("locate subscriptions for {} ended, resubscribing", mgr.key());
                    match subscribe_kinds(store.as_ref(), &namespace, &kinds).await {
                        Ok(fresh) => stream = fresh,
                        Err(e) => {
                            warn!("resubscribe for {} failed: {:?}", mgr.key(), e);
                            let backoff = Duration::from_millis(
                                RESUBSCRIBE_BASE_DELAY_MS
                                    + rand::thread_rng().gen_range(0..RESUBSCRIBE_JITTER_MS),
                            );
                            tokio::select! {
                                _ = mgr.token().cancelled() => break,
                                _ = sleep(backoff) => {}
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Mirror one broadcast into the local cache: binds upsert, unbinds evict
/// (only while the cached value still matches the unbound instance).
fn apply_locate_event(
    cache: &DashMap<BindingKey, String>,
    event: &LocateEvent,
) {
    let binding = BindingKey {
        uid: event.uid,
        kind: event.instance_kind.clone(),
    };
    if event.is_bind() {
        cache.insert(binding, event.instance_id.clone());
    } else {
        cache.remove_if(&binding, |_, current| current == &event.instance_id);
    }
}
