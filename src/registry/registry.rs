//! Public entry point for service registration and discovery.
//!
//! Combines a map of registrars (by instance id) with a map of watch
//! managers (by service name). Any number of callers may watch the same
//! service; they share one manager and therefore one upstream backend
//! subscription.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use rand::Rng;
use tokio::time::sleep;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use super::service_prefix;
use super::Registrar;
use crate::constants::RESUBSCRIBE_BASE_DELAY_MS;
use crate::constants::RESUBSCRIBE_JITTER_MS;
use crate::EventStream;
use crate::InstanceCodec;
use crate::JsonCodec;
use crate::RegistryConfig;
use crate::RegistryError;
use crate::Result;
use crate::ServiceEvent;
use crate::ServiceInstance;
use crate::Store;
use crate::StoreEvent;
use crate::StoreEventType;
use crate::Watcher;
use crate::WatcherMgr;

pub struct Registry {
    store: Arc<dyn Store>,
    codec: Arc<dyn InstanceCodec>,
    config: RegistryConfig,

    /// One registrar per locally-owned instance, keyed by instance id
    registrars: DashMap<String, Arc<Registrar>>,

    /// One watch manager per watched service name
    managers: Arc<DashMap<String, Arc<WatcherMgr<ServiceEvent>>>>,
    manager_seq: AtomicU64,

    /// Root scope; cancelling it cascades to every heartbeat, manager and
    /// fork owned by this registry
    token: CancellationToken,
}

impl Registry {
    pub fn new(
        store: Arc<dyn Store>,
        config: RegistryConfig,
    ) -> Self {
        Self::with_codec(store, Arc::new(JsonCodec), config)
    }

    pub fn with_codec(
        store: Arc<dyn Store>,
        codec: Arc<dyn InstanceCodec>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            store,
            codec,
            config,
            registrars: DashMap::new(),
            managers: Arc::new(DashMap::new()),
            manager_seq: AtomicU64::new(0),
            token: CancellationToken::new(),
        }
    }

    /// Register (or overwrite) one locally-owned instance and keep its
    /// lease alive until deregistration.
    pub async fn register(
        &self,
        instance: ServiceInstance,
    ) -> Result<()> {
        validate_instance(&instance)?;

        loop {
            let registrar = self
                .registrars
                .entry(instance.id.clone())
                .or_insert_with(|| {
                    Registrar::new(
                        Arc::clone(&self.store),
                        Arc::clone(&self.codec),
                        self.config.clone(),
                        &self.token,
                    )
                })
                .clone();

            match registrar.register(instance.clone()).await {
                Err(crate::Error::Registry(RegistryError::NotRegistered(_))) => {
                    // A terminal registrar lingered in the index; replace it
                    self.registrars
                        .remove_if(&instance.id, |_, r| Arc::ptr_eq(r, &registrar));
                    continue;
                }
                other => return other,
            }
        }
    }

    /// Stop the heartbeat and delete the record of one locally-owned
    /// instance. A second call for the same instance is a no-op.
    pub async fn deregister(
        &self,
        instance: &ServiceInstance,
    ) -> Result<()> {
        let Some((_, registrar)) = self.registrars.remove(&instance.id) else {
            return Ok(());
        };
        registrar.deregister().await
    }

    /// Point-in-time member list of one service.
    ///
    /// Served from the watch manager's snapshot when one exists for the
    /// name (no backend round-trip), else by a one-shot backend read.
    pub async fn services(
        &self,
        name: &str,
    ) -> Result<Vec<ServiceInstance>> {
        if let Some(mgr) = self.managers.get(name).map(|e| e.value().clone()) {
            if let Some(snapshot) = mgr.snapshot() {
                return Ok(snapshot.iter().map(|ev| ev.instance.clone()).collect());
            }
        }

        let prefix = service_prefix(&self.config.namespace, name);
        let records = self.store.read(&prefix).await?;
        let mut instances = Vec::with_capacity(records.len());
        for record in records {
            instances.push(self.codec.decode(&record.value)?);
        }
        Ok(instances)
    }

    /// Attach a new fork to the service's watch manager, creating the
    /// manager (one initial full read, one upstream subscription) when the
    /// name is not watched yet.
    pub async fn watch(
        &self,
        name: &str,
    ) -> Result<Watcher<ServiceEvent>> {
        loop {
            if let Some(mgr) = self.managers.get(name).map(|e| e.value().clone()) {
                if let Some(watcher) = mgr.fork() {
                    return Ok(watcher);
                }
                // Raced the manager's teardown; drop the stale entry unless
                // a successor already owns the slot
                self.managers
                    .remove_if(name, |_, m| m.serial() == mgr.serial());
                continue;
            }

            // Build a fully-initialized manager before publishing it, so a
            // concurrent fork can never observe a missing snapshot. The
            // upstream stream opens before the read; anything changing in
            // between replays through the stream and applies idempotently.
            let prefix = service_prefix(&self.config.namespace, name);
            let stream = self.store.watch(&prefix, None).await?;
            let records = self.store.read(&prefix).await?;

            let mut state = HashMap::with_capacity(records.len());
            for record in records {
                let instance = self.codec.decode(&record.value)?;
                state.insert(record.key, instance);
            }
            let snapshot: Vec<ServiceEvent> =
                state.values().cloned().map(ServiceEvent::put).collect();

            let serial = self.manager_seq.fetch_add(1, Ordering::SeqCst) + 1;
            let mgr = WatcherMgr::new(
                name,
                serial,
                self.config.watch_queue_capacity,
                &self.token,
                Some(snapshot),
            );

            match self.managers.entry(name.to_string()) {
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    let Some(watcher) = mgr.fork() else { continue };

                    let managers = Arc::clone(&self.managers);
                    let key = name.to_string();
                    mgr.set_on_close(Box::new(move || {
                        managers.remove_if(&key, |_, m| m.serial() == serial);
                    }));
                    slot.insert(Arc::clone(&mgr));

                    tokio::spawn(run_service_watch_loop(
                        Arc::clone(&mgr),
                        stream,
                        state,
                        Arc::clone(&self.store),
                        Arc::clone(&self.codec),
                        prefix,
                    ));

                    debug!("created watch manager for service {}", mgr.key());
                    return Ok(watcher);
                }
                dashmap::mapref::entry::Entry::Occupied(_) => {
                    // Another caller won the slot; discard ours (its stream
                    // drops here, before any subscription loop started)
                    mgr.abandon();
                    continue;
                }
            }
        }
    }

    /// Cancel every heartbeat, manager and fork owned by this registry.
    /// Pending `next` calls return a cancellation error.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    #[cfg(test)]
    pub(crate) fn manager_count(&self) -> usize {
        self.managers.len()
    }
}

fn validate_instance(instance: &ServiceInstance) -> Result<()> {
    if instance.id.is_empty() {
        return Err(RegistryError::InvalidInstance("id must not be empty".into()).into());
    }
    if instance.name.is_empty() {
        return Err(RegistryError::InvalidInstance("name must not be empty".into()).into());
    }
    if instance.kind.is_empty() {
        return Err(RegistryError::InvalidInstance("kind must not be empty".into()).into());
    }
    Ok(())
}

/// Consume one upstream subscription, translating raw store events into
/// service events and fanning them out; resyncs and resubscribes when the
/// upstream stream ends.
async fn run_service_watch_loop(
    mgr: Arc<WatcherMgr<ServiceEvent>>,
    mut stream: EventStream,
    mut state: HashMap<String, ServiceInstance>,
    store: Arc<dyn Store>,
    codec: Arc<dyn InstanceCodec>,
    prefix: String,
) {
    let mut cursor: Option<u64> = None;

    loop {
        tokio::select! {
            _ = mgr.token().cancelled() => break,
            maybe_event = stream.next() => match maybe_event {
                Some(event) => {
                    cursor = Some(event.revision);
                    if let Some(translated) = apply_store_event(&mut state, codec.as_ref(), event) {
                        mgr.store_snapshot(
                            state.values().cloned().map(ServiceEvent::put).collect(),
                        );
                        mgr.broadcast(vec![translated]).await;
                    }
                }
                None => {
                    warn!("watch stream for {} ended, resubscribing", prefix);
                    match resync(store.as_ref(), codec.as_ref(), &prefix, cursor, &mut state).await {
                        Ok((fresh_stream, diff)) => {
                            stream = fresh_stream;
                            if !diff.is_empty() {
                                mgr.store_snapshot(
                                    state.values().cloned().map(ServiceEvent::put).collect(),
                                );
                                mgr.broadcast(diff).await;
                            }
                        }
                        Err(e) => {
                            warn!("resubscribe for {} failed: {:?}", prefix, e);
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

/// Apply one raw store change to the local view; returns the translated
/// event to broadcast, or `None` when nothing externally visible changed.
fn apply_store_event(
    state: &mut HashMap<String, ServiceInstance>,
    codec: &dyn InstanceCodec,
    event: StoreEvent,
) -> Option<ServiceEvent> {
    match event.typ {
        StoreEventType::Put => match codec.decode(&event.value) {
            Ok(instance) => {
                state.insert(event.key, instance.clone());
                Some(ServiceEvent::put(instance))
            }
            Err(e) => {
                warn!("dropping malformed record at {}: {:?}", event.key, e);
                None
            }
        },
        StoreEventType::Delete => state
            .remove(&event.key)
            .map(ServiceEvent::delete),
    }
}

/// Re-open the upstream subscription and reconcile the local view against
/// a fresh full read, returning the diff to broadcast.
async fn resync(
    store: &dyn Store,
    codec: &dyn InstanceCodec,
    prefix: &str,
    cursor: Option<u64>,
    state: &mut HashMap<String, ServiceInstance>,
) -> Result<(EventStream, Vec<ServiceEvent>)> {
    let stream = store.watch(prefix, cursor).await?;
    let records = store.read(prefix).await?;

    let mut fresh: HashMap<String, ServiceInstance> = HashMap::with_capacity(records.len());
    for record in records {
        match codec.decode(&record.value) {
            Ok(instance) => {
                fresh.insert(record.key, instance);
            }
            Err(e) => warn!("dropping malformed record at {}: {:?}", record.key, e),
        }
    }

    let mut diff = Vec::new();
    for (key, instance) in &fresh {
        if state.get(key) != Some(instance) {
            diff.push(ServiceEvent::put(instance.clone()));
        }
    }
    for (key, instance) in state.iter() {
        if !fresh.contains_key(key) {
            diff.push(ServiceEvent::delete(instance.clone()));
        }
    }

    *state = fresh;
    Ok((stream, diff))
}
