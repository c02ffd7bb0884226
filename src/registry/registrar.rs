//! Registration lifecycle for one locally-owned service instance.
//!
//! A registrar owns the full lifecycle against one backend: initial put,
//! periodic lease renewal, automatic re-registration after lease loss, and
//! deregistration. Lease loss is self-healing: when the renewal retry
//! budget is exhausted the registrar performs a fresh registration instead
//! of surfacing an error, so transient backend partitions never require
//! the owning process to notice.
//!
//! States: Unregistered → Registered → (lease lost) → Reregistering →
//! Registered → Deregistered (terminal).

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::interval;
use tokio::time::sleep;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::instance_key;
use crate::InstanceCodec;
use crate::LeaseId;
use crate::RegistryConfig;
use crate::RegistryError;
use crate::Result;
use crate::ServiceInstance;
use crate::Store;

pub(crate) struct Registrar {
    store: Arc<dyn Store>,
    codec: Arc<dyn InstanceCodec>,
    config: RegistryConfig,
    state: Mutex<RegistrarState>,

    /// Scope of the heartbeat loop; child of the registry scope
    token: CancellationToken,
    heartbeat_started: AtomicBool,
}

#[derive(Default)]
struct RegistrarState {
    instance: Option<ServiceInstance>,
    key: String,
    lease: Option<LeaseId>,
}

impl Registrar {
    pub(crate) fn new(
        store: Arc<dyn Store>,
        codec: Arc<dyn InstanceCodec>,
        config: RegistryConfig,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            codec,
            config,
            state: Mutex::new(RegistrarState::default()),
            token: parent.child_token(),
            heartbeat_started: AtomicBool::new(false),
        })
    }

    /// Write the instance record and start the heartbeat loop.
    ///
    /// Registering the same instance id again overwrites the stored record
    /// in place; no duplicate entry is created.
    pub(crate) async fn register(
        self: &Arc<Self>,
        instance: ServiceInstance,
    ) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(RegistryError::NotRegistered(instance.id).into());
        }

        let key = instance_key(&self.config.namespace, &instance.name, &instance.id);
        let raw = self.codec.encode(&instance)?;
        let lease = self
            .store
            .put(&key, raw, Some(self.config.lease_ttl()))
            .await?;

        {
            let mut state = self.state.lock().await;
            state.instance = Some(instance);
            state.key = key;
            state.lease = lease;
        }

        if !self.heartbeat_started.swap(true, Ordering::SeqCst) {
            let registrar = Arc::clone(self);
            tokio::spawn(async move {
                registrar.heartbeat_loop().await;
            });
        }

        Ok(())
    }

    /// Cancel the heartbeat and delete the backend record. Idempotent:
    /// a second call is a no-op.
    pub(crate) async fn deregister(&self) -> Result<()> {
        self.token.cancel();

        let key = {
            let mut state = self.state.lock().await;
            if state.instance.take().is_none() {
                return Ok(());
            }
            state.lease = None;
            std::mem::take(&mut state.key)
        };

        self.store.delete(&key).await?;
        debug!("deregistered {}", key);
        Ok(())
    }

    /// Renew on an interval of half the lease TTL, tolerating one missed
    /// tick without expiry.
    async fn heartbeat_loop(self: Arc<Self>) {
        let mut tick = interval(self.config.heartbeat_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        tick.tick().await;

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tick.tick() => self.keep_alive().await,
            }
        }
    }

    async fn keep_alive(&self) {
        let lease = { self.state.lock().await.lease };
        let Some(lease) = lease else {
            // Deregistered between ticks
            return;
        };

        for attempt in 1..=self.config.renew_retry_count {
            match self.store.renew(lease).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(
                        "lease {} renewal attempt {}/{} failed: {:?}",
                        lease, attempt, self.config.renew_retry_count, e
                    );
                    // A lease the backend no longer tracks cannot be
                    // renewed; skip the remaining retries
                    if !e.is_transient() {
                        break;
                    }
                }
            }
            if attempt < self.config.renew_retry_count {
                sleep(self.config.renew_retry_interval()).await;
            }
        }

        // Retry budget exhausted: the lease is presumed lost. Re-register
        // with a fresh lease instead of erroring out.
        match self.reregister().await {
            Ok(true) => info!("lease {} lost, re-registered with a fresh lease", lease),
            Ok(false) => {}
            Err(e) => {
                // The next heartbeat tick attempts again
                error!("re-registration after lease loss failed: {:?}", e);
            }
        }
    }

    /// Returns Ok(false) when the registrar was deregistered meanwhile.
    async fn reregister(&self) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(instance) = state.instance.clone() else {
            return Ok(false);
        };

        let raw = self.codec.encode(&instance)?;
        let lease = self
            .store
            .put(&state.key, raw, Some(self.config.lease_ttl()))
            .await?;
        state.lease = lease;
        Ok(true)
    }

    #[cfg(test)]
    pub(crate) async fn current_lease(&self) -> Option<LeaseId> {
        self.state.lock().await.lease
    }
}
