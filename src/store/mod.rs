//! Backend store capability contract.
//!
//! Every interchangeable backend (lease-KV store, mesh agent, naming
//! service, in-process memory store) is modeled as the same abstract
//! capability: key/value put-with-lease, prefix watch with a change
//! cursor, and publish/subscribe. The registry and locator are written
//! against this contract only; remote client wiring lives outside the
//! crate.

mod memory;
pub use memory::*;


use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
#[cfg(test)]
use mockall::automock;

use crate::Result;

/// Handle of a backend-enforced expiry attached to a stored record.
pub type LeaseId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

/// Change type reported by a prefix watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEventType {
    Put,
    Delete,
}

/// One observed change under a watched prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub typ: StoreEventType,

    pub key: String,

    /// Record bytes for `Put`; empty for `Delete`
    pub value: Vec<u8>,

    /// Backend change cursor; later events carry larger revisions
    pub revision: u64,
}

/// Stream of changes under a watched prefix.
pub type EventStream = Pin<Box<dyn Stream<Item = StoreEvent> + Send>>;

/// Stream of payloads delivered on a subscribed channel.
pub type PayloadStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// The abstract backend capability.
///
/// Delivery semantics are at-least-once: a watch or subscription stream
/// may replay a change after a reconnect, and consumers must apply events
/// idempotently. Ordering is guaranteed per key only. Backends without
/// durable history accept a `cursor` but start from the current state;
/// callers compensate with an initial full [`Store::read`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Write a record, optionally attached to a fresh lease of `ttl`.
    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<Option<LeaseId>>;

    /// Extend an existing lease to a full `ttl` from now.
    async fn renew(
        &self,
        lease: LeaseId,
    ) -> Result<()>;

    /// Remove a record. Removing an absent key is a no-op.
    async fn delete(
        &self,
        key: &str,
    ) -> Result<()>;

    /// Point-in-time listing of every record under `prefix`.
    async fn read(
        &self,
        prefix: &str,
    ) -> Result<Vec<KeyValue>>;

    /// Subscribe to changes under `prefix`, resuming after `cursor` where
    /// the backend supports it.
    async fn watch(
        &self,
        prefix: &str,
        cursor: Option<u64>,
    ) -> Result<EventStream>;

    /// Fire-and-forget broadcast to every current subscriber of `channel`.
    async fn publish(
        &self,
        channel: &str,
        payload: Vec<u8>,
    ) -> Result<()>;

    /// Open a persistent subscription on `channel`.
    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<PayloadStream>;
}
