use serde::Deserialize;
use serde::Serialize;

use super::ServiceInstance;

/// Change type carried by a registry watch delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceEventType {
    /// Record created or overwritten
    Put,
    /// Record removed (deregistration or lease expiry)
    Delete,
}

/// The unit delivered by registry watch forks.
///
/// A fork's initial snapshot is expressed as one `Put` event per live
/// instance, so consumers apply snapshots and increments the same way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub typ: ServiceEventType,
    pub instance: ServiceInstance,
}

impl ServiceEvent {
    pub fn put(instance: ServiceInstance) -> Self {
        Self {
            typ: ServiceEventType::Put,
            instance,
        }
    }

    pub fn delete(instance: ServiceInstance) -> Self {
        Self {
            typ: ServiceEventType::Delete,
            instance,
        }
    }
}

/// Kind of location change broadcast on every successful bind/unbind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocateEventType {
    BindGate,
    UnbindGate,
    BindNode,
    UnbindNode,
}

/// The unit broadcast on the pub/sub layer for every bind/unbind, consumed
/// by all processes watching the relevant kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocateEvent {
    /// User identity the binding belongs to
    pub uid: u64,

    pub typ: LocateEventType,

    /// Instance the user is now (or no longer) bound to
    pub instance_id: String,

    /// Location kind of the instance ("gate", or a node kind)
    pub instance_kind: String,

    /// Logical service name, when the broadcaster knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,
}

impl LocateEvent {
    pub(crate) fn new(
        uid: u64,
        typ: LocateEventType,
        instance_id: impl Into<String>,
        instance_kind: impl Into<String>,
    ) -> Self {
        Self {
            uid,
            typ,
            instance_id: instance_id.into(),
            instance_kind: instance_kind.into(),
            instance_name: None,
        }
    }

    /// True for the two bind variants.
    pub fn is_bind(&self) -> bool {
        matches!(self.typ, LocateEventType::BindGate | LocateEventType::BindNode)
    }
}
