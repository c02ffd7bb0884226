//! Domain model for cluster membership and user location.
//!
//! A [`ServiceInstance`] is the record a process publishes about itself:
//! identity, role, endpoint, routable capabilities and free-form metadata.
//! The registry stores and watches these records; the locator broadcasts
//! [`LocateEvent`]s referencing them.

mod codec;
mod event;

pub use codec::*;
pub use event::*;

#[cfg(test)]
mod instance_test;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::CodecError;

/// Location kind reserved for gateway bindings.
pub const KIND_GATE: &str = "gate";
/// Location kind used by logic node bindings.
pub const KIND_NODE: &str = "node";

/// Load state freely settable by the owning process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    #[default]
    Idle,
    Working,
    Busy,
    Hangup,
}

impl fmt::Display for InstanceState {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let s = match self {
            InstanceState::Idle => "idle",
            InstanceState::Working => "working",
            InstanceState::Busy => "busy",
            InstanceState::Hangup => "hangup",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for InstanceState {
    type Err = CodecError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "idle" => Ok(InstanceState::Idle),
            "working" => Ok(InstanceState::Working),
            "busy" => Ok(InstanceState::Busy),
            "hangup" => Ok(InstanceState::Hangup),
            other => Err(CodecError::UnknownDiscriminant(other.to_string())),
        }
    }
}

/// A capability the instance can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Route identifier, unique within the owning service
    pub id: i32,
    /// Whether requests on this route must stick to one instance
    pub stateful: bool,
    /// Whether the route is reachable from inside the cluster only
    pub internal: bool,
}

/// The record one process publishes about one instance it owns.
///
/// Created by the owning process before the first register call; mutated
/// only by re-registering (which overwrites the stored record); destroyed
/// by deregistering or by backend-side lease expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Unique per process instance
    pub id: String,

    /// Logical service name used for discovery
    pub name: String,

    /// Role tag, e.g. "gate" or "node"
    pub kind: String,

    /// Human label
    #[serde(default)]
    pub alias: String,

    /// Current load state
    #[serde(default)]
    pub state: InstanceState,

    /// Connection URI other processes dial
    #[serde(default)]
    pub endpoint: String,

    /// Ordered capability descriptors
    #[serde(default)]
    pub routes: Vec<Route>,

    /// Subscribed event-type IDs
    #[serde(default)]
    pub events: Vec<i32>,

    /// Names of other services this instance proxies
    #[serde(default)]
    pub services: Vec<String>,

    /// Relative scheduling weight
    #[serde(default)]
    pub weight: i32,

    /// Opaque key/value bag
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ServiceInstance {
    /// Create a new instance record with a generated id.
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self::with_id(nanoid::nanoid!(), name, kind)
    }

    /// Create a new instance record with a caller-supplied id.
    pub fn with_id(
        id: impl Into<String>,
        name: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: kind.into(),
            alias: String::new(),
            state: InstanceState::Idle,
            endpoint: String::new(),
            routes: Vec::new(),
            events: Vec::new(),
            services: Vec::new(),
            weight: 0,
            metadata: HashMap::new(),
        }
    }

    pub fn with_alias(
        mut self,
        alias: impl Into<String>,
    ) -> Self {
        self.alias = alias.into();
        self
    }

    pub fn with_state(
        mut self,
        state: InstanceState,
    ) -> Self {
        self.state = state;
        self
    }

    pub fn with_endpoint(
        mut self,
        endpoint: impl Into<String>,
    ) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_route(
        mut self,
        route: Route,
    ) -> Self {
        self.routes.push(route);
        self
    }

    pub fn with_event(
        mut self,
        event: i32,
    ) -> Self {
        self.events.push(event);
        self
    }

    pub fn with_service(
        mut self,
        service: impl Into<String>,
    ) -> Self {
        self.services.push(service.into());
        self
    }

    pub fn with_weight(
        mut self,
        weight: i32,
    ) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
