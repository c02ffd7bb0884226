#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use gridlink::Locator;
use gridlink::LocatorConfig;
use gridlink::MemoryStore;
use gridlink::Registry;
use gridlink::RegistryConfig;
use gridlink::ServiceInstance;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn shared_store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new())
}

/// Registry with default settings over one shared backend.
pub fn registry_on(store: Arc<MemoryStore>) -> Registry {
    Registry::new(store, RegistryConfig::default())
}

pub fn locator_on(store: Arc<MemoryStore>) -> Locator {
    Locator::new(store, LocatorConfig::default())
}

pub fn node_instance(id: &str) -> ServiceInstance {
    ServiceInstance::with_id(id, "node", "node").with_endpoint("grpc://127.0.0.1:9000")
}

pub fn gate_instance(id: &str) -> ServiceInstance {
    ServiceInstance::with_id(id, "gate", "gate").with_endpoint("ws://127.0.0.1:8000")
}
