//! Clustering substrate for multi-process game servers.
//!
//! Independent processes (gateways, logic nodes, a management node)
//! discover each other, publish their liveness, and track where a user
//! session currently lives, over an abstract backend store capability
//! (key/value put-with-lease, prefix watch, publish/subscribe).
//!
//! The crate is built around three pieces:
//!
//! - the **watch engine** ([`WatcherMgr`]/[`Watcher`]): one expensive
//!   backend subscription per resource key, fanned out to any number of
//!   cheap consumer forks with leak-free teardown;
//! - the **registrar lifecycle** behind [`Registry`]: register, renew the
//!   lease on a heartbeat, transparently re-register after lease loss,
//!   deregister;
//! - the **locator protocol** ([`Locator`]): session-location lookups with
//!   request de-duplication, compare-and-swap unbind, and broadcast-based
//!   cross-process cache invalidation.
//!
//! ```no_run
//! use std::sync::Arc;
//! use gridlink::{MemoryStore, Registry, RegistryConfig, ServiceInstance};
//!
//! # async fn run() -> gridlink::Result<()> {
//! let store = Arc::new(MemoryStore::new());
//! let registry = Registry::new(store, RegistryConfig::default());
//!
//! registry
//!     .register(ServiceInstance::new("node", "node").with_endpoint("grpc://127.0.0.1:9000"))
//!     .await?;
//!
//! let mut watcher = registry.watch("node").await?;
//! let snapshot = watcher.next().await?;
//! # let _ = snapshot;
//! # Ok(())
//! # }
//! ```

mod config;
mod constants;
mod errors;
mod instance;
mod locate;
mod registry;
mod store;
mod watch;

pub use config::*;
pub use errors::*;
pub use instance::*;
pub use locate::*;
pub use registry::*;
pub use store::*;
pub use watch::*;
