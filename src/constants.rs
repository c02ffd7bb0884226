// -
// Backend key namespaces

/// Root segment under which every record of this crate lives
pub(crate) const DEFAULT_NAMESPACE: &str = "gridlink";

/// Key segment for service instance records: {ns}/services/{name}/{id}
pub(crate) const SERVICES_SEGMENT: &str = "services";

/// Key segment for user-location records: {ns}/locate/{uid}/{kind...}
pub(crate) const LOCATE_SEGMENT: &str = "locate";

/// Location kind segment for per-kind node bindings
pub(crate) const NODE_SEGMENT: &str = "node";

/// Pub/sub channel prefix for locate events: {ns}:locate:{kind}
pub(crate) const LOCATE_CHANNEL_SEGMENT: &str = "locate";

// -
// Watch/broadcast tuning

/// Per-fork delivery queue capacity before the broadcaster backpressures
pub(crate) const DEFAULT_WATCH_QUEUE_CAPACITY: usize = 16;

/// Base delay before a torn-down upstream subscription is re-established
pub(crate) const RESUBSCRIBE_BASE_DELAY_MS: u64 = 200;

/// Upper bound of the random jitter added to the resubscribe delay
pub(crate) const RESUBSCRIBE_JITTER_MS: u64 = 300;
