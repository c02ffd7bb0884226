mod locator;
pub use locator::*;


use crate::constants::LOCATE_CHANNEL_SEGMENT;
use crate::constants::LOCATE_SEGMENT;
use crate::constants::NODE_SEGMENT;
use crate::KIND_GATE;

/// Backend key of a user's gateway binding.
pub(crate) fn gate_key(
    namespace: &str,
    uid: u64,
) -> String {
    format!("{}/{}/{}/{}", namespace, LOCATE_SEGMENT, uid, KIND_GATE)
}

/// Backend key of a user's binding for one node kind.
pub(crate) fn node_key(
    namespace: &str,
    uid: u64,
    kind: &str,
) -> String {
    format!("{}/{}/{}/{}/{}", namespace, LOCATE_SEGMENT, uid, NODE_SEGMENT, kind)
}

/// Pub/sub channel location changes of one kind are broadcast on.
pub(crate) fn locate_channel(
    namespace: &str,
    kind: &str,
) -> String {
    format!("{}:{}:{}", namespace, LOCATE_CHANNEL_SEGMENT, kind)
}
