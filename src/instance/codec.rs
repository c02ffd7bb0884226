//! Pluggable (de)serializer on the instance ↔ backend-record boundary.
//!
//! The registry and locator never inspect record bytes themselves; any
//! backend-specific shaping (JSON records, metadata-slot packing) lives
//! behind [`InstanceCodec`].

use crate::CodecError;
use crate::Result;
use crate::ServiceInstance;

use super::Route;

/// Width of one packed route record: i32 id (big-endian) + flags byte.
pub const ROUTE_RECORD_WIDTH: usize = 5;

const FLAG_STATEFUL: u8 = 0b0000_0001;
const FLAG_INTERNAL: u8 = 0b0000_0010;

/// Encodes instance records to backend bytes and back.
pub trait InstanceCodec: Send + Sync + 'static {
    fn encode(
        &self,
        instance: &ServiceInstance,
    ) -> Result<Vec<u8>>;

    fn decode(
        &self,
        raw: &[u8],
    ) -> Result<ServiceInstance>;
}

/// Default codec: one JSON document per record.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl InstanceCodec for JsonCodec {
    fn encode(
        &self,
        instance: &ServiceInstance,
    ) -> Result<Vec<u8>> {
        serde_json::to_vec(instance).map_err(|e| CodecError::Json(e).into())
    }

    fn decode(
        &self,
        raw: &[u8],
    ) -> Result<ServiceInstance> {
        serde_json::from_slice(raw).map_err(|e| CodecError::Json(e).into())
    }
}

/// Pack a route list into a flat fixed-width byte string.
///
/// Each route occupies [`ROUTE_RECORD_WIDTH`] bytes, so the result can be
/// split at arbitrary record boundaries for backends that cap per-field
/// metadata size.
pub fn pack_routes(routes: &[Route]) -> Vec<u8> {
    let mut packed = Vec::with_capacity(routes.len() * ROUTE_RECORD_WIDTH);
    for route in routes {
        packed.extend_from_slice(&route.id.to_be_bytes());
        let mut flags = 0u8;
        if route.stateful {
            flags |= FLAG_STATEFUL;
        }
        if route.internal {
            flags |= FLAG_INTERNAL;
        }
        packed.push(flags);
    }
    packed
}

/// Inverse of [`pack_routes`]; the input may be a reassembled concatenation
/// of metadata slots.
pub fn unpack_routes(packed: &[u8]) -> Result<Vec<Route>> {
    if packed.len() % ROUTE_RECORD_WIDTH != 0 {
        return Err(CodecError::InvalidChunkLength {
            expected: ROUTE_RECORD_WIDTH,
            received: packed.len(),
        }
        .into());
    }

    let mut routes = Vec::with_capacity(packed.len() / ROUTE_RECORD_WIDTH);
    for record in packed.chunks_exact(ROUTE_RECORD_WIDTH) {
        let id = i32::from_be_bytes([record[0], record[1], record[2], record[3]]);
        let flags = record[4];
        routes.push(Route {
            id,
            stateful: flags & FLAG_STATEFUL != 0,
            internal: flags & FLAG_INTERNAL != 0,
        });
    }
    Ok(routes)
}

/// Split a packed route string into slots of at most `slot_width` bytes,
/// never cutting a record in half.
pub fn chunk_routes(
    packed: &[u8],
    slot_width: usize,
) -> Vec<Vec<u8>> {
    let records_per_slot = (slot_width / ROUTE_RECORD_WIDTH).max(1);
    packed
        .chunks(records_per_slot * ROUTE_RECORD_WIDTH)
        .map(|c| c.to_vec())
        .collect()
}
