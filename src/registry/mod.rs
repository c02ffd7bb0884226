mod registrar;
mod registry;
pub use registry::*;

pub(crate) use registrar::*;

#[cfg(test)]
mod registrar_test;

use crate::constants::SERVICES_SEGMENT;

/// Prefix every record of one service lives under.
pub(crate) fn service_prefix(
    namespace: &str,
    name: &str,
) -> String {
    format!("{}/{}/{}/", namespace, SERVICES_SEGMENT, name)
}

/// Backend key of one instance record.
pub(crate) fn instance_key(
    namespace: &str,
    name: &str,
    id: &str,
) -> String {
    format!("{}{}", service_prefix(namespace, name), id)
}
