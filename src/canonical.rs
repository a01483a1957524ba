//! Canonical serialization for layout fingerprints.
//!
//! Two runs over an unchanged graph with the same options must produce the
//! same `layout_hash`. Only the structural assignment is hashed: coordinates
//! and timing are derived from it and excluded.
//!
//! ## Determinism Guarantees
//!
//! - Stable field order: Struct fields serialize in declaration order
//! - Stable Vec order: blocks are hashed in ascending id order
//! - No HashMap allowed: Use BTreeMap for maps in hashed data

use serde::Serialize;
use xxhash_rust::xxh64::xxh64;

use crate::error::LayoutError;
use crate::types::{BlockPlacement, NodeId};

/// Serialize a value to canonical JSON bytes for hashing.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, LayoutError> {
    serde_json::to_vec(value)
        .map_err(|e| LayoutError::Internal(format!("Canonical serialization failed: {e}")))
}

/// Compute canonical hash of a serializable value.
pub fn canonical_hash<T: Serialize>(value: &T) -> Result<u64, LayoutError> {
    Ok(xxh64(&to_canonical_bytes(value)?, 0))
}

/// Compute canonical hash and return as hex string.
pub fn canonical_hash_hex<T: Serialize>(value: &T) -> Result<String, LayoutError> {
    Ok(format!("{:016x}", canonical_hash(value)?))
}

#[derive(Serialize)]
struct FingerprintEntry<'a> {
    id: &'a NodeId,
    topo_order: u64,
    layer: u32,
    level: u32,
    sublevel_id: u32,
}

/// Fingerprint of a layout's structural assignment.
///
/// Input order does not matter; blocks are sorted by id first.
pub fn layout_hash(blocks: &[BlockPlacement]) -> Result<String, LayoutError> {
    let mut entries: Vec<FingerprintEntry<'_>> = blocks
        .iter()
        .map(|b| FingerprintEntry {
            id: &b.id,
            topo_order: b.topo_order,
            layer: b.layer,
            level: b.level,
            sublevel_id: b.sublevel_id,
        })
        .collect();
    entries.sort_by(|a, b| a.id.cmp(b.id));
    canonical_hash_hex(&entries)
}
