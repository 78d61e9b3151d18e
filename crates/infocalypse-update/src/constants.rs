//! Constants for the update engine.
//!
//! Tiger Style: graph size, path length, top-key size and retry counts are
//! all bounded explicitly.

pub use infocalypse_store::constants::BLOCK_LEN;

use crate::types::IndexId;

// ============================================================================
// Update Graph
// ============================================================================

/// Index of the empty-repository sentinel.
pub const FIRST_INDEX: IndexId = -1;

/// Maximum steps in the canonical bootstrap path.
///
/// Inserts that would exceed it add a shortcut edge.
pub const MAX_PATH_LEN: usize = 4;

/// Largest bundle the redundant-bundle search will produce (128 KiB).
pub const MAX_REDUNDANT_LENGTH: u64 = 128 * 1024;

/// Largest bundle that gets a salted-metadata redundant copy (7 MiB).
pub const MAX_METADATA_HACK_LEN: u64 = 7 * 1024 * 1024;

/// Maximum serialized graph size; one store block.
pub const MAX_GRAPH_LEN: usize = BLOCK_LEN;

/// Target size when minimizing the graph before insert (31 KiB).
///
/// Leaves room for the copy prefix inside one block.
pub const GRAPH_INSERT_LEN: usize = 31 * 1024;

/// Upper bound on paths produced by one enumeration.
pub const MAX_ENUMERATED_PATHS: usize = 4096;

/// Redundant copies allowed per index pair.
pub const MAX_ORDINALS: usize = 2;

// ============================================================================
// Top Key
// ============================================================================

/// Magic bytes opening every top-key.
pub const TOP_KEY_MAGIC: &[u8; 8] = b"HGINF100";

/// Maximum encoded top-key size.
pub const MAX_TOP_KEY_LEN: usize = 1024;

/// Salts of the two redundant top-key copies.
pub const TOP_KEY_SALTS: [u8; 2] = [0x00, 0xff];

/// Maximum CHKs per update; the rest of the count byte holds flags.
pub const MAX_UPDATE_CHKS: usize = 0x3f;

// ============================================================================
// Inserted Content
// ============================================================================

/// MIME type of inserted bundles. The trailing digit is the salt.
pub const BUNDLE_MIME: &str = "application/mercurial-bundle;0";

/// Mime marker after salting the splitfile metadata.
pub const SALTED_BUNDLE_MIME: &str = "application/mercurial-bundle;1";

/// MIME type of inserted graphs.
pub const GRAPH_MIME: &str = "text/plain";

/// Prefixes of the two graph copies, so they land at distinct CHKs.
pub const GRAPH_COPY_PREFIXES: [&str; 2] = ["#A\n", "#B\n"];

/// Byte appended to small bundles for their redundant copy.
pub const PAD_BYTE: u8 = 0xff;

// ============================================================================
// Scheduling
// ============================================================================

/// Attempts per candidate before it is given up.
pub const MAX_RETRIES: u32 = 2;

/// Edges requested per re-evaluation when pulling.
pub const PULL_REDUNDANCY: usize = 4;

/// Paths costing up to this multiple of the cheapest are first priority.
pub const CHEAP_PATH_FACTOR: u64 = 2;

// ============================================================================
// Compile-Time Checks
// ============================================================================

const _: () = assert!(GRAPH_INSERT_LEN + 3 <= MAX_GRAPH_LEN);
const _: () = assert!(MAX_REDUNDANT_LENGTH < MAX_METADATA_HACK_LEN);
const _: () = assert!(BUNDLE_MIME.len() == SALTED_BUNDLE_MIME.len());
const _: () = assert!(MAX_PATH_LEN >= 2);
