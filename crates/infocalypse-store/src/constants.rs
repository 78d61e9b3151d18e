//! Constants for the object store layer.
//!
//! Tiger Style: every queue, timeout and payload has an explicit bound.

use std::time::Duration;

// ============================================================================
// Block Geometry
// ============================================================================

/// Size of a single store block (32 KiB).
///
/// Data at or below this size fits in one CHK. Larger data becomes a
/// splitfile: data blocks plus a top metadata block.
pub const BLOCK_LEN: usize = 32 * 1024;

/// Maximum payload accepted by a single put (64 MiB).
pub const MAX_PUT_LEN: usize = 64 * 1024 * 1024;

// ============================================================================
// Scheduling
// ============================================================================

/// Maximum requests in flight at once.
pub const N_CONCURRENT: usize = 4;

/// Default time a request may run before the scheduler cancels it.
///
/// Progress messages push the deadline out by this amount again.
pub const DEFAULT_CANCEL_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Interval between scheduler ticks when nothing else happens.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Maximum redirects a get follows by default.
pub const DEFAULT_MAX_REDIRECTS: u32 = 4;

// ============================================================================
// FCP Protocol
// ============================================================================

/// Default FCP host.
pub const DEFAULT_FCP_HOST: &str = "127.0.0.1";

/// Default FCP port.
pub const DEFAULT_FCP_PORT: u16 = 9481;

/// FCP protocol version sent in ClientHello.
pub const FCP_VERSION: &str = "2.0";

/// Maximum length of one FCP header line.
pub const MAX_FCP_LINE_LEN: usize = 64 * 1024;

/// Maximum number of fields in one FCP message.
pub const MAX_FCP_FIELDS: usize = 256;

/// Maximum trailing data attached to one FCP message (64 MiB).
pub const MAX_FCP_DATA_LEN: usize = MAX_PUT_LEN;

/// Time allowed for the ClientHello/NodeHello handshake.
pub const FCP_HELLO_TIMEOUT: Duration = Duration::from_secs(30);

/// Retries the node performs for each request. -1 means retry forever.
pub const FCP_MAX_RETRIES: i32 = 6;

/// Priority class for interactive requests.
pub const FCP_PRIORITY_CLASS: u8 = 1;

// ============================================================================
// FCP Failure Codes
// ============================================================================

/// Data not found.
pub const FCP_CODE_DATA_NOT_FOUND: u32 = 13;

/// Route not found.
pub const FCP_CODE_ROUTE_NOT_FOUND: u32 = 14;

/// Data exceeded MaxSize.
pub const FCP_CODE_TOO_BIG: u32 = 21;

/// Permanent redirect; RedirectURI carries the new location.
pub const FCP_CODE_PERMANENT_REDIRECT: u32 = 27;

/// All data not found.
pub const FCP_CODE_ALL_DATA_NOT_FOUND: u32 = 28;

/// Insert collided with different data at the same key.
pub const FCP_CODE_COLLISION: u32 = 9;

// ============================================================================
// Compile-Time Checks
// ============================================================================

const _: () = assert!(N_CONCURRENT > 0);
const _: () = assert!(BLOCK_LEN.is_power_of_two());
const _: () = assert!(MAX_FCP_DATA_LEN >= BLOCK_LEN);
