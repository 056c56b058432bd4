//! Constants for the extraction pipeline.
//!
//! All limits, timeouts, and tuning knobs are defined here to ensure
//! consistency and prevent magic numbers throughout the codebase.

use std::time::Duration;

// =============================================================================
// Admission Control
// =============================================================================

/// Assumed ratio of uncompressed to compressed layer size.
/// Absorbs typical gzip ratios for layer tarballs without over-admitting.
pub const EXPANSION_FACTOR: f64 = 3.0;

// =============================================================================
// Fetching
// =============================================================================

/// Absolute ceiling for fetching a single layer, including the body read.
pub const BLOB_DEADLINE: Duration = Duration::from_secs(30 * 60);

/// Flat backoff after an HTTP 429 without a parsable reset header.
pub const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(300);

/// Backoff when the rate-limit headers report zero remaining but the reset
/// time cannot be parsed.
pub const RATE_LIMIT_FALLBACK: Duration = Duration::from_secs(60);

/// Successful deliveries before a fetcher rebuilds its registry client.
/// Registries keep per-scope bearer-token lists that eventually overflow
/// and return 401; rebuilding bounds the scope count per client.
pub const CLIENT_REFRESH_INTERVAL: u32 = 70;

/// Default number of download workers.
pub const DEFAULT_FETCH_WORKERS: usize = 30;

// =============================================================================
// Scanning
// =============================================================================

/// Upper bound on a single file fragment handed to the detector (bytes).
/// Larger files span multiple fragments with the same path.
pub const FRAGMENT_SIZE: usize = 512 * 1024;

/// Byte budget for the per-scanner fragment cache (500 MiB).
pub const CACHE_BYTE_BUDGET: u64 = 500 * 1024 * 1024;

/// Estimated in-memory cost of one fragment cache entry.
pub const CACHE_ENTRY_COST: u64 = 56;

// =============================================================================
// Output
// =============================================================================

/// Byte budget of one output file generation before rotation (500 MB).
pub const SINK_ROTATE_BYTES: u64 = 500_000_000;

/// Base name for layer file-statistic records.
pub const FILE_RECORD_BASE: &str = "fileinfo";

/// Base name for secret record batches.
pub const SECRET_RECORD_BASE: &str = "secrets";

/// Default output directory for the runtime command.
pub const DEFAULT_RESULT_DIR: &str = "runtime/results";

// =============================================================================
// Channels
// =============================================================================

/// Bounded channel depth per worker on each pipeline stage.
pub const CHANNEL_DEPTH_PER_WORKER: usize = 4;

// =============================================================================
// OCI Media Types
// =============================================================================

/// OCI Layer media type (gzip compressed).
pub const OCI_LAYER_MEDIA_TYPE_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
