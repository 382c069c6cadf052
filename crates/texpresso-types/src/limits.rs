//! Protocol and engine limits.

/// Number of open-file slots a worker may address.
pub const MAX_OPEN_FILES: usize = 1024;

/// Maximum depth of the worker snapshot ladder.
pub const MAX_SNAPSHOTS: usize = 32;

/// Maximum number of speculative re-execution fences.
pub const MAX_FENCES: usize = 16;

/// Size of the channel's fixed input and output buffers.
pub const CHANNEL_BUF_SIZE: usize = 4096;

/// Initial size of the channel's growable scratch buffer.
pub const SCRATCH_INITIAL_SIZE: usize = 256;

/// Hysteresis before a worker is asked to fork a snapshot, in worker
/// milliseconds. Forking more often than this thrashes.
pub const SNAPSHOT_HYSTERESIS_MS: i32 = 500;

/// Poll timeout when waiting on a worker, and the patience granted to a
/// worker during the end-of-edit drain before it is declared stuck.
pub const WORKER_POLL_MS: i32 = 10;

/// Fences are aligned down to this block size.
pub const FENCE_BLOCK: i32 = 64;

/// Initial backward time gap between fences; doubles per fence placed.
pub const FENCE_INITIAL_GAP_MS: i32 = 50;

/// Slack subtracted from the rollback point's timestamp before spacing
/// fences backward.
pub const FENCE_TIME_SLACK_MS: i32 = 10;
