//! Build-time tuning knobs.

/// Listener backlog.
pub const BACKLOG: i32 = 1000;

/// Chunk size for socket reads and journal replay, in bytes.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Upper bound on events harvested by one reactor poll.
pub const MAX_EVENTS_PER_POLL: usize = 256;
