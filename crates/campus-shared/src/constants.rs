/// Heartbeat interval in seconds
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Maximum reconnection attempts after an unexpected disconnect
pub const RECONNECT_MAX_ATTEMPTS: u32 = 5;

/// Fixed delay between reconnection attempts in seconds
pub const RECONNECT_DELAY_SECS: u64 = 3;

/// How long an unanswered ring persists before being torn down, in seconds
pub const RING_TIMEOUT_SECS: u64 = 60;

/// Content a deleted message is rewritten to (the record keeps its slot)
pub const TOMBSTONE_CONTENT: &str = "This message was deleted";

/// Maximum chat message length in characters
pub const MAX_MESSAGE_LENGTH: usize = 4096;

/// Maximum number of ids in one batched presence query
pub const PRESENCE_BATCH_MAX: usize = 100;
