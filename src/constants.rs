//! Format constants and defaults shared across modules.

/// Bytes reserved for a frame header: length line plus padding line.
pub const FRAME_HEADER_WIDTH: usize = 16;
/// Marker that terminates every frame payload.
pub const FRAME_END_MARKER: &[u8; 4] = b"\r\n\r\n";
/// Upper bound on the length line a reader will accept.
pub const FRAME_MAX_LINE: usize = 64;

/// Digits in a queue sequence id and an archive document id.
pub const ID_DIGITS: usize = 9;
/// Documents per archive shard.
pub const SHARD_CAPACITY: u64 = 1000;
/// Digits in a shard file name.
pub const SHARD_DIGITS: usize = 6;
/// Digits in a slot entry name within a shard.
pub const SLOT_DIGITS: usize = 3;

pub const QLOG_EXT: &str = "qlog";
pub const MLOG_EXT: &str = "mlog";
pub const QTXT_EXT: &str = "qtxt";

pub const DEFAULT_PROXY_PORT: u16 = 8051;
pub const DEFAULT_WORKERS: usize = 8;
pub const DEFAULT_MAX_REQUEST_BYTES: u64 = 1024 * 1024;
pub const DEFAULT_MAX_BODY_BYTES: u64 = 4 * 1024 * 1024;
/// Decoded bytes allowed per captured body byte before a document is refused.
pub const MAX_DECODE_EXPANSION: u64 = 8;
pub const DEFAULT_MAX_DECODED_BYTES: u64 = DEFAULT_MAX_BODY_BYTES * MAX_DECODE_EXPANSION;
pub const DEFAULT_POLL_SECS: u64 = 60;
/// Ceiling for the scheduler poll interval, including backoff.
pub const MAX_POLL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_NUM_DOC: usize = 10;
pub const DEFAULT_INDEX_INTERVAL_SECS: i64 = 3 * 60;
pub const DEFAULT_MAX_INDEX_INTERVAL_SECS: i64 = 60 * 60;
pub const DEFAULT_SIMILARITY_DAYS: i64 = 7;
pub const DEFAULT_MAX_URI_LEN: usize = 1024;

/// Read size used by the relay pump.
pub const RELAY_CHUNK: usize = 16 * 1024;
/// Read timeout for a single pump poll.
pub const PUMP_POLL_MS: u64 = 100;
/// Consecutive empty polls before a connection is abandoned.
pub const PUMP_MAX_IDLE_POLLS: u32 = 300;
/// Largest request head the proxy will buffer before giving up.
pub const MAX_REQUEST_HEAD: usize = 64 * 1024;
/// Time allowed for a client to send its request head.
pub const CLIENT_HEAD_TIMEOUT_SECS: u64 = 30;
/// Time allowed to open a connection to the next hop.
pub const CONNECT_TIMEOUT_SECS: u64 = 30;
