// Fundamental configuration constants
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3030;
pub const WS_PATH: &str = "ws";

// Default enforcement limits (per room unless overridden)
pub const DEFAULT_CONN_PER_USER: u32 = 5;
pub const DEFAULT_CONN_PER_IP: u32 = 20;
pub const DEFAULT_ROOM_MAX_MEMBERS: u32 = 500;
pub const DEFAULT_MSG_RPS: f64 = 10.0;
pub const DEFAULT_MSG_BURST: u32 = 20;
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 64 * 1024;

// Shared store behaviour
pub const DEFAULT_KEY_PREFIX: &str = "rusty-gate:";
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 250;
/// Extra lifetime given to idle token buckets beyond a full refill
pub const BUCKET_TTL_MARGIN_MS: u64 = 5_000;

// Connection supervision
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 90;
pub const DEFAULT_REAP_INTERVAL_SECS: u64 = 30;

// Key namespaces inside the counter store
pub const NS_CONN: &str = "conn";
pub const NS_ROOM: &str = "room";
pub const NS_BUCKET: &str = "bucket";

// Reserved policy-violation close codes (4000-4999 is the private-use range)
pub const CLOSE_CONNECTION_LIMIT: u16 = 4008;
pub const CLOSE_RATE_LIMIT: u16 = 4029;
pub const CLOSE_PAYLOAD_TOO_LARGE: u16 = 4009;
/// RFC 6455 "internal error"
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
