use std::time::Duration;

/// Port the sync server is reachable on through the overlay.
/// Must match on every participant.
pub const PUB_CONV_PORT: u16 = 10051;

/// Size of a single blob transfer block in bytes.
/// Must match on both sides of the sync protocol.
pub const BLOCK_SIZE: usize = 4096;

/// How long a peer queue sleeps between sync attempts when nothing bumps it.
pub const QUEUE_TIMEOUT: Duration = Duration::from_secs(15);

/// Minimum size of the server's authentication challenge in bytes.
pub const CHALLENGE_SIZE: usize = 32;

/// Hard ceiling for a single wire frame.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Token separator inside command payloads.
pub const COMMAND_DELIMITER: &str = " ";

/// Literal acknowledgement strings of the sync protocol.
pub const ACK_AUTH: &str = "auth_ok";
pub const ACK_MESSAGES: &str = "messages_ok";
pub const ACK_BLOCK: &str = "block_ok";
pub const ACK_BLOB: &str = "blob_ok";
pub const ACK_SYNC: &str = "sync_ok";

/// Reply sent instead of [`ACK_AUTH`] when authentication fails.
pub const AUTH_FAILED: &str = "auth_failed";

/// Default SOCKS port of the external onion router.
pub const DEFAULT_SOCKS_PORT: u16 = 9050;

/// Default control port of the external onion router.
pub const DEFAULT_CONTROL_PORT: u16 = 9051;
