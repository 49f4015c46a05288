// The daemon core: rooms, the per-peer sync queues, the inbound sync
// server, command handling and supervision of the external onion router.

pub mod commands;
pub mod config;
pub mod daemon;
pub mod room;
pub mod state;
pub mod sync_server;
pub mod tor;

mod error;
mod peer;

pub use commands::{CommandEffect, CommandRegistry};
pub use config::DaemonConfig;
pub use daemon::Daemon;
pub use error::{DaemonError, RoomError, SyncError};
pub use room::Room;
pub use state::{DaemonState, PeerSnapshot, RoomSnapshot};
pub use sync_server::RoomRegistry;
