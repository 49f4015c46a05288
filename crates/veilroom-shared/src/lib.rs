// Shared types for the veilroom daemon: identities, signed messages,
// fingerprints and the constants both ends of the sync protocol agree on.

pub mod constants;
pub mod error;
pub mod identity;
pub mod message;
pub mod types;

pub use error::IdentityError;
pub use identity::{HiddenService, Identity, IdentityExport, RemoteIdentity};
pub use message::{construct_command, ContentType, Message};
pub use types::{is_caught_up, PeerMeta, SyncState};
