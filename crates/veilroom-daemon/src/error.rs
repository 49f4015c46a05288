use thiserror::Error;
use uuid::Uuid;

use veilroom_net::NetError;
use veilroom_shared::IdentityError;
use veilroom_store::StoreError;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Unknown room {0}")]
    UnknownRoom(Uuid),

    #[error("Room error: {0}")]
    Room(#[from] RoomError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Onion router error: {0}")]
    Router(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum RoomError {
    #[error("Peer {0} already present, or self")]
    DuplicatePeer(String),

    #[error("Peer {0} not found")]
    UnknownPeer(String),

    #[error("Invalid message signature from {0}")]
    InvalidSignature(String),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),
}

/// Failures of a single sync-protocol exchange. Every variant aborts the
/// attempt; the client retries on its next wake with unchanged state.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Network error: {0}")]
    Net(#[from] NetError),

    #[error("Received reply {got:?}, wanted {want:?}")]
    UnexpectedReply { got: String, want: String },

    #[error("Authentication rejected for {0}")]
    AuthRejected(String),

    #[error("Unknown room {0}")]
    UnknownRoom(Uuid),

    #[error("Malformed room id frame")]
    MalformedRoomId,

    #[error("Invalid block count {0}")]
    InvalidBlockCount(i32),

    #[error("Blob store error: {0}")]
    Store(#[from] StoreError),
}
