//! Inbound side of the sync protocol.
//!
//! One shared acceptor serves every room; the client names the room it
//! wants in step three of the exchange, so the server demultiplexes by
//! UUID against the shared registry. Each accepted connection runs in
//! its own task and is closed on every exit path.

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use veilroom_net::FramedConnection;
use veilroom_shared::constants::{
    ACK_AUTH, ACK_BLOB, ACK_BLOCK, ACK_MESSAGES, ACK_SYNC, AUTH_FAILED, CHALLENGE_SIZE,
};
use veilroom_shared::Message;
use veilroom_store::StoreError;

use crate::commands::CommandEffect;
use crate::error::SyncError;
use crate::room::Room;

/// Shared map of live rooms, keyed by room id. Cloned freely between the
/// daemon and the acceptor.
#[derive(Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<RwLock<HashMap<Uuid, Room>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, room: Room) {
        self.rooms.write().await.insert(room.id(), room);
    }

    pub async fn remove(&self, id: &Uuid) -> Option<Room> {
        self.rooms.write().await.remove(id)
    }

    pub async fn get(&self, id: &Uuid) -> Option<Room> {
        self.rooms.read().await.get(id).cloned()
    }

    pub async fn ids(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().copied().collect()
    }
}

/// Accept loop. Runs until the listener fails fatally; every connection
/// is handled concurrently and independently.
pub async fn serve(listener: TcpListener, registry: RoomRegistry) {
    info!(addr = ?listener.local_addr().ok(), "Sync server listening");

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let registry = registry.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, registry).await {
                        debug!(peer = %addr, error = %e, "Sync connection aborted");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
            }
        }
    }
}

/// One protocol step per variant, mirroring the client's transitions.
enum ServerPhase {
    SendChallenge,
    ReadAuth {
        challenge: Vec<u8>,
    },
    Authorize {
        challenge: Vec<u8>,
        fingerprint: String,
        signature: Vec<u8>,
    },
    SendState {
        room: Room,
    },
    ReadMessages {
        room: Room,
    },
    ReadBlobList {
        room: Room,
    },
    ReceiveBlobs {
        room: Room,
        ids: Vec<Uuid>,
    },
    SendFinalAck,
    Done,
}

struct SyncServer<S> {
    conn: FramedConnection<S>,
    registry: RoomRegistry,
}

/// Serve one inbound sync exchange over an established stream.
pub async fn handle_connection<S: AsyncRead + AsyncWrite>(
    stream: S,
    registry: RoomRegistry,
) -> Result<(), SyncError> {
    let mut server = SyncServer {
        conn: FramedConnection::new(stream),
        registry,
    };

    let mut phase = ServerPhase::SendChallenge;
    loop {
        phase = server.step(phase).await?;
        if matches!(phase, ServerPhase::Done) {
            return server.conn.close().await.map_err(SyncError::Net);
        }
    }
}

impl<S: AsyncRead + AsyncWrite> SyncServer<S> {
    async fn step(&mut self, phase: ServerPhase) -> Result<ServerPhase, SyncError> {
        Ok(match phase {
            ServerPhase::SendChallenge => {
                let mut challenge = vec![0u8; CHALLENGE_SIZE];
                OsRng.fill_bytes(&mut challenge);
                self.conn.write_bytes(&challenge, false).await?;
                self.conn.flush().await?;
                ServerPhase::ReadAuth { challenge }
            }

            ServerPhase::ReadAuth { challenge } => {
                let fingerprint = self.conn.read_string().await?;
                let signature = self.conn.read_bytes(false).await?;
                ServerPhase::Authorize {
                    challenge,
                    fingerprint,
                    signature,
                }
            }

            ServerPhase::Authorize {
                challenge,
                fingerprint,
                signature,
            } => {
                let id_bytes = self.conn.read_bytes(false).await?;
                let Ok(room_id) = Uuid::from_slice(&id_bytes) else {
                    self.reject().await;
                    return Err(SyncError::MalformedRoomId);
                };

                let Some(room) = self.registry.get(&room_id).await else {
                    self.reject().await;
                    return Err(SyncError::UnknownRoom(room_id));
                };

                // The stated fingerprint must be a member of the room and
                // must have signed our challenge with the matching key.
                let authorized = room
                    .peer_identity(&fingerprint)
                    .is_some_and(|peer| peer.verify(&challenge, &signature));
                if !authorized {
                    self.reject().await;
                    return Err(SyncError::AuthRejected(fingerprint));
                }

                self.conn.write_string(ACK_AUTH).await?;
                self.conn.flush().await?;
                ServerPhase::SendState { room }
            }

            ServerPhase::SendState { room } => {
                let state = room.sync_state();
                self.conn.write_struct(&state, false).await?;
                self.conn.flush().await?;
                ServerPhase::ReadMessages { room }
            }

            ServerPhase::ReadMessages { room } => {
                let messages: Vec<Message> = self.conn.read_struct(true).await?;
                trace!(count = messages.len(), room = %room.id(), "Messages received");

                for message in messages {
                    match room.ingest(message) {
                        Ok(CommandEffect::None) => {}
                        Ok(CommandEffect::DeleteRoom) => {
                            info!(room = %room.id(), "Room deleted by remote command");
                            self.registry.remove(&room.id()).await;
                        }
                        Err(e) => {
                            debug!(room = %room.id(), error = %e, "Dropped message during sync");
                        }
                    }
                }

                self.conn.write_string(ACK_MESSAGES).await?;
                self.conn.flush().await?;
                ServerPhase::ReadBlobList { room }
            }

            ServerPhase::ReadBlobList { room } => {
                let ids: Vec<Uuid> = self.conn.read_struct(false).await?;
                ServerPhase::ReceiveBlobs { room, ids }
            }

            ServerPhase::ReceiveBlobs { room, ids } => {
                for id in ids {
                    self.receive_blob(&room, id).await?;
                }
                ServerPhase::SendFinalAck
            }

            ServerPhase::SendFinalAck => {
                self.conn.write_string(ACK_SYNC).await?;
                self.conn.flush().await?;
                ServerPhase::Done
            }

            ServerPhase::Done => ServerPhase::Done,
        })
    }

    async fn receive_blob(&mut self, room: &Room, id: Uuid) -> Result<(), SyncError> {
        let block_count = self.conn.read_int().await?;
        if block_count < 0 {
            return Err(SyncError::InvalidBlockCount(block_count));
        }

        let mut file = room.blob_store().create_with_id(id).await?;
        for _ in 0..block_count {
            let block = self.conn.read_bytes(false).await?;
            file.write_all(&block).await.map_err(StoreError::Io)?;
            self.conn.write_string(ACK_BLOCK).await?;
            self.conn.flush().await?;
        }
        file.flush().await.map_err(StoreError::Io)?;

        self.conn.write_string(ACK_BLOB).await?;
        self.conn.flush().await?;
        trace!(blob = %id, "Blob received");
        Ok(())
    }

    // Best effort; the connection is going away either way.
    async fn reject(&mut self) {
        let _ = self.conn.write_string(AUTH_FAILED).await;
        let _ = self.conn.flush().await;
    }
}
