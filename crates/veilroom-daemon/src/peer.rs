//! Outbound side of a room membership: one queue task per remote peer.
//!
//! The task wakes on a bump, on cancellation, or after the polling
//! interval, compares its own high-watermark snapshot against the room's,
//! and runs the sync-protocol client when the peer might be behind. The
//! task holds only a weak reference to the room, so a dropped room ends
//! its queues naturally.

use std::sync::{Arc, Mutex, Weak};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace};
use uuid::Uuid;

use veilroom_net::{Dialer, FramedConnection};
use veilroom_shared::constants::{
    ACK_AUTH, ACK_BLOB, ACK_BLOCK, ACK_MESSAGES, ACK_SYNC, BLOCK_SIZE, PUB_CONV_PORT,
    QUEUE_TIMEOUT,
};
use veilroom_shared::{is_caught_up, Identity, Message, RemoteIdentity, SyncState};
use veilroom_store::{BlobStore, StoreError};

use crate::error::SyncError;
use crate::room::{self, RoomState};

pub(crate) enum PeerCommand {
    /// Skip the current wait period and sync now.
    Bump,
}

/// Owner side of a queue task. Dropping the handle cancels the task,
/// force-closing any connection it has open.
pub(crate) struct QueueHandle {
    tx: mpsc::Sender<PeerCommand>,
    task: JoinHandle<()>,
}

impl QueueHandle {
    pub(crate) fn bumper(&self) -> mpsc::Sender<PeerCommand> {
        self.tx.clone()
    }
}

impl Drop for QueueHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub(crate) fn spawn_queue(
    state: Weak<Mutex<RoomState>>,
    remote: RemoteIdentity,
    blobs: Arc<BlobStore>,
    dialer: Arc<dyn Dialer>,
) -> QueueHandle {
    let (tx, rx) = mpsc::channel(8);
    let task = tokio::spawn(run_queue(state, remote, blobs, dialer, rx));
    QueueHandle { tx, task }
}

async fn run_queue(
    state: Weak<Mutex<RoomState>>,
    remote: RemoteIdentity,
    blobs: Arc<BlobStore>,
    dialer: Arc<dyn Dialer>,
    mut rx: mpsc::Receiver<PeerCommand>,
) {
    let fingerprint = remote.fingerprint();
    // Owned by this task, never shared. Unchanged on failed attempts so
    // the next wake retries the same window.
    let mut last_sync = SyncState::new();

    loop {
        let Some(room) = state.upgrade() else { break };

        let current = room::lock_state(&room).sync_state.clone();
        if !is_caught_up(&last_sync, &current) {
            match sync_once(&room, &remote, &blobs, &dialer).await {
                Ok(snapshot) => {
                    debug!(peer = %fingerprint, "Sync complete");
                    last_sync = snapshot;
                }
                Err(e) => {
                    debug!(peer = %fingerprint, error = %e, "Sync attempt failed, will retry");
                }
            }
        }
        drop(room);

        match timeout(QUEUE_TIMEOUT, rx.recv()).await {
            Ok(Some(PeerCommand::Bump)) => {} // wait period skipped
            Ok(None) => break,                // queue cancelled
            Err(_) => {}                      // polling interval elapsed
        }
    }

    debug!(peer = %fingerprint, "Queue terminated");
}

async fn sync_once(
    room: &Arc<Mutex<RoomState>>,
    remote: &RemoteIdentity,
    blobs: &Arc<BlobStore>,
    dialer: &Arc<dyn Dialer>,
) -> Result<SyncState, SyncError> {
    let (room_id, identity) = {
        let st = room::lock_state(room);
        (st.id, st.identity.clone())
    };

    let stream = dialer.dial(remote.service_id(), PUB_CONV_PORT).await?;
    let conn = FramedConnection::new(stream);
    run_sync_client(conn, room, room_id, identity, blobs).await
}

// ---------------------------------------------------------------------------
// Sync protocol, client side
// ---------------------------------------------------------------------------

/// One protocol step per variant; [`SyncClient::step`] is the transition
/// function. Any error aborts the whole exchange.
enum ClientPhase {
    AwaitChallenge,
    SendAuth { challenge: Vec<u8> },
    SelectRoom,
    AwaitAuthAck,
    ReadRemoteState,
    SendDiff { remote_state: SyncState },
    AwaitMessagesAck,
    SendBlobList,
    StreamBlobs,
    AwaitSyncAck,
    Done,
}

struct SyncClient<'a, S> {
    conn: FramedConnection<S>,
    room: &'a Arc<Mutex<RoomState>>,
    room_id: Uuid,
    identity: Identity,
    blobs: &'a Arc<BlobStore>,
    pending: Vec<Message>,
    blob_ids: Vec<Uuid>,
    snapshot: SyncState,
}

/// Drive the client side over an established connection. Returns the
/// sync-state snapshot taken when the diff was computed; the caller
/// stores it as the peer's new high-watermark.
pub(crate) async fn run_sync_client<S: AsyncRead + AsyncWrite>(
    conn: FramedConnection<S>,
    room: &Arc<Mutex<RoomState>>,
    room_id: Uuid,
    identity: Identity,
    blobs: &Arc<BlobStore>,
) -> Result<SyncState, SyncError> {
    let mut client = SyncClient {
        conn,
        room,
        room_id,
        identity,
        blobs,
        pending: Vec::new(),
        blob_ids: Vec::new(),
        snapshot: SyncState::new(),
    };

    let mut phase = ClientPhase::AwaitChallenge;
    while !matches!(phase, ClientPhase::Done) {
        phase = client.step(phase).await?;
    }
    Ok(client.snapshot)
}

impl<S: AsyncRead + AsyncWrite> SyncClient<'_, S> {
    async fn step(&mut self, phase: ClientPhase) -> Result<ClientPhase, SyncError> {
        Ok(match phase {
            ClientPhase::AwaitChallenge => {
                let challenge = self.conn.read_bytes(false).await?;
                ClientPhase::SendAuth { challenge }
            }

            ClientPhase::SendAuth { challenge } => {
                self.conn.write_string(&self.identity.fingerprint()).await?;
                let signature = self.identity.sign(&challenge);
                self.conn.write_bytes(&signature.to_bytes(), false).await?;
                self.conn.flush().await?;
                ClientPhase::SelectRoom
            }

            ClientPhase::SelectRoom => {
                self.conn.write_bytes(self.room_id.as_bytes(), false).await?;
                self.conn.flush().await?;
                ClientPhase::AwaitAuthAck
            }

            ClientPhase::AwaitAuthAck => {
                self.expect(ACK_AUTH).await?;
                ClientPhase::ReadRemoteState
            }

            ClientPhase::ReadRemoteState => {
                let remote_state: SyncState = self.conn.read_struct(false).await?;
                ClientPhase::SendDiff { remote_state }
            }

            ClientPhase::SendDiff { remote_state } => {
                // Consistent snapshot under the lock, IO after release.
                {
                    let st = room::lock_state(self.room);
                    self.pending = room::messages_since(&st, &remote_state);
                    self.snapshot = st.sync_state.clone();
                }
                self.conn.write_struct(&self.pending, true).await?;
                self.conn.flush().await?;
                ClientPhase::AwaitMessagesAck
            }

            ClientPhase::AwaitMessagesAck => {
                self.expect(ACK_MESSAGES).await?;
                ClientPhase::SendBlobList
            }

            ClientPhase::SendBlobList => {
                self.blob_ids = self.pending.iter().filter_map(Message::blob_id).collect();
                self.conn.write_struct(&self.blob_ids, false).await?;
                self.conn.flush().await?;
                ClientPhase::StreamBlobs
            }

            ClientPhase::StreamBlobs => {
                let ids = std::mem::take(&mut self.blob_ids);
                for id in ids {
                    self.send_blob(id).await?;
                }
                ClientPhase::AwaitSyncAck
            }

            ClientPhase::AwaitSyncAck => {
                self.expect(ACK_SYNC).await?;
                ClientPhase::Done
            }

            ClientPhase::Done => ClientPhase::Done,
        })
    }

    /// Block-count frame, then fixed-size blocks each acknowledged
    /// individually before the next goes out.
    async fn send_blob(&mut self, id: Uuid) -> Result<(), SyncError> {
        let size = self.blobs.stat(id).await? as usize;
        let block_count = size.div_ceil(BLOCK_SIZE);
        self.conn.write_int(block_count as i32).await?;

        let mut file = self.blobs.open(id).await?;
        let mut buf = vec![0u8; BLOCK_SIZE];
        let mut remaining = size;

        for _ in 0..block_count {
            let len = remaining.min(BLOCK_SIZE);
            file.read_exact(&mut buf[..len])
                .await
                .map_err(StoreError::Io)?;

            self.conn.write_bytes(&buf[..len], false).await?;
            self.conn.flush().await?;
            self.expect(ACK_BLOCK).await?;
            remaining -= len;
        }

        self.expect(ACK_BLOB).await?;
        trace!(blob = %id, size, "Blob transferred");
        Ok(())
    }

    async fn expect(&mut self, want: &str) -> Result<(), SyncError> {
        let got = self.conn.read_string().await?;
        if got != want {
            return Err(SyncError::UnexpectedReply {
                got,
                want: want.to_string(),
            });
        }
        Ok(())
    }
}
