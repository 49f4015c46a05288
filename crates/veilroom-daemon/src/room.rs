//! Room state and the operations every other component goes through.
//!
//! [`RoomState`] is plain data behind a mutex; [`Room`] is the cheap
//! cloneable handle that the API layer, the sync server and the command
//! handlers share. The lock is only ever held for the duration of a
//! mutation or snapshot, never across IO.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};
use uuid::Uuid;

use veilroom_net::Dialer;
use veilroom_shared::{ContentType, Identity, Message, PeerMeta, RemoteIdentity, SyncState};
use veilroom_store::BlobStore;

use crate::commands::{CommandEffect, CommandRegistry};
use crate::error::RoomError;
use crate::peer::{self, PeerCommand, QueueHandle};

pub struct PeerRecord {
    pub identity: RemoteIdentity,
    pub meta: PeerMeta,
    pub(crate) queue: Option<QueueHandle>,
}

pub struct RoomState {
    pub(crate) id: Uuid,
    pub(crate) name: Option<String>,
    pub(crate) identity: Identity,
    pub(crate) self_meta: PeerMeta,
    pub(crate) peers: HashMap<String, PeerRecord>,
    pub(crate) messages: Vec<Message>,
    pub(crate) sync_state: SyncState,
}

/// Shared handle to one room.
#[derive(Clone)]
pub struct Room {
    pub(crate) state: Arc<Mutex<RoomState>>,
    blobs: Arc<BlobStore>,
    dialer: Arc<dyn Dialer>,
    registry: Arc<CommandRegistry>,
}

impl Room {
    /// Create a room with a fresh id. The creator is the implicit admin;
    /// invited peers start without privileges until promoted.
    pub fn new(
        identity: Identity,
        blobs: Arc<BlobStore>,
        dialer: Arc<dyn Dialer>,
        registry: Arc<CommandRegistry>,
    ) -> Self {
        let state = RoomState {
            id: Uuid::new_v4(),
            name: None,
            identity,
            self_meta: PeerMeta {
                nick: None,
                admin: true,
            },
            peers: HashMap::new(),
            messages: Vec::new(),
            sync_state: SyncState::new(),
        };

        Self {
            state: Arc::new(Mutex::new(state)),
            blobs,
            dialer,
            registry,
        }
    }

    pub(crate) fn from_state(
        state: RoomState,
        blobs: Arc<BlobStore>,
        dialer: Arc<dyn Dialer>,
        registry: Arc<CommandRegistry>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            blobs,
            dialer,
            registry,
        }
    }

    pub fn id(&self) -> Uuid {
        self.lock().id
    }

    pub fn name(&self) -> Option<String> {
        self.lock().name.clone()
    }

    pub fn set_name(&self, name: &str) {
        self.lock().name = Some(name.to_string());
    }

    /// Fingerprint of the local identity bound to this room.
    pub fn fingerprint(&self) -> String {
        self.lock().identity.fingerprint()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().messages.clone()
    }

    pub fn sync_state(&self) -> SyncState {
        self.lock().sync_state.clone()
    }

    pub fn peer_fingerprints(&self) -> Vec<String> {
        self.lock().peers.keys().cloned().collect()
    }

    pub fn has_peer(&self, fingerprint: &str) -> bool {
        self.lock().peers.contains_key(fingerprint)
    }

    pub(crate) fn peer_identity(&self, fingerprint: &str) -> Option<RemoteIdentity> {
        self.lock().peers.get(fingerprint).map(|p| p.identity.clone())
    }

    pub fn peer_meta(&self, fingerprint: &str) -> Option<PeerMeta> {
        let st = self.lock();
        if fingerprint == st.identity.fingerprint() {
            return Some(st.self_meta.clone());
        }
        st.peers.get(fingerprint).map(|p| p.meta.clone())
    }

    pub fn is_admin(&self, fingerprint: &str) -> bool {
        self.peer_meta(fingerprint).is_some_and(|m| m.admin)
    }

    /// Set a member's nickname; works for the local member too.
    pub fn set_nick(&self, fingerprint: &str, nick: &str) -> Result<(), RoomError> {
        let mut st = self.lock();
        if fingerprint == st.identity.fingerprint() {
            st.self_meta.nick = Some(nick.to_string());
            return Ok(());
        }
        match st.peers.get_mut(fingerprint) {
            Some(record) => {
                record.meta.nick = Some(nick.to_string());
                Ok(())
            }
            None => Err(RoomError::UnknownPeer(fingerprint.to_string())),
        }
    }

    /// Grant admin; promoting the local member is allowed.
    pub fn promote(&self, fingerprint: &str) -> Result<(), RoomError> {
        let mut st = self.lock();
        if fingerprint == st.identity.fingerprint() {
            st.self_meta.admin = true;
            return Ok(());
        }
        match st.peers.get_mut(fingerprint) {
            Some(record) => {
                record.meta.admin = true;
                Ok(())
            }
            None => Err(RoomError::UnknownPeer(fingerprint.to_string())),
        }
    }

    pub(crate) fn blob_store(&self) -> Arc<BlobStore> {
        self.blobs.clone()
    }

    /// Add a member and launch its outbound queue.
    pub fn add_peer(&self, remote: RemoteIdentity) -> Result<(), RoomError> {
        let fingerprint = remote.fingerprint();
        let queue = peer::spawn_queue(
            Arc::downgrade(&self.state),
            remote.clone(),
            self.blobs.clone(),
            self.dialer.clone(),
        );

        let room_id;
        {
            let mut st = self.lock();
            if fingerprint == st.identity.fingerprint() || st.peers.contains_key(&fingerprint) {
                // dropping the handle tears the queue down again
                return Err(RoomError::DuplicatePeer(fingerprint));
            }
            room_id = st.id;
            st.peers.insert(
                fingerprint.clone(),
                PeerRecord {
                    identity: remote,
                    meta: PeerMeta::default(),
                    queue: Some(queue),
                },
            );
        }

        info!(room = %room_id, peer = %fingerprint, "Peer added");
        Ok(())
    }

    /// Drop a member and cancel its queue. No-op when absent.
    pub fn remove_peer(&self, fingerprint: &str) {
        let removed = self.lock().peers.remove(fingerprint);
        if removed.is_some() {
            info!(peer = %fingerprint, "Peer removed");
        }
    }

    /// Cancel every outbound queue. The room stays readable; idempotent.
    pub fn stop_queues(&self) {
        let mut st = self.lock();
        for record in st.peers.values_mut() {
            record.queue = None;
        }
        debug!(room = %st.id, "All queues stopped");
    }

    /// Relaunch queues for peers that have none, e.g. after restoring a
    /// room from a state snapshot.
    pub fn launch_queues(&self) {
        let pending: Vec<RemoteIdentity> = {
            let st = self.lock();
            st.peers
                .values()
                .filter(|r| r.queue.is_none())
                .map(|r| r.identity.clone())
                .collect()
        };

        for remote in pending {
            let queue = peer::spawn_queue(
                Arc::downgrade(&self.state),
                remote.clone(),
                self.blobs.clone(),
                self.dialer.clone(),
            );
            let mut st = self.lock();
            if let Some(record) = st.peers.get_mut(&remote.fingerprint()) {
                record.queue = Some(queue);
            }
        }
    }

    /// Author, sign and append a message, then poke every peer queue.
    /// Command messages are also interpreted locally.
    pub fn post(&self, content_type: ContentType, content: Vec<u8>) -> CommandEffect {
        let (message, bumps) = {
            let mut st = self.lock();
            let message = Message::signed(&st.identity, content_type, content);
            st.messages.push(message.clone());
            record_watermark(&mut st.sync_state, &message);
            (message, bump_handles(&st))
        };

        bump_all(&bumps);
        self.interpret(&message)
    }

    /// Accept a message delivered by a peer. Order matters: admission,
    /// signature, de-duplication, append, then command dispatch.
    pub fn ingest(&self, message: Message) -> Result<CommandEffect, RoomError> {
        let bumps = {
            let mut st = self.lock();

            let valid = if message.sender == st.identity.fingerprint() {
                message.verify_own(&st.identity)
            } else if let Some(record) = st.peers.get(&message.sender) {
                message.verify(&record.identity)
            } else {
                return Err(RoomError::UnknownPeer(message.sender.clone()));
            };
            if !valid {
                return Err(RoomError::InvalidSignature(message.sender.clone()));
            }

            // The network may redeliver on retries; the triple is identity
            // enough since content includes the payload.
            let duplicate = st.messages.iter().any(|m| {
                m.sender == message.sender && m.time == message.time && m.content == message.content
            });
            if duplicate {
                debug!(room = %st.id, sender = %message.sender, "Dropped duplicate message");
                return Ok(CommandEffect::None);
            }

            st.messages.push(message.clone());
            record_watermark(&mut st.sync_state, &message);
            bump_handles(&st)
        };

        bump_all(&bumps);
        Ok(self.interpret(&message))
    }

    // Dispatch a command message. Failed commands stay in history as an
    // audit trail and mutate nothing; the sender is not notified.
    fn interpret(&self, message: &Message) -> CommandEffect {
        if message.content_type != ContentType::Command {
            return CommandEffect::None;
        }

        match self.registry.dispatch(message, self) {
            Ok(effect) => effect,
            Err(e) => {
                warn!(sender = %message.sender, error = %e, "Command failed");
                CommandEffect::None
            }
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RoomState> {
        lock_state(&self.state)
    }
}

pub(crate) fn lock_state(state: &Mutex<RoomState>) -> MutexGuard<'_, RoomState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Messages the remote side is missing: everything from senders it has
/// never seen, plus everything strictly newer than its watermark.
pub(crate) fn messages_since(st: &RoomState, remote: &SyncState) -> Vec<Message> {
    st.messages
        .iter()
        .filter(|m| remote.get(&m.sender).is_none_or(|t| *t < m.time))
        .cloned()
        .collect()
}

fn record_watermark(sync_state: &mut SyncState, message: &Message) {
    let entry = sync_state
        .entry(message.sender.clone())
        .or_insert(message.time);
    if *entry < message.time {
        *entry = message.time;
    }
}

fn bump_handles(st: &RoomState) -> Vec<tokio::sync::mpsc::Sender<PeerCommand>> {
    st.peers
        .values()
        .filter_map(|r| r.queue.as_ref().map(QueueHandle::bumper))
        .collect()
}

fn bump_all(bumps: &[tokio::sync::mpsc::Sender<PeerCommand>]) {
    for tx in bumps {
        // a full channel already has a wake pending
        let _ = tx.try_send(PeerCommand::Bump);
    }
}
