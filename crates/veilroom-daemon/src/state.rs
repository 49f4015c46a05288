//! Serializable view of the daemon's state.
//!
//! The daemon itself never writes these to disk; the API layer decides
//! where and when. Queue handles and connections are runtime-only and
//! rebuilt on restore.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use veilroom_net::Dialer;
use veilroom_shared::{Identity, IdentityExport, Message, PeerMeta, RemoteIdentity, SyncState};
use veilroom_store::BlobStore;

use crate::commands::CommandRegistry;
use crate::error::DaemonError;
use crate::room::{PeerRecord, Room, RoomState};

#[derive(Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub fingerprint: String,
    pub meta: PeerMeta,
}

#[derive(Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub id: Uuid,
    pub name: Option<String>,
    pub identity: IdentityExport,
    pub self_meta: PeerMeta,
    pub peers: Vec<PeerSnapshot>,
    pub messages: Vec<Message>,
    pub sync_state: SyncState,
}

#[derive(Serialize, Deserialize, Default)]
pub struct DaemonState {
    pub rooms: Vec<RoomSnapshot>,
}

impl Room {
    pub fn snapshot(&self) -> RoomSnapshot {
        let st = self.lock();
        RoomSnapshot {
            id: st.id,
            name: st.name.clone(),
            identity: st.identity.to_export(),
            self_meta: st.self_meta.clone(),
            peers: st
                .peers
                .iter()
                .map(|(fingerprint, record)| PeerSnapshot {
                    fingerprint: fingerprint.clone(),
                    meta: record.meta.clone(),
                })
                .collect(),
            messages: st.messages.clone(),
            sync_state: st.sync_state.clone(),
        }
    }

    /// Rebuild a room from its snapshot and launch a queue per peer.
    /// Must run inside the daemon's runtime.
    pub fn from_snapshot(
        snapshot: RoomSnapshot,
        blobs: Arc<BlobStore>,
        dialer: Arc<dyn Dialer>,
        registry: Arc<CommandRegistry>,
    ) -> Result<Self, DaemonError> {
        let mut peers = HashMap::new();
        for peer in snapshot.peers {
            let identity = RemoteIdentity::from_fingerprint(&peer.fingerprint)?;
            peers.insert(
                peer.fingerprint,
                PeerRecord {
                    identity,
                    meta: peer.meta,
                    queue: None,
                },
            );
        }

        let state = RoomState {
            id: snapshot.id,
            name: snapshot.name,
            identity: Identity::from_export(&snapshot.identity),
            self_meta: snapshot.self_meta,
            peers,
            messages: snapshot.messages,
            sync_state: snapshot.sync_state,
        };

        let room = Room::from_state(state, blobs, dialer, registry);
        room.launch_queues();
        Ok(room)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use veilroom_net::StaticDialer;
    use veilroom_shared::ContentType;

    async fn parts() -> (Arc<BlobStore>, Arc<StaticDialer>, Arc<CommandRegistry>, TempDir) {
        let dir = TempDir::new().unwrap();
        let blobs = Arc::new(BlobStore::new(dir.path().to_path_buf()).await.unwrap());
        (
            blobs,
            Arc::new(StaticDialer::new()),
            Arc::new(CommandRegistry::with_room_commands()),
            dir,
        )
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let (blobs, dialer, registry, _dir) = parts().await;
        let room = Room::new(Identity::generate(), blobs.clone(), dialer.clone(), registry.clone());

        let peer = Identity::generate();
        room.add_peer(RemoteIdentity::from_fingerprint(&peer.fingerprint()).unwrap())
            .unwrap();
        room.set_name("the room");
        room.post(ContentType::Text, b"persist me".to_vec());

        let snapshot = room.snapshot();
        let json = serde_json::to_vec(&snapshot).unwrap();
        let restored_snapshot: RoomSnapshot = serde_json::from_slice(&json).unwrap();

        let restored = Room::from_snapshot(restored_snapshot, blobs, dialer, registry).unwrap();
        assert_eq!(restored.id(), room.id());
        assert_eq!(restored.name(), room.name());
        assert_eq!(restored.fingerprint(), room.fingerprint());
        assert_eq!(restored.messages(), room.messages());
        assert_eq!(restored.sync_state(), room.sync_state());
        assert!(restored.has_peer(&peer.fingerprint()));
        assert!(restored.is_admin(&restored.fingerprint()));
    }
}
