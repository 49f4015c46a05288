//! Ties the pieces together: one blob store, one dialer, one command
//! registry and the registry of live rooms. The API layer talks to this
//! type and to [`Room`] handles only.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use veilroom_net::{Dialer, TorDialer};
use veilroom_shared::{ContentType, Identity, Message, RemoteIdentity};
use veilroom_store::BlobStore;

use crate::commands::{CommandEffect, CommandRegistry};
use crate::config::DaemonConfig;
use crate::error::DaemonError;
use crate::room::Room;
use crate::state::{DaemonState, RoomSnapshot};
use crate::sync_server::RoomRegistry;

pub struct Daemon {
    config: DaemonConfig,
    blobs: Arc<BlobStore>,
    dialer: Arc<dyn Dialer>,
    registry: Arc<CommandRegistry>,
    rooms: RoomRegistry,
}

impl Daemon {
    /// A daemon dialing through the onion router's SOCKS port.
    pub async fn new(config: DaemonConfig) -> Result<Self, DaemonError> {
        let blobs = Arc::new(BlobStore::new(config.blob_dir()).await?);
        let dialer: Arc<dyn Dialer> = Arc::new(TorDialer::new(config.socks_port));
        Ok(Self::with_dialer(config, blobs, dialer))
    }

    /// A daemon with explicit plumbing. Tests route around the overlay
    /// with a [`veilroom_net::StaticDialer`].
    pub fn with_dialer(
        config: DaemonConfig,
        blobs: Arc<BlobStore>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        Self {
            config,
            blobs,
            dialer,
            registry: Arc::new(CommandRegistry::with_room_commands()),
            rooms: RoomRegistry::new(),
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn blob_store(&self) -> Arc<BlobStore> {
        self.blobs.clone()
    }

    /// Handle for the sync server's acceptor.
    pub fn room_registry(&self) -> RoomRegistry {
        self.rooms.clone()
    }

    /// Create a room under a fresh identity, bootstrapping the given
    /// peers into its member set.
    pub async fn create_room(&self, peers: &[String]) -> Result<Uuid, DaemonError> {
        self.create_room_with_identity(Identity::generate(), peers)
            .await
    }

    pub async fn create_room_with_identity(
        &self,
        identity: Identity,
        peers: &[String],
    ) -> Result<Uuid, DaemonError> {
        let room = Room::new(
            identity,
            self.blobs.clone(),
            self.dialer.clone(),
            self.registry.clone(),
        );
        for fingerprint in peers {
            let remote = RemoteIdentity::from_fingerprint(fingerprint)?;
            room.add_peer(remote)?;
        }

        let id = room.id();
        self.rooms.insert(room).await;
        info!(room = %id, peers = peers.len(), "Room created");
        Ok(id)
    }

    pub async fn delete_room(&self, id: &Uuid) -> Result<(), DaemonError> {
        match self.rooms.remove(id).await {
            Some(room) => {
                room.stop_queues();
                info!(room = %id, "Room deleted");
                Ok(())
            }
            None => Err(DaemonError::UnknownRoom(*id)),
        }
    }

    pub async fn room(&self, id: &Uuid) -> Option<Room> {
        self.rooms.get(id).await
    }

    pub async fn room_ids(&self) -> Vec<Uuid> {
        self.rooms.ids().await
    }

    /// Post into a room. A `remove`-self command posted locally deletes
    /// the room, like one arriving over the wire would.
    pub async fn post(
        &self,
        room_id: &Uuid,
        content_type: ContentType,
        content: Vec<u8>,
    ) -> Result<(), DaemonError> {
        let room = self
            .rooms
            .get(room_id)
            .await
            .ok_or(DaemonError::UnknownRoom(*room_id))?;

        if room.post(content_type, content) == CommandEffect::DeleteRoom {
            self.rooms.remove(room_id).await;
        }
        Ok(())
    }

    /// Store a blob and post the binary message referencing it. Store
    /// exhaustion surfaces to the caller here.
    pub async fn send_blob(&self, room_id: &Uuid, data: &[u8]) -> Result<Uuid, DaemonError> {
        let room = self
            .rooms
            .get(room_id)
            .await
            .ok_or(DaemonError::UnknownRoom(*room_id))?;

        let blob_id = self.blobs.put(data).await?;
        room.post(ContentType::Binary, blob_id.as_bytes().to_vec());
        Ok(blob_id)
    }

    /// Drop every blob no binary message references anymore.
    pub async fn sweep_blobs(&self) -> Result<usize, DaemonError> {
        let mut referenced = HashSet::new();
        for id in self.rooms.ids().await {
            if let Some(room) = self.rooms.get(&id).await {
                referenced.extend(room.messages().iter().filter_map(Message::blob_id));
            }
        }
        Ok(self.blobs.sweep(&referenced).await?)
    }

    pub async fn snapshot(&self) -> DaemonState {
        let mut rooms = Vec::new();
        for id in self.rooms.ids().await {
            if let Some(room) = self.rooms.get(&id).await {
                rooms.push(room.snapshot());
            }
        }
        DaemonState { rooms }
    }

    pub async fn restore_room(&self, snapshot: RoomSnapshot) -> Result<Uuid, DaemonError> {
        let room = Room::from_snapshot(
            snapshot,
            self.blobs.clone(),
            self.dialer.clone(),
            self.registry.clone(),
        )?;
        let id = room.id();
        self.rooms.insert(room).await;
        info!(room = %id, "Room restored");
        Ok(id)
    }

    pub async fn restore(&self, state: DaemonState) -> Result<(), DaemonError> {
        for snapshot in state.rooms {
            self.restore_room(snapshot).await?;
        }
        Ok(())
    }
}
