use std::collections::HashSet;
use std::path::PathBuf;

use tokio::fs;
use tokio::io::{ErrorKind, SeekFrom};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, StoreError};

// Flat directory of UUID-named files. Ids are random, so collisions are
// impossible by construction; blobs are write-once after creation.
#[derive(Debug, Clone)]
pub struct BlobStore {
    base_path: PathBuf,
}

impl BlobStore {
    pub async fn new(base_path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_path).await?;
        info!(path = %base_path.display(), "Blob store initialized");
        Ok(Self { base_path })
    }

    /// Allocate a fresh blob and hand back its writable file.
    pub async fn create(&self) -> Result<(Uuid, fs::File)> {
        let id = Uuid::new_v4();
        let file = self.create_with_id(id).await?;
        Ok((id, file))
    }

    /// Open a writable file for a known id. Used by the sync server when
    /// receiving a blob announced by a peer; re-delivery truncates and
    /// rewrites the same immutable content.
    pub async fn create_with_id(&self, id: Uuid) -> Result<fs::File> {
        let file = fs::File::create(self.blob_path(&id)).await?;
        debug!(id = %id, "Created blob");
        Ok(file)
    }

    /// Write a whole buffer as a new blob.
    pub async fn put(&self, data: &[u8]) -> Result<Uuid> {
        use tokio::io::AsyncWriteExt;

        let (id, mut file) = self.create().await?;
        file.write_all(data).await?;
        file.flush().await?;
        debug!(id = %id, size = data.len(), "Stored blob");
        Ok(id)
    }

    /// Size of a blob in bytes.
    pub async fn stat(&self, id: Uuid) -> Result<u64> {
        match fs::metadata(self.blob_path(&id)).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Open a blob read-only, positioned at the start.
    pub async fn open(&self, id: Uuid) -> Result<fs::File> {
        use tokio::io::AsyncSeekExt;

        match fs::File::open(self.blob_path(&id)).await {
            Ok(mut file) => {
                file.seek(SeekFrom::Start(0)).await?;
                Ok(file)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Read a whole blob into memory.
    pub async fn get(&self, id: Uuid) -> Result<Vec<u8>> {
        match fs::read(self.blob_path(&id)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        match fs::remove_file(self.blob_path(&id)).await {
            Ok(()) => {
                debug!(id = %id, "Deleted blob");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list(&self) -> Result<Vec<Uuid>> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.base_path).await?;

        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(id) = Uuid::parse_str(name) {
                    ids.push(id);
                }
            }
        }

        Ok(ids)
    }

    /// Delete every stored blob whose id is not referenced. Returns how
    /// many were removed.
    pub async fn sweep(&self, referenced: &HashSet<Uuid>) -> Result<usize> {
        let mut removed = 0;
        for id in self.list().await? {
            if referenced.contains(&id) {
                continue;
            }
            match self.delete(id).await {
                Ok(()) => removed += 1,
                // raced with a concurrent delete, nothing lost
                Err(StoreError::NotFound(_)) => {}
                Err(e) => warn!(id = %id, error = %e, "Sweep failed to delete blob"),
            }
        }

        if removed > 0 {
            info!(removed, "Swept unreferenced blobs");
        }
        Ok(removed)
    }

    fn blob_path(&self, id: &Uuid) -> PathBuf {
        self.base_path.join(id.to_string())
    }
}
