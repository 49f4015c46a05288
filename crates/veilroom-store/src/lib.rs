pub mod blobs;

mod error;

pub use blobs::BlobStore;
pub use error::StoreError;
