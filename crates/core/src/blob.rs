use crate::error::StoreError;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tracing::debug;

/// Storage for uploaded PDF bytes. The returned reference is what documents
/// record as their `storage_ref`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, bytes: &[u8]) -> Result<String, StoreError>;

    async fn get(&self, storage_ref: &str) -> Result<Vec<u8>, StoreError>;

    async fn delete(&self, storage_ref: &str) -> Result<bool, StoreError>;
}

pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Content-addressed blobs in a local directory, one file per SHA-256 digest.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn path_for(&self, storage_ref: &str) -> Result<PathBuf, StoreError> {
        let well_formed = storage_ref.len() == 64
            && storage_ref
                .bytes()
                .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte));
        if !well_formed {
            return Err(StoreError::InvalidStorageRef(storage_ref.to_string()));
        }
        Ok(self.root.join(format!("{storage_ref}.pdf")))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, bytes: &[u8]) -> Result<String, StoreError> {
        let storage_ref = digest_bytes(bytes);
        let path = self.path_for(&storage_ref)?;
        if fs::try_exists(&path).await? {
            debug!(%storage_ref, "blob already stored");
            return Ok(storage_ref);
        }

        let staging = path.with_extension("partial");
        fs::write(&staging, bytes).await?;
        fs::rename(&staging, &path).await?;
        debug!(%storage_ref, size = bytes.len(), "blob stored");
        Ok(storage_ref)
    }

    async fn get(&self, storage_ref: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(storage_ref)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                Err(StoreError::BlobNotFound(storage_ref.to_string()))
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn delete(&self, storage_ref: &str) -> Result<bool, StoreError> {
        let path = self.path_for(storage_ref)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }
}
