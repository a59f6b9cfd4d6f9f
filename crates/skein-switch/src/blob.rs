//! Content-addressed blob stores.
//!
//! Blobs are named by the lowercase hex BLAKE3 hash of their content. A blob
//! only becomes visible once its whole stream has been read without error.
//!
//! Local layout:
//! ```text
//! root/
//! ├── tmp/            # partially written blobs
//! └── ab/
//!     └── abcdef...   # blob named by its hash, fanned out by prefix
//! ```

use crate::error::{Result, SwitchError};
use crate::stream::{ByteStream, from_bytes};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

const READ_CHUNK: usize = 64 * 1024;

/// Content-addressed storage on one node
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store everything `stream` yields and return its content hash
    async fn create_file(&self, stream: ByteStream) -> Result<String>;

    /// Open a stored blob for reading
    async fn open_read(&self, hash: &str) -> Result<ByteStream>;

    async fn contains(&self, hash: &str) -> Result<bool>;

    /// Number of stored blobs
    async fn count(&self) -> Result<usize>;
}

/// Blob store kept in memory, for tests and the driver side
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, Bytes>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, hash: &str) -> Option<Bytes> {
        self.blobs.get(hash).map(|b| b.clone())
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn create_file(&self, mut stream: ByteStream) -> Result<String> {
        let mut data = Vec::new();
        stream.read_to_end(&mut data).await?;
        let hash = blake3::hash(&data).to_hex().to_string();
        trace!(hash = %hash, bytes = data.len(), "blob stored in memory");
        self.blobs.insert(hash.clone(), Bytes::from(data));
        Ok(hash)
    }

    async fn open_read(&self, hash: &str) -> Result<ByteStream> {
        self.get(hash)
            .map(|data| from_bytes(data))
            .ok_or_else(|| SwitchError::Blob(format!("blob {} not found", hash)))
    }

    async fn contains(&self, hash: &str) -> Result<bool> {
        Ok(self.blobs.contains_key(hash))
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.blobs.len())
    }
}

/// Blob store on the local filesystem
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub async fn new(root: &Path) -> Result<Self> {
        fs::create_dir_all(root.join("tmp")).await?;
        debug!(root = %root.display(), "initialized local blob store");
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn blob_path(&self, hash: &str) -> Result<PathBuf> {
        if hash.len() < 3 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(SwitchError::Blob(format!("invalid blob hash {:?}", hash)));
        }
        Ok(self.root.join(&hash[..2]).join(hash))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn create_file(&self, mut stream: ByteStream) -> Result<String> {
        let tmp = self
            .root
            .join("tmp")
            .join(uuid::Uuid::new_v4().to_string());
        let mut file = fs::File::create(&tmp).await?;
        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; READ_CHUNK];
        let mut total = 0u64;

        let written: Result<()> = async {
            loop {
                let n = stream.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                file.write_all(&buf[..n]).await?;
                total += n as u64;
            }
            file.sync_all().await?;
            Ok(())
        }
        .await;
        drop(file);
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp).await;
            return Err(e);
        }

        let hash = hasher.finalize().to_hex().to_string();
        let path = self.blob_path(&hash)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&tmp, &path).await?;
        debug!(hash = %hash, bytes = total, "blob stored");
        Ok(hash)
    }

    async fn open_read(&self, hash: &str) -> Result<ByteStream> {
        let path = self.blob_path(hash)?;
        match fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SwitchError::Blob(format!("blob {} not found", hash)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn contains(&self, hash: &str) -> Result<bool> {
        Ok(fs::try_exists(self.blob_path(hash)?).await?)
    }

    async fn count(&self) -> Result<usize> {
        let mut count = 0;
        let mut dirs = fs::read_dir(&self.root).await?;
        while let Some(entry) = dirs.next_entry().await? {
            if entry.file_name() == "tmp" || !entry.file_type().await?.is_dir() {
                continue;
            }
            let mut blobs = fs::read_dir(entry.path()).await?;
            while blobs.next_entry().await?.is_some() {
                count += 1;
            }
        }
        Ok(count)
    }
}
