//! Named-blob persistence capability
//!
//! The cache layers persist through a [`BlobStore`]: `get`, `set` and
//! `delete` on opaque byte blobs addressed by name. The host decides what
//! backs it (platform keychain, app data directory, ...). Two stores ship
//! with the crate: an in-process map and a directory of files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use tokio::sync::Mutex;
use tracing::debug;

use crate::BoxFuture;
use crate::error::{Error, Result};

/// Durable storage for named blobs.
///
/// Uses boxed futures for dyn-compatibility (`Arc<dyn BlobStore>`).
pub trait BlobStore: Send + Sync {
    /// Read a blob. A missing blob is `Ok(None)`, not an error.
    fn get<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>>;

    /// Create or overwrite a blob.
    fn set<'a>(&'a self, name: &'a str, blob: Vec<u8>) -> BoxFuture<'a, Result<()>>;

    /// Delete a blob. Deleting a missing blob succeeds.
    fn delete<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// In-process blob store.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl BlobStore for MemoryBlobStore {
    fn get<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(async move { Ok(self.blobs.lock().await.get(name).cloned()) })
    }

    fn set<'a>(&'a self, name: &'a str, blob: Vec<u8>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.blobs.lock().await.insert(name.to_string(), blob);
            Ok(())
        })
    }

    fn delete<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.blobs.lock().await.remove(name);
            Ok(())
        })
    }
}

/// One file per blob inside a directory.
///
/// Blob names are encoded with URL-safe base64 so arbitrary keys (URLs,
/// `host::client` pairs) map to valid file names. Writes go through a temp
/// file + rename and the result is readable by the owner only.
pub struct FileBlobStore {
    dir: PathBuf,
    // Serializes writers so two temp files never race on the same target.
    write_lock: Mutex<()>,
}

impl FileBlobStore {
    /// Open (and create if needed) the store directory.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Storage(format!("creating store directory: {e}")))?;
        debug!(dir = %dir.display(), "opened file blob store");
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(URL_SAFE_NO_PAD.encode(name.as_bytes()))
    }
}

impl BlobStore for FileBlobStore {
    fn get<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(async move {
            match tokio::fs::read(self.path_for(name)).await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(Error::Storage(format!("reading blob: {e}"))),
            }
        })
    }

    fn set<'a>(&'a self, name: &'a str, blob: Vec<u8>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            write_atomic(&self.path_for(name), &blob).await
        })
    }

    fn delete<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            match tokio::fs::remove_file(self.path_for(name)).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(Error::Storage(format!("deleting blob: {e}"))),
            }
        })
    }
}

/// Write a blob atomically: temp file in the same directory, 0600 on unix,
/// then rename over the target.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Storage("blob path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".blob.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, data)
        .await
        .map_err(|e| Error::Storage(format!("writing temp blob: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Storage(format!("setting blob permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Storage(format!("renaming temp blob: {e}")))?;

    debug!(path = %path.display(), "persisted blob");
    Ok(())
}
