//! Torrent metadata cache
//!
//! Content-addressed on-disk cache of raw `info` dictionaries, keyed by
//! hex info hash with two levels of fan-out directories.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{debug, warn};

use crate::error::FetchError;

/// On-disk cache of fetched metadata blobs
#[derive(Debug, Clone)]
pub struct TorrentCache {
    root: PathBuf,
}

impl TorrentCache {
    /// Create a cache rooted at `root`; directories are created lazily
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The cache root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the blob for an info hash: `<root>/ab/cd/abcd…`
    fn blob_path(&self, info_hash: &[u8; 20]) -> PathBuf {
        let hex = hex::encode(info_hash);
        self.root.join(&hex[0..2]).join(&hex[2..4]).join(hex)
    }

    /// Look up the cached `info` bytes for an info hash
    pub async fn get(&self, info_hash: &[u8; 20]) -> Option<Vec<u8>> {
        let path = self.blob_path(info_hash);
        match tokio::fs::read(&path).await {
            Ok(blob) => {
                debug!("Cache hit for {} at {}", hex::encode(info_hash), path.display());
                Some(blob)
            }
            Err(_) => None,
        }
    }

    /// Store the `info` bytes for an info hash
    pub async fn put(&self, info_hash: &[u8; 20], blob: &[u8]) -> Result<()> {
        let path = self.blob_path(info_hash);
        let parent = path.parent().expect("blob path has a parent");
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            FetchError::storage_error_full(
                "Failed to create cache directory",
                parent.display().to_string(),
                e.to_string(),
            )
        })?;
        tokio::fs::write(&path, blob).await.map_err(|e| {
            FetchError::storage_error_full(
                "Failed to write cache entry",
                path.display().to_string(),
                e.to_string(),
            )
        })?;
        debug!("Cached {} bytes for {}", blob.len(), hex::encode(info_hash));
        Ok(())
    }

    /// Store without surfacing errors; a failed cache write must never
    /// fail a successful fetch
    pub async fn put_quietly(&self, info_hash: &[u8; 20], blob: &[u8]) {
        if let Err(e) = self.put(info_hash, blob).await {
            warn!("Failed to cache metadata: {}", e);
        }
    }
}
