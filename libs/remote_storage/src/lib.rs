//! A set of generic storage abstractions for the backup engine to use.
//!
//! In the core, the only storage implementation the engine ships is
//! [`LocalFs`]: cloud adapters (S3, GCS, Azure) are external collaborators
//! that plug into the same [`RemoteStorage`] capability.
//!
//! No other modules from this crate are used directly in the engine;
//! [`GenericRemoteStorage`] is the single entry point, so that the storage
//! kind is selected once per run and never dispatched per file.

#![deny(unsafe_code)]

mod local_fs;

use std::fmt::Debug;
use std::pin::Pin;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

pub use self::local_fs::LocalFs;

/// Path separator of the remote storage, regardless of the host OS.
pub const REMOTE_STORAGE_PREFIX_SEPARATOR: char = '/';

/// A part of the remote storage path that's used as a root for every object
/// operation: the full object name is `<storage root>/<RemotePath>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RemotePath(Utf8PathBuf);

impl std::fmt::Display for RemotePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl RemotePath {
    pub fn new(relative_path: &Utf8Path) -> anyhow::Result<Self> {
        anyhow::ensure!(
            relative_path.is_relative(),
            "Path {relative_path:?} is not relative"
        );
        Ok(Self(relative_path.to_path_buf()))
    }

    pub fn from_string(relative_path: &str) -> anyhow::Result<Self> {
        Self::new(Utf8Path::new(relative_path))
    }

    pub fn with_base(&self, base_path: &Utf8Path) -> Utf8PathBuf {
        base_path.join(&self.0)
    }

    pub fn object_name(&self) -> Option<&str> {
        self.0.file_name()
    }

    pub fn join(&self, path: impl AsRef<Utf8Path>) -> Self {
        Self(self.0.join(path))
    }

    pub fn get_path(&self) -> &Utf8PathBuf {
        &self.0
    }

    pub fn strip_prefix(&self, p: &RemotePath) -> Result<&Utf8Path, std::path::StripPrefixError> {
        self.0.strip_prefix(&p.0)
    }
}

/// We don't need callers to be able to pass arbitrary delimiters: just control
/// whether listings will use a '/' separator or not.
///
/// The WithDelimiter mode will populate `prefixes` and `keys` in the result.
/// The NoDelimiter mode will only populate `keys`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ListingMode {
    WithDelimiter,
    NoDelimiter,
}

#[derive(Default, Debug)]
pub struct Listing {
    pub prefixes: Vec<RemotePath>,
    pub keys: Vec<RemotePath>,
}

/// Every storage implementation plugged into the engine.
///
/// The only way callers have to obtain one is [`GenericRemoteStorage`], which
/// dispatches to the concrete implementation once per operation.
#[async_trait::async_trait]
pub trait RemoteStorage: Send + Sync + 'static {
    /// List objects under the given prefix. In `WithDelimiter` mode the
    /// listing stops at '/' boundaries, reporting deeper levels as
    /// `prefixes`; in `NoDelimiter` mode every object is returned in `keys`.
    async fn list(
        &self,
        prefix: Option<&RemotePath>,
        mode: ListingMode,
        cancel: &CancellationToken,
    ) -> Result<Listing, DownloadError>;

    /// Streams the bytes of `from` into an object at `to`. Object size is
    /// not known upfront: producers stream through in-process pipes.
    async fn upload(
        &self,
        from: &mut (dyn AsyncRead + Send + Unpin),
        to: &RemotePath,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;

    /// Streams the object into a reader, failing with [`DownloadError::NotFound`]
    /// if there is no object at the given path.
    async fn download(
        &self,
        from: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<Download, DownloadError>;

    async fn exists(&self, path: &RemotePath) -> anyhow::Result<bool>;

    /// Deletes all the given objects. Absent objects are not an error.
    async fn delete_objects<'a>(
        &self,
        paths: &'a [RemotePath],
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;
}

pub type DownloadStream = Pin<Box<dyn AsyncRead + Send + Sync>>;

pub struct Download {
    pub download_stream: DownloadStream,
    /// Extra key-value data, associated with the object, if any.
    pub metadata: Option<StorageMetadata>,
}

impl Debug for Download {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Download")
            .field("metadata", &self.metadata)
            .finish()
    }
}

#[derive(Debug)]
pub enum DownloadError {
    /// Validation or other error happened due to user input.
    BadInput(anyhow::Error),
    /// The file was not found in the remote storage.
    NotFound,
    /// The caller was cancelled.
    Cancelled,
    /// A cancelled or failed download stream.
    Other(anyhow::Error),
}

impl std::fmt::Display for DownloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownloadError::BadInput(e) => write!(f, "Failed to download a remote file due to user input: {e}"),
            DownloadError::NotFound => write!(f, "No file found for the remote object id given"),
            DownloadError::Cancelled => write!(f, "Cancelled, shutting down"),
            DownloadError::Other(e) => write!(f, "Failed to download a remote file: {e:?}"),
        }
    }
}

impl std::error::Error for DownloadError {}

impl DownloadError {
    pub fn is_permanent(&self) -> bool {
        use DownloadError::*;
        match self {
            BadInput(_) | NotFound | Cancelled => true,
            Other(_) => false,
        }
    }
}

/// Extra set of key-value pairs that contain arbitrary metadata about the
/// storage entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageMetadata(pub std::collections::HashMap<String, String>);

/// External backup storage configuration, enough for creating a client for
/// that storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStorageConfig {
    pub storage: RemoteStorageKind,
}

/// A kind of a remote storage to connect to, with its connection
/// configuration. Cloud adapters get their variants here; the core carries
/// the local filesystem kind only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteStorageKind {
    /// Storage based on local file system.
    /// Specify a root folder to place all stored files into.
    LocalFs(Utf8PathBuf),
}

/// Storage selected once per run; all dispatch happens here, never per file.
#[derive(Clone)]
pub enum GenericRemoteStorage {
    LocalFs(LocalFs),
}

impl GenericRemoteStorage {
    pub fn from_config(conf: &RemoteStorageConfig) -> anyhow::Result<Self> {
        Ok(match &conf.storage {
            RemoteStorageKind::LocalFs(root) => {
                tracing::info!("Using fs root '{root}' as a remote storage");
                GenericRemoteStorage::LocalFs(LocalFs::new(root.clone())?)
            }
        })
    }

    pub async fn list(
        &self,
        prefix: Option<&RemotePath>,
        mode: ListingMode,
        cancel: &CancellationToken,
    ) -> Result<Listing, DownloadError> {
        match self {
            Self::LocalFs(s) => s.list(prefix, mode, cancel).await,
        }
    }

    pub async fn upload(
        &self,
        from: &mut (dyn AsyncRead + Send + Unpin),
        to: &RemotePath,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        match self {
            Self::LocalFs(s) => s.upload(from, to, cancel).await,
        }
    }

    pub async fn download(
        &self,
        from: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<Download, DownloadError> {
        match self {
            Self::LocalFs(s) => s.download(from, cancel).await,
        }
    }

    pub async fn exists(&self, path: &RemotePath) -> anyhow::Result<bool> {
        match self {
            Self::LocalFs(s) => s.exists(path).await,
        }
    }

    pub async fn delete_objects<'a>(
        &self,
        paths: &'a [RemotePath],
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        match self {
            Self::LocalFs(s) => s.delete_objects(paths, cancel).await,
        }
    }

    /// Downloads the object and buffers it whole; small control objects only
    /// (sentinels, metadata, history files).
    pub async fn download_all(
        &self,
        from: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, DownloadError> {
        let mut download = self.download(from, cancel).await?;
        let mut bytes = Vec::new();
        tokio::io::copy(&mut download.download_stream, &mut bytes)
            .await
            .with_context(|| format!("failed to read remote object {from}"))
            .map_err(DownloadError::Other)?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_path_is_relative() {
        RemotePath::from_string("wal_005/0000000100000000000000AA.gz").unwrap();
        assert!(RemotePath::from_string("/absolute/path").is_err());
    }

    #[test]
    fn remote_path_object_name() {
        let p = RemotePath::from_string("basebackups_005/base_000000010000000000000002").unwrap();
        assert_eq!(p.object_name(), Some("base_000000010000000000000002"));
        assert_eq!(
            p.join("metadata.json").get_path().as_str(),
            "basebackups_005/base_000000010000000000000002/metadata.json"
        );
    }
}
