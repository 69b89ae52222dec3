//! The WAL archive: per-segment upload and fetch, plus timeline history
//! objects.
//!
//! Objects live flat under `wal_005/`, named `<object>.<ext>` where the
//! extension names the compression codec. Fetching tries every codec the
//! engine knows, because the configured codec may have changed since the
//! segment was archived; the last codec that worked is remembered and tried
//! first on the next fetch.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;
use camino::Utf8Path;
use remote_storage::{DownloadError, GenericRemoteStorage, ListingMode, RemotePath};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use utils::backoff;
use utils::wal_segment::{
    timeline_from_history_file_name, TimeLineID, XLogSegNo, XLogFromFileName,
};

use crate::compression::{Compression, ALL_COMPRESSIONS};
use crate::crypto::Crypter;
use crate::walfile::{parse_history_file, HistoryParseError, TimelineHistoryRecord};
use crate::WAL_FOLDER;

#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    #[error("object {0:?} is not present in the WAL archive under any known extension")]
    ObjectMissing(String),

    #[error(transparent)]
    History(#[from] HistoryParseError),

    #[error(transparent)]
    Download(DownloadError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The contents of `wal_005/`, split by object kind.
#[derive(Debug, Default)]
pub struct WalFolderListing {
    /// `(timeline, segno)` of every archived segment.
    pub segments: Vec<(TimeLineID, XLogSegNo)>,
    /// Timelines that have a `.history` object.
    pub history_timelines: Vec<TimeLineID>,
}

/// Handle to the `wal_005/` side of the store.
pub struct WalFolder {
    storage: GenericRemoteStorage,
    crypter: Arc<dyn Crypter>,
    // index into ALL_COMPRESSIONS of the codec that fetched last time
    last_decompressor: AtomicUsize,
}

impl WalFolder {
    pub fn new(storage: GenericRemoteStorage, crypter: Arc<dyn Crypter>) -> Self {
        Self {
            storage,
            crypter,
            last_decompressor: AtomicUsize::new(0),
        }
    }

    fn object_path(name: &str, compression: Compression) -> RemotePath {
        RemotePath::from_string(&format!(
            "{WAL_FOLDER}/{name}.{}",
            compression.extension()
        ))
        .expect("wal object paths are always relative")
    }

    /// `wal-push`: archive one WAL segment (or any sibling file, e.g. a
    /// `.history` file handed over by `archive_command`). Transient upload
    /// failures are retried with backoff; the file is re-read per attempt.
    pub async fn wal_push(
        &self,
        compression: Compression,
        segment_path: &Utf8Path,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let name = segment_path
            .file_name()
            .with_context(|| format!("invalid segment path {segment_path:?}"))?;
        let path = Self::object_path(name, compression);
        backoff::retry(
            || async {
                let file = tokio::fs::File::open(segment_path)
                    .await
                    .with_context(|| format!("failed to open {segment_path:?} for archival"))?;
                let mut pipeline = self.crypter.encrypt(compression.compress(file));
                self.storage.upload(&mut pipeline, &path, cancel).await
            },
            |_e| false,
            3,
            10,
            "uploading WAL segment",
            cancel,
        )
        .await
        .unwrap_or_else(|| Err(anyhow::anyhow!("cancelled")))
        .with_context(|| format!("failed to archive {name}"))?;
        info!("archived {name}");
        Ok(())
    }

    /// Compress, encrypt and upload an object under its archive name.
    pub async fn upload_object(
        &self,
        compression: Compression,
        name: &str,
        reader: std::pin::Pin<Box<dyn AsyncRead + Send>>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let path = Self::object_path(name, compression);
        let mut pipeline = self.crypter.encrypt(compression.compress(reader));
        self.storage
            .upload(&mut pipeline, &path, cancel)
            .await
            .with_context(|| format!("failed to upload WAL object {name}"))
    }

    /// `wal-fetch`: restore one segment to the path the server asked for.
    pub async fn wal_fetch(
        &self,
        name: &str,
        dest: &Utf8Path,
        cancel: &CancellationToken,
    ) -> Result<(), ArchiveError> {
        let bytes = self.fetch_object(name, cancel).await?;
        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("failed to create {dest:?}"))?;
        tokio::io::AsyncWriteExt::write_all(&mut file, &bytes)
            .await
            .with_context(|| format!("failed to write {dest:?}"))?;
        file.sync_all()
            .await
            .with_context(|| format!("failed to fsync {dest:?}"))?;
        debug!("fetched {name} into {dest}");
        Ok(())
    }

    /// Download and decode an archived object, trying each known codec and
    /// remembering the one that worked.
    pub async fn fetch_object(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, ArchiveError> {
        let cached = self.last_decompressor.load(Ordering::Relaxed);
        let mut order: Vec<usize> = (0..ALL_COMPRESSIONS.len()).collect();
        order.rotate_left(cached % ALL_COMPRESSIONS.len());

        for idx in order {
            let compression = ALL_COMPRESSIONS[idx];
            let path = Self::object_path(name, compression);
            let download = match self.storage.download(&path, cancel).await {
                Ok(download) => download,
                Err(DownloadError::NotFound) => continue,
                Err(other) => return Err(ArchiveError::Download(other)),
            };
            let mut decoded =
                compression.decompress(self.crypter.decrypt(Box::pin(download.download_stream)));
            let mut bytes = Vec::new();
            decoded
                .read_to_end(&mut bytes)
                .await
                .with_context(|| format!("failed to decode WAL object {path}"))?;
            self.last_decompressor.store(idx, Ordering::Relaxed);
            return Ok(bytes);
        }
        Err(ArchiveError::ObjectMissing(name.to_string()))
    }

    /// Fetch and parse the `.history` file of the given timeline. A missing
    /// history file is normal for timeline 1.
    pub async fn fetch_history(
        &self,
        timeline: TimeLineID,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<TimelineHistoryRecord>>, ArchiveError> {
        let name = utils::wal_segment::history_file_name(timeline);
        let bytes = match self.fetch_object(&name, cancel).await {
            Ok(bytes) => bytes,
            Err(ArchiveError::ObjectMissing(_)) => return Ok(None),
            Err(other) => return Err(other),
        };
        let content = String::from_utf8(bytes)
            .context("history file is not valid utf-8")?;
        Ok(Some(parse_history_file(&content)?))
    }

    /// List the archive, splitting segments from history files. Unknown
    /// objects (delta files, partials) are ignored here.
    pub async fn list(&self, cancel: &CancellationToken) -> Result<WalFolderListing, ArchiveError> {
        let prefix = RemotePath::from_string(WAL_FOLDER).expect("constant path");
        let listing = self
            .storage
            .list(Some(&prefix), ListingMode::WithDelimiter, cancel)
            .await
            .map_err(ArchiveError::Download)?;

        let mut result = WalFolderListing::default();
        for key in listing.keys {
            let Some(object) = key.object_name() else {
                continue;
            };
            let base = match object.rsplit_once('.') {
                Some((base, ext)) if Compression::from_extension(ext).is_some() => base,
                _ => object,
            };
            if let Some((tli, segno)) =
                XLogFromFileName(base, utils::wal_segment::WAL_SEGMENT_SIZE)
            {
                result.segments.push((tli, segno));
            } else if let Some(tli) = timeline_from_history_file_name(base) {
                result.history_timelines.push(tli);
            }
        }
        result.segments.sort_unstable();
        result.segments.dedup();
        result.history_timelines.sort_unstable();
        result.history_timelines.dedup();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NoCrypter;
    use remote_storage::LocalFs;

    fn wal_folder() -> (WalFolder, camino_tempfile::Utf8TempDir) {
        let dir = camino_tempfile::tempdir().unwrap();
        let storage = LocalFs::new(dir.path().to_path_buf()).unwrap();
        (
            WalFolder::new(
                GenericRemoteStorage::LocalFs(storage),
                Arc::new(NoCrypter),
            ),
            dir,
        )
    }

    #[tokio::test]
    async fn push_then_fetch_round_trips() {
        let (folder, workdir) = wal_folder();
        let cancel = CancellationToken::new();

        let seg_name = "000000010000000000000003";
        let src = workdir.path().join(seg_name);
        let payload = vec![0x5Au8; 64 * 1024];
        tokio::fs::write(&src, &payload).await.unwrap();

        folder
            .wal_push(Compression::Gzip, &src, &cancel)
            .await
            .unwrap();

        let dest = workdir.path().join("restored_segment");
        folder.wal_fetch(seg_name, &dest, &cancel).await.unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn fetch_tries_every_codec() {
        let (folder, workdir) = wal_folder();
        let cancel = CancellationToken::new();

        // archived with zstd even though the folder will first try gzip
        let seg_name = "000000010000000000000004";
        let src = workdir.path().join(seg_name);
        tokio::fs::write(&src, b"zstd segment").await.unwrap();
        folder
            .wal_push(Compression::Zstd, &src, &cancel)
            .await
            .unwrap();

        let bytes = folder.fetch_object(seg_name, &cancel).await.unwrap();
        assert_eq!(bytes, b"zstd segment");

        // cache points at zstd now
        assert_eq!(
            folder.last_decompressor.load(Ordering::Relaxed),
            ALL_COMPRESSIONS
                .iter()
                .position(|c| *c == Compression::Zstd)
                .unwrap()
        );
    }

    #[tokio::test]
    async fn missing_object_is_reported_by_name() {
        let (folder, _workdir) = wal_folder();
        let cancel = CancellationToken::new();
        match folder.fetch_object("00000001000000000000000F", &cancel).await {
            Err(ArchiveError::ObjectMissing(name)) => {
                assert_eq!(name, "00000001000000000000000F")
            }
            other => panic!("expected ObjectMissing, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn listing_splits_segments_and_history() {
        let (folder, _workdir) = wal_folder();
        let cancel = CancellationToken::new();

        for name in [
            "000000010000000000000001",
            "000000010000000000000002",
            "00000002.history",
        ] {
            folder
                .upload_object(
                    Compression::Gzip,
                    name,
                    Box::pin(std::io::Cursor::new(b"x".to_vec())),
                    &cancel,
                )
                .await
                .unwrap();
        }

        let listing = folder.list(&cancel).await.unwrap();
        assert_eq!(listing.segments, vec![(1, 1), (1, 2)]);
        assert_eq!(listing.history_timelines, vec![2]);
    }

    #[tokio::test]
    async fn history_round_trip() {
        let (folder, _workdir) = wal_folder();
        let cancel = CancellationToken::new();

        folder
            .upload_object(
                Compression::Gzip,
                "00000002.history",
                Box::pin(std::io::Cursor::new(b"1\t0/3000000\tforked\n".to_vec())),
                &cancel,
            )
            .await
            .unwrap();

        let records = folder.fetch_history(2, &cancel).await.unwrap().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].timeline, 1);

        assert!(folder.fetch_history(9, &cancel).await.unwrap().is_none());
    }
}
