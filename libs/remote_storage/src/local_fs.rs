//! Local filesystem "remote" storage.
//!
//! Multiple engine instances can use the same storage root, if they are
//! given different prefixes inside it. Objects are written to a temporary
//! sibling first and renamed into place, so a reader never observes a
//! half-written object.

use std::io::ErrorKind;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::fs;
use tokio::io::{self, AsyncRead, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    Download, DownloadError, Listing, ListingMode, RemotePath, RemoteStorage,
};

const TEMP_FILE_SUFFIX: &str = "___temp";

#[derive(Debug, Clone)]
pub struct LocalFs {
    storage_root: Utf8PathBuf,
}

impl LocalFs {
    /// Attempts to create local FS storage, along with its root directory.
    pub fn new(mut storage_root: Utf8PathBuf) -> anyhow::Result<Self> {
        if !storage_root.exists() {
            std::fs::create_dir_all(&storage_root).with_context(|| {
                format!("Failed to create all directories in the given root path {storage_root:?}")
            })?;
        }
        if !storage_root.is_absolute() {
            storage_root = storage_root.canonicalize_utf8().with_context(|| {
                format!("Failed to represent path {storage_root:?} as an absolute path")
            })?;
        }

        Ok(Self { storage_root })
    }

    fn target_file_path(&self, path: &RemotePath) -> Utf8PathBuf {
        path.with_base(&self.storage_root)
    }
}

#[async_trait::async_trait]
impl RemoteStorage for LocalFs {
    async fn list(
        &self,
        prefix: Option<&RemotePath>,
        mode: ListingMode,
        cancel: &CancellationToken,
    ) -> Result<Listing, DownloadError> {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let mut result = Listing::default();

        let full_prefix = match prefix {
            Some(prefix) => self.target_file_path(prefix),
            None => self.storage_root.clone(),
        };
        if fs::metadata(&full_prefix).await.is_err() {
            // absent prefix, empty listing
            return Ok(result);
        }

        let mut pending = vec![full_prefix.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir)
                .await
                .with_context(|| format!("Failed to list directory {dir:?}"))
                .map_err(DownloadError::Other)?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .context("Failed to list directory entries")
                .map_err(DownloadError::Other)?
            {
                let file_type = entry
                    .file_type()
                    .await
                    .context("Failed to read directory entry type")
                    .map_err(DownloadError::Other)?;
                let entry_path =
                    Utf8PathBuf::from_path_buf(entry.path()).map_err(|unparsable_path| {
                        DownloadError::Other(anyhow::anyhow!("non-utf8 path: {unparsable_path:?}"))
                    })?;
                if entry_path
                    .file_name()
                    .is_some_and(|name| name.ends_with(TEMP_FILE_SUFFIX))
                {
                    continue;
                }
                let relative = entry_path
                    .strip_prefix(&self.storage_root)
                    .context("Failed to strip storage root prefix")
                    .map_err(DownloadError::Other)?;
                if file_type.is_dir() {
                    match mode {
                        ListingMode::WithDelimiter => result
                            .prefixes
                            .push(RemotePath(relative.to_path_buf())),
                        ListingMode::NoDelimiter => pending.push(entry_path.clone()),
                    }
                } else {
                    result.keys.push(RemotePath(relative.to_path_buf()));
                }
            }
        }

        // Local directory listing order is arbitrary; object stores return
        // keys in lexicographic order, callers rely on determinism.
        result.keys.sort();
        result.prefixes.sort();
        Ok(result)
    }

    async fn upload(
        &self,
        from: &mut (dyn AsyncRead + Send + Unpin),
        to: &RemotePath,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let target_file_path = self.target_file_path(to);
        create_target_directory(&target_file_path).await?;

        // We need this dance with sort of durable rename (without fsyncs)
        // to prevent partial uploads. This was really hit when file storage
        // is used and upload is cancelled: partial file reads on the
        // download side are a worse failure mode.
        let temp_file_path =
            path_with_suffix_extension(&target_file_path, TEMP_FILE_SUFFIX);
        let mut destination = io::BufWriter::new(
            fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_file_path)
                .await
                .with_context(|| {
                    format!("Failed to open target fs destination at {target_file_path:?}")
                })?,
        );

        let copied = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            res = io::copy(from, &mut destination) => Some(res),
        };
        let Some(copied) = copied else {
            drop(destination);
            if let Err(e) = fs::remove_file(&temp_file_path).await {
                if e.kind() != ErrorKind::NotFound {
                    warn!("failed to remove temp file {temp_file_path}: {e}");
                }
            }
            anyhow::bail!("upload cancelled");
        };
        copied.with_context(|| {
            format!("Failed to upload file to the local storage at {temp_file_path:?}")
        })?;

        destination.flush().await.with_context(|| {
            format!("Failed to upload (flush) file to the local storage at {temp_file_path:?}")
        })?;
        destination
            .into_inner()
            .sync_all()
            .await
            .with_context(|| format!("Failed to fsync uploaded file {temp_file_path:?}"))?;

        fs::rename(&temp_file_path, &target_file_path)
            .await
            .with_context(|| {
                format!("Failed to rename temp file {temp_file_path:?} to {target_file_path:?}")
            })?;

        Ok(())
    }

    async fn download(
        &self,
        from: &RemotePath,
        cancel: &CancellationToken,
    ) -> Result<Download, DownloadError> {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        let target_path = self.target_file_path(from);

        match fs::OpenOptions::new().read(true).open(&target_path).await {
            Ok(source) => Ok(Download {
                download_stream: Box::pin(io::BufReader::new(source)),
                metadata: None,
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(DownloadError::NotFound),
            Err(e) => Err(DownloadError::Other(anyhow::Error::new(e).context(
                format!("Failed to open source file {target_path:?} to use in the download"),
            ))),
        }
    }

    async fn exists(&self, path: &RemotePath) -> anyhow::Result<bool> {
        match fs::metadata(self.target_file_path(path)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_objects<'a>(
        &self,
        paths: &'a [RemotePath],
        _cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        for path in paths {
            let file_path = self.target_file_path(path);
            match fs::remove_file(&file_path).await {
                Ok(()) => (),
                // The file doesn't exist. This shouldn't yield an error to
                // mirror S3's behaviour.
                Err(e) if e.kind() == ErrorKind::NotFound => (),
                Err(e) => {
                    return Err(anyhow::anyhow!(e)
                        .context(format!("Failed to delete file {file_path:?}")))
                }
            }
        }
        Ok(())
    }
}

/// Adds the given suffix to the path extension: `a/b.json` + `temp` becomes
/// `a/b.json.temp`.
fn path_with_suffix_extension(path: &Utf8Path, suffix: &str) -> Utf8PathBuf {
    match path.extension() {
        Some(ext) => path.with_extension(format!("{ext}.{suffix}")),
        None => path.with_extension(suffix),
    }
}

async fn create_target_directory(target_file_path: &Utf8Path) -> anyhow::Result<()> {
    let target_dir = match target_file_path.parent() {
        Some(parent_dir) => parent_dir,
        None => anyhow::bail!("File path '{target_file_path}' has no parent directory"),
    };
    if !target_dir.exists() {
        fs::create_dir_all(target_dir).await?;
    }
    Ok(())
}

#[cfg(test)]
mod fs_tests {
    use super::*;

    use std::io::Cursor;

    async fn read_and_check_metadata(
        storage: &LocalFs,
        remote_storage_path: &RemotePath,
    ) -> anyhow::Result<String> {
        let cancel = CancellationToken::new();
        let mut download = storage
            .download(remote_storage_path, &cancel)
            .await
            .map_err(|e| anyhow::anyhow!("Download failed: {e}"))?;
        let mut contents = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut download.download_stream, &mut contents)
            .await
            .context("Failed to read remote file contents into string")?;
        Ok(contents)
    }

    fn create_storage() -> anyhow::Result<(LocalFs, camino_tempfile::Utf8TempDir)> {
        let workdir = camino_tempfile::tempdir()?;
        let storage = LocalFs::new(workdir.path().to_path_buf())?;
        Ok((storage, workdir))
    }

    async fn upload_string(
        storage: &LocalFs,
        path: &str,
        contents: &str,
    ) -> anyhow::Result<RemotePath> {
        let path = RemotePath::from_string(path)?;
        let cancel = CancellationToken::new();
        let mut reader = Cursor::new(contents.to_string().into_bytes());
        storage.upload(&mut reader, &path, &cancel).await?;
        Ok(path)
    }

    #[tokio::test]
    async fn upload_file() -> anyhow::Result<()> {
        let (storage, _workdir) = create_storage()?;

        let target_path = upload_string(&storage, "folder/subfolder/upload_1", "upload 1").await?;
        assert_eq!(
            read_and_check_metadata(&storage, &target_path).await?,
            "upload 1"
        );

        assert!(storage.exists(&target_path).await?);
        assert!(!storage
            .exists(&RemotePath::from_string("folder/subfolder/upload_2")?)
            .await?);
        Ok(())
    }

    #[tokio::test]
    async fn download_is_not_found_for_missing_object() -> anyhow::Result<()> {
        let (storage, _workdir) = create_storage()?;
        let cancel = CancellationToken::new();
        match storage
            .download(&RemotePath::from_string("missing")?, &cancel)
            .await
        {
            Err(DownloadError::NotFound) => (),
            other => panic!("expected NotFound, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn list_with_delimiter_splits_prefixes_and_keys() -> anyhow::Result<()> {
        let (storage, _workdir) = create_storage()?;
        let cancel = CancellationToken::new();

        upload_string(&storage, "basebackups_005/base_AA_backup_stop_sentinel.json", "{}").await?;
        upload_string(&storage, "basebackups_005/base_AA/metadata.json", "{}").await?;
        upload_string(&storage, "basebackups_005/base_AA/tar_partitions/part_001.tar.gz", "x")
            .await?;

        let listing = storage
            .list(
                Some(&RemotePath::from_string("basebackups_005")?),
                ListingMode::WithDelimiter,
                &cancel,
            )
            .await?;
        assert_eq!(
            listing
                .keys
                .iter()
                .map(|k| k.get_path().as_str().to_owned())
                .collect::<Vec<_>>(),
            vec!["basebackups_005/base_AA_backup_stop_sentinel.json"]
        );
        assert_eq!(
            listing
                .prefixes
                .iter()
                .map(|k| k.get_path().as_str().to_owned())
                .collect::<Vec<_>>(),
            vec!["basebackups_005/base_AA"]
        );

        let all = storage
            .list(
                Some(&RemotePath::from_string("basebackups_005")?),
                ListingMode::NoDelimiter,
                &cancel,
            )
            .await?;
        assert_eq!(all.keys.len(), 3);
        assert!(all.prefixes.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn delete_objects_tolerates_missing_files() -> anyhow::Result<()> {
        let (storage, _workdir) = create_storage()?;
        let cancel = CancellationToken::new();
        let present = upload_string(&storage, "wal_005/seg1.gz", "data").await?;
        let missing = RemotePath::from_string("wal_005/seg2.gz")?;
        storage
            .delete_objects(&[present.clone(), missing], &cancel)
            .await?;
        assert!(!storage.exists(&present).await?);
        Ok(())
    }

    #[test]
    fn test_path_with_suffix_extension() {
        let p = Utf8PathBuf::from("sample.json");
        assert_eq!(
            path_with_suffix_extension(&p, "temp").to_string(),
            "sample.json.temp"
        );
        let p = Utf8PathBuf::from("part_001.tar.gz");
        assert_eq!(
            path_with_suffix_extension(&p, "temp").to_string(),
            "part_001.tar.gz.temp"
        );
    }
}
