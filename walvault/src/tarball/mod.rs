//! Tar production: bounded parallel tar writers streaming straight into
//! storage uploads.
//!
//! A [`TarBall`] is one `part_<nnn>.tar.<ext>` object in the making. Its tar
//! writer feeds an in-process pipe whose other end is compressed, encrypted
//! and uploaded by a spawned task, so tar bytes never touch the local disk.
//! The [`queue::TarBallQueue`] hands tar writers to producers and applies
//! backpressure when too many finished tars are still uploading.

pub mod composer;
pub mod packer;
pub mod queue;

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use camino::Utf8Path;
use remote_storage::RemotePath;
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio::task::JoinHandle;
use tokio_tar::{Builder, EntryType, Header};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::Uploader;

/// Buffer of the in-process pipe between a tar writer and its uploader.
const TAR_PIPE_BUFFER_SIZE: usize = 64 * 1024;

/// Data tar member name for the given 1-based part number.
pub fn part_name(part_no: u32, extension: &str) -> String {
    format!("part_{part_no:03}.tar.{extension}")
}

/// The dedicated single-file tar that proves a backup is complete.
pub fn pg_control_tar_name(extension: &str) -> String {
    format!("pg_control.tar.{extension}")
}

/// One tar archive being produced. Opened lazily: a tar that never receives
/// an entry never creates an object.
pub struct TarBall {
    name: String,
    partition_prefix: RemotePath,
    uploader: Uploader,
    cancel: CancellationToken,
    compressed_counter: Arc<AtomicU64>,
    size: u64,
    open: Option<OpenTar>,
}

struct OpenTar {
    builder: Builder<tokio::io::DuplexStream>,
    upload: JoinHandle<anyhow::Result<()>>,
}

impl TarBall {
    pub fn new(
        name: String,
        partition_prefix: RemotePath,
        uploader: Uploader,
        cancel: CancellationToken,
        compressed_counter: Arc<AtomicU64>,
    ) -> Self {
        TarBall {
            name,
            partition_prefix,
            uploader,
            cancel,
            compressed_counter,
            size: 0,
            open: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Payload bytes admitted so far; the rotation threshold is checked
    /// against this, not against the compressed object size.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn add_size(&mut self, bytes: u64) {
        self.size += bytes;
    }

    fn open_tar(&mut self) -> &mut OpenTar {
        if self.open.is_none() {
            let (write_half, read_half) = tokio::io::duplex(TAR_PIPE_BUFFER_SIZE);
            let target = self.partition_prefix.join(&self.name);
            let uploader = self.uploader.clone();
            let cancel = self.cancel.clone();
            let counter = Arc::clone(&self.compressed_counter);
            let name = self.name.clone();
            let upload = tokio::spawn(async move {
                let compressed = uploader.compression.compress(read_half);
                let counted = CountingReader::new(compressed, counter);
                let mut pipeline = uploader.crypter.encrypt(Box::pin(counted));
                uploader
                    .storage
                    .upload(&mut pipeline, &target, &cancel)
                    .await?;
                debug!("uploaded {name}");
                Ok(())
            });
            self.open = Some(OpenTar {
                builder: Builder::new_non_terminated(write_half),
                upload,
            });
        }
        self.open.as_mut().expect("just opened")
    }

    /// Append one member. The header must carry the exact entry size; the
    /// reader is read to its end.
    pub async fn append<R>(&mut self, header: &Header, data: R) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.open_tar().builder.append(header, data).await
    }

    /// Close the archive and hand over the upload to await. `None` means the
    /// tar never opened and there is nothing to upload.
    pub async fn close(self) -> anyhow::Result<Option<(String, JoinHandle<anyhow::Result<()>>)>> {
        let Some(open) = self.open else {
            return Ok(None);
        };
        let mut pipe = open.builder.into_inner().await?;
        // write the tar trailer by hand: the builder was created
        // non-terminated so that close failures surface here, once
        pipe.write_all(&[0u8; 1024]).await?;
        pipe.shutdown().await?;
        drop(pipe);
        Ok(Some((self.name, open.upload)))
    }
}

/// Build a regular-file member header the way the walker saw the file.
pub fn new_tar_header(path: &str, size: u64, mode: u32, mtime: u64) -> std::io::Result<Header> {
    let mut header = Header::new_gnu();
    header.set_size(size);
    header.set_path(path)?;
    header.set_mode(mode);
    header.set_mtime(mtime);
    header.set_cksum();
    Ok(header)
}

pub fn new_tar_header_dir(path: &str, mode: u32, mtime: u64) -> std::io::Result<Header> {
    let mut header = Header::new_gnu();
    header.set_size(0);
    header.set_path(path)?;
    header.set_mode(mode);
    header.set_entry_type(EntryType::dir());
    header.set_mtime(mtime);
    header.set_cksum();
    Ok(header)
}

pub fn new_tar_header_symlink(
    path: &str,
    target: &Utf8Path,
    mtime: u64,
) -> std::io::Result<Header> {
    let mut header = Header::new_gnu();
    header.set_size(0);
    header.set_path(path)?;
    header.set_link_name(target.as_str())?;
    header.set_entry_type(EntryType::symlink());
    header.set_mode(0o777);
    header.set_mtime(mtime);
    header.set_cksum();
    Ok(header)
}

/// Passes bytes through while adding them up; measures compressed object
/// sizes without buffering anything.
pub struct CountingReader<R> {
    inner: R,
    counter: Arc<AtomicU64>,
}

impl<R> CountingReader<R> {
    pub fn new(inner: R, counter: Arc<AtomicU64>) -> Self {
        Self { inner, counter }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let read = buf.filled().len() - before;
            self.counter.fetch_add(read as u64, Ordering::Relaxed);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn member_names() {
        assert_eq!(part_name(1, "gz"), "part_001.tar.gz");
        assert_eq!(part_name(120, "zst"), "part_120.tar.zst");
        assert_eq!(pg_control_tar_name("gz"), "pg_control.tar.gz");
    }

    #[tokio::test]
    async fn counting_reader_counts_every_byte() {
        let data = vec![7u8; 100_000];
        let counter = Arc::new(AtomicU64::new(0));
        let mut reader = CountingReader::new(data.as_slice(), Arc::clone(&counter));
        let mut sink = Vec::new();
        reader.read_to_end(&mut sink).await.unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 100_000);
        assert_eq!(sink.len(), 100_000);
    }
}
