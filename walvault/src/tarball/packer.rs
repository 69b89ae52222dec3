//! Packing a single walked file into a tar archive.
//!
//! Both composers funnel every file through [`TarBallFilePacker::pack_file`]:
//! it decides between full and incremental archival, applies the delta
//! bitmap, verifies page checksums on the fly through a read-tee, and
//! records the per-file facts the sentinel needs.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::Context as _;
use camino::Utf8Path;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tracing::{debug, warn};
use utils::lsn::Lsn;

use super::composer::ComposeFileInfo;
use super::{new_tar_header, TarBall};
use crate::backup::sentinel::BackupFileDescription;
use crate::deltamap::{parse_relation_path, DeltaMap};
use crate::pagefile::{
    self, is_paged_file, page_checksum_ok, PageFileError, BLCKSZ, RELSEG_BLOCKS,
};

/// How many corrupt block numbers a sentinel keeps per file unless the
/// operator asked for all of them.
const CORRUPT_BLOCKS_LIMIT: usize = 10;

/// Everything the walked-files map accumulates during one backup.
pub type BundleFiles = DashMap<String, BackupFileDescription>;

pub struct TarBallFilePacker {
    delta_map: Option<Arc<DeltaMap>>,
    increment_from_lsn: Option<Lsn>,
    verify_pages: bool,
    store_all_corrupt_blocks: bool,
    files: Arc<BundleFiles>,
    uncompressed_counter: Arc<AtomicU64>,
}

impl TarBallFilePacker {
    pub fn new(
        delta_map: Option<Arc<DeltaMap>>,
        increment_from_lsn: Option<Lsn>,
        verify_pages: bool,
        store_all_corrupt_blocks: bool,
        files: Arc<BundleFiles>,
        uncompressed_counter: Arc<AtomicU64>,
    ) -> Self {
        TarBallFilePacker {
            delta_map,
            increment_from_lsn,
            verify_pages,
            store_all_corrupt_blocks,
            files,
            uncompressed_counter,
        }
    }

    pub fn files(&self) -> &Arc<BundleFiles> {
        &self.files
    }

    /// Pack one file into the given tar. Returns `false` when the file was
    /// not put into the tar (deleted mid-walk, or skipped for having no
    /// blocks in the delta window).
    pub async fn pack_file(
        &self,
        tarball: &mut TarBall,
        info: &ComposeFileInfo,
    ) -> anyhow::Result<bool> {
        if info.is_incremented {
            let bitmap = match &self.delta_map {
                Some(map) => match map.bitmap_for(Utf8Path::new(&info.archive_path)) {
                    Some(bitmap) => Some(bitmap),
                    None => {
                        // written after the delta window; the parent backup
                        // carries the content
                        self.record(info, |d| d.is_skipped = true);
                        debug!("skipped {}: no delta bitmap", info.archive_path);
                        return Ok(false);
                    }
                },
                None => None,
            };
            let base_lsn = self
                .increment_from_lsn
                .context("incremented file without an increment base LSN")?;

            match pagefile::read_increment(
                &info.full_path,
                info.size,
                base_lsn,
                bitmap.as_ref(),
            )
            .await
            {
                Ok((reader, increment_size)) => {
                    self.append_regular(tarball, info, reader, increment_size, true)
                        .await?;
                    return Ok(true);
                }
                Err(PageFileError::InvalidBlock { path, block_no }) => {
                    warn!("invalid block {block_no} in {path}, archiving the whole file");
                }
                Err(PageFileError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("{} disappeared mid-walk", info.archive_path);
                    return Ok(false);
                }
                Err(other) => {
                    return Err(anyhow::Error::new(other)
                        .context(format!("failed to read increment of {}", info.archive_path)))
                }
            }
        }

        let file = match tokio::fs::File::open(&info.full_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} disappeared mid-walk", info.archive_path);
                return Ok(false);
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("failed to open {}", info.full_path)))
            }
        };
        // the tar header is already written with the stat size; a file that
        // grew mid-walk is cut at that size, a shrunk one fails the append
        let reader = Box::pin(file.take(info.size));
        self.append_regular(tarball, info, reader, info.size, false)
            .await?;
        Ok(true)
    }

    async fn append_regular(
        &self,
        tarball: &mut TarBall,
        info: &ComposeFileInfo,
        reader: Pin<Box<dyn AsyncRead + Send>>,
        stored_size: u64,
        is_incremented: bool,
    ) -> anyhow::Result<()> {
        let header = new_tar_header(
            &info.archive_path,
            stored_size,
            info.mode,
            unix_mtime(info.mtime),
        )?;

        let verifier = (self.verify_pages
            && is_paged_file(Utf8Path::new(&info.archive_path), info.size))
        .then(|| {
            let base_block_no = parse_relation_path(Utf8Path::new(&info.archive_path))
                .map(|(_, segment_no)| segment_no * RELSEG_BLOCKS)
                .unwrap_or(0);
            Arc::new(Mutex::new(PageChecksumObserver::new(
                base_block_no,
                is_incremented,
            )))
        });

        match &verifier {
            Some(observer) => {
                let observer = Arc::clone(observer);
                let tee = ObservingReader::new(reader, move |bytes: &[u8]| {
                    observer.lock().observe(bytes);
                });
                tarball
                    .append(&header, tee)
                    .await
                    .with_context(|| format!("failed to tar {}", info.archive_path))?;
            }
            None => {
                tarball
                    .append(&header, reader)
                    .await
                    .with_context(|| format!("failed to tar {}", info.archive_path))?;
            }
        }

        tarball.add_size(stored_size);
        self.uncompressed_counter
            .fetch_add(stored_size, Ordering::Relaxed);

        let corrupt = verifier.map(|observer| {
            let mut corrupt = std::mem::take(&mut observer.lock().corrupt);
            if !self.store_all_corrupt_blocks && corrupt.len() > CORRUPT_BLOCKS_LIMIT {
                corrupt.truncate(CORRUPT_BLOCKS_LIMIT);
            }
            corrupt
        });
        if let Some(corrupt) = &corrupt {
            if !corrupt.is_empty() {
                warn!(
                    "{}: {} corrupt blocks, first {:?}",
                    info.archive_path,
                    corrupt.len(),
                    corrupt.first()
                );
            }
        }

        self.record(info, |d| {
            d.is_incremented = is_incremented;
            d.corrupt_blocks = corrupt.filter(|c| !c.is_empty());
        });
        Ok(())
    }

    pub fn record_skipped(&self, info: &ComposeFileInfo) {
        self.record(info, |d| d.is_skipped = true);
    }

    fn record(&self, info: &ComposeFileInfo, apply: impl FnOnce(&mut BackupFileDescription)) {
        let mut description = BackupFileDescription {
            mtime: info.mtime,
            updates_count: info.updates_count,
            ..Default::default()
        };
        apply(&mut description);
        self.files.insert(info.archive_path.clone(), description);
    }
}

fn unix_mtime(mtime: DateTime<Utc>) -> u64 {
    mtime.timestamp().max(0) as u64
}

/// Calls the observer with every chunk that passes through.
struct ObservingReader<R, F> {
    inner: R,
    observe: F,
}

impl<R, F> ObservingReader<R, F> {
    fn new(inner: R, observe: F) -> Self {
        Self { inner, observe }
    }
}

impl<R, F> AsyncRead for ObservingReader<R, F>
where
    R: AsyncRead + Unpin,
    F: FnMut(&[u8]) + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &result {
            let read = &buf.filled()[before..];
            if !read.is_empty() {
                (this.observe)(read);
            }
        }
        result
    }
}

/// Recomputes stored page checksums from the bytes of a streamed tar member,
/// understanding both the full-file and the increment layout.
struct PageChecksumObserver {
    base_block_no: u32,
    phase: Phase,
    pending: Vec<u8>,
    block_list: Vec<u32>,
    pages_seen: usize,
    corrupt: Vec<u32>,
}

enum Phase {
    /// Full copy: pages back to back, block numbers implicit.
    FullPages { next_block: u32 },
    /// Increment prelude: magic + size + count.
    IncrementHeader,
    /// Increment block-number list, then its pages.
    IncrementBlockList { count: usize },
    IncrementPages,
    /// Malformed enough that verification stands down.
    Opaque,
}

impl PageChecksumObserver {
    fn new(base_block_no: u32, is_incremented: bool) -> Self {
        PageChecksumObserver {
            base_block_no,
            phase: if is_incremented {
                Phase::IncrementHeader
            } else {
                Phase::FullPages { next_block: 0 }
            },
            pending: Vec::new(),
            block_list: Vec::new(),
            pages_seen: 0,
            corrupt: Vec::new(),
        }
    }

    fn observe(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        loop {
            match &mut self.phase {
                Phase::FullPages { next_block } => {
                    if self.pending.len() < BLCKSZ {
                        return;
                    }
                    let block_no = *next_block;
                    let page: Vec<u8> = self.pending.drain(..BLCKSZ).collect();
                    if !page_checksum_ok(&page, self.base_block_no + block_no) {
                        self.corrupt.push(block_no);
                    }
                    *next_block += 1;
                }
                Phase::IncrementHeader => {
                    if self.pending.len() < 16 {
                        return;
                    }
                    let count =
                        u32::from_le_bytes(self.pending[12..16].try_into().unwrap()) as usize;
                    self.pending.drain(..16);
                    self.phase = Phase::IncrementBlockList { count };
                }
                Phase::IncrementBlockList { count } => {
                    let needed = *count * 4;
                    if self.pending.len() < needed {
                        return;
                    }
                    let raw: Vec<u8> = self.pending.drain(..needed).collect();
                    self.block_list = raw
                        .chunks_exact(4)
                        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
                        .collect();
                    self.phase = Phase::IncrementPages;
                }
                Phase::IncrementPages => {
                    if self.pending.len() < BLCKSZ {
                        return;
                    }
                    let Some(&block_no) = self.block_list.get(self.pages_seen) else {
                        self.phase = Phase::Opaque;
                        continue;
                    };
                    let page: Vec<u8> = self.pending.drain(..BLCKSZ).collect();
                    if !page_checksum_ok(&page, self.base_block_no + block_no) {
                        self.corrupt.push(block_no);
                    }
                    self.pages_seen += 1;
                }
                Phase::Opaque => {
                    self.pending.clear();
                    return;
                }
            }
        }
    }
}
