//! The streaming composer: each incoming file is packed into the currently
//! checked-out tar writer, in the order the walker admitted it.
//!
//! Packing is sequential. The ready queue may rotate writers between
//! files, but within any one tar the members appear exactly in admission
//! order, and tar names are produced in creation order. Reordering is the
//! rating composer's job.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{ComposeFileInfo, ComposeHeaderInfo, HeaderKind, TarBallComposer};
use crate::backup::sentinel::TarFileSets;
use crate::tarball::packer::TarBallFilePacker;
use crate::tarball::queue::TarBallQueue;
use crate::tarball::{new_tar_header_dir, new_tar_header_symlink};

pub struct RegularComposer {
    queue: Arc<TarBallQueue>,
    packer: Arc<TarBallFilePacker>,
    tar_file_sets: TarFileSets,
    cancel: CancellationToken,
}

impl RegularComposer {
    pub fn new(
        queue: Arc<TarBallQueue>,
        packer: Arc<TarBallFilePacker>,
        cancel: CancellationToken,
    ) -> Self {
        RegularComposer {
            queue,
            packer,
            tar_file_sets: TarFileSets::new(),
            cancel,
        }
    }
}

#[async_trait::async_trait]
impl TarBallComposer for RegularComposer {
    async fn add_file(&mut self, info: ComposeFileInfo) -> anyhow::Result<()> {
        let mut tarball = self.queue.deque().await?;
        match self.packer.pack_file(&mut tarball, &info).await {
            Ok(packed) => {
                if packed {
                    self.tar_file_sets
                        .entry(tarball.name().to_string())
                        .or_default()
                        .push(info.archive_path);
                }
                self.queue.check_size_and_enqueue_back(tarball).await
            }
            Err(e) => {
                // the tar writer may hold a half-written entry; take the
                // whole backup down rather than reuse it
                self.cancel.cancel();
                Err(e)
            }
        }
    }

    async fn add_header(&mut self, info: ComposeHeaderInfo) -> anyhow::Result<()> {
        let mtime = info.mtime.timestamp().max(0) as u64;
        let header = match &info.kind {
            HeaderKind::Directory => new_tar_header_dir(&info.archive_path, info.mode, mtime)?,
            HeaderKind::Symlink { target } => {
                new_tar_header_symlink(&info.archive_path, target, mtime)?
            }
        };
        let mut tarball = self.queue.deque().await?;
        tarball.append(&header, tokio::io::empty()).await?;
        self.tar_file_sets
            .entry(tarball.name().to_string())
            .or_default()
            .push(info.archive_path);
        self.queue.enqueue_back(tarball).await;
        Ok(())
    }

    fn skip_file(&mut self, info: ComposeFileInfo) {
        self.packer.record_skipped(&info);
    }

    async fn finish(mut self: Box<Self>) -> anyhow::Result<TarFileSets> {
        Ok(std::mem::take(&mut self.tar_file_sets))
    }
}
