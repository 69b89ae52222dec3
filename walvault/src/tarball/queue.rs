//! The bounded pool of in-flight tar writers.
//!
//! At most `parallel_tarballs` writers exist at any time; each is either
//! checked out by exactly one producer, waiting on the ready queue, or
//! closed and uploading. Closed tars enter the upload queue, and whoever
//! pushes one past `max_upload_queue` stays behind to await the oldest
//! upload first: that is the backpressure between tar production and the
//! store.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use remote_storage::RemotePath;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{part_name, TarBall};
use crate::Uploader;

#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    /// Live tar writers.
    pub parallel_tarballs: usize,
    /// Closed tars allowed to upload concurrently before producers block.
    pub max_upload_queue: usize,
    /// Payload size at which a checked-out tar is rotated.
    pub tar_size_threshold: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            parallel_tarballs: 4,
            max_upload_queue: 4,
            tar_size_threshold: 1024 * 1024 * 1024,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum TarQueueError {
    #[error("tar-ball queue is cancelled")]
    Cancelled,
}

pub struct TarBallQueue {
    uploader: Uploader,
    partition_prefix: RemotePath,
    settings: QueueSettings,
    cancel: CancellationToken,

    ready_tx: mpsc::Sender<TarBall>,
    ready_rx: tokio::sync::Mutex<mpsc::Receiver<TarBall>>,
    uploads: tokio::sync::Mutex<VecDeque<(String, JoinHandle<anyhow::Result<()>>)>>,

    next_part_no: AtomicU32,
    compressed_counter: Arc<AtomicU64>,
}

impl TarBallQueue {
    pub fn new(
        uploader: Uploader,
        partition_prefix: RemotePath,
        settings: QueueSettings,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        assert!(settings.parallel_tarballs > 0, "need at least one tar writer");
        let (ready_tx, ready_rx) = mpsc::channel(settings.parallel_tarballs);
        let queue = Arc::new(TarBallQueue {
            uploader,
            partition_prefix,
            settings,
            cancel,
            ready_tx,
            ready_rx: tokio::sync::Mutex::new(ready_rx),
            uploads: tokio::sync::Mutex::new(VecDeque::new()),
            next_part_no: AtomicU32::new(1),
            compressed_counter: Arc::new(AtomicU64::new(0)),
        });
        for _ in 0..settings.parallel_tarballs {
            let tarball = queue.new_tarball();
            queue
                .ready_tx
                .try_send(tarball)
                .expect("fresh channel has capacity for every writer");
        }
        queue
    }

    /// Total compressed bytes that have left through this queue.
    pub fn compressed_size(&self) -> u64 {
        self.compressed_counter.load(Ordering::Relaxed)
    }

    /// A fresh numbered part writer. Queue-internal rotation uses this, and
    /// so does the push handler for the label tarball, which must contain
    /// exactly `backup_label` and `tablespace_map`.
    pub fn new_tarball(&self) -> TarBall {
        let part_no = self.next_part_no.fetch_add(1, Ordering::Relaxed);
        TarBall::new(
            part_name(part_no, self.uploader.compression.extension()),
            self.partition_prefix.clone(),
            self.uploader.clone(),
            self.cancel.clone(),
            Arc::clone(&self.compressed_counter),
        )
    }

    /// A tar writer outside the ready queue, e.g. for the dedicated
    /// pg_control or label archives. Finish it with
    /// [`TarBallQueue::finish_tarball`].
    pub fn dedicated_tarball(&self, name: String) -> TarBall {
        TarBall::new(
            name,
            self.partition_prefix.clone(),
            self.uploader.clone(),
            self.cancel.clone(),
            Arc::clone(&self.compressed_counter),
        )
    }

    /// Check out a tar writer; blocks when all writers are busy. Fails once
    /// the backup is cancelled so producers unwind without deadlocking
    /// uploaders.
    pub async fn deque(&self) -> Result<TarBall, TarQueueError> {
        let mut rx = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TarQueueError::Cancelled),
            guard = self.ready_rx.lock() => guard,
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TarQueueError::Cancelled),
            tarball = rx.recv() => tarball.ok_or(TarQueueError::Cancelled),
        }
    }

    /// Return a checked-out writer for other producers to reuse.
    pub async fn enqueue_back(&self, tarball: TarBall) {
        // capacity equals the number of writers in circulation, so this
        // cannot block for long and cannot fail while the queue is alive
        if self.ready_tx.send(tarball).await.is_err() {
            warn!("tar-ball queue dropped while returning a writer");
        }
    }

    /// The post-append step of every producer: rotate the writer if it has
    /// outgrown the threshold, otherwise hand it back as-is.
    pub async fn check_size_and_enqueue_back(&self, tarball: TarBall) -> anyhow::Result<()> {
        if tarball.size() < self.settings.tar_size_threshold {
            self.enqueue_back(tarball).await;
            return Ok(());
        }
        info!(
            "tar {} reached {} bytes, rotating",
            tarball.name(),
            tarball.size()
        );
        self.finish_tarball(tarball).await?;
        self.enqueue_back(self.new_tarball()).await;
        Ok(())
    }

    /// Close the tar and put a fresh writer into circulation in its place.
    /// Used by composers that map one tar per file collection.
    pub async fn finish_tarball_and_replace(&self, tarball: TarBall) -> anyhow::Result<()> {
        self.finish_tarball(tarball).await?;
        self.enqueue_back(self.new_tarball()).await;
        Ok(())
    }

    /// Close a tar and queue its upload, draining the upload queue while it
    /// is over capacity. The first failed upload cancels the whole backup.
    pub async fn finish_tarball(&self, tarball: TarBall) -> anyhow::Result<()> {
        let closed = match tarball.close().await {
            Ok(closed) => closed,
            Err(e) => {
                self.cancel.cancel();
                return Err(e.context("failed to close tar archive"));
            }
        };
        let Some((name, upload)) = closed else {
            return Ok(()); // empty tar, no object
        };

        let mut uploads = self.uploads.lock().await;
        uploads.push_back((name, upload));
        while uploads.len() > self.settings.max_upload_queue {
            let (name, upload) = uploads.pop_front().expect("nonempty over capacity");
            if let Err(e) = Self::await_upload(name, upload).await {
                self.cancel.cancel();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Collect every remaining writer, close the non-empty ones and drain
    /// all uploads. Call after all producers are done.
    pub async fn finish(&self) -> anyhow::Result<()> {
        {
            let mut rx = self.ready_rx.lock().await;
            while let Ok(tarball) = rx.try_recv() {
                self.finish_tarball(tarball).await?;
            }
        }

        let mut first_error = None;
        let mut uploads = self.uploads.lock().await;
        while let Some((name, upload)) = uploads.pop_front() {
            if let Err(e) = Self::await_upload(name, upload).await {
                self.cancel.cancel();
                // first error wins, the rest are logged
                if first_error.is_none() {
                    first_error = Some(e);
                } else {
                    warn!("additional upload failure: {e:#}");
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn await_upload(name: String, upload: JoinHandle<anyhow::Result<()>>) -> anyhow::Result<()> {
        upload
            .await
            .with_context(|| format!("upload task for {name} panicked"))?
            .with_context(|| format!("failed to upload {name}"))
    }
}
