//! The rating composer: buffer the whole walk, order files by update heat,
//! and cut tars so that cold files stay together.
//!
//! Files that never change land in tars a future delta restore can skip
//! wholesale (`skip_redundant_tars`), because every path in them will be
//! carried by the delta chain's base. The cut points are therefore: the
//! expected tar size, and the first transition from a zero rating to a
//! non-zero one.

use std::sync::Arc;

use camino::Utf8Path;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ComposeFileInfo, ComposeHeaderInfo, HeaderKind, TarBallComposer};
use crate::backup::sentinel::{BackupFileList, TarFileSets};
use crate::deltamap::DeltaMap;
use crate::pagefile::predict_increment_size;
use crate::tarball::packer::TarBallFilePacker;
use crate::tarball::queue::TarBallQueue;
use crate::tarball::{new_tar_header_dir, new_tar_header_symlink};

struct RatedFile {
    info: ComposeFileInfo,
    rating: u64,
    expected_size: u64,
}

pub struct RatingComposer {
    queue: Arc<TarBallQueue>,
    packer: Arc<TarBallFilePacker>,
    disk_semaphore: Arc<Semaphore>,
    delta_map: Option<Arc<DeltaMap>>,
    /// The delta parent's file list: previous update counts feed the rating.
    base_files: Option<Arc<BackupFileList>>,
    tar_size_threshold: u64,
    files: Vec<RatedFile>,
    headers: Vec<ComposeHeaderInfo>,
    cancel: CancellationToken,
}

impl RatingComposer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<TarBallQueue>,
        packer: Arc<TarBallFilePacker>,
        disk_semaphore: Arc<Semaphore>,
        delta_map: Option<Arc<DeltaMap>>,
        base_files: Option<Arc<BackupFileList>>,
        tar_size_threshold: u64,
        cancel: CancellationToken,
    ) -> Self {
        RatingComposer {
            queue,
            packer,
            disk_semaphore,
            delta_map,
            base_files,
            tar_size_threshold,
            files: Vec::new(),
            headers: Vec::new(),
            cancel,
        }
    }

    fn rating(&self, info: &ComposeFileInfo) -> u64 {
        if !info.was_in_base {
            return info.updates_count;
        }
        let previous = self
            .base_files
            .as_ref()
            .and_then(|files| files.get(&info.archive_path))
            .map(|description| description.updates_count)
            .unwrap_or(0);
        (previous + info.updates_count) / 2
    }

    fn expected_size(&self, info: &ComposeFileInfo) -> u64 {
        if !info.is_incremented {
            return info.size;
        }
        match &self.delta_map {
            Some(map) => match map.bitmap_for(Utf8Path::new(&info.archive_path)) {
                Some(bitmap) => predict_increment_size(bitmap.len()),
                None => 0, // will be skipped at pack time
            },
            // page-LSN driven increment, size unknown until the scan
            None => info.size,
        }
    }

    /// Cut the rated, sorted file list into one-tar collections.
    fn into_collections(files: Vec<RatedFile>, threshold: u64) -> Vec<Vec<RatedFile>> {
        let mut collections = Vec::new();
        let mut current: Vec<RatedFile> = Vec::new();
        let mut current_size = 0u64;
        let mut previous_rating: Option<u64> = None;

        for file in files {
            let size_break = !current.is_empty() && current_size + file.expected_size > threshold;
            let heat_break =
                !current.is_empty() && previous_rating == Some(0) && file.rating > 0;
            if size_break || heat_break {
                collections.push(std::mem::take(&mut current));
                current_size = 0;
            }
            current_size += file.expected_size;
            previous_rating = Some(file.rating);
            current.push(file);
        }
        if !current.is_empty() {
            collections.push(current);
        }
        collections
    }
}

#[async_trait::async_trait]
impl TarBallComposer for RatingComposer {
    async fn add_file(&mut self, info: ComposeFileInfo) -> anyhow::Result<()> {
        let rating = self.rating(&info);
        let expected_size = self.expected_size(&info);
        self.files.push(RatedFile {
            info,
            rating,
            expected_size,
        });
        Ok(())
    }

    async fn add_header(&mut self, info: ComposeHeaderInfo) -> anyhow::Result<()> {
        self.headers.push(info);
        Ok(())
    }

    fn skip_file(&mut self, info: ComposeFileInfo) {
        self.packer.record_skipped(&info);
    }

    async fn finish(mut self: Box<Self>) -> anyhow::Result<TarFileSets> {
        let tar_file_sets = Arc::new(Mutex::new(TarFileSets::new()));

        // all directory, symlink and link entries go to one headers tar
        if !self.headers.is_empty() {
            let mut tarball = self.queue.deque().await?;
            for info in &self.headers {
                let mtime = info.mtime.timestamp().max(0) as u64;
                let header = match &info.kind {
                    HeaderKind::Directory => {
                        new_tar_header_dir(&info.archive_path, info.mode, mtime)?
                    }
                    HeaderKind::Symlink { target } => {
                        new_tar_header_symlink(&info.archive_path, target, mtime)?
                    }
                };
                tarball.append(&header, tokio::io::empty()).await?;
                tar_file_sets
                    .lock()
                    .entry(tarball.name().to_string())
                    .or_default()
                    .push(info.archive_path.clone());
            }
            self.queue.finish_tarball_and_replace(tarball).await?;
        }

        let mut files = std::mem::take(&mut self.files);
        files.sort_by_key(|file| file.rating); // stable: walk order within a rating
        let collections = Self::into_collections(files, self.tar_size_threshold);
        debug!("rating composer cut {} collections", collections.len());

        let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();
        for collection in collections {
            let queue = Arc::clone(&self.queue);
            let packer = Arc::clone(&self.packer);
            let semaphore = Arc::clone(&self.disk_semaphore);
            let tar_file_sets = Arc::clone(&tar_file_sets);
            let cancel = self.cancel.clone();
            tasks.spawn(async move {
                let mut tarball = queue.deque().await?;
                for file in &collection {
                    let _permit = semaphore
                        .acquire()
                        .await
                        .map_err(|_| anyhow::anyhow!("backup cancelled"))?;
                    match packer.pack_file(&mut tarball, &file.info).await {
                        Ok(true) => {
                            tar_file_sets
                                .lock()
                                .entry(tarball.name().to_string())
                                .or_default()
                                .push(file.info.archive_path.clone());
                        }
                        Ok(false) => {}
                        Err(e) => {
                            cancel.cancel();
                            return Err(e);
                        }
                    }
                }
                queue.finish_tarball_and_replace(tarball).await
            });
        }

        let mut first_error: Option<anyhow::Error> = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|join_error| {
                Err(anyhow::anyhow!("packing task panicked: {join_error}"))
            });
            if let Err(e) = result {
                if first_error.is_none() {
                    first_error = Some(e);
                } else {
                    warn!("additional packing failure: {e:#}");
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let result = std::mem::take(&mut *tar_file_sets.lock());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn rated(path: &str, rating: u64, expected_size: u64) -> RatedFile {
        RatedFile {
            info: ComposeFileInfo {
                archive_path: path.to_string(),
                full_path: camino::Utf8PathBuf::from(path),
                mtime: Utc::now(),
                size: expected_size,
                mode: 0o600,
                was_in_base: false,
                is_incremented: false,
                updates_count: rating,
            },
            rating,
            expected_size,
        }
    }

    #[test]
    fn collections_break_on_expected_size() {
        let files = vec![
            rated("a", 0, 600),
            rated("b", 0, 600),
            rated("c", 0, 600),
        ];
        let collections = RatingComposer::into_collections(files, 1000);
        assert_eq!(
            collections.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![1, 1, 1],
            "600 + 600 overflows a 1000 threshold"
        );
    }

    #[test]
    fn collections_break_between_cold_and_hot() {
        let files = vec![
            rated("cold_1", 0, 10),
            rated("cold_2", 0, 10),
            rated("hot_1", 5, 10),
            rated("hot_2", 9, 10),
        ];
        let collections = RatingComposer::into_collections(files, 1_000_000);
        assert_eq!(collections.len(), 2);
        assert_eq!(
            collections[0].iter().map(|f| f.info.archive_path.as_str()).collect::<Vec<_>>(),
            vec!["cold_1", "cold_2"]
        );
        assert_eq!(
            collections[1].iter().map(|f| f.info.archive_path.as_str()).collect::<Vec<_>>(),
            vec!["hot_1", "hot_2"]
        );
    }

    #[test]
    fn oversized_file_still_lands_somewhere() {
        let files = vec![rated("huge", 0, 5000), rated("small", 0, 10)];
        let collections = RatingComposer::into_collections(files, 1000);
        assert_eq!(collections.len(), 2);
        assert_eq!(collections[0][0].info.archive_path, "huge");
    }
}
