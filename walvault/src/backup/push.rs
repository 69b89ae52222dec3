//! The push handler: drive one backup from `pg_backup_start` to the
//! sentinel upload.
//!
//! The sentinel is written last, after the metadata and after every data
//! tar has finished uploading, so its presence is the atomic completion
//! marker. Any failure before that leaves a sentinel-less prefix that the
//! catalogue reports as garbage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use camino::Utf8PathBuf;
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use utils::lsn::Lsn;
use utils::wal_segment::TimeLineID;

use super::catalog::{BackupCatalog, BackupSelector, CatalogError};
use super::sentinel::{
    backup_name, wal_file_of_backup_name, BackupFileList, BackupSentinelDto, ExtendedMetadataDto,
    TarFileSets,
};
use crate::bundle::{Bundle, PG_CONTROL_ARCHIVE_PATH};
use crate::deltamap::{build_delta_map, DeltaMap, RelFileNode, WalPageScanner};
use crate::postgres::{PgConnection, PostgresError};
use crate::tarball::composer::rating::RatingComposer;
use crate::tarball::composer::regular::RegularComposer;
use crate::tarball::composer::TarBallComposer;
use crate::tarball::packer::{BundleFiles, TarBallFilePacker};
use crate::tarball::queue::{QueueSettings, TarBallQueue};
use crate::tarball::{new_tar_header, pg_control_tar_name};
use crate::walarchive::WalFolder;
use crate::{backup::sentinel, Uploader};

const BACKUP_LABEL_PATH: &str = "backup_label";
const TABLESPACE_MAP_PATH: &str = "tablespace_map";

#[derive(thiserror::Error, Debug)]
pub enum BackupError {
    #[error("delta parent finishes at {parent_finish} which is past the current start {current_start}")]
    BackupFromFuture {
        parent_finish: Lsn,
        current_start: Lsn,
    },

    #[error("delta parent was taken from system {parent:#x}, this cluster is {current:#x}")]
    BackupFromOtherDb { parent: u64, current: u64 },

    #[error("timeline changed from {was} to {now} during the backup")]
    TimelineChanged { was: TimeLineID, now: TimeLineID },

    #[error("data directory {0} is missing pg_control or PG_VERSION")]
    NotADataDirectory(Utf8PathBuf),

    #[error(transparent)]
    Postgres(#[from] PostgresError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Clone, Debug)]
pub struct BackupPushSettings {
    pub permanent: bool,
    /// Force a full backup even when a delta base is available.
    pub full: bool,
    pub verify_pages: bool,
    pub store_all_corrupt_blocks: bool,
    pub use_rating_composer: bool,
    pub delta_from_name: Option<String>,
    pub delta_from_user_data: Option<serde_json::Value>,
    pub user_data: serde_json::Value,
    /// Longest allowed delta chain; 0 disables deltas entirely.
    pub max_deltas: u32,
    pub wal_seg_size: usize,
    pub queue: QueueSettings,
    /// Cap on concurrently open source files.
    pub max_upload_disk_concurrency: usize,
}

impl Default for BackupPushSettings {
    fn default() -> Self {
        BackupPushSettings {
            permanent: false,
            full: false,
            verify_pages: false,
            store_all_corrupt_blocks: false,
            use_rating_composer: false,
            delta_from_name: None,
            delta_from_user_data: None,
            user_data: serde_json::Value::Null,
            max_deltas: 0,
            wal_seg_size: utils::wal_segment::WAL_SEGMENT_SIZE,
            queue: QueueSettings::default(),
            max_upload_disk_concurrency: 8,
        }
    }
}

/// The delta parent, as the catalogue knows it.
#[derive(Clone, Debug)]
pub struct ParentBackupInfo {
    pub name: String,
    pub sentinel: BackupSentinelDto,
}

/// Everything the composing phase needs to know about the backup being
/// taken. The push handler assembles it from the live database; tests
/// assemble it by hand.
pub struct BackupContext {
    pub backup_name: String,
    pub data_dir: Utf8PathBuf,
    pub timeline: TimeLineID,
    pub start_lsn: Lsn,
    pub pg_version: u32,
    pub system_identifier: Option<u64>,
    pub parent: Option<ParentBackupInfo>,
    pub delta_map: Option<Arc<DeltaMap>>,
    pub update_counts: HashMap<RelFileNode, u64>,
}

/// What composing produced, ready to become a sentinel.
pub struct ComposedBackup {
    pub files: BackupFileList,
    pub tar_file_sets: TarFileSets,
    pub tablespace_spec: Vec<sentinel::TablespaceLocation>,
    pub uncompressed_size: u64,
    pub compressed_size: u64,
}

/// The tar-producing half of a backup: everything between "backup started"
/// and "ready to stop". Kept separate from the database protocol so the
/// whole pipeline can run against a plain directory.
pub struct BackupWorkspace {
    context: BackupContext,
    settings: BackupPushSettings,
    queue: Arc<TarBallQueue>,
    packer: Arc<TarBallFilePacker>,
    files: Arc<BundleFiles>,
    uncompressed_counter: Arc<AtomicU64>,
    disk_semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    tar_file_sets: TarFileSets,
    tablespace_spec: Vec<sentinel::TablespaceLocation>,
    extension: String,
}

impl BackupWorkspace {
    pub fn new(
        uploader: &Uploader,
        context: BackupContext,
        settings: BackupPushSettings,
        cancel: CancellationToken,
    ) -> Self {
        let queue = TarBallQueue::new(
            uploader.clone(),
            sentinel::tar_partitions_prefix(&context.backup_name),
            settings.queue,
            cancel.clone(),
        );
        let files = Arc::new(BundleFiles::new());
        let uncompressed_counter = Arc::new(AtomicU64::new(0));
        let packer = Arc::new(TarBallFilePacker::new(
            context.delta_map.clone(),
            context
                .parent
                .as_ref()
                .map(|parent| parent.sentinel.start_lsn),
            settings.verify_pages,
            settings.store_all_corrupt_blocks,
            Arc::clone(&files),
            Arc::clone(&uncompressed_counter),
        ));
        let disk_semaphore = Arc::new(Semaphore::new(settings.max_upload_disk_concurrency.max(1)));
        let extension = uploader.compression.extension().to_string();
        BackupWorkspace {
            context,
            settings,
            queue,
            packer,
            files,
            uncompressed_counter,
            disk_semaphore,
            cancel,
            tar_file_sets: TarFileSets::new(),
            tablespace_spec: Vec::new(),
            extension,
        }
    }

    /// Walk the data directory, compose all data tars, and tar `pg_control`
    /// last into its dedicated archive.
    pub async fn compose(&mut self) -> Result<(), BackupError> {
        let parent_files: BackupFileList = self
            .context
            .parent
            .as_ref()
            .map(|parent| parent.sentinel.files.clone())
            .unwrap_or_default();

        let mut bundle = Bundle::new(
            self.context.data_dir.clone(),
            self.context
                .parent
                .as_ref()
                .map(|parent| parent.sentinel.start_lsn),
            parent_files.clone(),
            false,
            std::mem::take(&mut self.context.update_counts),
        );

        let mut composer: Box<dyn TarBallComposer> = if self.settings.use_rating_composer {
            Box::new(RatingComposer::new(
                Arc::clone(&self.queue),
                Arc::clone(&self.packer),
                Arc::clone(&self.disk_semaphore),
                self.context.delta_map.clone(),
                Some(Arc::new(parent_files)),
                self.settings.queue.tar_size_threshold,
                self.cancel.clone(),
            ))
        } else {
            Box::new(RegularComposer::new(
                Arc::clone(&self.queue),
                Arc::clone(&self.packer),
                self.cancel.clone(),
            ))
        };

        bundle.walk(composer.as_mut()).await?;
        self.tar_file_sets = composer.finish().await?;
        self.tablespace_spec = bundle.tablespace_spec().to_vec();

        // pg_control goes last, alone: its tar is the completion proof
        let pg_control = bundle
            .pg_control()
            .cloned()
            .ok_or_else(|| BackupError::NotADataDirectory(self.context.data_dir.clone()))?;
        let mut control_tar = self
            .queue
            .dedicated_tarball(pg_control_tar_name(&self.extension));
        let packed = self.packer.pack_file(&mut control_tar, &pg_control).await?;
        if !packed {
            return Err(BackupError::Other(anyhow::anyhow!(
                "pg_control disappeared during the backup"
            )));
        }
        let control_tar_name = control_tar.name().to_string();
        self.queue.finish_tarball(control_tar).await?;
        self.tar_file_sets
            .entry(control_tar_name)
            .or_default()
            .push(PG_CONTROL_ARCHIVE_PATH.to_string());
        Ok(())
    }

    /// The dedicated label tarball: exactly `backup_label` and
    /// `tablespace_map`, from the bodies `pg_backup_stop` returned.
    pub async fn upload_label_files(
        &mut self,
        label_file: &str,
        tablespace_map: Option<&str>,
    ) -> Result<(), BackupError> {
        let mut tarball = self.queue.new_tarball();
        let mtime = Utc::now().timestamp().max(0) as u64;
        let mut members = vec![(BACKUP_LABEL_PATH, label_file)];
        if let Some(map) = tablespace_map {
            members.push((TABLESPACE_MAP_PATH, map));
        }
        let tar_name = tarball.name().to_string();
        for (path, body) in members {
            let header = new_tar_header(path, body.len() as u64, 0o600, mtime)
                .context("failed to build label tar header")?;
            tarball
                .append(&header, body.as_bytes())
                .await
                .context("failed to tar label file")?;
            tarball.add_size(body.len() as u64);
            self.uncompressed_counter
                .fetch_add(body.len() as u64, Ordering::Relaxed);
            self.tar_file_sets
                .entry(tar_name.clone())
                .or_default()
                .push(path.to_string());
        }
        self.queue.finish_tarball(tarball).await?;
        Ok(())
    }

    /// Drain every upload and collect what the sentinel needs, handing the
    /// backup context back to the caller.
    pub async fn finish(self) -> Result<(BackupContext, ComposedBackup), BackupError> {
        self.queue.finish().await?;
        let files: BackupFileList = self
            .files
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let composed = ComposedBackup {
            files,
            tar_file_sets: self.tar_file_sets,
            tablespace_spec: self.tablespace_spec,
            uncompressed_size: self.uncompressed_counter.load(Ordering::Relaxed),
            compressed_size: self.queue.compressed_size(),
        };
        Ok((self.context, composed))
    }

    pub fn backup_name(&self) -> &str {
        &self.context.backup_name
    }
}

/// Build the sentinel from a composed backup and its context.
pub fn build_sentinel(context: &BackupContext, composed: ComposedBackup, finish_lsn: Lsn) -> BackupSentinelDto {
    let parent = context.parent.as_ref();
    BackupSentinelDto {
        start_lsn: context.start_lsn,
        finish_lsn,
        pg_version: context.pg_version,
        system_identifier: context.system_identifier,
        files: composed.files,
        tar_file_sets: composed.tar_file_sets,
        tablespace_spec: composed.tablespace_spec,
        increment_from: parent.map(|p| p.name.clone()),
        increment_from_lsn: parent.map(|p| p.sentinel.start_lsn),
        increment_full_name: parent.map(|p| {
            p.sentinel
                .increment_full_name
                .clone()
                .unwrap_or_else(|| p.name.clone())
        }),
        increment_count: parent.map(|p| p.sentinel.increment_count.unwrap_or(0) + 1),
        is_catchup: false,
        uncompressed_size: composed.uncompressed_size,
        compressed_size: composed.compressed_size,
    }
}

/// Take one backup of the cluster the connection points at.
///
/// `scanner` is the WAL lexical capability; without it, delta backups fall
/// back to deciding per page by LSN, scanning every paged file.
pub async fn backup_push(
    uploader: &Uploader,
    conn: &PgConnection,
    mut scanner: Option<&mut dyn WalPageScanner>,
    settings: BackupPushSettings,
    cancel: &CancellationToken,
) -> Result<String, BackupError> {
    let start_time = Utc::now();
    let catalog = BackupCatalog::new(&uploader.storage);

    // preconditions before touching the server
    let reported_data_dir = conn.data_directory().await?;
    let data_dir = reported_data_dir
        .canonicalize_utf8()
        .with_context(|| format!("cannot resolve data directory {reported_data_dir}"))?;
    if !data_dir.join(PG_CONTROL_ARCHIVE_PATH).is_file()
        || !data_dir.join("PG_VERSION").is_file()
    {
        return Err(BackupError::NotADataDirectory(data_dir));
    }

    let parent = select_delta_parent(&catalog, &settings, cancel).await?;

    let start = conn.start_backup("walvault").await?;
    if let Some(parent) = &parent {
        if parent.sentinel.finish_lsn > start.lsn {
            return Err(BackupError::BackupFromFuture {
                parent_finish: parent.sentinel.finish_lsn,
                current_start: start.lsn,
            });
        }
        if let (Some(parent_si), Some(current_si)) = (
            parent.sentinel.system_identifier,
            conn.system_identifier().await?,
        ) {
            if parent_si != current_si {
                return Err(BackupError::BackupFromOtherDb {
                    parent: parent_si,
                    current: current_si,
                });
            }
        }
    }

    // the delta map is best-effort: on failure every paged file is scanned
    let delta_map = match (&parent, scanner.as_deref_mut()) {
        (Some(parent), Some(scanner)) => {
            let wal_folder = WalFolder::new(uploader.storage.clone(), Arc::clone(&uploader.crypter));
            match build_delta_map(
                &wal_folder,
                scanner,
                start.timeline,
                settings.wal_seg_size,
                parent.sentinel.finish_lsn,
                start.lsn,
                cancel,
            )
            .await
            {
                Ok(map) => Some(Arc::new(map)),
                Err(e) => {
                    warn!("delta map unavailable, falling back to full scan: {e:#}");
                    None
                }
            }
        }
        _ => None,
    };

    let update_counts = if settings.use_rating_composer {
        conn.collect_update_counts().await
    } else {
        HashMap::new()
    };

    let parent_wal_file = parent
        .as_ref()
        .and_then(|p| wal_file_of_backup_name(&p.name))
        .map(str::to_owned);
    let name = backup_name(
        start.timeline,
        start.lsn,
        settings.wal_seg_size,
        parent_wal_file.as_deref(),
    );
    info!(
        "starting {} backup {name}",
        if parent.is_some() { "delta" } else { "full" }
    );

    let context = BackupContext {
        backup_name: name.clone(),
        data_dir: data_dir.clone(),
        timeline: start.timeline,
        start_lsn: start.lsn,
        pg_version: conn.version_num(),
        system_identifier: start.system_identifier,
        parent,
        delta_map,
        update_counts,
    };
    let permanent = settings.permanent;
    let user_data = settings.user_data.clone();
    let mut workspace =
        BackupWorkspace::new(uploader, context, settings, cancel.child_token());
    workspace.compose().await?;

    let stop = conn.stop_backup().await?;

    // a replica that switched timelines mid-backup produced an unusable
    // backup: abort before any completion marker exists
    if start.in_recovery {
        let timeline_now = conn.current_timeline().await?;
        if timeline_now != start.timeline {
            return Err(BackupError::TimelineChanged {
                was: start.timeline,
                now: timeline_now,
            });
        }
    }

    workspace
        .upload_label_files(&stop.label_file, stop.tablespace_map.as_deref())
        .await?;

    let (context, composed) = workspace.finish().await?;

    // a permanent delta pins its whole ancestry before it becomes visible
    if permanent {
        if let Some(parent) = &context.parent {
            catalog.mark_permanent_chain(&parent.name, cancel).await?;
        }
    }

    let metadata = ExtendedMetadataDto {
        start_time,
        finish_time: Utc::now(),
        hostname: hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default(),
        data_dir: data_dir.to_string(),
        pg_version: context.pg_version,
        start_lsn: context.start_lsn,
        finish_lsn: stop.lsn,
        is_permanent: permanent,
        user_data,
    };
    catalog.upload_metadata(&name, &metadata, cancel).await?;

    let sentinel = build_sentinel(&context, composed, stop.lsn);
    catalog.upload_sentinel(&name, &sentinel, cancel).await?;
    info!(
        "backup {name} complete, {} -> {}",
        sentinel.start_lsn, sentinel.finish_lsn
    );
    Ok(name)
}

async fn select_delta_parent(
    catalog: &BackupCatalog<'_>,
    settings: &BackupPushSettings,
    cancel: &CancellationToken,
) -> Result<Option<ParentBackupInfo>, BackupError> {
    if settings.full || settings.max_deltas == 0 {
        return Ok(None);
    }
    let explicit = settings.delta_from_name.is_some() || settings.delta_from_user_data.is_some();
    let selector = if let Some(name) = &settings.delta_from_name {
        BackupSelector::Name(name.clone())
    } else if let Some(user_data) = &settings.delta_from_user_data {
        BackupSelector::UserData(user_data.clone())
    } else {
        BackupSelector::Latest
    };

    let name = match catalog.select(&selector, cancel).await {
        Ok(name) => name,
        Err(CatalogError::NoBackupsFound) if !explicit => {
            info!("no backups found, taking a full backup");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    let sentinel = catalog.fetch_sentinel(&name, cancel).await?;
    if sentinel.increment_count.unwrap_or(0) >= settings.max_deltas {
        info!(
            "backup {name} already has {} increments, taking a full backup",
            sentinel.increment_count.unwrap_or(0)
        );
        return Ok(None);
    }
    Ok(Some(ParentBackupInfo { name, sentinel }))
}
