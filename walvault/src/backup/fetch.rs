//! The pull side: recursive delta restoration into an empty directory.
//!
//! Layers are unwrapped newest first. A delta layer materializes its
//! increments as files with zero-filled holes; the next layer down fills
//! whatever is still missing, terminating at the chain's full backup, whose
//! paged files are applied with [`restore_missing_pages`] semantics. The
//! set of paths each deeper layer must provide grows with every layer's
//! incremented and skipped files.
//!
//! [`restore_missing_pages`]: crate::pagefile::restore_missing_pages

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use camino::Utf8Path;
use remote_storage::GenericRemoteStorage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::catalog::{BackupCatalog, BackupSelector};
use super::extract::{extract_all, is_redundant_tar, InterpretContext, TarToExtract};
use super::sentinel::{tar_partitions_prefix, BackupSentinelDto};
use crate::crypto::Crypter;

#[derive(Clone, Debug)]
pub struct BackupFetchSettings {
    /// Skip tars none of whose members are needed by the current layer.
    pub skip_redundant_tars: bool,
    /// Tar pipelines running at once; halves on every retry pass.
    pub download_concurrency: usize,
}

impl Default for BackupFetchSettings {
    fn default() -> Self {
        BackupFetchSettings {
            skip_redundant_tars: true,
            download_concurrency: 8,
        }
    }
}

/// Which archive paths a layer must provide. `Everything` and an empty
/// restriction set mean the same thing, so the two spellings cannot drift
/// apart.
#[derive(Clone, Debug)]
enum UnwrapScope {
    Everything,
    Only(HashSet<String>),
}

impl UnwrapScope {
    fn from_set(set: HashSet<String>) -> Self {
        if set.is_empty() {
            UnwrapScope::Everything
        } else {
            UnwrapScope::Only(set)
        }
    }
}

/// Restore the selected backup into `dest_dir`, which must be empty.
pub async fn backup_fetch(
    storage: &GenericRemoteStorage,
    crypter: &Arc<dyn Crypter>,
    selector: &BackupSelector,
    dest_dir: &Utf8Path,
    settings: &BackupFetchSettings,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    ensure_empty_destination(dest_dir).await?;

    let catalog = BackupCatalog::new(storage);
    let mut current = catalog.select(selector, cancel).await?;
    info!("fetching backup {current} into {dest_dir}");

    let mut scope = UnwrapScope::Everything;
    loop {
        let sentinel = Arc::new(catalog.fetch_sentinel(&current, cancel).await?);
        let is_base_layer = !sentinel.is_increment();
        debug!(
            "unwrapping {current} ({} layer)",
            if is_base_layer { "base" } else { "delta" }
        );
        unwrap_layer(
            storage, crypter, &current, &sentinel, &scope, is_base_layer, dest_dir, settings,
            cancel,
        )
        .await
        .with_context(|| format!("failed to unwrap {current}"))?;

        let Some(parent) = sentinel.increment_from.clone() else {
            break;
        };
        // the deeper layer owes us what we restricted this layer to, plus
        // everything this layer only had as an increment or skipped
        let mut base_scope: HashSet<String> = match &scope {
            UnwrapScope::Everything => sentinel.files.keys().cloned().collect(),
            UnwrapScope::Only(set) => set.clone(),
        };
        base_scope.extend(
            sentinel
                .incremented_or_skipped_paths()
                .map(str::to_owned),
        );
        scope = UnwrapScope::from_set(base_scope);
        current = parent;
    }

    info!("backup fetched into {dest_dir}");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn unwrap_layer(
    storage: &GenericRemoteStorage,
    crypter: &Arc<dyn Crypter>,
    backup_name: &str,
    sentinel: &Arc<BackupSentinelDto>,
    scope: &UnwrapScope,
    is_base_layer: bool,
    dest_dir: &Utf8Path,
    settings: &BackupFetchSettings,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let partitions = tar_partitions_prefix(backup_name);
    let mut data_tars = Vec::new();
    let mut control_tar = None;

    for (tar_name, members) in &sentinel.tar_file_sets {
        let tar = TarToExtract {
            name: tar_name.clone(),
            remote_path: partitions.join(tar_name),
        };
        if tar_name.starts_with("pg_control.tar") {
            control_tar = Some(tar);
            continue;
        }
        if settings.skip_redundant_tars {
            if let UnwrapScope::Only(files_to_unwrap) = scope {
                if is_redundant_tar(members, files_to_unwrap) {
                    debug!("skipping redundant tar {tar_name}");
                    continue;
                }
            }
        }
        data_tars.push(tar);
    }

    let context = InterpretContext {
        dest_dir: dest_dir.to_path_buf(),
        sentinel: Arc::clone(sentinel),
        is_base_layer,
    };
    extract_all(
        storage,
        crypter,
        data_tars,
        &context,
        settings.download_concurrency,
        cancel,
    )
    .await?;

    // pg_control lands only after every data tar of the layer is in place
    if let Some(control_tar) = control_tar {
        extract_all(storage, crypter, vec![control_tar], &context, 1, cancel).await?;
    }
    Ok(())
}

async fn ensure_empty_destination(dest_dir: &Utf8Path) -> anyhow::Result<()> {
    match tokio::fs::read_dir(dest_dir).await {
        Ok(mut entries) => {
            if entries.next_entry().await?.is_some() {
                anyhow::bail!("destination directory {dest_dir} is not empty");
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(dest_dir)
                .await
                .with_context(|| format!("failed to create destination {dest_dir}"))
        }
        Err(e) => {
            Err(anyhow::Error::new(e).context(format!("failed to inspect destination {dest_dir}")))
        }
    }
}
