//! Tar extraction: the decode pipeline, the interpret table, and the
//! halving-concurrency retry loop.
//!
//! Every tar runs as two paired tasks connected by an in-process pipe: one
//! downloads, decrypts and decompresses; the other interprets tar members
//! against the destination directory. Failed tars are retried as a set with
//! halved concurrency and an exponential pause, until the set is empty or
//! two passes in a row make no progress.

use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use remote_storage::{GenericRemoteStorage, RemotePath};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::sentinel::BackupSentinelDto;
use crate::compression::Compression;
use crate::crypto::Crypter;
use crate::pagefile::{
    create_file_from_increment, is_paged_file, restore_missing_pages, write_pages_from_increment,
};

/// Pause bounds between retry passes.
const RETRY_MIN_PAUSE: Duration = Duration::from_secs(60);
const RETRY_MAX_PAUSE: Duration = Duration::from_secs(300);
/// Give up after this many consecutive passes without progress.
const MAX_PASSES_WITHOUT_PROGRESS: usize = 2;

const DECODE_PIPE_BUFFER_SIZE: usize = 64 * 1024;

/// One tar object to bring down and interpret.
#[derive(Clone, Debug)]
pub struct TarToExtract {
    pub name: String,
    pub remote_path: RemotePath,
}

/// How members of the current layer are applied to the destination.
#[derive(Clone)]
pub struct InterpretContext {
    pub dest_dir: Utf8PathBuf,
    pub sentinel: Arc<BackupSentinelDto>,
    /// The layer being unwrapped is the chain's full backup.
    pub is_base_layer: bool,
}

/// Extract the given tars with bounded concurrency, retrying failures per
/// the halving schedule. Tars never share member paths, so they are free to
/// run in parallel; each tar's interpretation is single-threaded.
pub async fn extract_all(
    storage: &GenericRemoteStorage,
    crypter: &Arc<dyn Crypter>,
    tars: Vec<TarToExtract>,
    context: &InterpretContext,
    mut concurrency: usize,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let mut pending = tars;
    let mut previous_failures = usize::MAX;
    let mut passes_without_progress = 0;
    let mut attempt: u32 = 0;

    while !pending.is_empty() {
        let failures = extraction_pass(
            storage,
            crypter,
            &pending,
            context,
            concurrency.max(1),
            cancel,
        )
        .await?;
        if failures.is_empty() {
            return Ok(());
        }

        if failures.len() >= previous_failures {
            passes_without_progress += 1;
        } else {
            passes_without_progress = 0;
        }
        if passes_without_progress >= MAX_PASSES_WITHOUT_PROGRESS {
            let names: Vec<&str> = failures.iter().map(|(tar, _)| tar.name.as_str()).collect();
            anyhow::bail!(
                "failed to extract {} tars after repeated passes: {names:?}",
                names.len()
            );
        }
        previous_failures = failures.len();

        let pause = RETRY_MIN_PAUSE
            .saturating_mul(1 << attempt.min(8))
            .min(RETRY_MAX_PAUSE);
        warn!(
            "{} tars failed, retrying with concurrency {} after {pause:?}",
            failures.len(),
            (concurrency / 2).max(1),
        );
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = cancel.cancelled() => anyhow::bail!("extraction cancelled"),
        }

        attempt += 1;
        concurrency = (concurrency / 2).max(1);
        pending = failures.into_iter().map(|(tar, _)| tar).collect();
    }
    Ok(())
}

/// One pass over the pending set. Per-tar failures are collected, not
/// propagated: the caller owns the retry policy.
async fn extraction_pass(
    storage: &GenericRemoteStorage,
    crypter: &Arc<dyn Crypter>,
    tars: &[TarToExtract],
    context: &InterpretContext,
    concurrency: usize,
    cancel: &CancellationToken,
) -> anyhow::Result<Vec<(TarToExtract, anyhow::Error)>> {
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut tasks: JoinSet<Result<(), (TarToExtract, anyhow::Error)>> = JoinSet::new();

    for tar in tars.iter().cloned() {
        let storage = storage.clone();
        let crypter = Arc::clone(crypter);
        let context = context.clone();
        let semaphore = Arc::clone(&semaphore);
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| (tar.clone(), anyhow::anyhow!("cancelled")))?;
            extract_one(&storage, &crypter, &tar, &context, &cancel)
                .await
                .map_err(|e| (tar, e))
        });
    }

    let mut failures = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined.context("extraction task panicked")? {
            Ok(()) => {}
            Err((tar, e)) => {
                warn!("failed to extract {}: {e:#}", tar.name);
                failures.push((tar, e));
            }
        }
    }
    Ok(failures)
}

/// Decode and interpret a single tar: the decode half runs in its own task,
/// feeding the interpreter through a pipe.
async fn extract_one(
    storage: &GenericRemoteStorage,
    crypter: &Arc<dyn Crypter>,
    tar: &TarToExtract,
    context: &InterpretContext,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    debug!("extracting {}", tar.name);
    let compression = tar
        .name
        .rsplit_once('.')
        .and_then(|(_, ext)| Compression::from_extension(ext))
        .with_context(|| format!("tar {} has no recognizable compression extension", tar.name))?;

    let download = storage
        .download(&tar.remote_path, cancel)
        .await
        .with_context(|| format!("failed to download {}", tar.remote_path))?;

    let (mut pipe_writer, pipe_reader) = tokio::io::duplex(DECODE_PIPE_BUFFER_SIZE);
    let crypter = Arc::clone(crypter);
    let decode = tokio::spawn(async move {
        let mut decoded =
            compression.decompress(crypter.decrypt(Box::pin(download.download_stream)));
        let result = tokio::io::copy(&mut decoded, &mut pipe_writer).await;
        let _ = pipe_writer.shutdown().await;
        result
    });

    let interpret_result = interpret_tar(pipe_reader, context).await;
    let decode_result = decode.await.context("decode task panicked")?;

    // the interpreter fails first on a broken pipe; the decode error is the
    // root cause then
    match (interpret_result, decode_result) {
        (Ok(()), Ok(_)) => Ok(()),
        (_, Err(decode_error)) => {
            Err(anyhow::Error::new(decode_error).context(format!("failed to decode {}", tar.name)))
        }
        (Err(interpret_error), Ok(_)) => {
            Err(interpret_error.context(format!("failed to interpret {}", tar.name)))
        }
    }
}

async fn interpret_tar(
    reader: tokio::io::DuplexStream,
    context: &InterpretContext,
) -> anyhow::Result<()> {
    let mut archive = tokio_tar::Archive::new(reader);
    let mut entries = archive.entries().context("failed to open tar stream")?;
    while let Some(entry) = entries.next().await {
        let entry = entry.context("failed to read tar member")?;
        interpret_entry(entry, context).await?;
    }
    Ok(())
}

/// Apply one tar member to the destination, per the layer's role.
async fn interpret_entry(
    mut entry: tokio_tar::Entry<tokio_tar::Archive<tokio::io::DuplexStream>>,
    context: &InterpretContext,
) -> anyhow::Result<()> {
    // copy everything out of the header before the entry is read mutably
    let (member_path, entry_type, mode, size, link_name) = {
        let path = entry.path().context("failed to read tar member path")?;
        let member_path = Utf8Path::from_path(&path)
            .context("non-utf8 tar member path")?
            .to_path_buf();
        let header = entry.header();
        let link_name = header
            .link_name()
            .context("failed to read link target")?
            .map(|link| {
                Utf8Path::from_path(&link)
                    .context("non-utf8 link target")
                    .map(Utf8Path::to_path_buf)
            })
            .transpose()?;
        (
            member_path,
            header.entry_type(),
            header.mode().unwrap_or(0o600) & 0o7777,
            header.size().unwrap_or(0),
            link_name,
        )
    };
    let target = context.dest_dir.join(&member_path);

    if entry_type.is_dir() {
        tokio::fs::create_dir_all(&target)
            .await
            .with_context(|| format!("failed to create directory {target}"))?;
        set_mode(&target, mode).await?;
        return Ok(());
    }

    if entry_type.is_symlink() || entry_type.is_hard_link() {
        let link_target = link_name.context("link member without target")?;
        if tokio::fs::symlink_metadata(&target).await.is_ok() {
            tokio::fs::remove_file(&target).await.ok();
        }
        if entry_type.is_symlink() {
            // tablespace symlinks point outside the destination; make sure
            // the target exists so files can restore through the link
            tokio::fs::create_dir_all(&link_target).await.ok();
            tokio::fs::symlink(&link_target, &target)
                .await
                .with_context(|| format!("failed to recreate symlink {target}"))?;
        } else {
            tokio::fs::hard_link(context.dest_dir.join(&link_target), &target)
                .await
                .with_context(|| format!("failed to recreate hardlink {target}"))?;
        }
        return Ok(());
    }

    // regular member
    let description = context.sentinel.files.get(member_path.as_str());
    let is_incremented = description.is_some_and(|d| d.is_incremented);
    let exists = tokio::fs::symlink_metadata(&target).await.is_ok();

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create parent of {target}"))?;
    }

    if !exists {
        if is_incremented {
            create_file_from_increment(&mut entry, &target)
                .await
                .with_context(|| format!("failed to restore increment {member_path}"))?;
        } else {
            write_full_file(&mut entry, &target, mode).await?;
        }
        return Ok(());
    }

    if context.sentinel.is_catchup {
        write_full_file(&mut entry, &target, mode).await?;
    } else if is_incremented {
        write_pages_from_increment(&mut entry, &target, false)
            .await
            .with_context(|| format!("failed to apply increment {member_path}"))?;
    } else if context.is_base_layer && is_paged_file(&member_path, size) {
        restore_missing_pages(&mut entry, &target)
            .await
            .with_context(|| format!("failed to backfill pages of {member_path}"))?;
    } else {
        // the copy on disk came from a newer layer and wins; drain the
        // member to keep the tar stream aligned
        tokio::io::copy(&mut entry, &mut tokio::io::sink()).await?;
    }
    Ok(())
}

async fn write_full_file(
    entry: &mut (dyn tokio::io::AsyncRead + Unpin + Send),
    target: &Utf8Path,
    mode: u32,
) -> anyhow::Result<()> {
    let mut file = tokio::fs::File::create(target)
        .await
        .with_context(|| format!("failed to create {target}"))?;
    tokio::io::copy(entry, &mut file)
        .await
        .with_context(|| format!("failed to write {target}"))?;
    file.sync_all()
        .await
        .with_context(|| format!("failed to fsync {target}"))?;
    set_mode(target, mode).await?;
    Ok(())
}

async fn set_mode(path: &Utf8Path, mode: u32) -> anyhow::Result<()> {
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .with_context(|| format!("failed to set mode on {path}"))
}

/// Whether a tar can be skipped outright: none of its members is wanted.
pub fn is_redundant_tar(members: &[String], files_to_unwrap: &HashSet<String>) -> bool {
    members.iter().all(|member| !files_to_unwrap.contains(member))
}
