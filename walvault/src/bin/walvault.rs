//! Main entry point for the walvault executable.
//!
//! This is the thin orientation surface over the engine: parse the
//! subcommand, read the handful of environment knobs, run the matching
//! engine operation, translate the outcome into logs and an exit code.
//! Anything fatal exits 1 after logging.

use std::env::{self, VarError};
use std::sync::Arc;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use remote_storage::{GenericRemoteStorage, RemoteStorageConfig, RemoteStorageKind};
use utils::wal_segment::WAL_SEGMENT_SIZE;
use walvault::backup::catalog::{BackupCatalog, BackupSelector};
use walvault::backup::fetch::{backup_fetch, BackupFetchSettings};
use walvault::backup::push::{backup_push, BackupPushSettings};
use walvault::compression::Compression;
use walvault::crypto::{Crypter, NoCrypter};
use walvault::postgres::PgConnection;
use walvault::tarball::queue::QueueSettings;
use walvault::walarchive::WalFolder;
use walvault::walverify::{earliest_backup_segment, wal_verify, WalVerifyReport};
use walvault::Uploader;

#[derive(Parser)]
#[command(name = "walvault", about = "PostgreSQL backup and WAL archival tool")]
struct Cli {
    #[command(subcommand)]
    command: WalVaultCommand,
}

#[derive(Subcommand)]
enum WalVaultCommand {
    /// Take a base backup of the cluster and upload it.
    BackupPush {
        /// The cluster's data directory; checked against the server.
        data_dir: Utf8PathBuf,
        /// Protect the backup (and its delta ancestors) from deletion.
        #[arg(long)]
        permanent: bool,
        /// Force a full backup even when a delta base exists.
        #[arg(long)]
        full: bool,
        /// Verify page checksums while reading paged files.
        #[arg(long)]
        verify: bool,
        /// Keep every corrupt block number instead of the first few.
        #[arg(long = "store-all-corrupt")]
        store_all_corrupt: bool,
        /// Order files by update heat so cold tars restore lazily.
        #[arg(long = "rating-composer")]
        rating_composer: bool,
        /// Use the named backup as the delta base.
        #[arg(long = "delta-from-name")]
        delta_from_name: Option<String>,
        /// Use the backup with this user data as the delta base.
        #[arg(long = "delta-from-user-data")]
        delta_from_user_data: Option<String>,
        /// Attach user data (JSON or a bare string) to the backup.
        #[arg(long = "add-user-data")]
        add_user_data: Option<String>,
    },
    /// Restore a backup into an empty directory.
    BackupFetch {
        dest_dir: Utf8PathBuf,
        /// Backup name, or LATEST.
        backup_name: Option<String>,
        /// Select the backup by its user data instead of by name.
        #[arg(long = "target-user-data")]
        target_user_data: Option<String>,
    },
    /// List completed backups.
    BackupList {
        #[arg(long)]
        json: bool,
    },
    /// Flip a backup's permanence flag.
    BackupMark {
        backup_name: String,
        /// Demote instead of promote.
        #[arg(long)]
        impermanent: bool,
    },
    /// Delete backup prefixes left behind by aborted pushes.
    DeleteGarbage,
    /// Archive one WAL segment (archive_command).
    WalPush { segment_path: Utf8PathBuf },
    /// Fetch one WAL segment (restore_command).
    WalFetch {
        segment_name: String,
        dest_path: Utf8PathBuf,
    },
    /// Check archived WAL integrity against the cluster position.
    WalVerify {
        #[arg(long)]
        json: bool,
    },
    /// Show archived WAL segment ranges per timeline.
    WalShow {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

struct Env {
    storage: GenericRemoteStorage,
    compression: Compression,
    crypter: Arc<dyn Crypter>,
    upload_concurrency: usize,
    upload_disk_concurrency: usize,
    delta_max_steps: u32,
}

impl Env {
    fn from_vars() -> anyhow::Result<Env> {
        let prefix = required_var("WALVAULT_FILE_PREFIX")?;
        let root = prefix.strip_prefix("file://").unwrap_or(&prefix);
        let storage = GenericRemoteStorage::from_config(&RemoteStorageConfig {
            storage: RemoteStorageKind::LocalFs(Utf8PathBuf::from(root)),
        })?;

        let compression = match env::var("WALVAULT_COMPRESSION") {
            Ok(name) => Compression::from_config_name(&name)
                .with_context(|| format!("unknown compression {name:?}"))?,
            Err(VarError::NotPresent) => Compression::Gzip,
            Err(e) => return Err(e).context("WALVAULT_COMPRESSION"),
        };

        Ok(Env {
            storage,
            compression,
            crypter: Arc::new(NoCrypter),
            upload_concurrency: numeric_var("WALVAULT_UPLOAD_CONCURRENCY", 8)?,
            upload_disk_concurrency: numeric_var("WALVAULT_UPLOAD_DISK_CONCURRENCY", 8)?,
            delta_max_steps: numeric_var("WALVAULT_DELTA_MAX_STEPS", 0)? as u32,
        })
    }

    fn uploader(&self) -> Uploader {
        Uploader::new(
            self.storage.clone(),
            self.compression,
            Arc::clone(&self.crypter),
        )
    }

    fn wal_folder(&self) -> WalFolder {
        WalFolder::new(self.storage.clone(), Arc::clone(&self.crypter))
    }

    async fn connect(&self) -> anyhow::Result<PgConnection> {
        let conninfo = required_var("WALVAULT_PG_CONNSTRING")?;
        Ok(PgConnection::connect(&conninfo).await?)
    }
}

fn required_var(name: &str) -> anyhow::Result<String> {
    env::var(name).with_context(|| format!("{name} must be set"))
}

fn numeric_var(name: &str, default: usize) -> anyhow::Result<usize> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("{name} must be a number, got {value:?}")),
        Err(VarError::NotPresent) => Ok(default),
        Err(e) => Err(e).context(name.to_string()),
    }
}

/// `--add-user-data` accepts JSON, or a bare string for convenience.
fn parse_user_data(raw: Option<String>) -> serde_json::Value {
    match raw {
        None => serde_json::Value::Null,
        Some(raw) => serde_json::from_str(&raw)
            .unwrap_or(serde_json::Value::String(raw)),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let env = Env::from_vars()?;
    let cancel = CancellationToken::new();

    match cli.command {
        WalVaultCommand::BackupPush {
            data_dir,
            permanent,
            full,
            verify,
            store_all_corrupt,
            rating_composer,
            delta_from_name,
            delta_from_user_data,
            add_user_data,
        } => {
            anyhow::ensure!(
                delta_from_name.is_none() || delta_from_user_data.is_none(),
                "only one of --delta-from-name and --delta-from-user-data may be given"
            );
            let conn = env.connect().await?;
            let reported = conn.data_directory().await?.canonicalize_utf8()?;
            let given = data_dir
                .canonicalize_utf8()
                .with_context(|| format!("cannot resolve {data_dir}"))?;
            anyhow::ensure!(
                reported == given,
                "server data directory {reported} does not match argument {given}"
            );

            let settings = BackupPushSettings {
                permanent,
                full,
                verify_pages: verify,
                store_all_corrupt_blocks: store_all_corrupt,
                use_rating_composer: rating_composer,
                delta_from_name,
                delta_from_user_data: delta_from_user_data
                    .map(|raw| parse_user_data(Some(raw))),
                user_data: parse_user_data(add_user_data),
                max_deltas: env.delta_max_steps,
                wal_seg_size: WAL_SEGMENT_SIZE,
                queue: QueueSettings {
                    max_upload_queue: env.upload_concurrency,
                    ..QueueSettings::default()
                },
                max_upload_disk_concurrency: env.upload_disk_concurrency,
            };
            // the WAL lexical scanner is a pluggable capability; without one
            // delta backups scan every paged file by LSN
            let name = backup_push(&env.uploader(), &conn, None, settings, &cancel).await?;
            println!("{name}");
        }

        WalVaultCommand::BackupFetch {
            dest_dir,
            backup_name,
            target_user_data,
        } => {
            let selector = match (backup_name, target_user_data) {
                (Some(_), Some(_)) => {
                    anyhow::bail!("give either a backup name or --target-user-data, not both")
                }
                (Some(name), None) if name == "LATEST" => BackupSelector::Latest,
                (Some(name), None) => BackupSelector::Name(name),
                (None, Some(raw)) => BackupSelector::UserData(parse_user_data(Some(raw))),
                (None, None) => BackupSelector::Latest,
            };
            backup_fetch(
                &env.storage,
                &env.crypter,
                &selector,
                &dest_dir,
                &BackupFetchSettings {
                    download_concurrency: env.upload_concurrency,
                    ..BackupFetchSettings::default()
                },
                &cancel,
            )
            .await?;
        }

        WalVaultCommand::BackupList { json } => {
            let catalog = BackupCatalog::new(&env.storage);
            let names = catalog.list_backup_names(&cancel).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&names)?);
            } else {
                for name in names {
                    println!("{name}");
                }
            }
        }

        WalVaultCommand::BackupMark {
            backup_name,
            impermanent,
        } => {
            let catalog = BackupCatalog::new(&env.storage);
            catalog.mark(&backup_name, !impermanent, &cancel).await?;
        }

        WalVaultCommand::DeleteGarbage => {
            let catalog = BackupCatalog::new(&env.storage);
            let deleted = catalog.delete_garbage(&cancel).await?;
            info!("deleted {deleted} garbage objects");
        }

        WalVaultCommand::WalPush { segment_path } => {
            env.wal_folder()
                .wal_push(env.compression, &segment_path, &cancel)
                .await?;
        }

        WalVaultCommand::WalFetch {
            segment_name,
            dest_path,
        } => {
            env.wal_folder()
                .wal_fetch(&segment_name, &dest_path, &cancel)
                .await?;
        }

        WalVaultCommand::WalVerify { json } => {
            let conn = env.connect().await?;
            let current_lsn = conn.current_wal_lsn().await?;
            let current_timeline = conn.current_timeline().await?;
            let catalog = BackupCatalog::new(&env.storage);
            let earliest =
                earliest_backup_segment(&catalog, WAL_SEGMENT_SIZE, &cancel).await?;
            let report = wal_verify(
                &env.wal_folder(),
                current_lsn,
                current_timeline,
                earliest,
                env.upload_concurrency,
                WAL_SEGMENT_SIZE,
                &cancel,
            )
            .await?;
            print_verify_report(&report, json)?;
        }

        WalVaultCommand::WalShow { json } => {
            let timelines =
                walvault::walverify::show::wal_show(&env.wal_folder(), WAL_SEGMENT_SIZE, &cancel)
                    .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&timelines)?);
            } else {
                for timeline in timelines {
                    println!(
                        "tli {}: {} .. {} ({} segments, {} missing) {:?}",
                        timeline.id,
                        timeline.start_segment,
                        timeline.end_segment,
                        timeline.segments_count,
                        timeline.missing_segments_count,
                        timeline.status,
                    );
                }
            }
        }
    }
    Ok(())
}

fn print_verify_report(report: &WalVerifyReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!("integrity: {:?}", report.integrity.status);
    for run in &report.integrity.details {
        println!(
            "  tli {}: {} .. {} ({} segments) {:?}",
            run.timeline_id, run.start_segment, run.end_segment, run.segments_count, run.status,
        );
    }
    println!(
        "timeline: {:?} (current {}, storage {})",
        report.timeline.status,
        report.timeline.current_timeline_id,
        report.timeline.highest_storage_timeline_id,
    );
    Ok(())
}
