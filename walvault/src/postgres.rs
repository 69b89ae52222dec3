//! The backup protocol against a live PostgreSQL server.
//!
//! One connection drives the whole backup: version probe, non-exclusive
//! start/stop, control data, and the statistics the rating composer feeds
//! on. The exact SQL incantation is selected once from
//! `server_version_num`; an unrecognised or zero version fails before any
//! backup work starts.

use std::collections::HashMap;

use anyhow::Context;
use camino::Utf8PathBuf;
use tokio_postgres::types::PgLsn;
use tokio_postgres::{Client, Config, NoTls};
use tracing::{debug, info, warn};
use utils::lsn::Lsn;
use utils::wal_segment::TimeLineID;

use crate::deltamap::{RelFileNode, DEFAULT_TABLESPACE_OID};

#[derive(thiserror::Error, Debug)]
pub enum PostgresError {
    #[error("unsupported PostgreSQL version {0} (server_version_num)")]
    UnsupportedVersion(u32),

    #[error(transparent)]
    Db(#[from] tokio_postgres::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// What `pg_backup_start` told us, plus the control data the sentinel needs.
#[derive(Debug, Clone)]
pub struct BackupStartInfo {
    pub lsn: Lsn,
    pub timeline: TimeLineID,
    pub in_recovery: bool,
    pub data_dir: Utf8PathBuf,
    pub system_identifier: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct BackupStopInfo {
    pub lsn: Lsn,
    pub label_file: String,
    pub tablespace_map: Option<String>,
}

pub struct PgConnection {
    client: Client,
    config: Config,
    version_num: u32,
}

impl PgConnection {
    pub async fn connect(conninfo: &str) -> Result<PgConnection, PostgresError> {
        let config: Config = conninfo
            .parse()
            .context("invalid PostgreSQL connection string")?;
        let client = spawn_connection(&config).await?;

        let row = client
            .query_one("SELECT current_setting('server_version_num')::int", &[])
            .await?;
        let version_num = row.get::<_, i32>(0).max(0) as u32;
        validate_version(version_num)?;
        info!("connected, server_version_num={version_num}");

        Ok(PgConnection {
            client,
            config,
            version_num,
        })
    }

    pub fn version_num(&self) -> u32 {
        self.version_num
    }

    pub async fn is_in_recovery(&self) -> Result<bool, PostgresError> {
        let row = self.client.query_one("SELECT pg_is_in_recovery()", &[]).await?;
        Ok(row.get(0))
    }

    pub async fn data_directory(&self) -> Result<Utf8PathBuf, PostgresError> {
        let row = self
            .client
            .query_one("SELECT current_setting('data_directory')", &[])
            .await?;
        Ok(Utf8PathBuf::from(row.get::<_, String>(0)))
    }

    pub async fn system_identifier(&self) -> Result<Option<u64>, PostgresError> {
        if self.version_num < 90600 {
            return Ok(None);
        }
        let row = self
            .client
            .query_one("SELECT system_identifier FROM pg_control_system()", &[])
            .await?;
        Ok(Some(row.get::<_, i64>(0) as u64))
    }

    pub async fn current_timeline(&self) -> Result<TimeLineID, PostgresError> {
        let row = self
            .client
            .query_one("SELECT timeline_id FROM pg_control_checkpoint()", &[])
            .await?;
        Ok(row.get::<_, i32>(0) as u32)
    }

    /// The position the WAL verifier measures the archive against.
    pub async fn current_wal_lsn(&self) -> Result<Lsn, PostgresError> {
        let query = if self.is_in_recovery().await? {
            if self.version_num >= 100000 {
                "SELECT pg_last_wal_replay_lsn()"
            } else {
                "SELECT pg_last_xlog_replay_location()"
            }
        } else if self.version_num >= 100000 {
            "SELECT pg_current_wal_lsn()"
        } else {
            "SELECT pg_current_xlog_location()"
        };
        let row = self.client.query_one(query, &[]).await?;
        Ok(Lsn(u64::from(row.get::<_, PgLsn>(0))))
    }

    /// `pg_start_backup(label, fast := true, exclusive := false)`, in the
    /// spelling of the connected server.
    pub async fn start_backup(&self, label: &str) -> Result<BackupStartInfo, PostgresError> {
        let in_recovery = self.is_in_recovery().await?;
        let data_dir = self.data_directory().await?;
        let system_identifier = self.system_identifier().await?;

        let query = if self.version_num >= 150000 {
            "SELECT pg_backup_start($1, true)"
        } else {
            "SELECT pg_start_backup($1, true, false)"
        };
        let row = self.client.query_one(query, &[&label]).await?;
        let lsn = Lsn(u64::from(row.get::<_, PgLsn>(0)));
        let timeline = self.current_timeline().await?;
        info!("backup started at {lsn}, timeline {timeline}, in_recovery={in_recovery}");

        Ok(BackupStartInfo {
            lsn,
            timeline,
            in_recovery,
            data_dir,
            system_identifier,
        })
    }

    /// `pg_stop_backup(exclusive := false)` without waiting for the archiver;
    /// yields the backup label and tablespace map bodies.
    pub async fn stop_backup(&self) -> Result<BackupStopInfo, PostgresError> {
        let query = if self.version_num >= 150000 {
            "SELECT lsn::pg_lsn, labelfile, spcmapfile FROM pg_backup_stop(false)"
        } else if self.version_num >= 100000 {
            "SELECT lsn::pg_lsn, labelfile, spcmapfile FROM pg_stop_backup(false, false)"
        } else {
            "SELECT lsn::pg_lsn, labelfile, spcmapfile FROM pg_stop_backup(false)"
        };
        let row = self.client.query_one(query, &[]).await?;
        let lsn = Lsn(u64::from(row.get::<_, PgLsn>(0)));
        let label_file: String = row.get(1);
        let tablespace_map: Option<String> =
            row.get::<_, Option<String>>(2).filter(|s| !s.is_empty());
        info!("backup stopped at {lsn}");

        Ok(BackupStopInfo {
            lsn,
            label_file,
            tablespace_map,
        })
    }

    /// Databases a statistics connection may enter.
    pub async fn connectable_databases(&self) -> Result<Vec<String>, PostgresError> {
        let rows = self
            .client
            .query("SELECT datname FROM pg_database WHERE datallowconn", &[])
            .await?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    /// Tuple-write counters for every relation of every connectable
    /// database. Statistics only tune tar ordering, so a database that
    /// refuses the connection is logged and skipped.
    pub async fn collect_update_counts(&self) -> HashMap<RelFileNode, u64> {
        let mut counts = HashMap::new();
        let databases = match self.connectable_databases().await {
            Ok(databases) => databases,
            Err(e) => {
                warn!("failed to list databases for statistics: {e:#}");
                return counts;
            }
        };
        for database in databases {
            if let Err(e) = self.update_counts_of(&database, &mut counts).await {
                warn!("failed to collect statistics from {database}: {e:#}");
            }
        }
        debug!("collected update counts for {} relations", counts.len());
        counts
    }

    async fn update_counts_of(
        &self,
        database: &str,
        counts: &mut HashMap<RelFileNode, u64>,
    ) -> Result<(), PostgresError> {
        let mut config = self.config.clone();
        config.dbname(database);
        let client = spawn_connection(&config).await?;

        let db_row = client
            .query_one(
                "SELECT oid FROM pg_database WHERE datname = current_database()",
                &[],
            )
            .await?;
        let db_node: u32 = db_row.get(0);

        let rows = client
            .query(
                "SELECT c.reltablespace, c.relfilenode, \
                 COALESCE(s.n_tup_ins, 0) + COALESCE(s.n_tup_upd, 0) + COALESCE(s.n_tup_del, 0) \
                 FROM pg_stat_all_tables s JOIN pg_class c ON s.relid = c.oid \
                 WHERE c.relfilenode != 0",
                &[],
            )
            .await?;
        for row in rows {
            let spc_node: u32 = row.get(0);
            let rel_node: u32 = row.get(1);
            let updates: i64 = row.get(2);
            counts.insert(
                RelFileNode {
                    spc_node: if spc_node == 0 {
                        DEFAULT_TABLESPACE_OID
                    } else {
                        spc_node
                    },
                    db_node,
                    rel_node,
                },
                updates.max(0) as u64,
            );
        }
        Ok(())
    }
}

async fn spawn_connection(config: &Config) -> Result<Client, PostgresError> {
    let (client, connection) = config
        .connect(NoTls)
        .await
        .context("failed to connect to PostgreSQL")?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!("postgres connection error: {e}");
        }
    });
    Ok(client)
}

fn validate_version(version_num: u32) -> Result<(), PostgresError> {
    if version_num == 0 {
        return Err(PostgresError::UnsupportedVersion(0));
    }
    let known = matches!(version_num / 10000, 9 | 10..=17);
    if !known || version_num < 90600 {
        return Err(PostgresError::UnsupportedVersion(version_num));
    }
    Ok(())
}
