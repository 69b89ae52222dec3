//! The backup data model: sentinels, extended metadata, and naming.
//!
//! A backup is complete exactly when its sentinel object exists; the
//! sentinel is written last, after the metadata and after every data tar has
//! finished uploading. Everything a restore needs to interpret the tars is
//! in the sentinel; everything an operator needs to reason about the backup
//! is in the metadata.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use remote_storage::RemotePath;
use serde::{Deserialize, Serialize};
use utils::lsn::Lsn;
use utils::wal_segment::{TimeLineID, XLogFileName};

use crate::BASE_BACKUPS_FOLDER;

pub const SENTINEL_SUFFIX: &str = "_backup_stop_sentinel.json";
pub const METADATA_FILE_NAME: &str = "metadata.json";
pub const TAR_PARTITIONS_FOLDER: &str = "tar_partitions";

/// Which archive paths ended up in which tar member.
pub type TarFileSets = HashMap<String, Vec<String>>;

/// Per-file facts recorded while composing, keyed by archive-relative path.
pub type BackupFileList = HashMap<String, BackupFileDescription>;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BackupFileDescription {
    #[serde(rename = "MTime")]
    pub mtime: DateTime<Utc>,

    /// Content identical to the delta parent's copy; not archived.
    #[serde(rename = "IsSkipped")]
    pub is_skipped: bool,

    /// The tar member for this path is an increment, not a full copy.
    #[serde(rename = "IsIncremented")]
    pub is_incremented: bool,

    #[serde(rename = "UpdatesCount")]
    pub updates_count: u64,

    /// Blocks that failed page checksum verification, if it ran.
    #[serde(rename = "CorruptBlocks", skip_serializing_if = "Option::is_none")]
    pub corrupt_blocks: Option<Vec<u32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TablespaceLocation {
    #[serde(rename = "Symlink")]
    pub symlink: String,
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "Oid")]
    pub oid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSentinelDto {
    #[serde(rename = "BackupStartLSN")]
    pub start_lsn: Lsn,

    #[serde(rename = "BackupFinishLSN")]
    pub finish_lsn: Lsn,

    #[serde(rename = "PgVersion")]
    pub pg_version: u32,

    #[serde(rename = "SystemIdentifier", skip_serializing_if = "Option::is_none")]
    pub system_identifier: Option<u64>,

    #[serde(rename = "Files")]
    pub files: BackupFileList,

    #[serde(rename = "TarFileSets")]
    pub tar_file_sets: TarFileSets,

    #[serde(rename = "TablespaceSpec", default, skip_serializing_if = "Vec::is_empty")]
    pub tablespace_spec: Vec<TablespaceLocation>,

    #[serde(rename = "IncrementFrom", skip_serializing_if = "Option::is_none")]
    pub increment_from: Option<String>,

    #[serde(rename = "IncrementFromLSN", skip_serializing_if = "Option::is_none")]
    pub increment_from_lsn: Option<Lsn>,

    #[serde(rename = "IncrementFullName", skip_serializing_if = "Option::is_none")]
    pub increment_full_name: Option<String>,

    #[serde(rename = "IncrementCount", skip_serializing_if = "Option::is_none")]
    pub increment_count: Option<u32>,

    /// A catchup backup overwrites existing files on restore instead of
    /// building alongside a base.
    #[serde(rename = "IsCatchup", default, skip_serializing_if = "std::ops::Not::not")]
    pub is_catchup: bool,

    #[serde(rename = "UncompressedSize")]
    pub uncompressed_size: u64,

    #[serde(rename = "CompressedSize")]
    pub compressed_size: u64,
}

impl BackupSentinelDto {
    pub fn is_increment(&self) -> bool {
        self.increment_from.is_some()
    }

    /// Paths the delta parent must still provide: everything this layer
    /// archived as an increment or skipped outright.
    pub fn incremented_or_skipped_paths(&self) -> impl Iterator<Item = &str> {
        self.files.iter().filter_map(|(path, description)| {
            (description.is_incremented || description.is_skipped).then_some(path.as_str())
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtendedMetadataDto {
    #[serde(rename = "StartTime")]
    pub start_time: DateTime<Utc>,

    #[serde(rename = "FinishTime")]
    pub finish_time: DateTime<Utc>,

    #[serde(rename = "Hostname")]
    pub hostname: String,

    #[serde(rename = "DataDir")]
    pub data_dir: String,

    #[serde(rename = "PgVersion")]
    pub pg_version: u32,

    #[serde(rename = "StartLsn")]
    pub start_lsn: Lsn,

    #[serde(rename = "FinishLsn")]
    pub finish_lsn: Lsn,

    #[serde(rename = "IsPermanent")]
    pub is_permanent: bool,

    #[serde(rename = "UserData", default, skip_serializing_if = "serde_json::Value::is_null")]
    pub user_data: serde_json::Value,
}

/// `base_<WALfile>`, with `_D_<parentWALfile>` appended for deltas.
pub fn backup_name(
    timeline: TimeLineID,
    start_lsn: Lsn,
    wal_seg_size: usize,
    delta_parent_wal_file: Option<&str>,
) -> String {
    let wal_file = XLogFileName(
        timeline,
        start_lsn.segment_number(wal_seg_size),
        wal_seg_size,
    );
    match delta_parent_wal_file {
        Some(parent) => format!("base_{wal_file}_D_{parent}"),
        None => format!("base_{wal_file}"),
    }
}

/// The `<WALfile>` part of a backup name, used to name the children of a
/// delta parent.
pub fn wal_file_of_backup_name(backup_name: &str) -> Option<&str> {
    let rest = backup_name.strip_prefix("base_")?;
    match rest.split_once("_D_") {
        Some((own, _parent)) => Some(own),
        None => Some(rest),
    }
}

pub fn sentinel_path(backup_name: &str) -> RemotePath {
    RemotePath::from_string(&format!(
        "{BASE_BACKUPS_FOLDER}/{backup_name}{SENTINEL_SUFFIX}"
    ))
    .expect("backup paths are always relative")
}

pub fn metadata_path(backup_name: &str) -> RemotePath {
    RemotePath::from_string(&format!(
        "{BASE_BACKUPS_FOLDER}/{backup_name}/{METADATA_FILE_NAME}"
    ))
    .expect("backup paths are always relative")
}

pub fn tar_partitions_prefix(backup_name: &str) -> RemotePath {
    RemotePath::from_string(&format!(
        "{BASE_BACKUPS_FOLDER}/{backup_name}/{TAR_PARTITIONS_FOLDER}"
    ))
    .expect("backup paths are always relative")
}

/// Backup name from a sentinel object name, if it is one.
pub fn backup_name_from_sentinel_object(object_name: &str) -> Option<&str> {
    object_name.strip_suffix(SENTINEL_SUFFIX)
}
