//! Walking the data directory: what gets archived, what gets skipped, and
//! what each file is.
//!
//! The walker emits every entry to a composer. Directories that the server
//! rebuilds on its own (`pg_wal`, `pg_stat_tmp`, ...) are emitted as bare
//! headers and not descended into; a handful of runtime files are dropped
//! outright. `pg_control` is held aside: it is tarred last into a dedicated
//! archive, and its presence on the restore side is the proof that the
//! backup was complete.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use utils::lsn::Lsn;
use walkdir::WalkDir;

use crate::backup::sentinel::{BackupFileList, TablespaceLocation};
use crate::deltamap::{parse_relation_path, RelFileNode};
use crate::pagefile::is_paged_file;
use crate::tarball::composer::{
    ComposeFileInfo, ComposeHeaderInfo, HeaderKind, TarBallComposer,
};

/// Directories emitted as headers but never walked into.
pub const EXCLUDED_DIRS: [&str; 12] = [
    "log",
    "pg_log",
    "pg_xlog",
    "pg_wal",
    "pgsql_tmp",
    "pg_dynshmem",
    "pg_notify",
    "pg_replslot",
    "pg_serial",
    "pg_stat_tmp",
    "pg_snapshots",
    "pg_subtrans",
];

/// Files dropped from the archive entirely.
pub const EXCLUDED_FILES: [&str; 4] = [
    "postmaster.pid",
    "postmaster.opts",
    "postgresql.auto.conf.tmp",
    "recovery.conf",
];

pub const PG_CONTROL_ARCHIVE_PATH: &str = "global/pg_control";
const TABLESPACES_DIR: &str = "pg_tblspc";

/// One backup's walk over a data directory.
pub struct Bundle {
    data_dir: Utf8PathBuf,
    /// Set when producing a delta: page increments are taken against it.
    increment_from_lsn: Option<Lsn>,
    /// The delta parent's file list, for `was_in_base` and the
    /// unchanged-mtime skip.
    increment_from_files: BackupFileList,
    /// Treat paged files as incremented even when not in the base
    /// (catchup-style backups).
    force_incremental: bool,
    /// Tuple-write counters per relation, from the statistics collector.
    update_counts: HashMap<RelFileNode, u64>,

    tablespace_spec: Vec<TablespaceLocation>,
    pg_control: Option<ComposeFileInfo>,
}

impl Bundle {
    pub fn new(
        data_dir: Utf8PathBuf,
        increment_from_lsn: Option<Lsn>,
        increment_from_files: BackupFileList,
        force_incremental: bool,
        update_counts: HashMap<RelFileNode, u64>,
    ) -> Self {
        Bundle {
            data_dir,
            increment_from_lsn,
            increment_from_files,
            force_incremental,
            update_counts,
            tablespace_spec: Vec::new(),
            pg_control: None,
        }
    }

    pub fn tablespace_spec(&self) -> &[TablespaceLocation] {
        &self.tablespace_spec
    }

    /// `pg_control`, once the walk has seen it.
    pub fn pg_control(&self) -> Option<&ComposeFileInfo> {
        self.pg_control.as_ref()
    }

    /// Walk the data directory depth-first and feed every entry to the
    /// composer. Tablespace symlinks are resolved and their targets walked
    /// as if they lived under `pg_tblspc/<oid>`.
    pub async fn walk(&mut self, composer: &mut dyn TarBallComposer) -> anyhow::Result<()> {
        info!("walking data directory {}", self.data_dir);
        let entries = self.collect_entries()?;
        let total = entries.len();
        for entry in entries {
            match entry {
                WalkedEntry::Header(info) => composer.add_header(info).await?,
                WalkedEntry::File(info) => {
                    if self.should_skip_unchanged(&info) {
                        debug!("skipping unchanged {}", info.archive_path);
                        composer.skip_file(info);
                    } else {
                        composer.add_file(info).await?;
                    }
                }
            }
        }
        info!("walked {total} entries");
        Ok(())
    }

    fn should_skip_unchanged(&self, info: &ComposeFileInfo) -> bool {
        if self.increment_from_lsn.is_none() || !info.was_in_base {
            return false;
        }
        self.increment_from_files
            .get(&info.archive_path)
            .is_some_and(|previous| previous.mtime == info.mtime)
    }

    fn collect_entries(&mut self) -> anyhow::Result<Vec<WalkedEntry>> {
        let data_dir = self.data_dir.clone();
        let mut entries = Vec::new();
        self.walk_tree(&data_dir, Utf8Path::new(""), &mut entries)?;
        Ok(entries)
    }

    /// Walk `root`, archiving entries under the `prefix` namespace.
    fn walk_tree(
        &mut self,
        root: &Utf8Path,
        prefix: &Utf8Path,
        entries: &mut Vec<WalkedEntry>,
    ) -> anyhow::Result<()> {
        let mut walker = WalkDir::new(root)
            .sort_by_file_name()
            .follow_links(false)
            .into_iter();

        while let Some(entry) = walker.next() {
            let entry = entry.with_context(|| format!("failed to walk {root}"))?;
            if entry.depth() == 0 {
                continue;
            }
            let path = Utf8Path::from_path(entry.path())
                .with_context(|| format!("non-utf8 path {:?}", entry.path()))?;
            let relative = path.strip_prefix(root).expect("walked under root");
            let archive_path = prefix.join(relative);
            let name = entry.file_name().to_string_lossy();
            let file_type = entry.file_type();

            if file_type.is_dir() {
                let header = self.header_info(&archive_path, &entry, HeaderKind::Directory)?;
                entries.push(WalkedEntry::Header(header));
                if EXCLUDED_DIRS.contains(&name.as_ref()) {
                    walker.skip_current_dir();
                }
                continue;
            }

            if file_type.is_symlink() {
                if prefix.as_str().is_empty() && archive_path.parent()
                    == Some(Utf8Path::new(TABLESPACES_DIR))
                {
                    self.walk_tablespace(path, &archive_path, entries)?;
                } else {
                    let target = path
                        .read_link_utf8()
                        .with_context(|| format!("failed to read symlink {path}"))?;
                    let header = self.header_info(
                        &archive_path,
                        &entry,
                        HeaderKind::Symlink { target },
                    )?;
                    entries.push(WalkedEntry::Header(header));
                }
                continue;
            }

            if EXCLUDED_FILES.contains(&name.as_ref()) {
                debug!("excluded {archive_path}");
                continue;
            }

            let info = self.file_info(&archive_path, path, &entry)?;
            if info.archive_path == PG_CONTROL_ARCHIVE_PATH {
                self.pg_control = Some(info);
                continue;
            }
            entries.push(WalkedEntry::File(info));
        }
        Ok(())
    }

    /// Resolve one `pg_tblspc/<oid>` symlink, record it, and walk its
    /// target under the symlink's namespace.
    fn walk_tablespace(
        &mut self,
        symlink_path: &Utf8Path,
        archive_path: &Utf8Path,
        entries: &mut Vec<WalkedEntry>,
    ) -> anyhow::Result<()> {
        let target = symlink_path
            .read_link_utf8()
            .with_context(|| format!("failed to read tablespace symlink {symlink_path}"))?;
        let symlink_name = archive_path.file_name().expect("tablespace entries are named");
        let oid = match symlink_name.parse::<u32>() {
            Ok(oid) => oid,
            Err(_) => {
                warn!("ignoring non-oid entry {archive_path} under {TABLESPACES_DIR}");
                return Ok(());
            }
        };
        info!("tablespace {oid} at {target}");
        self.tablespace_spec.push(TablespaceLocation {
            symlink: archive_path.to_string(),
            path: target.to_string(),
            oid,
        });

        let metadata = std::fs::symlink_metadata(symlink_path)?;
        entries.push(WalkedEntry::Header(ComposeHeaderInfo {
            archive_path: archive_path.to_string(),
            kind: HeaderKind::Symlink {
                target: target.clone(),
            },
            mode: metadata.permissions().mode() & 0o7777,
            mtime: mtime_of(&metadata),
        }));

        self.walk_tree(&target, archive_path, entries)
    }

    fn header_info(
        &self,
        archive_path: &Utf8Path,
        entry: &walkdir::DirEntry,
        kind: HeaderKind,
    ) -> anyhow::Result<ComposeHeaderInfo> {
        let metadata = entry
            .metadata()
            .with_context(|| format!("failed to stat {archive_path}"))?;
        Ok(ComposeHeaderInfo {
            archive_path: archive_path.to_string(),
            kind,
            mode: metadata.permissions().mode() & 0o7777,
            mtime: mtime_of(&metadata),
        })
    }

    fn file_info(
        &self,
        archive_path: &Utf8Path,
        full_path: &Utf8Path,
        entry: &walkdir::DirEntry,
    ) -> anyhow::Result<ComposeFileInfo> {
        let metadata = entry
            .metadata()
            .with_context(|| format!("failed to stat {archive_path}"))?;
        let size = metadata.len();
        let was_in_base = self.increment_from_files.contains_key(archive_path.as_str());
        let is_incremented = self.increment_from_lsn.is_some()
            && is_paged_file(archive_path, size)
            && (was_in_base || self.force_incremental);
        let updates_count = parse_relation_path(archive_path)
            .and_then(|(relation, _segno)| self.update_counts.get(&relation).copied())
            .unwrap_or(0);

        Ok(ComposeFileInfo {
            archive_path: archive_path.to_string(),
            full_path: full_path.to_path_buf(),
            mtime: mtime_of(&metadata),
            size,
            mode: metadata.permissions().mode() & 0o7777,
            was_in_base,
            is_incremented,
            updates_count,
        })
    }
}

enum WalkedEntry {
    Header(ComposeHeaderInfo),
    File(ComposeFileInfo),
}

fn mtime_of(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::sentinel::{BackupFileDescription, TarFileSets};
    use crate::pagefile::BLCKSZ;

    /// Records the walk instead of producing tars.
    #[derive(Default)]
    struct CollectingComposer {
        files: Vec<ComposeFileInfo>,
        headers: Vec<ComposeHeaderInfo>,
        skipped: Vec<ComposeFileInfo>,
    }

    #[async_trait::async_trait]
    impl TarBallComposer for CollectingComposer {
        async fn add_file(&mut self, info: ComposeFileInfo) -> anyhow::Result<()> {
            self.files.push(info);
            Ok(())
        }

        async fn add_header(&mut self, info: ComposeHeaderInfo) -> anyhow::Result<()> {
            self.headers.push(info);
            Ok(())
        }

        fn skip_file(&mut self, info: ComposeFileInfo) {
            self.skipped.push(info);
        }

        async fn finish(self: Box<Self>) -> anyhow::Result<TarFileSets> {
            Ok(TarFileSets::new())
        }
    }

    fn build_datadir(dir: &Utf8Path) {
        std::fs::create_dir_all(dir.join("base/5")).unwrap();
        std::fs::create_dir_all(dir.join("global")).unwrap();
        std::fs::create_dir_all(dir.join("pg_wal/archive_status")).unwrap();
        std::fs::create_dir_all(dir.join("pg_notify")).unwrap();
        std::fs::create_dir_all(dir.join("pg_tblspc")).unwrap();

        std::fs::write(dir.join("PG_VERSION"), "15\n").unwrap();
        std::fs::write(dir.join("postmaster.pid"), "1234\n").unwrap();
        std::fs::write(dir.join("base/5/16384"), vec![0u8; 2 * BLCKSZ]).unwrap();
        std::fs::write(dir.join("base/5/16384_fsm"), b"fsm").unwrap();
        std::fs::write(dir.join("global/pg_control"), vec![1u8; 512]).unwrap();
        std::fs::write(dir.join("pg_wal/000000010000000000000001"), b"wal").unwrap();
    }

    async fn walk_collect(bundle: &mut Bundle) -> CollectingComposer {
        let mut composer = CollectingComposer::default();
        bundle.walk(&mut composer).await.unwrap();
        composer
    }

    #[tokio::test]
    async fn exclusions_and_pg_control() {
        let dir = camino_tempfile::tempdir().unwrap();
        build_datadir(dir.path());

        let mut bundle = Bundle::new(
            dir.path().to_path_buf(),
            None,
            BackupFileList::new(),
            false,
            HashMap::new(),
        );
        let composer = walk_collect(&mut bundle).await;

        let file_paths: Vec<&str> =
            composer.files.iter().map(|f| f.archive_path.as_str()).collect();
        let header_paths: Vec<&str> =
            composer.headers.iter().map(|h| h.archive_path.as_str()).collect();

        // pg_wal gets a header but nothing under it is archived
        assert!(header_paths.contains(&"pg_wal"));
        assert!(!file_paths.iter().any(|p| p.starts_with("pg_wal/")));
        assert!(!header_paths.contains(&"pg_wal/archive_status"));
        assert!(header_paths.contains(&"pg_notify"));

        // excluded runtime files are dropped
        assert!(!file_paths.contains(&"postmaster.pid"));

        // pg_control held aside
        assert!(!file_paths.contains(&PG_CONTROL_ARCHIVE_PATH));
        assert_eq!(
            bundle.pg_control().unwrap().archive_path,
            PG_CONTROL_ARCHIVE_PATH
        );

        assert!(file_paths.contains(&"PG_VERSION"));
        assert!(file_paths.contains(&"base/5/16384"));

        // full backup: nothing is incremented
        assert!(composer.files.iter().all(|f| !f.is_incremented));
        assert!(composer.skipped.is_empty());
    }

    #[tokio::test]
    async fn delta_walk_marks_increments_and_skips_unchanged() {
        let dir = camino_tempfile::tempdir().unwrap();
        build_datadir(dir.path());

        // pretend the parent saw both files, with PG_VERSION unchanged
        let version_mtime = mtime_of(&std::fs::metadata(dir.path().join("PG_VERSION")).unwrap());
        let mut parent_files = BackupFileList::new();
        parent_files.insert(
            "PG_VERSION".to_string(),
            BackupFileDescription {
                mtime: version_mtime,
                ..Default::default()
            },
        );
        parent_files.insert(
            "base/5/16384".to_string(),
            BackupFileDescription {
                mtime: Utc::now(), // never equal to the on-disk mtime
                ..Default::default()
            },
        );

        let mut bundle = Bundle::new(
            dir.path().to_path_buf(),
            Some(Lsn(0x1000)),
            parent_files,
            false,
            HashMap::new(),
        );
        let composer = walk_collect(&mut bundle).await;

        assert_eq!(
            composer.skipped.iter().map(|f| f.archive_path.as_str()).collect::<Vec<_>>(),
            vec!["PG_VERSION"]
        );

        let rel = composer
            .files
            .iter()
            .find(|f| f.archive_path == "base/5/16384")
            .unwrap();
        assert!(rel.is_incremented, "paged file in base becomes an increment");
        assert!(rel.was_in_base);

        let fsm = composer
            .files
            .iter()
            .find(|f| f.archive_path == "base/5/16384_fsm")
            .unwrap();
        assert!(!fsm.is_incremented, "non-paged files stay full");
        assert!(!fsm.was_in_base);
    }

    #[tokio::test]
    async fn tablespace_symlinks_are_resolved_and_walked() {
        let dir = camino_tempfile::tempdir().unwrap();
        build_datadir(dir.path());
        let tblspc_target = dir.path().join("real_tablespace");
        std::fs::create_dir_all(tblspc_target.join("PG_15_202209061/7")).unwrap();
        std::fs::write(
            tblspc_target.join("PG_15_202209061/7/16500"),
            vec![0u8; BLCKSZ],
        )
        .unwrap();
        std::os::unix::fs::symlink(&tblspc_target, dir.path().join("pg_tblspc/16400")).unwrap();

        let mut bundle = Bundle::new(
            dir.path().to_path_buf(),
            None,
            BackupFileList::new(),
            false,
            HashMap::new(),
        );
        let composer = walk_collect(&mut bundle).await;

        assert_eq!(bundle.tablespace_spec().len(), 1);
        let spec = &bundle.tablespace_spec()[0];
        assert_eq!(spec.oid, 16400);
        assert_eq!(spec.symlink, "pg_tblspc/16400");
        assert_eq!(spec.path, tblspc_target.as_str());

        assert!(composer
            .files
            .iter()
            .any(|f| f.archive_path == "pg_tblspc/16400/PG_15_202209061/7/16500"));
        assert!(composer.headers.iter().any(|h| {
            h.archive_path == "pg_tblspc/16400"
                && matches!(&h.kind, HeaderKind::Symlink { target } if target == &tblspc_target)
        }));
    }

    #[tokio::test]
    async fn update_counts_attach_to_relation_files() {
        let dir = camino_tempfile::tempdir().unwrap();
        build_datadir(dir.path());

        let mut counts = HashMap::new();
        counts.insert(
            RelFileNode {
                spc_node: crate::deltamap::DEFAULT_TABLESPACE_OID,
                db_node: 5,
                rel_node: 16384,
            },
            42,
        );
        let mut bundle = Bundle::new(
            dir.path().to_path_buf(),
            None,
            BackupFileList::new(),
            false,
            counts,
        );
        let composer = walk_collect(&mut bundle).await;

        let rel = composer
            .files
            .iter()
            .find(|f| f.archive_path == "base/5/16384")
            .unwrap();
        assert_eq!(rel.updates_count, 42);
    }
}
