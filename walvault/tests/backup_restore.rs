//! End-to-end backup and restore over local storage: compose a full backup
//! from a synthetic data directory, layer a delta on top, fetch both back
//! and compare bytes.
//!
//! The database protocol is not involved: the test drives the same
//! [`BackupWorkspace`] the push handler uses, with the facts a server would
//! have provided.

use std::collections::HashMap;
use std::sync::Arc;

use camino::Utf8Path;
use chrono::Utc;
use remote_storage::{GenericRemoteStorage, LocalFs};
use tokio_util::sync::CancellationToken;
use utils::lsn::Lsn;
use utils::wal_segment::WAL_SEGMENT_SIZE;

use walvault::backup::catalog::{BackupCatalog, BackupSelector};
use walvault::backup::fetch::{backup_fetch, BackupFetchSettings};
use walvault::backup::push::{
    build_sentinel, BackupContext, BackupPushSettings, BackupWorkspace, ParentBackupInfo,
};
use walvault::backup::sentinel::{backup_name, wal_file_of_backup_name, ExtendedMetadataDto};
use walvault::compression::Compression;
use walvault::crypto::{Crypter, NoCrypter};
use walvault::pagefile::BLCKSZ;
use walvault::tarball::queue::QueueSettings;
use walvault::Uploader;

const PAGE_SIZE_VERSION: u16 = 8192 | 4;

fn test_page(lsn: u64, fill: u8) -> Vec<u8> {
    let mut page = vec![fill; BLCKSZ];
    page[0..4].copy_from_slice(&((lsn >> 32) as u32).to_le_bytes());
    page[4..8].copy_from_slice(&(lsn as u32).to_le_bytes());
    page[8..10].copy_from_slice(&0u16.to_le_bytes());
    page[10..12].copy_from_slice(&0u16.to_le_bytes());
    page[12..14].copy_from_slice(&64u16.to_le_bytes());
    page[14..16].copy_from_slice(&8192u16.to_le_bytes());
    page[16..18].copy_from_slice(&8192u16.to_le_bytes());
    page[18..20].copy_from_slice(&PAGE_SIZE_VERSION.to_le_bytes());
    page
}

fn write_paged_file(path: &Utf8Path, pages: &[(u64, u8)]) {
    let mut content = Vec::new();
    for &(lsn, fill) in pages {
        content.extend_from_slice(&test_page(lsn, fill));
    }
    std::fs::write(path, content).unwrap();
}

fn build_datadir(dir: &Utf8Path) {
    std::fs::create_dir_all(dir.join("base/5")).unwrap();
    std::fs::create_dir_all(dir.join("global")).unwrap();
    std::fs::create_dir_all(dir.join("pg_wal")).unwrap();
    std::fs::create_dir_all(dir.join("pg_tblspc")).unwrap();

    std::fs::write(dir.join("PG_VERSION"), "15\n").unwrap();
    std::fs::write(dir.join("postgresql.conf"), "shared_buffers = '1GB'\n").unwrap();
    std::fs::write(dir.join("base/5/PG_VERSION"), "15\n").unwrap();
    write_paged_file(
        &dir.join("base/5/16384"),
        &[(0x10, 1), (0x20, 2), (0x30, 3), (0x40, 4)],
    );
    write_paged_file(&dir.join("base/5/16385"), &[(0x15, 5), (0x25, 6)]);
    std::fs::write(dir.join("global/pg_control"), vec![0xC0u8; 512]).unwrap();
    // lives under an excluded directory, must never be archived
    std::fs::write(dir.join("pg_wal/000000010000000000000001"), b"wal").unwrap();
}

struct Harness {
    uploader: Uploader,
    storage: GenericRemoteStorage,
    crypter: Arc<dyn Crypter>,
    cancel: CancellationToken,
    _store_dir: camino_tempfile::Utf8TempDir,
}

impl Harness {
    fn new() -> Harness {
        let store_dir = camino_tempfile::tempdir().unwrap();
        let storage =
            GenericRemoteStorage::LocalFs(LocalFs::new(store_dir.path().to_path_buf()).unwrap());
        let crypter: Arc<dyn Crypter> = Arc::new(NoCrypter);
        Harness {
            uploader: Uploader::new(storage.clone(), Compression::Gzip, Arc::clone(&crypter)),
            storage,
            crypter,
            cancel: CancellationToken::new(),
            _store_dir: store_dir,
        }
    }

    fn settings(&self, rating: bool) -> BackupPushSettings {
        BackupPushSettings {
            use_rating_composer: rating,
            queue: QueueSettings {
                parallel_tarballs: 2,
                max_upload_queue: 2,
                // small threshold so several parts are produced
                tar_size_threshold: 3 * BLCKSZ as u64,
            },
            ..BackupPushSettings::default()
        }
    }

    /// Compose, upload and register one backup layer, the way the push
    /// handler does once the server side is settled.
    async fn push_backup(
        &self,
        data_dir: &Utf8Path,
        timeline: u32,
        start_lsn: Lsn,
        finish_lsn: Lsn,
        parent: Option<ParentBackupInfo>,
        rating: bool,
    ) -> String {
        let parent_wal = parent
            .as_ref()
            .and_then(|p| wal_file_of_backup_name(&p.name))
            .map(str::to_owned);
        let name = backup_name(timeline, start_lsn, WAL_SEGMENT_SIZE, parent_wal.as_deref());
        let context = BackupContext {
            backup_name: name.clone(),
            data_dir: data_dir.to_path_buf(),
            timeline,
            start_lsn,
            pg_version: 150004,
            system_identifier: Some(0x1122334455667788),
            parent,
            delta_map: None,
            update_counts: HashMap::new(),
        };

        let mut workspace = BackupWorkspace::new(
            &self.uploader,
            context,
            self.settings(rating),
            self.cancel.clone(),
        );
        workspace.compose().await.unwrap();
        workspace
            .upload_label_files("START WAL LOCATION: 0/1000028\n", None)
            .await
            .unwrap();
        let (context, composed) = workspace.finish().await.unwrap();

        let catalog = BackupCatalog::new(&self.storage);
        let metadata = ExtendedMetadataDto {
            start_time: Utc::now(),
            finish_time: Utc::now(),
            hostname: "test".to_string(),
            data_dir: data_dir.to_string(),
            pg_version: context.pg_version,
            start_lsn: context.start_lsn,
            finish_lsn,
            is_permanent: false,
            user_data: serde_json::Value::Null,
        };
        catalog
            .upload_metadata(&name, &metadata, &self.cancel)
            .await
            .unwrap();
        let sentinel = build_sentinel(&context, composed, finish_lsn);
        catalog
            .upload_sentinel(&name, &sentinel, &self.cancel)
            .await
            .unwrap();
        name
    }

    async fn fetch(&self, name: &str, dest: &Utf8Path) {
        backup_fetch(
            &self.storage,
            &self.crypter,
            &BackupSelector::Name(name.to_string()),
            dest,
            &BackupFetchSettings::default(),
            &self.cancel,
        )
        .await
        .unwrap();
    }
}

fn assert_file_equal(source: &Utf8Path, restored: &Utf8Path, rel: &str) {
    let source_bytes = std::fs::read(source.join(rel)).unwrap();
    let restored_bytes = std::fs::read(restored.join(rel)).unwrap();
    assert_eq!(source_bytes, restored_bytes, "{rel} differs after restore");
}

#[tokio::test]
async fn full_backup_round_trip() {
    let harness = Harness::new();
    let data_dir = camino_tempfile::tempdir().unwrap();
    build_datadir(data_dir.path());

    let name = harness
        .push_backup(data_dir.path(), 1, Lsn(0x50), Lsn(0x1050), None, false)
        .await;
    assert_eq!(name, "base_000000010000000000000000");

    let dest = camino_tempfile::tempdir().unwrap();
    let dest = dest.path().join("restore");
    harness.fetch(&name, &dest).await;

    for rel in [
        "PG_VERSION",
        "postgresql.conf",
        "base/5/PG_VERSION",
        "base/5/16384",
        "base/5/16385",
        "global/pg_control",
    ] {
        assert_file_equal(data_dir.path(), &dest, rel);
    }

    // excluded directories come back as empty directories
    assert!(dest.join("pg_wal").is_dir());
    assert!(!dest.join("pg_wal/000000010000000000000001").exists());

    // the label tarball restored the backup label
    let label = std::fs::read_to_string(dest.join("backup_label")).unwrap();
    assert!(label.starts_with("START WAL LOCATION"));
}

#[tokio::test]
async fn delta_backup_restores_to_current_state() {
    let harness = Harness::new();
    let data_dir = camino_tempfile::tempdir().unwrap();
    build_datadir(data_dir.path());

    let full_name = harness
        .push_backup(data_dir.path(), 1, Lsn(0x50), Lsn(0x1050), None, false)
        .await;

    // mutate the cluster: one page of 16384 changes, 16385 stays untouched,
    // a new relation appears
    let rel_path = data_dir.path().join("base/5/16384");
    let mut rel = std::fs::read(&rel_path).unwrap();
    let new_page = test_page(0x2000, 9);
    rel[2 * BLCKSZ..3 * BLCKSZ].copy_from_slice(&new_page);
    std::fs::write(&rel_path, rel).unwrap();
    write_paged_file(&data_dir.path().join("base/5/16390"), &[(0x2010, 8)]);

    let catalog = BackupCatalog::new(&harness.storage);
    let parent_sentinel = catalog
        .fetch_sentinel(&full_name, &harness.cancel)
        .await
        .unwrap();
    let delta_name = harness
        .push_backup(
            data_dir.path(),
            1,
            Lsn(0x2050),
            Lsn(0x3050),
            Some(ParentBackupInfo {
                name: full_name.clone(),
                sentinel: parent_sentinel,
            }),
            false,
        )
        .await;
    assert_eq!(
        delta_name,
        "base_000000010000000000000000_D_000000010000000000000000"
    );

    // the delta recorded what it owes to its parent
    let delta_sentinel = catalog
        .fetch_sentinel(&delta_name, &harness.cancel)
        .await
        .unwrap();
    assert_eq!(delta_sentinel.increment_from.as_deref(), Some(full_name.as_str()));
    assert_eq!(delta_sentinel.increment_count, Some(1));
    assert_eq!(delta_sentinel.increment_from_lsn, Some(Lsn(0x50)));
    let rel_entry = &delta_sentinel.files["base/5/16384"];
    assert!(rel_entry.is_incremented, "changed paged file is an increment");
    let unchanged = &delta_sentinel.files["base/5/16385"];
    assert!(unchanged.is_skipped, "untouched file is carried by the parent");
    assert!(!delta_sentinel.files["base/5/16390"].is_incremented);

    let dest = camino_tempfile::tempdir().unwrap();
    let dest = dest.path().join("restore");
    harness.fetch(&delta_name, &dest).await;

    // restoring the delta yields the same bytes as a full backup taken now
    for rel in [
        "PG_VERSION",
        "postgresql.conf",
        "base/5/PG_VERSION",
        "base/5/16384",
        "base/5/16385",
        "base/5/16390",
        "global/pg_control",
    ] {
        assert_file_equal(data_dir.path(), &dest, rel);
    }
}

#[tokio::test]
async fn rating_composer_round_trip_covers_every_path() {
    let harness = Harness::new();
    let data_dir = camino_tempfile::tempdir().unwrap();
    build_datadir(data_dir.path());

    let name = harness
        .push_backup(data_dir.path(), 2, Lsn(0x50), Lsn(0x1050), None, true)
        .await;

    // every archived path lands in exactly one tar
    let catalog = BackupCatalog::new(&harness.storage);
    let sentinel = catalog.fetch_sentinel(&name, &harness.cancel).await.unwrap();
    let mut seen = std::collections::HashSet::new();
    for members in sentinel.tar_file_sets.values() {
        for member in members {
            assert!(seen.insert(member.clone()), "{member} appears in two tars");
        }
    }
    for path in sentinel.files.keys() {
        assert!(seen.contains(path), "{path} missing from every tar");
    }

    let dest = camino_tempfile::tempdir().unwrap();
    let dest = dest.path().join("restore");
    harness.fetch(&name, &dest).await;
    for rel in ["base/5/16384", "base/5/16385", "global/pg_control"] {
        assert_file_equal(data_dir.path(), &dest, rel);
    }
}

#[tokio::test]
async fn fetch_refuses_a_dirty_destination() {
    let harness = Harness::new();
    let data_dir = camino_tempfile::tempdir().unwrap();
    build_datadir(data_dir.path());
    let name = harness
        .push_backup(data_dir.path(), 1, Lsn(0x50), Lsn(0x1050), None, false)
        .await;

    let dest = camino_tempfile::tempdir().unwrap();
    std::fs::write(dest.path().join("leftover"), b"x").unwrap();
    let result = backup_fetch(
        &harness.storage,
        &harness.crypter,
        &BackupSelector::Name(name),
        dest.path(),
        &BackupFetchSettings::default(),
        &harness.cancel,
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn restoring_missing_backup_reports_nonexistence() {
    let harness = Harness::new();
    let dest = camino_tempfile::tempdir().unwrap();
    let result = backup_fetch(
        &harness.storage,
        &harness.crypter,
        &BackupSelector::Name("base_nothing".to_string()),
        &dest.path().join("restore"),
        &BackupFetchSettings::default(),
        &harness.cancel,
    )
    .await;
    let message = format!("{:#}", result.unwrap_err());
    assert!(message.contains("does not exist"), "{message}");
}
