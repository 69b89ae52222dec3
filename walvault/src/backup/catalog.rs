//! The backup catalogue: list, select, mark, and sweep the
//! `basebackups_005/` prefix.
//!
//! Increment edges form a forest (every delta has exactly one parent), so
//! permanence propagates with a single upward walk, and the
//! no-permanent-descendants rule is checked against a reverse-edge map
//! built freshly per mark operation.

use std::collections::HashMap;

use anyhow::Context;
use remote_storage::{DownloadError, GenericRemoteStorage, ListingMode, RemotePath};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::sentinel::{
    backup_name_from_sentinel_object, metadata_path, sentinel_path, wal_file_of_backup_name,
    BackupSentinelDto, ExtendedMetadataDto,
};
use crate::BASE_BACKUPS_FOLDER;

/// How the caller names the backup to operate on. `Latest` is the special
/// `LATEST` token of the command surface.
#[derive(Debug, Clone)]
pub enum BackupSelector {
    Name(String),
    UserData(serde_json::Value),
    Latest,
}

#[derive(thiserror::Error, Debug)]
pub enum CatalogError {
    #[error("backup {0:?} does not exist")]
    BackupNonExistence(String),

    #[error("no backups found")]
    NoBackupsFound,

    #[error("user data matches {0} backups, refusing to choose")]
    AmbiguousUserData(usize),

    #[error("backup {name:?} already has permanent={permanent}")]
    MarkUnchanged { name: String, permanent: bool },

    #[error("backup {name:?} has permanent descendant {descendant:?}")]
    PermanentDescendant { name: String, descendant: String },

    #[error(transparent)]
    Download(DownloadError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub struct BackupCatalog<'a> {
    storage: &'a GenericRemoteStorage,
}

impl<'a> BackupCatalog<'a> {
    pub fn new(storage: &'a GenericRemoteStorage) -> Self {
        BackupCatalog { storage }
    }

    /// Completed backups, in name order. Only sentinel objects count:
    /// anything else under the prefix is an unfinished or garbage backup.
    pub async fn list_backup_names(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, CatalogError> {
        let prefix = RemotePath::from_string(BASE_BACKUPS_FOLDER).expect("constant path");
        let listing = self
            .storage
            .list(Some(&prefix), ListingMode::WithDelimiter, cancel)
            .await
            .map_err(CatalogError::Download)?;
        let mut names: Vec<String> = listing
            .keys
            .iter()
            .filter_map(|key| key.object_name())
            .filter_map(backup_name_from_sentinel_object)
            .map(str::to_owned)
            .collect();
        names.sort();
        Ok(names)
    }

    pub async fn fetch_sentinel(
        &self,
        backup_name: &str,
        cancel: &CancellationToken,
    ) -> Result<BackupSentinelDto, CatalogError> {
        self.fetch_json(&sentinel_path(backup_name), backup_name, cancel)
            .await
    }

    pub async fn fetch_metadata(
        &self,
        backup_name: &str,
        cancel: &CancellationToken,
    ) -> Result<ExtendedMetadataDto, CatalogError> {
        self.fetch_json(&metadata_path(backup_name), backup_name, cancel)
            .await
    }

    pub async fn upload_metadata(
        &self,
        backup_name: &str,
        metadata: &ExtendedMetadataDto,
        cancel: &CancellationToken,
    ) -> Result<(), CatalogError> {
        self.upload_json(&metadata_path(backup_name), metadata, cancel)
            .await
    }

    pub async fn upload_sentinel(
        &self,
        backup_name: &str,
        sentinel: &BackupSentinelDto,
        cancel: &CancellationToken,
    ) -> Result<(), CatalogError> {
        self.upload_json(&sentinel_path(backup_name), sentinel, cancel)
            .await
    }

    /// Resolve a selector to a backup name. Exactly one of name and
    /// user-data may drive the selection; the caller enforces that at the
    /// command surface.
    pub async fn select(
        &self,
        selector: &BackupSelector,
        cancel: &CancellationToken,
    ) -> Result<String, CatalogError> {
        match selector {
            BackupSelector::Name(name) => {
                if !self
                    .storage
                    .exists(&sentinel_path(name))
                    .await
                    .context("failed to probe sentinel")?
                {
                    return Err(CatalogError::BackupNonExistence(name.clone()));
                }
                Ok(name.clone())
            }
            BackupSelector::Latest => {
                let names = self.list_backup_names(cancel).await?;
                names
                    .into_iter()
                    .max_by(|a, b| {
                        // chronological within a timeline: compare the WAL
                        // file the backup started at
                        wal_file_of_backup_name(a)
                            .cmp(&wal_file_of_backup_name(b))
                            .then(a.cmp(b))
                    })
                    .ok_or(CatalogError::NoBackupsFound)
            }
            BackupSelector::UserData(user_data) => {
                let names = self.list_backup_names(cancel).await?;
                let mut matches = Vec::new();
                for name in names {
                    let metadata = self.fetch_metadata(&name, cancel).await?;
                    if metadata.user_data == *user_data {
                        matches.push(name);
                    }
                }
                match matches.len() {
                    0 => Err(CatalogError::NoBackupsFound),
                    1 => Ok(matches.pop().expect("one element")),
                    n => Err(CatalogError::AmbiguousUserData(n)),
                }
            }
        }
    }

    /// Flip a backup's permanence. Making a delta permanent pins its whole
    /// ancestry; making a backup impermanent is refused while any
    /// descendant is still permanent.
    pub async fn mark(
        &self,
        backup_name: &str,
        permanent: bool,
        cancel: &CancellationToken,
    ) -> Result<(), CatalogError> {
        let metadata = self.fetch_metadata(backup_name, cancel).await?;
        if metadata.is_permanent == permanent {
            return Err(CatalogError::MarkUnchanged {
                name: backup_name.to_string(),
                permanent,
            });
        }

        if permanent {
            self.mark_permanent_chain(backup_name, cancel).await
        } else {
            self.ensure_no_permanent_descendants(backup_name, cancel)
                .await?;
            let mut metadata = metadata;
            metadata.is_permanent = false;
            self.upload_metadata(backup_name, &metadata, cancel).await?;
            info!("marked {backup_name} impermanent");
            Ok(())
        }
    }

    /// Walk `backup_name` up to its full-backup root, flipping every
    /// not-yet-permanent metadata on the way.
    pub async fn mark_permanent_chain(
        &self,
        backup_name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), CatalogError> {
        let mut current = backup_name.to_string();
        loop {
            let mut metadata = self.fetch_metadata(&current, cancel).await?;
            if !metadata.is_permanent {
                metadata.is_permanent = true;
                self.upload_metadata(&current, &metadata, cancel).await?;
                info!("marked {current} permanent");
            }
            let sentinel = self.fetch_sentinel(&current, cancel).await?;
            match sentinel.increment_from {
                Some(parent) => current = parent,
                None => return Ok(()),
            }
        }
    }

    async fn ensure_no_permanent_descendants(
        &self,
        backup_name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), CatalogError> {
        let names = self.list_backup_names(cancel).await?;
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        for name in &names {
            let sentinel = self.fetch_sentinel(name, cancel).await?;
            if let Some(parent) = sentinel.increment_from {
                children.entry(parent).or_default().push(name.clone());
            }
        }

        let mut pending = children.get(backup_name).cloned().unwrap_or_default();
        while let Some(descendant) = pending.pop() {
            let metadata = self.fetch_metadata(&descendant, cancel).await?;
            if metadata.is_permanent {
                return Err(CatalogError::PermanentDescendant {
                    name: backup_name.to_string(),
                    descendant,
                });
            }
            pending.extend(children.get(&descendant).cloned().unwrap_or_default());
        }
        Ok(())
    }

    /// Backup prefixes with no sentinel: aborted pushes and half-deleted
    /// backups. Deleting them is a separate, explicit operation.
    pub async fn garbage_prefixes(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, CatalogError> {
        let prefix = RemotePath::from_string(BASE_BACKUPS_FOLDER).expect("constant path");
        let listing = self
            .storage
            .list(Some(&prefix), ListingMode::WithDelimiter, cancel)
            .await
            .map_err(CatalogError::Download)?;
        let completed: Vec<String> = listing
            .keys
            .iter()
            .filter_map(|key| key.object_name())
            .filter_map(backup_name_from_sentinel_object)
            .map(str::to_owned)
            .collect();
        let mut garbage: Vec<String> = listing
            .prefixes
            .iter()
            .filter_map(|p| p.object_name())
            .filter(|name| !completed.iter().any(|done| done == name))
            .map(str::to_owned)
            .collect();
        garbage.sort();
        Ok(garbage)
    }

    pub async fn delete_garbage(&self, cancel: &CancellationToken) -> Result<usize, CatalogError> {
        let garbage = self.garbage_prefixes(cancel).await?;
        let mut deleted = 0;
        for name in &garbage {
            let prefix = RemotePath::from_string(&format!("{BASE_BACKUPS_FOLDER}/{name}"))
                .expect("listed names are relative");
            let listing = self
                .storage
                .list(Some(&prefix), ListingMode::NoDelimiter, cancel)
                .await
                .map_err(CatalogError::Download)?;
            deleted += listing.keys.len();
            self.storage
                .delete_objects(&listing.keys, cancel)
                .await
                .context("failed to delete garbage objects")?;
            debug!("deleted garbage prefix {name}");
        }
        Ok(deleted)
    }

    async fn fetch_json<T: DeserializeOwned>(
        &self,
        path: &RemotePath,
        backup_name: &str,
        cancel: &CancellationToken,
    ) -> Result<T, CatalogError> {
        let bytes = match self.storage.download_all(path, cancel).await {
            Ok(bytes) => bytes,
            Err(DownloadError::NotFound) => {
                return Err(CatalogError::BackupNonExistence(backup_name.to_string()))
            }
            Err(other) => return Err(CatalogError::Download(other)),
        };
        serde_json::from_slice(&bytes)
            .with_context(|| format!("malformed JSON at {path}"))
            .map_err(CatalogError::Other)
    }

    async fn upload_json<T: Serialize>(
        &self,
        path: &RemotePath,
        value: &T,
        cancel: &CancellationToken,
    ) -> Result<(), CatalogError> {
        let bytes = serde_json::to_vec(value).context("failed to serialize JSON")?;
        let mut reader = std::io::Cursor::new(bytes);
        self.storage
            .upload(&mut reader, path, cancel)
            .await
            .with_context(|| format!("failed to upload {path}"))
            .map_err(CatalogError::Other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::sentinel::{BackupFileList, TarFileSets};
    use chrono::Utc;
    use remote_storage::LocalFs;
    use utils::lsn::Lsn;

    fn storage() -> (GenericRemoteStorage, camino_tempfile::Utf8TempDir) {
        let dir = camino_tempfile::tempdir().unwrap();
        (
            GenericRemoteStorage::LocalFs(LocalFs::new(dir.path().to_path_buf()).unwrap()),
            dir,
        )
    }

    fn sentinel(increment_from: Option<&str>) -> BackupSentinelDto {
        BackupSentinelDto {
            start_lsn: Lsn(0x1000),
            finish_lsn: Lsn(0x2000),
            pg_version: 150004,
            system_identifier: Some(42),
            files: BackupFileList::new(),
            tar_file_sets: TarFileSets::new(),
            tablespace_spec: vec![],
            increment_from: increment_from.map(str::to_owned),
            increment_from_lsn: increment_from.map(|_| Lsn(0x1000)),
            increment_full_name: increment_from.map(str::to_owned),
            increment_count: increment_from.map(|_| 1),
            is_catchup: false,
            uncompressed_size: 0,
            compressed_size: 0,
        }
    }

    fn metadata(permanent: bool, user_data: serde_json::Value) -> ExtendedMetadataDto {
        ExtendedMetadataDto {
            start_time: Utc::now(),
            finish_time: Utc::now(),
            hostname: "db-1".to_string(),
            data_dir: "/pgdata".to_string(),
            pg_version: 150004,
            start_lsn: Lsn(0x1000),
            finish_lsn: Lsn(0x2000),
            is_permanent: permanent,
            user_data,
        }
    }

    async fn put_backup(
        catalog: &BackupCatalog<'_>,
        name: &str,
        parent: Option<&str>,
        permanent: bool,
        user_data: serde_json::Value,
    ) {
        let cancel = CancellationToken::new();
        catalog
            .upload_sentinel(name, &sentinel(parent), &cancel)
            .await
            .unwrap();
        catalog
            .upload_metadata(name, &metadata(permanent, user_data), &cancel)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn select_by_name_and_latest() {
        let (storage, _dir) = storage();
        let catalog = BackupCatalog::new(&storage);
        let cancel = CancellationToken::new();

        put_backup(&catalog, "base_000000010000000000000002", None, false, serde_json::Value::Null)
            .await;
        put_backup(
            &catalog,
            "base_000000010000000000000005_D_000000010000000000000002",
            Some("base_000000010000000000000002"),
            false,
            serde_json::Value::Null,
        )
        .await;

        assert_eq!(
            catalog
                .select(
                    &BackupSelector::Name("base_000000010000000000000002".into()),
                    &cancel
                )
                .await
                .unwrap(),
            "base_000000010000000000000002"
        );
        assert!(matches!(
            catalog
                .select(&BackupSelector::Name("base_missing".into()), &cancel)
                .await,
            Err(CatalogError::BackupNonExistence(name)) if name == "base_missing"
        ));
        assert_eq!(
            catalog.select(&BackupSelector::Latest, &cancel).await.unwrap(),
            "base_000000010000000000000005_D_000000010000000000000002"
        );
    }

    #[tokio::test]
    async fn select_latest_on_empty_catalog_fails() {
        let (storage, _dir) = storage();
        let catalog = BackupCatalog::new(&storage);
        assert!(matches!(
            catalog
                .select(&BackupSelector::Latest, &CancellationToken::new())
                .await,
            Err(CatalogError::NoBackupsFound)
        ));
    }

    #[tokio::test]
    async fn select_by_user_data_rejects_ambiguity() {
        let (storage, _dir) = storage();
        let catalog = BackupCatalog::new(&storage);
        let cancel = CancellationToken::new();
        let tag = serde_json::json!({"release": "1.2"});

        put_backup(&catalog, "base_A", None, false, tag.clone()).await;
        put_backup(&catalog, "base_B", None, false, tag.clone()).await;
        put_backup(&catalog, "base_C", None, false, serde_json::json!("other")).await;

        assert!(matches!(
            catalog
                .select(&BackupSelector::UserData(tag), &cancel)
                .await,
            Err(CatalogError::AmbiguousUserData(2))
        ));
        assert_eq!(
            catalog
                .select(
                    &BackupSelector::UserData(serde_json::json!("other")),
                    &cancel
                )
                .await
                .unwrap(),
            "base_C"
        );
    }

    #[tokio::test]
    async fn mark_permanent_walks_the_chain_up() {
        let (storage, _dir) = storage();
        let catalog = BackupCatalog::new(&storage);
        let cancel = CancellationToken::new();

        put_backup(&catalog, "base_A", None, false, serde_json::Value::Null).await;
        put_backup(&catalog, "base_B", Some("base_A"), false, serde_json::Value::Null).await;
        put_backup(&catalog, "base_C", Some("base_B"), false, serde_json::Value::Null).await;

        catalog.mark("base_C", true, &cancel).await.unwrap();
        for name in ["base_A", "base_B", "base_C"] {
            assert!(
                catalog.fetch_metadata(name, &cancel).await.unwrap().is_permanent,
                "{name} must be permanent"
            );
        }

        // no-op marking is rejected
        assert!(matches!(
            catalog.mark("base_C", true, &cancel).await,
            Err(CatalogError::MarkUnchanged { .. })
        ));
    }

    #[tokio::test]
    async fn demotion_respects_permanent_descendants() {
        let (storage, _dir) = storage();
        let catalog = BackupCatalog::new(&storage);
        let cancel = CancellationToken::new();

        put_backup(&catalog, "base_A", None, false, serde_json::Value::Null).await;
        put_backup(&catalog, "base_B", Some("base_A"), false, serde_json::Value::Null).await;
        catalog.mark("base_B", true, &cancel).await.unwrap();

        // base_A now has permanent descendant base_B
        assert!(matches!(
            catalog.mark("base_A", false, &cancel).await,
            Err(CatalogError::PermanentDescendant { descendant, .. }) if descendant == "base_B"
        ));
        assert!(catalog.fetch_metadata("base_A", &cancel).await.unwrap().is_permanent);

        // demoting the leaf is fine and only changes the leaf
        catalog.mark("base_B", false, &cancel).await.unwrap();
        assert!(!catalog.fetch_metadata("base_B", &cancel).await.unwrap().is_permanent);
        assert!(catalog.fetch_metadata("base_A", &cancel).await.unwrap().is_permanent);
    }

    #[tokio::test]
    async fn garbage_is_prefixes_without_sentinels() {
        let (storage, _dir) = storage();
        let catalog = BackupCatalog::new(&storage);
        let cancel = CancellationToken::new();

        put_backup(&catalog, "base_done", None, false, serde_json::Value::Null).await;
        // an aborted push left tars but no sentinel
        let stray = RemotePath::from_string(
            "basebackups_005/base_aborted/tar_partitions/part_001.tar.gz",
        )
        .unwrap();
        let mut bytes = std::io::Cursor::new(b"partial".to_vec());
        storage.upload(&mut bytes, &stray, &cancel).await.unwrap();

        assert_eq!(
            catalog.garbage_prefixes(&cancel).await.unwrap(),
            vec!["base_aborted".to_string()]
        );

        let deleted = catalog.delete_garbage(&cancel).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(catalog.garbage_prefixes(&cancel).await.unwrap().is_empty());
        assert_eq!(
            catalog.list_backup_names(&cancel).await.unwrap(),
            vec!["base_done".to_string()]
        );
    }
}
