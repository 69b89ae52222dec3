//! Composers turn the walked file stream into tar archives.
//!
//! Two strategies exist behind one interface: [`regular::RegularComposer`]
//! packs files as they arrive, [`rating::RatingComposer`] buffers the walk
//! and reorders files by update heat so a later restore can skip cold tars.

pub mod rating;
pub mod regular;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};

use crate::backup::sentinel::TarFileSets;

/// A regular file emitted by the bundle walker.
#[derive(Clone, Debug)]
pub struct ComposeFileInfo {
    /// Path inside the archive, also the key of the sentinel's file map.
    pub archive_path: String,
    /// Where the file actually lives (tablespaces resolve elsewhere).
    pub full_path: Utf8PathBuf,
    pub mtime: DateTime<Utc>,
    pub size: u64,
    pub mode: u32,
    /// The delta parent archived this path too.
    pub was_in_base: bool,
    /// Archive as a page increment instead of a full copy.
    pub is_incremented: bool,
    /// Tuple writes to the owning relation, for the rating composer.
    pub updates_count: u64,
}

/// A non-file entry: carried as a tar header only.
#[derive(Clone, Debug)]
pub struct ComposeHeaderInfo {
    pub archive_path: String,
    pub kind: HeaderKind,
    pub mode: u32,
    pub mtime: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub enum HeaderKind {
    Directory,
    Symlink { target: Utf8PathBuf },
}

#[async_trait::async_trait]
pub trait TarBallComposer: Send {
    /// Admit one regular file.
    async fn add_file(&mut self, info: ComposeFileInfo) -> anyhow::Result<()>;

    /// Admit a directory or symlink entry.
    async fn add_header(&mut self, info: ComposeHeaderInfo) -> anyhow::Result<()>;

    /// Record a file whose content the delta parent already carries.
    fn skip_file(&mut self, info: ComposeFileInfo);

    /// Wait for all packing to complete and report which tar got which path.
    async fn finish(self: Box<Self>) -> anyhow::Result<TarFileSets>;
}
