//! The backup engine: streams a PostgreSQL cluster directory into an object
//! store and restores it back, with page-level delta backups driven by WAL
//! scanning, a WAL archive, and an integrity checker over the archived
//! segment space.
//!
//! The crate is organized around the flow of a backup:
//!
//! * [`bundle`] walks the data directory and decides what each file is;
//! * [`tarball`] turns the walked files into bounded parallel tar uploads;
//! * [`pagefile`] reads and writes the binary page-increment format;
//! * [`deltamap`] figures out which blocks changed between two backups;
//! * [`backup`] drives the whole push/fetch/catalog machinery;
//! * [`walarchive`] and [`walverify`] cover the WAL side of the world.
//!
//! Object stores, compression codecs and ciphers are capabilities: the
//! engine picks one of each per run and never dispatches per file.

pub mod backup;
pub mod bundle;
pub mod compression;
pub mod crypto;
pub mod deltamap;
pub mod pagefile;
pub mod postgres;
pub mod tarball;
pub mod walarchive;
pub mod walfile;
pub mod walverify;

use std::sync::Arc;

use remote_storage::GenericRemoteStorage;

use crate::compression::Compression;
use crate::crypto::Crypter;

/// Storage folder that holds base backups.
pub const BASE_BACKUPS_FOLDER: &str = "basebackups_005";
/// Storage folder that holds WAL segments, timeline history files and
/// precomputed delta files.
pub const WAL_FOLDER: &str = "wal_005";

/// Everything needed to produce objects in the store: where, how compressed,
/// and how encrypted. Cloned freely; selected once per run.
#[derive(Clone)]
pub struct Uploader {
    pub storage: GenericRemoteStorage,
    pub compression: Compression,
    pub crypter: Arc<dyn Crypter>,
}

impl Uploader {
    pub fn new(
        storage: GenericRemoteStorage,
        compression: Compression,
        crypter: Arc<dyn Crypter>,
    ) -> Self {
        Self {
            storage,
            compression,
            crypter,
        }
    }
}
