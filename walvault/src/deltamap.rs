//! The delta map: which blocks of which relations changed between two LSNs.
//!
//! The map is assembled from two sources covering the
//! `[first_used_lsn, first_not_used_lsn)` range:
//!
//! * *delta files* — precomputed location sets, one per
//!   [`WAL_FILES_IN_DELTA`] consecutive segments, stored next to the WAL;
//! * the archived WAL segments themselves, fed through the
//!   [`WalPageScanner`] capability for the tail not yet covered by a
//!   complete delta file.
//!
//! The last delta file of a range carries the scanner state at the point it
//! stopped, so the WAL scan can resume mid-record at a segment boundary.
//! Any missing piece fails the whole build: the backup handler then falls
//! back to scanning every paged file by page LSN.

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use camino::Utf8Path;
use roaring::RoaringBitmap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use utils::lsn::Lsn;
use utils::wal_segment::{TimeLineID, XLogFileName, XLogSegNo};

use crate::pagefile::RELSEG_BLOCKS;
use crate::walarchive::{ArchiveError, WalFolder};

/// How many consecutive WAL segments one delta file covers.
pub const WAL_FILES_IN_DELTA: u64 = 16;

/// Default tablespace OID relation files under `base/` belong to.
pub const DEFAULT_TABLESPACE_OID: u32 = 1663;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct RelFileNode {
    pub spc_node: u32,
    pub db_node: u32,
    pub rel_node: u32,
}

/// One changed block, as reported by the WAL scanner.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BlockLocation {
    pub relation: RelFileNode,
    pub block_no: u32,
}

#[derive(thiserror::Error, Debug)]
pub enum DeltaMapError {
    #[error("WAL segment {0} required for the delta map is missing")]
    MissingSegment(String),

    #[error("delta file {0} could not be read: {1}")]
    BadDeltaFile(String, String),

    #[error("WAL scanner failed on segment {segment}: {source}")]
    Scanner {
        segment: String,
        source: anyhow::Error,
    },

    #[error("invalid LSN range: first_used {first_used} >= first_not_used {first_not_used}")]
    InvalidRange { first_used: Lsn, first_not_used: Lsn },

    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

/// The WAL lexical layer. Implementations decode XLOG records and report
/// the page writes they describe; the engine treats both the records and the
/// carried state as opaque.
pub trait WalPageScanner: Send {
    /// Feed one complete archived segment, in order.
    fn scan_segment(&mut self, segment: &[u8]) -> anyhow::Result<Vec<BlockLocation>>;

    /// Opaque resumption state, persisted inside delta files.
    fn save_state(&self) -> Vec<u8>;

    /// Restore state previously produced by [`WalPageScanner::save_state`].
    fn load_state(&mut self, state: &[u8]) -> anyhow::Result<()>;
}

/// `relation -> changed blocks` over the whole delta window. Read-only once
/// built; composers only query it.
#[derive(Debug, Default)]
pub struct DeltaMap {
    map: HashMap<RelFileNode, RoaringBitmap>,
}

impl DeltaMap {
    pub fn add(&mut self, location: BlockLocation) {
        self.map
            .entry(location.relation)
            .or_default()
            .insert(location.block_no);
    }

    pub fn extend(&mut self, locations: impl IntoIterator<Item = BlockLocation>) {
        for location in locations {
            self.add(location);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// The changed blocks of one relation segment file, rebased so that the
    /// file's first block is 0. `None` means the delta window did not touch
    /// this file at all.
    pub fn bitmap_for(&self, archive_path: &Utf8Path) -> Option<RoaringBitmap> {
        let (relation, segment_no) = parse_relation_path(archive_path)?;
        let relation_bitmap = self.map.get(&relation)?;

        let start = segment_no * RELSEG_BLOCKS;
        let end = start.checked_add(RELSEG_BLOCKS)?;
        let rebased: RoaringBitmap = relation_bitmap
            .iter()
            .filter(|block| (start..end).contains(block))
            .map(|block| block - start)
            .collect();
        Some(rebased)
    }
}

/// Parse `base/<db>/<rel>[.<seg>]` or
/// `pg_tblspc/<spc>/<catalog version>/<db>/<rel>[.<seg>]`.
pub fn parse_relation_path(archive_path: &Utf8Path) -> Option<(RelFileNode, u32)> {
    let mut parts = archive_path.iter();
    let (spc_node, db_node) = match parts.next()? {
        "base" => (DEFAULT_TABLESPACE_OID, parts.next()?.parse().ok()?),
        "pg_tblspc" => {
            let spc = parts.next()?.parse().ok()?;
            let _catalog_version = parts.next()?;
            (spc, parts.next()?.parse().ok()?)
        }
        _ => return None,
    };
    let file_name = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    let (rel_node, segment_no) = match file_name.split_once('.') {
        Some((rel, seg)) => (rel.parse().ok()?, seg.parse().ok()?),
        None => (file_name.parse().ok()?, 0),
    };
    Some((
        RelFileNode {
            spc_node,
            db_node,
            rel_node,
        },
        segment_no,
    ))
}

/// A precomputed delta file: the locations of `WAL_FILES_IN_DELTA`
/// consecutive segments, or of a prefix of them when the file is partial.
#[derive(Debug, Default, PartialEq)]
pub struct DeltaFile {
    pub locations: Vec<BlockLocation>,
    /// First segment number the embedded scanner state has not absorbed.
    pub next_segno: XLogSegNo,
    pub scanner_state: Vec<u8>,
}

impl DeltaFile {
    /// Name of the delta file covering the bucket with the given index, e.g.
    /// `000000030000000000000010_delta` for bucket 1 on timeline 3.
    pub fn object_name(timeline: TimeLineID, delta_no: u64, wal_seg_size: usize) -> String {
        let first_segno = delta_no * WAL_FILES_IN_DELTA;
        format!(
            "{}_delta",
            XLogFileName(timeline, first_segno, wal_seg_size)
        )
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(self.locations.len() as u32)
            .unwrap();
        for location in &self.locations {
            out.write_u32::<LittleEndian>(location.relation.spc_node).unwrap();
            out.write_u32::<LittleEndian>(location.relation.db_node).unwrap();
            out.write_u32::<LittleEndian>(location.relation.rel_node).unwrap();
            out.write_u32::<LittleEndian>(location.block_no).unwrap();
        }
        out.write_u64::<LittleEndian>(self.next_segno).unwrap();
        out.write_u32::<LittleEndian>(self.scanner_state.len() as u32)
            .unwrap();
        out.write_all(&self.scanner_state).unwrap();
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> std::io::Result<DeltaFile> {
        let mut cursor = Cursor::new(bytes);
        let count = cursor.read_u32::<LittleEndian>()?;
        let mut locations = Vec::with_capacity(count as usize);
        for _ in 0..count {
            locations.push(BlockLocation {
                relation: RelFileNode {
                    spc_node: cursor.read_u32::<LittleEndian>()?,
                    db_node: cursor.read_u32::<LittleEndian>()?,
                    rel_node: cursor.read_u32::<LittleEndian>()?,
                },
                block_no: cursor.read_u32::<LittleEndian>()?,
            });
        }
        let next_segno = cursor.read_u64::<LittleEndian>()?;
        let state_len = cursor.read_u32::<LittleEndian>()? as usize;
        let mut scanner_state = vec![0u8; state_len];
        cursor.read_exact(&mut scanner_state)?;
        Ok(DeltaFile {
            locations,
            next_segno,
            scanner_state,
        })
    }
}

/// Build the delta map for `[first_used_lsn, first_not_used_lsn)` on the
/// given timeline. Idempotent; callers may retry on failure.
pub async fn build_delta_map(
    wal_folder: &WalFolder,
    scanner: &mut dyn WalPageScanner,
    timeline: TimeLineID,
    wal_seg_size: usize,
    first_used_lsn: Lsn,
    first_not_used_lsn: Lsn,
    cancel: &CancellationToken,
) -> Result<DeltaMap, DeltaMapError> {
    if first_not_used_lsn <= first_used_lsn {
        return Err(DeltaMapError::InvalidRange {
            first_used: first_used_lsn,
            first_not_used: first_not_used_lsn,
        });
    }

    let first_used_segno = first_used_lsn.segment_number(wal_seg_size);
    let last_used_segno = Lsn(first_not_used_lsn.0 - 1).segment_number(wal_seg_size);
    let first_not_used_segno = first_not_used_lsn.segment_number(wal_seg_size);

    let first_used_delta_no = first_used_segno / WAL_FILES_IN_DELTA;
    let first_not_used_delta_no = first_not_used_segno / WAL_FILES_IN_DELTA;

    let mut delta_map = DeltaMap::default();
    let mut scan_from_segno = first_used_segno;

    if first_not_used_delta_no > first_used_delta_no {
        // complete buckets contribute their location sets as-is
        for delta_no in first_used_delta_no..first_not_used_delta_no.saturating_sub(1) {
            let delta_file = fetch_delta_file(wal_folder, timeline, delta_no, wal_seg_size, cancel)
                .await?;
            delta_map.extend(delta_file.locations);
        }

        // the last bucket also seeds the scanner for the remaining tail
        let delta_no = first_not_used_delta_no - 1;
        let delta_file =
            fetch_delta_file(wal_folder, timeline, delta_no, wal_seg_size, cancel).await?;
        scanner
            .load_state(&delta_file.scanner_state)
            .map_err(|source| DeltaMapError::Scanner {
                segment: DeltaFile::object_name(timeline, delta_no, wal_seg_size),
                source,
            })?;
        scan_from_segno = delta_file.next_segno;
        delta_map.extend(delta_file.locations);
    }

    for segno in scan_from_segno..=last_used_segno {
        let segment_name = XLogFileName(timeline, segno, wal_seg_size);
        let segment = match wal_folder.fetch_object(&segment_name, cancel).await {
            Ok(bytes) => bytes,
            Err(ArchiveError::ObjectMissing(name)) => {
                return Err(DeltaMapError::MissingSegment(name))
            }
            Err(other) => return Err(other.into()),
        };
        let locations =
            scanner
                .scan_segment(&segment)
                .map_err(|source| DeltaMapError::Scanner {
                    segment: segment_name,
                    source,
                })?;
        delta_map.extend(locations);
    }

    info!(
        "built delta map for {}..{} from {} relations",
        first_used_lsn,
        first_not_used_lsn,
        delta_map.map.len()
    );
    Ok(delta_map)
}

async fn fetch_delta_file(
    wal_folder: &WalFolder,
    timeline: TimeLineID,
    delta_no: u64,
    wal_seg_size: usize,
    cancel: &CancellationToken,
) -> Result<DeltaFile, DeltaMapError> {
    let name = DeltaFile::object_name(timeline, delta_no, wal_seg_size);
    let bytes = wal_folder.fetch_object(&name, cancel).await?;
    let delta_file = DeltaFile::from_bytes(&bytes)
        .map_err(|e| DeltaMapError::BadDeltaFile(name.clone(), e.to_string()))?;
    debug!(
        "delta file {name}: {} locations, resumes at segno {}",
        delta_file.locations.len(),
        delta_file.next_segno
    );
    Ok(delta_file)
}
