//! WAL segment numbering and the canonical segment file names.
//!
//! A segment is identified by `(timeline, segno)`. The canonical file name
//! encodes both in 24 hex digits: 8 for the timeline, 8 for the "log" part
//! and 8 for the "seg" part of the segment number, where one log unit holds
//! `0x1_0000_0000 / wal_segment_size` segments.

use crate::lsn::Lsn;

/// Default WAL segment size, 16 MiB. Clusters built with a non-default
/// `--wal-segsize` carry the actual value in their control data; callers
/// pass it through everywhere a size is needed.
pub const WAL_SEGMENT_SIZE: usize = 16 * 1024 * 1024;

/// Segment number within a timeline, i.e. `lsn / wal_segment_size`.
pub type XLogSegNo = u64;

/// Timeline identifier, changes whenever the cluster forks.
pub type TimeLineID = u32;

#[inline]
fn segments_per_xlog_id(wal_seg_size: usize) -> u64 {
    0x1_0000_0000u64 / wal_seg_size as u64
}

/// Compute the canonical WAL segment file name, e.g. `0000000300000001000000C5`.
#[allow(non_snake_case)]
pub fn XLogFileName(tli: TimeLineID, segno: XLogSegNo, wal_seg_size: usize) -> String {
    format!(
        "{:>08X}{:>08X}{:>08X}",
        tli,
        segno / segments_per_xlog_id(wal_seg_size),
        segno % segments_per_xlog_id(wal_seg_size)
    )
}

/// Parse a canonical WAL segment file name back into `(timeline, segno)`.
#[allow(non_snake_case)]
pub fn XLogFromFileName(fname: &str, wal_seg_size: usize) -> Option<(TimeLineID, XLogSegNo)> {
    if fname.len() != 24 || !fname.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let tli = u32::from_str_radix(&fname[0..8], 16).ok()?;
    let log = u64::from_str_radix(&fname[8..16], 16).ok()?;
    let seg = u64::from_str_radix(&fname[16..24], 16).ok()?;
    Some((tli, log * segments_per_xlog_id(wal_seg_size) + seg))
}

/// Timeline history file name, e.g. `00000003.history`.
pub fn history_file_name(tli: TimeLineID) -> String {
    format!("{:>08X}.history", tli)
}

/// Parse `00000003.history` back into a timeline id.
pub fn timeline_from_history_file_name(fname: &str) -> Option<TimeLineID> {
    let hex = fname.strip_suffix(".history")?;
    if hex.len() != 8 {
        return None;
    }
    u32::from_str_radix(hex, 16).ok()
}

/// First LSN of the given segment.
#[allow(non_snake_case)]
pub fn XLogSegNoToRecPtr(segno: XLogSegNo, wal_seg_size: usize) -> Lsn {
    Lsn(segno * wal_seg_size as u64)
}
