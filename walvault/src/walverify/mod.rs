//! WAL archive integrity: the `wal-verify` checks and the `wal-show`
//! overview.
//!
//! Both are synchronous over a storage listing: list the archive, walk the
//! segment space backward from the cluster's current position, classify the
//! gaps, and roll the runs up into a report.

pub mod scan;
pub mod segment_runner;
pub mod show;

use std::collections::HashSet;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use utils::lsn::Lsn;
use utils::wal_segment::{TimeLineID, XLogFileName, XLogSegNo};

use crate::backup::catalog::{BackupCatalog, CatalogError};
use crate::backup::sentinel::wal_file_of_backup_name;
use crate::walarchive::{ArchiveError, WalFolder};
use crate::walfile::timeline_switch_map;
use self::scan::{scan_storage, ScannedSegmentDescription, ScannedSegmentStatus};
use self::segment_runner::WalSegmentRunner;

/// One WAL segment, as the verifier sees it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct WalSegmentDescription {
    pub number: XLogSegNo,
    pub timeline: TimeLineID,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "WARNING")]
    Warning,
    #[serde(rename = "FAILURE")]
    Failure,
}

/// A run of consecutive segments sharing a timeline and a status.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct WalIntegrityScanSegmentSequence {
    pub timeline_id: TimeLineID,
    pub start_segment: String,
    pub end_segment: String,
    pub segments_count: usize,
    pub status: ScannedSegmentStatus,
}

#[derive(Debug, Serialize)]
pub struct IntegrityCheckResult {
    pub status: CheckStatus,
    pub details: Vec<WalIntegrityScanSegmentSequence>,
}

#[derive(Debug, Serialize)]
pub struct TimelineCheckResult {
    pub status: CheckStatus,
    pub current_timeline_id: TimeLineID,
    pub highest_storage_timeline_id: TimeLineID,
}

#[derive(Debug, Serialize)]
pub struct WalVerifyReport {
    pub integrity: IntegrityCheckResult,
    pub timeline: TimelineCheckResult,
}

/// Group scanned segments into runs and roll their statuses up.
pub fn verify_wal_integrity(
    scanned: &[ScannedSegmentDescription],
    wal_seg_size: usize,
) -> IntegrityCheckResult {
    // the scan walks newest to oldest; report in chronological order
    let mut ascending: Vec<&ScannedSegmentDescription> = scanned.iter().collect();
    ascending.reverse();

    let mut details: Vec<WalIntegrityScanSegmentSequence> = Vec::new();
    for description in ascending {
        let segment_name = XLogFileName(
            description.segment.timeline,
            description.segment.number,
            wal_seg_size,
        );
        match details.last_mut() {
            Some(run)
                if run.timeline_id == description.segment.timeline
                    && run.status == description.status =>
            {
                run.end_segment = segment_name;
                run.segments_count += 1;
            }
            _ => details.push(WalIntegrityScanSegmentSequence {
                timeline_id: description.segment.timeline,
                start_segment: segment_name.clone(),
                end_segment: segment_name,
                segments_count: 1,
                status: description.status,
            }),
        }
    }

    let status = if scanned
        .iter()
        .any(|s| s.status == ScannedSegmentStatus::Lost)
    {
        CheckStatus::Failure
    } else if scanned.iter().any(|s| {
        matches!(
            s.status,
            ScannedSegmentStatus::ProbablyDelayed | ScannedSegmentStatus::ProbablyUploading
        )
    }) {
        CheckStatus::Warning
    } else {
        CheckStatus::Ok
    };

    IntegrityCheckResult { status, details }
}

/// Compare the cluster's current timeline with the highest timeline the
/// storage has segments for.
pub fn verify_timeline(
    current_timeline: TimeLineID,
    highest_storage_timeline: TimeLineID,
) -> TimelineCheckResult {
    let status = if highest_storage_timeline == 0 {
        // empty or unreadable storage: nothing to compare against
        CheckStatus::Warning
    } else if highest_storage_timeline == current_timeline {
        CheckStatus::Ok
    } else if highest_storage_timeline > current_timeline {
        CheckStatus::Failure
    } else {
        CheckStatus::Warning
    };
    TimelineCheckResult {
        status,
        current_timeline_id: current_timeline,
        highest_storage_timeline_id: highest_storage_timeline,
    }
}

/// The stop floor of the integrity scan: WAL older than the earliest
/// backup's start segment is not needed for any restore.
pub async fn earliest_backup_segment(
    catalog: &BackupCatalog<'_>,
    wal_seg_size: usize,
    cancel: &CancellationToken,
) -> Result<Option<XLogSegNo>, CatalogError> {
    let names = catalog.list_backup_names(cancel).await?;
    Ok(names
        .iter()
        .filter_map(|name| wal_file_of_backup_name(name))
        .filter_map(|wal_file| {
            utils::wal_segment::XLogFromFileName(wal_file, wal_seg_size).map(|(_, segno)| segno)
        })
        .min())
}

/// Run both checks against the archive.
pub async fn wal_verify(
    wal_folder: &WalFolder,
    current_lsn: Lsn,
    current_timeline: TimeLineID,
    earliest_backup_segno: Option<XLogSegNo>,
    max_upload_concurrency: usize,
    wal_seg_size: usize,
    cancel: &CancellationToken,
) -> Result<WalVerifyReport, ArchiveError> {
    let listing = wal_folder.list(cancel).await?;
    let present: HashSet<WalSegmentDescription> = listing
        .segments
        .iter()
        .map(|&(timeline, number)| WalSegmentDescription { number, timeline })
        .collect();
    let highest_storage_timeline = listing
        .segments
        .iter()
        .map(|&(timeline, _)| timeline)
        .max()
        .unwrap_or(0);

    let switch_map = match wal_folder.fetch_history(current_timeline, cancel).await? {
        Some(records) => timeline_switch_map(&records, wal_seg_size),
        None => Default::default(),
    };

    let start = WalSegmentDescription {
        number: current_lsn.segment_number(wal_seg_size),
        timeline: current_timeline,
    };
    let stop_segment_no = earliest_backup_segno
        .map(|segno| segno.saturating_sub(1))
        .unwrap_or(0);
    info!(
        "verifying WAL storage from {} down to segment {stop_segment_no}",
        XLogFileName(start.timeline, start.number, wal_seg_size)
    );

    let runner = WalSegmentRunner::new(start, present, stop_segment_no, switch_map);
    let scanned = scan_storage(runner, max_upload_concurrency);

    Ok(WalVerifyReport {
        integrity: verify_wal_integrity(&scanned, wal_seg_size),
        timeline: verify_timeline(current_timeline, highest_storage_timeline),
    })
}
