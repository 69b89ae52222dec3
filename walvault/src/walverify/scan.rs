//! The three-phase scan over the segment space.
//!
//! Walking backward from the cluster's current position:
//!
//! 1. unlimited, until the first segment found in storage — gaps here are
//!    young WAL that may simply not have been archived yet
//!    (`ProbablyDelayed`);
//! 2. exactly `max_upload_concurrency` further segments — gaps here may be
//!    uploads still in flight (`ProbablyUploading`);
//! 3. unlimited, down to the stop segment — anything missing this deep is
//!    `Lost`.

use serde::Serialize;

use super::segment_runner::{SegmentRunnerError, WalSegmentRunner};
use super::WalSegmentDescription;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub enum ScannedSegmentStatus {
    Found,
    ProbablyUploading,
    ProbablyDelayed,
    Lost,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ScannedSegmentDescription {
    pub segment: WalSegmentDescription,
    pub status: ScannedSegmentStatus,
}

struct SegmentScanConfig {
    unlimited_scan: bool,
    scan_segments_limit: usize,
    stop_on_first_found_segment: bool,
    missing_segment_status: ScannedSegmentStatus,
}

/// Run the three phases and return every scanned segment, newest first.
/// Deterministic for a given storage state: scanning twice yields identical
/// reports.
pub fn scan_storage(
    mut runner: WalSegmentRunner,
    max_upload_concurrency: usize,
) -> Vec<ScannedSegmentDescription> {
    let mut scanned = Vec::new();

    let reached_stop = scan(
        &mut runner,
        &mut scanned,
        SegmentScanConfig {
            unlimited_scan: true,
            scan_segments_limit: 0,
            stop_on_first_found_segment: true,
            missing_segment_status: ScannedSegmentStatus::ProbablyDelayed,
        },
    );
    if reached_stop {
        return scanned;
    }

    let reached_stop = scan(
        &mut runner,
        &mut scanned,
        SegmentScanConfig {
            unlimited_scan: false,
            scan_segments_limit: max_upload_concurrency,
            stop_on_first_found_segment: false,
            missing_segment_status: ScannedSegmentStatus::ProbablyUploading,
        },
    );
    if reached_stop {
        return scanned;
    }

    scan(
        &mut runner,
        &mut scanned,
        SegmentScanConfig {
            unlimited_scan: true,
            scan_segments_limit: 0,
            stop_on_first_found_segment: false,
            missing_segment_status: ScannedSegmentStatus::Lost,
        },
    );
    scanned
}

/// One phase. Returns true when the runner hit the stop segment and the
/// whole scan is over.
fn scan(
    runner: &mut WalSegmentRunner,
    scanned: &mut Vec<ScannedSegmentDescription>,
    config: SegmentScanConfig,
) -> bool {
    let mut scanned_count = 0usize;
    loop {
        if !config.unlimited_scan && scanned_count >= config.scan_segments_limit {
            return false;
        }
        match runner.next() {
            Ok(segment) => {
                scanned.push(ScannedSegmentDescription {
                    segment,
                    status: ScannedSegmentStatus::Found,
                });
                if config.stop_on_first_found_segment {
                    return false;
                }
            }
            Err(SegmentRunnerError::ReachedStopSegment) => return true,
            Err(SegmentRunnerError::WalSegmentNotFound(segment)) => {
                scanned.push(ScannedSegmentDescription {
                    segment,
                    status: config.missing_segment_status,
                });
                runner.force_move_next();
            }
        }
        scanned_count += 1;
    }
}
