//! `wal-show`: a per-timeline overview of the archived segment space.

use std::collections::BTreeMap;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use utils::lsn::Lsn;
use utils::wal_segment::{TimeLineID, XLogFileName, XLogSegNo};

use super::CheckStatus;
use crate::walarchive::{ArchiveError, WalFolder};

#[derive(Debug, Serialize)]
pub struct TimelineInfo {
    pub id: TimeLineID,
    /// Direct parent per the timeline's history file, when the archive has
    /// one.
    pub parent_id: Option<TimeLineID>,
    pub switch_point_lsn: Option<Lsn>,
    pub start_segment: String,
    pub end_segment: String,
    pub segments_count: usize,
    pub missing_segments_count: usize,
    pub status: CheckStatus,
}

/// Group every archived segment by timeline and describe each timeline's
/// segment range, holes included.
pub async fn wal_show(
    wal_folder: &WalFolder,
    wal_seg_size: usize,
    cancel: &CancellationToken,
) -> Result<Vec<TimelineInfo>, ArchiveError> {
    let listing = wal_folder.list(cancel).await?;

    let mut segments_by_timeline: BTreeMap<TimeLineID, Vec<XLogSegNo>> = BTreeMap::new();
    for (timeline, number) in listing.segments {
        segments_by_timeline.entry(timeline).or_default().push(number);
    }

    let mut timelines = Vec::new();
    for (timeline, numbers) in segments_by_timeline {
        let start = *numbers.iter().min().expect("group is nonempty");
        let end = *numbers.iter().max().expect("group is nonempty");
        let range_size = (end - start + 1) as usize;
        let missing = range_size - numbers.len();

        // the last history record names the direct parent
        let ancestry = wal_folder.fetch_history(timeline, cancel).await?;
        let direct_parent = ancestry.as_ref().and_then(|records| records.last().cloned());

        timelines.push(TimelineInfo {
            id: timeline,
            parent_id: direct_parent.as_ref().map(|record| record.timeline),
            switch_point_lsn: direct_parent.as_ref().map(|record| record.switch_lsn),
            start_segment: XLogFileName(timeline, start, wal_seg_size),
            end_segment: XLogFileName(timeline, end, wal_seg_size),
            segments_count: numbers.len(),
            missing_segments_count: missing,
            status: if missing == 0 {
                CheckStatus::Ok
            } else {
                CheckStatus::Warning
            },
        });
    }
    Ok(timelines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::Compression;
    use crate::crypto::NoCrypter;
    use remote_storage::{GenericRemoteStorage, LocalFs};
    use std::sync::Arc;
    use utils::wal_segment::WAL_SEGMENT_SIZE;

    #[tokio::test]
    async fn groups_segments_by_timeline_and_counts_holes() {
        let dir = camino_tempfile::tempdir().unwrap();
        let storage = LocalFs::new(dir.path().to_path_buf()).unwrap();
        let folder = WalFolder::new(GenericRemoteStorage::LocalFs(storage), Arc::new(NoCrypter));
        let cancel = CancellationToken::new();

        for (timeline, number) in [(1u32, 1u64), (1, 2), (1, 4), (2, 5), (2, 6)] {
            folder
                .upload_object(
                    Compression::Gzip,
                    &XLogFileName(timeline, number, WAL_SEGMENT_SIZE),
                    Box::pin(std::io::Cursor::new(b"wal".to_vec())),
                    &cancel,
                )
                .await
                .unwrap();
        }
        folder
            .upload_object(
                Compression::Gzip,
                "00000002.history",
                Box::pin(std::io::Cursor::new(b"1\t0/5000028\tfork\n".to_vec())),
                &cancel,
            )
            .await
            .unwrap();

        let timelines = wal_show(&folder, WAL_SEGMENT_SIZE, &cancel).await.unwrap();
        assert_eq!(timelines.len(), 2);

        let first = &timelines[0];
        assert_eq!(first.id, 1);
        assert_eq!(first.segments_count, 3);
        assert_eq!(first.missing_segments_count, 1, "segment 3 is a hole");
        assert_eq!(first.status, CheckStatus::Warning);
        assert_eq!(first.parent_id, None);

        let second = &timelines[1];
        assert_eq!(second.id, 2);
        assert_eq!(second.segments_count, 2);
        assert_eq!(second.missing_segments_count, 0);
        assert_eq!(second.status, CheckStatus::Ok);
        assert_eq!(second.parent_id, Some(1));
        assert_eq!(second.switch_point_lsn, Some(Lsn(0x5000028)));
    }
}
