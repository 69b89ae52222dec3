//! Walking the WAL segment chain backward through storage listings.

use std::collections::{HashMap, HashSet};

use utils::wal_segment::XLogSegNo;

use super::WalSegmentDescription;
use crate::walfile::TimelineHistoryRecord;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SegmentRunnerError {
    #[error("reached the stop segment")]
    ReachedStopSegment,

    #[error("segment {0:?} is not present in storage")]
    WalSegmentNotFound(WalSegmentDescription),
}

/// Yields logical predecessor segments in reverse chronological order,
/// dropping to the parent timeline at the switch points the history file
/// records. Stops at the floor: a segment with number `<= stop_segment_no`
/// is never returned.
pub struct WalSegmentRunner {
    current: WalSegmentDescription,
    stop_segment_no: XLogSegNo,
    present: HashSet<WalSegmentDescription>,
    timeline_switch_map: HashMap<XLogSegNo, TimelineHistoryRecord>,
}

impl WalSegmentRunner {
    pub fn new(
        start: WalSegmentDescription,
        present: HashSet<WalSegmentDescription>,
        stop_segment_no: XLogSegNo,
        timeline_switch_map: HashMap<XLogSegNo, TimelineHistoryRecord>,
    ) -> Self {
        WalSegmentRunner {
            current: start,
            stop_segment_no,
            present,
            timeline_switch_map,
        }
    }

    pub fn current(&self) -> WalSegmentDescription {
        self.current
    }

    /// Step to the predecessor if it is present in storage. On
    /// [`SegmentRunnerError::WalSegmentNotFound`] the runner stays put, so
    /// the caller can record the gap and [`WalSegmentRunner::force_move_next`].
    pub fn next(&mut self) -> Result<WalSegmentDescription, SegmentRunnerError> {
        if self.current.number <= self.stop_segment_no + 1 {
            return Err(SegmentRunnerError::ReachedStopSegment);
        }
        let next = self.predecessor();
        if !self.present.contains(&next) {
            return Err(SegmentRunnerError::WalSegmentNotFound(next));
        }
        self.current = next;
        Ok(next)
    }

    /// Step to the predecessor regardless of its presence.
    pub fn force_move_next(&mut self) -> WalSegmentDescription {
        let next = self.predecessor();
        self.current = next;
        next
    }

    fn predecessor(&self) -> WalSegmentDescription {
        // the switch point is the first segment of the younger timeline:
        // everything before it lives on the parent
        let timeline = match self.timeline_switch_map.get(&self.current.number) {
            Some(record) => record.timeline,
            None => self.current.timeline,
        };
        WalSegmentDescription {
            number: self.current.number - 1,
            timeline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use utils::lsn::Lsn;

    fn seg(timeline: u32, number: XLogSegNo) -> WalSegmentDescription {
        WalSegmentDescription { number, timeline }
    }

    #[test]
    fn walks_backward_over_present_segments() {
        let present: HashSet<_> = (1..=4).map(|n| seg(5, n)).collect();
        let mut runner = WalSegmentRunner::new(seg(5, 5), present, 0, HashMap::new());

        assert_eq!(runner.next(), Ok(seg(5, 4)));
        assert_eq!(runner.next(), Ok(seg(5, 3)));
        assert_eq!(runner.next(), Ok(seg(5, 2)));
        assert_eq!(runner.next(), Ok(seg(5, 1)));
        assert_eq!(runner.next(), Err(SegmentRunnerError::ReachedStopSegment));
    }

    #[test]
    fn reports_missing_and_can_be_forced_past() {
        let present: HashSet<_> = [seg(1, 1)].into();
        let mut runner = WalSegmentRunner::new(seg(1, 3), present, 0, HashMap::new());

        assert_eq!(
            runner.next(),
            Err(SegmentRunnerError::WalSegmentNotFound(seg(1, 2)))
        );
        // not advanced by the failed step
        assert_eq!(runner.current(), seg(1, 3));
        assert_eq!(runner.force_move_next(), seg(1, 2));
        assert_eq!(runner.next(), Ok(seg(1, 1)));
    }

    #[test]
    fn never_returns_a_segment_at_or_below_the_stop() {
        let present: HashSet<_> = (1..=9).map(|n| seg(1, n)).collect();
        let mut runner = WalSegmentRunner::new(seg(1, 10), present, 4, HashMap::new());

        let mut yielded = Vec::new();
        while let Ok(segment) = runner.next() {
            yielded.push(segment.number);
        }
        assert_eq!(yielded, vec![9, 8, 7, 6, 5]);
    }

    #[test]
    fn drops_to_the_parent_timeline_at_the_switch_point() {
        // timeline 2 starts inside segment 5: segment 4 belongs to timeline 1
        let switch_map = HashMap::from([(
            5,
            TimelineHistoryRecord {
                timeline: 1,
                switch_lsn: Lsn(5 * 16 * 1024 * 1024 + 0x138),
                comment: String::new(),
            },
        )]);
        let present: HashSet<_> = [seg(2, 5), seg(1, 4), seg(1, 3)].into();
        let mut runner = WalSegmentRunner::new(seg(2, 6), present, 0, switch_map);

        assert_eq!(runner.next(), Ok(seg(2, 5)));
        assert_eq!(runner.next(), Ok(seg(1, 4)));
        assert_eq!(runner.next(), Ok(seg(1, 3)));
    }
}
