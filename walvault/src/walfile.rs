//! Timeline history files.
//!
//! A `.history` file for timeline T describes its ancestry: one line per
//! fork, `<parent_tli>\t<switch_lsn>\t<comment>`. The server writes these
//! files on promotion; the archive stores them next to the WAL segments and
//! the verifier uses them to walk segment chains across timeline switches.

use std::collections::HashMap;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use utils::lsn::Lsn;
use utils::wal_segment::{TimeLineID, XLogSegNo};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineHistoryRecord {
    /// The timeline that ends at `switch_lsn`.
    pub timeline: TimeLineID,
    pub switch_lsn: Lsn,
    pub comment: String,
}

#[derive(thiserror::Error, Debug)]
#[error("malformed timeline history line {line_no}: {line:?}")]
pub struct HistoryParseError {
    pub line_no: usize,
    pub line: String,
}

static HISTORY_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)\t([0-9A-Fa-f]+/[0-9A-Fa-f]+)\t(.*)$").unwrap());

/// Parse the contents of a `.history` file. Empty lines and `#` comments
/// are ignored, as the server's own parser does.
pub fn parse_history_file(content: &str) -> Result<Vec<TimelineHistoryRecord>, HistoryParseError> {
    let mut records = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        let trimmed = line.trim_end();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let captures =
            HISTORY_LINE_RE
                .captures(trimmed)
                .ok_or_else(|| HistoryParseError {
                    line_no: line_no + 1,
                    line: trimmed.to_string(),
                })?;
        let timeline = captures[1].parse().map_err(|_| HistoryParseError {
            line_no: line_no + 1,
            line: trimmed.to_string(),
        })?;
        let switch_lsn = Lsn::from_str(&captures[2]).map_err(|_| HistoryParseError {
            line_no: line_no + 1,
            line: trimmed.to_string(),
        })?;
        records.push(TimelineHistoryRecord {
            timeline,
            switch_lsn,
            comment: captures[3].to_string(),
        });
    }
    Ok(records)
}

/// Map each switch-point segment number to the history record of the
/// timeline that ends there. Walking backward through segments, hitting a
/// key of this map means the previous segment lives on `record.timeline`.
pub fn timeline_switch_map(
    records: &[TimelineHistoryRecord],
    wal_seg_size: usize,
) -> HashMap<XLogSegNo, TimelineHistoryRecord> {
    records
        .iter()
        .map(|record| (record.switch_lsn.segment_number(wal_seg_size), record.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use utils::wal_segment::WAL_SEGMENT_SIZE;

    #[test]
    fn parses_server_shaped_history() {
        let content = "\
# comment line

1\t0/3000000\tno recovery target specified
2\t0/5000138\tbefore 2000-01-01
";
        let records = parse_history_file(content).unwrap();
        assert_eq!(
            records,
            vec![
                TimelineHistoryRecord {
                    timeline: 1,
                    switch_lsn: Lsn(0x3000000),
                    comment: "no recovery target specified".to_string(),
                },
                TimelineHistoryRecord {
                    timeline: 2,
                    switch_lsn: Lsn(0x5000138),
                    comment: "before 2000-01-01".to_string(),
                },
            ]
        );
    }

    #[test]
    fn rejects_malformed_lines() {
        let err = parse_history_file("not a history line").unwrap_err();
        assert_eq!(err.line_no, 1);
        parse_history_file("1 0/3000000 space separated").unwrap_err();
    }

    #[test]
    fn switch_map_is_keyed_by_segment() {
        let records = parse_history_file("1\t0/3000000\t\n2\t0/5000138\t\n").unwrap();
        let map = timeline_switch_map(&records, WAL_SEGMENT_SIZE);
        assert_eq!(map[&3].timeline, 1);
        assert_eq!(map[&5].timeline, 2);
        assert_eq!(map.len(), 2);
    }
}
