#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A Postgres LSN (Log Sequence Number), also known as an XLogRecPtr.
///
/// The engine only ever handles LSNs at segment granularity: compare them,
/// map them onto segment numbers, and carry them through sentinels and
/// logs. On the wire an `Lsn` is a plain integer.
#[derive(
    Clone, Copy, Default, Eq, Ord, PartialEq, PartialOrd, Hash, Serialize, Deserialize, Debug,
)]
#[serde(transparent)]
pub struct Lsn(pub u64);

impl Lsn {
    /// Compute the segment number
    #[inline]
    pub fn segment_number(self, seg_sz: usize) -> u64 {
        self.0 / seg_sz as u64
    }
}

impl FromStr for Lsn {
    type Err = LsnParseError;

    /// Parse an LSN from a string in the form `00000000/00000000`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut splitter = s.trim().split('/');
        if let (Some(left), Some(right), None) = (splitter.next(), splitter.next(), splitter.next())
        {
            let left_num = u32::from_str_radix(left, 16).map_err(|_| LsnParseError)?;
            let right_num = u32::from_str_radix(right, 16).map_err(|_| LsnParseError)?;
            Ok(Lsn(((left_num as u64) << 32) | right_num as u64))
        } else {
            Err(LsnParseError)
        }
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xffffffff)
    }
}

/// An [`Lsn`] string could not be parsed.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct LsnParseError;

impl fmt::Display for LsnParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("invalid LSN")
    }
}

impl std::error::Error for LsnParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_strings() {
        assert_eq!("12345678/AAAA5555".parse(), Ok(Lsn(0x12345678AAAA5555)));
        assert_eq!("aaaa/bbbb".parse(), Ok(Lsn(0x0000AAAA0000BBBB)));
        assert_eq!("1/A".parse(), Ok(Lsn(0x000000010000000A)));
        assert_eq!("0/0".parse(), Ok(Lsn(0)));
        "ABCDEFG/12345678".parse::<Lsn>().unwrap_err();
        "123456789/AAAA5555".parse::<Lsn>().unwrap_err();
        "12345678/AAAA55550".parse::<Lsn>().unwrap_err();
        "-1/0".parse::<Lsn>().unwrap_err();
        "1/-1".parse::<Lsn>().unwrap_err();

        assert_eq!(format!("{}", Lsn(0x12345678AAAA5555)), "12345678/AAAA5555");
        assert_eq!(format!("{}", Lsn(0x000000010000000A)), "1/A");
    }

    #[test]
    fn test_segment_number() {
        let seg_sz: usize = 16 * 1024 * 1024;
        assert_eq!(Lsn(0x1000007).segment_number(seg_sz), 1u64);
        assert_eq!(Lsn(0xffffff).segment_number(seg_sz), 0u64);
        assert_eq!(Lsn(0x0000_0001_0100_0028).segment_number(seg_sz), 0x101);
    }

    #[test]
    fn test_lsn_serde() {
        // transparent: an Lsn is a plain integer on the wire
        let lsn = Lsn(0x12345678AAAA5555);
        let json = serde_json::to_string(&lsn).unwrap();
        assert_eq!(json, lsn.0.to_string());
        let des: Lsn = serde_json::from_str(&json).unwrap();
        assert_eq!(des, lsn);
    }
}
