//! `utils` is intended to be a place to put code that is shared
//! between other crates in this repository.

/// Helpers for backoff between retries of remote operations.
pub mod backoff;

/// Log sequence numbers.
pub mod lsn;

/// WAL segment numbering and canonical file names.
pub mod wal_segment;
