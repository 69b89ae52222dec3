//! Compression codecs behind a single tagged type.
//!
//! The engine compresses every data object it uploads (tar partitions, WAL
//! segments, delta files) and must be able to read archives written with any
//! codec it knows, regardless of the currently configured one: the codec in
//! use may change between the backup and the restore.

use std::pin::Pin;

use async_compression::tokio::bufread::{GzipDecoder, GzipEncoder, ZstdDecoder, ZstdEncoder};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, BufReader};

/// A compression codec, selected once per run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    Gzip,
    Zstd,
}

/// Decompressors in the order `wal-fetch` tries them.
pub const ALL_COMPRESSIONS: [Compression; 2] = [Compression::Gzip, Compression::Zstd];

impl Compression {
    /// File extension appended to object names, e.g. `part_001.tar.gz`.
    pub fn extension(&self) -> &'static str {
        match self {
            Compression::Gzip => "gz",
            Compression::Zstd => "zst",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "gz" => Some(Compression::Gzip),
            "zst" => Some(Compression::Zstd),
            _ => None,
        }
    }

    /// Parse a configured codec name.
    pub fn from_config_name(name: &str) -> Option<Self> {
        match name {
            "gzip" | "gz" => Some(Compression::Gzip),
            "zstd" | "zst" => Some(Compression::Zstd),
            _ => None,
        }
    }

    /// Wrap a raw byte stream into its compressed form.
    pub fn compress<'a, R>(&self, reader: R) -> Pin<Box<dyn AsyncRead + Send + 'a>>
    where
        R: AsyncRead + Send + 'a,
    {
        let buffered = BufReader::new(Box::pin(reader));
        match self {
            Compression::Gzip => Box::pin(GzipEncoder::new(buffered)),
            Compression::Zstd => Box::pin(ZstdEncoder::new(buffered)),
        }
    }

    /// Wrap a compressed byte stream back into raw bytes.
    pub fn decompress<'a, R>(&self, reader: R) -> Pin<Box<dyn AsyncRead + Send + 'a>>
    where
        R: AsyncRead + Send + 'a,
    {
        let buffered = BufReader::new(Box::pin(reader));
        match self {
            Compression::Gzip => {
                let mut decoder = GzipDecoder::new(buffered);
                decoder.multiple_members(true);
                Box::pin(decoder)
            }
            Compression::Zstd => {
                let mut decoder = ZstdDecoder::new(buffered);
                decoder.multiple_members(true);
                Box::pin(decoder)
            }
        }
    }
}
