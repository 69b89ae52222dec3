//! Reading and writing paged relation files and the binary page-increment
//! format.
//!
//! A paged file is a relation segment under `base/` or `pg_tblspc/`: a
//! sequence of 8 KiB blocks, each carrying its own LSN in the first 8 bytes
//! of a 24-byte header. An increment holds only the blocks that changed
//! since a base LSN:
//!
//! ```text
//! +------+--------------+-------------+------------------+- - - - - - -+
//! | wi1U | file size u64| count N u32 | N x block no u32 | N x 8 KiB   |
//! +------+--------------+-------------+------------------+- - - - - - -+
//! ```
//!
//! All integers are little-endian. The third magic byte is the format
//! version: a valid signature with an unexpected version is reported
//! separately from a broken signature, so that newer-format archives fail
//! with a recognizable error.

use std::io::SeekFrom;
use std::pin::Pin;

use bytes::Bytes;
use camino::Utf8Path;
use once_cell::sync::Lazy;
use regex::Regex;
use roaring::RoaringBitmap;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::io::StreamReader;
use utils::lsn::Lsn;

/// Database block size. Fixed at compile time, as in the server.
pub const BLCKSZ: usize = 8192;

/// Size of the block header that carries the page LSN.
pub const PAGE_HEADER_SIZE: usize = 24;

/// Blocks per 1 GiB relation segment file.
pub const RELSEG_BLOCKS: u32 = 131072;

/// First three increment magic bytes; the fourth is [`INCREMENT_SIGNATURE`].
const INCREMENT_MAGIC: [u8; 2] = *b"wi";
const INCREMENT_VERSION: u8 = b'1';
const INCREMENT_SIGNATURE: u8 = 0x55;

/// Fixed part of the increment layout: magic + file size + block count.
pub const INCREMENT_HEADER_SIZE: u64 = 4 + 8 + 4;

#[derive(thiserror::Error, Debug)]
pub enum PageFileError {
    #[error("invalid block header at block {block_no} of {path}")]
    InvalidBlock { path: String, block_no: u32 },

    #[error("unknown increment file header version {version:#04x}")]
    UnknownIncrementFileHeader { version: u8 },

    #[error("invalid increment file header {header:02x?}")]
    InvalidIncrementFileHeader { header: [u8; 4] },

    #[error("unexpected data after the last increment block")]
    UnexpectedTarData,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Parsed 24-byte block header.
///
/// Layout: pd_lsn (xlogid u32, xrecoff u32), pd_checksum u16, pd_flags u16,
/// pd_lower u16, pd_upper u16, pd_special u16, pd_pagesize_version u16,
/// pd_prune_xid u32.
#[derive(Debug, Clone, Copy)]
pub struct PageHeader {
    pub lsn: Lsn,
    pub checksum: u16,
    flags: u16,
    lower: u16,
    upper: u16,
    special: u16,
    pagesize_version: u16,
}

/// Valid pd_flags bits: PD_HAS_FREE_LINES | PD_PAGE_FULL | PD_ALL_VISIBLE.
const PD_VALID_FLAG_BITS: u16 = 0x0007;
/// BLCKSZ | current page layout version.
const PAGE_SIZE_VERSION: u16 = BLCKSZ as u16 | 4;

impl PageHeader {
    pub fn parse(block: &[u8]) -> PageHeader {
        let xlogid = u32::from_le_bytes(block[0..4].try_into().unwrap());
        let xrecoff = u32::from_le_bytes(block[4..8].try_into().unwrap());
        PageHeader {
            lsn: Lsn(((xlogid as u64) << 32) | xrecoff as u64),
            checksum: u16::from_le_bytes(block[8..10].try_into().unwrap()),
            flags: u16::from_le_bytes(block[10..12].try_into().unwrap()),
            lower: u16::from_le_bytes(block[12..14].try_into().unwrap()),
            upper: u16::from_le_bytes(block[14..16].try_into().unwrap()),
            special: u16::from_le_bytes(block[16..18].try_into().unwrap()),
            pagesize_version: u16::from_le_bytes(block[18..20].try_into().unwrap()),
        }
    }

    /// A never-initialized page: the whole header is zero.
    pub fn is_new(block: &[u8]) -> bool {
        block[..PAGE_HEADER_SIZE].iter().all(|&b| b == 0)
    }

    /// Sanity of the header fields. New (all-zero) pages are checked with
    /// [`PageHeader::is_new`] before this is consulted.
    pub fn is_valid(&self) -> bool {
        !(self.flags & !PD_VALID_FLAG_BITS != 0
            || (self.lower as usize) < PAGE_HEADER_SIZE
            || self.lower > self.upper
            || self.upper > self.special
            || self.special as usize > BLCKSZ
            || self.pagesize_version != PAGE_SIZE_VERSION)
    }
}

static PAGED_FILE_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+(\.\d+)?$").unwrap());

/// Whether the file at this archive-relative path is a candidate for
/// page-level incremental archival.
pub fn is_paged_file(archive_path: &Utf8Path, file_size: u64) -> bool {
    let in_paged_dir = archive_path.starts_with("base") || archive_path.starts_with("pg_tblspc");
    let name_matches = archive_path
        .file_name()
        .is_some_and(|name| PAGED_FILE_NAME_RE.is_match(name));
    in_paged_dir && name_matches && file_size > 0 && file_size % BLCKSZ as u64 == 0
}

/// Exact byte size of an increment holding `n_blocks` blocks.
pub fn predict_increment_size(n_blocks: u64) -> u64 {
    INCREMENT_HEADER_SIZE + 4 * n_blocks + (BLCKSZ as u64) * n_blocks
}

/// Scan a paged file and stream out its increment relative to `base_lsn`.
///
/// A block is selected when its page LSN exceeds `base_lsn` or when `bitmap`
/// marks it. The returned size is exact, so a tar header can be written
/// before the stream is consumed. The file is scanned twice: once for
/// selection, once for emission; pages torn between the passes are repaired
/// by WAL replay on restore, like any page torn by concurrent writes.
pub async fn read_increment(
    path: &Utf8Path,
    file_size: u64,
    base_lsn: Lsn,
    bitmap: Option<&RoaringBitmap>,
) -> Result<(Pin<Box<dyn AsyncRead + Send>>, u64), PageFileError> {
    let mut file = File::open(path).await?;
    let block_count = (file_size / BLCKSZ as u64) as u32;

    let mut selected: Vec<u32> = Vec::new();
    let mut block = vec![0u8; BLCKSZ];
    for block_no in 0..block_count {
        file.read_exact(&mut block).await?;
        let marked = bitmap.is_some_and(|b| b.contains(block_no));
        if PageHeader::is_new(&block) {
            if marked {
                selected.push(block_no);
            }
            continue;
        }
        let header = PageHeader::parse(&block);
        if !header.is_valid() {
            return Err(PageFileError::InvalidBlock {
                path: path.to_string(),
                block_no,
            });
        }
        if header.lsn > base_lsn || marked {
            selected.push(block_no);
        }
    }
    drop(file);

    let increment_size = predict_increment_size(selected.len() as u64);

    let mut prelude =
        Vec::with_capacity(INCREMENT_HEADER_SIZE as usize + 4 * selected.len());
    prelude.extend_from_slice(&INCREMENT_MAGIC);
    prelude.push(INCREMENT_VERSION);
    prelude.push(INCREMENT_SIGNATURE);
    prelude.extend_from_slice(&file_size.to_le_bytes());
    prelude.extend_from_slice(&(selected.len() as u32).to_le_bytes());
    for block_no in &selected {
        prelude.extend_from_slice(&block_no.to_le_bytes());
    }

    let path = path.to_path_buf();
    let stream = async_stream::try_stream! {
        yield Bytes::from(prelude);
        let mut file = File::open(&path).await?;
        let mut block = vec![0u8; BLCKSZ];
        for block_no in selected {
            file.seek(SeekFrom::Start(block_no as u64 * BLCKSZ as u64))
                .await?;
            file.read_exact(&mut block).await?;
            yield Bytes::copy_from_slice(&block);
        }
    };
    let reader: Pin<Box<dyn AsyncRead + Send>> =
        Box::pin(StreamReader::new(Box::pin(stream)
            as Pin<Box<dyn futures::Stream<Item = std::io::Result<Bytes>> + Send>>));
    Ok((reader, increment_size))
}

/// Parsed fixed header of an increment stream: `(file_size, block_count)`.
pub async fn read_increment_header<R>(reader: &mut R) -> Result<(u64, u32), PageFileError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).await?;
    if magic[0..2] != INCREMENT_MAGIC || magic[3] != INCREMENT_SIGNATURE {
        return Err(PageFileError::InvalidIncrementFileHeader { header: magic });
    }
    if magic[2] != INCREMENT_VERSION {
        return Err(PageFileError::UnknownIncrementFileHeader { version: magic[2] });
    }
    let file_size = reader.read_u64_le().await?;
    let block_count = reader.read_u32_le().await?;
    Ok((file_size, block_count))
}

async fn read_block_numbers<R>(reader: &mut R, count: u32) -> Result<Vec<u32>, PageFileError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut block_nos = Vec::with_capacity(count as usize);
    for _ in 0..count {
        block_nos.push(reader.read_u32_le().await?);
    }
    Ok(block_nos)
}

/// Materialize a file from its increment: marked blocks from the stream,
/// zeroes elsewhere. Fails with [`PageFileError::UnexpectedTarData`] if the
/// stream carries bytes past the last declared block.
pub async fn create_file_from_increment<R>(
    reader: &mut R,
    target: &Utf8Path,
) -> Result<u64, PageFileError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let (file_size, block_count) = read_increment_header(reader).await?;
    let block_nos = read_block_numbers(reader, block_count).await?;

    let mut file = File::create(target).await?;
    file.set_len(file_size).await?;
    let mut block = vec![0u8; BLCKSZ];
    for block_no in block_nos {
        reader.read_exact(&mut block).await?;
        file.seek(SeekFrom::Start(block_no as u64 * BLCKSZ as u64))
            .await?;
        file.write_all(&block).await?;
    }

    ensure_increment_drained(reader).await?;
    file.sync_all().await?;
    Ok(file_size)
}

/// Apply an increment on top of an existing target. Without `overwrite`,
/// only blocks whose current on-disk header is all zero are written; the
/// stream is fully consumed either way.
pub async fn write_pages_from_increment<R>(
    reader: &mut R,
    target: &Utf8Path,
    overwrite: bool,
) -> Result<u64, PageFileError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let (file_size, block_count) = read_increment_header(reader).await?;
    let block_nos = read_block_numbers(reader, block_count).await?;

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(target)
        .await?;
    let current_len = file.metadata().await?.len();
    if current_len < file_size {
        file.set_len(file_size).await?;
    }

    let mut incoming = vec![0u8; BLCKSZ];
    let mut existing_header = [0u8; PAGE_HEADER_SIZE];
    for block_no in block_nos {
        reader.read_exact(&mut incoming).await?;
        let offset = block_no as u64 * BLCKSZ as u64;
        let write_block = overwrite || {
            // Past the old end every page is missing; inside it, missing
            // means a zeroed header.
            if offset + PAGE_HEADER_SIZE as u64 <= current_len {
                file.seek(SeekFrom::Start(offset)).await?;
                file.read_exact(&mut existing_header).await?;
                existing_header.iter().all(|&b| b == 0)
            } else {
                true
            }
        };
        if write_block {
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(&incoming).await?;
        }
    }

    file.sync_all().await?;
    Ok(file_size)
}

/// Fill the zero-headed pages of `target` from a full base copy of the file.
///
/// The base reader streams the whole file in block order; it is allowed to
/// end early (truncated source), in which case the remaining target pages
/// are left as they are.
pub async fn restore_missing_pages<R>(
    base_reader: &mut R,
    target: &Utf8Path,
) -> Result<(), PageFileError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut file = OpenOptions::new().read(true).write(true).open(target).await?;
    let target_len = file.metadata().await?.len();

    let mut base_block = vec![0u8; BLCKSZ];
    let mut existing_header = [0u8; PAGE_HEADER_SIZE];
    let mut block_no: u64 = 0;
    loop {
        match read_full_block(base_reader, &mut base_block).await? {
            0 => break,
            n if n < BLCKSZ => break, // truncated base, tolerate
            _ => {}
        }
        let offset = block_no * BLCKSZ as u64;
        let missing = if offset + PAGE_HEADER_SIZE as u64 <= target_len {
            file.seek(SeekFrom::Start(offset)).await?;
            file.read_exact(&mut existing_header).await?;
            existing_header.iter().all(|&b| b == 0)
        } else {
            true
        };
        if missing {
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(&base_block).await?;
        }
        block_no += 1;
    }

    file.sync_all().await?;
    Ok(())
}

/// Read up to a full block, returning how many bytes were available.
async fn read_full_block<R>(reader: &mut R, block: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < block.len() {
        let n = reader.read(&mut block[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn ensure_increment_drained<R>(reader: &mut R) -> Result<(), PageFileError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut probe = [0u8; 1];
    if reader.read(&mut probe).await? != 0 {
        return Err(PageFileError::UnexpectedTarData);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Page checksums
// ---------------------------------------------------------------------------

const N_SUMS: usize = 32;
const FNV_PRIME: u32 = 16777619;

// Base offsets of the server's FNV-1a page checksum, one per lane.
const CHECKSUM_BASE_OFFSETS: [u32; N_SUMS] = [
    0x5B1F36E9, 0xB8525960, 0x02AB50AA, 0x1DE66D2A, 0x79FF467A, 0x9BB9F8A3, 0x217E7CD2, 0x83E13D2C,
    0xF8D4474F, 0xE39EB970, 0x42C6AE16, 0x993216FA, 0x7B093B5D, 0x98DAFF3C, 0xF718902A, 0x0B1C9CDB,
    0xE58F764B, 0x187636BC, 0x5D7B3BB1, 0xE73DE7DE, 0x92BEC979, 0xCCA6C0B2, 0x304A0979, 0x85AA43D4,
    0x783125BB, 0x6CA8EAA2, 0xE407EAC6, 0x4B5CFC3E, 0x9160BFB9, 0xA2268128, 0x422A02FC, 0x2C46E9A9,
];

#[inline]
fn checksum_comp(checksum: u32, value: u32) -> u32 {
    let tmp = checksum ^ value;
    tmp.wrapping_mul(FNV_PRIME) ^ (tmp >> 17)
}

fn checksum_block(block: &[u8]) -> u32 {
    debug_assert_eq!(block.len(), BLCKSZ);
    let mut sums = CHECKSUM_BASE_OFFSETS;
    let words_per_row = N_SUMS * 4;
    for row in block.chunks_exact(words_per_row) {
        for (j, word) in row.chunks_exact(4).enumerate() {
            let value = u32::from_le_bytes(word.try_into().unwrap());
            sums[j] = checksum_comp(sums[j], value);
        }
    }
    // two extra rounds of zeroes, matching the server
    for _ in 0..2 {
        for sum in sums.iter_mut() {
            *sum = checksum_comp(*sum, 0);
        }
    }
    sums.iter().fold(0, |acc, s| acc ^ s)
}

/// Compute the checksum of a page as the server would store it in
/// `pd_checksum`. `block_no` is the block's number within the whole
/// relation, not within the segment file.
pub fn checksum_page(block: &[u8], block_no: u32) -> u16 {
    // checksum is computed with the pd_checksum field itself zeroed
    let mut page = block.to_vec();
    page[8] = 0;
    page[9] = 0;
    let checksum = checksum_block(&page) ^ block_no;
    ((checksum % 65535) + 1) as u16
}

/// Whether a page passes checksum verification. New pages and pages written
/// by a cluster without checksums (stored checksum 0) are vacuously fine.
pub fn page_checksum_ok(block: &[u8], block_no: u32) -> bool {
    if PageHeader::is_new(block) {
        return true;
    }
    let header = PageHeader::parse(block);
    if header.checksum == 0 {
        return true;
    }
    header.checksum == checksum_page(block, block_no)
}
