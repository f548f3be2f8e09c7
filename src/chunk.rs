//! Chunked zlib container that wraps the save body.
//!
//! Each chunk record is
//!   - magic `0x9E2A83C1`, archive tag `0x22222222`, a zero byte
//!   - max chunk size (u32), compressor tag `0x03000000`
//!   - compressed / uncompressed sizes (u64 each), written twice
//!   - `compressed` bytes of zlib data
//!
//! Chunks run until end of file. Their contents are independent, so both
//! directions fan out over rayon once the boundaries are known.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::debug;
use rayon::prelude::*;
use std::io::{Read, Write};

use crate::cursor::{ByteReader, ByteWriter};
use crate::error::{Result, SavError};

pub const CHUNK_MAGIC: u32 = 0x9E2A_83C1;
pub const ARCHIVE_TAG: u32 = 0x2222_2222;
pub const COMPRESSOR_TAG: u32 = 0x0300_0000;
pub const DEFAULT_MAX_CHUNK_SIZE: u32 = 128 * 1024;

/// Bytes taken by one chunk record before its payload.
pub const CHUNK_HEADER_LEN: usize = 4 + 4 + 1 + 4 + 4 + 8 * 4;

struct PendingChunk<'a> {
    offset: u64,
    payload: &'a [u8],
    uncompressed_len: u64,
}

/// Inflate every chunk in `data` into one logical buffer.
///
/// `base` is the file offset `data` starts at, for error reporting. Returns
/// the buffer plus the max chunk size declared by the first chunk.
pub fn decompress_chunks(data: &[u8], base: u64) -> Result<(Vec<u8>, Option<u32>)> {
    let mut r = ByteReader::with_base(data, base);
    let mut pending = Vec::new();
    let mut max_chunk_size = None;

    while !r.is_empty() {
        let offset = r.offset();
        let magic = r.read_u32()?;
        if magic != CHUNK_MAGIC {
            return Err(SavError::BadMagicNumber {
                offset,
                expected: CHUNK_MAGIC,
                found: magic,
            });
        }
        let tag_offset = r.offset();
        let tag = r.read_u32()?;
        if tag != ARCHIVE_TAG {
            return Err(SavError::BadMagicNumber {
                offset: tag_offset,
                expected: ARCHIVE_TAG,
                found: tag,
            });
        }
        let pad_offset = r.offset();
        let pad = r.read_u8()?;
        if pad != 0 {
            return Err(SavError::malformed(pad_offset, format!("chunk pad byte {pad}")));
        }
        let declared_max = r.read_u32()?;
        max_chunk_size.get_or_insert(declared_max);
        let compressor_offset = r.offset();
        let compressor = r.read_u32()?;
        if compressor != COMPRESSOR_TAG {
            return Err(SavError::BadMagicNumber {
                offset: compressor_offset,
                expected: COMPRESSOR_TAG,
                found: compressor,
            });
        }

        let sizes_offset = r.offset();
        let compressed = r.read_u64()?;
        let uncompressed = r.read_u64()?;
        let compressed_dup = r.read_u64()?;
        let uncompressed_dup = r.read_u64()?;
        if compressed != compressed_dup {
            return Err(SavError::ChunkSizeMismatch {
                offset: sizes_offset,
                declared: compressed,
                actual: compressed_dup,
            });
        }
        if uncompressed != uncompressed_dup {
            return Err(SavError::ChunkSizeMismatch {
                offset: sizes_offset + 8,
                declared: uncompressed,
                actual: uncompressed_dup,
            });
        }
        if uncompressed > declared_max as u64 {
            return Err(SavError::ChunkSizeMismatch {
                offset: sizes_offset + 8,
                declared: declared_max as u64,
                actual: uncompressed,
            });
        }

        let payload_offset = r.offset();
        let len = usize::try_from(compressed).map_err(|_| SavError::TruncatedData {
            offset: payload_offset,
            needed: usize::MAX,
            available: r.remaining(),
        })?;
        let payload = r.read_bytes(len)?;
        pending.push(PendingChunk {
            offset: payload_offset,
            payload,
            uncompressed_len: uncompressed,
        });
    }

    debug!("inflating {} chunks", pending.len());

    let parts: Vec<Vec<u8>> = pending
        .par_iter()
        .map(inflate_chunk)
        .collect::<Result<_>>()?;

    let total = parts.iter().map(Vec::len).sum();
    let mut logical = Vec::with_capacity(total);
    for part in parts {
        logical.extend_from_slice(&part);
    }
    Ok((logical, max_chunk_size))
}

/// `uncompressed_len` is already bounded by the declared max chunk size. One
/// extra byte is read so an overlong stream shows up as a size mismatch.
fn inflate_chunk(chunk: &PendingChunk<'_>) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(chunk.uncompressed_len as usize);
    ZlibDecoder::new(chunk.payload)
        .take(chunk.uncompressed_len + 1)
        .read_to_end(&mut out)
        .map_err(|e| SavError::malformed(chunk.offset, format!("zlib inflate: {e}")))?;
    if out.len() as u64 != chunk.uncompressed_len {
        return Err(SavError::ChunkSizeMismatch {
            offset: chunk.offset,
            declared: chunk.uncompressed_len,
            actual: out.len() as u64,
        });
    }
    Ok(out)
}

/// Split `logical` into chunks of at most `max_chunk_size` bytes, compress
/// each and emit the chunk records. An empty buffer produces no chunks.
pub fn compress_chunks(logical: &[u8], max_chunk_size: u32, level: Compression) -> Result<Vec<u8>> {
    if max_chunk_size == 0 {
        return Err(SavError::malformed(0, "max chunk size must be positive"));
    }
    let step = max_chunk_size as usize;

    let compressed: Vec<(usize, Vec<u8>)> = logical
        .par_chunks(step)
        .map(|part| -> Result<(usize, Vec<u8>)> {
            let mut enc = ZlibEncoder::new(Vec::with_capacity(part.len() / 2), level);
            enc.write_all(part)?;
            Ok((part.len(), enc.finish()?))
        })
        .collect::<Result<_>>()?;

    debug!("deflated {} bytes into {} chunks", logical.len(), compressed.len());

    let payload_total: usize = compressed.iter().map(|(_, c)| c.len()).sum();
    let mut w = ByteWriter::with_capacity(payload_total + compressed.len() * CHUNK_HEADER_LEN);
    for (raw_len, packed) in &compressed {
        w.write_u32(CHUNK_MAGIC)?;
        w.write_u32(ARCHIVE_TAG)?;
        w.write_u8(0)?;
        w.write_u32(max_chunk_size)?;
        w.write_u32(COMPRESSOR_TAG)?;
        for _ in 0..2 {
            w.write_u64(packed.len() as u64)?;
            w.write_u64(*raw_len as u64)?;
        }
        w.write_bytes(packed)?;
    }
    Ok(w.into_inner())
}
