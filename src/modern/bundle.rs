//! # Bundle Trailer
//!
//! A bundle is its chunks' compressed payloads packed end-to-end, followed by
//! a trailer describing them. The final 16 bytes are the footer — bundle id,
//! chunk count and the magic `RBUN` — preceded by one 16-byte record per
//! chunk in payload order.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::common::QuarryResult;
use crate::ensure;

const FOOTER_SIZE: usize = 16;
const RECORD_SIZE: usize = 16;

#[derive(Debug, PartialEq, Eq)]
pub struct TrailerChunk {
    pub id: u64,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
}

/// Parsed trailer of one bundle.
#[derive(Debug)]
pub struct Trailer {
    pub id: u64,
    pub chunks: Vec<TrailerChunk>,
}

impl Trailer {
    /// Parses the trailer from the last bytes of `data`.
    pub fn read(data: &[u8]) -> QuarryResult<Self> {
        ensure!(
            data.len() >= FOOTER_SIZE,
            "bundle of {} bytes cannot hold a trailer",
            data.len()
        );
        let footer = &data[data.len() - FOOTER_SIZE..];
        ensure!(&footer[12..16] == b"RBUN", "bundle trailer magic mismatch");
        let mut cursor = Cursor::new(footer);
        let id = cursor.read_u64::<LittleEndian>()?;
        let count = cursor.read_u32::<LittleEndian>()? as usize;

        let records_size = count * RECORD_SIZE;
        ensure!(
            data.len() >= FOOTER_SIZE + records_size,
            "bundle trailer of {} chunks truncated",
            count
        );
        let records = &data[data.len() - FOOTER_SIZE - records_size..data.len() - FOOTER_SIZE];
        let mut cursor = Cursor::new(records);
        let mut chunks = Vec::with_capacity(count);
        for _ in 0..count {
            chunks.push(TrailerChunk {
                id: cursor.read_u64::<LittleEndian>()?,
                compressed_size: cursor.read_u32::<LittleEndian>()?,
                uncompressed_size: cursor.read_u32::<LittleEndian>()?,
            });
        }
        Ok(Self { id, chunks })
    }

    /// Total size of the serialised trailer.
    pub fn len(&self) -> usize {
        self.chunks.len() * RECORD_SIZE + FOOTER_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Serialises a trailer; the inverse of [`Trailer::read`], used when tests
/// synthesise bundles.
pub fn write_trailer(id: u64, chunks: &[TrailerChunk]) -> Vec<u8> {
    let mut out = Vec::with_capacity(chunks.len() * RECORD_SIZE + FOOTER_SIZE);
    for chunk in chunks {
        out.extend_from_slice(&chunk.id.to_le_bytes());
        out.extend_from_slice(&chunk.compressed_size.to_le_bytes());
        out.extend_from_slice(&chunk.uncompressed_size.to_le_bytes());
    }
    out.extend_from_slice(&id.to_le_bytes());
    out.extend_from_slice(&(chunks.len() as u32).to_le_bytes());
    out.extend_from_slice(b"RBUN");
    out
}
