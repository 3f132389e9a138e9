//! # Archive Table of Contents
//!
//! Archives open with a 2-byte `RW` magic and two version bytes. Three
//! header generations exist: version 1 carries the entry table geometry
//! directly, version 2 prefixes it with an 84-byte signature and an 8-byte
//! checksum, version 3 grows the signature to 256 bytes and fixes the table
//! at offset 272 with 32-byte entries. Versions 1 and 2 share the 24-byte
//! entry layout; version 3 appends an 8-byte per-entry checksum used as the
//! entry identifier.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use log::debug;

use crate::common::{QuarryError, QuarryResult};
use crate::ensure;
use crate::trace::Traced;

const HEADER_V1_SIZE: u64 = 12;
const HEADER_V2_SIZE: u64 = 104;
const HEADER_V3_SIZE: u64 = 272;
const ENTRY_BASE_SIZE: u32 = 24;
const ENTRY_V3_SIZE: u32 = 32;

/// How one entry's payload is stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    /// Raw bytes at the entry offset.
    Uncompressed,
    /// Gzip-style dictionary stream.
    Dictionary,
    /// Redirection to another logical path.
    Redirection,
    /// Single zstd frame.
    Frame,
    /// Concatenated zstd frames.
    MultiFrame,
}

impl EntryKind {
    fn from_tag(tag: u8) -> QuarryResult<Self> {
        match tag {
            0 => Ok(Self::Uncompressed),
            1 => Ok(Self::Dictionary),
            2 => Ok(Self::Redirection),
            3 => Ok(Self::Frame),
            4 => Ok(Self::MultiFrame),
            _ => Err(QuarryError::Format(format!("unknown entry type {}", tag))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Entry {
    pub path: u64,
    pub offset: u32,
    pub size_compressed: u32,
    pub size_uncompressed: u32,
    pub kind: EntryKind,
    /// Version-3 per-entry checksum.
    pub id: Option<u64>,
}

#[derive(Debug)]
struct Geometry {
    version_major: u8,
    version_minor: u8,
    entry_offset: u32,
    entry_size: u32,
    entry_count: u32,
}

/// Size of the fixed header for the archive's version, from its first four
/// bytes.
pub fn header_size(head: &[u8]) -> QuarryResult<u64> {
    ensure!(head.len() >= 4, "archive header truncated");
    ensure!(&head[..2] == b"RW", "archive magic mismatch");
    match head[2] {
        1 => Ok(HEADER_V1_SIZE),
        2 => Ok(HEADER_V2_SIZE),
        3 => Ok(HEADER_V3_SIZE),
        version => Err(QuarryError::Format(format!(
            "unsupported archive version {}",
            version
        ))),
    }
}

fn geometry(header: &[u8]) -> QuarryResult<Geometry> {
    let needed = header_size(header)?;
    ensure!(
        header.len() as u64 >= needed,
        "version {} header of {} bytes truncated",
        header[2],
        header.len()
    );
    let version_major = header[2];
    let version_minor = header[3];
    let geometry = match version_major {
        1 => {
            let mut cursor = Cursor::new(&header[4..]);
            Geometry {
                version_major,
                version_minor,
                entry_offset: cursor.read_u16::<LittleEndian>()? as u32,
                entry_size: cursor.read_u16::<LittleEndian>()? as u32,
                entry_count: cursor.read_u32::<LittleEndian>()?,
            }
        }
        2 => {
            // skip the 84-byte signature and 8-byte checksum
            let mut cursor = Cursor::new(&header[96..]);
            Geometry {
                version_major,
                version_minor,
                entry_offset: cursor.read_u16::<LittleEndian>()? as u32,
                entry_size: cursor.read_u16::<LittleEndian>()? as u32,
                entry_count: cursor.read_u32::<LittleEndian>()?,
            }
        }
        3 => {
            let mut cursor = Cursor::new(&header[268..]);
            Geometry {
                version_major,
                version_minor,
                entry_offset: HEADER_V3_SIZE as u32,
                entry_size: ENTRY_V3_SIZE,
                entry_count: cursor.read_u32::<LittleEndian>()?,
            }
        }
        version => {
            return Err(QuarryError::Format(format!(
                "unsupported archive version {}",
                version
            )))
        }
    };
    let minimum = if geometry.version_major == 3 {
        ENTRY_V3_SIZE
    } else {
        ENTRY_BASE_SIZE
    };
    ensure!(
        geometry.entry_size >= minimum,
        "entry size {} below the version {} layout",
        geometry.entry_size,
        geometry.version_major
    );
    ensure!(
        geometry.entry_offset as u64 >= needed,
        "entry table at {} overlaps the header",
        geometry.entry_offset
    );
    Ok(geometry)
}

/// Size of header plus entry table; the caller reads this much before
/// [`entries`].
pub fn toc_size(header: &[u8]) -> QuarryResult<u64> {
    let geometry = geometry(header)?;
    Ok(geometry.entry_offset as u64 + geometry.entry_count as u64 * geometry.entry_size as u64)
}

/// Parses the entry table from the leading `toc_size` bytes of the archive.
/// `archive_size` bounds every entry's payload span.
pub fn entries(toc: &[u8], archive_size: u64) -> QuarryResult<Vec<Entry>> {
    let geometry = geometry(toc)?;
    debug!(
        "archive version {}.{} with {} entries",
        geometry.version_major, geometry.version_minor, geometry.entry_count
    );
    let table_end = geometry.entry_offset as u64 + geometry.entry_count as u64 * geometry.entry_size as u64;
    ensure!(
        toc.len() as u64 >= table_end,
        "entry table of {} entries truncated",
        geometry.entry_count
    );
    let mut result = Vec::with_capacity(geometry.entry_count as usize);
    for index in 0..geometry.entry_count {
        let entry = (|| {
            let start =
                geometry.entry_offset as usize + index as usize * geometry.entry_size as usize;
            let mut cursor = Cursor::new(&toc[start..]);
            let path = cursor.read_u64::<LittleEndian>()?;
            let offset = cursor.read_u32::<LittleEndian>()?;
            let size_compressed = cursor.read_u32::<LittleEndian>()?;
            let size_uncompressed = cursor.read_u32::<LittleEndian>()?;
            let kind = EntryKind::from_tag(cursor.read_u8()?)?;
            let id = if geometry.version_major == 3 {
                cursor.set_position(cursor.position() + 3);
                Some(cursor.read_u64::<LittleEndian>()?)
            } else {
                None
            };
            ensure!(
                offset as u64 + size_compressed as u64 <= archive_size,
                "entry payload of {} bytes at {} spills past the archive",
                size_compressed,
                offset
            );
            Ok(Entry {
                path,
                offset,
                size_compressed,
                size_uncompressed,
                kind,
                id,
            })
        })()
        .traced(|| format!("entry: {}", index))?;
        result.push(entry);
    }
    Ok(result)
}
