//! # Archive Provider
//!
//! Entries of an archive are addressed by the 64-bit hash of their path and
//! stored uncompressed, as a gzip-style dictionary stream, as one or more
//! zstd frames, or as a redirection to another logical path. Each compressed
//! entry gets a streaming reader holding `(compressed, uncompressed)`
//! cursors that only ever advance, so sniffing a few leading bytes never
//! decodes the whole payload.

pub mod toc;

use std::cell::RefCell;
use std::io::{BufReader, Read};
use std::rc::{Rc, Weak};

use flate2::read::GzDecoder;

use crate::common::{Location, QuarryError, QuarryResult};
use crate::ensure;
use crate::hashes::HashDict;
use crate::provider::{has_archive_extension, File, Manager, Reader, SharedReader};
use crate::trace::Traced;

use toc::{Entry, EntryKind};

/// Forward-only `io::Read` view over a compressed span of the owning
/// archive.
struct SourceWindow {
    source: SharedReader,
    base: u64,
    len: u64,
    pos: u64,
}

impl Read for SourceWindow {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = (self.len - self.pos) as usize;
        let wanted = buf.len().min(remaining);
        if wanted == 0 {
            return Ok(0);
        }
        let mut source = self.source.borrow_mut();
        let span = source
            .read(self.base + self.pos, wanted as u64)
            .map_err(std::io::Error::other)?;
        buf[..wanted].copy_from_slice(span);
        self.pos += wanted as u64;
        Ok(wanted)
    }
}

/// Pass-through reader for stored entries.
struct StoredReader {
    entry: Entry,
    source: SharedReader,
    buffer: Vec<u8>,
}

impl Reader for StoredReader {
    fn size(&self) -> u64 {
        self.entry.size_uncompressed as u64
    }

    fn read(&mut self, offset: u64, len: u64) -> QuarryResult<&[u8]> {
        ensure!(
            offset + len <= self.entry.size_uncompressed as u64,
            "read of {} bytes at {} past entry size {}",
            len,
            offset,
            self.entry.size_uncompressed
        );
        let mut source = self.source.borrow_mut();
        let span = source.read(self.entry.offset as u64 + offset, len)?;
        self.buffer.clear();
        self.buffer.extend_from_slice(span);
        drop(source);
        Ok(&self.buffer)
    }
}

/// Streaming reader for frame-compressed entries; a single decoder context
/// also carries multi-frame payloads across frame boundaries.
struct FrameReader {
    size_uncompressed: u64,
    data: Vec<u8>,
    decoder: zstd::stream::read::Decoder<'static, BufReader<SourceWindow>>,
    pos_uncompressed: usize,
}

impl FrameReader {
    fn new(entry: &Entry, source: SharedReader) -> QuarryResult<Self> {
        let window = SourceWindow {
            source,
            base: entry.offset as u64,
            len: entry.size_compressed as u64,
            pos: 0,
        };
        let decoder = zstd::stream::read::Decoder::new(window)
            .map_err(|e| QuarryError::Decompress(format!("{:?}", e)))
            .traced(|| format!("entry: {:016x}", entry.path))?;
        Ok(Self {
            size_uncompressed: entry.size_uncompressed as u64,
            data: vec![0u8; entry.size_uncompressed as usize],
            decoder,
            pos_uncompressed: 0,
        })
    }
}

impl Reader for FrameReader {
    fn size(&self) -> u64 {
        self.size_uncompressed
    }

    fn read(&mut self, offset: u64, len: u64) -> QuarryResult<&[u8]> {
        ensure!(
            offset + len <= self.size_uncompressed,
            "read of {} bytes at {} past entry size {}",
            len,
            offset,
            self.size_uncompressed
        );
        let target = (offset + len) as usize;
        while self.pos_uncompressed < target {
            let advanced = self
                .decoder
                .read(&mut self.data[self.pos_uncompressed..])
                .map_err(|e| QuarryError::Decompress(format!("{:?}", e)))?;
            ensure!(
                advanced > 0,
                "frame stream ended at {} of {} bytes",
                self.pos_uncompressed,
                self.size_uncompressed
            );
            self.pos_uncompressed += advanced;
        }
        Ok(&self.data[offset as usize..][..len as usize])
    }
}

/// Streaming reader for dictionary-compressed entries.
struct DictionaryReader {
    size_uncompressed: u64,
    data: Vec<u8>,
    decoder: GzDecoder<SourceWindow>,
    pos_uncompressed: usize,
}

impl DictionaryReader {
    fn new(entry: &Entry, source: SharedReader) -> Self {
        let window = SourceWindow {
            source,
            base: entry.offset as u64,
            len: entry.size_compressed as u64,
            pos: 0,
        };
        Self {
            size_uncompressed: entry.size_uncompressed as u64,
            data: vec![0u8; entry.size_uncompressed as usize],
            decoder: GzDecoder::new(window),
            pos_uncompressed: 0,
        }
    }
}

impl Reader for DictionaryReader {
    fn size(&self) -> u64 {
        self.size_uncompressed
    }

    fn read(&mut self, offset: u64, len: u64) -> QuarryResult<&[u8]> {
        ensure!(
            offset + len <= self.size_uncompressed,
            "read of {} bytes at {} past entry size {}",
            len,
            offset,
            self.size_uncompressed
        );
        let target = (offset + len) as usize;
        while self.pos_uncompressed < target {
            let advanced = self
                .decoder
                .read(&mut self.data[self.pos_uncompressed..])
                .map_err(|e| QuarryError::Decompress(format!("{:?}", e)))?;
            ensure!(
                advanced > 0,
                "dictionary stream ended at {} of {} bytes",
                self.pos_uncompressed,
                self.size_uncompressed
            );
            self.pos_uncompressed += advanced;
        }
        Ok(&self.data[offset as usize..][..len as usize])
    }
}

pub struct ArchiveFile {
    entry: Entry,
    source: SharedReader,
    source_id: String,
    location: Rc<Location>,
    link: RefCell<Option<String>>,
    reader: RefCell<Option<Weak<RefCell<dyn Reader>>>>,
}

impl ArchiveFile {
    fn new(entry: Entry, source: SharedReader, source_id: String, parent: &Rc<Location>) -> Self {
        Self {
            location: Location::child(parent, format!("{:016x}", entry.path)),
            entry,
            source,
            source_id,
            link: RefCell::new(None),
            reader: RefCell::new(None),
        }
    }
}

impl File for ArchiveFile {
    fn find_name(&self, hashes: &mut HashDict) -> String {
        hashes.name_by_hash(self.entry.path)
    }

    fn find_hash(&self, _hashes: &mut HashDict) -> u64 {
        self.entry.path
    }

    fn find_extension(&self, hashes: &mut HashDict) -> QuarryResult<String> {
        let extension = hashes.extension_by_hash(self.entry.path);
        if !extension.is_empty() {
            return Ok(extension);
        }
        let link = self.link()?;
        if !link.is_empty() {
            return Ok(hashes.extension_by_name(&link));
        }
        let reader = self.open()?;
        let mut reader = reader.borrow_mut();
        let head_len = (self.entry.size_uncompressed as u64).min(32);
        let head = reader.read(0, head_len)?;
        Ok(hashes.extension_by_bytes(self.entry.path, head))
    }

    fn link(&self) -> QuarryResult<String> {
        if let Some(link) = self.link.borrow().as_ref() {
            return Ok(link.clone());
        }
        if self.entry.kind != EntryKind::Redirection {
            *self.link.borrow_mut() = Some(String::new());
            return Ok(String::new());
        }
        let target = (|| {
            let mut source = self.source.borrow_mut();
            let head = source.read(self.entry.offset as u64, 4)?;
            let length = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
            ensure!(
                length as u64 + 4 <= self.entry.size_uncompressed as u64,
                "redirection target of {} bytes spills past the entry",
                length
            );
            let span = source.read(self.entry.offset as u64 + 4, length as u64)?;
            String::from_utf8(span.to_vec())
                .map_err(|e| QuarryError::Format(format!("redirection target not UTF-8: {:?}", e)))
        })()
        .traced(|| format!("entry: {:016x}", self.entry.path))?;
        *self.link.borrow_mut() = Some(target.clone());
        Ok(target)
    }

    fn size(&self) -> QuarryResult<u64> {
        if self.entry.kind == EntryKind::Redirection {
            return Ok(0);
        }
        Ok(self.entry.size_uncompressed as u64)
    }

    fn id(&self) -> String {
        if self.entry.kind == EntryKind::Redirection {
            return String::new();
        }
        if let Some(id) = self.entry.id {
            return format!("{:016x}.sha", id);
        }
        if !self.source_id.is_empty() {
            return format!("{}.{:016x}.xxh", self.source_id, self.entry.path);
        }
        String::new()
    }

    fn location(&self) -> Rc<Location> {
        Rc::clone(&self.location)
    }

    fn open(&self) -> QuarryResult<SharedReader> {
        if let Some(reader) = self.reader.borrow().as_ref().and_then(Weak::upgrade) {
            return Ok(reader);
        }
        let reader: SharedReader = match self.entry.kind {
            EntryKind::Redirection => {
                return Err(QuarryError::LinkNotReadable)
                    .traced(|| format!("entry: {:016x}", self.entry.path))
            }
            EntryKind::Uncompressed => Rc::new(RefCell::new(StoredReader {
                entry: self.entry,
                source: Rc::clone(&self.source),
                buffer: Vec::new(),
            })),
            EntryKind::Dictionary => Rc::new(RefCell::new(DictionaryReader::new(
                &self.entry,
                Rc::clone(&self.source),
            ))),
            EntryKind::Frame | EntryKind::MultiFrame => Rc::new(RefCell::new(
                FrameReader::new(&self.entry, Rc::clone(&self.source))?,
            )),
        };
        *self.reader.borrow_mut() = Some(Rc::downgrade(&reader));
        Ok(reader)
    }

    fn is_archive(&self, hashes: &mut HashDict) -> QuarryResult<bool> {
        if self.entry.kind == EntryKind::Redirection {
            return Ok(false);
        }
        let extension = self.find_extension(hashes)?;
        Ok(has_archive_extension(&extension))
    }
}

pub struct ArchiveManager {
    entries: Vec<Entry>,
    source: SharedReader,
    source_id: String,
    location: Rc<Location>,
}

impl ArchiveManager {
    pub fn new(
        source: SharedReader,
        source_id: String,
        location: &Rc<Location>,
    ) -> QuarryResult<Self> {
        let entries = {
            let mut reader = source.borrow_mut();
            let archive_size = reader.size();
            let header_size = toc::header_size(reader.read(0, archive_size.min(4))?)?;
            ensure!(
                archive_size >= header_size,
                "archive of {} bytes cannot hold its header",
                archive_size
            );
            let toc_size = toc::toc_size(reader.read(0, header_size)?)?;
            ensure!(
                archive_size >= toc_size,
                "archive of {} bytes cannot hold its entry table",
                archive_size
            );
            toc::entries(reader.read(0, toc_size)?, archive_size)?
        };
        Ok(Self {
            entries,
            source,
            source_id,
            location: Rc::clone(location),
        })
    }

    /// Wraps an already-listed file (for example a `.wad` inside a manifest)
    /// as a nested archive.
    pub fn from_file(file: &dyn File) -> QuarryResult<Self> {
        let source = file.open()?;
        let location = file.location();
        Self::new(source, file.id(), &location)
    }
}

impl Manager for ArchiveManager {
    fn list(&self) -> QuarryResult<Vec<Rc<dyn File>>> {
        Ok(self
            .entries
            .iter()
            .map(|entry| {
                Rc::new(ArchiveFile::new(
                    *entry,
                    Rc::clone(&self.source),
                    self.source_id.clone(),
                    &self.location,
                )) as Rc<dyn File>
            })
            .collect())
    }
}
