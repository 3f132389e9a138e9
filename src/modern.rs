//! # Modern Manifest Provider
//!
//! Files described by a modern manifest are reassembled from content-addressed
//! chunks packed across shared compressed bundles. The manager parses the
//! manifest, sanitizes every listed file, applies the language filter and
//! hands out files that read through one shared [`cache::ChunkCache`].

pub mod bundle;
pub mod cache;
pub mod flatbuffer;
pub mod manifest;

use std::cell::RefCell;
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::rc::{Rc, Weak};

use zstd::bulk::Decompressor;

use crate::common::{Location, QuarryError, QuarryResult};
use crate::ensure;
use crate::hashes::HashDict;
use crate::modern::cache::ChunkCache;
use crate::modern::manifest::{FileChunk, FileInfo, Manifest, DEFAULT_CHUNK_LIMIT};
use crate::provider::{has_archive_extension, File, Manager, Reader, SharedReader};
use crate::trace::Traced;

thread_local! {
    static FRAME_CONTEXT: RefCell<Option<Decompressor<'static>>> = const { RefCell::new(None) };
}

/// Decompresses one zstd frame into `dst` through the thread-local context,
/// returning the produced length.
pub(crate) fn decompress_into(src: &[u8], dst: &mut [u8]) -> QuarryResult<usize> {
    FRAME_CONTEXT.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_none() {
            let context = Decompressor::new()
                .map_err(|e| QuarryError::Decompress(format!("context: {:?}", e)))?;
            *slot = Some(context);
        }
        match slot.as_mut() {
            Some(context) => context
                .decompress_to_buffer(src, dst)
                .map_err(|e| QuarryError::Decompress(format!("{:?}", e))),
            None => Err(QuarryError::Decompress("context unavailable".to_string())),
        }
    })
}

/// Reader reassembling one logical file from its chunks.
///
/// Owns a buffer of the declared size plus the set of chunk offsets already
/// materialised, so partial reads at arbitrary offsets never decompress the
/// same chunk twice. Chunks selected for one read are visited in
/// `(bundle, chunk, offset)` order to keep the cache slots hot.
struct ModernReader {
    info: Rc<FileInfo>,
    cache: Rc<RefCell<ChunkCache>>,
    data: Vec<u8>,
    mapped: HashSet<u32>,
}

impl ModernReader {
    fn new(info: Rc<FileInfo>, cache: Rc<RefCell<ChunkCache>>) -> Self {
        let size = info.size as usize;
        Self {
            info,
            cache,
            data: vec![0u8; size],
            mapped: HashSet::new(),
        }
    }

    /// Chunks whose uncompressed offset falls inside the window, minus those
    /// already materialised, sorted to minimise bundle and chunk switching.
    fn chunks_in_range(&self, offset: u64, len: u64) -> Vec<FileChunk> {
        let start = self
            .info
            .chunks
            .partition_point(|chunk| (chunk.uncompressed_offset as u64) < offset);
        let end = self
            .info
            .chunks
            .partition_point(|chunk| (chunk.uncompressed_offset as u64) < offset + len);
        let mut selected: Vec<FileChunk> = self.info.chunks[start..end]
            .iter()
            .filter(|chunk| !self.mapped.contains(&chunk.uncompressed_offset))
            .copied()
            .collect();
        selected.sort_by_key(|chunk| (chunk.bundle_id, chunk.id, chunk.uncompressed_offset));
        selected
    }
}

impl Reader for ModernReader {
    fn size(&self) -> u64 {
        self.info.size as u64
    }

    fn read(&mut self, offset: u64, len: u64) -> QuarryResult<&[u8]> {
        ensure!(
            offset + len <= self.info.size as u64,
            "read of {} bytes at {} past file size {}",
            len,
            offset,
            self.info.size
        );
        let selected = self.chunks_in_range(offset, len);
        let mut cache = self.cache.borrow_mut();
        let mut index = 0;
        while index < selected.len() {
            let current = selected[index];
            let content = cache
                .open_chunk(&current)
                .traced(|| format!("chunk: {:016X}", current.id))
                .traced(|| format!("bundle: {:016X}", current.bundle_id))
                .traced(|| format!("path: {}", self.info.path))?;
            ensure!(
                content.len() == current.uncompressed_size as usize,
                "chunk {:016X} produced {} bytes instead of {}",
                current.id,
                content.len(),
                current.uncompressed_size
            );
            // the same chunk may land at several offsets of one file
            while index < selected.len() && selected[index].id == current.id {
                let target = selected[index];
                self.data[target.uncompressed_offset as usize..]
                    [..target.uncompressed_size as usize]
                    .copy_from_slice(content);
                self.mapped.insert(target.uncompressed_offset);
                index += 1;
            }
        }
        drop(cache);
        Ok(&self.data[offset as usize..][..len as usize])
    }
}

pub struct ModernFile {
    info: Rc<FileInfo>,
    cache: Rc<RefCell<ChunkCache>>,
    location: Rc<Location>,
    reader: RefCell<Weak<RefCell<ModernReader>>>,
}

impl ModernFile {
    fn new(info: Rc<FileInfo>, cache: Rc<RefCell<ChunkCache>>, parent: &Rc<Location>) -> Self {
        Self {
            location: Location::child(parent, info.path.clone()),
            info,
            cache,
            reader: RefCell::new(Weak::new()),
        }
    }
}

impl File for ModernFile {
    fn find_name(&self, _hashes: &mut HashDict) -> String {
        self.info.path.clone()
    }

    fn find_hash(&self, hashes: &mut HashDict) -> u64 {
        hashes.hash_by_name(&self.info.path)
    }

    fn find_extension(&self, hashes: &mut HashDict) -> QuarryResult<String> {
        let extension = hashes.extension_by_name(&self.info.path);
        if extension.is_empty() && !self.info.link.is_empty() {
            return Ok(hashes.extension_by_name(&self.info.link));
        }
        Ok(extension)
    }

    fn link(&self) -> QuarryResult<String> {
        Ok(self.info.link.clone())
    }

    fn size(&self) -> QuarryResult<u64> {
        if !self.info.link.is_empty() {
            return Ok(0);
        }
        Ok(self.info.size as u64)
    }

    fn id(&self) -> String {
        if !self.info.link.is_empty() {
            return String::new();
        }
        format!("{:016x}.fid", self.info.id)
    }

    fn location(&self) -> Rc<Location> {
        Rc::clone(&self.location)
    }

    fn open(&self) -> QuarryResult<SharedReader> {
        if let Some(reader) = self.reader.borrow().upgrade() {
            return Ok(reader);
        }
        if !self.info.link.is_empty() {
            return Err(QuarryError::LinkNotReadable)
                .traced(|| format!("path: {}", self.info.path));
        }
        let reader = Rc::new(RefCell::new(ModernReader::new(
            Rc::clone(&self.info),
            Rc::clone(&self.cache),
        )));
        *self.reader.borrow_mut() = Rc::downgrade(&reader);
        Ok(reader)
    }

    fn is_archive(&self, _hashes: &mut HashDict) -> QuarryResult<bool> {
        Ok(self.info.link.is_empty() && has_archive_extension(&self.info.path))
    }
}

pub struct ModernManager {
    cache: Rc<RefCell<ChunkCache>>,
    files: Vec<Rc<FileInfo>>,
    location: Rc<Location>,
}

impl ModernManager {
    pub fn new(
        source: SharedReader,
        cdn: &Path,
        remote: &str,
        langs: &BTreeSet<String>,
    ) -> QuarryResult<Self> {
        let manifest = {
            let mut source = source.borrow_mut();
            Manifest::read(source.read_all()?)?
        };
        let location = Location::root(format!("{:016x}.manifest", manifest.id));
        let mut files = manifest.list_files()?;
        for info in &files {
            if info.link.is_empty() {
                info.sanitize(DEFAULT_CHUNK_LIMIT)?;
            } else {
                ensure!(
                    info.chunks.is_empty() && info.size == 0,
                    "link {} carries content",
                    info.path
                );
            }
        }
        if !langs.is_empty() {
            files.retain(|info| langs.iter().any(|lang| info.langs.contains(lang)));
        }
        let cache = Rc::new(RefCell::new(ChunkCache::new(cdn, remote)?));
        Ok(Self {
            cache,
            files: files.into_iter().map(Rc::new).collect(),
            location,
        })
    }
}

impl Manager for ModernManager {
    fn list(&self) -> QuarryResult<Vec<Rc<dyn File>>> {
        Ok(self
            .files
            .iter()
            .map(|info| {
                Rc::new(ModernFile::new(
                    Rc::clone(info),
                    Rc::clone(&self.cache),
                    &self.location,
                )) as Rc<dyn File>
            })
            .collect())
    }
}
