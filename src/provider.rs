//! # File Providers
//!
//! A uniform interface over the five container forms: a raw directory, a
//! release manifest, a solution manifest, a modern chunked manifest and an
//! archive of hashed paths. Three capability sets cover everything the
//! orchestrator needs:
//!
//! - [`Reader`] — a sized byte source addressed by `(offset, len)`. The
//!   returned span stays valid until the next read. Streaming readers only
//!   ever advance, so cheap prefix reads are possible but rewinding the
//!   compressed cursor is not.
//! - [`File`] — one logical file with a name, hash, extension, size, content
//!   identifier and provenance [`Location`]. Files hand out a shared reader
//!   so repeated opens during a walk reuse one decompression context.
//! - [`Manager`] — enumerates the files of one container.
//!
//! [`make`] inspects a source path and instantiates the matching manager.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use hex::ToHex;
use memmap2::Mmap;
use sha1::{Digest, Sha1};

use crate::archive::ArchiveManager;
use crate::common::{Checksums, Location, QuarryError, QuarryResult};
use crate::ensure;
use crate::hashes::HashDict;
use crate::modern::ModernManager;
use crate::raw::RawManager;
use crate::release::ReleaseManager;
use crate::solution::SolutionManager;
use crate::trace::Traced;

/// Sized random-access byte source.
pub trait Reader {
    fn size(&self) -> u64;

    /// Returns `len` bytes starting at `offset`. The span is valid until the
    /// next call; readers over compressed payloads advance their streams just
    /// far enough to cover the requested window.
    fn read(&mut self, offset: u64, len: u64) -> QuarryResult<&[u8]>;

    fn read_all(&mut self) -> QuarryResult<&[u8]> {
        let size = self.size();
        self.read(0, size)
    }
}

pub type SharedReader = Rc<RefCell<dyn Reader>>;

/// One logical file listed by a [`Manager`].
pub trait File {
    /// Human-readable path, possibly recovered from the hash dictionary.
    fn find_name(&self, hashes: &mut HashDict) -> String;

    /// 64-bit path hash, registering the name when it is known.
    fn find_hash(&self, hashes: &mut HashDict) -> u64;

    /// Dotted lowercase extension, falling back to the link target or the
    /// leading bytes when the dictionary has no answer.
    fn find_extension(&self, hashes: &mut HashDict) -> QuarryResult<String>;

    /// Target path when this entry redirects to another logical file, empty
    /// otherwise.
    fn link(&self) -> QuarryResult<String>;

    /// Declared uncompressed size; links report 0.
    fn size(&self) -> QuarryResult<u64>;

    /// Stable content identifier such as `<hex>.md5`, `<hex>.fid` or
    /// `<hex>.sha`, or empty when the container defines none.
    fn id(&self) -> String;

    fn location(&self) -> Rc<Location>;

    /// Opens the decompressed byte stream. Files cache a weak reference to
    /// the reader so a walk touching the same file twice shares one context.
    fn open(&self) -> QuarryResult<SharedReader>;

    /// Whether the extension marks this file as a nested archive.
    fn is_archive(&self, hashes: &mut HashDict) -> QuarryResult<bool>;

    fn checksums(&self) -> QuarryResult<Checksums> {
        let link = self.link()?;
        if !link.is_empty() {
            return Ok(vec![("link", link)]);
        }
        let reader = self.open()?;
        let mut reader = reader.borrow_mut();
        let data = reader.read_all()?;
        let md5_digest = format!("{:x}", md5::compute(data));
        let mut hasher = Sha1::new();
        hasher.update(data);
        let sha1_hash = &hasher.finalize()[..];
        let sha1_digest: String = sha1_hash.encode_hex();
        Ok(vec![("md5", md5_digest), ("sha1", sha1_digest)])
    }

    /// Writes the full decompressed stream to `dest`, creating parent
    /// directories first.
    fn extract_to(&self, dest: &Path) -> QuarryResult<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let reader = self.open()?;
        let mut reader = reader.borrow_mut();
        let data = reader.read_all()?;
        fs::write(dest, data)?;
        Ok(())
    }
}

/// Enumerates the files of one container.
pub trait Manager {
    fn list(&self) -> QuarryResult<Vec<Rc<dyn File>>>;
}

pub(crate) fn has_archive_extension(name: &str) -> bool {
    name.ends_with(".wad") || name.ends_with(".client") || name.ends_with(".mobile")
}

/// Memory-mapped file reader. Empty files degrade to an empty span since a
/// zero-length mapping is not representable.
pub struct MmapReader {
    map: Option<Mmap>,
}

impl MmapReader {
    pub fn open(path: &Path) -> QuarryResult<Self> {
        let file = fs::File::open(path)
            .map_err(|e| QuarryError::NotFound(format!("{}: {:?}", path.display(), e)))?;
        let length = file.metadata()?.len();
        let map = if length == 0 {
            None
        } else {
            // Safety: the mapping is read-only and the backing stores are
            // treated as immutable for the lifetime of a run.
            Some(unsafe { Mmap::map(&file)? })
        };
        Ok(Self { map })
    }

    fn bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }
}

impl Reader for MmapReader {
    fn size(&self) -> u64 {
        self.bytes().len() as u64
    }

    fn read(&mut self, offset: u64, len: u64) -> QuarryResult<&[u8]> {
        let data = self.map.as_deref().unwrap_or(&[]);
        ensure!(
            offset + len <= data.len() as u64,
            "read of {} bytes at {} past end of mapped file of {} bytes",
            len,
            offset,
            data.len()
        );
        Ok(&data[offset as usize..(offset + len) as usize])
    }
}

/// In-memory reader over an owned buffer.
pub struct MemReader {
    data: Vec<u8>,
}

impl MemReader {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl Reader for MemReader {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read(&mut self, offset: u64, len: u64) -> QuarryResult<&[u8]> {
        ensure!(
            offset + len <= self.data.len() as u64,
            "read of {} bytes at {} past end of buffer of {} bytes",
            len,
            offset,
            self.data.len()
        );
        Ok(&self.data[offset as usize..(offset + len) as usize])
    }
}

const SOLUTION_HEADER: &[u8] = b"RADS Solution Manifest";

/// Instantiates the manager matching `source`.
///
/// Directories become raw providers; anything else is memory-mapped and
/// dispatched on its leading bytes. When no cdn is given it defaults to the
/// ancestor directory the container format conventionally lives under.
pub fn make(
    source: &Path,
    cdn: Option<&Path>,
    remote: &str,
    langs: &BTreeSet<String>,
) -> QuarryResult<Rc<dyn Manager>> {
    let canonical = fs::canonicalize(source)
        .map_err(|e| QuarryError::NotFound(format!("{}: {:?}", source.display(), e)))
        .traced(|| format!("path: {}", source.display()))?;
    make_canonical(&canonical, cdn, remote, langs).traced(|| format!("path: {}", source.display()))
}

fn make_canonical(
    source: &Path,
    cdn: Option<&Path>,
    remote: &str,
    langs: &BTreeSet<String>,
) -> QuarryResult<Rc<dyn Manager>> {
    if source.is_dir() {
        return Ok(Rc::new(RawManager::new(source)));
    }
    let mut reader = MmapReader::open(source)?;
    ensure!(
        reader.size() >= 4,
        "{} is too small to carry a container magic",
        source.display()
    );
    let head = reader.read(0, 4)?.to_vec();
    let text_head = reader
        .read(0, reader.size().min(SOLUTION_HEADER.len() as u64))?
        .to_vec();

    if head == b"RLSM" {
        let cdn = default_cdn(source, cdn, 5)?;
        ensure!(cdn.is_dir(), "cdn is not a directory: {}", cdn.display());
        let location = Location::root(source.display().to_string());
        let source: SharedReader = Rc::new(RefCell::new(reader));
        return Ok(Rc::new(ReleaseManager::new(source, &cdn, &location)?));
    }
    if text_head == SOLUTION_HEADER {
        let cdn = default_cdn(source, cdn, 5)?;
        ensure!(cdn.is_dir(), "cdn is not a directory: {}", cdn.display());
        let location = Location::root(source.display().to_string());
        let source: SharedReader = Rc::new(RefCell::new(reader));
        return Ok(Rc::new(SolutionManager::new(source, &cdn, langs, &location)?));
    }
    if head == b"RMAN" {
        let cdn = default_cdn(source, cdn, 2)?;
        let source: SharedReader = Rc::new(RefCell::new(reader));
        return Ok(Rc::new(ModernManager::new(source, &cdn, remote, langs)?));
    }
    ensure!(
        head[..2] == *b"RW",
        "{} does not start with a known container magic",
        source.display()
    );
    let cdn = default_cdn(source, cdn, 1)?;
    // Anchor the provenance chain at the path relative to the cdn so nested
    // entries print as `<archive>/<entry>`.
    let relative = source
        .strip_prefix(&cdn)
        .unwrap_or(source)
        .to_string_lossy()
        .replace('\\', "/");
    let location = Location::root(relative);
    let source: SharedReader = Rc::new(RefCell::new(reader));
    Ok(Rc::new(ArchiveManager::new(
        source,
        String::new(),
        &location,
    )?))
}

fn default_cdn(source: &Path, cdn: Option<&Path>, levels: usize) -> QuarryResult<PathBuf> {
    match cdn {
        Some(cdn) => Ok(cdn.to_path_buf()),
        None => source
            .ancestors()
            .nth(levels)
            .map(Path::to_path_buf)
            .ok_or_else(|| {
                QuarryError::NotFound(format!(
                    "cannot derive a cdn {} levels above {}",
                    levels,
                    source.display()
                ))
            }),
    }
}
