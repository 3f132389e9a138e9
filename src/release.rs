//! # Release Manifest Provider
//!
//! Files listed by a release manifest live on the cdn as plain files under
//! `projects/<project>/releases/<file_version>/files/<path>`; opening one
//! memory-maps that path. The declared uncompressed size is authoritative.

pub mod manifest;

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use crate::common::{Location, QuarryResult};
use crate::ensure;
use crate::hashes::HashDict;
use crate::provider::{
    has_archive_extension, File, Manager, MmapReader, Reader, SharedReader,
};
use crate::release::manifest::{FileInfo, Manifest};
use crate::trace::Traced;

struct ReleaseReader {
    declared: u64,
    map: MmapReader,
}

impl ReleaseReader {
    fn open(info: &FileInfo, path: &Path) -> QuarryResult<Self> {
        let map = MmapReader::open(path).traced(|| format!("path: {}", path.display()))?;
        Ok(Self {
            declared: info.size_uncompressed as u64,
            map,
        })
    }
}

impl Reader for ReleaseReader {
    fn size(&self) -> u64 {
        self.declared
    }

    fn read(&mut self, offset: u64, len: u64) -> QuarryResult<&[u8]> {
        ensure!(
            offset + len <= self.declared,
            "read of {} bytes at {} past declared size {}",
            len,
            offset,
            self.declared
        );
        self.map.read(offset, len)
    }
}

pub struct ReleaseFile {
    info: FileInfo,
    path: PathBuf,
    location: Rc<Location>,
    reader: RefCell<Weak<RefCell<ReleaseReader>>>,
}

impl ReleaseFile {
    fn new(info: FileInfo, base: &Path, parent: &Rc<Location>) -> Self {
        let path = base
            .join("releases")
            .join(info.version.to_string())
            .join("files")
            .join(&info.name);
        Self {
            location: Location::child(parent, info.name.clone()),
            info,
            path,
            reader: RefCell::new(Weak::new()),
        }
    }
}

impl File for ReleaseFile {
    fn find_name(&self, _hashes: &mut HashDict) -> String {
        self.info.name.clone()
    }

    fn find_hash(&self, hashes: &mut HashDict) -> u64 {
        hashes.hash_by_name(&self.info.name)
    }

    fn find_extension(&self, hashes: &mut HashDict) -> QuarryResult<String> {
        Ok(hashes.extension_by_name(&self.info.name))
    }

    fn link(&self) -> QuarryResult<String> {
        Ok(String::new())
    }

    fn size(&self) -> QuarryResult<u64> {
        Ok(self.info.size_uncompressed as u64)
    }

    /// The 16-byte content hash in its conventional digest presentation,
    /// suffixed `.md5`.
    fn id(&self) -> String {
        let low = u64::from_le_bytes(self.info.checksum[0..8].try_into().unwrap_or([0; 8]));
        let high = u64::from_le_bytes(self.info.checksum[8..16].try_into().unwrap_or([0; 8]));
        let digest: String = format!("{:016x}{:016x}", high, low).chars().rev().collect();
        format!("{}.md5", digest)
    }

    fn location(&self) -> Rc<Location> {
        Rc::clone(&self.location)
    }

    fn open(&self) -> QuarryResult<SharedReader> {
        if let Some(reader) = self.reader.borrow().upgrade() {
            return Ok(reader);
        }
        let reader = Rc::new(RefCell::new(
            ReleaseReader::open(&self.info, &self.path)
                .traced(|| format!("file: {}", self.info.name))?,
        ));
        *self.reader.borrow_mut() = Rc::downgrade(&reader);
        Ok(reader)
    }

    fn is_archive(&self, _hashes: &mut HashDict) -> QuarryResult<bool> {
        Ok(has_archive_extension(&self.info.name))
    }
}

pub struct ReleaseManager {
    base: PathBuf,
    files: Vec<FileInfo>,
    location: Rc<Location>,
}

impl ReleaseManager {
    pub fn new(source: SharedReader, cdn: &Path, location: &Rc<Location>) -> QuarryResult<Self> {
        let mut source = source.borrow_mut();
        let manifest = Manifest::read(source.read_all()?)?;
        let base = cdn.join("projects").join(manifest.project_name());
        let files = manifest.list_files()?;
        Ok(Self {
            base,
            files,
            location: Rc::clone(location),
        })
    }
}

impl Manager for ReleaseManager {
    fn list(&self) -> QuarryResult<Vec<Rc<dyn File>>> {
        Ok(self
            .files
            .iter()
            .map(|info| {
                Rc::new(ReleaseFile::new(info.clone(), &self.base, &self.location))
                    as Rc<dyn File>
            })
            .collect())
    }
}
