//! Raw directory provider: every regular file below a root directory becomes
//! one logical file named by its forward-slash relative path.

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use walkdir::WalkDir;

use crate::common::{Location, QuarryError, QuarryResult};
use crate::hashes::HashDict;
use crate::provider::{has_archive_extension, File, Manager, MmapReader, SharedReader};
use crate::trace::Traced;

pub struct RawFile {
    name: String,
    path: PathBuf,
    location: Rc<Location>,
    reader: RefCell<Weak<RefCell<MmapReader>>>,
}

impl RawFile {
    fn new(name: String, base: &Path, parent: &Rc<Location>) -> Self {
        Self {
            path: base.join(&name),
            location: Location::child(parent, name.clone()),
            name,
            reader: RefCell::new(Weak::new()),
        }
    }

    /// Memory-maps an arbitrary backing file, shared by the providers that
    /// resolve container sources on the local filesystem.
    pub fn make_reader(path: &Path) -> QuarryResult<SharedReader> {
        let reader = MmapReader::open(path).traced(|| format!("path: {}", path.display()))?;
        Ok(Rc::new(RefCell::new(reader)))
    }
}

impl File for RawFile {
    fn find_name(&self, _hashes: &mut HashDict) -> String {
        self.name.clone()
    }

    fn find_hash(&self, hashes: &mut HashDict) -> u64 {
        hashes.hash_by_name(&self.name)
    }

    fn find_extension(&self, hashes: &mut HashDict) -> QuarryResult<String> {
        Ok(hashes.extension_by_name(&self.name))
    }

    fn link(&self) -> QuarryResult<String> {
        Ok(String::new())
    }

    fn size(&self) -> QuarryResult<u64> {
        let metadata = fs::metadata(&self.path)
            .map_err(|e| QuarryError::Io(format!("{:?}", e)))
            .traced(|| format!("path: {}", self.path.display()))?;
        Ok(metadata.len())
    }

    fn id(&self) -> String {
        String::new()
    }

    fn location(&self) -> Rc<Location> {
        Rc::clone(&self.location)
    }

    fn open(&self) -> QuarryResult<SharedReader> {
        if let Some(reader) = self.reader.borrow().upgrade() {
            return Ok(reader);
        }
        let reader = Rc::new(RefCell::new(
            MmapReader::open(&self.path).traced(|| format!("path: {}", self.path.display()))?,
        ));
        *self.reader.borrow_mut() = Rc::downgrade(&reader);
        Ok(reader)
    }

    fn is_archive(&self, _hashes: &mut HashDict) -> QuarryResult<bool> {
        Ok(has_archive_extension(&self.name))
    }
}

pub struct RawManager {
    base: PathBuf,
    location: Rc<Location>,
}

impl RawManager {
    pub fn new(base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
            location: Location::root(base.display().to_string()),
        }
    }
}

impl Manager for RawManager {
    fn list(&self) -> QuarryResult<Vec<Rc<dyn File>>> {
        let mut result: Vec<Rc<dyn File>> = Vec::new();
        for entry in WalkDir::new(&self.base).sort_by_file_name() {
            let entry = entry
                .map_err(|e| QuarryError::Io(format!("{:?}", e)))
                .traced(|| format!("path: {}", self.base.display()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry
                .path()
                .strip_prefix(&self.base)
                .map_err(|e| QuarryError::Io(format!("{:?}", e)))?
                .to_string_lossy()
                .replace('\\', "/");
            result.push(Rc::new(RawFile::new(name, &self.base, &self.location)));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_regular_files_relative_to_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("sub/deep")).expect("mkdir");
        fs::write(dir.path().join("a.txt"), b"hello").expect("write");
        fs::write(dir.path().join("sub/deep/b.bin"), b"xy").expect("write");

        let manager = RawManager::new(dir.path());
        let files = manager.list().expect("list");
        let mut hashes = HashDict::new();
        let names: Vec<String> = files.iter().map(|f| f.find_name(&mut hashes)).collect();
        assert_eq!(names, vec!["a.txt".to_string(), "sub/deep/b.bin".to_string()]);
        assert_eq!(files[0].size().expect("size"), 5);
        assert_eq!(files[0].id(), "");
    }

    #[test]
    fn archive_suffixes_are_detected() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("assets.wad"), b"RW..").expect("write");
        fs::write(dir.path().join("plain.txt"), b"x").expect("write");

        let manager = RawManager::new(dir.path());
        let files = manager.list().expect("list");
        let mut hashes = HashDict::new();
        assert!(files[0].is_archive(&mut hashes).expect("archive"));
        assert!(!files[1].is_archive(&mut hashes).expect("archive"));
    }

    #[test]
    fn open_reuses_the_reader() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("a.txt"), b"hello").expect("write");
        let manager = RawManager::new(dir.path());
        let files = manager.list().expect("list");
        let first = files[0].open().expect("open");
        let second = files[0].open().expect("open");
        assert!(Rc::ptr_eq(&first, &second));
    }
}
