//! # Hash Dictionary
//!
//! The 64-bit XXH64 hash of a lowercased path is the primary key shared by
//! every container format, and this dictionary is the only place where names
//! and extensions live. It keeps two mappings, `hash → name` and
//! `hash → extension`, both loaded from and saved to sorted text files so the
//! artefacts stay diff-friendly under source control.
//!
//! ## Dictionary Files
//!
//! One record per line: sixteen uppercase hexadecimal digits, a single space,
//! the string value. Records are sorted by value first, hash second. Blank
//! lines are skipped on read; anything else malformed fails the load.
//!
//! Lookups by name are insert-on-miss: hashing a name always registers the
//! name and its derived extension, so a run enriches the dictionaries with
//! every path it touches.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use xxhash_rust::xxh64::xxh64;

use crate::common::{QuarryError, QuarryResult};
use crate::ensure;
use crate::magic;

/// Hashes a path the way every container format does: XXH64 with seed zero
/// over the lowercased bytes.
pub fn hash_name(name: &str) -> u64 {
    xxh64(name.to_lowercase().as_bytes(), 0)
}

/// Derives the extension recorded for a path: the dotted suffix of the last
/// segment, or `"."` when the segment has none. A leading dot alone does not
/// count as an extension.
fn derive_extension(name: &str) -> String {
    let leaf = name.rsplit('/').next().unwrap_or(name);
    match leaf.rfind('.') {
        Some(index) if index > 0 => leaf[index..].to_string(),
        _ => ".".to_string(),
    }
}

/// Bidirectional mapping between 64-bit path hashes, names and extensions
#[derive(Debug, Default)]
pub struct HashDict {
    names: HashMap<u64, String>,
    extensions: HashMap<u64, String>,
}

impl HashDict {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hashes `name`, registering the lowercased name and its derived
    /// extension if they are not known yet.
    pub fn hash_by_name(&mut self, name: &str) -> u64 {
        let name = name.to_lowercase();
        let hash = xxh64(name.as_bytes(), 0);
        self.extensions
            .entry(hash)
            .or_insert_with(|| derive_extension(&name));
        self.names.entry(hash).or_insert(name);
        hash
    }

    /// Returns the name recorded for `hash`, or an empty string.
    pub fn name_by_hash(&self, hash: u64) -> String {
        self.names.get(&hash).cloned().unwrap_or_default()
    }

    /// Returns the extension for `name`, registering name and extension on
    /// the way when absent.
    pub fn extension_by_name(&mut self, name: &str) -> String {
        let hash = self.hash_by_name(name);
        self.extension_by_hash(hash)
    }

    /// Returns the extension recorded for `hash`, or an empty string.
    pub fn extension_by_hash(&self, hash: u64) -> String {
        self.extensions.get(&hash).cloned().unwrap_or_default()
    }

    /// Infers an extension from the leading bytes of a file whose name is
    /// unknown, caching the first magic match under `hash`. A miss is not an
    /// error; the extension simply stays empty.
    pub fn extension_by_bytes(&mut self, hash: u64, data: &[u8]) -> String {
        if let Some(extension) = self.extensions.get(&hash) {
            return extension.clone();
        }
        match magic::sniff(data) {
            Some(extension) => {
                self.extensions.insert(hash, extension.to_string());
                extension.to_string()
            }
            None => String::new(),
        }
    }

    /// Loads the name dictionary, then derives extensions for every name that
    /// does not have one yet. Returns whether the file existed.
    pub fn read_names(&mut self, path: &Path) -> QuarryResult<bool> {
        let existed = Self::read_list(&mut self.names, path)?;
        for (hash, name) in &self.names {
            self.extensions
                .entry(*hash)
                .or_insert_with(|| derive_extension(name));
        }
        Ok(existed)
    }

    /// Loads the extension dictionary. Returns whether the file existed.
    pub fn read_extensions(&mut self, path: &Path) -> QuarryResult<bool> {
        Self::read_list(&mut self.extensions, path)
    }

    pub fn write_names(&self, path: &Path) -> QuarryResult<()> {
        Self::write_list(&self.names, path)
    }

    pub fn write_extensions(&self, path: &Path) -> QuarryResult<()> {
        Self::write_list(&self.extensions, path)
    }

    fn read_list(list: &mut HashMap<u64, String>, path: &Path) -> QuarryResult<bool> {
        if !path.exists() {
            return Ok(false);
        }
        let contents = fs::read_to_string(path)?;
        for line in contents.lines() {
            if line.is_empty() {
                continue;
            }
            let (hash, value) = line.split_once(' ').ok_or_else(|| {
                QuarryError::Format(format!("hash record without separator: {:?}", line))
            })?;
            ensure!(hash.len() == 16, "hash field is not 16 digits: {:?}", line);
            let hash = u64::from_str_radix(hash, 16)
                .map_err(|_| QuarryError::HashParse(hash.to_string()))?;
            ensure!(!value.is_empty(), "hash record without value: {:?}", line);
            list.insert(hash, value.to_string());
        }
        Ok(true)
    }

    fn write_list(list: &HashMap<u64, String>, path: &Path) -> QuarryResult<()> {
        let mut sorted: Vec<(&u64, &String)> = list.iter().collect();
        sorted.sort_by(|lhs, rhs| (lhs.1, lhs.0).cmp(&(rhs.1, rhs.0)));
        let mut contents = String::new();
        for (hash, value) in sorted {
            contents.push_str(&format!("{:016X} {}\n", hash, value));
        }
        fs::write(path, contents)?;
        Ok(())
    }
}
