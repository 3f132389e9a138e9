//! Helpers shared by the CLI scenarios: a minimal archive writer and hash
//! dictionary fixtures.

use std::fs;
use std::path::Path;

pub const KIND_UNCOMPRESSED: u8 = 0;
pub const KIND_REDIRECTION: u8 = 2;

pub struct WadEntry {
    pub path_hash: u64,
    pub kind: u8,
    pub stored: Vec<u8>,
    pub size_uncompressed: u32,
}

impl WadEntry {
    pub fn stored(path_hash: u64, content: &[u8]) -> Self {
        Self {
            path_hash,
            kind: KIND_UNCOMPRESSED,
            stored: content.to_vec(),
            size_uncompressed: content.len() as u32,
        }
    }

    pub fn redirection(path_hash: u64, target: &str) -> Self {
        let mut stored = (target.len() as u32).to_le_bytes().to_vec();
        stored.extend_from_slice(target.as_bytes());
        Self {
            path_hash,
            kind: KIND_REDIRECTION,
            size_uncompressed: stored.len() as u32,
            stored,
        }
    }
}

/// Serialises a version-1 archive.
pub fn build_wad(entries: &[WadEntry]) -> Vec<u8> {
    const HEADER_SIZE: u32 = 12;
    const ENTRY_SIZE: u32 = 24;
    let mut out = Vec::new();
    out.extend_from_slice(b"RW");
    out.push(1);
    out.push(0);
    out.extend_from_slice(&(HEADER_SIZE as u16).to_le_bytes());
    out.extend_from_slice(&(ENTRY_SIZE as u16).to_le_bytes());
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());

    let mut offset = HEADER_SIZE + entries.len() as u32 * ENTRY_SIZE;
    for entry in entries {
        out.extend_from_slice(&entry.path_hash.to_le_bytes());
        out.extend_from_slice(&offset.to_le_bytes());
        out.extend_from_slice(&(entry.stored.len() as u32).to_le_bytes());
        out.extend_from_slice(&entry.size_uncompressed.to_le_bytes());
        out.push(entry.kind);
        out.extend_from_slice(&[0u8; 3]);
        offset += entry.stored.len() as u32;
    }
    for entry in entries {
        out.extend_from_slice(&entry.stored);
    }
    out
}

/// Writes a name dictionary holding the given paths.
pub fn write_names_file(path: &Path, names: &[&str]) {
    let mut records: Vec<String> = names
        .iter()
        .map(|name| format!("{:016X} {}", quarry::hashes::hash_name(name), name))
        .collect();
    records.sort();
    fs::write(path, records.join("\n") + "\n").expect("write names file");
}

/// UTF-16LE bytes of `text`.
pub fn utf16(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}
