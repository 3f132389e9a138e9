//! # Release Manifest Format
//!
//! Fixed-layout little-endian binary with magic `RLSM`: a header, a
//! length-prefixed folder array, a length-prefixed file array and a
//! NUL-terminated concatenated string table. Folders form a forest: each
//! folder names a contiguous sub-range of the folder array as its children
//! and a contiguous sub-range of the file array as its files, so paths are
//! rebuilt by walking parent chains upwards.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::common::QuarryResult;
use crate::ensure;
use crate::trace::Traced;

const FOLDER_RECORD_SIZE: u64 = 20;
const FILE_RECORD_SIZE: u64 = 44;

/// Four raw version bytes rendered most-significant first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Version(pub [u8; 4]);

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.0[3], self.0[2], self.0[1], self.0[0]
        )
    }
}

#[derive(Debug)]
pub struct Header {
    pub version_major: u16,
    pub version_minor: u16,
    pub project_name: u32,
    pub release_version: Version,
}

#[derive(Debug)]
pub struct Folder {
    pub name: u32,
    pub folders_start: u32,
    pub folders_count: u32,
    pub files_start: u32,
    pub files_count: u32,
}

#[derive(Debug)]
pub struct FileRecord {
    pub name: u32,
    pub version: Version,
    pub checksum: [u8; 16],
    pub deploy_mode: u32,
    pub size_uncompressed: u32,
    pub size_compressed: u32,
    pub date_low: u32,
    pub date_hi: u32,
}

/// One listed file with its reassembled path.
#[derive(Clone, Debug)]
pub struct FileInfo {
    pub name: String,
    pub version: Version,
    pub checksum: [u8; 16],
    pub deploy_mode: u32,
    pub size_uncompressed: u32,
    pub size_compressed: u32,
}

#[derive(Debug)]
pub struct Manifest {
    pub header: Header,
    pub folders: Vec<Folder>,
    pub files: Vec<FileRecord>,
    pub names: Vec<String>,
}

impl Manifest {
    pub fn read(data: &[u8]) -> QuarryResult<Self> {
        let mut cursor = Cursor::new(data);
        let mut magic = [0u8; 4];
        cursor.read_exact(&mut magic)?;
        ensure!(&magic == b"RLSM", "release manifest magic mismatch");
        let version_major = cursor.read_u16::<LittleEndian>()?;
        let version_minor = cursor.read_u16::<LittleEndian>()?;
        let project_name = cursor.read_u32::<LittleEndian>()?;
        let mut release_version = [0u8; 4];
        cursor.read_exact(&mut release_version)?;
        let header = Header {
            version_major,
            version_minor,
            project_name,
            release_version: Version(release_version),
        };

        let folder_count = cursor.read_u32::<LittleEndian>()?;
        ensure!(
            remaining(&cursor, data) >= folder_count as u64 * FOLDER_RECORD_SIZE,
            "folder table of {} records truncated",
            folder_count
        );
        let mut folders = Vec::with_capacity(folder_count as usize);
        for _ in 0..folder_count {
            folders.push(Folder {
                name: cursor.read_u32::<LittleEndian>()?,
                folders_start: cursor.read_u32::<LittleEndian>()?,
                folders_count: cursor.read_u32::<LittleEndian>()?,
                files_start: cursor.read_u32::<LittleEndian>()?,
                files_count: cursor.read_u32::<LittleEndian>()?,
            });
        }

        let file_count = cursor.read_u32::<LittleEndian>()?;
        ensure!(
            remaining(&cursor, data) >= file_count as u64 * FILE_RECORD_SIZE,
            "file table of {} records truncated",
            file_count
        );
        let mut files = Vec::with_capacity(file_count as usize);
        for _ in 0..file_count {
            let name = cursor.read_u32::<LittleEndian>()?;
            let mut version = [0u8; 4];
            cursor.read_exact(&mut version)?;
            let mut checksum = [0u8; 16];
            cursor.read_exact(&mut checksum)?;
            files.push(FileRecord {
                name,
                version: Version(version),
                checksum,
                deploy_mode: cursor.read_u32::<LittleEndian>()?,
                size_uncompressed: cursor.read_u32::<LittleEndian>()?,
                size_compressed: cursor.read_u32::<LittleEndian>()?,
                date_low: cursor.read_u32::<LittleEndian>()?,
                date_hi: cursor.read_u32::<LittleEndian>()?,
            });
        }

        let name_count = cursor.read_u32::<LittleEndian>()?;
        let table_size = cursor.read_u32::<LittleEndian>()?;
        ensure!(
            remaining(&cursor, data) >= table_size as u64,
            "string table of {} bytes truncated",
            table_size
        );
        ensure!(table_size > 0, "release manifest without a string table");
        let start = cursor.position() as usize;
        let table = &data[start..start + table_size as usize];
        ensure!(
            table[table.len() - 1] == 0,
            "string table is not NUL-terminated"
        );
        let mut names = Vec::new();
        for piece in table[..table.len() - 1].split(|&b| b == 0) {
            ensure!(
                names.len() < name_count as usize,
                "string table holds more than the declared {} names",
                name_count
            );
            names.push(
                String::from_utf8(piece.to_vec())
                    .map_err(|e| format!("string table is not UTF-8: {:?}", e))?,
            );
        }
        ensure!(
            (header.project_name as usize) < names.len(),
            "project name index {} out of range",
            header.project_name
        );

        Ok(Self {
            header,
            folders,
            files,
            names,
        })
    }

    pub fn project_name(&self) -> &str {
        &self.names[self.header.project_name as usize]
    }

    /// Reassembles the path of every file by walking folder parent chains.
    /// A repeated folder id along one chain is fatal.
    pub fn list_files(&self) -> QuarryResult<Vec<FileInfo>> {
        let mut folder_parents: HashMap<u32, u32> = HashMap::new();
        let mut file_parents: HashMap<u32, u32> = HashMap::new();
        for (index, folder) in self.folders.iter().enumerate() {
            ensure!(
                (folder.name as usize) < self.names.len(),
                "folder name index {} out of range",
                folder.name
            );
            ensure!(
                folder.folders_start as u64 + folder.folders_count as u64
                    <= self.folders.len() as u64,
                "folder range {}+{} out of range",
                folder.folders_start,
                folder.folders_count
            );
            ensure!(
                folder.files_start as u64 + folder.files_count as u64 <= self.files.len() as u64,
                "file range {}+{} out of range",
                folder.files_start,
                folder.files_count
            );
            for child in folder.folders_start..folder.folders_start + folder.folders_count {
                folder_parents.insert(child, index as u32);
            }
            for child in folder.files_start..folder.files_start + folder.files_count {
                file_parents.insert(child, index as u32);
            }
        }

        let mut result = Vec::with_capacity(self.files.len());
        let mut visited = HashSet::new();
        for (index, file) in self.files.iter().enumerate() {
            let assembled = (|| {
                ensure!(
                    (file.name as usize) < self.names.len(),
                    "file name index {} out of range",
                    file.name
                );
                let mut path = self.names[file.name as usize].clone();
                visited.clear();
                let mut parent = file_parents.get(&(index as u32)).copied();
                while let Some(folder_index) = parent {
                    ensure!(
                        visited.insert(folder_index),
                        "cyclic folder chain through folder {}",
                        folder_index
                    );
                    let folder = &self.folders[folder_index as usize];
                    let folder_name = &self.names[folder.name as usize];
                    if !folder_name.is_empty() {
                        path = format!("{}/{}", folder_name, path);
                    }
                    parent = folder_parents.get(&folder_index).copied();
                }
                Ok(path)
            })()
            .traced(|| format!("file: {}", index))?;
            result.push(FileInfo {
                name: assembled,
                version: file.version,
                checksum: file.checksum,
                deploy_mode: file.deploy_mode,
                size_uncompressed: file.size_uncompressed,
                size_compressed: file.size_compressed,
            });
        }
        Ok(result)
    }
}

fn remaining(cursor: &Cursor<&[u8]>, data: &[u8]) -> u64 {
    data.len() as u64 - cursor.position()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Serialises a manifest the parser accepts; shared with the provider
    /// tests.
    pub(crate) fn build_manifest(
        folders: &[(u32, u32, u32, u32, u32)],
        files: &[(u32, [u8; 16], u32)],
        names: &[&str],
        project_name: u32,
    ) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(b"RLSM");
        data.extend_from_slice(&1u16.to_le_bytes());
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&project_name.to_le_bytes());
        data.extend_from_slice(&[1, 0, 0, 0]);
        data.extend_from_slice(&(folders.len() as u32).to_le_bytes());
        for folder in folders {
            for field in [folder.0, folder.1, folder.2, folder.3, folder.4] {
                data.extend_from_slice(&field.to_le_bytes());
            }
        }
        data.extend_from_slice(&(files.len() as u32).to_le_bytes());
        for (name, checksum, size) in files {
            data.extend_from_slice(&name.to_le_bytes());
            data.extend_from_slice(&[2, 0, 0, 0]);
            data.extend_from_slice(checksum);
            data.extend_from_slice(&0u32.to_le_bytes());
            data.extend_from_slice(&size.to_le_bytes());
            data.extend_from_slice(&size.to_le_bytes());
            data.extend_from_slice(&0u32.to_le_bytes());
            data.extend_from_slice(&0u32.to_le_bytes());
        }
        let mut table = Vec::new();
        for name in names {
            table.extend_from_slice(name.as_bytes());
            table.push(0);
        }
        data.extend_from_slice(&(names.len() as u32).to_le_bytes());
        data.extend_from_slice(&(table.len() as u32).to_le_bytes());
        data.extend_from_slice(&table);
        data
    }

    #[test]
    fn rejects_bad_magic() {
        let mut data = build_manifest(&[], &[], &["proj"], 0);
        data[0] = b'X';
        assert!(Manifest::read(&data).is_err());
    }

    #[test]
    fn assembles_paths_from_folder_forest() {
        // names: 0 proj, 1 "" (root folder), 2 data, 3 a.txt, 4 b.bin
        // folder 0 = root (children: folder 1, file 0); folder 1 = data (file 1)
        let data = build_manifest(
            &[(1, 1, 1, 0, 1), (2, 0, 0, 1, 1)],
            &[(3, [0xaa; 16], 5), (4, [0xbb; 16], 7)],
            &["proj", "", "data", "a.txt", "b.bin"],
            0,
        );
        let manifest = Manifest::read(&data).expect("parse");
        assert_eq!(manifest.project_name(), "proj");
        let files = manifest.list_files().expect("list");
        assert_eq!(files[0].name, "a.txt");
        assert_eq!(files[1].name, "data/b.bin");
        assert_eq!(files[1].version.to_string(), "0.0.0.2");
        // every reconstructed path tokenises into non-empty segments
        for file in &files {
            let segments: Vec<&str> = file.name.split('/').collect();
            assert!(!segments.is_empty());
            assert!(segments.iter().all(|s| !s.is_empty()));
        }
    }

    #[test]
    fn detects_folder_cycles() {
        // folder 0 claims itself as child, file 0 hangs off it
        let data = build_manifest(
            &[(1, 0, 1, 0, 1)],
            &[(2, [0; 16], 1)],
            &["proj", "loop", "a.txt"],
            0,
        );
        let manifest = Manifest::read(&data).expect("parse");
        assert!(manifest.list_files().is_err());
        crate::trace::drain();
    }

    #[test]
    fn bounds_checks_string_indices() {
        let data = build_manifest(&[], &[(9, [0; 16], 1)], &["proj", "a.txt"], 0);
        let manifest = Manifest::read(&data).expect("parse");
        assert!(manifest.list_files().is_err());
        crate::trace::drain();
    }

    #[test]
    fn rejects_truncated_tables() {
        let data = build_manifest(&[], &[(1, [0; 16], 1)], &["proj", "a.txt"], 0);
        assert!(Manifest::read(&data[..40]).is_err());
    }
}
