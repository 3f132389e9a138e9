//! # Modern Manifest Format
//!
//! A fixed 28-byte little-endian header with magic `RMAN` framing a single
//! zstd-compressed body. The decompressed body is a flatbuffer-style table
//! whose root carries four arrays: bundles, languages, files and
//! directories. Listing resolves directory chains into paths, locale flags
//! into language names, and chunk ids into per-file [`FileChunk`] records
//! carrying both bundle-relative and file-relative offsets.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::common::QuarryResult;
use crate::ensure;
use crate::modern::decompress_into;
use crate::modern::flatbuffer::Table;
use crate::trace::Traced;

/// Largest uncompressed chunk a well-formed manifest may declare.
pub const DEFAULT_CHUNK_LIMIT: u32 = 16 * 1024 * 1024;

const HEADER_SIZE: u64 = 28;

#[derive(Debug)]
pub struct Header {
    pub version_major: u8,
    pub version_minor: u8,
    pub flags: u16,
    pub offset: u32,
    pub size_compressed: u32,
    /// Header checksum, doubling as the manifest identifier.
    pub id: u64,
    pub size_uncompressed: u32,
}

#[derive(Debug)]
pub struct BundleChunk {
    pub id: u64,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
}

#[derive(Debug)]
pub struct Bundle {
    pub id: u64,
    pub chunks: Vec<BundleChunk>,
}

#[derive(Debug)]
pub struct Lang {
    pub id: u8,
    pub name: String,
}

#[derive(Debug)]
pub struct FileRecord {
    pub id: u64,
    pub parent_dir_id: u64,
    pub size: u32,
    pub name: String,
    pub locale_flags: u64,
    pub unk5: u8,
    pub unk6: u8,
    pub chunk_ids: Vec<u64>,
    pub unk8: u8,
    pub link: String,
    pub unk10: u8,
    pub params_index: u8,
    pub permissions: u8,
}

#[derive(Debug)]
pub struct Dir {
    pub id: u64,
    pub parent_dir_id: u64,
    pub name: String,
}

/// One chunk of a logical file: where it sits inside its bundle and where
/// its bytes land inside the file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileChunk {
    pub id: u64,
    pub bundle_id: u64,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub compressed_offset: u32,
    pub uncompressed_offset: u32,
}

/// One logical file with its resolved path, languages and chunk list.
#[derive(Clone, Debug)]
pub struct FileInfo {
    pub id: u64,
    pub size: u32,
    pub path: String,
    pub link: String,
    pub langs: BTreeSet<String>,
    pub chunks: Vec<FileChunk>,
}

#[derive(Debug)]
pub struct Manifest {
    pub id: u64,
    pub bundles: Vec<Bundle>,
    pub langs: Vec<Lang>,
    pub files: Vec<FileRecord>,
    pub dirs: Vec<Dir>,
}

impl Manifest {
    pub fn read(data: &[u8]) -> QuarryResult<Self> {
        let mut cursor = Cursor::new(data);
        let mut magic = [0u8; 4];
        cursor.read_exact(&mut magic)?;
        ensure!(&magic == b"RMAN", "modern manifest magic mismatch");
        let header = Header {
            version_major: cursor.read_u8()?,
            version_minor: cursor.read_u8()?,
            flags: cursor.read_u16::<LittleEndian>()?,
            offset: cursor.read_u32::<LittleEndian>()?,
            size_compressed: cursor.read_u32::<LittleEndian>()?,
            id: cursor.read_u64::<LittleEndian>()?,
            size_uncompressed: cursor.read_u32::<LittleEndian>()?,
        };
        ensure!(
            header.offset as u64 >= HEADER_SIZE,
            "body offset {} overlaps the header",
            header.offset
        );
        ensure!(
            data.len() as u64 >= header.offset as u64 + header.size_compressed as u64,
            "compressed body of {} bytes truncated",
            header.size_compressed
        );
        let compressed = &data
            [header.offset as usize..header.offset as usize + header.size_compressed as usize];
        let mut body = vec![0u8; header.size_uncompressed as usize];
        let produced = decompress_into(compressed, &mut body)
            .traced(|| format!("manifest: {:016x}", header.id))?;
        ensure!(
            produced == body.len(),
            "manifest body decompressed to {} bytes instead of {}",
            produced,
            body.len()
        );
        Self::read_body(header.id, &body)
    }

    fn read_body(id: u64, body: &[u8]) -> QuarryResult<Self> {
        let root = Table::root(body)?;

        let mut bundles = Vec::new();
        for bundle_table in root.table_vector(0)? {
            let mut chunks = Vec::new();
            for chunk_table in bundle_table.table_vector(1)? {
                chunks.push(BundleChunk {
                    id: chunk_table.u64_field(0)?,
                    compressed_size: chunk_table.u32_field(1)?,
                    uncompressed_size: chunk_table.u32_field(2)?,
                });
            }
            bundles.push(Bundle {
                id: bundle_table.u64_field(0)?,
                chunks,
            });
        }

        let mut langs = Vec::new();
        for lang_table in root.table_vector(1)? {
            langs.push(Lang {
                id: lang_table.u8_field(0)?,
                name: lang_table.string_field(1)?.to_lowercase(),
            });
        }

        let mut files = Vec::new();
        for file_table in root.table_vector(2)? {
            files.push(FileRecord {
                id: file_table.u64_field(0)?,
                parent_dir_id: file_table.u64_field(1)?,
                size: file_table.u32_field(2)?,
                name: file_table.string_field(3)?,
                locale_flags: file_table.u64_field(4)?,
                unk5: file_table.u8_field(5)?,
                unk6: file_table.u8_field(6)?,
                chunk_ids: file_table.u64_vector(7)?,
                unk8: file_table.u8_field(8)?,
                link: file_table.string_field(9)?,
                unk10: file_table.u8_field(10)?,
                params_index: file_table.u8_field(11)?,
                permissions: file_table.u8_field(12)?,
            });
        }

        let mut dirs = Vec::new();
        for dir_table in root.table_vector(3)? {
            dirs.push(Dir {
                id: dir_table.u64_field(0)?,
                parent_dir_id: dir_table.u64_field(1)?,
                name: dir_table.string_field(2)?,
            });
        }

        Ok(Self {
            id,
            bundles,
            langs,
            files,
            dirs,
        })
    }

    /// Materialises every file: directory chains become paths (fatal on
    /// cycle), locale bits become language names, chunk ids become
    /// [`FileChunk`] records with accumulated offsets.
    pub fn list_files(&self) -> QuarryResult<Vec<FileInfo>> {
        let mut dir_lookup: HashMap<u64, &Dir> = HashMap::new();
        for dir in &self.dirs {
            dir_lookup.insert(dir.id, dir);
        }
        let mut lang_lookup: HashMap<u8, &str> = HashMap::new();
        for lang in &self.langs {
            lang_lookup.insert(lang.id, &lang.name);
        }
        let mut chunk_lookup: HashMap<u64, FileChunk> = HashMap::new();
        for bundle in &self.bundles {
            let mut compressed_offset = 0u32;
            for chunk in &bundle.chunks {
                chunk_lookup.insert(
                    chunk.id,
                    FileChunk {
                        id: chunk.id,
                        bundle_id: bundle.id,
                        compressed_size: chunk.compressed_size,
                        uncompressed_size: chunk.uncompressed_size,
                        compressed_offset,
                        uncompressed_offset: 0,
                    },
                );
                compressed_offset = compressed_offset
                    .checked_add(chunk.compressed_size)
                    .ok_or_else(|| format!("bundle {:016x} overflows", bundle.id))?;
            }
        }

        let mut result = Vec::with_capacity(self.files.len());
        let mut visited = HashSet::new();
        for file in &self.files {
            let info = (|| {
                let mut path = file.name.clone();
                visited.clear();
                let mut parent = file.parent_dir_id;
                while parent != 0 {
                    ensure!(
                        visited.insert(parent),
                        "cyclic directory chain through {:016x}",
                        parent
                    );
                    let dir = dir_lookup
                        .get(&parent)
                        .ok_or_else(|| format!("dangling directory id {:016x}", parent))?;
                    if !dir.name.is_empty() {
                        path = format!("{}/{}", dir.name, path);
                    }
                    parent = dir.parent_dir_id;
                }

                let mut langs = BTreeSet::new();
                for bit in 0..64u8 {
                    if file.locale_flags & (1u64 << bit) != 0 {
                        let lang = lang_lookup
                            .get(&(bit + 1))
                            .ok_or_else(|| format!("unknown language id {}", bit + 1))?;
                        langs.insert(lang.to_string());
                    }
                }
                if langs.is_empty() {
                    langs.insert("none".to_string());
                }

                let mut chunks = Vec::with_capacity(file.chunk_ids.len());
                let mut uncompressed_offset = 0u32;
                for chunk_id in &file.chunk_ids {
                    let mut chunk = *chunk_lookup
                        .get(chunk_id)
                        .ok_or_else(|| format!("unknown chunk id {:016x}", chunk_id))?;
                    chunk.uncompressed_offset = uncompressed_offset;
                    uncompressed_offset = uncompressed_offset
                        .checked_add(chunk.uncompressed_size)
                        .ok_or_else(|| format!("chunks of {:016x} overflow", file.id))?;
                    chunks.push(chunk);
                }

                Ok(FileInfo {
                    id: file.id,
                    size: file.size,
                    path,
                    link: file.link.clone(),
                    langs,
                    chunks,
                })
            })()
            .traced(|| format!("file: {:016x}", file.id))?;
            result.push(info);
        }
        Ok(result)
    }
}

impl FileInfo {
    /// Validates one chunked file before any of its bytes are touched. A
    /// violation rejects the whole manifest.
    pub fn sanitize(&self, chunk_limit: u32) -> QuarryResult<()> {
        (|| {
            ensure!(self.id != 0, "file without an id");
            ensure!(self.link.is_empty(), "chunked file carries a link");
            ensure!(!self.path.is_empty(), "file without a path");
            ensure!(self.path.len() < 256, "path of {} bytes", self.path.len());
            for segment in self.path.split('/') {
                ensure!(!segment.is_empty(), "path has an empty segment");
                ensure!(
                    segment != "." && segment != "..",
                    "path has a dot segment"
                );
            }
            ensure!(self.size > 0, "file of zero size");
            ensure!(
                self.size <= u32::MAX - chunk_limit,
                "file size {} overflows the chunk limit",
                self.size
            );
            let max_compressed = zstd::zstd_safe::compress_bound(chunk_limit as usize) as u32;
            let mut next_min_offset = 0u32;
            for chunk in &self.chunks {
                (|| {
                    ensure!(chunk.id != 0, "chunk without an id");
                    ensure!(chunk.bundle_id != 0, "chunk without a bundle");
                    ensure!(
                        chunk.compressed_size >= 4 && chunk.compressed_size <= max_compressed,
                        "compressed size {} out of range",
                        chunk.compressed_size
                    );
                    ensure!(
                        chunk.uncompressed_size > 0 && chunk.uncompressed_size <= chunk_limit,
                        "uncompressed size {} out of range",
                        chunk.uncompressed_size
                    );
                    ensure!(
                        chunk.uncompressed_offset >= next_min_offset,
                        "chunk offsets out of order at {}",
                        chunk.uncompressed_offset
                    );
                    ensure!(
                        chunk.uncompressed_offset as u64 + chunk.uncompressed_size as u64
                            <= self.size as u64,
                        "chunk at {} spills past the file size",
                        chunk.uncompressed_offset
                    );
                    next_min_offset = chunk.uncompressed_offset + chunk.uncompressed_size;
                    Ok(())
                })()
                .traced(|| format!("chunk: {:016x}", chunk.id))?;
            }
            Ok(())
        })()
        .traced(|| format!("file: {:016x} {}", self.id, self.path))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::modern::flatbuffer::builder::{finish_root, Value};

    pub(crate) struct TestChunk {
        pub id: u64,
        pub compressed_size: u32,
        pub uncompressed_size: u32,
    }

    pub(crate) struct TestBundle {
        pub id: u64,
        pub chunks: Vec<TestChunk>,
    }

    pub(crate) struct TestFile {
        pub id: u64,
        pub parent_dir_id: u64,
        pub size: u32,
        pub name: &'static str,
        pub locale_flags: u64,
        pub chunk_ids: Vec<u64>,
        pub link: &'static str,
    }

    /// Serialises a complete manifest body.
    pub(crate) fn build_body(
        bundles: &[TestBundle],
        langs: &[(u8, &str)],
        files: &[TestFile],
        dirs: &[(u64, u64, &str)],
    ) -> Vec<u8> {
        let bundle_tables = bundles
            .iter()
            .map(|bundle| {
                vec![
                    Value::U64(bundle.id),
                    Value::TableVec(
                        bundle
                            .chunks
                            .iter()
                            .map(|chunk| {
                                vec![
                                    Value::U64(chunk.id),
                                    Value::U32(chunk.compressed_size),
                                    Value::U32(chunk.uncompressed_size),
                                ]
                            })
                            .collect(),
                    ),
                ]
            })
            .collect();
        let lang_tables = langs
            .iter()
            .map(|(id, name)| vec![Value::U8(*id), Value::Str(name.to_string())])
            .collect();
        let file_tables = files
            .iter()
            .map(|file| {
                vec![
                    Value::U64(file.id),
                    Value::U64(file.parent_dir_id),
                    Value::U32(file.size),
                    Value::Str(file.name.to_string()),
                    Value::U64(file.locale_flags),
                    Value::U8(0),
                    Value::U8(0),
                    Value::U64Vec(file.chunk_ids.clone()),
                    Value::U8(0),
                    Value::Str(file.link.to_string()),
                    Value::U8(0),
                    Value::U8(0),
                    Value::U8(0),
                ]
            })
            .collect();
        let dir_tables = dirs
            .iter()
            .map(|(id, parent, name)| {
                vec![
                    Value::U64(*id),
                    Value::U64(*parent),
                    Value::Str(name.to_string()),
                ]
            })
            .collect();
        finish_root(vec![
            Value::TableVec(bundle_tables),
            Value::TableVec(lang_tables),
            Value::TableVec(file_tables),
            Value::TableVec(dir_tables),
        ])
    }

    /// Frames a body into a complete manifest binary.
    pub(crate) fn build_manifest_bytes(id: u64, body: &[u8]) -> Vec<u8> {
        let compressed = zstd::bulk::compress(body, 0).expect("compress body");
        let mut data = Vec::new();
        data.extend_from_slice(b"RMAN");
        data.push(2);
        data.push(0);
        data.extend_from_slice(&0u16.to_le_bytes());
        data.extend_from_slice(&28u32.to_le_bytes());
        data.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
        data.extend_from_slice(&id.to_le_bytes());
        data.extend_from_slice(&(body.len() as u32).to_le_bytes());
        data.extend_from_slice(&compressed);
        data
    }

    fn sample_body() -> Vec<u8> {
        build_body(
            &[
                TestBundle {
                    id: 0xb1,
                    chunks: vec![
                        TestChunk {
                            id: 0xc1,
                            compressed_size: 20,
                            uncompressed_size: 64,
                        },
                        TestChunk {
                            id: 0xc2,
                            compressed_size: 24,
                            uncompressed_size: 36,
                        },
                    ],
                },
                TestBundle {
                    id: 0xb2,
                    chunks: vec![TestChunk {
                        id: 0xc3,
                        compressed_size: 30,
                        uncompressed_size: 100,
                    }],
                },
            ],
            &[(1, "en_US"), (2, "de_DE")],
            &[
                TestFile {
                    id: 0xf1,
                    parent_dir_id: 2,
                    size: 200,
                    name: "map.bin",
                    locale_flags: 0b01,
                    chunk_ids: vec![0xc1, 0xc2, 0xc3],
                    link: "",
                },
                TestFile {
                    id: 0xf2,
                    parent_dir_id: 0,
                    size: 0,
                    name: "alias.cfg",
                    locale_flags: 0,
                    chunk_ids: vec![],
                    link: "data/real.cfg",
                },
            ],
            &[(1, 0, ""), (2, 1, "data")],
        )
    }

    #[test]
    fn parses_a_framed_manifest() {
        let bytes = build_manifest_bytes(0x1234, &sample_body());
        let manifest = Manifest::read(&bytes).expect("parse");
        assert_eq!(manifest.id, 0x1234);
        assert_eq!(manifest.bundles.len(), 2);
        assert_eq!(manifest.langs[0].name, "en_us");
        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.dirs.len(), 2);
    }

    #[test]
    fn rejects_a_corrupt_frame() {
        let mut bytes = build_manifest_bytes(0x1234, &sample_body());
        // clobber the zstd frame magic
        bytes[28] ^= 0xff;
        assert!(Manifest::read(&bytes).is_err());
        crate::trace::drain();
    }

    #[test]
    fn materialises_paths_langs_and_chunks() {
        let bytes = build_manifest_bytes(1, &sample_body());
        let manifest = Manifest::read(&bytes).expect("parse");
        let files = manifest.list_files().expect("list");

        let map = &files[0];
        assert_eq!(map.path, "data/map.bin");
        assert_eq!(map.langs, BTreeSet::from(["en_us".to_string()]));
        assert_eq!(map.chunks.len(), 3);
        // second chunk of the first bundle starts after the first
        assert_eq!(map.chunks[1].bundle_id, 0xb1);
        assert_eq!(map.chunks[1].compressed_offset, 20);
        assert_eq!(map.chunks[1].uncompressed_offset, 64);
        assert_eq!(map.chunks[2].bundle_id, 0xb2);
        assert_eq!(map.chunks[2].compressed_offset, 0);
        assert_eq!(map.chunks[2].uncompressed_offset, 100);

        let alias = &files[1];
        assert_eq!(alias.link, "data/real.cfg");
        assert_eq!(alias.langs, BTreeSet::from(["none".to_string()]));
        assert!(alias.chunks.is_empty());
    }

    #[test]
    fn chunk_offsets_cover_the_file_exactly() {
        let bytes = build_manifest_bytes(1, &sample_body());
        let manifest = Manifest::read(&bytes).expect("parse");
        let files = manifest.list_files().expect("list");
        let map = &files[0];
        let mut expected_start = 0u32;
        for chunk in &map.chunks {
            assert_eq!(chunk.uncompressed_offset, expected_start);
            expected_start += chunk.uncompressed_size;
        }
        assert_eq!(expected_start, map.size);
    }

    #[test]
    fn sanitize_accepts_listed_files() {
        let bytes = build_manifest_bytes(1, &sample_body());
        let manifest = Manifest::read(&bytes).expect("parse");
        let files = manifest.list_files().expect("list");
        files[0].sanitize(DEFAULT_CHUNK_LIMIT).expect("sane");
    }

    #[test]
    fn sanitize_rejects_an_oversized_chunk() {
        let bytes = build_manifest_bytes(1, &sample_body());
        let manifest = Manifest::read(&bytes).expect("parse");
        let files = manifest.list_files().expect("list");
        let mut corrupted = files[0].clone();
        corrupted.chunks[1].uncompressed_size = DEFAULT_CHUNK_LIMIT + 1;
        assert!(corrupted.sanitize(DEFAULT_CHUNK_LIMIT).is_err());
        crate::trace::drain();
    }

    #[test]
    fn sanitize_rejects_dot_segments() {
        let bytes = build_manifest_bytes(1, &sample_body());
        let manifest = Manifest::read(&bytes).expect("parse");
        let mut file = manifest.list_files().expect("list")[0].clone();
        file.path = "data/../map.bin".to_string();
        assert!(file.sanitize(DEFAULT_CHUNK_LIMIT).is_err());
        file.path = "/data/map.bin".to_string();
        assert!(file.sanitize(DEFAULT_CHUNK_LIMIT).is_err());
        crate::trace::drain();
    }

    #[test]
    fn cyclic_directories_are_fatal() {
        let body = build_body(
            &[],
            &[],
            &[TestFile {
                id: 1,
                parent_dir_id: 1,
                size: 1,
                name: "x",
                locale_flags: 0,
                chunk_ids: vec![],
                link: "",
            }],
            &[(1, 2, "a"), (2, 1, "b")],
        );
        let bytes = build_manifest_bytes(1, &body);
        let manifest = Manifest::read(&bytes).expect("parse");
        assert!(manifest.list_files().is_err());
        crate::trace::drain();
    }

    #[test]
    fn unknown_language_bits_are_fatal() {
        let body = build_body(
            &[],
            &[(1, "en_US")],
            &[TestFile {
                id: 1,
                parent_dir_id: 0,
                size: 1,
                name: "x",
                locale_flags: 0b10,
                chunk_ids: vec![],
                link: "",
            }],
            &[],
        );
        let bytes = build_manifest_bytes(1, &body);
        let manifest = Manifest::read(&bytes).expect("parse");
        assert!(manifest.list_files().is_err());
        crate::trace::drain();
    }
}
