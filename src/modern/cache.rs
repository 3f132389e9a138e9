//! # Bundle and Chunk Cache
//!
//! Content-addressed store backing every chunked file of one manifest. The
//! cache root's leaf decides the mode: a directory named `chunks` holds
//! decompressed chunks, one named `bundles` holds whole compressed bundles,
//! and anything else gets `bundles` appended.
//!
//! Reads are sorted by `(bundle, chunk)` upstream, so a single
//! most-recent-id slot per resource gives high reuse without an LRU: one
//! memory buffer each for the last remotely fetched bundle and the last
//! decompressed chunk, one memory-map each for the last local bundle and
//! chunk file.
//!
//! When a bundle has to be fetched remotely its trailer is verified against
//! the requested id and the content is persisted — whole in bundle mode,
//! shredded into per-chunk files in chunking mode.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use memmap2::Mmap;

use crate::common::{QuarryError, QuarryResult};
use crate::ensure;
use crate::fetcher;
use crate::modern::bundle::Trailer;
use crate::modern::decompress_into;
use crate::modern::manifest::FileChunk;
use crate::trace::Traced;

#[derive(Default)]
struct BufferSlot {
    id: Option<u64>,
    data: Vec<u8>,
}

#[derive(Default)]
struct MapSlot {
    id: Option<u64>,
    map: Option<Mmap>,
}

impl MapSlot {
    fn bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    fn open(&mut self, id: u64, path: &Path) -> QuarryResult<()> {
        self.id = None;
        let file = fs::File::open(path)
            .map_err(|e| QuarryError::NotFound(format!("{}: {:?}", path.display(), e)))?;
        // Safety: cache files are only appended by this process and never
        // rewritten while mapped.
        self.map = Some(unsafe { Mmap::map(&file)? });
        self.id = Some(id);
        Ok(())
    }
}

enum BundleHome {
    RemoteBuffer,
    LocalMap,
}

pub struct ChunkCache {
    root: PathBuf,
    remote: String,
    chunking: bool,
    remote_bundle: BufferSlot,
    remote_chunk: BufferSlot,
    local_bundle: MapSlot,
    local_chunk: MapSlot,
}

impl ChunkCache {
    pub fn new(cdn: &Path, remote: &str) -> QuarryResult<Self> {
        let leaf = cdn
            .file_name()
            .map(|name| name.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let (root, chunking) = if leaf == "chunks" {
            (cdn.to_path_buf(), true)
        } else if leaf == "bundles" {
            (cdn.to_path_buf(), false)
        } else {
            (cdn.join("bundles"), false)
        };
        if !remote.is_empty() {
            fs::create_dir_all(&root)
                .map_err(QuarryError::from)
                .traced(|| format!("cache: {}", root.display()))?;
        }
        Ok(Self {
            root,
            remote: remote.trim_end_matches('/').to_string(),
            chunking,
            remote_bundle: BufferSlot::default(),
            remote_chunk: BufferSlot::default(),
            local_bundle: MapSlot::default(),
            local_chunk: MapSlot::default(),
        })
    }

    fn chunk_path(&self, id: u64) -> PathBuf {
        self.root.join(format!("{:016X}.chunk", id))
    }

    fn bundle_path(&self, id: u64) -> PathBuf {
        self.root.join(format!("{:016X}.bundle", id))
    }

    /// Returns exactly `chunk.uncompressed_size` bytes of chunk content,
    /// reusing the last-id slots, the per-chunk cache directory, or the
    /// owning bundle in that order.
    pub fn open_chunk(&mut self, chunk: &FileChunk) -> QuarryResult<&[u8]> {
        if self.remote_chunk.id == Some(chunk.id) {
            return Ok(&self.remote_chunk.data);
        }
        if self.local_chunk.id == Some(chunk.id) {
            return Ok(self.local_chunk.bytes());
        }

        if self.chunking {
            let path = self.chunk_path(chunk.id);
            if path.exists() {
                self.local_chunk.open(chunk.id, &path)?;
                return Ok(self.local_chunk.bytes());
            }
            ensure!(
                !self.remote.is_empty(),
                "chunk {:016X} missing locally and no remote to fall back to",
                chunk.id
            );
        }

        let home = self.ensure_bundle(chunk)?;
        let bundle: &[u8] = match home {
            BundleHome::RemoteBuffer => &self.remote_bundle.data,
            BundleHome::LocalMap => self.local_bundle.bytes(),
        };
        ensure!(
            chunk.compressed_offset as u64 + chunk.compressed_size as u64 <= bundle.len() as u64,
            "chunk {:016X} spills past its bundle",
            chunk.id
        );
        let compressed =
            &bundle[chunk.compressed_offset as usize..][..chunk.compressed_size as usize];
        self.remote_chunk.id = None;
        let mut produced = vec![0u8; chunk.uncompressed_size as usize];
        let length = decompress_into(compressed, &mut produced)
            .traced(|| format!("chunk: {:016X}", chunk.id))?;
        ensure!(
            length == chunk.uncompressed_size as usize,
            "chunk {:016X} decompressed to {} bytes instead of {}",
            chunk.id,
            length,
            chunk.uncompressed_size
        );
        self.remote_chunk.data = produced;
        self.remote_chunk.id = Some(chunk.id);
        Ok(&self.remote_chunk.data)
    }

    /// Makes the owning bundle of `chunk` resident, fetching and persisting
    /// it when it is neither in a slot nor on disk.
    fn ensure_bundle(&mut self, chunk: &FileChunk) -> QuarryResult<BundleHome> {
        if self.remote_bundle.id == Some(chunk.bundle_id) {
            return Ok(BundleHome::RemoteBuffer);
        }
        if self.local_bundle.id == Some(chunk.bundle_id) {
            return Ok(BundleHome::LocalMap);
        }

        let path = self.bundle_path(chunk.bundle_id);
        if !self.chunking && path.exists() {
            self.local_bundle.open(chunk.bundle_id, &path)?;
            return Ok(BundleHome::LocalMap);
        }

        ensure!(
            !self.remote.is_empty(),
            "bundle {:016X} missing locally and no remote to fall back to",
            chunk.bundle_id
        );
        self.remote_bundle.id = None;
        self.remote_bundle.data.clear();
        let url = format!("{}/bundles/{:016X}.bundle", self.remote, chunk.bundle_id);
        fetcher::fetch(&url, &mut self.remote_bundle.data)
            .traced(|| format!("bundle: {:016X}", chunk.bundle_id))?;
        let trailer = Trailer::read(&self.remote_bundle.data)
            .traced(|| format!("bundle: {:016X}", chunk.bundle_id))?;
        ensure!(
            trailer.id == chunk.bundle_id,
            "fetched bundle identifies as {:016X} instead of {:016X}",
            trailer.id,
            chunk.bundle_id
        );
        self.remote_bundle.id = Some(chunk.bundle_id);

        if !self.chunking {
            debug!("caching bundle {:016X}", chunk.bundle_id);
            fs::write(&path, &self.remote_bundle.data)?;
        } else {
            let mut offset = 0usize;
            for record in &trailer.chunks {
                let chunk_file = self.chunk_path(record.id);
                if !chunk_file.exists() {
                    ensure!(
                        offset + record.compressed_size as usize <= self.remote_bundle.data.len(),
                        "trailer record {:016X} spills past the bundle",
                        record.id
                    );
                    let compressed =
                        &self.remote_bundle.data[offset..][..record.compressed_size as usize];
                    self.remote_chunk.id = None;
                    let mut produced = vec![0u8; record.uncompressed_size as usize];
                    let length = decompress_into(compressed, &mut produced)
                        .traced(|| format!("chunk: {:016X}", record.id))?;
                    ensure!(
                        length == record.uncompressed_size as usize,
                        "chunk {:016X} decompressed to {} bytes instead of {}",
                        record.id,
                        length,
                        record.uncompressed_size
                    );
                    self.remote_chunk.data = produced;
                    self.remote_chunk.id = Some(record.id);
                    debug!("caching chunk {:016X}", record.id);
                    fs::write(&chunk_file, &self.remote_chunk.data)?;
                }
                offset += record.compressed_size as usize;
            }
        }
        Ok(BundleHome::RemoteBuffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modern::bundle::{write_trailer, TrailerChunk};

    fn make_chunk(id: u64, bundle_id: u64, data_len: u32) -> FileChunk {
        FileChunk {
            id,
            bundle_id,
            compressed_size: 0,
            uncompressed_size: data_len,
            compressed_offset: 0,
            uncompressed_offset: 0,
        }
    }

    /// Packs `payloads` into a bundle file with a valid trailer, returning
    /// the bundle bytes and the chunk descriptors pointing into it.
    fn build_bundle(bundle_id: u64, payloads: &[(u64, &[u8])]) -> (Vec<u8>, Vec<FileChunk>) {
        let mut body = Vec::new();
        let mut records = Vec::new();
        let mut chunks = Vec::new();
        for (chunk_id, payload) in payloads {
            let compressed = zstd::bulk::compress(payload, 0).expect("compress");
            let mut chunk = make_chunk(*chunk_id, bundle_id, payload.len() as u32);
            chunk.compressed_offset = body.len() as u32;
            chunk.compressed_size = compressed.len() as u32;
            records.push(TrailerChunk {
                id: *chunk_id,
                compressed_size: compressed.len() as u32,
                uncompressed_size: payload.len() as u32,
            });
            chunks.push(chunk);
            body.extend_from_slice(&compressed);
        }
        body.extend_from_slice(&write_trailer(bundle_id, &records));
        (body, chunks)
    }

    #[test]
    fn opens_chunks_from_a_local_bundle() {
        let cdn = tempfile::tempdir().expect("tempdir");
        let root = cdn.path().join("bundles");
        fs::create_dir_all(&root).expect("mkdir");
        let (bundle, chunks) = build_bundle(0xb1, &[(0xc1, b"alpha"), (0xc2, b"beta")]);
        fs::write(root.join(format!("{:016X}.bundle", 0xb1u64)), &bundle).expect("write");

        let mut cache = ChunkCache::new(cdn.path(), "").expect("cache");
        assert_eq!(cache.open_chunk(&chunks[0]).expect("chunk"), b"alpha");
        assert_eq!(cache.open_chunk(&chunks[1]).expect("chunk"), b"beta");
        // slot reuse keeps returning the same content
        assert_eq!(cache.open_chunk(&chunks[1]).expect("chunk"), b"beta");
    }

    #[test]
    fn root_leaf_decides_the_mode() {
        let cdn = tempfile::tempdir().expect("tempdir");
        let chunks_dir = cdn.path().join("chunks");
        fs::create_dir_all(&chunks_dir).expect("mkdir");
        fs::write(chunks_dir.join(format!("{:016X}.chunk", 0xc9u64)), b"gamma").expect("write");

        let mut cache = ChunkCache::new(&chunks_dir, "").expect("cache");
        let chunk = make_chunk(0xc9, 0xb9, 5);
        assert_eq!(cache.open_chunk(&chunk).expect("chunk"), b"gamma");
    }

    #[test]
    fn missing_data_without_a_remote_is_fatal() {
        let cdn = tempfile::tempdir().expect("tempdir");
        let mut cache = ChunkCache::new(cdn.path(), "").expect("cache");
        let chunk = make_chunk(0xdead, 0xbeef, 4);
        assert!(cache.open_chunk(&chunk).is_err());
        crate::trace::drain();
    }

    #[test]
    fn bad_decompressed_length_is_fatal() {
        let cdn = tempfile::tempdir().expect("tempdir");
        let root = cdn.path().join("bundles");
        fs::create_dir_all(&root).expect("mkdir");
        let (bundle, mut chunks) = build_bundle(0xb1, &[(0xc1, b"alpha")]);
        fs::write(root.join(format!("{:016X}.bundle", 0xb1u64)), &bundle).expect("write");

        let mut cache = ChunkCache::new(cdn.path(), "").expect("cache");
        chunks[0].uncompressed_size = 3;
        assert!(cache.open_chunk(&chunks[0]).is_err());
        crate::trace::drain();
    }
}
