//! # Orchestrator
//!
//! Walks any manager and, per file: applies the hash filter, recurses into
//! nested archives while the depth budget lasts, applies the extension
//! filter and dispatches to the selected action. Filters run in a fixed
//! order — hash filter, then extension filter, then per-action link
//! handling.

use std::collections::{BTreeSet, HashSet};
use std::io::Write;
use std::path::PathBuf;

use log::debug;

use crate::archive::ArchiveManager;
use crate::common::QuarryResult;
use crate::hashes::HashDict;
use crate::provider::{File, Manager};
use crate::trace::Traced;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// One CSV row per file.
    List,
    /// Write decompressed content under the output directory.
    Extract,
    /// Emit the row and extract under the content-addressed id.
    Index,
    /// Report the product version embedded in executables.
    ExeVer,
    /// Emit md5/sha1 digests, or the link target.
    Checksum,
}

pub struct App {
    pub action: Action,
    pub output: PathBuf,
    pub extensions: BTreeSet<String>,
    pub names: HashSet<u64>,
    pub max_depth: u32,
    pub show_archives: bool,
    pub skip_root: bool,
    pub hashes: HashDict,
}

impl App {
    pub fn run(&mut self, manager: &dyn Manager, out: &mut dyn Write) -> QuarryResult<()> {
        self.walk(manager, 1, out)
    }

    fn walk(&mut self, manager: &dyn Manager, depth: u32, out: &mut dyn Write) -> QuarryResult<()> {
        for file in manager.list()? {
            let hash = file.find_hash(&mut self.hashes);
            if !self.names.is_empty() && !self.names.contains(&hash) {
                continue;
            }
            let is_archive = file.is_archive(&mut self.hashes)?;
            if is_archive && depth < self.max_depth {
                let name = file.find_name(&mut self.hashes);
                debug!("descending into {}", name);
                let nested = ArchiveManager::from_file(file.as_ref())
                    .traced(|| format!("archive: {}", name))?;
                self.walk(&nested, depth + 1, out)?;
                if !self.show_archives {
                    continue;
                }
            }
            if depth == 1 && self.skip_root && !is_archive {
                continue;
            }
            let extension = file.find_extension(&mut self.hashes)?;
            if !self.extensions.is_empty() && !self.extensions.contains(&extension) {
                continue;
            }
            self.dispatch(file.as_ref(), hash, &extension, out)?;
        }
        Ok(())
    }

    fn dispatch(
        &mut self,
        file: &dyn File,
        hash: u64,
        extension: &str,
        out: &mut dyn Write,
    ) -> QuarryResult<()> {
        match self.action {
            Action::List => {
                let name = file.find_name(&mut self.hashes);
                writeln!(
                    out,
                    "{:016x},{},{},{},{}",
                    hash,
                    extension,
                    name,
                    file.id(),
                    file.size()?
                )?;
            }
            Action::Extract => {
                if !file.link()?.is_empty() {
                    return Ok(());
                }
                let name = file.find_name(&mut self.hashes);
                let out_name = if name.is_empty() || name.len() > 127 {
                    format!("{:016x}{}", hash, extension)
                } else {
                    name
                };
                file.extract_to(&self.output.join(&out_name))
                    .traced(|| format!("extract: {}", out_name))?;
            }
            Action::Index => {
                if !file.link()?.is_empty() {
                    return Ok(());
                }
                let name = file.find_name(&mut self.hashes);
                let id = file.id();
                writeln!(
                    out,
                    "{:016x},{},{},{},{}",
                    hash,
                    extension,
                    name,
                    id,
                    file.size()?
                )?;
                if !id.is_empty() {
                    let target = self.output.join(&id);
                    if !target.exists() {
                        file.extract_to(&target).traced(|| format!("index: {}", id))?;
                    }
                }
            }
            Action::ExeVer => {
                if extension != ".exe" {
                    return Ok(());
                }
                let reader = file.open()?;
                let mut reader = reader.borrow_mut();
                let data = reader.read_all()?;
                if let Some(version) = scan_product_version(data) {
                    drop(reader);
                    let name = file.find_name(&mut self.hashes);
                    writeln!(out, "{},{}", name, version)?;
                }
            }
            Action::Checksum => {
                let checksums = file.checksums()?;
                let rendered = checksums
                    .iter()
                    .map(|(algorithm, value)| format!("{}:{}", algorithm, value))
                    .collect::<Vec<_>>()
                    .join(";");
                let name = file.find_name(&mut self.hashes);
                writeln!(
                    out,
                    "{},{:016x}{},{},{}",
                    rendered,
                    hash,
                    extension,
                    name,
                    file.location()
                )?;
            }
        }
        Ok(())
    }
}

/// Scans executable bytes as UTF-16LE code units for a `ProductVersion`
/// marker followed by a NUL-terminated dotted-numeric string.
pub fn scan_product_version(data: &[u8]) -> Option<String> {
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    let marker: Vec<u16> = "\u{1}ProductVersion".encode_utf16().collect();

    let mut search = 0;
    while search + marker.len() <= units.len() {
        if units[search..search + marker.len()] != marker[..] {
            search += 1;
            continue;
        }
        let mut cursor = search + marker.len();
        // version strings are aligned, so padding NULs may precede them
        while cursor < units.len() && units[cursor] == 0 {
            cursor += 1;
        }
        let begin = cursor;
        while cursor < units.len() && units[cursor] != 0 {
            cursor += 1;
        }
        let candidate: String = units[begin..cursor]
            .iter()
            .filter_map(|&unit| char::from_u32(unit as u32))
            .collect();
        if !candidate.is_empty()
            && candidate.chars().all(|c| c.is_ascii_digit() || c == '.')
            && candidate.chars().any(|c| c.is_ascii_digit())
        {
            return Some(candidate);
        }
        search += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::RawManager;
    use std::fs;

    fn utf16(text: &str) -> Vec<u8> {
        text.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
    }

    #[test]
    fn finds_a_product_version() {
        let mut data = utf16("garbage before \u{1}ProductVersion\u{0}13.7.0.1234\u{0} after");
        data.extend_from_slice(&[0x00]); // stray odd byte is ignored
        assert_eq!(scan_product_version(&data), Some("13.7.0.1234".to_string()));
    }

    #[test]
    fn skips_non_numeric_candidates() {
        let data = utf16("\u{1}ProductVersion\u{0}beta\u{0}\u{1}ProductVersion\u{0}1.2.3\u{0}");
        assert_eq!(scan_product_version(&data), Some("1.2.3".to_string()));
    }

    #[test]
    fn reports_nothing_without_a_marker() {
        assert_eq!(scan_product_version(&utf16("no marker here")), None);
        assert_eq!(scan_product_version(b""), None);
    }

    fn app(action: Action) -> App {
        App {
            action,
            output: PathBuf::from("."),
            extensions: BTreeSet::new(),
            names: HashSet::new(),
            max_depth: 1,
            show_archives: false,
            skip_root: false,
            hashes: HashDict::new(),
        }
    }

    #[test]
    fn lists_a_directory_as_csv_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("a.txt"), b"hello").expect("write");
        let manager = RawManager::new(dir.path());

        let mut app = app(Action::List);
        let mut out = Vec::new();
        app.run(&manager, &mut out).expect("run");
        let text = String::from_utf8(out).expect("utf8");
        let hash = crate::hashes::hash_name("a.txt");
        assert_eq!(text, format!("{:016x},.txt,a.txt,,5\n", hash));
    }

    #[test]
    fn hash_filter_prunes_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("a.txt"), b"hello").expect("write");
        fs::write(dir.path().join("b.txt"), b"world").expect("write");
        let manager = RawManager::new(dir.path());

        let mut app = app(Action::List);
        app.names.insert(crate::hashes::hash_name("b.txt"));
        let mut out = Vec::new();
        app.run(&manager, &mut out).expect("run");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.contains("b.txt"));
        assert!(!text.contains("a.txt"));
    }

    #[test]
    fn extension_filter_prunes_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("a.txt"), b"hello").expect("write");
        fs::write(dir.path().join("b.bin"), b"world").expect("write");
        let manager = RawManager::new(dir.path());

        let mut app = app(Action::List);
        app.extensions.insert(".bin".to_string());
        let mut out = Vec::new();
        app.run(&manager, &mut out).expect("run");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.contains("b.bin"));
        assert!(!text.contains("a.txt"));
    }

    #[test]
    fn extract_writes_decompressed_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("src/nested")).expect("mkdir");
        fs::write(dir.path().join("src/nested/a.txt"), b"hello").expect("write");
        let output = tempfile::tempdir().expect("tempdir");

        let manager = RawManager::new(&dir.path().join("src"));
        let mut app = app(Action::Extract);
        app.output = output.path().to_path_buf();
        let mut out = Vec::new();
        app.run(&manager, &mut out).expect("run");
        assert_eq!(
            fs::read(output.path().join("nested/a.txt")).expect("read"),
            b"hello"
        );
        assert!(out.is_empty());
    }

    #[test]
    fn checksum_rows_carry_digests_and_location() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("hello.txt"), b"hello world").expect("write");
        let manager = RawManager::new(dir.path());

        let mut app = app(Action::Checksum);
        let mut out = Vec::new();
        app.run(&manager, &mut out).expect("run");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.starts_with("md5:5eb63bbbe01eeed093cb22bb8f5acdc3;sha1:2aae6c35c94fcfb415dbe95f408b9ce91ee846ed,"));
        assert!(text.contains(",hello.txt,"));
    }
}
