//! # Common Types and Error Handling
//!
//! This module provides the types shared across every container backend:
//! - The crate-wide error enum and result alias
//! - The [`Location`] provenance chain attached to files and managers
//! - The [`Checksums`] record computed on demand from an open file

use std::fmt;
use std::rc::Rc;

pub type QuarryResult<R> = Result<R, QuarryError>;

/// Ordered list of `(algorithm, value)` pairs computed from an open file.
///
/// Regular files carry `md5` and `sha1` hex digests; symbolic entries carry a
/// single `link` pair whose value is the link target.
pub type Checksums = Vec<(&'static str, String)>;

/// Represents errors that can occur while inspecting or extracting containers
///
/// Every condition listed here is fatal to the operation in progress; the
/// caller unwinds and the accumulated trace describes where the failure
/// happened.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum QuarryError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("malformed container: {0}")]
    Format(String),
    #[error("decompression failed: {0}")]
    Decompress(String),
    #[error("remote fetch failed: {0}")]
    Http(String),
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("invalid hash literal: {0}")]
    HashParse(String),
    #[error("links cannot be opened")]
    LinkNotReadable,
    #[error("generic error: {0}")]
    Generic(String),
}

impl From<String> for QuarryError {
    fn from(value: String) -> Self {
        QuarryError::Generic(value)
    }
}

impl From<&str> for QuarryError {
    fn from(value: &str) -> Self {
        QuarryError::Generic(value.to_string())
    }
}

impl From<std::io::Error> for QuarryError {
    fn from(e: std::io::Error) -> Self {
        QuarryError::Io(format!("{:?}", e))
    }
}

impl From<reqwest::Error> for QuarryError {
    fn from(e: reqwest::Error) -> Self {
        QuarryError::Http(format!("{:?}", e))
    }
}

/// Bails out of the enclosing function with [`QuarryError::Format`] when the
/// condition does not hold.
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $($arg:tt)+) => {
        if !($cond) {
            return Err($crate::common::QuarryError::Format(format!($($arg)+)));
        }
    };
}

/// Provenance chain of a file: an optional parent plus a path fragment.
///
/// Managers share one location with every file they emit, so a file nested in
/// an archive inside a manifest renders as `manifest/archive/entry`. The
/// chain is immutable after construction and never cyclic.
#[derive(Debug)]
pub struct Location {
    parent: Option<Rc<Location>>,
    path: String,
}

impl Location {
    pub fn root(path: impl Into<String>) -> Rc<Self> {
        Rc::new(Self {
            parent: None,
            path: path.into(),
        })
    }

    pub fn child(parent: &Rc<Location>, path: impl Into<String>) -> Rc<Self> {
        Rc::new(Self {
            parent: Some(Rc::clone(parent)),
            path: path.into(),
        })
    }

}

impl Location {
    fn fmt_chain(&self, f: &mut fmt::Formatter<'_>, wrote: &mut bool) -> fmt::Result {
        if let Some(parent) = &self.parent {
            parent.fmt_chain(f, wrote)?;
        }
        if !self.path.is_empty() {
            if *wrote {
                write!(f, "/")?;
            }
            write!(f, "{}", self.path)?;
            *wrote = true;
        }
        Ok(())
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut wrote = false;
        self.fmt_chain(f, &mut wrote)
    }
}
