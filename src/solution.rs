//! # Solution Manifest Provider
//!
//! A solution manifest is a line-based textual index naming the projects of
//! one release and the locales each project ships for. The manager is a thin
//! composer: it opens every referenced release manifest under the cdn and
//! concatenates their listings, skipping projects outside the caller's
//! language filter.
//!
//! ## Format
//!
//! Header literal `RADS Solution Manifest`, then manifest version, solution
//! name and solution version, one per line. A decimal project count follows
//! with four lines per project (name, version, two unknowns), then a decimal
//! locale count with per-locale records: locale name, one unknown, a project
//! count and that many project names.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::rc::Rc;

use crate::common::{Location, QuarryError, QuarryResult};
use crate::ensure;
use crate::provider::{File, Manager, SharedReader};
use crate::raw::RawFile;
use crate::release::ReleaseManager;
use crate::trace::Traced;

#[derive(Debug)]
pub struct ProjectEntry {
    pub version: String,
    pub unknown1: u64,
    pub unknown2: u64,
}

#[derive(Debug)]
pub struct LocaleEntry {
    pub projects: Vec<String>,
    pub unknown1: u64,
}

/// One project with the set of locales that reference it.
#[derive(Debug)]
pub struct SolutionEntry {
    pub name: String,
    pub version: String,
    pub locales: BTreeSet<String>,
}

impl SolutionEntry {
    pub fn has_locale(&self, langs: &BTreeSet<String>) -> bool {
        langs.is_empty() || langs.iter().any(|lang| self.locales.contains(lang))
    }
}

#[derive(Debug)]
pub struct SolutionManifest {
    pub manifest_version: String,
    pub solution_name: String,
    pub solution_version: String,
    pub projects: BTreeMap<String, ProjectEntry>,
    pub locales: BTreeMap<String, LocaleEntry>,
}

struct Lines<'a> {
    remaining: &'a str,
}

impl<'a> Lines<'a> {
    fn new(text: &'a str) -> Self {
        Self { remaining: text }
    }

    fn next_line(&mut self) -> &'a str {
        let (line, rest) = match self.remaining.split_once('\n') {
            Some((line, rest)) => (line, rest),
            None => (self.remaining, ""),
        };
        self.remaining = rest;
        line.trim_end_matches('\r')
    }

    fn next_string(&mut self) -> QuarryResult<String> {
        let line = self.next_line();
        ensure!(!line.is_empty(), "unexpected blank manifest line");
        Ok(line.to_string())
    }

    fn next_number(&mut self) -> QuarryResult<u64> {
        let line = self.next_line();
        line.parse::<u64>()
            .map_err(|_| QuarryError::Format(format!("expected a decimal count, got {:?}", line)))
    }
}

impl SolutionManifest {
    pub fn read(data: &[u8]) -> QuarryResult<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| QuarryError::Format(format!("solution manifest is not UTF-8: {:?}", e)))?;
        let mut lines = Lines::new(text);
        ensure!(
            lines.next_line() == "RADS Solution Manifest",
            "solution manifest header mismatch"
        );
        let manifest_version = lines.next_string()?;
        let solution_name = lines.next_string()?;
        let solution_version = lines.next_string()?;

        let mut projects = BTreeMap::new();
        let project_count = lines.next_number()?;
        for _ in 0..project_count {
            let name = lines.next_string()?;
            let version = lines.next_string()?;
            let unknown1 = lines.next_number()?;
            let unknown2 = lines.next_number()?;
            projects.insert(
                name,
                ProjectEntry {
                    version,
                    unknown1,
                    unknown2,
                },
            );
        }

        let mut locales = BTreeMap::new();
        let locale_count = lines.next_number()?;
        for _ in 0..locale_count {
            let name = lines.next_string()?.to_lowercase();
            let unknown1 = lines.next_number()?;
            let referenced = lines.next_number()?;
            let mut entries = Vec::with_capacity(referenced as usize);
            for _ in 0..referenced {
                entries.push(lines.next_string()?);
            }
            locales.insert(
                name,
                LocaleEntry {
                    projects: entries,
                    unknown1,
                },
            );
        }

        Ok(Self {
            manifest_version,
            solution_name,
            solution_version,
            projects,
            locales,
        })
    }

    /// Computes the locale set of every project. A project referenced by no
    /// locale or by all of them is language-neutral and reports `{none}`.
    pub fn list_projects(&self) -> Vec<SolutionEntry> {
        let mut project_locales: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
        for (locale_name, locale) in &self.locales {
            for project in &locale.projects {
                project_locales
                    .entry(project)
                    .or_default()
                    .insert(locale_name.clone());
            }
        }
        self.projects
            .iter()
            .map(|(name, project)| {
                let mut locales = project_locales.remove(name.as_str()).unwrap_or_default();
                if locales.is_empty() || locales.len() == self.locales.len() {
                    locales = BTreeSet::from(["none".to_string()]);
                }
                SolutionEntry {
                    name: name.clone(),
                    version: project.version.clone(),
                    locales,
                }
            })
            .collect()
    }
}

pub struct SolutionManager {
    managers: Vec<ReleaseManager>,
}

impl SolutionManager {
    pub fn new(
        source: SharedReader,
        cdn: &Path,
        langs: &BTreeSet<String>,
        location: &Rc<Location>,
    ) -> QuarryResult<Self> {
        let manifest = {
            let mut source = source.borrow_mut();
            SolutionManifest::read(source.read_all()?)?
        };
        let mut managers = Vec::new();
        for project in manifest.list_projects() {
            if !project.has_locale(langs) {
                continue;
            }
            let path = cdn
                .join("projects")
                .join(&project.name)
                .join("releases")
                .join(&project.version)
                .join("releasemanifest");
            let child = Location::child(location, project.name.clone());
            let reader =
                RawFile::make_reader(&path).traced(|| format!("project: {}", project.name))?;
            managers.push(
                ReleaseManager::new(reader, cdn, &child)
                    .traced(|| format!("project: {}", project.name))?,
            );
        }
        Ok(Self { managers })
    }
}

impl Manager for SolutionManager {
    fn list(&self) -> QuarryResult<Vec<Rc<dyn File>>> {
        let mut result = Vec::new();
        for manager in &self.managers {
            result.extend(manager.list()?);
        }
        Ok(result)
    }
}
