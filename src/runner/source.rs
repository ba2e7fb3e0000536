//! Source snapshots
//!
//! Every run records the source files that produced it. [`SourceCopier`]
//! selects files under the source root with include/exclude regexes, can
//! clone the selection into the storage dir, pack it into a deterministic
//! zip, and later remove exactly what it copied.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::debug;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::config::{compile_patterns, RunnerConfigError};

/// Errors from source snapshot operations
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error(transparent)]
    Pattern(#[from] RunnerConfigError),

    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
}

/// Result alias for source snapshot operations
pub type Result<T> = std::result::Result<T, SourceError>;

/// Selects and copies source files by regex.
///
/// Patterns match the `/`-prefixed, `/`-separated path of each entry
/// relative to the source root (`/dir/train.py`), so they can anchor on
/// path segments. A directory whose path matches an exclude is pruned
/// without descending.
pub struct SourceCopier {
    source_dir: PathBuf,
    dest_dir: PathBuf,
    includes: Vec<Regex>,
    excludes: Vec<Regex>,
    copied: Vec<PathBuf>,
}

impl SourceCopier {
    pub fn new(
        source_dir: impl Into<PathBuf>,
        dest_dir: impl Into<PathBuf>,
        includes: &[String],
        excludes: &[String],
    ) -> Result<Self> {
        Ok(Self {
            source_dir: source_dir.into(),
            dest_dir: dest_dir.into(),
            includes: compile_patterns(includes, "source.includes")?,
            excludes: compile_patterns(excludes, "source.excludes")?,
            copied: Vec::new(),
        })
    }

    fn is_excluded(&self, rel: &str) -> bool {
        self.excludes.iter().any(|p| p.is_match(rel))
    }

    fn is_included(&self, rel: &str) -> bool {
        self.includes.iter().any(|p| p.is_match(rel))
    }

    /// The selected files, as sorted paths relative to the source root.
    pub fn select(&self) -> Result<Vec<PathBuf>> {
        if !self.source_dir.is_dir() {
            return Err(SourceError::NotADirectory(self.source_dir.clone()));
        }
        let mut files = Vec::new();
        self.walk(&self.source_dir, "", &mut files)?;
        files.sort();
        Ok(files)
    }

    fn walk(&self, dir: &Path, prefix: &str, out: &mut Vec<PathBuf>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let rel = format!("{prefix}/{name}");
            let file_type = entry.file_type()?;

            if file_type.is_dir() {
                if !self.is_excluded(&rel) {
                    self.walk(&entry.path(), &rel, out)?;
                }
            } else if file_type.is_file() && self.is_included(&rel) && !self.is_excluded(&rel) {
                out.push(PathBuf::from(&rel[1..]));
            }
        }
        Ok(())
    }

    /// Copy the selection into the destination dir, preserving layout.
    /// Returns the number of files copied.
    pub fn clone_dir(&mut self) -> Result<usize> {
        let files = self.select()?;
        for rel in &files {
            let dst = self.dest_dir.join(rel);
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(self.source_dir.join(rel), &dst)?;
        }
        debug!(count = files.len(), dest = %self.dest_dir.display(), "source files copied");
        self.copied = files;
        Ok(self.copied.len())
    }

    /// Number of files copied by the last [`clone_dir`](Self::clone_dir).
    pub fn file_count(&self) -> usize {
        self.copied.len()
    }

    /// Pack the selection into a zip archive, reading from the source root.
    /// Entries are written in sorted order so identical trees produce
    /// identical archives.
    pub fn pack_zip(&self, archive_file: &Path) -> Result<usize> {
        let files = self.select()?;
        if let Some(parent) = archive_file.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut writer = ZipWriter::new(File::create(archive_file)?);
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
        for rel in &files {
            let name = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            writer.start_file(name, options)?;
            let content = fs::read(self.source_dir.join(rel))?;
            writer.write_all(&content)?;
        }
        writer.finish()?;
        Ok(files.len())
    }

    /// Remove the files copied by [`clone_dir`](Self::clone_dir) and prune
    /// directories that became empty. Files the program created in the
    /// destination dir survive.
    pub fn cleanup_dir(&mut self) -> Result<()> {
        for rel in self.copied.drain(..) {
            match fs::remove_file(self.dest_dir.join(&rel)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        prune_empty_dirs(&self.dest_dir)?;
        Ok(())
    }
}

/// Remove empty subdirectories of `dir`, bottom-up. `dir` itself stays.
fn prune_empty_dirs(dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            let path = entry.path();
            prune_empty_dirs(&path)?;
            if fs::read_dir(&path)?.next().is_none() {
                fs::remove_dir(&path)?;
            }
        }
    }
    Ok(())
}
