//! Access to the project's source files.
//!
//! Pattern documents expand against a [`FileTree`] and initial artifacts read
//! their bytes from it. Paths are always relative to the tree root and use
//! forward slashes.

use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use walkdir::WalkDir;

use crate::error::TreeError;

/// Directories skipped by [`FsTree`] unless configured otherwise.
pub const DEFAULT_EXCLUDE: &[&str] = &[".git", ".svn", ".shiori", "target"];

pub trait FileTree: Send + Sync {
    /// Every file in the tree, sorted. Without `recurse` only files directly
    /// in the root are listed.
    fn walk(&self, recurse: bool) -> Result<Vec<Utf8PathBuf>, TreeError>;

    /// Contents of the file at `path`, `None` if there is no such file.
    fn read(&self, path: &Utf8Path) -> Result<Option<Vec<u8>>, TreeError>;
}

/// A directory on disk.
#[derive(Debug, Clone)]
pub struct FsTree {
    root: Utf8PathBuf,
    exclude: Vec<String>,
}

impl FsTree {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            exclude: DEFAULT_EXCLUDE.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_exclude(mut self, exclude: Vec<String>) -> Self {
        self.exclude = exclude;
        self
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }
}

impl FileTree for FsTree {
    fn walk(&self, recurse: bool) -> Result<Vec<Utf8PathBuf>, TreeError> {
        let depth = if recurse { usize::MAX } else { 1 };
        let walker = WalkDir::new(&self.root)
            .max_depth(depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0
                    || !entry.file_type().is_dir()
                    || !self
                        .exclude
                        .iter()
                        .any(|name| entry.file_name().to_str() == Some(name.as_str()))
            });

        let mut paths = vec![];
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = Utf8PathBuf::try_from(entry.into_path())?;
            let Ok(relative) = path.strip_prefix(&self.root) else {
                continue;
            };
            paths.push(Utf8PathBuf::from(relative.as_str().replace('\\', "/")));
        }

        paths.sort();
        Ok(paths)
    }

    fn read(&self, path: &Utf8Path) -> Result<Option<Vec<u8>>, TreeError> {
        let full = self.root.join(path);
        if !full.is_file() {
            return Ok(None);
        }
        Ok(Some(fs::read(full)?))
    }
}

/// A file tree held in memory, for tests and generated projects.
#[derive(Debug, Clone, Default)]
pub struct MemoryTree {
    files: BTreeMap<Utf8PathBuf, Vec<u8>>,
}

impl MemoryTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, path: impl Into<Utf8PathBuf>, contents: impl Into<Vec<u8>>) -> Self {
        self.insert(path, contents);
        self
    }

    pub fn insert(&mut self, path: impl Into<Utf8PathBuf>, contents: impl Into<Vec<u8>>) {
        self.files.insert(path.into(), contents.into());
    }

    pub fn remove(&mut self, path: impl AsRef<Utf8Path>) -> Option<Vec<u8>> {
        self.files.remove(path.as_ref())
    }
}

impl FileTree for MemoryTree {
    fn walk(&self, recurse: bool) -> Result<Vec<Utf8PathBuf>, TreeError> {
        Ok(self
            .files
            .keys()
            .filter(|path| recurse || path.components().count() == 1)
            .cloned()
            .collect())
    }

    fn read(&self, path: &Utf8Path) -> Result<Option<Vec<u8>>, TreeError> {
        Ok(self.files.get(path).cloned())
    }
}
