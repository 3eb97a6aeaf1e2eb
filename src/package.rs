use std::collections::btree_map::{self, BTreeMap};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PackageError {
    #[error("duplicate path in package: {0}")]
    DuplicatePath(String),

    #[error("invalid package path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// One path names a file that the other needs as a directory.
    #[error("package path {path} conflicts with {existing}: a file cannot also be a directory")]
    FileDirectoryConflict { path: String, existing: String },
}

/// The unpacked extension: in-package path to file content.
///
/// Paths are stored normalized (`/dir/file.js`) and iterate in sorted order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Package {
    files: BTreeMap<String, Vec<u8>>,
}

impl Package {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file. Fails if the normalized path is already present, or if
    /// it would turn an existing file into a directory (or the reverse).
    pub fn insert(
        &mut self,
        path: impl AsRef<str>,
        content: impl Into<Vec<u8>>,
    ) -> Result<(), PackageError> {
        let path = normalize_path(path.as_ref())?;
        if let Some(existing) = self.tree_conflict(&path) {
            return Err(PackageError::FileDirectoryConflict { path, existing });
        }
        match self.files.entry(path) {
            btree_map::Entry::Occupied(entry) => {
                Err(PackageError::DuplicatePath(entry.key().clone()))
            }
            btree_map::Entry::Vacant(entry) => {
                entry.insert(content.into());
                Ok(())
            }
        }
    }

    /// An existing file that is an ancestor of `path`, or that lives below it.
    fn tree_conflict(&self, path: &str) -> Option<String> {
        let ancestor = path
            .match_indices('/')
            .skip(1)
            .map(|(idx, _)| &path[..idx])
            .find(|dir| self.files.contains_key(*dir));
        if let Some(dir) = ancestor {
            return Some(dir.to_string());
        }

        let prefix = format!("{path}/");
        self.files
            .range(prefix.clone()..)
            .next()
            .map(|(key, _)| key)
            .filter(|key| key.starts_with(&prefix))
            .cloned()
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        let path = normalize_path(path).ok()?;
        self.files.get(&path).map(Vec::as_slice)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Swap in new content for an existing file, returning the old content.
    ///
    /// Returns `None` and leaves the package untouched when the path is absent.
    pub fn replace(&mut self, path: &str, content: Vec<u8>) -> Option<Vec<u8>> {
        let path = normalize_path(path).ok()?;
        let slot = self.files.get_mut(&path)?;
        Some(std::mem::replace(slot, content))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.files
            .iter()
            .map(|(path, content)| (path.as_str(), content.as_slice()))
    }

    /// Deterministic byte encoding of the whole tree.
    ///
    /// For every file in path order: path bytes, a NUL, the content length as
    /// 8 little-endian bytes, then the content. Used as the integrity input for
    /// sources that have no single archive file.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let total: usize = self
            .files
            .iter()
            .map(|(path, content)| path.len() + 1 + 8 + content.len())
            .sum();

        let mut out = Vec::with_capacity(total);
        for (path, content) in &self.files {
            out.extend_from_slice(path.as_bytes());
            out.push(0);
            out.extend_from_slice(&(content.len() as u64).to_le_bytes());
            out.extend_from_slice(content);
        }
        out
    }
}

/// Normalize an in-package path to `/a/b.js` form.
///
/// Backslashes become slashes, empty and `.` segments are dropped, and `..`
/// segments are rejected so no entry can name a location outside the tree.
pub fn normalize_path(path: &str) -> Result<String, PackageError> {
    let mut normalized = String::with_capacity(path.len() + 1);
    for segment in path.split(|c: char| c == '/' || c == '\\') {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(PackageError::InvalidPath {
                    path: path.to_string(),
                    reason: "parent directory segments are not allowed",
                })
            }
            segment => {
                normalized.push('/');
                normalized.push_str(segment);
            }
        }
    }

    if normalized.is_empty() {
        return Err(PackageError::InvalidPath {
            path: path.to_string(),
            reason: "path names no file",
        });
    }
    Ok(normalized)
}
