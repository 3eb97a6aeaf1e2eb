//! Package collaborators: where the upstream package comes from and where the
//! patched tree goes.

use crate::package::{normalize_path, Package, PackageError};
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

const CRX_MAGIC: &[u8] = b"Cr24";

/// Upper bound on the buffer reserved from an entry's declared size.
const MAX_PREALLOC: u64 = 1 << 20;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid archive {path}: {reason}")]
    Archive { path: PathBuf, reason: String },

    #[error(transparent)]
    Package(#[from] PackageError),

    #[error("output directory {0} is not empty")]
    OutputNotEmpty(PathBuf),

    #[error("non-UTF-8 path in package: {0}")]
    NonUtf8Path(PathBuf),
}

impl SourceError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        SourceError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// What a source hands to a session.
#[derive(Debug, Clone)]
pub struct Fetched {
    /// Bytes the integrity digest is computed over, exactly as fetched.
    pub raw: Vec<u8>,
    pub package: Package,
    /// Declared upstream version (`manifest.json` `version`), if any.
    pub version: Option<String>,
}

impl Fetched {
    /// Build from a package whose canonical tree encoding is the integrity input.
    pub fn from_package(package: Package) -> Self {
        let raw = package.canonical_bytes();
        let version = declared_version(&package);
        Self {
            raw,
            package,
            version,
        }
    }
}

pub trait PackageSource {
    fn fetch(&self) -> Result<Fetched, SourceError>;

    /// Label for logs.
    fn describe(&self) -> String;
}

pub trait PackageSink {
    /// Write the patched package and return where it landed.
    fn emit(&self, package: &Package) -> Result<PathBuf, SourceError>;
}

/// The `version` field of `/manifest.json`.
pub fn declared_version(package: &Package) -> Option<String> {
    let manifest = package.get("/manifest.json")?;
    let doc: serde_json::Value = serde_json::from_slice(manifest).ok()?;
    doc.get("version")?.as_str().map(str::to_string)
}

/// An already-built package held in memory.
#[derive(Debug, Clone)]
pub struct MemorySource {
    package: Package,
}

impl MemorySource {
    pub fn new(package: Package) -> Self {
        Self { package }
    }
}

impl PackageSource for MemorySource {
    fn fetch(&self) -> Result<Fetched, SourceError> {
        Ok(Fetched::from_package(self.package.clone()))
    }

    fn describe(&self) -> String {
        format!("in-memory package ({} files)", self.package.len())
    }
}

/// An unpacked extension directory.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl PackageSource for DirectorySource {
    fn fetch(&self) -> Result<Fetched, SourceError> {
        let mut package = Package::new();

        for entry in WalkDir::new(&self.root).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(&self.root).to_path_buf();
                SourceError::Io {
                    path,
                    source: e.into(),
                }
            })?;
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|_| SourceError::NonUtf8Path(entry.path().to_path_buf()))?;
            let relative = relative
                .to_str()
                .ok_or_else(|| SourceError::NonUtf8Path(relative.to_path_buf()))?;

            let content = fs::read(entry.path()).map_err(|e| SourceError::io(entry.path(), e))?;
            package.insert(relative, content)?;
        }

        debug!(root = %self.root.display(), files = package.len(), "read extension directory");
        Ok(Fetched::from_package(package))
    }

    fn describe(&self) -> String {
        format!("directory {}", self.root.display())
    }
}

/// A `.crx` (v2 or v3) or plain `.zip` extension archive.
#[derive(Debug, Clone)]
pub struct ArchiveSource {
    path: PathBuf,
}

impl ArchiveSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn invalid(&self, reason: impl Into<String>) -> SourceError {
        SourceError::Archive {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }

    /// Offset of the ZIP payload inside a CRX file; 0 for a plain ZIP.
    fn zip_offset(&self, data: &[u8]) -> Result<usize, SourceError> {
        if !data.starts_with(CRX_MAGIC) {
            return Ok(0);
        }
        if data.len() < 12 {
            return Err(self.invalid("CRX header truncated"));
        }

        let read_u32 = |at: usize| -> usize {
            u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]) as usize
        };
        let offset = match read_u32(4) {
            // magic, version, public key length, signature length
            2 => {
                if data.len() < 16 {
                    return Err(self.invalid("CRX2 header truncated"));
                }
                16 + read_u32(8) + read_u32(12)
            }
            // magic, version, header length
            3 => 12 + read_u32(8),
            other => return Err(self.invalid(format!("unsupported CRX version {other}"))),
        };

        if offset >= data.len() {
            return Err(self.invalid("CRX header length exceeds file size"));
        }
        Ok(offset)
    }
}

impl PackageSource for ArchiveSource {
    fn fetch(&self) -> Result<Fetched, SourceError> {
        let raw = fs::read(&self.path).map_err(|e| SourceError::io(&self.path, e))?;
        let offset = self.zip_offset(&raw)?;

        let mut archive = zip::ZipArchive::new(Cursor::new(&raw[offset..]))
            .map_err(|e| self.invalid(e.to_string()))?;

        let mut package = Package::new();
        for idx in 0..archive.len() {
            let mut file = archive
                .by_index(idx)
                .map_err(|e| self.invalid(e.to_string()))?;
            if file.is_dir() {
                continue;
            }
            let name = file.name().to_string();
            // The header size is untrusted until the integrity check ran.
            let hint = file.size().min(MAX_PREALLOC) as usize;
            let mut content = Vec::with_capacity(hint);
            file.read_to_end(&mut content)
                .map_err(|e| SourceError::io(&self.path, e))?;
            package.insert(&name, content)?;
        }

        debug!(archive = %self.path.display(), files = package.len(), "unpacked extension archive");
        let version = declared_version(&package);
        Ok(Fetched {
            raw,
            package,
            version,
        })
    }

    fn describe(&self) -> String {
        format!("archive {}", self.path.display())
    }
}

/// Pick a source by looking at the path: directories are read as unpacked
/// trees, anything else as an archive.
pub fn open_source(path: &Path) -> Box<dyn PackageSource> {
    if path.is_dir() {
        Box::new(DirectorySource::new(path))
    } else {
        Box::new(ArchiveSource::new(path))
    }
}

/// Writes the package as an unpacked, loadable extension directory.
///
/// With `overwrite` set, an existing output tree is replaced as a whole, so
/// no file from an earlier build survives.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
    overwrite: bool,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            overwrite: false,
        }
    }

    /// Allow writing into a directory that already has content.
    #[must_use]
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

impl PackageSink for DirectorySink {
    /// Writes the whole tree into a staging directory beside the output and
    /// swaps it into place once every file is on disk. A failed emit leaves
    /// the output exactly as it was.
    fn emit(&self, package: &Package) -> Result<PathBuf, SourceError> {
        let parent = match self.root.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(|e| SourceError::io(parent, e))?;

        let existing = match fs::symlink_metadata(&self.root) {
            Ok(meta) if meta.is_dir() => true,
            Ok(_) => {
                return Err(SourceError::io(
                    &self.root,
                    std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        "output path exists and is not a directory",
                    ),
                ))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(SourceError::io(&self.root, e)),
        };
        if existing && !self.overwrite {
            let mut entries = fs::read_dir(&self.root).map_err(|e| SourceError::io(&self.root, e))?;
            if entries.next().is_some() {
                return Err(SourceError::OutputNotEmpty(self.root.clone()));
            }
        }

        let staging = staging_dir(parent)?;
        for (path, content) in package.iter() {
            // Re-normalizing guarantees no `..` or absolute component survives.
            let relative = normalize_path(path)?;
            let target = staging.path().join(relative.trim_start_matches('/'));
            if let Some(dir) = target.parent() {
                fs::create_dir_all(dir).map_err(|e| SourceError::io(dir, e))?;
            }
            write_synced(&target, content)?;
        }

        // The previous tree is parked inside a second staging directory so it
        // can be restored if the final rename fails, and is dropped with it.
        let retired = staging_dir(parent)?;
        let parked = retired.path().join("previous");
        if existing {
            fs::rename(&self.root, &parked).map_err(|e| SourceError::io(&self.root, e))?;
        }
        if let Err(e) = fs::rename(staging.path(), &self.root) {
            if existing {
                let _ = fs::rename(&parked, &self.root);
            }
            return Err(SourceError::io(&self.root, e));
        }

        let root = self
            .root
            .canonicalize()
            .map_err(|e| SourceError::io(&self.root, e))?;
        debug!(out = %root.display(), files = package.len(), replaced = existing, "wrote patched extension");
        Ok(root)
    }
}

fn staging_dir(parent: &Path) -> Result<tempfile::TempDir, SourceError> {
    tempfile::Builder::new()
        .prefix(".extension-patcher-")
        .tempdir_in(parent)
        .map_err(|e| SourceError::io(parent, e))
}

fn write_synced(path: &Path, content: &[u8]) -> Result<(), SourceError> {
    let mut file = fs::File::create(path).map_err(|e| SourceError::io(path, e))?;
    file.write_all(content)
        .map_err(|e| SourceError::io(path, e))?;
    file.sync_all().map_err(|e| SourceError::io(path, e))
}
