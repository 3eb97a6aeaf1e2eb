use crate::integrity::Digest;
use crate::package::normalize_path;
use crate::processor::FileProcessor;
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;

/// A patch catalogue for one pinned upstream build of one extension.
#[derive(Debug, Deserialize, Clone)]
pub struct Catalogue {
    pub meta: Metadata,
    #[serde(default)]
    pub files: Vec<FileProcessor>,
}

impl Catalogue {
    pub fn new(meta: Metadata) -> Self {
        Self {
            meta,
            files: Vec::new(),
        }
    }

    #[must_use]
    pub fn file(mut self, processor: FileProcessor) -> Self {
        self.files.push(processor);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut issues = Vec::new();

        if self.meta.name.trim().is_empty() {
            issues.push(ValidationIssue::MissingField {
                field: "meta.name",
            });
        }
        if self.meta.sha256.trim().is_empty() {
            issues.push(ValidationIssue::MissingField {
                field: "meta.sha256",
            });
        } else if Digest::parse(&self.meta.sha256).is_err() {
            issues.push(ValidationIssue::InvalidHash {
                value: self.meta.sha256.clone(),
            });
        }

        if self.files.is_empty() {
            issues.push(ValidationIssue::EmptyFileList);
        }

        let mut seen = HashSet::new();
        for processor in &self.files {
            if processor.path.trim().is_empty() {
                issues.push(ValidationIssue::MissingField {
                    field: "files.path",
                });
                continue;
            }

            let label = match normalize_path(&processor.path) {
                Ok(normalized) => {
                    if !seen.insert(normalized.clone()) {
                        issues.push(ValidationIssue::DuplicatePath {
                            path: normalized.clone(),
                        });
                    }
                    normalized
                }
                Err(err) => {
                    issues.push(ValidationIssue::InvalidPath {
                        path: processor.path.clone(),
                        message: err.to_string(),
                    });
                    processor.path.clone()
                }
            };

            for (idx, step) in processor.steps.iter().enumerate() {
                if let Err(message) = step.validate() {
                    issues.push(ValidationIssue::InvalidStep {
                        path: label.clone(),
                        step: idx + 1,
                        message,
                    });
                }
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { issues })
        }
    }

    /// Number of steps across all files.
    pub fn step_count(&self) -> usize {
        self.files.iter().map(|f| f.steps.len()).sum()
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Metadata {
    #[serde(default)]
    pub name: String,
    /// Upstream extension identifier (webstore id or slug).
    #[serde(default)]
    pub extension: Option<String>,
    /// Upstream version the pinned hash belongs to.
    #[serde(default)]
    pub version: Option<String>,
    /// Pinned SHA-256 of the as-fetched package, hex.
    #[serde(default)]
    pub sha256: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl Metadata {
    pub fn new(name: impl Into<String>, sha256: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sha256: sha256.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationError {
    /// Catalogue files with at least one issue, in first-reported order.
    pub fn files(&self) -> Vec<&str> {
        let mut files: Vec<&str> = Vec::new();
        for file in self.issues.iter().filter_map(ValidationIssue::file) {
            if !files.contains(&file) {
                files.push(file);
            }
        }
        files
    }
}

/// Catalogue-wide issues come first, then one block per offending file.
impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.issues.len();
        write!(f, "{count} issue{}", if count == 1 { "" } else { "s" })?;
        for issue in self.issues.iter().filter(|issue| issue.file().is_none()) {
            write!(f, "\n  - {issue}")?;
        }
        for file in self.files() {
            write!(f, "\n  {file}:")?;
            for issue in self.issues.iter().filter(|issue| issue.file() == Some(file)) {
                write!(f, "\n    - ")?;
                issue.describe(f)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    EmptyFileList,
    MissingField {
        field: &'static str,
    },
    InvalidHash {
        value: String,
    },
    InvalidPath {
        path: String,
        message: String,
    },
    DuplicatePath {
        path: String,
    },
    InvalidStep {
        path: String,
        step: usize,
        message: String,
    },
}

impl ValidationIssue {
    /// Normalized catalogue path the issue is about, if any.
    pub fn file(&self) -> Option<&str> {
        match self {
            ValidationIssue::InvalidPath { path, .. }
            | ValidationIssue::DuplicatePath { path }
            | ValidationIssue::InvalidStep { path, .. } => Some(path),
            _ => None,
        }
    }

    fn describe(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::EmptyFileList => write!(f, "catalogue contains no files"),
            ValidationIssue::MissingField { field } => {
                write!(f, "missing required field '{field}'")
            }
            ValidationIssue::InvalidHash { value } => {
                write!(f, "meta.sha256 '{value}' is not a 64-character hex digest")
            }
            ValidationIssue::InvalidPath { message, .. } => {
                write!(f, "has an invalid path: {message}")
            }
            ValidationIssue::DuplicatePath { .. } => write!(f, "is listed more than once"),
            ValidationIssue::InvalidStep { step, message, .. } => {
                write!(f, "step {step}: {message}")
            }
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(path) = self.file() {
            write!(f, "file '{path}' ")?;
        }
        self.describe(f)
    }
}
