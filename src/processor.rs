//! File processors: one in-package file and the ordered steps that patch it.

use crate::package::Package;
use crate::session::FailureKind;
use crate::transform::{Step, TransformError};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    /// The package layout no longer has the file the processor targets.
    #[error("file not found in package: {path}")]
    FileNotFound { path: String },

    #[error("{path}: step {step} ({description}) failed: {source}")]
    Step {
        path: String,
        /// 1-based index in the chain.
        step: usize,
        description: String,
        source: TransformError,
    },
}

impl ProcessError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ProcessError::FileNotFound { .. } => FailureKind::FileNotFound,
            ProcessError::Step { source, .. } => source.kind(),
        }
    }
}

/// Bytes before and after a processor ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileChange {
    pub before_len: usize,
    pub after_len: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileProcessor {
    pub path: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl FileProcessor {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            steps: Vec::new(),
        }
    }

    /// Builder-style step registration.
    #[must_use]
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Run the chain on raw bytes. Each step sees the previous step's output.
    pub fn run(&self, input: &[u8]) -> Result<Vec<u8>, ProcessError> {
        let mut current = input.to_vec();
        for (idx, step) in self.steps.iter().enumerate() {
            debug!(file = %self.path, step = idx + 1, "{}", step.describe());
            current = step.apply(&current).map_err(|source| ProcessError::Step {
                path: self.path.clone(),
                step: idx + 1,
                description: step.describe(),
                source,
            })?;
        }
        Ok(current)
    }

    /// Patch this processor's file inside `package`.
    ///
    /// The file is replaced only when every step succeeds; on error the
    /// package still holds the content it had before the call.
    pub fn process(&self, package: &mut Package) -> Result<FileChange, ProcessError> {
        let original = package
            .get(&self.path)
            .ok_or_else(|| ProcessError::FileNotFound {
                path: self.path.clone(),
            })?;
        let before_len = original.len();

        let patched = self.run(original)?;
        let after_len = patched.len();

        package
            .replace(&self.path, patched)
            .ok_or_else(|| ProcessError::FileNotFound {
                path: self.path.clone(),
            })?;

        Ok(FileChange {
            before_len,
            after_len,
        })
    }
}
