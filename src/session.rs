//! Patch sessions: one end-to-end run from fetched package to patched output.
//!
//! A session moves through `Fetched -> Verified -> Patching -> Patched`, or
//! stops in `Failed` at the first problem. It never hands out a partially
//! patched package: either every processor succeeded, or the caller gets an
//! error and nothing else.

use crate::catalogue::{Catalogue, ValidationError};
use crate::integrity::{self, Digest, IntegrityError};
use crate::package::Package;
use crate::processor::{FileChange, ProcessError};
use crate::source::{Fetched, PackageSink, PackageSource, SourceError};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Classification of every way a session can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Upstream package hash differs from the pinned digest.
    IntegrityMismatch,
    /// A targeted file is missing from the package.
    FileNotFound,
    /// A pattern occurred a different number of times than pinned.
    ReplacementCountMismatch,
    /// A structural edit could not find its anchor.
    AnchorNotFound,
    /// A JSON edit or custom step rejected the file content.
    Transform,
    /// The catalogue itself is invalid.
    Configuration,
    /// Reading the package or writing the output failed.
    Source,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::IntegrityMismatch => "integrity mismatch",
            FailureKind::FileNotFound => "file not found",
            FailureKind::ReplacementCountMismatch => "replacement count mismatch",
            FailureKind::AnchorNotFound => "anchor not found",
            FailureKind::Transform => "transform failed",
            FailureKind::Configuration => "configuration error",
            FailureKind::Source => "source error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Constructed, package not fetched yet.
    Idle,
    Fetched,
    Verified,
    Patching { file: String },
    Patched,
    Failed(FailureKind),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Patched | SessionState::Failed(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Fetched => write!(f, "fetched"),
            SessionState::Verified => write!(f, "verified"),
            SessionState::Patching { file } => write!(f, "patching {file}"),
            SessionState::Patched => write!(f, "patched"),
            SessionState::Failed(kind) => write!(f, "failed ({kind})"),
        }
    }
}

/// What to do when a processor fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Stop at the first failing processor.
    #[default]
    FailFast,
    /// Run every processor and report all failures together. Still emits
    /// nothing if any processor failed.
    CollectAll,
}

/// Instrumentation hook. All methods default to no-ops.
pub trait SessionObserver {
    fn on_state(&mut self, _state: &SessionState) {}

    fn on_processor_start(&mut self, _path: &str) {}

    fn on_processor_done(&mut self, _path: &str, _result: Result<&FileChange, &ProcessError>) {}
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("invalid patch catalogue: {0}")]
    Configuration(ValidationError),

    #[error("failed to fetch package: {0}")]
    Source(#[source] SourceError),

    #[error("integrity check failed: {source}{}", version_note(.pinned_version, .upstream_version))]
    Integrity {
        source: IntegrityError,
        pinned_version: Option<String>,
        upstream_version: Option<String>,
    },

    #[error(transparent)]
    Process(ProcessError),

    #[error("{} files failed to patch:\n{}", .0.len(), list_errors(.0))]
    Multiple(Vec<ProcessError>),

    #[error("failed to write patched package: {0}")]
    Emit(#[source] SourceError),
}

fn version_note(pinned: &Option<String>, upstream: &Option<String>) -> String {
    match (pinned, upstream) {
        (Some(pinned), Some(upstream)) if pinned != upstream => {
            format!(" (upstream version is {upstream}, catalogue pinned {pinned})")
        }
        _ => String::new(),
    }
}

fn list_errors(errors: &[ProcessError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {e}"))
        .collect::<Vec<_>>()
        .join("\n")
}

impl SessionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SessionError::Configuration(_) => FailureKind::Configuration,
            SessionError::Source(_) | SessionError::Emit(_) => FailureKind::Source,
            SessionError::Integrity { source, .. } => match source {
                IntegrityError::Mismatch { .. } => FailureKind::IntegrityMismatch,
                IntegrityError::InvalidExpected { .. } => FailureKind::Configuration,
            },
            SessionError::Process(err) => err.kind(),
            SessionError::Multiple(errors) => errors
                .first()
                .map(ProcessError::kind)
                .unwrap_or(FailureKind::Configuration),
        }
    }

    /// Every processor error carried by this error, in catalogue order.
    pub fn process_errors(&self) -> &[ProcessError] {
        match self {
            SessionError::Process(err) => std::slice::from_ref(err),
            SessionError::Multiple(errors) => errors,
            _ => &[],
        }
    }
}

/// Per-file summary of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReport {
    pub path: String,
    pub before_len: usize,
    pub after_len: usize,
}

/// Result of a session that reached `Patched`.
#[derive(Debug, Clone)]
pub struct PatchOutcome {
    pub package: Package,
    /// Digest of the verified upstream bytes.
    pub digest: Digest,
    pub version: Option<String>,
    pub files: Vec<FileReport>,
}

/// One patch run over one package. Consumed by running it.
pub struct PatchSession<'a> {
    catalogue: &'a Catalogue,
    policy: FailurePolicy,
    observer: Option<&'a mut dyn SessionObserver>,
    state: SessionState,
}

impl<'a> PatchSession<'a> {
    pub fn new(catalogue: &'a Catalogue) -> Self {
        Self {
            catalogue,
            policy: FailurePolicy::default(),
            observer: None,
            state: SessionState::Idle,
        }
    }

    #[must_use]
    pub fn policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn observer(mut self, observer: &'a mut dyn SessionObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Fetch from `source`, verify and patch.
    pub fn run(mut self, source: &dyn PackageSource) -> Result<PatchOutcome, SessionError> {
        self.check_catalogue()?;

        info!(catalogue = %self.catalogue.meta.name, source = %source.describe(), "fetching package");
        let fetched = match source.fetch() {
            Ok(fetched) => fetched,
            Err(err) => return Err(self.fail(SessionError::Source(err))),
        };
        self.patch(fetched)
    }

    /// Verify and patch a package that was already fetched.
    pub fn run_fetched(mut self, fetched: Fetched) -> Result<PatchOutcome, SessionError> {
        self.check_catalogue()?;
        self.patch(fetched)
    }

    /// Run the session and hand the patched package to `sink`.
    ///
    /// The sink is only called once the session reached `Patched`.
    pub fn run_into(
        self,
        source: &dyn PackageSource,
        sink: &dyn PackageSink,
    ) -> Result<(PatchOutcome, PathBuf), SessionError> {
        let outcome = self.run(source)?;
        let written = sink.emit(&outcome.package).map_err(SessionError::Emit)?;
        info!(out = %written.display(), "patched package written");
        Ok((outcome, written))
    }

    fn check_catalogue(&mut self) -> Result<(), SessionError> {
        self.catalogue
            .validate()
            .map_err(|err| self.fail(SessionError::Configuration(err)))
    }

    fn patch(&mut self, fetched: Fetched) -> Result<PatchOutcome, SessionError> {
        let Fetched {
            raw,
            mut package,
            version,
        } = fetched;
        let catalogue = self.catalogue;
        self.transition(SessionState::Fetched);

        let digest = match integrity::verify(&raw, &catalogue.meta.sha256) {
            Ok(digest) => digest,
            Err(source) => {
                return Err(self.fail(SessionError::Integrity {
                    source,
                    pinned_version: catalogue.meta.version.clone(),
                    upstream_version: version,
                }))
            }
        };
        drop(raw);
        self.transition(SessionState::Verified);

        if let (Some(pinned), Some(declared)) = (&catalogue.meta.version, &version) {
            if pinned != declared {
                warn!(%pinned, %declared, "hash matches but manifest version differs from catalogue");
            }
        }

        let mut files = Vec::with_capacity(catalogue.files.len());
        let mut failures = Vec::new();

        for processor in &catalogue.files {
            self.transition(SessionState::Patching {
                file: processor.path.clone(),
            });
            if let Some(observer) = self.observer.as_deref_mut() {
                observer.on_processor_start(&processor.path);
            }

            let result = processor.process(&mut package);
            if let Some(observer) = self.observer.as_deref_mut() {
                observer.on_processor_done(&processor.path, result.as_ref());
            }

            match result {
                Ok(change) => {
                    debug!(
                        file = %processor.path,
                        before = change.before_len,
                        after = change.after_len,
                        "file patched"
                    );
                    files.push(FileReport {
                        path: processor.path.clone(),
                        before_len: change.before_len,
                        after_len: change.after_len,
                    });
                }
                Err(err) => match self.policy {
                    FailurePolicy::FailFast => {
                        return Err(self.fail(SessionError::Process(err)));
                    }
                    FailurePolicy::CollectAll => {
                        warn!(error = %err, "processor failed, continuing to collect failures");
                        failures.push(err);
                    }
                },
            }
        }

        if !failures.is_empty() {
            let err = if failures.len() == 1 {
                SessionError::Process(failures.remove(0))
            } else {
                SessionError::Multiple(failures)
            };
            return Err(self.fail(err));
        }

        self.transition(SessionState::Patched);
        info!(
            catalogue = %catalogue.meta.name,
            files = files.len(),
            digest = %digest,
            "package patched"
        );

        Ok(PatchOutcome {
            package,
            digest,
            version,
            files,
        })
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(!self.state.is_terminal(), "no transitions out of {}", self.state);
        debug_assert_ne!(self.state, next, "self-transition");
        debug!(from = %self.state, to = %next, "session state");
        self.state = next;
        if let Some(observer) = self.observer.as_deref_mut() {
            observer.on_state(&self.state);
        }
    }

    fn fail(&mut self, err: SessionError) -> SessionError {
        warn!(kind = %err.kind(), error = %err, "patch session failed");
        self.transition(SessionState::Failed(err.kind()));
        err
    }
}
