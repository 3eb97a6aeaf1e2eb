//! Extension Patcher: integrity-checked patching of third-party browser extensions
//!
//! Lets a downstream distribution change an extension's behavior without owning
//! its source, by rewriting files inside the fetched package before it is loaded.
//!
//! # Architecture
//!
//! Every text edit compiles down to one primitive: an exact substring
//! replacement with a pinned occurrence count ([`replace::replace`]). A
//! [`FileProcessor`] chains such steps for one in-package file, and a
//! [`PatchSession`] runs a whole [`Catalogue`] against a package after the
//! package's SHA-256 matched the pinned digest.
//!
//! # Drift detection
//!
//! - The package hash must match before anything is patched
//! - Every replacement must occur exactly the pinned number of times
//! - Structural edits fail when their anchor is missing
//! - A file is only replaced after its whole chain succeeded
//! - A session emits a fully patched package or nothing
//!
//! # Example
//!
//! ```no_run
//! use extension_patcher::{
//!     ArchiveSource, Catalogue, DirectorySink, FileProcessor, Metadata, PatchSession, Step,
//! };
//!
//! let catalogue = Catalogue::new(Metadata::new(
//!     "infinity-ninja",
//!     "87cb6e2d49d5a31c263e24314ff9a4eb7bcb3111095c0392571ed7cf473ff35f",
//! ))
//! .file(
//!     FileProcessor::new("/ctxcontent/index.js")
//!         .step(Step::replace("new DataHelper(UNIVERSE)", "new DataHelper(HOST, UNIVERSE)", 2)),
//! );
//!
//! match PatchSession::new(&catalogue).run_into(
//!     &ArchiveSource::new("infinity-2.4.1.crx"),
//!     &DirectorySink::new("out/infinity"),
//! ) {
//!     Ok((_, path)) => println!("patched extension at {}", path.display()),
//!     Err(e) => eprintln!("refusing to patch: {}", e),
//! }
//! ```

pub mod catalogue;
pub mod integrity;
pub mod package;
pub mod processor;
pub mod replace;
pub mod session;
pub mod source;
pub mod transform;

// Re-exports
pub use catalogue::{
    load_from_path, load_from_str, Catalogue, ConfigError, Metadata, ValidationError,
    ValidationIssue,
};
pub use integrity::{Digest, IntegrityError};
pub use package::{Package, PackageError};
pub use processor::{FileChange, FileProcessor, ProcessError};
pub use replace::{replace, ReplaceError, ReplacementSpec};
pub use session::{
    FailureKind, FailurePolicy, FileReport, PatchOutcome, PatchSession, SessionError,
    SessionObserver, SessionState,
};
pub use source::{
    open_source, ArchiveSource, DirectorySink, DirectorySource, Fetched, MemorySource,
    PackageSink, PackageSource, SourceError,
};
pub use transform::{JsonEdit, Position, Step, TransformError};
