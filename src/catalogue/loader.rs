use crate::catalogue::schema::{Catalogue, ValidationError};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where catalogue text came from, for error messages and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Inline,
    File(PathBuf),
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Inline => write!(f, "<inline>"),
            Origin::File(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        origin: Origin,
        source: toml_edit::de::Error,
    },
    /// Parsed, but the content cannot describe a patch run.
    Invalid {
        origin: Origin,
        name: String,
        source: ValidationError,
    },
}

impl ConfigError {
    /// Number of validation issues; zero for read and parse failures.
    pub fn issue_count(&self) -> usize {
        match self {
            ConfigError::Invalid { source, .. } => source.issues.len(),
            _ => 0,
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "cannot read patch catalogue {}: {}", path.display(), source)
            }
            ConfigError::Parse { origin, source } => {
                write!(f, "patch catalogue {origin} is not valid TOML: {source}")
            }
            ConfigError::Invalid {
                origin,
                name,
                source,
            } => {
                if name.trim().is_empty() {
                    write!(f, "invalid patch catalogue ({origin}): {source}")
                } else {
                    write!(f, "invalid patch catalogue '{name}' ({origin}): {source}")
                }
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid { source, .. } => Some(source),
        }
    }
}

fn parse(input: &str, origin: Origin) -> Result<Catalogue, ConfigError> {
    let catalogue: Catalogue = match toml_edit::de::from_str(input) {
        Ok(catalogue) => catalogue,
        Err(source) => return Err(ConfigError::Parse { origin, source }),
    };

    if let Err(source) = catalogue.validate() {
        return Err(ConfigError::Invalid {
            origin,
            name: catalogue.meta.name,
            source,
        });
    }

    debug!(
        catalogue = %catalogue.meta.name,
        %origin,
        files = catalogue.files.len(),
        steps = catalogue.step_count(),
        "loaded patch catalogue"
    );
    Ok(catalogue)
}

pub fn load_from_str(input: &str) -> Result<Catalogue, ConfigError> {
    parse(input, Origin::Inline)
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<Catalogue, ConfigError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&contents, Origin::File(path.to_path_buf()))
}
