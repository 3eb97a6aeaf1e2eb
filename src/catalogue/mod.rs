pub mod loader;
pub mod schema;

pub use loader::{load_from_path, load_from_str, ConfigError, Origin};
pub use schema::{Catalogue, Metadata, ValidationError, ValidationIssue};
