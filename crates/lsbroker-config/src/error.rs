use std::path::{Path, PathBuf};
use thiserror::Error;

/// Where TOML came from when no file is involved.
pub const INLINE_ORIGIN: &str = "<inline>";

/// Errors raised while loading broker settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An explicitly named config file does not exist.
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    /// The commented default config could not be written.
    #[error("failed to create default config {}: {source}", .path.display())]
    CreateDefault {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed TOML, or TOML that does not fit the settings schema.
    #[error("invalid config in {origin}: {message}")]
    Parse {
        /// File path, or [`INLINE_ORIGIN`].
        origin: String,
        message: String,
    },

    /// A setting is out of range.
    #[error("invalid setting {field}: {message}")]
    Validation {
        /// Dotted path such as `servers.rust.command`.
        field: String,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub(crate) fn parse(message: impl std::fmt::Display) -> Self {
        Self::Parse {
            origin: INLINE_ORIGIN.to_string(),
            message: message.to_string(),
        }
    }

    /// Attribute a parse error to the file it was read from.
    pub fn in_file(self, path: &Path) -> Self {
        match self {
            Self::Parse { message, .. } => Self::Parse {
                origin: path.display().to_string(),
                message,
            },
            other => other,
        }
    }
}
