use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not found")]
    NotFound,

    #[error("store has not passed its startup check; call initialize first")]
    NotInitialized,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid schema declaration: {0}")]
    InvalidSchema(String),

    #[error("schema change on `{table}` failed: {message}")]
    Structural { table: String, message: String },

    #[error("unmapped value {value} in {table}.{column}")]
    DataMapping {
        table: String,
        column: String,
        value: String,
    },

    #[error("backup to {} failed: {source}", path.display())]
    Backup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "store is at schema version {stored} but this build only understands up to {target}; \
         use a newer release or restore a pre-upgrade backup"
    )]
    VersionSkew { stored: u32, target: u32 },

    #[error("store schema version {0} cannot be upgraded")]
    UnsupportedVersion(u32),

    #[error("upgrade from version {from} failed at step {step}: {source}")]
    Migration {
        from: u32,
        step: u32,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub(crate) fn structural(table: &str, message: impl Into<String>) -> Self {
        Error::Structural {
            table: table.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn unmapped(table: &str, column: &str, value: impl Into<String>) -> Self {
        Error::DataMapping {
            table: table.to_string(),
            column: column.to_string(),
            value: value.into(),
        }
    }

    /// Returns the innermost error, looking through migration context.
    #[must_use]
    pub fn root(&self) -> &Error {
        match self {
            Error::Migration { source, .. } => source.root(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
