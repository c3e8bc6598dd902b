//! The persisted schema version and how it compares to this build.

use rusqlite::Connection;

use super::port::SchemaPort;
use super::schema::TARGET_VERSION;
use crate::error::{Error, Result};

/// Where a store stands relative to [`TARGET_VERSION`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionState {
    /// No version and no tables: nothing has ever been written.
    Empty,
    Current,
    Behind(u32),
    Ahead(u32),
}

pub struct Ledger<'c> {
    conn: &'c Connection,
}

impl<'c> Ledger<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Stored version; 0 for a store that was just created.
    pub fn version(&self) -> Result<u32> {
        self.conn.user_version()
    }

    #[must_use]
    pub fn target(&self) -> u32 {
        TARGET_VERSION
    }

    pub fn state(&self) -> Result<VersionState> {
        let stored = self.version()?;
        Ok(match stored {
            0 if self.conn.user_tables()?.is_empty() => VersionState::Empty,
            v if v == TARGET_VERSION => VersionState::Current,
            v if v > TARGET_VERSION => VersionState::Ahead(v),
            v => VersionState::Behind(v),
        })
    }

    /// Records `version` as applied.
    ///
    /// Only valid inside the transaction that made the matching schema change,
    /// and only moving forward.
    pub fn set_version(&self, version: u32) -> Result<()> {
        if self.conn.is_autocommit() {
            return Err(Error::structural(
                "user_version",
                "schema version must be written inside the upgrade transaction",
            ));
        }
        let stored = self.version()?;
        if version <= stored {
            return Err(Error::structural(
                "user_version",
                format!("refusing to move schema version from {stored} to {version}"),
            ));
        }
        if version > TARGET_VERSION {
            return Err(Error::VersionSkew {
                stored: version,
                target: TARGET_VERSION,
            });
        }
        self.conn.set_user_version(version)
    }
}
