//! Bringing a store of any supported version to the layout of this build.
//!
//! Startup goes through [`ensure_current`]: an empty store is created from the
//! registry, a store that is behind is backed up and then taken through every
//! pending step inside one transaction, and a store that is ahead is refused.

pub mod legacy;
mod steps;

use std::path::{Path, PathBuf};

use chrono::Local;
use rusqlite::{Connection, TransactionBehavior};

use super::backup;
use super::ledger::{Ledger, VersionState};
use super::port::{ColumnInfo, SchemaPort};
use super::schema::{self, ColumnSpec, TABLES, TARGET_VERSION};
use crate::error::{Error, Result};

pub use legacy::BASELINE_VERSION;

/// One upgrade, producing `version` from `version - 1`.
pub struct Step {
    pub version: u32,
    pub summary: &'static str,
    apply: fn(&Connection) -> Result<()>,
}

/// Every step this build knows, in the order they must run.
pub static STEPS: &[Step] = &[
    Step {
        version: 3,
        summary: "add pull request review requests",
        apply: steps::v03,
    },
    Step {
        version: 4,
        summary: "recreate notifications",
        apply: steps::v04,
    },
    Step {
        version: 5,
        summary: "add repository selective flag",
        apply: steps::v05,
    },
    Step {
        version: 6,
        summary: "add repository worktree",
        apply: steps::v06,
    },
    Step {
        version: 7,
        summary: "add and backfill topic update cursors",
        apply: steps::v07,
    },
    Step {
        version: 8,
        summary: "add marks",
        apply: steps::v08,
    },
    Step {
        version: 9,
        summary: "add milestones",
        apply: steps::v09,
    },
    Step {
        version: 10,
        summary: "add pull request draft flag and revisions",
        apply: steps::v10,
    },
    Step {
        version: 11,
        summary: "move inline milestones into milestone records",
        apply: steps::v11,
    },
    Step {
        version: 12,
        summary: "replace unread flags with status and repository sparse flag with condition",
        apply: steps::v12,
    },
    Step {
        version: 13,
        summary: "re-encode issue and pull request states",
        apply: steps::v13,
    },
    Step {
        version: 14,
        summary: "add discussions",
        apply: steps::v14,
    },
    Step {
        version: 15,
        summary: "add slugs, saved flags and discussion marks",
        apply: steps::v15,
    },
];

/// What [`ensure_current`] did to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The store was empty and has been created at the target version.
    Created,
    UpToDate,
    Upgraded { from: u32, to: u32, backup: PathBuf },
}

/// Steps that still have to run for a store at `from`.
pub fn pending(from: u32) -> impl Iterator<Item = &'static Step> {
    STEPS
        .iter()
        .filter(move |step| step.version > from && step.version <= TARGET_VERSION)
}

/// Brings the store at `store_path`, open on `conn`, to [`TARGET_VERSION`].
///
/// A backup lands in `backup_dir` before anything is changed; if any step then
/// fails, the store is left exactly as it was and the backup is kept.
pub fn ensure_current(conn: &mut Connection, store_path: &Path, backup_dir: &Path) -> Result<Outcome> {
    let state = Ledger::new(conn).state()?;
    match state {
        VersionState::Empty => {
            install(conn)?;
            Ok(Outcome::Created)
        }
        VersionState::Current => Ok(Outcome::UpToDate),
        VersionState::Ahead(stored) => Err(Error::VersionSkew {
            stored,
            target: TARGET_VERSION,
        }),
        VersionState::Behind(stored) if stored < BASELINE_VERSION => {
            Err(Error::UnsupportedVersion(stored))
        }
        VersionState::Behind(stored) => {
            let backup = backup::create(conn, store_path, backup_dir, stored, Local::now())?;
            let to = upgrade_to(conn, TARGET_VERSION)?;
            Ok(Outcome::Upgraded {
                from: stored,
                to,
                backup,
            })
        }
    }
}

/// Creates every registry table in an empty store and records the target
/// version, in one transaction.
pub fn install(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let ledger = Ledger::new(&tx);
    let stored = ledger.version()?;
    if stored != 0 {
        tracing::warn!(
            "Store was initialized concurrently at schema version {}; skipping creation",
            stored
        );
        return Ok(());
    }

    for spec in TABLES {
        tx.ensure_table(spec)?;
    }
    ledger.set_version(TARGET_VERSION)?;
    tx.commit()?;

    tracing::info!("Created store at schema version {}", TARGET_VERSION);
    Ok(())
}

/// Runs the pending steps up to `target` in one transaction and returns the
/// version the store is at afterwards.
///
/// The version never moves backwards: a store already at or past `target`
/// is left alone.
pub fn upgrade_to(conn: &mut Connection, target: u32) -> Result<u32> {
    if target > TARGET_VERSION {
        return Err(Error::InvalidSchema(format!(
            "no upgrade step produces version {target}"
        )));
    }

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let from = tx.user_version()?;
    if from > TARGET_VERSION {
        return Err(Error::VersionSkew {
            stored: from,
            target: TARGET_VERSION,
        });
    }
    if from >= target {
        return Ok(from);
    }
    if from < BASELINE_VERSION {
        return Err(Error::UnsupportedVersion(from));
    }

    apply_steps(&tx, from, target)?;
    tx.commit()?;
    Ok(target)
}

fn apply_steps(conn: &Connection, from: u32, target: u32) -> Result<()> {
    let ledger = Ledger::new(conn);
    let mut version = from;

    for step in STEPS.iter().filter(|s| s.version > from && s.version <= target) {
        if step.version != version + 1 {
            return Err(Error::InvalidSchema(format!(
                "no step produces version {} from {}",
                version + 1,
                version
            )));
        }

        tracing::info!("Upgrading store from version {} to {}...", version, step.version);
        (step.apply)(conn)
            .and_then(|()| ledger.set_version(step.version))
            .map_err(|source| Error::Migration {
                from,
                step: step.version,
                source: Box::new(source),
            })?;
        tracing::info!(
            "Upgrading store from version {} to {}...done",
            version,
            step.version
        );
        tracing::debug!("{}", step.summary);

        version = step.version;
    }

    if version != target {
        return Err(Error::InvalidSchema(format!(
            "upgrade stopped at version {version} short of {target}"
        )));
    }
    Ok(())
}

/// Differences between the live tables and the registry, one line each.
/// Empty when the store matches the current layout.
pub fn drift(conn: &Connection) -> Result<Vec<String>> {
    let mut found = Vec::new();

    for spec in TABLES {
        let live = conn.column_info(spec.name)?;
        if live.is_empty() {
            found.push(format!("missing table {}", spec.name));
            continue;
        }
        for column in spec.column_names() {
            if !live.iter().any(|c| c.name == column) {
                found.push(format!("missing column {}.{}", spec.name, column));
            }
        }
        for column in &live {
            match spec.column(&column.name) {
                None => found.push(format!("unexpected column {}.{}", spec.name, column.name)),
                Some(declared) => column_drift(spec.name, declared, column, &mut found),
            }
        }
    }

    for table in conn.user_tables()? {
        if schema::table(&table).is_none() {
            found.push(format!("unexpected table {table}"));
        }
    }

    Ok(found)
}

fn column_drift(table: &str, declared: &ColumnSpec, live: &ColumnInfo, found: &mut Vec<String>) {
    let default = declared.default_sql();
    if live.default != default {
        found.push(format!(
            "column {table}.{} defaults to {}, declared {}",
            live.name,
            live.default.as_deref().unwrap_or("nothing"),
            default.as_deref().unwrap_or("nothing")
        ));
    }
    if live.not_null != declared.not_null {
        found.push(format!(
            "column {table}.{} has NOT NULL {}, declared {}",
            live.name, live.not_null, declared.not_null
        ));
    }
    if live.primary_key != declared.primary_key {
        found.push(format!(
            "column {table}.{} has PRIMARY KEY {}, declared {}",
            live.name, live.primary_key, declared.primary_key
        ));
    }
}
