//! The narrow set of engine operations the upgrade machinery needs.
//!
//! Statement execution and transactions are rusqlite's own; this trait adds
//! the structural operations on top, each reporting failures as
//! [`Error::Structural`] so callers can tell schema breakage from row errors.

use rusqlite::{Connection, OptionalExtension, params};

use super::schema::{ColumnSpec, TableSpec, quote_ident};
use crate::error::{Error, Result};

/// One column as the engine reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub not_null: bool,
    /// Default expression as written in the table definition.
    pub default: Option<String>,
    pub primary_key: bool,
}

/// Result of folding the write-ahead log into the main file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    /// Set when another connection kept the checkpoint from finishing.
    pub busy: bool,
    /// Frames in the log; `-1` outside WAL mode.
    pub log_frames: i64,
    pub checkpointed: i64,
}

impl Checkpoint {
    /// Whether the main file now holds every committed change.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.busy && self.checkpointed == self.log_frames
    }
}

pub trait SchemaPort {
    fn table_exists(&self, table: &str) -> Result<bool>;

    /// Names of all tables not owned by the engine itself.
    fn user_tables(&self) -> Result<Vec<String>>;

    /// Columns of `table` in declaration order; empty if it is missing.
    fn column_info(&self, table: &str) -> Result<Vec<ColumnInfo>>;

    fn create_table(&self, spec: &TableSpec) -> Result<()>;
    fn drop_table(&self, table: &str) -> Result<()>;
    fn add_column(&self, table: &str, column: &ColumnSpec) -> Result<()>;
    fn rename_column(&self, table: &str, from: &str, to: &str) -> Result<()>;
    fn drop_column(&self, table: &str, column: &str) -> Result<()>;

    fn user_version(&self) -> Result<u32>;
    fn set_user_version(&self, version: u32) -> Result<()>;

    /// Moves everything in the write-ahead log into the main file, as far as
    /// open readers allow.
    fn checkpoint(&self) -> Result<Checkpoint>;

    fn column_names(&self, table: &str) -> Result<Vec<String>> {
        Ok(self
            .column_info(table)?
            .into_iter()
            .map(|c| c.name)
            .collect())
    }

    fn has_column(&self, table: &str, column: &str) -> Result<bool> {
        Ok(self.column_names(table)?.iter().any(|c| c == column))
    }

    /// Creates `spec` unless a table of that name exists. Returns whether it
    /// was created.
    fn ensure_table(&self, spec: &TableSpec) -> Result<bool> {
        if self.table_exists(spec.name)? {
            return Ok(false);
        }
        self.create_table(spec)?;
        Ok(true)
    }

    fn drop_table_if_exists(&self, table: &str) -> Result<bool> {
        if !self.table_exists(table)? {
            return Ok(false);
        }
        self.drop_table(table)?;
        Ok(true)
    }

    fn add_column_if_absent(&self, table: &str, column: &ColumnSpec) -> Result<bool> {
        if self.has_column(table, column.name)? {
            return Ok(false);
        }
        self.add_column(table, column)?;
        Ok(true)
    }
}

fn ddl(conn: &Connection, table: &str, sql: &str) -> Result<()> {
    conn.execute_batch(sql)
        .map_err(|e| Error::structural(table, e.to_string()))
}

impl SchemaPort for Connection {
    fn table_exists(&self, table: &str) -> Result<bool> {
        let found: Option<i64> = self
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn user_tables(&self) -> Result<Vec<String>> {
        let mut stmt = self.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn column_info(&self, table: &str) -> Result<Vec<ColumnInfo>> {
        let mut stmt = self.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
        let rows = stmt.query_map([], |row| {
            Ok(ColumnInfo {
                name: row.get(1)?,
                not_null: row.get(3)?,
                default: row.get(4)?,
                primary_key: row.get::<_, i64>(5)? > 0,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    fn create_table(&self, spec: &TableSpec) -> Result<()> {
        ddl(self, spec.name, &spec.create_sql())?;
        for index in spec.index_sql() {
            ddl(self, spec.name, &index)?;
        }
        Ok(())
    }

    fn drop_table(&self, table: &str) -> Result<()> {
        ddl(self, table, &format!("DROP TABLE {}", quote_ident(table)))
    }

    fn add_column(&self, table: &str, column: &ColumnSpec) -> Result<()> {
        ddl(
            self,
            table,
            &format!(
                "ALTER TABLE {} ADD COLUMN {}",
                quote_ident(table),
                column.definition()
            ),
        )
    }

    fn rename_column(&self, table: &str, from: &str, to: &str) -> Result<()> {
        ddl(
            self,
            table,
            &format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                quote_ident(table),
                quote_ident(from),
                quote_ident(to)
            ),
        )
    }

    fn drop_column(&self, table: &str, column: &str) -> Result<()> {
        ddl(
            self,
            table,
            &format!(
                "ALTER TABLE {} DROP COLUMN {}",
                quote_ident(table),
                quote_ident(column)
            ),
        )
    }

    fn user_version(&self) -> Result<u32> {
        let raw: i64 = self.pragma_query_value(None, "user_version", |row| row.get(0))?;
        u32::try_from(raw)
            .map_err(|_| Error::InvalidSchema(format!("negative schema version {raw}")))
    }

    fn set_user_version(&self, version: u32) -> Result<()> {
        self.pragma_update(None, "user_version", version)?;
        Ok(())
    }

    fn checkpoint(&self) -> Result<Checkpoint> {
        self.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
            Ok(Checkpoint {
                busy: row.get::<_, i64>(0)? != 0,
                log_frames: row.get(1)?,
                checkpointed: row.get(2)?,
            })
        })
        .map_err(Error::from)
    }
}
