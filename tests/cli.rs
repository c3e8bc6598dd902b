//! CLI integration tests for the forge-store admin commands.
//!
//! Each test uses an isolated temp directory for the database, ensuring tests
//! can run in parallel safely.

#![allow(deprecated)] // Command::cargo_bin deprecation only affects custom build dirs

mod common;

use std::path::Path;

use assert_cmd::Command;
use assert_fs::TempDir;
use assert_fs::prelude::*;
use forge_store::store::migrate::legacy;
use forge_store::store::schema::TARGET_VERSION;
use predicates::prelude::*;

use common::STORE_FILE;

struct TestContext {
    temp_dir: TempDir,
}

impl TestContext {
    fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("failed to create temp dir"),
        }
    }

    fn data_dir(&self) -> &Path {
        self.temp_dir.path()
    }

    fn data_dir_str(&self) -> String {
        self.data_dir().to_string_lossy().to_string()
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("forge-store").expect("failed to find binary");
        cmd.env("NO_COLOR", "1");
        cmd
    }

    fn run(&self, command: &str) -> assert_cmd::assert::Assert {
        self.cmd()
            .args([command, "--data-dir", &self.data_dir_str()])
            .assert()
    }

    fn seed_legacy(&self) {
        let conn = forge_store::store::connect(self.data_dir().join(STORE_FILE))
            .expect("open store");
        legacy::create_baseline(&conn).expect("create baseline layout");
        conn.execute_batch(common::SEED).expect("seed store");
        conn.close().expect("close store");
    }

    /// Seeds the old layout without switching the journal to WAL.
    fn seed_legacy_with_rollback_journal(&self) {
        let conn =
            rusqlite::Connection::open(self.data_dir().join(STORE_FILE)).expect("open store");
        legacy::create_baseline(&conn).expect("create baseline layout");
        conn.execute_batch(common::SEED).expect("seed store");
        conn.close().expect("close store");
    }

    fn journal_mode(&self) -> String {
        rusqlite::Connection::open(self.data_dir().join(STORE_FILE))
            .expect("open store")
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .expect("read journal mode")
    }

    fn backups(&self) -> Vec<String> {
        std::fs::read_dir(self.data_dir())
            .expect("list data dir")
            .map(|e| e.expect("dir entry").file_name().to_string_lossy().into_owned())
            .filter(|name| !name.starts_with(STORE_FILE))
            .collect()
    }
}

// ============================================================================
// Status Command Tests
// ============================================================================

#[test]
fn status_reports_missing_database() {
    let ctx = TestContext::new();

    ctx.run("status")
        .success()
        .stdout(predicate::str::contains("No database"))
        .stdout(predicate::str::contains(format!(
            "Supported version: {TARGET_VERSION}"
        )));

    assert!(!ctx.data_dir().join(STORE_FILE).exists());
}

#[test]
fn status_lists_pending_steps_for_old_database() {
    let ctx = TestContext::new();
    ctx.seed_legacy();

    ctx.run("status")
        .success()
        .stdout(predicate::str::contains("Stored version: 2"))
        .stdout(predicate::str::contains("State: behind"))
        .stdout(predicate::str::contains("pending  3"))
        .stdout(predicate::str::contains("pending 15"));
}

#[test]
fn inspection_commands_leave_database_untouched() {
    let ctx = TestContext::new();
    ctx.seed_legacy_with_rollback_journal();
    let before = std::fs::read(ctx.data_dir().join(STORE_FILE)).expect("read store");

    ctx.run("status")
        .success()
        .stdout(predicate::str::contains("State: behind"));
    ctx.run("check-schema")
        .success()
        .stdout(predicate::str::contains("Database is at version 2"));

    let wal = ctx.data_dir().join(format!("{STORE_FILE}-wal"));
    assert!(!wal.exists());
    assert_eq!(
        std::fs::read(ctx.data_dir().join(STORE_FILE)).expect("read store"),
        before
    );
    assert_eq!(ctx.journal_mode(), "delete");
}

// ============================================================================
// Migrate Command Tests
// ============================================================================

#[test]
fn migrate_creates_database_in_empty_directory() {
    let ctx = TestContext::new();

    ctx.run("migrate")
        .success()
        .stdout(predicate::str::contains("Created database"));

    ctx.temp_dir.child(STORE_FILE).assert(predicate::path::exists());
    assert!(ctx.backups().is_empty());

    ctx.run("status")
        .success()
        .stdout(predicate::str::contains("State: current"));
}

#[test]
fn migrate_upgrades_old_database_and_keeps_backup() {
    let ctx = TestContext::new();
    ctx.seed_legacy();

    ctx.run("migrate")
        .success()
        .stdout(predicate::str::contains(format!(
            "Upgraded database from version 2 to {TARGET_VERSION}"
        )))
        .stdout(predicate::str::contains("forge-database-v2-"));

    let backups = ctx.backups();
    assert_eq!(backups.len(), 1);
    assert!(backups[0].starts_with("forge-database-v2-"));

    ctx.run("migrate")
        .success()
        .stdout(predicate::str::contains("up to date"));
    assert_eq!(ctx.backups().len(), 1);
}

#[test]
fn migrate_refuses_database_from_newer_release() {
    let ctx = TestContext::new();
    ctx.run("migrate").success();

    let conn = rusqlite::Connection::open(ctx.data_dir().join(STORE_FILE)).expect("open store");
    conn.pragma_update(None, "user_version", TARGET_VERSION + 3)
        .expect("bump version");
    drop(conn);

    ctx.run("migrate")
        .failure()
        .stderr(predicate::str::contains("newer release"));
}

#[test]
fn migrate_reads_data_dir_from_config_file() {
    let ctx = TestContext::new();
    let store_dir = ctx.temp_dir.child("store");
    let config = ctx.temp_dir.child("forge.toml");
    config
        .write_str(&format!(
            "data_dir = {:?}\nfile_name = \"forge.db\"\n",
            store_dir.path().to_string_lossy()
        ))
        .expect("write config");

    ctx.cmd()
        .args(["migrate", "--config"])
        .arg(config.path())
        .assert()
        .success();

    store_dir.child("forge.db").assert(predicate::path::exists());
}

// ============================================================================
// Backup and Schema Check Tests
// ============================================================================

#[test]
fn backup_requires_existing_database() {
    let ctx = TestContext::new();

    ctx.run("backup")
        .failure()
        .stderr(predicate::str::contains("No database"));
}

#[test]
fn backup_copies_current_database() {
    let ctx = TestContext::new();
    ctx.run("migrate").success();

    ctx.run("backup")
        .success()
        .stdout(predicate::str::contains(format!(
            "forge-database-v{TARGET_VERSION}-"
        )));
    assert_eq!(ctx.backups().len(), 1);
}

#[test]
fn check_schema_validates_declarations_and_database() {
    let ctx = TestContext::new();

    ctx.run("check-schema")
        .success()
        .stdout(predicate::str::contains("Table declarations are valid"));

    ctx.run("migrate").success();
    ctx.run("check-schema")
        .success()
        .stdout(predicate::str::contains("Database matches"));
}

#[test]
fn check_schema_reports_drift() {
    let ctx = TestContext::new();
    ctx.run("migrate").success();

    let conn = rusqlite::Connection::open(ctx.data_dir().join(STORE_FILE)).expect("open store");
    conn.execute_batch("ALTER TABLE issue ADD COLUMN stray")
        .expect("alter table");
    drop(conn);

    ctx.run("check-schema")
        .failure()
        .stdout(predicate::str::contains("unexpected column issue.stray"));
}
