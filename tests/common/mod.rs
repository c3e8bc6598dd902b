#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use forge_store::store::connect;
use forge_store::store::migrate::legacy;
use rusqlite::Connection;
use tempfile::TempDir;

pub const STORE_FILE: &str = "forge-database.sqlite";

/// A database file in the oldest layout that can still be upgraded.
pub struct LegacyStore {
    pub temp_dir: TempDir,
    pub path: PathBuf,
}

impl LegacyStore {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("create temp dir");
        let path = temp_dir.path().join(STORE_FILE);

        let conn = connect(&path).expect("open legacy store");
        legacy::create_baseline(&conn).expect("create baseline layout");
        conn.close().expect("close legacy store");

        Self { temp_dir, path }
    }

    /// Two repositories (one GitHub, one GitLab) with issues, pull requests,
    /// labels, posts and notifications written the way old releases did.
    pub fn seeded() -> Self {
        let store = Self::new();
        store.execute(SEED);
        store
    }

    pub fn dir(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn connect(&self) -> Connection {
        connect(&self.path).expect("open store")
    }

    pub fn execute(&self, sql: &str) {
        let conn = self.connect();
        conn.execute_batch(sql).expect("execute fixture sql");
        conn.close().expect("close store");
    }

    pub fn query_string(&self, sql: &str) -> Option<String> {
        self.connect()
            .query_row(sql, [], |row| row.get(0))
            .expect("query fixture value")
    }

    pub fn query_i64(&self, sql: &str) -> i64 {
        self.connect()
            .query_row(sql, [], |row| row.get(0))
            .expect("query fixture value")
    }

    /// Files in the store directory other than the store and its journals.
    pub fn backups(&self) -> Vec<PathBuf> {
        let mut found: Vec<PathBuf> = fs::read_dir(self.dir())
            .expect("list store dir")
            .map(|entry| entry.expect("dir entry").path())
            .filter(|path| {
                let name = path.file_name().unwrap_or_default().to_string_lossy();
                !name.starts_with(STORE_FILE)
            })
            .collect();
        found.sort();
        found
    }
}

pub const SEED: &str = r#"
INSERT INTO repository (class, id, forge, owner, name, apihost, githost, sparse_p)
VALUES
    ('forge-github-repository', 'r-gh', 'github', 'octo', 'hub', 'api.github.com', 'github.com', 0),
    ('forge-gitlab-repository', 'r-gl', 'gitlab', 'tanuki', 'lab', 'gitlab.com/api/v4', 'gitlab.com', 1);

INSERT INTO label (repository, id, name, color) VALUES ('r-gh', 'lbl-bug', 'bug', '#ee0701');

INSERT INTO issue (class, id, repository, number, state, title, created, updated, unread_p, milestone, labels)
VALUES
    ('forge-issue', 'i-1', 'r-gh', 1, 'open', 'Crash on start',
     '2024-01-01T00:00:00+00:00', '2024-01-02T00:00:00+00:00', 1, 'v1.0', '["lbl-bug"]'),
    ('forge-issue', 'i-2', 'r-gh', 2, 'closed', 'Typo',
     '2024-01-01T00:00:00+00:00', '2024-03-01T00:00:00+00:00', 0, 'v1.0', '[]');

INSERT INTO issue (class, id, repository, number, state, title, created, updated, unread_p, milestone)
VALUES
    ('forge-issue', 'i-3', 'r-gh', 3, 'closed', 'Old',
     '2024-01-01T00:00:00+00:00', '2024-02-01T00:00:00+00:00', NULL, '');

INSERT INTO issue_label (issue, id) VALUES ('i-1', 'lbl-bug');

INSERT INTO issue_post (class, id, issue, number, body, created, updated)
VALUES ('forge-issue-post', 'ip-1', 'i-1', 1, 'Same here',
        '2024-01-02T00:00:00+00:00', '2024-01-02T00:00:00+00:00');

INSERT INTO pullreq (class, id, repository, number, state, title, created, updated, unread_p, milestone)
VALUES
    ('forge-pullreq', 'p-4', 'r-gl', 4, 'merged', 'Feature',
     '2024-01-01T00:00:00+00:00', '2024-04-01T00:00:00+00:00', 0, 'v2'),
    ('forge-pullreq', 'p-5', 'r-gh', 5, 'closed', 'Abandoned',
     '2024-01-01T00:00:00+00:00', '2024-05-01T00:00:00+00:00', 1, NULL);

INSERT INTO notification (class, id, thread_id, repository, forge, reason, unread_p, title, type)
VALUES ('forge-notification', 'n-1', 't-1', 'r-gh', 'github', 'mention', 1, 'Crash on start', 'Issue');
"#;
