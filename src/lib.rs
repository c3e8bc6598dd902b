//! # Forge Store
//!
//! Versioned SQLite storage for software-forge data: repositories and their
//! issues, pull requests, discussions, labels, milestones, marks and
//! notifications. Usable both as a library and through the `forge-store`
//! admin binary.
//!
//! ## Library Usage
//!
//! ```toml
//! [dependencies]
//! forge-store = { version = "0.0.1", default-features = false }
//! ```
//!
//! ```rust,ignore
//! use forge_store::config::StoreConfig;
//! use forge_store::store::{SqliteStore, Store};
//!
//! let store = SqliteStore::open(&StoreConfig::default()).unwrap();
//! // Creates the schema, or backs up and upgrades an older database.
//! store.initialize().unwrap();
//!
//! let repos = store.list_repositories("", 50).unwrap();
//! ```
//!
//! Opening a database written by a newer release fails with
//! [`error::Error::VersionSkew`] and leaves the file untouched.
//!
//! ## Feature Flags
//!
//! - `cli` (default): Builds the admin binary. Disable with `default-features = false`.

pub mod config;
pub mod error;
pub mod store;
pub mod types;
