// src/lib.rs

//! pkgdb - transactional on-disk package database
//!
//! Core engine of a system package manager: the installed-package file
//! database, a refcounted shadow tree of every directory and file on
//! disk, staged archive extraction, and the policies that arbitrate
//! file conflicts, protected paths, and directory ownership between
//! packages.
//!
//! # Architecture
//!
//! - Interned state: versions, ACLs, and package names live in arenas,
//!   referenced by small copyable ids
//! - Shadow tree: directories are refcounted tombstones shared between
//!   package instances, files are path-indexed with explicit ownership
//! - Staged installs: archive entries extract to hidden temporary names
//!   and are committed, cancelled, or kept aside by a migration pass
//! - Text database: the installed database, triggers, and scripts are
//!   flat files rewritten atomically under an exclusive lock

pub mod atom;
pub mod checksum;
pub mod db;
mod error;
pub mod extract;
pub mod fs;
pub mod package;
pub mod repository;
pub mod version;

pub use db::{Database, DbOptions, InstallStats};
pub use error::{Error, Result};
