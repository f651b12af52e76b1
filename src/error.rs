// src/error.rs

use thiserror::Error;

/// Core error types for pkgdb
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid combination of open flags
    #[error("invalid open flags (internal error)")]
    InvalidOpenFlags,

    /// The exclusive write lock could not be acquired
    #[error("unable to lock database: {0}")]
    LockUnavailable(String),

    /// Refusing to write database state without holding the write lock
    #[error("refusing to write database without write lock")]
    NotLocked,

    /// Malformed line in the installed-package database or an index
    #[error("database format error (line {line}, entry '{field}')")]
    FdbFormat { line: usize, field: char },

    /// The installed database carries a field this version does not know
    #[error("installed database contains unsupported fields; this pkgdb is too old")]
    OldFormat,

    /// Malformed checksum text
    #[error("invalid checksum: {0}")]
    BadChecksum(String),

    /// Malformed dependency specification
    #[error("invalid dependency: {0}")]
    BadDependency(String),

    /// Malformed glob pattern in a trigger or protected-path entry
    #[error("invalid pattern '{pattern}': {reason}")]
    BadPattern { pattern: String, reason: String },

    /// No repository can provide the package
    #[error("package not found in any available repository")]
    PackageNotFound,

    /// Archive file entry without a preceding directory entry for its
    /// parent
    #[error("no directory entry for parent of '{0}'")]
    MissingParent(String),

    /// All repository slots are allocated
    #[error("maximum number of repositories ({0}) exceeded")]
    RepositoryLimit(usize),

    /// All repository tag slots are allocated
    #[error("maximum number of repository tags ({0}) exceeded")]
    TagLimit(usize),

    /// The package cache directory is unusable
    #[error("cache directory not available")]
    CacheNotAvailable,

    /// Fetching a remote resource failed
    #[error("fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },

    /// A lifecycle script could not be spawned
    #[error("script {0}: failed to spawn: {1}")]
    ScriptSpawn(String, std::io::Error),

    /// A lifecycle script exited unsuccessfully
    #[error("script {0}: {1}")]
    ScriptFailed(String, String),

    /// The transaction completed but left the package in a degraded state
    /// (broken files, scripts, or extended attributes)
    #[error("package installed with errors (broken state recorded)")]
    PackageBroken,
}

/// Result type alias using pkgdb's Error type
pub type Result<T> = std::result::Result<T, Error>;
