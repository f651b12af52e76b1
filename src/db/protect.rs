// src/db/protect.rs

//! Protected paths
//!
//! Protected-path patterns are loaded at the root and filtered down the
//! directory tree as it is built: a single-segment pattern sets the
//! protect mode of directories whose basename it matches, a multi-segment
//! pattern is split at its first separator, the head matched against the
//! current directory and the tail carried to its children. Matching is
//! path-aware: a wildcard never crosses a separator.

use super::{Database, PROTECTED_DIR};
use crate::error::Result;
use globset::GlobBuilder;
use std::fs;
use std::path::PathBuf;
use tracing::warn;

/// What installs may do to files under a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtectMode {
    /// Unprotected
    #[default]
    None,
    /// Keep locally changed files; new versions land beside them
    Changed,
    /// Protect symlinks only
    SymlinksOnly,
    /// Keep everything on disk
    All,
}

/// One pattern with the mode it applies.
#[derive(Debug, Clone)]
pub struct ProtectedPath {
    pub pattern: String,
    pub mode: ProtectMode,
}

/// Parse one protected-paths list line. The leading character selects
/// the mode: `-` unprotects, `+` (or none) protects changes, `@`
/// protects symlinks, `!` protects everything. Returns `None` for
/// comments and blanks.
pub fn parse_protect_line(line: &str) -> Option<ProtectedPath> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let (mode, rest) = if let Some(rest) = line.strip_prefix('-') {
        (ProtectMode::None, rest)
    } else if let Some(rest) = line.strip_prefix('+') {
        (ProtectMode::Changed, rest)
    } else if let Some(rest) = line.strip_prefix('@') {
        (ProtectMode::SymlinksOnly, rest)
    } else if let Some(rest) = line.strip_prefix('!') {
        (ProtectMode::All, rest)
    } else {
        (ProtectMode::Changed, line)
    };
    let pattern = rest.trim_matches('/');
    if pattern.is_empty() {
        return None;
    }
    Some(ProtectedPath {
        pattern: pattern.to_string(),
        mode,
    })
}

/// Path-aware match of one pattern segment against one path segment.
pub(crate) fn segment_matches(pattern: &str, name: &str) -> bool {
    match GlobBuilder::new(pattern).literal_separator(true).build() {
        Ok(glob) => glob.compile_matcher().is_match(name),
        Err(e) => {
            warn!("ignoring bad protected-path pattern '{}': {}", pattern, e);
            false
        }
    }
}

impl Database {
    /// Compiled-in defaults plus every `*.list` file under the
    /// protected-paths configuration directory, in name order.
    pub(crate) fn load_protected_paths(&mut self) -> Result<()> {
        let mut paths: Vec<ProtectedPath> = ["+etc", "@etc/init.d", "!etc/pkgdb"]
            .iter()
            .filter_map(|line| parse_protect_line(line))
            .collect();

        if let Ok(entries) = fs::read_dir(self.root.join(PROTECTED_DIR)) {
            let mut files: Vec<PathBuf> = entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "list"))
                .collect();
            files.sort();
            for file in files {
                let text = fs::read_to_string(&file)?;
                paths.extend(text.lines().filter_map(parse_protect_line));
            }
        }
        self.root_protected = paths;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tree::Removal;
    use crate::db::DbOptions;
    use tempfile::TempDir;

    #[test]
    fn test_parse_protect_line() {
        assert!(parse_protect_line("# comment").is_none());
        assert!(parse_protect_line("   ").is_none());
        let pp = parse_protect_line("/etc/ssl/").unwrap();
        assert_eq!(pp.pattern, "etc/ssl");
        assert_eq!(pp.mode, ProtectMode::Changed);
        assert_eq!(parse_protect_line("-usr").unwrap().mode, ProtectMode::None);
        assert_eq!(
            parse_protect_line("@etc/init.d").unwrap().mode,
            ProtectMode::SymlinksOnly
        );
        assert_eq!(parse_protect_line("!etc/keys").unwrap().mode, ProtectMode::All);
    }

    #[test]
    fn test_segment_matching_is_path_aware() {
        assert!(segment_matches("init.d", "init.d"));
        assert!(segment_matches("*.conf", "app.conf"));
        // A wildcard must not cross a separator
        assert!(!segment_matches("*", "a/b"));
    }

    #[test]
    fn test_inheritance_scenario() {
        let tmp = TempDir::new().unwrap();
        let mut db = Database::open(DbOptions::new(tmp.path()).read_write().usermode()).unwrap();
        db.root_protected = ["+etc", "!etc/apk", "@etc/init.d"]
            .iter()
            .filter_map(|l| parse_protect_line(l))
            .collect();

        let keys = db.get_directory("etc/apk/keys");
        assert_eq!(db.dir_protect_mode(keys), ProtectMode::All);

        let other = db.get_directory("etc/other");
        assert_eq!(db.dir_protect_mode(other), ProtectMode::Changed);

        let sub = db.get_directory("etc/init.d/sub");
        assert_eq!(db.dir_protect_mode(sub), ProtectMode::SymlinksOnly);

        let unrelated = db.get_directory("usr/lib");
        assert_eq!(db.dir_protect_mode(unrelated), ProtectMode::None);

        for id in [keys, other, sub, unrelated] {
            db.release_directory(id, Removal::Keep);
        }
        db.close().unwrap();
    }

    #[test]
    fn test_list_files_loaded_at_open() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join(PROTECTED_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("local.list"), "!etc/secrets\n# note\n").unwrap();

        let mut db = Database::open(DbOptions::new(tmp.path()).read_write().usermode()).unwrap();
        let secrets = db.get_directory("etc/secrets");
        assert_eq!(db.dir_protect_mode(secrets), ProtectMode::All);
        db.release_directory(secrets, Removal::Keep);
        db.close().unwrap();
    }
}
