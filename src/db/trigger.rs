// src/db/trigger.rs

//! Directory-watch triggers
//!
//! Installed packages may register glob patterns over absolute
//! directory paths. After a transaction, every live directory that was
//! touched is matched against each registered pattern; matching
//! packages accumulate the affected paths and have their trigger script
//! run once with those paths as arguments.

use super::Database;
use crate::error::Result;
use crate::package::{PackageId, ScriptKind};
use globset::GlobBuilder;
use tracing::warn;

fn trigger_matches(pattern: &str, path: &str) -> bool {
    match GlobBuilder::new(pattern).literal_separator(true).build() {
        Ok(glob) => glob.compile_matcher().is_match(path),
        Err(e) => {
            warn!("bad trigger pattern '{}': {}", pattern, e);
            false
        }
    }
}

impl Database {
    /// Match modified directories against every installed package's
    /// trigger patterns. A freshly installed trigger package carries the
    /// run-all flag and matches against every known directory once,
    /// modified or not; removed directories stay in the arena as
    /// modified tombstones so their triggers still fire. Returns the
    /// number of packages that now have pending triggers.
    pub fn fire_triggers(&mut self) -> usize {
        let installed: Vec<PackageId> = self.installed_order.clone();
        for pkg in installed {
            let (patterns, run_all) = match self.package(pkg).ipkg.as_ref() {
                Some(i) if !i.triggers.is_empty() => (i.triggers.clone(), i.run_all_triggers),
                _ => continue,
            };
            let mut matched: Vec<String> = Vec::new();
            for dir in &self.dirs {
                if !dir.modified && !run_all {
                    continue;
                }
                let path = format!("/{}", dir.name);
                for pattern in &patterns {
                    if !pattern.starts_with('/') {
                        warn!(
                            "{}: ignoring relative trigger pattern '{}'",
                            self.pkg_display_name(pkg),
                            pattern
                        );
                        continue;
                    }
                    if trigger_matches(pattern, &path) {
                        matched.push(path.clone());
                        break;
                    }
                }
            }
            if run_all {
                if let Some(ipkg) = self.package_mut(pkg).ipkg.as_mut() {
                    ipkg.run_all_triggers = false;
                }
            }
            if matched.is_empty() {
                continue;
            }
            let newly_pending = self
                .package(pkg)
                .ipkg
                .as_ref()
                .is_none_or(|i| i.pending_triggers.is_empty());
            if newly_pending {
                self.pending_triggers += 1;
            }
            self.package_mut(pkg)
                .ensure_ipkg()
                .pending_triggers
                .extend(matched);
        }
        self.pending_triggers
    }

    /// Run the trigger script of every package with pending triggers,
    /// passing the matched directory paths as arguments.
    pub fn run_pending_triggers(&mut self) -> Result<()> {
        let installed: Vec<PackageId> = self.installed_order.clone();
        for pkg in installed {
            let pending = match self.package(pkg).ipkg.as_ref() {
                Some(i) if !i.pending_triggers.is_empty() => i.pending_triggers.clone(),
                _ => continue,
            };
            let args: Vec<&str> = pending.iter().map(String::as_str).collect();
            self.run_script(pkg, ScriptKind::Trigger, &args)?;
            if let Some(ipkg) = self.package_mut(pkg).ipkg.as_mut() {
                ipkg.pending_triggers.clear();
            }
            self.pending_triggers = self.pending_triggers.saturating_sub(1);
        }
        Ok(())
    }

    fn pkg_display_name(&self, pkg: PackageId) -> &str {
        self.package(pkg)
            .name
            .map(|n| self.name_str(n))
            .unwrap_or("(overlay)")
    }
}
