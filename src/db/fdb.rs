// src/db/fdb.rs

//! The on-disk database codec
//!
//! Installed state and repository indices share one line-oriented text
//! format: one `<letter>:<value>` field per line, a blank line ends a
//! package record. Package header fields (`P`, `V`, `C`, `A`, `L`, `D`,
//! `p`, `i`, `I`, `T`) come first; install fields (`F`, `M`, `R`, `a`,
//! `Z`, `r`, `q`, `s`, `f`) follow and are only valid in the installed
//! database. The first install field commits the package to the catalog
//! so shadow-tree entities can attach to it.
//!
//! This module also carries the sibling formats: the triggers file, the
//! per-script files under the scripts directory, and the overlay
//! manifest.

use super::tree::{DiriId, FileId};
use super::{Database, DB_INSTALLED, DB_SCRIPTS, DB_TRIGGERS};
use crate::atom::{Acl, AclHandle};
use crate::checksum::Checksum;
use crate::error::{Error, Result};
use crate::package::{format_deps, parse_deps, Package, PackageId, ScriptKind};
use std::collections::HashSet;
use std::fmt::Write as _;
use std::fs;
use tracing::{debug, warn};

/// Script file name in the scripts directory:
/// `<name>-<version>.<hex checksum>.<suffix>`.
pub fn script_file_name(name: &str, version: &str, csum: &Checksum, kind: ScriptKind) -> String {
    format!("{name}-{version}.{}.{}", csum.to_hex(), kind.suffix())
}

/// Split a script file name at its last two separators into the
/// name-version stem, the checksum hex, and the script kind.
pub fn parse_script_name(file_name: &str) -> Option<(&str, &str, ScriptKind)> {
    let (rest, suffix) = file_name.rsplit_once('.')?;
    let kind = ScriptKind::from_suffix(suffix)?;
    let (stem, hex) = rest.rsplit_once('.')?;
    Some((stem, hex, kind))
}

#[derive(Default)]
struct Record {
    name: Option<String>,
    version: Option<String>,
    csum: Option<Checksum>,
    arch: Option<String>,
    license: Option<String>,
    description: Option<String>,
    installed_size: u64,
    depends: Vec<crate::package::Dependency>,
    provides: Vec<crate::package::Dependency>,
    install_if: Vec<crate::package::Dependency>,
    uninstallable: bool,
    pkg: Option<PackageId>,
    diri: Option<DiriId>,
    file: Option<FileId>,
}

impl Record {
    fn started(&self) -> bool {
        self.name.is_some() || self.pkg.is_some()
    }
}

fn split_field(line: &str) -> Option<(char, &str)> {
    let mut chars = line.chars();
    let letter = chars.next()?;
    if !letter.is_ascii() || chars.next() != Some(':') {
        return None;
    }
    Some((letter, &line[2..]))
}

impl Database {
    pub(crate) fn read_installed(&mut self) -> Result<()> {
        match fs::read_to_string(self.root.join(DB_INSTALLED)) {
            Ok(text) => self.parse_fdb(&text, 0, true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Merge a repository index into the catalog, tagging every package
    /// with `repo_bit`.
    pub fn read_index(&mut self, text: &str, repo_bit: u32) -> Result<()> {
        self.parse_fdb(text, repo_bit, false)
    }

    fn parse_fdb(&mut self, text: &str, repos: u32, installed: bool) -> Result<()> {
        let mut st = Record::default();
        let mut lineno = 0;
        for raw in text.lines() {
            lineno += 1;
            if raw.is_empty() {
                if st.started() {
                    self.finish_record(&mut st, repos, installed, lineno)?;
                }
                st = Record::default();
                continue;
            }
            if raw.starts_with('#') {
                continue;
            }
            let Some((letter, value)) = split_field(raw) else {
                return Err(Error::FdbFormat {
                    line: lineno,
                    field: raw.chars().next().unwrap_or('?'),
                });
            };
            let bad = |field| Error::FdbFormat {
                line: lineno,
                field,
            };
            match letter {
                'P' | 'V' | 'C' | 'A' | 'L' | 'T' | 'I' | 'D' | 'p' | 'i' => {
                    if st.pkg.is_some() {
                        return Err(bad(letter));
                    }
                    match letter {
                        'P' => st.name = Some(value.to_string()),
                        'V' => st.version = Some(value.to_string()),
                        'C' => st.csum = Some(Checksum::from_hex(value)?),
                        'A' => st.arch = Some(value.to_string()),
                        'L' => st.license = Some(value.to_string()),
                        'T' => st.description = Some(value.to_string()),
                        'I' => st.installed_size = value.parse().map_err(|_| bad('I'))?,
                        'D' => st.depends = parse_deps(value)?,
                        'p' => st.provides = parse_deps(value)?,
                        'i' => st.install_if = parse_deps(value)?,
                        _ => {}
                    }
                }
                'F' | 'M' | 'R' | 'a' | 'Z' | 'r' | 'q' | 's' | 'f' if installed => {
                    let pkg = match st.pkg {
                        Some(pkg) => pkg,
                        None => self.commit_record(&mut st, repos, installed, lineno)?,
                    };
                    match letter {
                        'F' => {
                            st.diri = Some(self.new_diri(pkg, value));
                            st.file = None;
                        }
                        'M' => {
                            let diri = st.diri.ok_or_else(|| bad('M'))?;
                            let acl = self.parse_acl(value, lineno, 'M')?;
                            self.diri_mut(diri).acl = acl;
                            self.apply_diri_permissions(diri);
                        }
                        'R' => {
                            let diri = st.diri.ok_or_else(|| bad('R'))?;
                            st.file = Some(self.get_file(diri, value));
                        }
                        'a' => {
                            let file = st.file.ok_or_else(|| bad('a'))?;
                            let acl = self.parse_acl(value, lineno, 'a')?;
                            self.file_mut(file).acl = acl;
                        }
                        'Z' => {
                            let file = st.file.ok_or_else(|| bad('Z'))?;
                            self.file_mut(file).csum = Checksum::from_hex(value)?;
                        }
                        'r' => {
                            let replaces = parse_deps(value)?;
                            self.package_mut(pkg).ensure_ipkg().replaces = replaces;
                        }
                        'q' => {
                            let prio = value.parse().map_err(|_| bad('q'))?;
                            self.package_mut(pkg).ensure_ipkg().replaces_priority = prio;
                        }
                        's' => {
                            self.package_mut(pkg).ensure_ipkg().repository_tag =
                                Some(value.to_string());
                        }
                        'f' => {
                            let ipkg = self.package_mut(pkg).ensure_ipkg();
                            for flag in value.chars() {
                                match flag {
                                    'f' => ipkg.broken_files = true,
                                    's' => ipkg.broken_script = true,
                                    'x' => ipkg.broken_xattr = true,
                                    'S' => ipkg.sha256_160 = true,
                                    _ => return Err(bad('f')),
                                }
                            }
                        }
                        _ => {}
                    }
                }
                _ if installed => {
                    if !self.opts.legacy_compat {
                        return Err(Error::OldFormat);
                    }
                    warn!(
                        "installed database: unknown field '{}' on line {}, \
                         keeping record as metadata only",
                        letter, lineno
                    );
                    match st.pkg {
                        Some(pkg) => self.package_mut(pkg).uninstallable = true,
                        None => st.uninstallable = true,
                    }
                }
                _ => {
                    // Indices grow new informational fields over time
                    debug!("index: skipping field '{}'", letter);
                }
            }
        }
        if st.started() {
            self.finish_record(&mut st, repos, installed, lineno + 1)?;
        }
        Ok(())
    }

    fn finish_record(
        &mut self,
        st: &mut Record,
        repos: u32,
        installed: bool,
        lineno: usize,
    ) -> Result<()> {
        if st.pkg.is_none() {
            self.commit_record(st, repos, installed, lineno)?;
        }
        Ok(())
    }

    fn commit_record(
        &mut self,
        st: &mut Record,
        repos: u32,
        installed: bool,
        lineno: usize,
    ) -> Result<PackageId> {
        let missing = |field| Error::FdbFormat {
            line: lineno,
            field,
        };
        let name = st.name.take().ok_or_else(|| missing('P'))?;
        let version = st.version.take().ok_or_else(|| missing('V'))?;
        let csum = st.csum.take().ok_or_else(|| missing('C'))?;

        let nid = self.get_or_create_name(&name);
        let mut pkg = Package::new(nid, &version, csum);
        pkg.arch = st.arch.take().map(|a| self.atoms.atomize_str(&a));
        pkg.license = st.license.take().map(|l| self.atoms.atomize_str(&l));
        pkg.description = st.description.take();
        pkg.installed_size = st.installed_size;
        pkg.repos = repos;
        pkg.depends = std::mem::take(&mut st.depends);
        pkg.provides = std::mem::take(&mut st.provides);
        pkg.install_if = std::mem::take(&mut st.install_if);
        pkg.uninstallable = st.uninstallable;
        if installed {
            pkg.ensure_ipkg();
        }
        let id = self.register_package(pkg);
        if installed && !self.installed_order.contains(&id) {
            self.installed_order.push(id);
            self.stats.packages += 1;
            self.stats.bytes += st.installed_size;
            self.invalidate_sorted();
        }
        st.pkg = Some(id);
        Ok(id)
    }

    fn parse_acl(&mut self, value: &str, line: usize, field: char) -> Result<AclHandle> {
        let bad = || Error::FdbFormat { line, field };
        let mut parts = value.splitn(4, ':');
        let uid = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
        let gid = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
        let mode = parts
            .next()
            .and_then(|s| u32::from_str_radix(s, 8).ok())
            .ok_or_else(bad)?;
        let acl = match parts.next() {
            Some(hex) => Acl::with_xattr(mode, uid, gid, Checksum::from_hex(hex)?),
            None => Acl::new(mode, uid, gid),
        };
        Ok(self.atoms.atomize_acl(acl))
    }

    fn format_acl(&self, handle: AclHandle) -> String {
        let acl = self.atoms.acl(handle);
        let mut text = format!("{}:{}:{:o}", acl.uid, acl.gid, acl.mode);
        if !acl.xattr_csum.is_none() {
            let _ = write!(text, ":{}", acl.xattr_csum.to_hex());
        }
        text
    }

    /// Render the installed database. Round-trips exactly through
    /// `read_installed`.
    pub(crate) fn write_installed_text(&self) -> String {
        let mut out = String::new();
        for &id in &self.installed_order {
            let pkg = self.package(id);
            let Some(ipkg) = &pkg.ipkg else { continue };
            let name = pkg.name.map(|n| self.name_str(n)).unwrap_or("");
            let _ = writeln!(out, "P:{name}");
            let _ = writeln!(out, "V:{}", pkg.version);
            let _ = writeln!(out, "C:{}", pkg.checksum.to_hex());
            if let Some(arch) = pkg.arch {
                let _ = writeln!(out, "A:{}", self.atoms.get_str(arch));
            }
            if let Some(license) = pkg.license {
                let _ = writeln!(out, "L:{}", self.atoms.get_str(license));
            }
            if let Some(desc) = &pkg.description {
                let _ = writeln!(out, "T:{desc}");
            }
            if !pkg.depends.is_empty() {
                let _ = writeln!(out, "D:{}", format_deps(&pkg.depends));
            }
            if !pkg.provides.is_empty() {
                let _ = writeln!(out, "p:{}", format_deps(&pkg.provides));
            }
            if !pkg.install_if.is_empty() {
                let _ = writeln!(out, "i:{}", format_deps(&pkg.install_if));
            }
            if pkg.installed_size > 0 {
                let _ = writeln!(out, "I:{}", pkg.installed_size);
            }
            if !ipkg.replaces.is_empty() {
                let _ = writeln!(out, "r:{}", format_deps(&ipkg.replaces));
            }
            if ipkg.replaces_priority > 0 {
                let _ = writeln!(out, "q:{}", ipkg.replaces_priority);
            }
            if let Some(tag) = &ipkg.repository_tag {
                let _ = writeln!(out, "s:{tag}");
            }
            let mut flags = String::new();
            if ipkg.broken_files {
                flags.push('f');
            }
            if ipkg.broken_script {
                flags.push('s');
            }
            if ipkg.broken_xattr {
                flags.push('x');
            }
            if ipkg.sha256_160 {
                flags.push('S');
            }
            if !flags.is_empty() {
                let _ = writeln!(out, "f:{flags}");
            }
            for &diri_id in &ipkg.dirs {
                let diri = self.diri(diri_id);
                let _ = writeln!(out, "F:{}", self.dirs[diri.dir.0 as usize].name);
                let _ = writeln!(out, "M:{}", self.format_acl(diri.acl));
                for &fid in &diri.files {
                    let file = self.file(fid);
                    let _ = writeln!(out, "R:{}", file.name);
                    if file.acl != self.atoms.default_acl_file() {
                        let _ = writeln!(out, "a:{}", self.format_acl(file.acl));
                    }
                    if !file.csum.is_none() {
                        let _ = writeln!(out, "Z:{}", file.csum.to_hex());
                    }
                }
            }
            out.push('\n');
        }
        out
    }

    // Triggers file

    pub(crate) fn read_triggers(&mut self) -> Result<()> {
        let text = match fs::read_to_string(self.root.join(DB_TRIGGERS)) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for line in text.lines() {
            let mut parts = line.split_whitespace();
            let Some(hex) = parts.next() else { continue };
            let csum = Checksum::from_hex(hex)?;
            let patterns: Vec<String> = parts.map(str::to_string).collect();
            match self.get_pkg(&csum) {
                Some(id) => {
                    self.package_mut(id).ensure_ipkg().triggers = patterns;
                }
                None => warn!("triggers file names unknown package {}", hex),
            }
        }
        Ok(())
    }

    pub(crate) fn write_triggers_text(&self) -> String {
        let mut out = String::new();
        for &id in &self.installed_order {
            let pkg = self.package(id);
            let Some(ipkg) = &pkg.ipkg else { continue };
            if ipkg.triggers.is_empty() {
                continue;
            }
            let _ = write!(out, "{}", pkg.checksum.to_hex());
            for pattern in &ipkg.triggers {
                let _ = write!(out, " {pattern}");
            }
            out.push('\n');
        }
        out
    }

    // Script files

    pub(crate) fn read_scripts(&mut self) -> Result<()> {
        let dir = self.root.join(DB_SCRIPTS);
        let Ok(entries) = fs::read_dir(&dir) else {
            return Ok(());
        };
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some((_, hex, kind)) = parse_script_name(name) else {
                continue;
            };
            let Ok(csum) = Checksum::from_hex(hex) else {
                continue;
            };
            if let Some(id) = self.get_pkg(&csum) {
                let payload = fs::read(entry.path())?;
                self.package_mut(id).ensure_ipkg().set_script(kind, payload);
            }
        }
        Ok(())
    }

    /// Persist scripts as individual files, removing files for packages
    /// no longer installed.
    pub(crate) fn write_scripts(&self) -> Result<()> {
        let dir = self.root.join(DB_SCRIPTS);
        fs::create_dir_all(&dir)?;
        let mut expected = HashSet::new();
        for &id in &self.installed_order {
            let pkg = self.package(id);
            let Some(ipkg) = &pkg.ipkg else { continue };
            let name = pkg.name.map(|n| self.name_str(n)).unwrap_or("");
            for (kind, payload) in &ipkg.scripts {
                let file = script_file_name(name, &pkg.version, &pkg.checksum, *kind);
                fs::write(dir.join(&file), payload)?;
                expected.insert(file);
            }
        }
        for entry in fs::read_dir(&dir)?.flatten() {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if parse_script_name(name).is_some() && !expected.contains(name) {
                let _ = fs::remove_file(entry.path());
            }
        }
        Ok(())
    }

    // Overlay manifest

    /// Load a line-per-path overlay manifest into the nameless overlay
    /// pseudo-package. Paths ending in a separator are directories;
    /// overlay-owned files always win during migration.
    pub fn read_overlay(&mut self, text: &str) -> Result<()> {
        let pkg = match self.overlay {
            Some(pkg) => pkg,
            None => {
                let id = PackageId(self.packages.len() as u32);
                let mut overlay = Package::overlay();
                overlay.ensure_ipkg();
                self.packages.push(overlay);
                self.overlay = Some(id);
                id
            }
        };
        let mut last: Option<(String, DiriId)> = None;
        for line in text.lines() {
            let path = line.trim().trim_start_matches('/');
            if path.is_empty() {
                continue;
            }
            if let Some(dir) = path.strip_suffix('/') {
                let diri = self.new_diri(pkg, dir);
                last = Some((dir.to_string(), diri));
                continue;
            }
            let (dirname, filename) = path.rsplit_once('/').unwrap_or(("", path));
            let diri = match &last {
                Some((d, id)) if d == dirname => *id,
                _ => {
                    let id = self.new_diri(pkg, dirname);
                    last = Some((dirname.to_string(), id));
                    id
                }
            };
            self.get_file(diri, filename);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DbOptions;
    use tempfile::TempDir;

    const SAMPLE: &str = "\
P:busybox
V:1.36.1
C:aa11bb22cc33dd44ee55ff6677889900aabbccddeeff00112233445566778899
A:x86_64
L:GPL-2.0-only
T:Size optimized toolbox
D:musl so:libc.musl
I:924672
q:5
F:bin
M:0:0:755
R:busybox
a:0:0:4755
Z:1122334455667788990011223344556677889900112233445566778899001122
F:etc
M:0:0:755
R:securetty
Z:99aabbccddeeff0011223344556677889900aabbccddeeff0011223344556677

";

    fn open_db(tmp: &TempDir) -> Database {
        Database::open(DbOptions::new(tmp.path()).read_write().usermode()).unwrap()
    }

    #[test]
    fn test_roundtrip_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let mut db = open_db(&tmp);
        db.parse_fdb(SAMPLE, 0, true).unwrap();
        let first = db.write_installed_text();
        db.close().unwrap();

        let tmp2 = TempDir::new().unwrap();
        let mut db2 = open_db(&tmp2);
        db2.parse_fdb(&first, 0, true).unwrap();
        assert_eq!(db2.write_installed_text(), first);
        db2.close().unwrap();
    }

    #[test]
    fn test_parse_reconstructs_tree() {
        let tmp = TempDir::new().unwrap();
        let mut db = open_db(&tmp);
        db.parse_fdb(SAMPLE, 0, true).unwrap();

        let owner = db.get_file_owner("bin/busybox").unwrap();
        let pkg = db.package(owner);
        assert_eq!(db.name_str(pkg.name.unwrap()), "busybox");
        assert_eq!(pkg.ipkg.as_ref().unwrap().replaces_priority, 5);
        assert_eq!(pkg.installed_size, 924672);

        let csum = db.file_checksum("etc/securetty").unwrap();
        assert_eq!(
            csum.to_hex(),
            "99aabbccddeeff0011223344556677889900aabbccddeeff0011223344556677"
        );
        let bin = db.query_directory("bin").unwrap();
        assert_eq!(db.dir_owner(bin), Some(owner));
        db.close().unwrap();
    }

    #[test]
    fn test_unknown_field_is_hard_error() {
        let tmp = TempDir::new().unwrap();
        let mut db = open_db(&tmp);
        let text = "P:x\nV:1.0.0\nC:aa\nX:mystery\n\n";
        assert!(matches!(
            db.parse_fdb(text, 0, true),
            Err(Error::OldFormat)
        ));
        db.close().unwrap();
    }

    #[test]
    fn test_unknown_field_tolerated_with_compat() {
        let tmp = TempDir::new().unwrap();
        let mut db =
            Database::open(DbOptions::new(tmp.path()).read_write().usermode()).unwrap();
        db.opts.legacy_compat = true;
        let text = "P:x\nV:1.0.0\nC:aa\nX:mystery\n\n";
        db.parse_fdb(text, 0, true).unwrap();
        let id = db.get_pkg(&Checksum::from_hex("aa").unwrap()).unwrap();
        assert!(db.package(id).uninstallable);
        db.close().unwrap();
    }

    #[test]
    fn test_format_error_reports_line() {
        let tmp = TempDir::new().unwrap();
        let mut db = open_db(&tmp);
        let text = "P:x\nV:1.0.0\nC:aa\nbogus line\n\n";
        match db.parse_fdb(text, 0, true) {
            Err(Error::FdbFormat { line, .. }) => assert_eq!(line, 4),
            other => panic!("unexpected: {other:?}"),
        }
        db.close().unwrap();
    }

    #[test]
    fn test_index_read_tags_repo_bit() {
        let tmp = TempDir::new().unwrap();
        let mut db = open_db(&tmp);
        let text = "P:nginx\nV:1.24.0\nC:bb\nU:https://nginx.org\n\n";
        db.read_index(text, 1 << 3).unwrap();
        let id = db.get_pkg(&Checksum::from_hex("bb").unwrap()).unwrap();
        assert_eq!(db.package(id).repos, 1 << 3);
        assert!(db.package(id).ipkg.is_none());
        db.close().unwrap();
    }

    #[test]
    fn test_triggers_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let mut db = open_db(&tmp);
        db.parse_fdb(SAMPLE, 0, true).unwrap();
        let id = db.installed_packages()[0];
        db.package_mut(id).ensure_ipkg().triggers =
            vec!["/usr/share/man/*".to_string(), "/lib/modules/*".to_string()];
        let text = db.write_triggers_text();
        std::fs::write(tmp.path().join(DB_TRIGGERS), &text).unwrap();

        db.package_mut(id).ensure_ipkg().triggers.clear();
        db.read_triggers().unwrap();
        let pkg = db.package(id);
        assert_eq!(pkg.ipkg.as_ref().unwrap().triggers.len(), 2);
        db.close().unwrap();
    }

    #[test]
    fn test_script_name_roundtrip() {
        let csum = Checksum::digest(b"pkg");
        let name = script_file_name("openssh-server", "9.6_p1", &csum, ScriptKind::PostInstall);
        let (stem, hex, kind) = parse_script_name(&name).unwrap();
        assert_eq!(stem, "openssh-server-9.6_p1");
        assert_eq!(hex, csum.to_hex());
        assert_eq!(kind, ScriptKind::PostInstall);
        assert!(parse_script_name("README").is_none());
    }

    #[test]
    fn test_overlay_files_are_indexed() {
        let tmp = TempDir::new().unwrap();
        let mut db = open_db(&tmp);
        db.read_overlay("/etc/\n/etc/hostname\n/etc/network/interfaces\n")
            .unwrap();
        let owner = db.get_file_owner("etc/hostname").unwrap();
        assert!(db.package(owner).name.is_none());
        assert!(db.get_file_owner("etc/network/interfaces").is_some());
        db.close().unwrap();
    }
}
