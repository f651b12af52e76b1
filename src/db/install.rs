// src/db/install.rs

//! Install and uninstall transactions
//!
//! One package at a time, driven by the extraction event stream:
//! metadata and scripts are recorded, file entries are staged to the
//! filesystem and attached to the shadow tree, and a priority-tiered
//! migration pass finalizes each staged file as commit, cancel, or
//! keep-as-new. A failed unpack purges the partial state and leaves any
//! previously installed version untouched; after migration the old
//! version's leftovers are purged and the lifecycle post-script runs.

use super::protect::ProtectMode;
use super::tree::{DiriId, FileId, Removal};
use super::Database;
use crate::atom::{Acl, AclHandle};
use crate::checksum::Checksum;
use crate::error::{Error, Result};
use crate::extract::{EntryKind, ExtractEvent, ExtractSource, FileInfo};
use crate::fs::{FileControl, PRIO_DISK, PRIO_NONE};
use crate::package::{parse_deps, replaces_file, PackageId, ReplaceVerdict, ScriptKind};
use tracing::{debug, info, warn};

/// Archive entry names that must never touch the filesystem: absolute
/// paths, control bytes, and self/parent traversal segments.
fn name_is_malicious(name: &str) -> bool {
    if name.starts_with('/') || name.is_empty() {
        return true;
    }
    if name.bytes().any(|b| b < 0x20 || b == 0x7f) {
        return true;
    }
    name.split('/').any(|seg| seg == "." || seg == "..")
}

impl Database {
    /// Remove an installed package: pre-deinstall script, purge of its
    /// files and directories, post-deinstall script.
    pub fn uninstall_pkg(&mut self, pkg: PackageId) -> Result<()> {
        let version = self.package(pkg).version.clone();
        info!("removing {}", self.pkg_display(pkg));
        self.script_step(pkg, ScriptKind::PreDeinstall, &[&version])?;
        self.purge_pkg(pkg, true);
        self.script_step(pkg, ScriptKind::PostDeinstall, &[&version])?;
        let broken = self
            .package(pkg)
            .ipkg
            .as_ref()
            .is_some_and(|i| i.broken_script);
        self.package_mut(pkg).ipkg = None;
        if broken {
            return Err(Error::PackageBroken);
        }
        Ok(())
    }

    /// Install `new`, optionally superseding `old`: unpack the event
    /// stream, migrate staged files, purge the old version, run the
    /// post-script. Broken-file/script/xattr state reports failure
    /// without rolling back committed filesystem effects.
    pub fn install_pkg(
        &mut self,
        old: Option<PackageId>,
        new: PackageId,
        source: &mut dyn ExtractSource,
    ) -> Result<()> {
        let new_version = self.package(new).version.clone();
        let old_version = old.map(|o| self.package(o).version.clone());
        let mut args: Vec<&str> = vec![&new_version];
        if let Some(v) = &old_version {
            args.push(v);
        }
        if old.is_some() {
            info!("upgrading to {}", self.pkg_display(new));
        } else {
            info!("installing {}", self.pkg_display(new));
        }

        self.package_mut(new).ensure_ipkg();
        if let Err(e) = self.unpack_pkg(new, source, old.is_some(), &args) {
            warn!("unpack of {} failed, rolling back: {}", self.pkg_display(new), e);
            self.purge_pkg(new, false);
            self.package_mut(new).ipkg = None;
            return Err(e);
        }
        self.migrate_files(new);
        // A new trigger package matches against pre-existing directories
        // on its first firing
        self.package_mut(new).ensure_ipkg().run_all_triggers = true;

        if !self.installed_order.contains(&new) {
            self.installed_order.push(new);
            self.stats.packages += 1;
            self.stats.bytes += self.package(new).installed_size;
            self.invalidate_sorted();
        }

        if let Some(old) = old {
            self.purge_pkg(old, true);
            self.package_mut(old).ipkg = None;
        }

        let post = if old.is_some() {
            ScriptKind::PostUpgrade
        } else {
            ScriptKind::PostInstall
        };
        self.script_step(new, post, &args)?;

        let degraded = self
            .package(new)
            .ipkg
            .as_ref()
            .is_some_and(|i| i.broken_files || i.broken_script || i.broken_xattr);
        if degraded {
            return Err(Error::PackageBroken);
        }
        Ok(())
    }

    /// Run a lifecycle script, downgrading a non-zero exit to the
    /// broken-script flag; spawn failures stay fatal.
    fn script_step(&mut self, pkg: PackageId, kind: ScriptKind, args: &[&str]) -> Result<()> {
        match self.run_script(pkg, kind, args) {
            Ok(()) => Ok(()),
            Err(Error::ScriptFailed(id, status)) => {
                warn!("script {id} failed: {status}");
                self.package_mut(pkg).ensure_ipkg().broken_script = true;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn pkg_display(&self, pkg: PackageId) -> String {
        let p = self.package(pkg);
        let name = p.name.map(|n| self.name_str(n)).unwrap_or("(overlay)");
        format!("{}-{}", name, p.version)
    }

    pub(crate) fn pkg_ctx(&self, pkg: PackageId) -> String {
        self.package(pkg).checksum.to_hex()
    }

    fn unpack_pkg(
        &mut self,
        pkg: PackageId,
        source: &mut dyn ExtractSource,
        upgrade: bool,
        script_args: &[&str],
    ) -> Result<()> {
        let ctx = self.pkg_ctx(pkg);
        let pending = if upgrade {
            ScriptKind::PreUpgrade
        } else {
            ScriptKind::PreInstall
        };
        let mut pre_fired = false;
        let mut missing_csum_warned = false;
        let mut bytes_done: u64 = 0;

        while let Some(event) = source.next_event()? {
            match event {
                ExtractEvent::V2Meta(text) => self.apply_v2_meta(pkg, &text)?,
                ExtractEvent::V3Meta(meta) => {
                    let ipkg = self.package_mut(pkg).ensure_ipkg();
                    ipkg.sha256_160 = true;
                    ipkg.replaces_priority = meta.replaces_priority;
                    ipkg.triggers = meta.triggers;
                    for (kind, payload) in meta.scripts {
                        ipkg.set_script(kind, payload);
                    }
                    let mut replaces = Vec::new();
                    for spec in &meta.replaces {
                        replaces.push(crate::package::Dependency::parse(spec)?);
                    }
                    self.package_mut(pkg).ensure_ipkg().replaces = replaces;
                }
                ExtractEvent::Script { kind, payload } => {
                    self.package_mut(pkg).ensure_ipkg().set_script(kind, payload);
                }
                ExtractEvent::File { info, payload } => {
                    // Deferred pre-script fires once actual extraction
                    // is about to begin
                    if !pre_fired {
                        pre_fired = true;
                        self.script_step(pkg, pending, script_args)?;
                    }
                    self.install_file(
                        pkg,
                        &ctx,
                        info,
                        &payload,
                        &mut missing_csum_warned,
                        &mut bytes_done,
                    )?;
                }
            }
        }
        // Still pending when the archive carried no file entries
        if !pre_fired {
            self.script_step(pkg, pending, script_args)?;
        }
        debug!("unpacked {} ({} bytes)", self.pkg_display(pkg), bytes_done);
        Ok(())
    }

    /// Free-form v2 metadata: `key = value` lines.
    fn apply_v2_meta(&mut self, pkg: PackageId, text: &str) -> Result<()> {
        for line in text.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            match key {
                "replaces" => {
                    self.package_mut(pkg).ensure_ipkg().replaces = parse_deps(value)?;
                }
                "replaces_priority" => {
                    let prio = value
                        .parse()
                        .map_err(|_| Error::BadDependency(value.to_string()))?;
                    self.package_mut(pkg).ensure_ipkg().replaces_priority = prio;
                }
                "triggers" => {
                    self.package_mut(pkg).ensure_ipkg().triggers =
                        value.split_whitespace().map(str::to_string).collect();
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn acl_from_info(&mut self, info: &FileInfo) -> AclHandle {
        let acl = if info.xattr_digest.is_none() {
            Acl::new(info.mode, info.uid, info.gid)
        } else {
            Acl::with_xattr(info.mode, info.uid, info.gid, info.xattr_digest)
        };
        self.atoms.atomize_acl(acl)
    }

    /// The package's own DirectoryInstance for `path`, if a directory
    /// entry created one earlier in this archive.
    fn find_diri(&self, pkg: PackageId, path: &str) -> Option<DiriId> {
        let ipkg = self.package(pkg).ipkg.as_ref()?;
        ipkg.dirs
            .iter()
            .copied()
            .find(|&id| self.dirs[self.diri(id).dir.0 as usize].name == path)
    }

    /// A file already extracted by this package, by full path. Hard-link
    /// targets resolve against this.
    fn find_pkg_file(&self, pkg: PackageId, path: &str) -> Option<FileId> {
        let (dirname, filename) = path.rsplit_once('/').unwrap_or(("", path));
        let diri = self.find_diri(pkg, dirname)?;
        self.diri(diri)
            .files
            .iter()
            .copied()
            .find(|&fid| self.file(fid).name == filename)
    }

    fn mark_broken_files(&mut self, pkg: PackageId) {
        self.package_mut(pkg).ensure_ipkg().broken_files = true;
    }

    fn install_file(
        &mut self,
        pkg: PackageId,
        ctx: &str,
        mut info: FileInfo,
        payload: &[u8],
        missing_csum_warned: &mut bool,
        bytes_done: &mut u64,
    ) -> Result<()> {
        if let Some(stripped) = info.name.strip_prefix("./") {
            info.name = stripped.to_string();
        }
        // Root entry of the archive
        if info.name.is_empty() || info.name == "/" {
            return Ok(());
        }
        if name_is_malicious(&info.name) {
            warn!("rejecting malicious entry name '{}'", info.name.escape_debug());
            self.mark_broken_files(pkg);
            return Ok(());
        }

        if info.kind == EntryKind::Directory {
            let path = info.name.trim_end_matches('/').to_string();
            let diri = match self.find_diri(pkg, &path) {
                Some(d) => d,
                None => self.new_diri(pkg, &path),
            };
            let acl = self.acl_from_info(&info);
            self.diri_mut(diri).acl = acl;
            self.apply_diri_permissions(diri);
            let dir = self.diri(diri).dir;
            self.dir_prepare(dir);
            self.dirs[dir.0 as usize].modified = true;
            return Ok(());
        }

        let (dirname, filename) = match info.name.rsplit_once('/') {
            Some((d, f)) => (d.to_string(), f.to_string()),
            None => (String::new(), info.name.clone()),
        };
        let diri = match self.find_diri(pkg, &dirname) {
            Some(d) => d,
            None if dirname.is_empty() => self.new_diri(pkg, ""),
            None => return Err(Error::MissingParent(info.name.clone())),
        };

        // Conflict with another package's file at the same path
        if let Some(existing) = self.query_file(&dirname, &filename) {
            let owner = self.diri(self.file(existing).diri).pkg;
            if owner != pkg {
                let verdict = replaces_file(&self.replace_ctx(owner), &self.replace_ctx(pkg));
                match verdict {
                    ReplaceVerdict::Conflict if !self.opts.force_overwrite => {
                        warn!(
                            "{}: file owned by {}, no replaces declaration",
                            info.name,
                            self.pkg_display(owner)
                        );
                        self.mark_broken_files(pkg);
                        return Ok(());
                    }
                    ReplaceVerdict::Conflict => {
                        warn!("{}: overwriting file owned by {}", info.name, self.pkg_display(owner));
                    }
                    ReplaceVerdict::KeepOld => return Ok(()),
                    ReplaceVerdict::UseNew => {}
                }
            }
        }

        // Checksum assignment
        let sha256_160 = self
            .package(pkg)
            .ipkg
            .as_ref()
            .is_some_and(|i| i.sha256_160);
        let mut csum = info.digest;
        let hard_link = info.kind == EntryKind::Regular && info.link_target.is_some();
        if hard_link {
            let target = info.link_target.clone().unwrap_or_default();
            let target = target.strip_prefix("./").unwrap_or(&target).to_string();
            match self.find_pkg_file(pkg, &target) {
                Some(tfid) => csum = self.file(tfid).csum,
                None => {
                    warn!("{}: hard link target '{}' not in package", info.name, target);
                    self.mark_broken_files(pkg);
                    return Ok(());
                }
            }
            info.link_target = Some(target);
        } else if info.kind == EntryKind::Symlink && sha256_160 {
            let target = info.link_target.as_deref().unwrap_or("");
            csum = Checksum::digest_160(target.as_bytes());
        }
        if csum.is_none() && info.kind.needs_checksum() {
            if !*missing_csum_warned {
                *missing_csum_warned = true;
                warn!("{}: no embedded checksum", info.name);
            }
            self.mark_broken_files(pkg);
        }

        if !self.opts.simulate {
            self.fs.file_extract(ctx, &info, payload)?;
        }

        let fid = self.file_new(diri, &filename);
        let acl = self.acl_from_info(&info);
        {
            let file = self.file_mut(fid);
            file.acl = acl;
            file.csum = csum;
        }
        *bytes_done += info.size;
        Ok(())
    }

    /// Release every file and directory of a package's installed state.
    /// `committed` distinguishes an uninstall (delete real files, audit
    /// protected ones) from the rollback of a failed install (cancel
    /// staged files only). The InstalledPackage record itself stays so
    /// post-scripts can still run; callers drop it afterwards.
    pub(crate) fn purge_pkg(&mut self, pkg: PackageId, committed: bool) {
        let ctx = self.pkg_ctx(pkg);
        let dirs: Vec<DiriId> = self
            .package(pkg)
            .ipkg
            .as_ref()
            .map(|i| i.dirs.clone())
            .unwrap_or_default();

        for diri_id in dirs {
            let Some(diri) = self.diris[diri_id.0 as usize].as_ref() else {
                continue;
            };
            let dir_id = diri.dir;
            let dirname = self.dirs[dir_id.0 as usize].name.clone();
            let protect = self.dirs[dir_id.0 as usize].protect_mode != ProtectMode::None;
            let files: Vec<FileId> = diri.files.clone();

            for fid in files {
                let (fname, csum) = {
                    let f = self.file(fid);
                    (f.name.clone(), f.csum)
                };
                let key = (dir_id, fname.clone());
                if !committed {
                    if !self.opts.simulate {
                        let _ = self.fs.file_control(&ctx, &dirname, &fname, FileControl::Cancel);
                    }
                    continue;
                }
                // Only the current index owner removes the real file
                if self.file_index.get(&key) != Some(&fid) {
                    continue;
                }
                self.file_index.remove(&key);
                let keep = protect
                    && !self.opts.clean_protected
                    && !csum.is_none()
                    && self.fs.file_modified(&dirname, &fname, &csum);
                if keep {
                    debug!("keeping locally modified {}/{}", dirname, fname);
                } else if !self.opts.simulate {
                    if let Err(e) =
                        self.fs.file_control(&ctx, &dirname, &fname, FileControl::Delete)
                    {
                        debug!("could not delete {}/{}: {}", dirname, fname, e);
                    }
                }
            }
            self.dirs[dir_id.0 as usize].modified = true;
            self.free_diri(
                diri_id,
                if committed { Removal::Remove } else { Removal::Keep },
            );
        }

        if committed {
            if let Some(pos) = self.installed_order.iter().position(|&p| p == pkg) {
                self.installed_order.remove(pos);
                self.stats.packages -= 1;
                self.stats.bytes = self
                    .stats
                    .bytes
                    .saturating_sub(self.package(pkg).installed_size);
                self.invalidate_sorted();
            }
        }
    }

    /// Finalize staged files tier by tier. The backing filesystem of
    /// each directory reports a priority; tiers are processed in
    /// ascending order until the sentinel says none remain. Index
    /// ownership of each path transfers to the new file.
    pub(crate) fn migrate_files(&mut self, pkg: PackageId) {
        let ctx = self.pkg_ctx(pkg);
        let dirs: Vec<DiriId> = self
            .package(pkg)
            .ipkg
            .as_ref()
            .map(|i| i.dirs.clone())
            .unwrap_or_default();

        let mut prio = PRIO_DISK;
        loop {
            let mut next = PRIO_NONE;
            for &diri_id in &dirs {
                let (dir_id, dirname) = {
                    let d = self.diri(diri_id);
                    (d.dir, self.dirs[d.dir.0 as usize].name.clone())
                };
                let tier = self.fs.dir_priority(&dirname);
                if tier != prio {
                    if tier > prio && tier < next {
                        next = tier;
                    }
                    continue;
                }
                self.dirs[dir_id.0 as usize].modified = true;
                let files = self.diri(diri_id).files.clone();
                for fid in files {
                    self.migrate_one(pkg, &ctx, dir_id, fid, &dirname);
                }
            }
            if next == PRIO_NONE {
                break;
            }
            prio = next;
        }
    }

    fn migrate_one(
        &mut self,
        pkg: PackageId,
        ctx: &str,
        dir_id: super::tree::DirId,
        fid: FileId,
        dirname: &str,
    ) {
        let (fname, new_csum) = {
            let f = self.file(fid);
            (f.name.clone(), f.csum)
        };
        let key = (dir_id, fname.clone());
        let ofile = self.file_index.get(&key).copied().filter(|&o| o != fid);

        let mut ctrl = FileControl::Commit;
        if let Some(prev) = ofile {
            let owner = self.diri(self.file(prev).diri).pkg;
            if self.package(owner).name.is_none() {
                // Overlay-owned path, the overlay's copy stays
                ctrl = FileControl::Cancel;
            }
        }

        let protect = self.dirs[dir_id.0 as usize].protect_mode != ProtectMode::None;
        if !self.opts.simulate {
            if ctrl == FileControl::Commit
                && protect
                && !self.opts.clean_protected
                && self.fs.file_exists(dirname, &fname)
            {
                let old_csum = ofile.map(|o| self.file(o).csum).unwrap_or(Checksum::NONE);
                let differs_old =
                    old_csum.is_none() || self.fs.file_modified(dirname, &fname, &old_csum);
                let differs_new =
                    new_csum.is_none() || self.fs.file_modified(dirname, &fname, &new_csum);
                ctrl = match (differs_old, differs_new) {
                    // Locally modified and the package ships something
                    // else: keep the disk copy, stage under -new
                    (true, true) => FileControl::MarkNew,
                    // Unmodified since the old version
                    (false, true) => FileControl::Commit,
                    // Disk already carries the new content
                    (_, false) => FileControl::Cancel,
                };
            }
            match self.fs.file_control(ctx, dirname, &fname, ctrl) {
                Ok(()) => {
                    if ctrl == FileControl::Commit
                        && (dirname == "etc" && (fname == "passwd" || fname == "group"))
                    {
                        self.id_cache.reset();
                    }
                }
                Err(e) => {
                    warn!("failed to finalize {}/{}: {}", dirname, fname, e);
                    self.mark_broken_files(pkg);
                }
            }
        }
        self.index_file(fid);
    }
}
