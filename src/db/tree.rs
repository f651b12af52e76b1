// src/db/tree.rs

//! Filesystem shadow tree
//!
//! The database mirrors the installed filesystem as three arena-backed
//! entity stores: [`Directory`] (one per path, reference counted across
//! all claiming packages), [`DirectoryInstance`] (one per package per
//! directory it touches), and [`FileEntity`] (unique by directory and
//! filename, owned by exactly one instance at a time).
//!
//! Directories are never deallocated while the database is open. A
//! directory whose reference count drops to zero stays in the index as a
//! tombstone and is reactivated in place when a path comes back, at which
//! point its parent chain and inherited protected-path set are computed
//! again.

use super::protect::{self, ProtectMode, ProtectedPath};
use super::Database;
use crate::atom::AclHandle;
use crate::checksum::Checksum;
use crate::fs::DirCheck;
use crate::package::{replaces_dir, PackageId};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiriId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(pub u32);

/// How a released directory treats the physical filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// Drop the reference only
    Keep,
    /// At zero references, mark modified and remove the physical
    /// directory
    Remove,
}

/// One directory path known to the database.
#[derive(Debug)]
pub struct Directory {
    /// Full path relative to the root, no trailing separator; the root
    /// itself is the empty string
    pub name: String,
    pub parent: Option<DirId>,
    pub refs: u32,
    /// The instance whose ACL currently governs the physical directory
    pub owner: Option<DiriId>,
    pub acl: AclHandle,
    pub protect_mode: ProtectMode,
    /// Pattern tails carried down to children
    pub protect_paths: Vec<ProtectedPath>,
    pub created: bool,
    /// Content changed during this session; consulted by the trigger
    /// engine
    pub modified: bool,
    pub perms_stale: bool,
}

/// A (package, directory) pairing with the ACL that package proposes.
#[derive(Debug)]
pub struct DirectoryInstance {
    pub pkg: PackageId,
    pub dir: DirId,
    pub acl: AclHandle,
    /// Files this instance introduced, insertion ordered
    pub files: Vec<FileId>,
}

/// One file, unique by (directory, filename).
#[derive(Debug)]
pub struct FileEntity {
    pub diri: DiriId,
    pub name: String,
    pub acl: AclHandle,
    pub csum: Checksum,
}

impl Database {
    pub(crate) fn diri(&self, id: DiriId) -> &DirectoryInstance {
        match self.diris[id.0 as usize].as_ref() {
            Some(diri) => diri,
            None => unreachable!("stale directory instance handle"),
        }
    }

    pub(crate) fn diri_mut(&mut self, id: DiriId) -> &mut DirectoryInstance {
        match self.diris[id.0 as usize].as_mut() {
            Some(diri) => diri,
            None => unreachable!("stale directory instance handle"),
        }
    }

    pub(crate) fn file(&self, id: FileId) -> &FileEntity {
        match self.files[id.0 as usize].as_ref() {
            Some(file) => file,
            None => unreachable!("stale file handle"),
        }
    }

    pub(crate) fn file_mut(&mut self, id: FileId) -> &mut FileEntity {
        match self.files[id.0 as usize].as_mut() {
            Some(file) => file,
            None => unreachable!("stale file handle"),
        }
    }

    /// Resolve a directory path to its entity, creating or reactivating
    /// it and taking one reference. Parents are resolved recursively;
    /// activation computes the inherited protected-path set.
    pub fn get_directory(&mut self, path: &str) -> DirId {
        let path = path.trim_end_matches('/').to_string();
        if let Some(&id) = self.dir_index.get(&path) {
            if self.dirs[id.0 as usize].refs > 0 {
                self.dirs[id.0 as usize].refs += 1;
                return id;
            }
        }

        let parent = if path.is_empty() {
            None
        } else {
            let parent_path = path.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
            Some(self.get_directory(parent_path))
        };

        let (protect_mode, carried) = if path.is_empty() {
            (ProtectMode::None, Vec::new())
        } else {
            let basename = path.rsplit_once('/').map(|(_, b)| b).unwrap_or(&path);
            // Top-level directories match against the root pattern set
            let (base_mode, source): (ProtectMode, &[ProtectedPath]) = match parent {
                Some(pid) if !self.dirs[pid.0 as usize].name.is_empty() => {
                    let p = &self.dirs[pid.0 as usize];
                    (p.protect_mode, &p.protect_paths)
                }
                _ => (ProtectMode::None, &self.root_protected),
            };
            let mut mode = base_mode;
            let mut carried = Vec::new();
            for pp in source {
                match pp.pattern.split_once('/') {
                    Some((head, tail)) => {
                        if protect::segment_matches(head, basename) {
                            carried.push(ProtectedPath {
                                pattern: tail.to_string(),
                                mode: pp.mode,
                            });
                        }
                    }
                    None => {
                        if protect::segment_matches(&pp.pattern, basename) {
                            mode = pp.mode;
                        }
                    }
                }
            }
            (mode, carried)
        };

        let id = match self.dir_index.get(&path) {
            Some(&id) => id,
            None => {
                let id = DirId(self.dirs.len() as u32);
                self.dirs.push(Directory {
                    name: path.clone(),
                    parent: None,
                    refs: 0,
                    owner: None,
                    acl: self.atoms.default_acl_dir(),
                    protect_mode: ProtectMode::None,
                    protect_paths: Vec::new(),
                    created: false,
                    modified: false,
                    perms_stale: false,
                });
                self.dir_index.insert(path, id);
                id
            }
        };
        let dir = &mut self.dirs[id.0 as usize];
        dir.refs = 1;
        dir.parent = parent;
        dir.protect_mode = protect_mode;
        dir.protect_paths = carried;
        self.stats.dirs += 1;
        id
    }

    /// Drop one reference. At zero, `Removal::Remove` marks the
    /// directory modified and removes it from the filesystem, then the
    /// parent chain is released the same way. The index entry stays as a
    /// tombstone.
    pub fn release_directory(&mut self, id: DirId, removal: Removal) {
        let (parent, name) = {
            let dir = &mut self.dirs[id.0 as usize];
            debug_assert!(dir.refs > 0);
            dir.refs -= 1;
            if dir.refs > 0 {
                return;
            }
            if removal == Removal::Remove {
                dir.modified = true;
                dir.created = false;
            }
            (dir.parent, dir.name.clone())
        };
        self.stats.dirs -= 1;
        if removal == Removal::Remove && !self.opts.simulate && !name.is_empty() {
            if let Err(e) = self.fs.dir_delete(&name) {
                debug!("directory {} not removed: {}", name, e);
            }
        }
        if let Some(pid) = parent {
            self.release_directory(pid, removal);
        }
    }

    /// Create a DirectoryInstance of `pkg` for `path`, taking a
    /// directory reference and appending to the package's owned-dir
    /// list.
    pub(crate) fn new_diri(&mut self, pkg: PackageId, path: &str) -> DiriId {
        let dir = self.get_directory(path);
        let acl = self.atoms.default_acl_dir();
        let id = DiriId(self.diris.len() as u32);
        self.diris.push(Some(DirectoryInstance {
            pkg,
            dir,
            acl,
            files: Vec::new(),
        }));
        self.packages[pkg.0 as usize].ensure_ipkg().dirs.push(id);
        id
    }

    /// Free one instance: clears directory ownership if it held it,
    /// drops the arena slots of its files, and releases the directory
    /// reference.
    pub(crate) fn free_diri(&mut self, id: DiriId, removal: Removal) {
        let Some(diri) = self.diris[id.0 as usize].take() else {
            return;
        };
        let owner_cleared = {
            let dir = &mut self.dirs[diri.dir.0 as usize];
            if dir.owner == Some(id) {
                dir.owner = None;
                dir.perms_stale = true;
                true
            } else {
                false
            }
        };
        if owner_cleared {
            self.dirperms_stale = true;
        }
        for &fid in &diri.files {
            if self.files[fid.0 as usize].take().is_some() {
                self.stats.files -= 1;
            }
        }
        if let Some(ipkg) = self.packages[diri.pkg.0 as usize].ipkg.as_mut() {
            ipkg.dirs.retain(|&d| d != id);
        }
        self.release_directory(diri.dir, removal);
    }

    /// Ownership arbitration: let this instance govern the directory's
    /// permissions if the replace policy allows it over the current
    /// owner. An ACL change marks the directory and database stale for
    /// a later permission flush.
    pub(crate) fn apply_diri_permissions(&mut self, id: DiriId) {
        let (dir_id, new_pkg, new_acl) = {
            let d = self.diri(id);
            (d.dir, d.pkg, d.acl)
        };
        if let Some(owner_id) = self.dirs[dir_id.0 as usize].owner {
            if owner_id != id {
                let owner_pkg = self.diri(owner_id).pkg;
                let takes = {
                    let owner_ctx = self.replace_ctx(owner_pkg);
                    let new_ctx = self.replace_ctx(new_pkg);
                    replaces_dir(&owner_ctx, &new_ctx)
                };
                if !takes {
                    return;
                }
            }
        }
        let dir = &mut self.dirs[dir_id.0 as usize];
        if dir.acl != new_acl {
            dir.perms_stale = true;
            self.dirperms_stale = true;
        }
        dir.acl = new_acl;
        dir.owner = Some(id);
    }

    pub(crate) fn replace_ctx(&self, pkg: PackageId) -> crate::package::ReplaceCtx<'_> {
        let p = &self.packages[pkg.0 as usize];
        crate::package::ReplaceCtx {
            name: p.name.map(|n| self.name_str(n)),
            version: &p.version,
            replaces: p.ipkg.as_ref().map(|i| i.replaces.as_slice()).unwrap_or(&[]),
            replaces_priority: p.ipkg.as_ref().map(|i| i.replaces_priority).unwrap_or(0),
        }
    }

    /// Create a file entity attached to an instance without touching the
    /// (directory, filename) index; migration transfers index ownership
    /// once the file is final.
    pub(crate) fn file_new(&mut self, diri_id: DiriId, name: &str) -> FileId {
        let id = FileId(self.files.len() as u32);
        let acl = self.atoms.default_acl_file();
        self.files.push(Some(FileEntity {
            diri: diri_id,
            name: name.to_string(),
            acl,
            csum: Checksum::NONE,
        }));
        self.diri_mut(diri_id).files.push(id);
        self.stats.files += 1;
        id
    }

    /// Lookup-or-create in the (directory, filename) key space, indexed
    /// immediately. Used when loading recorded state.
    pub(crate) fn get_file(&mut self, diri_id: DiriId, name: &str) -> FileId {
        let dir = self.diri(diri_id).dir;
        if let Some(&fid) = self.file_index.get(&(dir, name.to_string())) {
            if self.file(fid).diri == diri_id {
                return fid;
            }
        }
        let fid = self.file_new(diri_id, name);
        self.index_file(fid);
        fid
    }

    /// Insert a file into the path index, displacing and detaching any
    /// prior owner's entity.
    pub(crate) fn index_file(&mut self, fid: FileId) {
        let (dir, name) = {
            let file = self.file(fid);
            (self.diri(file.diri).dir, file.name.clone())
        };
        if let Some(old) = self.file_index.insert((dir, name), fid) {
            if old != fid {
                self.detach_file(old);
            }
        }
    }

    fn detach_file(&mut self, fid: FileId) {
        if let Some(file) = self.files[fid.0 as usize].take() {
            if let Some(diri) = self.diris[file.diri.0 as usize].as_mut() {
                diri.files.retain(|&f| f != fid);
            }
            self.stats.files -= 1;
        }
    }

    pub(crate) fn query_file(&self, dir: &str, name: &str) -> Option<FileId> {
        let &did = self.dir_index.get(dir)?;
        self.file_index.get(&(did, name.to_string())).copied()
    }

    /// Eagerly create the physical directory under the arbitrated ACL,
    /// or flag a permissions update if it exists with different ones.
    pub(crate) fn dir_prepare(&mut self, dir_id: DirId) {
        if self.opts.simulate {
            return;
        }
        let (name, acl_handle, created) = {
            let d = &self.dirs[dir_id.0 as usize];
            (d.name.clone(), d.acl, d.created)
        };
        if created || name.is_empty() {
            return;
        }
        let acl = *self.atoms.acl(acl_handle);
        match self.fs.dir_check(&name, acl.mode, acl.uid, acl.gid) {
            Ok(DirCheck::Missing) => {
                let r = self
                    .fs
                    .dir_create(&name, acl.mode)
                    .and_then(|_| self.fs.dir_update_perms(&name, acl.mode, acl.uid, acl.gid));
                match r {
                    Ok(()) => self.dirs[dir_id.0 as usize].created = true,
                    Err(e) => warn!("could not create directory {}: {}", name, e),
                }
            }
            Ok(DirCheck::Ok) => self.dirs[dir_id.0 as usize].created = true,
            Ok(DirCheck::Modified) => {
                self.dirs[dir_id.0 as usize].perms_stale = true;
                self.dirperms_stale = true;
            }
            Err(e) => warn!("could not stat directory {}: {}", name, e),
        }
    }

    /// Flush stale directory ownership and permissions to the
    /// filesystem. Returns the number of directories that failed.
    pub fn update_directory_permissions(&mut self) -> usize {
        let mut errors = 0;
        for i in 0..self.dirs.len() {
            if !self.dirs[i].perms_stale {
                continue;
            }
            self.dirs[i].perms_stale = false;
            if self.dirs[i].refs == 0 || self.dirs[i].name.is_empty() {
                continue;
            }
            if self.opts.simulate {
                continue;
            }
            let name = self.dirs[i].name.clone();
            let acl = *self.atoms.acl(self.dirs[i].acl);
            if let Err(e) = self.fs.dir_update_perms(&name, acl.mode, acl.uid, acl.gid) {
                warn!("failed to update permissions of {}: {}", name, e);
                errors += 1;
            }
        }
        self.dirperms_stale = false;
        errors
    }

    // Read-only views, mainly for callers inspecting state

    /// The directory entity of `path`, without taking a reference.
    pub fn query_directory(&self, path: &str) -> Option<DirId> {
        self.dir_index.get(path.trim_end_matches('/')).copied()
    }

    pub fn dir_ref_count(&self, id: DirId) -> u32 {
        self.dirs[id.0 as usize].refs
    }

    pub fn dir_protect_mode(&self, id: DirId) -> ProtectMode {
        self.dirs[id.0 as usize].protect_mode
    }

    pub fn dir_is_modified(&self, id: DirId) -> bool {
        self.dirs[id.0 as usize].modified
    }

    pub fn dir_owner(&self, id: DirId) -> Option<PackageId> {
        let owner = self.dirs[id.0 as usize].owner?;
        Some(self.diri(owner).pkg)
    }

    /// Number of live DirectoryInstances claiming this directory.
    pub fn dir_instance_count(&self, id: DirId) -> usize {
        self.diris
            .iter()
            .flatten()
            .filter(|diri| diri.dir == id)
            .count()
    }

    /// Recorded checksum of the file at `path`, if tracked.
    pub fn file_checksum(&self, path: &str) -> Option<Checksum> {
        let path = path.trim_start_matches('/');
        let (dir, name) = path.rsplit_once('/').unwrap_or(("", path));
        let fid = self.query_file(dir, name)?;
        Some(self.file(fid).csum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, DbOptions};
    use tempfile::TempDir;

    fn open_db() -> (TempDir, Database) {
        let tmp = TempDir::new().unwrap();
        let db = Database::open(DbOptions::new(tmp.path()).read_write().usermode()).unwrap();
        (tmp, db)
    }

    #[test]
    fn test_get_directory_refcounts() {
        let (_tmp, mut db) = open_db();
        let a = db.get_directory("usr/lib");
        let b = db.get_directory("usr/lib");
        assert_eq!(a, b);
        assert_eq!(db.dir_ref_count(a), 2);

        // Parent chain holds one reference per activation
        let usr = db.query_directory("usr").unwrap();
        assert_eq!(db.dir_ref_count(usr), 1);

        db.release_directory(a, Removal::Keep);
        assert_eq!(db.dir_ref_count(a), 1);
        db.release_directory(a, Removal::Remove);
        assert_eq!(db.dir_ref_count(a), 0);
        assert!(db.dir_is_modified(a));
        assert_eq!(db.dir_ref_count(usr), 0);
    }

    #[test]
    fn test_tombstone_reactivation() {
        let (_tmp, mut db) = open_db();
        let a = db.get_directory("var/log");
        db.release_directory(a, Removal::Remove);
        assert_eq!(db.dir_ref_count(a), 0);

        let b = db.get_directory("var/log/");
        assert_eq!(a, b);
        assert_eq!(db.dir_ref_count(b), 1);
        let var = db.query_directory("var").unwrap();
        assert_eq!(db.dir_ref_count(var), 1);
        db.release_directory(b, Removal::Keep);
    }

    #[test]
    fn test_trailing_separator_stripped() {
        let (_tmp, mut db) = open_db();
        let a = db.get_directory("etc/");
        let b = db.get_directory("etc");
        assert_eq!(a, b);
        db.release_directory(a, Removal::Keep);
        db.release_directory(b, Removal::Keep);
    }
}
