// src/fs.rs

//! Filesystem primitives
//!
//! Everything the database does to the real filesystem goes through the
//! [`Filesystem`] trait: directory maintenance, staged file extraction,
//! the commit/cancel/keep-new/delete file controls, checksum audits, and
//! the per-directory priority tier that drives migration ordering.
//!
//! [`SysFs`] is the system implementation. New files are extracted under a
//! hashed temporary name inside their target directory and only renamed
//! into place (or renamed to a `-new` sibling, or unlinked) by a later
//! file-control call, so a failed unpack never leaves half-written files
//! at their final paths.

use crate::checksum::Checksum;
use crate::extract::{EntryKind, FileInfo};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Priority tier of ordinary on-disk directories
pub const PRIO_DISK: u8 = 0;

/// Sentinel tier meaning "no further tiers"; terminates migration
pub const PRIO_NONE: u8 = 0xff;

/// Suffix appended when a protected path keeps the package's file beside
/// the locally modified one
pub const NEW_SUFFIX: &str = ".pkg-new";

/// Prefix of hashed staging names inside a target directory
const STAGING_PREFIX: &str = ".pkgdb.";

/// Final disposition of a staged file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileControl {
    /// Rename staged file to its real name
    Commit,
    /// Discard the staged file
    Cancel,
    /// Rename staged file to `<name>.pkg-new` beside the real one
    MarkNew,
    /// Unlink the real (committed) file
    Delete,
}

/// Result of checking an existing directory against its expected ACL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirCheck {
    Ok,
    Missing,
    Modified,
}

/// Filesystem operations consumed by the database engine
pub trait Filesystem {
    fn dir_create(&self, dir: &str, mode: u32) -> io::Result<()>;
    fn dir_delete(&self, dir: &str) -> io::Result<()>;
    fn dir_check(&self, dir: &str, mode: u32, uid: u32, gid: u32) -> io::Result<DirCheck>;
    fn dir_update_perms(&self, dir: &str, mode: u32, uid: u32, gid: u32) -> io::Result<()>;

    /// Priority tier of the filesystem backing this directory. Files in
    /// lower tiers are migrated first.
    fn dir_priority(&self, dir: &str) -> u8;

    /// Extract one entry under its staging name. `pkgctx` salts the
    /// staging name so concurrent state from different packages cannot
    /// collide.
    fn file_extract(&self, pkgctx: &str, info: &FileInfo, payload: &[u8]) -> io::Result<()>;

    /// Apply a final disposition to the file `dir`/`name` staged under
    /// `pkgctx`.
    fn file_control(&self, pkgctx: &str, dir: &str, name: &str, ctrl: FileControl)
    -> io::Result<()>;

    /// Does the on-disk file differ from the recorded checksum? A missing
    /// file counts as unmodified; a present file with no recorded checksum
    /// counts as modified.
    fn file_modified(&self, dir: &str, name: &str, expected: &Checksum) -> bool;

    /// Does a committed file (or symlink) exist at `dir`/`name`?
    fn file_exists(&self, dir: &str, name: &str) -> bool;
}

/// System filesystem rooted at the database root.
pub struct SysFs {
    root: PathBuf,
    /// Skip chown after extraction (usermode operation)
    no_chown: bool,
}

impl SysFs {
    pub fn new(root: impl Into<PathBuf>, no_chown: bool) -> SysFs {
        SysFs {
            root: root.into(),
            no_chown,
        }
    }

    fn path(&self, rel: &str) -> PathBuf {
        if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        }
    }

    fn join(dir: &str, name: &str) -> String {
        if dir.is_empty() {
            name.to_string()
        } else {
            format!("{dir}/{name}")
        }
    }

    /// Staging name for `fullname` extracted on behalf of `pkgctx`:
    /// `<dirname>/.pkgdb.<hex of sha256(pkgctx, fullname)[..24]>`.
    fn staging_name(pkgctx: &str, fullname: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(pkgctx.as_bytes());
        hasher.update([0u8]);
        hasher.update(fullname.as_bytes());
        let digest = hasher.finalize();
        let tmp = format!("{STAGING_PREFIX}{}", hex::encode(&digest[..24]));
        match fullname.rsplit_once('/') {
            Some((dir, _)) => format!("{dir}/{tmp}"),
            None => tmp,
        }
    }

    #[cfg(unix)]
    fn chown(&self, path: &Path, uid: u32, gid: u32, follow: bool) -> io::Result<()> {
        use rustix::fs::{AtFlags, Gid, Uid};
        if self.no_chown {
            return Ok(());
        }
        let flags = if follow {
            AtFlags::empty()
        } else {
            AtFlags::SYMLINK_NOFOLLOW
        };
        rustix::fs::chownat(
            rustix::fs::CWD,
            path,
            Some(Uid::from_raw(uid)),
            Some(Gid::from_raw(gid)),
            flags,
        )
        .map_err(io::Error::from)
    }

    fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
    }

    fn digest_on_disk(&self, path: &Path, want_len: usize) -> io::Result<Checksum> {
        let meta = fs::symlink_metadata(path)?;
        let digest = if meta.file_type().is_symlink() {
            let target = fs::read_link(path)?;
            Sha256::digest(target.as_os_str().as_encoded_bytes())
        } else {
            Sha256::digest(fs::read(path)?)
        };
        Ok(Checksum::from_bytes(&digest[..want_len.min(digest.len())]))
    }
}

impl Filesystem for SysFs {
    fn dir_create(&self, dir: &str, mode: u32) -> io::Result<()> {
        let path = self.path(dir);
        fs::create_dir(&path)?;
        Self::set_mode(&path, mode)
    }

    fn dir_delete(&self, dir: &str) -> io::Result<()> {
        fs::remove_dir(self.path(dir))
    }

    fn dir_check(&self, dir: &str, mode: u32, uid: u32, gid: u32) -> io::Result<DirCheck> {
        use std::os::unix::fs::MetadataExt;
        let meta = match fs::symlink_metadata(self.path(dir)) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(DirCheck::Missing),
            Err(e) => return Err(e),
        };
        if meta.mode() & 0o7777 != mode & 0o7777
            || (!self.no_chown && (meta.uid() != uid || meta.gid() != gid))
        {
            return Ok(DirCheck::Modified);
        }
        Ok(DirCheck::Ok)
    }

    fn dir_update_perms(&self, dir: &str, mode: u32, uid: u32, gid: u32) -> io::Result<()> {
        let path = self.path(dir);
        Self::set_mode(&path, mode)?;
        self.chown(&path, uid, gid, true)
    }

    fn dir_priority(&self, _dir: &str) -> u8 {
        PRIO_DISK
    }

    fn file_extract(&self, pkgctx: &str, info: &FileInfo, payload: &[u8]) -> io::Result<()> {
        let staged = Self::staging_name(pkgctx, &info.name);
        let path = self.path(&staged);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        match info.kind {
            EntryKind::Directory => {
                // Directories are created in place, not staged
                return match fs::create_dir(self.path(&info.name)) {
                    Ok(()) => Self::set_mode(&self.path(&info.name), info.mode),
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
                    Err(e) => Err(e),
                };
            }
            EntryKind::Regular => match &info.link_target {
                None => {
                    fs::write(&path, payload)?;
                    Self::set_mode(&path, info.mode)?;
                }
                Some(target) => {
                    // Hard link against the target's staging name
                    let staged_target = Self::staging_name(pkgctx, target);
                    fs::hard_link(self.path(&staged_target), &path)?;
                    return Ok(());
                }
            },
            EntryKind::Symlink => {
                let target = info.link_target.as_deref().unwrap_or("");
                #[cfg(unix)]
                std::os::unix::fs::symlink(target, &path)?;
                return self.chown(&path, info.uid, info.gid, false);
            }
            EntryKind::Fifo | EntryKind::CharDev | EntryKind::BlockDev | EntryKind::Socket => {
                return Err(io::Error::from(io::ErrorKind::Unsupported));
            }
        }

        self.chown(&path, info.uid, info.gid, true)?;
        if info.mode & 0o7000 != 0 {
            // chown clears setuid/setgid bits
            Self::set_mode(&path, info.mode)?;
        }
        Ok(())
    }

    fn file_control(
        &self,
        pkgctx: &str,
        dir: &str,
        name: &str,
        ctrl: FileControl,
    ) -> io::Result<()> {
        let real = Self::join(dir, name);
        let staged = self.path(&Self::staging_name(pkgctx, &real));
        match ctrl {
            FileControl::Commit => fs::rename(staged, self.path(&real)),
            FileControl::MarkNew => fs::rename(staged, self.path(&format!("{real}{NEW_SUFFIX}"))),
            FileControl::Cancel => fs::remove_file(staged),
            FileControl::Delete => fs::remove_file(self.path(&real)),
        }
    }

    fn file_exists(&self, dir: &str, name: &str) -> bool {
        self.path(&Self::join(dir, name)).symlink_exists()
    }

    fn file_modified(&self, dir: &str, name: &str, expected: &Checksum) -> bool {
        let path = self.path(&Self::join(dir, name));
        if !path.symlink_exists() {
            return false;
        }
        if expected.is_none() {
            return true;
        }
        match self.digest_on_disk(&path, expected.len()) {
            Ok(on_disk) => on_disk != *expected,
            Err(e) => {
                warn!("audit of {} failed: {}", path.display(), e);
                true
            }
        }
    }
}

trait SymlinkExists {
    fn symlink_exists(&self) -> bool;
}

impl SymlinkExists for Path {
    fn symlink_exists(&self) -> bool {
        fs::symlink_metadata(self).is_ok()
    }
}

/// Cached uid/gid resolution from the root's passwd and group files.
///
/// Invalidated when a transaction commits a new `etc/passwd` or
/// `etc/group`.
pub struct IdCache {
    root: PathBuf,
    uids: Option<HashMap<String, u32>>,
    gids: Option<HashMap<String, u32>>,
}

impl IdCache {
    pub fn new(root: impl Into<PathBuf>) -> IdCache {
        IdCache {
            root: root.into(),
            uids: None,
            gids: None,
        }
    }

    /// Drop all cached entries; the next lookup re-reads the files.
    pub fn reset(&mut self) {
        self.uids = None;
        self.gids = None;
    }

    pub fn uid_for(&mut self, name: &str) -> Option<u32> {
        if self.uids.is_none() {
            self.uids = Some(Self::parse(&self.root.join("etc/passwd")));
        }
        self.uids.as_ref().and_then(|m| m.get(name).copied())
    }

    pub fn gid_for(&mut self, name: &str) -> Option<u32> {
        if self.gids.is_none() {
            self.gids = Some(Self::parse(&self.root.join("etc/group")));
        }
        self.gids.as_ref().and_then(|m| m.get(name).copied())
    }

    fn parse(path: &Path) -> HashMap<String, u32> {
        let mut map = HashMap::new();
        let Ok(content) = fs::read_to_string(path) else {
            return map;
        };
        for line in content.lines() {
            let mut fields = line.split(':');
            let (Some(name), _, Some(id)) = (fields.next(), fields.next(), fields.next()) else {
                continue;
            };
            if let Ok(id) = id.parse() {
                map.insert(name.to_string(), id);
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sysfs() -> (TempDir, SysFs) {
        let tmp = TempDir::new().unwrap();
        let fs = SysFs::new(tmp.path(), true);
        (tmp, fs)
    }

    fn regular(name: &str, payload: &[u8]) -> FileInfo {
        let mut info = FileInfo::new(name, EntryKind::Regular, 0o644);
        info.size = payload.len() as u64;
        info.digest = Checksum::digest(payload);
        info
    }

    #[test]
    fn test_staged_extract_then_commit() {
        let (tmp, fs) = sysfs();
        fs.dir_create("usr", 0o755).unwrap();

        let info = regular("usr/hello", b"hi");
        fs.file_extract("pkg", &info, b"hi").unwrap();
        // Not yet visible under the real name
        assert!(!tmp.path().join("usr/hello").exists());

        fs.file_control("pkg", "usr", "hello", FileControl::Commit)
            .unwrap();
        assert_eq!(std::fs::read(tmp.path().join("usr/hello")).unwrap(), b"hi");
    }

    #[test]
    fn test_cancel_discards_staged_file() {
        let (tmp, fs) = sysfs();
        let info = regular("hello", b"hi");
        fs.file_extract("pkg", &info, b"hi").unwrap();
        fs.file_control("pkg", "", "hello", FileControl::Cancel)
            .unwrap();
        assert!(!tmp.path().join("hello").exists());
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_mark_new_keeps_local_file() {
        let (tmp, fs) = sysfs();
        std::fs::write(tmp.path().join("conf"), b"local edit").unwrap();

        let info = regular("conf", b"packaged");
        fs.file_extract("pkg", &info, b"packaged").unwrap();
        fs.file_control("pkg", "", "conf", FileControl::MarkNew)
            .unwrap();

        assert_eq!(
            std::fs::read(tmp.path().join("conf")).unwrap(),
            b"local edit"
        );
        assert_eq!(
            std::fs::read(tmp.path().join(format!("conf{NEW_SUFFIX}"))).unwrap(),
            b"packaged"
        );
    }

    #[test]
    fn test_hard_link_against_staged_target() {
        let (tmp, fs) = sysfs();
        let info = regular("a", b"data");
        fs.file_extract("pkg", &info, b"data").unwrap();

        let mut link = FileInfo::new("b", EntryKind::Regular, 0o644);
        link.link_target = Some("a".to_string());
        fs.file_extract("pkg", &link, b"").unwrap();

        fs.file_control("pkg", "", "a", FileControl::Commit).unwrap();
        fs.file_control("pkg", "", "b", FileControl::Commit).unwrap();
        assert_eq!(std::fs::read(tmp.path().join("b")).unwrap(), b"data");
    }

    #[test]
    fn test_file_modified_audit() {
        let (tmp, fs) = sysfs();
        std::fs::write(tmp.path().join("f"), b"content").unwrap();

        let good = Checksum::digest(b"content");
        let bad = Checksum::digest(b"other");
        assert!(!fs.file_modified("", "f", &good));
        assert!(fs.file_modified("", "f", &bad));
        // Missing file counts as unmodified
        assert!(!fs.file_modified("", "absent", &good));
        // Present file with no recorded checksum counts as modified
        assert!(fs.file_modified("", "f", &Checksum::NONE));
        drop(tmp);
    }

    #[test]
    fn test_dir_check() {
        let (_tmp, fs) = sysfs();
        fs.dir_create("d", 0o750).unwrap();
        assert_eq!(fs.dir_check("d", 0o750, 0, 0).unwrap(), DirCheck::Ok);
        assert_eq!(fs.dir_check("d", 0o755, 0, 0).unwrap(), DirCheck::Modified);
        assert_eq!(fs.dir_check("x", 0o755, 0, 0).unwrap(), DirCheck::Missing);
    }

    #[test]
    fn test_id_cache_reset_rereads() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("etc")).unwrap();
        std::fs::write(tmp.path().join("etc/passwd"), "root:x:0:0:root:/:/bin/sh\n").unwrap();

        let mut cache = IdCache::new(tmp.path());
        assert_eq!(cache.uid_for("root"), Some(0));
        assert_eq!(cache.uid_for("ntp"), None);

        std::fs::write(
            tmp.path().join("etc/passwd"),
            "root:x:0:0:root:/:/bin/sh\nntp:x:123:123::/:/sbin/nologin\n",
        )
        .unwrap();
        // Still cached until reset
        assert_eq!(cache.uid_for("ntp"), None);
        cache.reset();
        assert_eq!(cache.uid_for("ntp"), Some(123));
    }
}
