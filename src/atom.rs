// src/atom.rs

//! Atom table
//!
//! Deduplicates immutable small records by content: arbitrary byte strings
//! and file/directory ACL tuples. Atomizing equal content twice returns the
//! same handle, so handle equality substitutes for value equality wherever
//! handles are compared. Nothing is ever removed for the lifetime of the
//! database.

use crate::checksum::Checksum;
use indexmap::IndexSet;

/// Handle to an interned byte string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Atom(u32);

/// Handle to an interned ACL tuple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AclHandle(u32);

/// Immutable (mode, uid, gid, optional xattr checksum) tuple.
///
/// Never mutated in place; always atomized and compared by handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Acl {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub xattr_csum: Checksum,
}

impl Acl {
    pub fn new(mode: u32, uid: u32, gid: u32) -> Acl {
        Acl {
            mode: mode & 0o7777,
            uid,
            gid,
            xattr_csum: Checksum::NONE,
        }
    }

    pub fn with_xattr(mode: u32, uid: u32, gid: u32, xattr_csum: Checksum) -> Acl {
        Acl {
            mode: mode & 0o7777,
            uid,
            gid,
            xattr_csum,
        }
    }
}

/// Content-addressed store for byte strings and ACLs.
///
/// Also owns the process defaults for directory and file ACLs, which are
/// fixed at construction rather than living as module globals.
pub struct AtomTable {
    blobs: IndexSet<Box<[u8]>>,
    acls: IndexSet<Acl>,
    default_acl_dir: AclHandle,
    default_acl_file: AclHandle,
}

impl AtomTable {
    pub fn new() -> AtomTable {
        let mut table = AtomTable {
            blobs: IndexSet::new(),
            acls: IndexSet::new(),
            default_acl_dir: AclHandle(0),
            default_acl_file: AclHandle(0),
        };
        table.default_acl_dir = table.atomize_acl(Acl::new(0o755, 0, 0));
        table.default_acl_file = table.atomize_acl(Acl::new(0o644, 0, 0));
        table
    }

    /// Intern a byte string, returning the existing handle when equal
    /// content was atomized before.
    pub fn atomize(&mut self, bytes: &[u8]) -> Atom {
        if let Some(idx) = self.blobs.get_index_of(bytes) {
            return Atom(idx as u32);
        }
        let (idx, _) = self.blobs.insert_full(bytes.into());
        Atom(idx as u32)
    }

    pub fn atomize_str(&mut self, s: &str) -> Atom {
        self.atomize(s.as_bytes())
    }

    pub fn get(&self, atom: Atom) -> &[u8] {
        &self.blobs[atom.0 as usize]
    }

    pub fn get_str(&self, atom: Atom) -> &str {
        // Atoms created through atomize_str are always valid UTF-8
        std::str::from_utf8(self.get(atom)).unwrap_or("")
    }

    /// Intern an ACL tuple.
    pub fn atomize_acl(&mut self, acl: Acl) -> AclHandle {
        let (idx, _) = self.acls.insert_full(acl);
        AclHandle(idx as u32)
    }

    pub fn acl(&self, handle: AclHandle) -> &Acl {
        &self.acls[handle.0 as usize]
    }

    /// Default ACL assigned to directories with no explicit entry (0755 root:root)
    pub fn default_acl_dir(&self) -> AclHandle {
        self.default_acl_dir
    }

    /// Default ACL assigned to files with no explicit entry (0644 root:root)
    pub fn default_acl_file(&self) -> AclHandle {
        self.default_acl_file
    }
}

impl Default for AtomTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomize_deduplicates() {
        let mut t = AtomTable::new();
        let a = t.atomize(b"x86_64");
        let b = t.atomize(b"x86_64");
        let c = t.atomize(b"aarch64");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(t.get(a), b"x86_64");
    }

    #[test]
    fn test_acl_handle_equality_is_value_equality() {
        let mut t = AtomTable::new();
        let a = t.atomize_acl(Acl::new(0o755, 0, 0));
        let b = t.atomize_acl(Acl::new(0o755, 0, 0));
        let c = t.atomize_acl(Acl::new(0o700, 0, 0));
        assert_eq!(a, b);
        assert_ne!(a, c);
        // 0755 root:root is also the directory default
        assert_eq!(a, t.default_acl_dir());
    }

    #[test]
    fn test_mode_masked_to_permission_bits() {
        let acl = Acl::new(0o40755, 0, 0);
        assert_eq!(acl.mode, 0o755);
    }

    #[test]
    fn test_xattr_checksum_distinguishes_acls() {
        let mut t = AtomTable::new();
        let plain = t.atomize_acl(Acl::new(0o644, 0, 0));
        let with_xattr = t.atomize_acl(Acl::with_xattr(0o644, 0, 0, Checksum::digest(b"xattrs")));
        assert_ne!(plain, with_xattr);
    }
}
