// src/db/mod.rs

//! The package database
//!
//! [`Database`] owns the four core indices (names, packages, directories,
//! files), the atom table, the filesystem shadow tree, and the repository
//! table, and drives the install/uninstall transaction. It is a
//! single-threaded, synchronous structure; opening for write takes an
//! exclusive advisory lock so at most one writer exists system-wide.
//!
//! Submodules:
//! - `tree`: filesystem shadow tree entities and operations
//! - `protect`: protected-path patterns and inheritance
//! - `fdb`: the line-oriented on-disk database codec
//! - `install`: the install/uninstall transaction
//! - `trigger`: pending-trigger matching

pub mod fdb;
pub mod install;
pub mod protect;
pub mod tree;
pub mod trigger;

use crate::atom::AtomTable;
use crate::checksum::Checksum;
use crate::error::{Error, Result};
use crate::fs::{Filesystem, IdCache, SysFs};
use crate::package::{
    display_cmp, Dependency, Name, NameId, Package, PackageId, Provider, ScriptKind,
};
use crate::repository::{Fetch, RepoSet};
use chrono::Duration as CacheAge;
use globset::Glob;
use protect::ProtectedPath;
use rustix::fs::{flock, FlockOperation};
use std::collections::HashMap;
use std::fs;
use std::fs::File;
use std::path::PathBuf;
use std::process::Command;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use tree::{DirId, Directory, DirectoryInstance, FileEntity, FileId};

pub const DB_DIR: &str = "lib/pkgdb/db";
pub const DB_LOCK: &str = "lib/pkgdb/db/lock";
pub const DB_INSTALLED: &str = "lib/pkgdb/db/installed";
pub const DB_TRIGGERS: &str = "lib/pkgdb/db/triggers";
pub const DB_SCRIPTS: &str = "lib/pkgdb/db/scripts";
pub const WORLD_FILE: &str = "etc/pkgdb/world";
pub const REPOS_FILE: &str = "etc/pkgdb/repositories";
pub const REPOS_DIR: &str = "etc/pkgdb/repositories.d";
pub const PROTECTED_DIR: &str = "etc/pkgdb/protected_paths.d";
pub const CACHE_DIR: &str = "var/cache/pkgdb";

const SCRIPT_PATH: &str = "/usr/sbin:/usr/bin:/sbin:/bin";

/// Options controlling how a [`Database`] is opened.
pub struct DbOptions {
    pub root: PathBuf,
    pub read: bool,
    pub write: bool,
    /// Dry run: keep all index bookkeeping, suppress filesystem and
    /// script side effects
    pub simulate: bool,
    /// Proceed with a warning on unresolvable file conflicts
    pub force_overwrite: bool,
    /// Overwrite protected paths instead of preserving local changes
    pub clean_protected: bool,
    /// Tolerate unknown installed-database fields written by a newer
    /// version; such records become installed metadata only
    pub legacy_compat: bool,
    /// Skip ownership changes (operation without root privileges)
    pub usermode: bool,
    /// Keep lifecycle script environment instead of sanitizing it
    pub preserve_env: bool,
    pub no_cache: bool,
    /// How long to wait for the write lock on contention
    pub lock_wait: Duration,
    /// Cached repository indices younger than this are not refreshed
    pub cache_max_age: CacheAge,
    /// Filesystem override, mainly for tests
    pub filesystem: Option<Box<dyn Filesystem>>,
}

impl DbOptions {
    pub fn new(root: impl Into<PathBuf>) -> DbOptions {
        DbOptions {
            root: root.into(),
            read: true,
            write: false,
            simulate: false,
            force_overwrite: false,
            clean_protected: false,
            legacy_compat: false,
            usermode: false,
            preserve_env: false,
            no_cache: false,
            lock_wait: Duration::ZERO,
            cache_max_age: CacheAge::hours(4),
            filesystem: None,
        }
    }

    pub fn read_write(mut self) -> DbOptions {
        self.write = true;
        self
    }

    pub fn simulate(mut self) -> DbOptions {
        self.simulate = true;
        self
    }

    pub fn usermode(mut self) -> DbOptions {
        self.usermode = true;
        self
    }

    pub fn with_filesystem(mut self, fs: Box<dyn Filesystem>) -> DbOptions {
        self.filesystem = Some(fs);
        self
    }
}

/// Counters over the installed state.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstallStats {
    pub packages: usize,
    pub dirs: usize,
    pub files: usize,
    pub bytes: u64,
}

type FileKey = (DirId, String);

/// One open package database instance.
pub struct Database {
    pub(crate) root: PathBuf,
    pub(crate) opts: DbOptions,
    pub(crate) atoms: AtomTable,
    pub(crate) fs: Box<dyn Filesystem>,
    pub(crate) id_cache: IdCache,
    pub repos: RepoSet,

    pub(crate) names: Vec<Name>,
    pub(crate) name_index: HashMap<String, NameId>,
    pub(crate) packages: Vec<Package>,
    pub(crate) pkg_index: HashMap<Checksum, PackageId>,
    pub(crate) installed_order: Vec<PackageId>,
    pub(crate) world: Vec<Dependency>,
    pub(crate) overlay: Option<PackageId>,
    rdepends_done: bool,
    sorted_names: Option<Vec<NameId>>,
    sorted_installed: Option<Vec<PackageId>>,

    pub(crate) dirs: Vec<Directory>,
    pub(crate) dir_index: HashMap<String, DirId>,
    pub(crate) diris: Vec<Option<DirectoryInstance>>,
    pub(crate) files: Vec<Option<FileEntity>>,
    pub(crate) file_index: HashMap<FileKey, FileId>,
    pub(crate) root_protected: Vec<ProtectedPath>,
    pub(crate) dirperms_stale: bool,

    pub(crate) stats: InstallStats,
    pub(crate) pending_triggers: usize,
    lock: Option<File>,
}

impl Database {
    /// Open the database under `opts.root`, acquiring the write lock and
    /// loading the installed state, world, triggers, scripts, and
    /// repository configuration.
    pub fn open(mut opts: DbOptions) -> Result<Database> {
        if !opts.read && !opts.write {
            return Err(Error::InvalidOpenFlags);
        }
        let root = opts.root.clone();
        let fs = opts
            .filesystem
            .take()
            .unwrap_or_else(|| Box::new(SysFs::new(&root, opts.usermode)));

        let mut db = Database {
            id_cache: IdCache::new(&root),
            root,
            opts,
            atoms: AtomTable::new(),
            fs,
            repos: RepoSet::new(),
            names: Vec::new(),
            name_index: HashMap::new(),
            packages: Vec::new(),
            pkg_index: HashMap::new(),
            installed_order: Vec::new(),
            world: Vec::new(),
            overlay: None,
            rdepends_done: false,
            sorted_names: None,
            sorted_installed: None,
            dirs: Vec::new(),
            dir_index: HashMap::new(),
            diris: Vec::new(),
            files: Vec::new(),
            file_index: HashMap::new(),
            root_protected: Vec::new(),
            dirperms_stale: false,
            stats: InstallStats::default(),
            pending_triggers: 0,
            lock: None,
        };

        if db.opts.write && !db.opts.simulate {
            db.prepare_layout()?;
            db.lock = Some(db.acquire_lock()?);
        }
        db.load_protected_paths()?;
        db.read_world()?;
        db.read_installed()?;
        db.read_triggers()?;
        db.read_scripts()?;
        db.read_repository_config()?;
        db.index_rdepends();
        info!(
            root = %db.root.display(),
            packages = db.installed_order.len(),
            "database opened"
        );
        Ok(db)
    }

    fn prepare_layout(&self) -> Result<()> {
        for dir in [DB_DIR, DB_SCRIPTS, "etc/pkgdb", CACHE_DIR] {
            fs::create_dir_all(self.root.join(dir))?;
        }
        Ok(())
    }

    fn acquire_lock(&self) -> Result<File> {
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.root.join(DB_LOCK))?;
        let deadline = Instant::now() + self.opts.lock_wait;
        loop {
            match flock(&file, FlockOperation::NonBlockingLockExclusive) {
                Ok(()) => return Ok(file),
                Err(rustix::io::Errno::WOULDBLOCK) => {
                    if Instant::now() >= deadline {
                        return Err(Error::LockUnavailable(
                            "timed out waiting for exclusive lock".to_string(),
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(250));
                }
                Err(e) => return Err(Error::LockUnavailable(e.to_string())),
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Persist the installed database, triggers, scripts, and world file.
    /// Requires the write lock; a no-op in simulate mode.
    pub fn write_config(&mut self) -> Result<()> {
        if self.opts.simulate {
            return Ok(());
        }
        if self.lock.is_none() {
            return Err(Error::NotLocked);
        }
        self.write_atomic(DB_INSTALLED, self.write_installed_text().as_bytes())?;
        self.write_atomic(DB_TRIGGERS, self.write_triggers_text().as_bytes())?;
        self.write_scripts()?;
        self.write_atomic(WORLD_FILE, self.write_world_text().as_bytes())?;
        info!("database state written");
        Ok(())
    }

    fn write_atomic(&self, rel: &str, bytes: &[u8]) -> Result<()> {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_file_name(format!(
            "{}.new",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("file")
        ));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Release the write lock, flushing pending directory permission
    /// updates first.
    pub fn close(mut self) -> Result<()> {
        if self.dirperms_stale && self.lock.is_some() && !self.opts.simulate {
            let errors = self.update_directory_permissions();
            if errors > 0 {
                warn!(errors, "some directory permission updates failed");
            }
        }
        self.lock.take();
        Ok(())
    }

    // Name index / package catalog

    pub fn get_or_create_name(&mut self, name: &str) -> NameId {
        if let Some(&id) = self.name_index.get(name) {
            return id;
        }
        let id = NameId(self.names.len() as u32);
        self.names.push(Name::new(name));
        self.name_index.insert(name.to_string(), id);
        self.sorted_names = None;
        id
    }

    pub fn query_name(&self, name: &str) -> Option<NameId> {
        self.name_index.get(name).copied()
    }

    pub fn name(&self, id: NameId) -> &Name {
        &self.names[id.0 as usize]
    }

    pub(crate) fn name_str(&self, id: NameId) -> &str {
        &self.names[id.0 as usize].name
    }

    pub fn package(&self, id: PackageId) -> &Package {
        &self.packages[id.0 as usize]
    }

    pub(crate) fn package_mut(&mut self, id: PackageId) -> &mut Package {
        &mut self.packages[id.0 as usize]
    }

    pub fn get_pkg(&self, csum: &Checksum) -> Option<PackageId> {
        self.pkg_index.get(csum).copied()
    }

    pub fn stats(&self) -> InstallStats {
        self.stats
    }

    pub fn installed_packages(&self) -> &[PackageId] {
        &self.installed_order
    }

    /// Checksum-keyed insert or merge: a second registration with an
    /// existing checksum folds into the survivor, which accumulates the
    /// repository bitmask and adopts filename and installed state.
    pub fn register_package(&mut self, pkg: Package) -> PackageId {
        if let Some(&id) = self.pkg_index.get(&pkg.checksum) {
            let survivor = &mut self.packages[id.0 as usize];
            survivor.repos |= pkg.repos;
            if survivor.filename.is_none() {
                survivor.filename = pkg.filename;
            }
            if survivor.ipkg.is_none() {
                survivor.ipkg = pkg.ipkg;
            }
            return id;
        }

        let id = PackageId(self.packages.len() as u32);
        let csum = pkg.checksum;
        let own_name = pkg.name;
        let version = pkg.version.clone();
        let provides = pkg.provides.clone();
        self.packages.push(pkg);
        self.pkg_index.insert(csum, id);

        if let Some(own) = own_name {
            self.names[own.0 as usize]
                .providers
                .push(Provider { pkg: id, version });
        }
        for dep in &provides {
            let nid = self.get_or_create_name(&dep.name);
            let provided_version = dep
                .constraint
                .as_ref()
                .map(|(_, v)| v.clone())
                .unwrap_or_default();
            self.names[nid.0 as usize].providers.push(Provider {
                pkg: id,
                version: provided_version,
            });
        }
        if self.rdepends_done {
            self.link_rdepends(id);
        }
        self.sorted_names = None;
        self.sorted_installed = None;
        id
    }

    /// Build the reverse-dependency graph and classify name priorities.
    /// Idempotent; later registrations link themselves incrementally.
    pub fn index_rdepends(&mut self) {
        if self.rdepends_done {
            return;
        }
        self.rdepends_done = true;
        for i in 0..self.packages.len() {
            self.link_rdepends(PackageId(i as u32));
        }
        for i in 0..self.names.len() {
            let id = NameId(i as u32);
            let mut real = false;
            let mut virt = false;
            for provider in &self.names[i].providers {
                if self.packages[provider.pkg.0 as usize].name == Some(id) {
                    real = true;
                } else {
                    virt = true;
                }
            }
            self.names[i].priority = match (real, virt) {
                (_, false) => 0,
                (true, true) => 1,
                (false, true) => 2,
            };
        }
    }

    fn link_rdepends(&mut self, pkg: PackageId) {
        let Some(owner) = self.packages[pkg.0 as usize].name else {
            return;
        };
        let dep_names: Vec<String> = self.packages[pkg.0 as usize]
            .depends
            .iter()
            .map(|d| d.name.clone())
            .collect();
        let iif_names: Vec<String> = self.packages[pkg.0 as usize]
            .install_if
            .iter()
            .map(|d| d.name.clone())
            .collect();
        for dep in dep_names {
            let nid = self.get_or_create_name(&dep);
            let rdeps = &mut self.names[nid.0 as usize].rdepends;
            if !rdeps.contains(&owner) {
                rdeps.push(owner);
            }
        }
        for dep in iif_names {
            let nid = self.get_or_create_name(&dep);
            let redges = &mut self.names[nid.0 as usize].rinstall_if;
            if !redges.contains(&owner) {
                redges.push(owner);
            }
        }
    }

    /// All names in display order. Cached; invalidated by membership
    /// mutation.
    pub fn sorted_names(&mut self) -> Vec<NameId> {
        if self.sorted_names.is_none() {
            let mut ids: Vec<NameId> = (0..self.names.len() as u32).map(NameId).collect();
            ids.sort_by(|a, b| self.names[a.0 as usize].name.cmp(&self.names[b.0 as usize].name));
            self.sorted_names = Some(ids);
        }
        self.sorted_names.clone().unwrap_or_default()
    }

    /// Installed packages in display order (name, then version).
    pub fn sorted_installed_packages(&mut self) -> Vec<PackageId> {
        if self.sorted_installed.is_none() {
            let mut ids = self.installed_order.clone();
            ids.sort_by(|a, b| {
                let pa = &self.packages[a.0 as usize];
                let pb = &self.packages[b.0 as usize];
                let na = pa.name.map(|n| self.name_str(n)).unwrap_or("");
                let nb = pb.name.map(|n| self.name_str(n)).unwrap_or("");
                display_cmp(na, &pa.version, nb, &pb.version)
            });
            self.sorted_installed = Some(ids);
        }
        self.sorted_installed.clone().unwrap_or_default()
    }

    pub(crate) fn invalidate_sorted(&mut self) {
        self.sorted_names = None;
        self.sorted_installed = None;
    }

    /// Names matching the given filters. Plain filters are direct
    /// lookups; filters with wildcard characters match against the full
    /// sorted index. No filters means every name.
    pub fn matching_names(&mut self, filters: &[&str]) -> Result<Vec<NameId>> {
        if filters.is_empty() {
            return Ok(self.sorted_names());
        }
        let mut out = Vec::new();
        let mut globs = Vec::new();
        for filter in filters {
            if filter.contains(['*', '?', '[']) {
                let glob = Glob::new(filter)
                    .map_err(|e| Error::BadPattern {
                        pattern: filter.to_string(),
                        reason: e.to_string(),
                    })?
                    .compile_matcher();
                globs.push(glob);
            } else if let Some(&id) = self.name_index.get(*filter) {
                out.push(id);
            }
        }
        if !globs.is_empty() {
            for id in self.sorted_names() {
                let name = &self.names[id.0 as usize].name;
                if globs.iter().any(|g| g.is_match(name)) {
                    out.push(id);
                }
            }
        }
        out.sort_by(|a, b| self.names[a.0 as usize].name.cmp(&self.names[b.0 as usize].name));
        out.dedup();
        Ok(out)
    }

    /// Which installed package owns the file at `path`?
    pub fn get_file_owner(&self, path: &str) -> Option<PackageId> {
        let path = path.trim_start_matches('/');
        let (dir, name) = path.rsplit_once('/').unwrap_or(("", path));
        let &did = self.dir_index.get(dir)?;
        let &fid = self.file_index.get(&(did, name.to_string()))?;
        let file = self.files[fid.0 as usize].as_ref()?;
        let diri = self.diris[file.diri.0 as usize].as_ref()?;
        Some(diri.pkg)
    }

    // World

    pub fn world(&self) -> &[Dependency] {
        &self.world
    }

    pub fn set_world(&mut self, world: Vec<Dependency>) {
        self.world = world;
    }

    fn read_world(&mut self) -> Result<()> {
        match fs::read_to_string(self.root.join(WORLD_FILE)) {
            Ok(text) => {
                self.world = crate::package::parse_deps(&text)?;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_world_text(&self) -> String {
        let mut text = crate::package::format_deps(&self.world);
        text.push('\n');
        text
    }

    // Repositories

    fn read_repository_config(&mut self) -> Result<()> {
        let read_file = |path: PathBuf, repos: &mut RepoSet| -> Result<()> {
            match fs::read_to_string(&path) {
                Ok(text) => {
                    for line in text.lines() {
                        repos.add_repository(line)?;
                    }
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        };
        read_file(self.root.join(REPOS_FILE), &mut self.repos)?;
        let dir = self.root.join(REPOS_DIR);
        if let Ok(entries) = fs::read_dir(&dir) {
            let mut paths: Vec<PathBuf> = entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|e| e == "list"))
                .collect();
            paths.sort();
            for path in paths {
                read_file(path, &mut self.repos)?;
            }
        }
        Ok(())
    }

    /// Load (and refresh) the index of every configured repository,
    /// merging its packages into the catalog. Returns the number of
    /// repositories that could not be loaded.
    pub fn update_repositories(&mut self, fetcher: Option<&dyn Fetch>) -> usize {
        let cache_dir = (!self.opts.no_cache).then(|| self.root.join(CACHE_DIR));
        let max_age = self.opts.cache_max_age;
        let mut errors = 0;
        for slot in 1..self.repos.num_repos() {
            match self
                .repos
                .load_index(slot, fetcher, cache_dir.as_deref(), max_age)
            {
                Ok(bytes) => {
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    if let Err(e) = self.read_index(&text, 1 << slot) {
                        warn!(slot, "repository index unreadable: {e}");
                        errors += 1;
                    }
                }
                Err(e) => {
                    warn!(slot, "repository unavailable: {e}");
                    errors += 1;
                }
            }
        }
        errors
    }

    // Lifecycle scripts

    /// Run one lifecycle script of an installed package, blocking until
    /// it exits. The script runs with the database root as working
    /// directory and a sanitized environment unless configured otherwise.
    pub(crate) fn run_script(
        &mut self,
        pkg: PackageId,
        kind: ScriptKind,
        args: &[&str],
    ) -> Result<()> {
        if self.opts.simulate {
            return Ok(());
        }
        let p = &self.packages[pkg.0 as usize];
        let Some(ipkg) = &p.ipkg else {
            return Ok(());
        };
        let Some(payload) = ipkg.get_script(kind) else {
            return Ok(());
        };
        let payload = payload.to_vec();
        let script_id = format!(
            "{}.{}",
            p.name.map(|n| self.name_str(n)).unwrap_or(""),
            kind.suffix()
        );
        debug!(script = script_id, "running lifecycle script");

        let dir = self.root.join(DB_SCRIPTS);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!(".run.{}", kind.suffix()));
        fs::write(&path, &payload)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        }

        let mut cmd = Command::new(&path);
        cmd.args(args).current_dir(&self.root);
        if !self.opts.preserve_env {
            cmd.env_clear().env("PATH", SCRIPT_PATH);
        }
        let status = cmd
            .status()
            .map_err(|e| Error::ScriptSpawn(script_id.clone(), e));
        let _ = fs::remove_file(&path);
        let status = status?;
        if !status.success() {
            return Err(Error::ScriptFailed(script_id, status.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_rw(root: &std::path::Path) -> Database {
        Database::open(DbOptions::new(root).read_write().usermode()).unwrap()
    }

    fn add_pkg(db: &mut Database, name: &str, version: &str, deps: &[&str]) -> PackageId {
        let nid = db.get_or_create_name(name);
        let mut pkg = Package::new(nid, version, Checksum::digest(format!("{name}-{version}").as_bytes()));
        for dep in deps {
            pkg.depends.push(Dependency::parse(dep).unwrap());
        }
        db.register_package(pkg)
    }

    #[test]
    fn test_open_requires_flags() {
        let tmp = TempDir::new().unwrap();
        let mut opts = DbOptions::new(tmp.path());
        opts.read = false;
        assert!(matches!(
            Database::open(opts),
            Err(Error::InvalidOpenFlags)
        ));
    }

    #[test]
    fn test_register_package_merges_by_checksum() {
        let tmp = TempDir::new().unwrap();
        let mut db = open_rw(tmp.path());
        let nid = db.get_or_create_name("busybox");
        let csum = Checksum::digest(b"busybox-1.36.1");

        let mut a = Package::new(nid, "1.36.1", csum);
        a.repos = 1 << 1;
        let mut b = Package::new(nid, "1.36.1", csum);
        b.repos = 1 << 2;
        b.filename = Some("busybox-1.36.1.apk".to_string());

        let id_a = db.register_package(a);
        let id_b = db.register_package(b);
        assert_eq!(id_a, id_b);
        let pkg = db.package(id_a);
        assert_eq!(pkg.repos, (1 << 1) | (1 << 2));
        assert_eq!(pkg.filename.as_deref(), Some("busybox-1.36.1.apk"));
        db.close().unwrap();
    }

    #[test]
    fn test_rdepends_idempotent_and_classified() {
        let tmp = TempDir::new().unwrap();
        let mut db = open_rw(tmp.path());
        let app = add_pkg(&mut db, "app", "1.0.0", &["libfoo"]);
        db.index_rdepends();
        db.index_rdepends();

        let lib = db.query_name("libfoo").unwrap();
        assert_eq!(db.name(lib).rdepends, vec![db.package(app).name.unwrap()]);

        // A provider that is not the name itself makes it virtual-only
        let nid = db.get_or_create_name("provider");
        let mut pkg = Package::new(nid, "1.0.0", Checksum::digest(b"provider"));
        pkg.provides.push(Dependency::parse("libfoo=1.0.0").unwrap());
        db.register_package(pkg);
        db.rdepends_done = false;
        db.index_rdepends();
        assert_eq!(db.name(lib).priority, 2);
        db.close().unwrap();
    }

    #[test]
    fn test_sorted_names_cache_invalidation() {
        let tmp = TempDir::new().unwrap();
        let mut db = open_rw(tmp.path());
        add_pkg(&mut db, "zsh", "5.9.0", &[]);
        add_pkg(&mut db, "bash", "5.2.0", &[]);
        let names: Vec<&str> = db
            .sorted_names()
            .into_iter()
            .map(|id| db.name(id).name.as_str())
            .collect::<Vec<_>>()
            .into_iter()
            .collect();
        assert_eq!(names, vec!["bash", "zsh"]);

        add_pkg(&mut db, "awk", "1.0.0", &[]);
        let first = db.sorted_names()[0];
        assert_eq!(db.name(first).name, "awk");
        db.close().unwrap();
    }

    #[test]
    fn test_matching_names_wildcards() {
        let tmp = TempDir::new().unwrap();
        let mut db = open_rw(tmp.path());
        for name in ["libssl", "libcrypto", "openssl"] {
            add_pkg(&mut db, name, "3.0.0", &[]);
        }
        let hits = db.matching_names(&["lib*"]).unwrap();
        let names: Vec<&str> = hits.iter().map(|&id| db.name(id).name.as_str()).collect();
        assert_eq!(names, vec!["libcrypto", "libssl"]);

        let exact = db.matching_names(&["openssl"]).unwrap();
        assert_eq!(exact.len(), 1);
        assert!(db.matching_names(&["[bad"]).is_err());
        db.close().unwrap();
    }

    #[test]
    fn test_write_lock_exclusion() {
        let tmp = TempDir::new().unwrap();
        let db = open_rw(tmp.path());
        assert!(db.is_locked());
        let contender = Database::open(DbOptions::new(tmp.path()).read_write().usermode());
        assert!(matches!(contender, Err(Error::LockUnavailable(_))));
        db.close().unwrap();

        let db = open_rw(tmp.path());
        assert!(db.is_locked());
        db.close().unwrap();
    }

    #[test]
    fn test_write_config_requires_lock() {
        let tmp = TempDir::new().unwrap();
        let mut db = Database::open(DbOptions::new(tmp.path()).usermode()).unwrap();
        assert!(matches!(db.write_config(), Err(Error::NotLocked)));
    }

    #[test]
    fn test_world_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let mut db = open_rw(tmp.path());
        db.set_world(vec![
            Dependency::parse("busybox").unwrap(),
            Dependency::parse("nginx@edge>=1.2.0").unwrap(),
        ]);
        db.write_config().unwrap();
        db.close().unwrap();

        let db = Database::open(DbOptions::new(tmp.path()).usermode()).unwrap();
        assert_eq!(
            crate::package::format_deps(db.world()),
            "busybox nginx@edge>=1.2.0"
        );
    }
}
