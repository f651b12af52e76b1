// src/package.rs

//! Package model
//!
//! Names, providers, packages, and installed-package state, plus the
//! dependency text format used by the world file and package headers and
//! the replace policy that arbitrates file and directory ownership
//! between packages.

use crate::atom::Atom;
use crate::checksum::Checksum;
use crate::db::tree::DiriId;
use crate::error::{Error, Result};
use crate::version;
use std::cmp::Ordering;
use std::fmt;

/// Handle into the name arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NameId(pub u32);

/// Handle into the package arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PackageId(pub u32);

/// Lifecycle script hooks, in firing order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptKind {
    PreInstall,
    PostInstall,
    PreDeinstall,
    PostDeinstall,
    PreUpgrade,
    PostUpgrade,
    Trigger,
}

impl ScriptKind {
    pub const ALL: [ScriptKind; 7] = [
        ScriptKind::PreInstall,
        ScriptKind::PostInstall,
        ScriptKind::PreDeinstall,
        ScriptKind::PostDeinstall,
        ScriptKind::PreUpgrade,
        ScriptKind::PostUpgrade,
        ScriptKind::Trigger,
    ];

    /// File name suffix used in the scripts directory
    pub fn suffix(self) -> &'static str {
        match self {
            ScriptKind::PreInstall => "pre-install",
            ScriptKind::PostInstall => "post-install",
            ScriptKind::PreDeinstall => "pre-deinstall",
            ScriptKind::PostDeinstall => "post-deinstall",
            ScriptKind::PreUpgrade => "pre-upgrade",
            ScriptKind::PostUpgrade => "post-upgrade",
            ScriptKind::Trigger => "trigger",
        }
    }

    pub fn from_suffix(suffix: &str) -> Option<ScriptKind> {
        ScriptKind::ALL.into_iter().find(|k| k.suffix() == suffix)
    }
}

/// One dependency specification, as written in world files and the
/// `D:`/`p:`/`i:`/`r:` header fields.
///
/// Text shape: `[!]name[@tag][<op><version>]` where `<op>` is one of
/// `=`, `<`, `>`, `<=`, `>=`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub name: String,
    /// Repository pinning tag (world file only)
    pub tag: Option<String>,
    /// Version constraint as (operator, version)
    pub constraint: Option<(String, String)>,
    /// Leading `!`: the named package must not be installed
    pub conflict: bool,
}

impl Dependency {
    pub fn parse(spec: &str) -> Result<Dependency> {
        let bad = || Error::BadDependency(spec.to_string());
        let (conflict, rest) = match spec.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, spec),
        };
        let (head, constraint) = match rest.find(['<', '>', '=']) {
            Some(pos) => {
                let (head, op_ver) = rest.split_at(pos);
                let ver_start = op_ver
                    .find(|c| c != '<' && c != '>' && c != '=')
                    .ok_or_else(bad)?;
                let (op, ver) = op_ver.split_at(ver_start);
                (head, Some((op.to_string(), ver.to_string())))
            }
            None => (rest, None),
        };
        let (name, tag) = match head.split_once('@') {
            Some((name, tag)) if !tag.is_empty() => (name, Some(tag.to_string())),
            Some(_) => return Err(bad()),
            None => (head, None),
        };
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(bad());
        }
        Ok(Dependency {
            name: name.to_string(),
            tag,
            constraint,
            conflict,
        })
    }

    /// Would a package `name`/`version` satisfy this dependency's name
    /// and version constraint? Ignores the conflict flag.
    pub fn matches(&self, name: &str, version: &str) -> bool {
        if self.name != name {
            return false;
        }
        match &self.constraint {
            Some((op, want)) => version::satisfies(version, op, want),
            None => true,
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.conflict {
            write!(f, "!")?;
        }
        write!(f, "{}", self.name)?;
        if let Some(tag) = &self.tag {
            write!(f, "@{tag}")?;
        }
        if let Some((op, ver)) = &self.constraint {
            write!(f, "{op}{ver}")?;
        }
        Ok(())
    }
}

/// Parse a whitespace-separated dependency list.
pub fn parse_deps(text: &str) -> Result<Vec<Dependency>> {
    text.split_whitespace().map(Dependency::parse).collect()
}

/// Render a dependency list as a single space-separated line.
pub fn format_deps(deps: &[Dependency]) -> String {
    let mut out = String::new();
    for dep in deps {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&dep.to_string());
    }
    out
}

/// A package name, owning its provider list and reverse edges.
#[derive(Debug)]
pub struct Name {
    pub name: String,
    /// Packages that are this name or declare it in `provides`
    pub providers: Vec<Provider>,
    /// Names whose packages depend on this name
    pub rdepends: Vec<NameId>,
    /// Names whose packages list this name in `install_if`
    pub rinstall_if: Vec<NameId>,
    /// 0 = real packages only, 1 = mixed, 2 = virtual providers only
    pub priority: u8,
}

impl Name {
    pub fn new(name: &str) -> Name {
        Name {
            name: name.to_string(),
            providers: Vec::new(),
            rdepends: Vec::new(),
            rinstall_if: Vec::new(),
            priority: 0,
        }
    }
}

/// One provider edge: a package offering a name, with the version it
/// offers it at (the package's own version, or the `provides` version).
#[derive(Debug, Clone)]
pub struct Provider {
    pub pkg: PackageId,
    pub version: String,
}

/// A package known to the catalog, unique by content checksum.
///
/// `name` is `None` only for the overlay pseudo-package, whose files
/// always win migration.
#[derive(Debug)]
pub struct Package {
    pub name: Option<NameId>,
    pub version: String,
    pub checksum: Checksum,
    pub arch: Option<Atom>,
    pub license: Option<Atom>,
    pub description: Option<String>,
    pub installed_size: u64,
    pub size: u64,
    pub filename: Option<String>,
    /// Repository membership bitmask; bit 0 is the synthetic cache slot
    pub repos: u32,
    pub depends: Vec<Dependency>,
    pub provides: Vec<Dependency>,
    pub install_if: Vec<Dependency>,
    /// Record read under the legacy-compat override; kept as installed
    /// metadata only, never reinstallable from a repository
    pub uninstallable: bool,
    pub ipkg: Option<Box<InstalledPackage>>,
}

impl Package {
    pub fn new(name: NameId, version: &str, checksum: Checksum) -> Package {
        Package {
            name: Some(name),
            version: version.to_string(),
            checksum,
            arch: None,
            license: None,
            description: None,
            installed_size: 0,
            size: 0,
            filename: None,
            repos: 0,
            depends: Vec::new(),
            provides: Vec::new(),
            install_if: Vec::new(),
            uninstallable: false,
            ipkg: None,
        }
    }

    /// The nameless overlay pseudo-package.
    pub fn overlay() -> Package {
        Package {
            name: None,
            ..Package::new(NameId(0), "", Checksum::NONE)
        }
    }

    /// Lazily create the installed-state record.
    pub fn ensure_ipkg(&mut self) -> &mut InstalledPackage {
        self.ipkg.get_or_insert_with(|| Box::new(InstalledPackage::new()))
    }
}

/// Installed-state of a package; exists only while installed.
#[derive(Debug, Default)]
pub struct InstalledPackage {
    /// Handles into the directory-instance arena, insertion ordered
    pub dirs: Vec<DiriId>,
    pub scripts: Vec<(ScriptKind, Vec<u8>)>,
    /// Registered trigger glob patterns
    pub triggers: Vec<String>,
    /// Matched directory paths pending trigger execution; slot 0 is
    /// reserved for the script name
    pub pending_triggers: Vec<String>,
    pub replaces: Vec<Dependency>,
    pub replaces_priority: u32,
    /// Repository tag this install was pinned to (`s:` field)
    pub repository_tag: Option<String>,
    pub broken_files: bool,
    pub broken_script: bool,
    pub broken_xattr: bool,
    /// File checksums recorded as truncated 160-bit sha256
    pub sha256_160: bool,
    /// Fire every registered trigger regardless of modified directories
    pub run_all_triggers: bool,
}

impl InstalledPackage {
    pub fn new() -> InstalledPackage {
        InstalledPackage::default()
    }

    pub fn set_script(&mut self, kind: ScriptKind, payload: Vec<u8>) {
        match self.scripts.iter_mut().find(|(k, _)| *k == kind) {
            Some((_, existing)) => *existing = payload,
            None => self.scripts.push((kind, payload)),
        }
    }

    pub fn get_script(&self, kind: ScriptKind) -> Option<&[u8]> {
        self.scripts
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, p)| p.as_slice())
    }
}

/// Outcome of consulting the replace policy for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceVerdict {
    /// Neither side declares a relationship; the collision is an error
    /// unless overridden
    Conflict,
    /// The current owner wins; skip the incoming file silently
    KeepOld,
    /// The incoming package takes ownership
    UseNew,
}

/// Per-package inputs to the replace policy.
pub struct ReplaceCtx<'a> {
    /// None for the nameless overlay pseudo-package
    pub name: Option<&'a str>,
    pub version: &'a str,
    pub replaces: &'a [Dependency],
    pub replaces_priority: u32,
}

/// Decide whether `new` may take a file currently owned by `old`.
pub fn replaces_file(old: &ReplaceCtx<'_>, new: &ReplaceCtx<'_>) -> ReplaceVerdict {
    // Overlay files transfer ownership without extraction
    let Some(old_name) = old.name else {
        return ReplaceVerdict::UseNew;
    };
    if new.name == Some(old_name) {
        return ReplaceVerdict::UseNew;
    }

    let prio_against = |ctx: &ReplaceCtx<'_>, other: &ReplaceCtx<'_>| -> i64 {
        let matched = other.name.is_some_and(|name| {
            ctx.replaces
                .iter()
                .any(|dep| dep.matches(name, other.version))
        });
        if matched { ctx.replaces_priority as i64 } else { -1 }
    };
    let old_prio = prio_against(old, new);
    let new_prio = prio_against(new, old);

    if old_prio > new_prio {
        return ReplaceVerdict::KeepOld;
    }
    if new_prio >= 0 {
        return ReplaceVerdict::UseNew;
    }
    ReplaceVerdict::Conflict
}

/// Decide whether `new` takes directory ownership from `owner`.
pub fn replaces_dir(owner: &ReplaceCtx<'_>, new: &ReplaceCtx<'_>) -> bool {
    // The overlay never takes directory ownership, but always yields it
    let Some(new_name) = new.name else {
        return false;
    };
    let Some(owner_name) = owner.name else {
        return true;
    };
    if owner_name == new_name {
        return true;
    }
    if owner.replaces_priority != new.replaces_priority {
        return owner.replaces_priority < new.replaces_priority;
    }
    new_name <= owner_name
}

/// Display ordering for package listings: name, then version order.
pub fn display_cmp(a_name: &str, a_version: &str, b_name: &str, b_version: &str) -> Ordering {
    a_name
        .cmp(b_name)
        .then_with(|| version::compare(a_version, b_version))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(
        name: Option<&'a str>,
        version: &'a str,
        replaces: &'a [Dependency],
        prio: u32,
    ) -> ReplaceCtx<'a> {
        ReplaceCtx {
            name,
            version,
            replaces,
            replaces_priority: prio,
        }
    }

    #[test]
    fn test_dependency_parse_roundtrip() {
        for spec in ["busybox", "!musl-dbg", "openssl>=3.0.1", "nginx@edge>1.2", "a=1"] {
            let dep = Dependency::parse(spec).unwrap();
            assert_eq!(dep.to_string(), spec);
        }
    }

    #[test]
    fn test_dependency_parse_fields() {
        let dep = Dependency::parse("nginx@edge>=1.2.0").unwrap();
        assert_eq!(dep.name, "nginx");
        assert_eq!(dep.tag.as_deref(), Some("edge"));
        assert_eq!(
            dep.constraint,
            Some((">=".to_string(), "1.2.0".to_string()))
        );
        assert!(!dep.conflict);

        assert!(Dependency::parse("").is_err());
        assert!(Dependency::parse("name@").is_err());
        assert!(Dependency::parse("name>=").is_err());
    }

    #[test]
    fn test_dependency_matches() {
        let dep = Dependency::parse("libssl>=3.0.0").unwrap();
        assert!(dep.matches("libssl", "3.1.2"));
        assert!(!dep.matches("libssl", "2.9.0"));
        assert!(!dep.matches("libcrypto", "3.1.2"));
        let any = Dependency::parse("libssl").unwrap();
        assert!(any.matches("libssl", "0.0.1"));
    }

    #[test]
    fn test_replaces_file_same_name_upgrades() {
        let old = ctx(Some("pkg"), "1.0.0", &[], 0);
        let new = ctx(Some("pkg"), "2.0.0", &[], 0);
        assert_eq!(replaces_file(&old, &new), ReplaceVerdict::UseNew);
    }

    #[test]
    fn test_replaces_file_declared_replacement_wins() {
        let reps = vec![Dependency::parse("oldpkg").unwrap()];
        let old = ctx(Some("oldpkg"), "1.0.0", &[], 0);
        let new = ctx(Some("newpkg"), "1.0.0", &reps, 0);
        assert_eq!(replaces_file(&old, &new), ReplaceVerdict::UseNew);
    }

    #[test]
    fn test_replaces_file_unrelated_conflict() {
        let old = ctx(Some("a"), "1.0.0", &[], 0);
        let new = ctx(Some("b"), "1.0.0", &[], 0);
        assert_eq!(replaces_file(&old, &new), ReplaceVerdict::Conflict);
    }

    #[test]
    fn test_replaces_file_priority_keeps_old() {
        let reps_old = vec![Dependency::parse("b").unwrap()];
        let reps_new = vec![Dependency::parse("a").unwrap()];
        let old = ctx(Some("a"), "1.0.0", &reps_old, 5);
        let new = ctx(Some("b"), "1.0.0", &reps_new, 1);
        assert_eq!(replaces_file(&old, &new), ReplaceVerdict::KeepOld);
    }

    #[test]
    fn test_replaces_file_overlay_yields() {
        let old = ctx(None, "", &[], 0);
        let new = ctx(Some("pkg"), "1.0.0", &[], 0);
        assert_eq!(replaces_file(&old, &new), ReplaceVerdict::UseNew);
    }

    #[test]
    fn test_replaces_dir_overlay_never_owns() {
        let owner = ctx(Some("pkg"), "1.0.0", &[], 0);
        let overlay = ctx(None, "", &[], 0);
        assert!(!replaces_dir(&owner, &overlay));
        assert!(replaces_dir(&overlay, &owner));
    }

    #[test]
    fn test_script_suffix_roundtrip() {
        for kind in ScriptKind::ALL {
            assert_eq!(ScriptKind::from_suffix(kind.suffix()), Some(kind));
        }
        assert_eq!(ScriptKind::from_suffix("post-remove"), None);
    }

    #[test]
    fn test_display_cmp() {
        assert_eq!(display_cmp("a", "1.0.0", "b", "1.0.0"), Ordering::Less);
        assert_eq!(display_cmp("a", "1.2.0", "a", "1.10.0"), Ordering::Less);
        assert_eq!(display_cmp("a", "1.0.0", "a", "1.0.0"), Ordering::Equal);
    }
}
