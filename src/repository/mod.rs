// src/repository/mod.rs

//! Repository and pinning-tag resolver
//!
//! Tracks the configured repository slots (bounded, slot 0 reserved for
//! the synthetic cache repository), the `@tag` pinning table, and the
//! availability state of each remote index. Fetching is delegated to a
//! [`Fetch`] collaborator; running without one behaves like a machine
//! with no network.

use crate::checksum::Checksum;
use crate::error::{Error, Result};
use crate::package::Dependency;
use chrono::{DateTime, Duration, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

/// Bounded repository slots; bit positions in the membership bitmask
pub const MAX_REPOS: usize = 32;

/// Bounded pinning tags; tag 0 is the untagged default
pub const MAX_TAGS: usize = 16;

/// Bit of the synthetic cache repository
pub const CACHE_REPO_BIT: u32 = 1;

/// Index file name inside a local repository directory
const INDEX_NAME: &str = "APKINDEX";

/// Network transport, supplied by the caller.
pub trait Fetch {
    fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// One configured repository slot.
#[derive(Debug)]
pub struct Repository {
    pub url: String,
    pub description: Option<String>,
    /// Checksum of the URL, used for the cache item name
    pub csum: Checksum,
    pub local: bool,
    /// Index could be loaded (from origin or cache)
    pub available: bool,
    /// Serving a cached copy after a failed refresh
    pub stale: bool,
}

/// One pinning tag and the repositories it allows.
#[derive(Debug)]
pub struct RepoTag {
    pub tag: String,
    pub allowed_repos: u32,
}

/// The repository table of one database instance.
pub struct RepoSet {
    repos: Vec<Repository>,
    tags: Vec<RepoTag>,
    pub local_repos: u32,
    pub available_repos: u32,
}

fn url_is_remote(url: &str) -> bool {
    ["http://", "https://", "ftp://"]
        .iter()
        .any(|scheme| url.starts_with(scheme))
}

impl RepoSet {
    pub fn new() -> RepoSet {
        RepoSet {
            repos: vec![Repository {
                url: "cache".to_string(),
                description: None,
                csum: Checksum::NONE,
                local: true,
                available: true,
                stale: false,
            }],
            tags: vec![RepoTag {
                tag: String::new(),
                allowed_repos: CACHE_REPO_BIT,
            }],
            local_repos: CACHE_REPO_BIT,
            available_repos: CACHE_REPO_BIT,
        }
    }

    pub fn repo(&self, slot: usize) -> Option<&Repository> {
        self.repos.get(slot)
    }

    pub fn num_repos(&self) -> usize {
        self.repos.len()
    }

    /// Resolve a tag name to its table index, creating it if needed.
    /// The empty tag is the untagged default at index 0.
    pub fn get_tag_id(&mut self, tag: &str) -> Result<usize> {
        if let Some(id) = self.tags.iter().position(|t| t.tag == tag) {
            return Ok(id);
        }
        if self.tags.len() >= MAX_TAGS {
            return Err(Error::TagLimit(MAX_TAGS));
        }
        self.tags.push(RepoTag {
            tag: tag.to_string(),
            allowed_repos: 0,
        });
        Ok(self.tags.len() - 1)
    }

    /// Add one repository configuration line. Comments and blank lines
    /// are skipped; a `@tag ` prefix pins the repository to that tag;
    /// duplicate URLs are merged into the existing slot.
    pub fn add_repository(&mut self, line: &str) -> Result<()> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(());
        }
        let (tag_id, url) = match line.strip_prefix('@') {
            Some(rest) => {
                let (tag, url) = rest
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| Error::BadDependency(line.to_string()))?;
                (self.get_tag_id(tag)?, url.trim())
            }
            None => (0, line),
        };

        let slot = match self.repos.iter().position(|r| r.url == url) {
            Some(slot) => slot,
            None => {
                if self.repos.len() >= MAX_REPOS {
                    return Err(Error::RepositoryLimit(MAX_REPOS));
                }
                let local = !url_is_remote(url);
                self.repos.push(Repository {
                    url: url.to_string(),
                    description: None,
                    csum: Checksum::digest(url.as_bytes()),
                    local,
                    available: false,
                    stale: false,
                });
                let slot = self.repos.len() - 1;
                if local {
                    self.local_repos |= 1 << slot;
                }
                debug!(url, slot, "added repository");
                slot
            }
        };
        self.tags[tag_id].allowed_repos |= 1 << slot;
        // Tagged repositories are also visible to the untagged default
        if tag_id != 0 {
            self.tags[0].allowed_repos |= 1 << slot;
        }
        Ok(())
    }

    /// Expand a tag bitmask into the union of allowed repository bits.
    pub fn get_pinning_mask_repos(&self, tag_mask: u32) -> u32 {
        let mut repos = 0;
        for (i, tag) in self.tags.iter().enumerate() {
            if tag_mask & (1 << i) != 0 {
                repos |= tag.allowed_repos;
            }
        }
        repos
    }

    /// Pick the repository to serve a package from: a local repository
    /// first, then the lowest available configured slot, then the cache.
    pub fn select_repo(&self, pkg_repos: u32) -> Option<usize> {
        let candidates = pkg_repos & self.available_repos;
        let local = candidates & self.local_repos & !CACHE_REPO_BIT;
        if local != 0 {
            return Some(local.trailing_zeros() as usize);
        }
        let configured = candidates & !CACHE_REPO_BIT;
        if configured != 0 {
            return Some(configured.trailing_zeros() as usize);
        }
        if pkg_repos & CACHE_REPO_BIT != 0 {
            return Some(0);
        }
        None
    }

    /// Warn about world dependencies pinned to tags that allow no
    /// repository. Returns the number of such dependencies.
    pub fn check_world(&self, world: &[Dependency]) -> usize {
        let mut bad = 0;
        for dep in world {
            let Some(tag) = &dep.tag else { continue };
            let allowed = self
                .tags
                .iter()
                .find(|t| &t.tag == tag)
                .map(|t| t.allowed_repos & !CACHE_REPO_BIT)
                .unwrap_or(0);
            if allowed == 0 {
                warn!("dependency {dep} is pinned to tag @{tag} with no repositories");
                bad += 1;
            }
        }
        bad
    }

    /// Load the index bytes of one repository slot. Local repositories
    /// read their index file directly. Remote ones go through the cache
    /// when one is configured: a cached copy younger than `cache_max_age`
    /// is used as-is, otherwise a refresh is attempted and a failed
    /// refresh falls back to the stale cached copy with a warning.
    pub fn load_index(
        &mut self,
        slot: usize,
        fetcher: Option<&dyn Fetch>,
        cache_dir: Option<&Path>,
        cache_max_age: Duration,
    ) -> Result<Vec<u8>> {
        let repo = &self.repos[slot];
        if repo.local {
            let path = Path::new(&repo.url).join(INDEX_NAME);
            let bytes = fs::read(&path).map_err(|e| {
                warn!("repository {} index unreadable: {}", repo.url, e);
                Error::Fetch {
                    url: repo.url.clone(),
                    reason: e.to_string(),
                }
            })?;
            self.mark_available(slot, false);
            return Ok(bytes);
        }

        let url = format!("{}/{}", repo.url.trim_end_matches('/'), INDEX_NAME);
        let Some(cache_dir) = cache_dir else {
            // No cache: direct fetch or nothing
            let bytes = self.direct_fetch(slot, fetcher, &url)?;
            self.mark_available(slot, false);
            return Ok(bytes);
        };

        let cache_path = cache_dir.join(index_cache_name(&self.repos[slot].csum));
        let fresh = cache_age(&cache_path).is_some_and(|age| age < cache_max_age);
        if !fresh {
            match self.direct_fetch(slot, fetcher, &url) {
                Ok(bytes) => {
                    fs::create_dir_all(cache_dir)?;
                    fs::write(&cache_path, &bytes)?;
                }
                Err(e) if cache_path.exists() => {
                    warn!("repository {} refresh failed, using stale index: {}", url, e);
                    self.repos[slot].stale = true;
                }
                Err(e) => {
                    error!("repository {} index unavailable: {}", url, e);
                    return Err(e);
                }
            }
        }
        let bytes = fs::read(&cache_path)?;
        self.mark_available(slot, true);
        Ok(bytes)
    }

    fn direct_fetch(
        &self,
        slot: usize,
        fetcher: Option<&dyn Fetch>,
        url: &str,
    ) -> Result<Vec<u8>> {
        let Some(fetcher) = fetcher else {
            return Err(Error::Fetch {
                url: self.repos[slot].url.clone(),
                reason: "no network".to_string(),
            });
        };
        fetcher.fetch(url)
    }

    fn mark_available(&mut self, slot: usize, _from_cache: bool) {
        self.repos[slot].available = true;
        self.available_repos |= 1 << slot;
    }
}

impl Default for RepoSet {
    fn default() -> RepoSet {
        RepoSet::new()
    }
}

fn cache_age(path: &Path) -> Option<Duration> {
    let mtime: DateTime<Utc> = fs::metadata(path).ok()?.modified().ok()?.into();
    Some(Utc::now() - mtime)
}

/// Cache item name of a repository index.
pub fn index_cache_name(url_csum: &Checksum) -> String {
    format!("APKINDEX.{}.tar.gz", url_csum.cache_hex())
}

/// Cache item name of a package archive.
pub fn pkg_cache_name(name: &str, version: &str, csum: &Checksum) -> String {
    format!("{name}-{version}.{}.apk", csum.cache_hex())
}

/// Cache item path relative to the root.
pub fn cache_subpath(name: &str) -> PathBuf {
    Path::new("var/cache/pkgdb").join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_repository_dedup_and_tags() {
        let mut set = RepoSet::new();
        set.add_repository("http://mirror/main").unwrap();
        set.add_repository("@edge http://mirror/edge").unwrap();
        set.add_repository("http://mirror/main").unwrap();
        set.add_repository("# comment").unwrap();
        set.add_repository("").unwrap();
        assert_eq!(set.num_repos(), 3);

        let edge = set.get_tag_id("edge").unwrap();
        assert_eq!(set.tags[edge].allowed_repos, 1 << 2);
        // Untagged default sees both configured repositories
        assert_eq!(
            set.tags[0].allowed_repos & !CACHE_REPO_BIT,
            (1 << 1) | (1 << 2)
        );
    }

    #[test]
    fn test_repository_limit() {
        let mut set = RepoSet::new();
        for i in 0..MAX_REPOS - 1 {
            set.add_repository(&format!("http://mirror/{i}")).unwrap();
        }
        let err = set.add_repository("http://one-too-many").unwrap_err();
        assert!(matches!(err, Error::RepositoryLimit(_)));
    }

    #[test]
    fn test_select_repo_prefers_local() {
        let mut set = RepoSet::new();
        set.add_repository("http://mirror/main").unwrap();
        set.add_repository("/media/usb/repo").unwrap();
        set.available_repos |= (1 << 1) | (1 << 2);

        // Slot 2 is the local one
        assert_eq!(set.select_repo((1 << 1) | (1 << 2)), Some(2));
        assert_eq!(set.select_repo(1 << 1), Some(1));
        // Unavailable configured repo with a cached copy falls back to cache
        assert_eq!(set.select_repo(CACHE_REPO_BIT), Some(0));
        assert_eq!(set.select_repo(0), None);
    }

    #[test]
    fn test_pinning_mask_expansion() {
        let mut set = RepoSet::new();
        set.add_repository("http://mirror/main").unwrap();
        set.add_repository("@edge http://mirror/edge").unwrap();
        let edge = set.get_tag_id("edge").unwrap();
        assert_eq!(set.get_pinning_mask_repos(1 << edge), 1 << 2);
        assert_eq!(
            set.get_pinning_mask_repos(1) & !CACHE_REPO_BIT,
            (1 << 1) | (1 << 2)
        );
    }

    #[test]
    fn test_check_world_flags_orphan_tags() {
        let mut set = RepoSet::new();
        set.add_repository("@edge http://mirror/edge").unwrap();
        let world = vec![
            Dependency::parse("busybox").unwrap(),
            Dependency::parse("nginx@edge").unwrap(),
            Dependency::parse("vim@testing").unwrap(),
        ];
        assert_eq!(set.check_world(&world), 1);
    }

    #[test]
    fn test_local_index_load() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("APKINDEX"), b"P:pkg\n").unwrap();
        let mut set = RepoSet::new();
        set.add_repository(tmp.path().to_str().unwrap()).unwrap();
        let bytes = set.load_index(1, None, None, Duration::hours(4)).unwrap();
        assert_eq!(bytes, b"P:pkg\n");
        assert!(set.repo(1).unwrap().available);
    }

    struct StaticFetch(Option<Vec<u8>>);
    impl Fetch for StaticFetch {
        fn fetch(&self, url: &str) -> Result<Vec<u8>> {
            self.0.clone().ok_or_else(|| Error::Fetch {
                url: url.to_string(),
                reason: "unreachable".to_string(),
            })
        }
    }

    #[test]
    fn test_remote_index_cached_then_stale() {
        let cache = tempfile::TempDir::new().unwrap();
        let mut set = RepoSet::new();
        set.add_repository("http://mirror/main").unwrap();

        let fetch = StaticFetch(Some(b"P:pkg\n".to_vec()));
        let bytes = set
            .load_index(1, Some(&fetch), Some(cache.path()), Duration::hours(4))
            .unwrap();
        assert_eq!(bytes, b"P:pkg\n");

        // Fresh cache is served without refetching
        let dead = StaticFetch(None);
        let bytes = set
            .load_index(1, Some(&dead), Some(cache.path()), Duration::hours(4))
            .unwrap();
        assert_eq!(bytes, b"P:pkg\n");
        assert!(!set.repo(1).unwrap().stale);

        // Expired cache with a dead mirror goes stale, not unavailable
        let bytes = set
            .load_index(1, Some(&dead), Some(cache.path()), Duration::zero())
            .unwrap();
        assert_eq!(bytes, b"P:pkg\n");
        assert!(set.repo(1).unwrap().stale);
    }

    #[test]
    fn test_remote_index_unavailable_without_cache() {
        let mut set = RepoSet::new();
        set.add_repository("http://mirror/main").unwrap();
        let err = set
            .load_index(1, None, None, Duration::hours(4))
            .unwrap_err();
        assert!(matches!(err, Error::Fetch { .. }));
        assert!(!set.repo(1).unwrap().available);
    }
}
