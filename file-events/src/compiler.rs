//! Subscription-to-watch-set compilation.
//!
//! Pure path-pattern resolution: expands a subscription's pattern (literal,
//! leaf wildcard, stem wildcard, recursive descent) into the minimal set of
//! concrete directories to watch. Owns no I/O beyond reading directory
//! listings while resolving; the watch server does the actual monitoring.

use std::collections::BTreeSet;
use std::collections::btree_map::{self, BTreeMap};
use std::path::{MAIN_SEPARATOR, Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::config::Subscription;

/// Recursive-descent marker inside a pattern.
const RECURSE_MARKER: &str = "**";

/// How events under a watched directory are matched back to the pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// The pattern resolved to this exact directory at compile time.
    Exact,
    /// The pattern's final component is a wildcard; matching of the leaf is
    /// deferred to fire time (and is the registry's responsibility).
    LeafPattern,
}

/// Where a watched directory came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchOrigin {
    /// The subscription pattern as configured.
    pub pattern: String,
    /// Config category of the originating subscription.
    pub category: String,
    /// The subtree below the directory is being monitored.
    pub recursive: bool,
    /// Fire-time matching mode.
    pub mode: MatchMode,
}

/// Resolved mapping from canonicalized concrete directory to originating
/// pattern metadata. Deduplicated: a directory reached twice stays a single
/// entry.
#[derive(Debug, Clone, Default)]
pub struct WatchSet {
    entries: BTreeMap<String, WatchOrigin>,
}

impl WatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a directory; returns false if it was already present.
    pub fn insert(&mut self, dir: String, origin: WatchOrigin) -> bool {
        match self.entries.entry(dir) {
            btree_map::Entry::Occupied(_) => false,
            btree_map::Entry::Vacant(slot) => {
                slot.insert(origin);
                true
            }
        }
    }

    pub fn contains(&self, dir: &str) -> bool {
        self.entries.contains_key(dir)
    }

    pub fn dirs(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &WatchOrigin)> {
        self.entries.iter().map(|(dir, origin)| (dir.as_str(), origin))
    }

    pub fn merge(&mut self, other: WatchSet) {
        for (dir, origin) in other.entries {
            self.insert(dir, origin);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Expand one subscription into the concrete directories to watch.
pub fn compile(subscription: &Subscription) -> WatchSet {
    let mut watch_set = WatchSet::new();
    let mut recursive = subscription.recursive;
    let mut working = subscription.pattern.clone();

    // A recursive-descent marker splits the pattern: the prefix becomes the
    // working path and the subscription is marked recursive.
    if let Some(at) = working.find(RECURSE_MARKER) {
        recursive = true;
        working.truncate(at);
    }

    let mut mode = MatchMode::Exact;
    if working.contains('*') {
        // A wildcard confined to the final component drops that component;
        // the parent directory is watched and leaf matching happens at fire
        // time.
        let (parent, leaf) = split_leaf(&working);
        if leaf.contains('*') {
            working = parent;
            mode = MatchMode::LeafPattern;
        }

        if working.contains('*') {
            // A wildcard in an intermediate component resolves right now
            // against filesystem state; every match becomes its own watch.
            for resolved in resolve_stem(&working) {
                register(&mut watch_set, &resolved, subscription, recursive, mode);
            }
            return watch_set;
        }
    }

    register(&mut watch_set, &working, subscription, recursive, mode);
    watch_set
}

fn register(
    watch_set: &mut WatchSet,
    dir: &str,
    subscription: &Subscription,
    recursive: bool,
    mode: MatchMode,
) {
    let origin = WatchOrigin {
        pattern: subscription.pattern.clone(),
        category: subscription.category.clone(),
        recursive,
        mode,
    };

    let mut visited = BTreeSet::new();
    let key = canonical_dir_key(dir, &mut visited);

    if recursive {
        // No native subtree facility is assumed: enumerate subdirectories
        // and watch each one, refusing to re-enter a directory already
        // reached through a symlink cycle.
        expand_subtree(dir, &mut visited, watch_set, &origin);
    }
    watch_set.insert(key, origin);
}

fn expand_subtree(
    root: &str,
    visited: &mut BTreeSet<PathBuf>,
    watch_set: &mut WatchSet,
    origin: &WatchOrigin,
) {
    let root = root.trim_end_matches(MAIN_SEPARATOR);
    if root.is_empty() {
        return;
    }

    let mut walker = WalkDir::new(root).follow_links(true).min_depth(1).into_iter();
    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                debug!(error = %err, "skipping unreadable entry during subtree expansion");
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }

        let Ok(canonical) = dunce::canonicalize(entry.path()) else {
            continue;
        };
        if !visited.insert(canonical.clone()) {
            // Already watching this directory; a symlink led back into the
            // tree. Do not descend again.
            walker.skip_current_dir();
            continue;
        }

        let mut dir = canonical.to_string_lossy().into_owned();
        if !dir.ends_with(MAIN_SEPARATOR) {
            dir.push(MAIN_SEPARATOR);
        }
        watch_set.insert(dir, origin.clone());
    }
}

/// Canonicalize a directory for use as a watch-set key. Existing directories
/// get their canonical path plus a trailing separator; paths that do not
/// resolve keep their literal spelling. The canonical path is recorded in
/// `visited` for cycle refusal during recursive expansion.
fn canonical_dir_key(dir: &str, visited: &mut BTreeSet<PathBuf>) -> String {
    let trimmed = dir.trim_end_matches(['/', '\\']);
    let probe = if trimmed.is_empty() { dir } else { trimmed };

    match dunce::canonicalize(probe) {
        Ok(canonical) if canonical.is_dir() => {
            visited.insert(canonical.clone());
            let mut key = canonical.to_string_lossy().into_owned();
            if !key.ends_with(MAIN_SEPARATOR) {
                key.push(MAIN_SEPARATOR);
            }
            key
        }
        _ => {
            // An existing directory named without a trailing separator still
            // gets one; anything unresolvable is registered literally.
            let mut key = dir.to_string();
            if Path::new(probe).is_dir() && !key.ends_with(['/', '\\']) {
                key.push(MAIN_SEPARATOR);
            }
            key
        }
    }
}

/// Split a pattern into (parent including trailing separator, leaf).
fn split_leaf(pattern: &str) -> (String, String) {
    match pattern.rfind(['/', '\\']) {
        Some(at) => (pattern[..=at].to_string(), pattern[at + 1..].to_string()),
        None => (String::new(), pattern.to_string()),
    }
}

/// Resolve a pattern whose wildcard sits in an intermediate component.
/// Wildcard components are matched against directories that exist right
/// now; literal components after the last wildcard are joined unresolved.
fn resolve_stem(pattern: &str) -> Vec<String> {
    let mut resolved: Vec<PathBuf> = vec![PathBuf::new()];

    for component in Path::new(pattern).components() {
        let text = component.as_os_str().to_string_lossy();
        if text.contains('*') {
            let Ok(matcher) = globset::Glob::new(&text).map(|g| g.compile_matcher()) else {
                debug!(pattern, "unmatchable wildcard component; pattern resolves to nothing");
                return Vec::new();
            };

            let mut next = Vec::new();
            for base in &resolved {
                let Ok(listing) = std::fs::read_dir(base) else {
                    continue;
                };
                for entry in listing.flatten() {
                    let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                    if is_dir && matcher.is_match(entry.file_name()) {
                        next.push(base.join(entry.file_name()));
                    }
                }
            }
            resolved = next;
        } else {
            for base in &mut resolved {
                base.push(component.as_os_str());
            }
        }
        if resolved.is_empty() {
            break;
        }
    }

    resolved
        .into_iter()
        .map(|path| path.to_string_lossy().into_owned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn sub(pattern: &str) -> Subscription {
        Subscription::new(pattern, "test")
    }

    fn key_for(dir: &std::path::Path) -> String {
        format!("{}{}", dir.display(), MAIN_SEPARATOR)
    }

    #[test]
    fn test_leaf_wildcard_watches_parent() {
        let root = TempDir::new().expect("tempdir");
        let pattern = format!("{}/*", root.path().display());

        let watch_set = compile(&sub(&pattern));
        assert_eq!(watch_set.len(), 1);

        let canonical = dunce::canonicalize(root.path()).expect("canonicalize");
        let (dir, origin) = watch_set.iter().next().expect("one entry");
        assert_eq!(dir, key_for(&canonical));
        assert_eq!(origin.mode, MatchMode::LeafPattern);
        assert!(!origin.recursive);
    }

    #[test]
    fn test_recursive_marker_with_flat_tree_yields_single_watch() {
        let root = TempDir::new().expect("tempdir");
        let pattern = format!("{}/**", root.path().display());

        let watch_set = compile(&sub(&pattern));
        assert_eq!(watch_set.len(), 1);

        let (_, origin) = watch_set.iter().next().expect("one entry");
        assert!(origin.recursive);
    }

    #[test]
    fn test_recursive_marker_enumerates_subdirectories() {
        let root = TempDir::new().expect("tempdir");
        std::fs::create_dir(root.path().join("one")).expect("mkdir");
        std::fs::create_dir_all(root.path().join("two/deep")).expect("mkdir");
        std::fs::write(root.path().join("file.txt"), b"x").expect("write");

        let pattern = format!("{}/**", root.path().display());
        let watch_set = compile(&sub(&pattern));

        // Root plus one, two, two/deep; the plain file adds nothing.
        assert_eq!(watch_set.len(), 4);
        let canonical = dunce::canonicalize(root.path().join("two/deep")).expect("canonicalize");
        assert!(watch_set.contains(&key_for(&canonical)));
    }

    #[test]
    fn test_stem_wildcard_expands_per_existing_directory() {
        let root = TempDir::new().expect("tempdir");
        std::fs::create_dir(root.path().join("alpha")).expect("mkdir");
        std::fs::create_dir(root.path().join("beta")).expect("mkdir");
        std::fs::write(root.path().join("not-a-dir"), b"x").expect("write");

        let pattern = format!("{}/*/leaf", root.path().display());
        let watch_set = compile(&sub(&pattern));

        let dirs: Vec<&str> = watch_set.dirs().collect();
        assert_eq!(dirs.len(), 2);
        assert!(dirs[0].ends_with("alpha/leaf") || dirs[0].ends_with("alpha\\leaf"));
        assert!(dirs[1].ends_with("beta/leaf") || dirs[1].ends_with("beta\\leaf"));
        for (_, origin) in watch_set.iter() {
            assert_eq!(origin.mode, MatchMode::Exact);
        }
    }

    #[test]
    fn test_existing_directory_gains_trailing_separator() {
        let root = TempDir::new().expect("tempdir");
        let pattern = root.path().display().to_string();
        assert!(!pattern.ends_with(MAIN_SEPARATOR));

        let watch_set = compile(&sub(&pattern));
        let dir = watch_set.dirs().next().expect("one entry");
        assert!(dir.ends_with(MAIN_SEPARATOR));
    }

    #[test]
    fn test_missing_path_registers_literally() {
        let watch_set = compile(&sub("/no/such/dir/anywhere"));
        assert_eq!(
            watch_set.dirs().collect::<Vec<_>>(),
            vec!["/no/such/dir/anywhere"]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_cycle_is_not_reentered() {
        let root = TempDir::new().expect("tempdir");
        std::fs::create_dir(root.path().join("inner")).expect("mkdir");
        std::os::unix::fs::symlink(root.path(), root.path().join("inner/back"))
            .expect("symlink");

        let pattern = format!("{}/**", root.path().display());
        let watch_set = compile(&sub(&pattern));

        // Root and inner, once each; the symlink back up is refused.
        let canonical_root = dunce::canonicalize(root.path()).expect("canonicalize");
        let count = watch_set
            .dirs()
            .filter(|dir| dir.starts_with(&*canonical_root.to_string_lossy()))
            .count();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_merge_deduplicates_across_subscriptions() {
        let root = TempDir::new().expect("tempdir");
        let literal = root.path().display().to_string();
        let leaf = format!("{literal}/*");

        let mut merged = compile(&sub(&literal));
        merged.merge(compile(&sub(&leaf)));
        assert_eq!(merged.len(), 1);
    }
}
