//! Ownership of the configured redirects and the compiled lookup state.
//!
//! Configuration happens on one thread at startup; queries come from every
//! application thread afterwards. The manager therefore keeps two worlds:
//! a mutable build-mode trie behind a mutex, and a compiled [`LookupTree`]
//! published behind a read-write slot once [`RedirectionManager::optimise`]
//! runs. Publication swaps an `Arc`, so in-flight readers keep the tree
//! they started with and a rebuild never stalls a query.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::path::{self, PathBuffer};
use crate::pool::StringPool;
use crate::redirection::{FileRedirection, FolderRedirection, Target};
use crate::tree::lookup::LookupTree;
use crate::tree::RedirectionTree;

/// Callback fired with the requested and the redirected path.
pub type RedirectingCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Callback fired with every intercepted path.
pub type LoadingCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// The configuration-side state, touched only under the mutex.
struct Config {
    files: Vec<FileRedirection>,
    folders: Vec<FolderRedirection>,
    pool: StringPool,
    /// The build-mode trie; empty once compiled away.
    tree: RedirectionTree,
}

impl Config {
    /// Rebuilds the trie from the registered lists.
    ///
    /// Folder overlays apply first in registration order (later overlays
    /// win), then every file redirect re-applies so individual files
    /// always beat overlays.
    fn rebuild(&mut self) {
        let mut tree = RedirectionTree::new();
        for folder in &self.folders {
            tree.add_folder_overlay(folder);
        }
        for file in &self.files {
            tree.add_file(&file.source, &file.target, false, &mut self.pool);
        }
        self.tree = tree;
    }
}

/// The set of active redirects and the structures answering queries.
pub struct RedirectionManager {
    config: Mutex<Config>,
    /// The published compiled tree; `Some` switches the engine to query
    /// mode.
    lookup: RwLock<Option<Arc<LookupTree>>>,
    enabled: AtomicBool,
    redirecting: RwLock<Arc<Vec<RedirectingCallback>>>,
    loading: RwLock<Arc<Vec<LoadingCallback>>>,
}

impl Default for RedirectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RedirectionManager {
    /// Creates an enabled manager with no redirects.
    pub fn new() -> Self {
        Self {
            config: Mutex::new(Config {
                files: Vec::new(),
                folders: Vec::new(),
                pool: StringPool::new(),
                tree: RedirectionTree::new(),
            }),
            lookup: RwLock::new(None),
            enabled: AtomicBool::new(true),
            redirecting: RwLock::new(Arc::new(Vec::new())),
            loading: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Registers a single-file redirect.
    pub fn add_redirect(&self, old_path: &str, new_path: &str) {
        let redirect = FileRedirection::new(old_path, new_path);

        let mut config = self.config.lock();
        if self.in_query_mode() {
            config.files.push(redirect);
            config.rebuild();
            self.publish(&config);
        } else {
            let config = &mut *config;
            config
                .tree
                .add_file(&redirect.source, &redirect.target, false, &mut config.pool);
            config.files.push(redirect);
        }
    }

    /// Removes the file redirect for `old_path`, if registered.
    pub fn remove_redirect(&self, old_path: &str) {
        let source = path::normalize(old_path);

        let mut config = self.config.lock();
        config.files.retain(|file| file.source != source);
        config.rebuild();
        if self.in_query_mode() {
            self.publish(&config);
        }
    }

    /// Scans `target_folder` and overlays it onto `source_folder`.
    ///
    /// Folder overlays take effect through a full rebuild; the incremental
    /// build-mode path would have to re-order every file redirect anyway.
    pub fn add_redirect_folder(&self, source_folder: &str, target_folder: &str) -> io::Result<()> {
        let mut config = self.config.lock();

        let overlay =
            FolderRedirection::from_disk(source_folder, target_folder, &mut config.pool)?;
        info!(
            source = %overlay.source_folder,
            target = %overlay.target_folder,
            subfolders = overlay.subfolder_files.len(),
            "registered folder overlay"
        );

        config.folders.push(overlay);
        config.rebuild();
        if self.in_query_mode() {
            self.publish(&config);
        }

        Ok(())
    }

    /// Removes every overlay registered for `source_folder`.
    pub fn remove_redirect_folder(&self, source_folder: &str) {
        let source = path::normalize(source_folder);

        let mut config = self.config.lock();
        config.folders.retain(|folder| folder.source_folder != source);
        config.rebuild();
        if self.in_query_mode() {
            self.publish(&config);
        }
    }

    /// Compiles the current configuration and switches to query mode.
    pub fn optimise(&self) {
        let mut config = self.config.lock();
        // Rebuild from the lists; a repeated optimise must see the full
        // configuration, not the trie a previous optimise discarded.
        config.rebuild();
        self.publish(&config);
        config.tree = RedirectionTree::new();
    }

    /// Compiles the trie and swaps it into the published slot.
    fn publish(&self, config: &Config) {
        let lookup = LookupTree::build(&config.tree);
        info!(
            prefix = %lookup.prefix(),
            files = config.files.len(),
            folders = config.folders.len(),
            "published lookup tree"
        );
        *self.lookup.write() = Some(Arc::new(lookup));
    }

    fn in_query_mode(&self) -> bool {
        self.lookup.read().is_some()
    }

    /// Re-enables redirection.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    /// Disables redirection; every query misses until re-enabled.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    /// Whether redirection is currently active.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Registers a callback fired on every successful redirect.
    pub fn on_redirecting(&self, callback: RedirectingCallback) {
        let mut slot = self.redirecting.write();
        let mut callbacks = (**slot).clone();
        callbacks.push(callback);
        *slot = Arc::new(callbacks);
    }

    /// Registers a callback fired on every intercepted path.
    pub fn on_loading(&self, callback: LoadingCallback) {
        let mut slot = self.loading.write();
        let mut callbacks = (**slot).clone();
        callbacks.push(callback);
        *slot = Arc::new(callbacks);
    }

    /// Fires the loading callbacks outside of any lock.
    fn fire_loading(&self, requested: &str) {
        let callbacks = Arc::clone(&self.loading.read());
        for callback in callbacks.iter() {
            callback(requested);
        }
    }

    /// Fires the redirecting callbacks outside of any lock.
    fn fire_redirecting(&self, requested: &str, redirected: &str) {
        let callbacks = Arc::clone(&self.redirecting.read());
        for callback in callbacks.iter() {
            callback(requested, redirected);
        }
    }

    /// Resolves an intercepted file path.
    ///
    /// Accepts the path as the syscall saw it (any case, optionally with
    /// the NT prefix); returns the redirected path with the prefix
    /// re-applied when the input carried it.
    pub fn resolve_file(&self, requested: &str) -> Option<String> {
        firestorm::profile_method!(resolve_file);

        self.fire_loading(requested);

        if !self.is_enabled() {
            return None;
        }

        let (stripped, had_prefix) = path::strip_nt_prefix(requested);
        let folded = PathBuffer::uppercase(stripped);

        let target = self.query_file(folded.as_str())?;

        let redirected = if had_prefix {
            format!("{}{}", path::NT_PREFIX, target.full_path())
        } else {
            target.full_path()
        };

        debug!(from = %requested, to = %redirected, "redirecting");
        self.fire_redirecting(requested, &redirected);

        Some(redirected)
    }

    /// Queries whichever structure is current for a canonical path.
    fn query_file(&self, folded: &str) -> Option<Target> {
        if let Some(lookup) = self.lookup.read().as_ref().map(Arc::clone) {
            return lookup.try_get_file(folded).cloned();
        }

        self.config.lock().tree.try_get_file(folded).cloned()
    }

    /// Returns the overlay entries for an intercepted directory path, as
    /// `(uppercase name, target)` pairs.
    ///
    /// This is the per-handle snapshot the enumeration merger injects
    /// from; `None` means the directory has no overlay.
    pub fn overlay_entries(&self, requested: &str) -> Option<Vec<(String, Target)>> {
        if !self.is_enabled() {
            return None;
        }

        let (stripped, _) = path::strip_nt_prefix(requested);
        let folded = PathBuffer::uppercase(stripped);

        if let Some(lookup) = self.lookup.read().as_ref().map(Arc::clone) {
            return lookup.try_get_folder(folded.as_str()).map(clone_entries);
        }

        self.config
            .lock()
            .tree
            .try_get_folder(folded.as_str())
            .map(clone_entries)
    }
}

fn clone_entries(files: &crate::strmap::StrMap<Target>) -> Vec<(String, Target)> {
    files
        .iter()
        .map(|(name, target)| (name.to_string(), target.clone()))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::scanner::{DirectoryGroup, ScannedEntry};

    use std::sync::atomic::AtomicUsize;

    fn overlay_groups() -> Vec<DirectoryGroup> {
        vec![
            DirectoryGroup {
                relative_key: String::new(),
                entries: vec![ScannedEntry {
                    name: "A.BIN".to_string(),
                    is_directory: false,
                }],
            },
            DirectoryGroup {
                relative_key: "SUB".to_string(),
                entries: vec![ScannedEntry {
                    name: "B.BIN".to_string(),
                    is_directory: false,
                }],
            },
        ]
    }

    /// Registers a prescanned overlay, bypassing the disk.
    fn add_overlay(manager: &RedirectionManager, source: &str, target: &str) {
        let mut config = manager.config.lock();
        let overlay =
            FolderRedirection::from_groups(source, target, overlay_groups(), &mut config.pool);
        config.folders.push(overlay);
        config.rebuild();
        if manager.in_query_mode() {
            manager.publish(&config);
        }
    }

    #[test]
    fn empty_manager_misses() {
        let manager = RedirectionManager::new();
        assert_eq!(manager.resolve_file("\\??\\C:\\GAME\\DATA\\A.BIN"), None);
    }

    #[test]
    fn single_file_redirect_resolves_after_optimise() {
        let manager = RedirectionManager::new();
        manager.add_redirect("C:\\game\\data\\a.bin", "C:\\mod\\a.bin");
        manager.optimise();

        assert_eq!(
            manager.resolve_file("C:\\GAME\\DATA\\A.BIN"),
            Some("C:\\MOD\\A.BIN".to_string())
        );
    }

    #[test]
    fn build_mode_answers_before_optimise() {
        let manager = RedirectionManager::new();
        manager.add_redirect("C:\\game\\data\\a.bin", "C:\\mod\\a.bin");

        assert_eq!(
            manager.resolve_file("C:\\GAME\\DATA\\A.BIN"),
            Some("C:\\MOD\\A.BIN".to_string())
        );
    }

    #[test]
    fn nt_prefix_is_reapplied_on_the_way_out() {
        let manager = RedirectionManager::new();
        manager.add_redirect("C:\\game\\a.bin", "C:\\mod\\a.bin");
        manager.optimise();

        assert_eq!(
            manager.resolve_file("\\??\\C:\\Game\\A.bin"),
            Some("\\??\\C:\\MOD\\A.BIN".to_string())
        );
        assert_eq!(
            manager.resolve_file("C:\\Game\\A.bin"),
            Some("C:\\MOD\\A.BIN".to_string())
        );
    }

    #[test]
    fn file_redirect_beats_folder_overlay() {
        let manager = RedirectionManager::new();
        add_overlay(&manager, "C:\\game\\data", "C:\\mod");
        manager.add_redirect("C:\\game\\data\\a.bin", "C:\\other\\a.bin");
        manager.optimise();

        assert_eq!(
            manager.resolve_file("C:\\GAME\\DATA\\A.BIN"),
            Some("C:\\OTHER\\A.BIN".to_string())
        );
        // The rest of the overlay still applies.
        assert_eq!(
            manager.resolve_file("C:\\GAME\\DATA\\SUB\\B.BIN"),
            Some("C:\\MOD\\SUB\\B.BIN".to_string())
        );
    }

    // A removal followed by the same adds must answer like a manager built
    // from the final set directly.
    #[test]
    fn rebuild_after_removal_matches_a_fresh_build() {
        let rebuilt = RedirectionManager::new();
        add_overlay(&rebuilt, "C:\\game\\data", "C:\\mod");
        rebuilt.add_redirect("C:\\game\\data\\a.bin", "C:\\other\\a.bin");
        rebuilt.remove_redirect("C:\\game\\data\\a.bin");
        rebuilt.add_redirect("C:\\game\\data\\a.bin", "C:\\other\\a.bin");
        rebuilt.optimise();

        let fresh = RedirectionManager::new();
        add_overlay(&fresh, "C:\\game\\data", "C:\\mod");
        fresh.add_redirect("C:\\game\\data\\a.bin", "C:\\other\\a.bin");
        fresh.optimise();

        for probe in [
            "C:\\GAME\\DATA\\A.BIN",
            "C:\\GAME\\DATA\\SUB\\B.BIN",
            "C:\\GAME\\DATA\\C.BIN",
        ] {
            assert_eq!(rebuilt.resolve_file(probe), fresh.resolve_file(probe));
        }
    }

    #[test]
    fn optimise_can_run_again_without_losing_redirects() {
        let manager = RedirectionManager::new();
        manager.add_redirect("C:\\game\\a.bin", "C:\\mod\\a.bin");
        manager.optimise();
        manager.optimise();

        assert_eq!(
            manager.resolve_file("C:\\GAME\\A.BIN"),
            Some("C:\\MOD\\A.BIN".to_string())
        );
    }

    #[test]
    fn disable_suppresses_resolution() {
        let manager = RedirectionManager::new();
        manager.add_redirect("C:\\game\\a.bin", "C:\\mod\\a.bin");
        manager.optimise();

        manager.disable();
        assert_eq!(manager.resolve_file("C:\\GAME\\A.BIN"), None);

        manager.enable();
        assert!(manager.resolve_file("C:\\GAME\\A.BIN").is_some());
    }

    #[test]
    fn callbacks_fire_on_load_and_redirect() {
        let manager = RedirectionManager::new();
        manager.add_redirect("C:\\game\\a.bin", "C:\\mod\\a.bin");
        manager.optimise();

        let loads = Arc::new(AtomicUsize::new(0));
        let redirects = Arc::new(AtomicUsize::new(0));
        {
            let loads = Arc::clone(&loads);
            manager.on_loading(Arc::new(move |_| {
                loads.fetch_add(1, Ordering::SeqCst);
            }));
        }
        {
            let redirects = Arc::clone(&redirects);
            manager.on_redirecting(Arc::new(move |_, redirected| {
                assert_eq!(redirected, "C:\\MOD\\A.BIN");
                redirects.fetch_add(1, Ordering::SeqCst);
            }));
        }

        manager.resolve_file("C:\\GAME\\A.BIN");
        manager.resolve_file("C:\\GAME\\MISS.BIN");

        assert_eq!(loads.load(Ordering::SeqCst), 2);
        assert_eq!(redirects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removing_a_folder_drops_its_overlay() {
        let manager = RedirectionManager::new();
        add_overlay(&manager, "C:\\game\\data", "C:\\mod");
        manager.optimise();
        assert!(manager.resolve_file("C:\\GAME\\DATA\\A.BIN").is_some());

        manager.remove_redirect_folder("C:\\game\\data");
        assert_eq!(manager.resolve_file("C:\\GAME\\DATA\\A.BIN"), None);
    }

    #[test]
    fn overlay_entries_snapshot_the_folder() {
        let manager = RedirectionManager::new();
        add_overlay(&manager, "C:\\game\\data", "C:\\mod");
        manager.optimise();

        let entries = manager.overlay_entries("\\??\\C:\\GAME\\DATA").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "A.BIN");

        assert!(manager.overlay_entries("C:\\GAME\\ELSEWHERE").is_none());
    }
}
