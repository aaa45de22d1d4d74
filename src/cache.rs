//! # Working Tree Cache
//!
//! `GitClientCache` wraps a `ClientFactory` and keeps one working tree per
//! repository alive for the lifetime of the process, so that repeated config
//! lookups for the same repository do not clone it again.
//!
//! ## Locking
//!
//! Two independent locks are involved:
//!
//! - The **map lock** (`RwLock`) guards the `RepoId -> entry` map. It is held
//!   only for lookup, insert and remove, never while git runs.
//! - Each entry carries an **exclusivity lock**. `acquire` returns with it
//!   held and the caller gives it back with `WorkingTree::release` (or
//!   `RepoClient::clean`). Between the two calls the caller is the only party
//!   that may touch the tree, across as many git operations as it needs.
//!
//! Acquisitions of different repositories never wait on each other.
//! Acquisitions of the same repository are serialized on the entry lock.
//! A miss inserts a placeholder whose lock is already held before the map
//! lock is dropped, so concurrent misses for one repository clone it once.
//!
//! ## Repair
//!
//! A reused tree that is dirty is hard reset. If the reset fails the entry is
//! evicted, the tree is removed from disk on a best-effort basis, and the
//! acquisition falls back to a fresh clone. Entries are never evicted for any
//! other reason.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError, RwLock};

use log::{debug, error, warn};

use crate::error::{Error, Result};
use crate::git::{ClientFactory, MergeStrategy, RepoClient, RepoOpts};
use crate::loader;
use crate::repo_id::RepoId;

/// Extra fetch refspec so that pull request heads are available locally.
pub const PULL_HEADS_REFSPEC: &str = "+refs/pull/*/head:refs/remotes/origin/pr/*";

#[derive(Debug, Default)]
struct EntryState {
    held: bool,
    evicted: bool,
}

/// One cached working tree and its exclusivity lock.
struct CacheEntry {
    client: OnceLock<Arc<dyn RepoClient>>,
    state: Mutex<EntryState>,
    available: Condvar,
}

impl CacheEntry {
    /// A placeholder whose lock is held by the creating thread.
    fn held() -> Self {
        Self {
            client: OnceLock::new(),
            state: Mutex::new(EntryState {
                held: true,
                evicted: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Blocks until the entry is free, then takes it. Returns `false` without
    /// taking it if the entry was evicted in the meantime.
    fn lock(&self) -> Result<bool> {
        let poisoned = |_| Error::LockPoisoned {
            context: "working tree lock".to_string(),
        };
        let mut state = self.state.lock().map_err(poisoned)?;
        while state.held && !state.evicted {
            state = self.available.wait(state).map_err(poisoned)?;
        }
        if state.evicted {
            return Ok(false);
        }
        state.held = true;
        Ok(true)
    }

    fn unlock(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.held = false;
        self.available.notify_one();
    }

    /// Marks the entry dead and wakes every waiter so they can start over.
    fn retire(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.evicted = true;
        state.held = false;
        self.available.notify_all();
    }
}

/// Exclusive, temporary use of a cached working tree.
///
/// Implements `RepoClient` by delegating to the underlying client, except
/// that `clean` gives the tree back to the cache instead of deleting it.
/// Callers must release the handle on every exit path. A handle dropped
/// without being released is released with a warning.
pub struct WorkingTree {
    id: RepoId,
    entry: Arc<CacheEntry>,
    client: Arc<dyn RepoClient>,
    released: AtomicBool,
}

impl WorkingTree {
    fn new(id: RepoId, entry: Arc<CacheEntry>, client: Arc<dyn RepoClient>) -> Self {
        Self {
            id,
            entry,
            client,
            released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &RepoId {
        &self.id
    }

    /// Gives the working tree back to the cache. The tree stays on disk.
    pub fn release(self) {
        self.release_lock();
    }

    fn release_lock(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.entry.unlock();
        }
    }
}

impl Drop for WorkingTree {
    fn drop(&mut self) {
        if !self.released.load(Ordering::SeqCst) {
            warn!("Working tree for {} dropped without release", self.id);
            self.release_lock();
        }
    }
}

impl RepoClient for WorkingTree {
    fn directory(&self) -> &Path {
        self.client.directory()
    }

    fn config(&self, args: &[&str]) -> Result<()> {
        self.client.config(args)
    }

    fn is_dirty(&self) -> Result<bool> {
        self.client.is_dirty()
    }

    fn reset_hard(&self, rev: &str) -> Result<()> {
        self.client.reset_hard(rev)
    }

    fn fetch(&self, args: &[&str]) -> Result<()> {
        self.client.fetch(args)
    }

    fn commit_exists(&self, sha: &str) -> Result<bool> {
        self.client.commit_exists(sha)
    }

    fn merge_and_checkout(
        &self,
        base: &str,
        strategy: MergeStrategy,
        heads: &[&str],
    ) -> Result<()> {
        self.client.merge_and_checkout(base, strategy, heads)
    }

    fn clean(&self) -> Result<()> {
        self.release_lock();
        Ok(())
    }
}

/// A `ClientFactory` wrapper that reuses one working tree per repository.
pub struct GitClientCache {
    factory: Arc<dyn ClientFactory>,
    opts: RepoOpts,
    entries: RwLock<HashMap<RepoId, Arc<CacheEntry>>>,
}

impl GitClientCache {
    /// Wraps `factory`; new trees use the sparse in-repo config checkout.
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self::with_opts(factory, loader::repo_opts())
    }

    pub fn with_opts(factory: Arc<dyn ClientFactory>, opts: RepoOpts) -> Self {
        Self {
            factory,
            opts,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns an exclusively held working tree for `id`, cloning it on
    /// first use and repairing it when a previous user left it dirty.
    ///
    /// Blocks while another caller holds the same repository.
    pub fn acquire(&self, id: &RepoId) -> Result<WorkingTree> {
        loop {
            let existing = self.read_entries()?.get(id).cloned();
            let entry = match existing {
                Some(entry) => entry,
                None => {
                    let mut entries = self.write_entries()?;
                    // Another thread may have inserted it while this one
                    // waited for the write lock.
                    match entries.get(id) {
                        Some(entry) => Arc::clone(entry),
                        None => {
                            let entry = Arc::new(CacheEntry::held());
                            entries.insert(id.clone(), Arc::clone(&entry));
                            drop(entries);
                            return self.populate(id, entry);
                        }
                    }
                }
            };

            if let Some(tree) = self.reuse(id, entry)? {
                return Ok(tree);
            }
        }
    }

    /// Takes an existing entry. `None` means the entry is gone and the
    /// caller should look it up again.
    fn reuse(&self, id: &RepoId, entry: Arc<CacheEntry>) -> Result<Option<WorkingTree>> {
        if !entry.lock()? {
            return Ok(None);
        }
        let Some(client) = entry.client.get().cloned() else {
            self.evict(id, &entry);
            return Ok(None);
        };

        // A failed dirty check is treated like a dirty tree.
        if client.is_dirty().unwrap_or(true) {
            debug!("Working tree for {} is dirty, resetting", id);
            if let Err(e) = client.reset_hard("HEAD") {
                warn!("Failed to reset working tree for {}, recloning: {}", id, e);
                self.evict(id, &entry);
                return Ok(None);
            }
        }

        // Commits deleted on the remote make plain fetches fail, hence --prune.
        if let Err(e) = client.fetch(&["--prune"]) {
            entry.unlock();
            return Err(e);
        }

        Ok(Some(WorkingTree::new(id.clone(), entry, client)))
    }

    /// Clones into a freshly inserted placeholder that this thread holds.
    fn populate(&self, id: &RepoId, entry: Arc<CacheEntry>) -> Result<WorkingTree> {
        let created = self
            .factory
            .client_for(id, &self.opts)
            .and_then(|client| {
                let client: Arc<dyn RepoClient> = Arc::from(client);
                let refspec = ["--add", "remote.origin.fetch", PULL_HEADS_REFSPEC];
                if let Err(e) = client.config(&refspec) {
                    if let Err(clean_err) = client.clean() {
                        error!("Failed to clean up repo {}: {}", id, clean_err);
                    }
                    return Err(e);
                }
                Ok(client)
            });

        match created {
            Ok(client) => {
                // The placeholder is only visible to threads blocked on its
                // lock, so the cell is always empty here.
                let _ = entry.client.set(Arc::clone(&client));
                debug!("Cached new working tree for {}", id);
                Ok(WorkingTree::new(id.clone(), entry, client))
            }
            Err(e) => {
                self.evict(id, &entry);
                Err(e)
            }
        }
    }

    /// Drops `entry` from the map, removes its tree from disk and wakes any
    /// waiters. Must be called with the entry lock held.
    fn evict(&self, id: &RepoId, entry: &Arc<CacheEntry>) {
        match self.entries.write() {
            Ok(mut entries) => {
                if entries.get(id).is_some_and(|e| Arc::ptr_eq(e, entry)) {
                    entries.remove(id);
                }
            }
            Err(_) => error!("Cache map lock poisoned while evicting {}", id),
        }
        if let Some(client) = entry.client.get() {
            if let Err(e) = client.clean() {
                error!("Failed to clean up repo {}: {}", id, e);
            }
        }
        entry.retire();
    }

    fn read_entries(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<RepoId, Arc<CacheEntry>>>> {
        self.entries.read().map_err(|_| Error::LockPoisoned {
            context: "working tree cache".to_string(),
        })
    }

    fn write_entries(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<RepoId, Arc<CacheEntry>>>> {
        self.entries.write().map_err(|_| Error::LockPoisoned {
            context: "working tree cache".to_string(),
        })
    }

    /// Number of cached working trees
    pub fn len(&self) -> Result<usize> {
        Ok(self.read_entries()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.read_entries()?.is_empty())
    }

    pub fn contains(&self, id: &RepoId) -> Result<bool> {
        Ok(self.read_entries()?.contains_key(id))
    }
}

impl ClientFactory for GitClientCache {
    /// Same as `acquire`. `opts` is ignored: cached trees always use the
    /// options the cache was built with.
    fn client_for(&self, id: &RepoId, _opts: &RepoOpts) -> Result<Box<dyn RepoClient>> {
        Ok(Box::new(self.acquire(id)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    /// Shared knobs and counters for the mock clients
    #[derive(Default)]
    struct MockState {
        clones: AtomicUsize,
        resets: AtomicUsize,
        cleans: AtomicUsize,
        fetches: Mutex<Vec<String>>,
        configs: Mutex<Vec<String>>,
        dirty: AtomicBool,
        fail_reset: AtomicBool,
        fail_fetch: AtomicBool,
        fail_clone: AtomicBool,
    }

    struct MockClient {
        dir: PathBuf,
        state: Arc<MockState>,
    }

    impl RepoClient for MockClient {
        fn directory(&self) -> &Path {
            &self.dir
        }

        fn config(&self, args: &[&str]) -> Result<()> {
            self.state.configs.lock().unwrap().push(args.join(" "));
            Ok(())
        }

        fn is_dirty(&self) -> Result<bool> {
            Ok(self.state.dirty.load(Ordering::SeqCst))
        }

        fn reset_hard(&self, _rev: &str) -> Result<()> {
            self.state.resets.fetch_add(1, Ordering::SeqCst);
            if self.state.fail_reset.load(Ordering::SeqCst) {
                return Err(Error::GitCommand {
                    command: "reset --hard HEAD".to_string(),
                    repo: "mock".to_string(),
                    stderr: "index.lock exists".to_string(),
                });
            }
            self.state.dirty.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn fetch(&self, args: &[&str]) -> Result<()> {
            self.state.fetches.lock().unwrap().push(args.join(" "));
            if self.state.fail_fetch.load(Ordering::SeqCst) {
                return Err(Error::GitCommand {
                    command: "fetch".to_string(),
                    repo: "mock".to_string(),
                    stderr: "network unreachable".to_string(),
                });
            }
            Ok(())
        }

        fn commit_exists(&self, _sha: &str) -> Result<bool> {
            Ok(true)
        }

        fn merge_and_checkout(&self, _: &str, _: MergeStrategy, _: &[&str]) -> Result<()> {
            Ok(())
        }

        fn clean(&self) -> Result<()> {
            self.state.cleans.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MockFactory {
        state: Arc<MockState>,
        opts_seen: Mutex<Vec<RepoOpts>>,
    }

    impl MockFactory {
        fn new() -> Self {
            Self {
                state: Arc::new(MockState::default()),
                opts_seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl ClientFactory for MockFactory {
        fn client_for(&self, id: &RepoId, opts: &RepoOpts) -> Result<Box<dyn RepoClient>> {
            self.opts_seen.lock().unwrap().push(opts.clone());
            if self.state.fail_clone.load(Ordering::SeqCst) {
                return Err(Error::GitClone {
                    repo: id.to_string(),
                    message: "repository not found".to_string(),
                });
            }
            let n = self.state.clones.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockClient {
                dir: PathBuf::from(format!("/mock/{}-{}", id.repo, n)),
                state: Arc::clone(&self.state),
            }))
        }
    }

    fn setup() -> (Arc<MockState>, GitClientCache) {
        let factory = Arc::new(MockFactory::new());
        let state = Arc::clone(&factory.state);
        (state, GitClientCache::new(factory))
    }

    #[test]
    fn test_first_acquire_clones_with_sparse_opts() {
        let factory = Arc::new(MockFactory::new());
        let cache = GitClientCache::new(Arc::clone(&factory) as Arc<dyn ClientFactory>);
        let id = RepoId::new("org", "repo");

        let tree = cache.acquire(&id).unwrap();
        assert_eq!(tree.id(), &id);
        assert_eq!(tree.directory(), Path::new("/mock/repo-0"));
        tree.release();

        let opts = factory.opts_seen.lock().unwrap();
        assert_eq!(opts.len(), 1);
        assert_eq!(opts[0].sparse_checkout_dirs, vec![".prow", ".prow.yaml"]);
        assert!(opts[0].share_objects_with_source_repo);

        let configs = factory.state.configs.lock().unwrap();
        assert_eq!(
            configs.as_slice(),
            [format!("--add remote.origin.fetch {}", PULL_HEADS_REFSPEC)]
        );
        assert_eq!(cache.len().unwrap(), 1);
        assert!(cache.contains(&id).unwrap());
    }

    #[test]
    fn test_release_keeps_tree_for_reuse() {
        let (state, cache) = setup();
        let id = RepoId::new("org", "repo");

        cache.acquire(&id).unwrap().release();
        let tree = cache.acquire(&id).unwrap();
        assert_eq!(tree.directory(), Path::new("/mock/repo-0"));
        tree.release();

        assert_eq!(state.clones.load(Ordering::SeqCst), 1);
        assert_eq!(state.cleans.load(Ordering::SeqCst), 0);
        assert_eq!(state.fetches.lock().unwrap().as_slice(), ["--prune"]);
    }

    #[test]
    fn test_clean_on_handle_releases_instead_of_deleting() {
        let (state, cache) = setup();
        let id = RepoId::new("org", "repo");

        let client: Box<dyn RepoClient> = cache.client_for(&id, &RepoOpts::default()).unwrap();
        client.clean().unwrap();
        assert_eq!(state.cleans.load(Ordering::SeqCst), 0);

        // Would block forever if clean had not released the lock.
        cache.acquire(&id).unwrap().release();
    }

    #[test]
    fn test_dirty_tree_is_reset_not_recloned() {
        let (state, cache) = setup();
        let id = RepoId::new("org", "repo");

        cache.acquire(&id).unwrap().release();
        state.dirty.store(true, Ordering::SeqCst);

        let tree = cache.acquire(&id).unwrap();
        assert_eq!(tree.directory(), Path::new("/mock/repo-0"));
        tree.release();

        assert_eq!(state.resets.load(Ordering::SeqCst), 1);
        assert_eq!(state.clones.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn test_failed_reset_evicts_and_reclones() {
        let (state, cache) = setup();
        let id = RepoId::new("org", "repo");

        cache.acquire(&id).unwrap().release();
        state.dirty.store(true, Ordering::SeqCst);
        state.fail_reset.store(true, Ordering::SeqCst);

        let tree = cache.acquire(&id).unwrap();
        assert_eq!(tree.directory(), Path::new("/mock/repo-1"));
        tree.release();

        assert_eq!(state.clones.load(Ordering::SeqCst), 2);
        assert_eq!(state.cleans.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn test_fetch_failure_surfaces_and_releases() {
        let (state, cache) = setup();
        let id = RepoId::new("org", "repo");

        cache.acquire(&id).unwrap().release();
        state.fail_fetch.store(true, Ordering::SeqCst);
        let err = cache.acquire(&id).err().unwrap();
        assert!(err.to_string().contains("network unreachable"));

        state.fail_fetch.store(false, Ordering::SeqCst);
        cache.acquire(&id).unwrap().release();
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn test_clone_failure_leaves_no_entry() {
        let (state, cache) = setup();
        let id = RepoId::new("org", "repo");

        state.fail_clone.store(true, Ordering::SeqCst);
        assert!(matches!(cache.acquire(&id), Err(Error::GitClone { .. })));
        assert!(cache.is_empty().unwrap());

        state.fail_clone.store(false, Ordering::SeqCst);
        cache.acquire(&id).unwrap().release();
        assert_eq!(cache.len().unwrap(), 1);
    }

    #[test]
    fn test_dropped_handle_is_released() {
        let (_state, cache) = setup();
        let id = RepoId::new("org", "repo");

        {
            let _tree = cache.acquire(&id).unwrap();
        }
        cache.acquire(&id).unwrap().release();
    }
}
