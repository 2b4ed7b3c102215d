//! Byte-range lock registry.
//!
//! Every mutation of a file's lock set runs as: enter the file's critical
//! section, load the set, check for conflicts, store the result, leave. The
//! critical section and the storage are pluggable so the same algorithm
//! serves a single server ([`LocalExclusion`] + [`MemoryLockStore`]) and a
//! cluster of servers sharing one backing filesystem (see `dlm`).
//!
//! Failing to enter the critical section in time is reported as
//! [`NfsError::LockCoordination`], never as a denied lock.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::client::NfsClient;
use crate::error::{NfsError, Result};
use crate::keyed::KeyedCollections;
use crate::lock::Lock;
use crate::state::{FileId, NfsState, StateKind, StateRelease};
use crate::stateid::StateId;

/// Mutual exclusion keyed by file.
#[async_trait]
pub trait Exclusion: Send + Sync {
    /// Proof of holding the exclusion for one file
    type Guard: Send + 'static;

    /// Enter the critical section for `file`, waiting at most `timeout`.
    async fn acquire(&self, file: &FileId, timeout: Duration) -> Result<Self::Guard>;

    /// Leave the critical section.
    async fn release(&self, guard: Self::Guard) -> Result<()>;

    /// True if someone currently holds the exclusion for `file`.
    async fn is_held(&self, file: &FileId) -> Result<bool>;
}

/// Where lock sets live between critical sections.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Current lock set of `file`
    async fn load(&self, file: &FileId) -> Result<Vec<Lock>>;

    /// Replace the lock set of `file`. An empty set removes it.
    async fn save(&self, file: &FileId, locks: Vec<Lock>) -> Result<()>;
}

/// In-process exclusion: one async mutex per file, created on demand and
/// dropped once nobody holds or waits for it.
#[derive(Default)]
pub struct LocalExclusion {
    mutexes: DashMap<FileId, Arc<Mutex<()>>>,
}

/// Guard returned by [`LocalExclusion::acquire`].
pub struct LocalGuard {
    file: FileId,
    guard: OwnedMutexGuard<()>,
}

impl LocalExclusion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the mutex of `file` if only the map references it: nobody holds
    /// or waits. Every path that lets go of a reference ends here.
    fn forget_if_idle(&self, file: &FileId) {
        self.mutexes
            .remove_if(file, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[async_trait]
impl Exclusion for LocalExclusion {
    type Guard = LocalGuard;

    async fn acquire(&self, file: &FileId, timeout: Duration) -> Result<LocalGuard> {
        let mutex = self.mutexes.entry(file.clone()).or_default().value().clone();
        match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => Ok(LocalGuard {
                file: file.clone(),
                guard,
            }),
            Err(_) => {
                // the holder may have released while we still referenced it
                self.forget_if_idle(file);
                Err(NfsError::coordination(format!(
                    "timed out after {:?} waiting for {}",
                    timeout, file
                )))
            }
        }
    }

    async fn release(&self, guard: LocalGuard) -> Result<()> {
        let LocalGuard { file, guard } = guard;
        drop(guard);
        self.forget_if_idle(&file);
        Ok(())
    }

    async fn is_held(&self, file: &FileId) -> Result<bool> {
        Ok(self
            .mutexes
            .get(file)
            .map(|m| m.value().try_lock().is_err())
            .unwrap_or(false))
    }
}

/// Lock sets kept in process memory.
#[derive(Default)]
pub struct MemoryLockStore {
    locks: KeyedCollections<FileId, Lock>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn load(&self, file: &FileId) -> Result<Vec<Lock>> {
        Ok(self.locks.snapshot(file))
    }

    async fn save(&self, file: &FileId, locks: Vec<Lock>) -> Result<()> {
        self.locks.with_collection(file, |current| *current = locks);
        Ok(())
    }
}

/// Byte-range lock registry over a pluggable exclusion and store.
pub struct LockManager<X = LocalExclusion, S = MemoryLockStore> {
    exclusion: Arc<X>,
    store: Arc<S>,
    timeout: Duration,
}

impl LockManager<LocalExclusion, MemoryLockStore> {
    /// Single-server registry.
    pub fn local(timeout: Duration) -> Self {
        Self::new(
            Arc::new(LocalExclusion::new()),
            Arc::new(MemoryLockStore::new()),
            timeout,
        )
    }
}

impl<X, S> LockManager<X, S>
where
    X: Exclusion,
    S: LockStore,
{
    /// Registry over the given exclusion and store. Managers built over the
    /// same pair observe one lock set.
    pub fn new(exclusion: Arc<X>, store: Arc<S>, timeout: Duration) -> Self {
        LockManager {
            exclusion,
            store,
            timeout,
        }
    }

    pub fn exclusion(&self) -> &Arc<X> {
        &self.exclusion
    }

    /// Run `f` over the lock set of `file` inside its critical section.
    /// `f` returns whether it changed the set, and its result.
    async fn with_locks<R, F>(&self, file: &FileId, f: F) -> Result<R>
    where
        R: Send,
        F: FnOnce(&mut Vec<Lock>) -> (bool, Result<R>) + Send,
    {
        let guard = self
            .exclusion
            .acquire(file, self.timeout)
            .await
            .map_err(|e| {
                warn!("Failed to enter critical section for {}: {}", file, e);
                e
            })?;

        let result = self.update(file, f).await;

        if let Err(e) = self.exclusion.release(guard).await {
            warn!("Failed to leave critical section for {}: {}", file, e);
        }
        result
    }

    async fn update<R, F>(&self, file: &FileId, f: F) -> Result<R>
    where
        R: Send,
        F: FnOnce(&mut Vec<Lock>) -> (bool, Result<R>) + Send,
    {
        let mut locks = self.store.load(file).await?;
        let (changed, result) = f(&mut locks);
        if changed {
            self.store.save(file, locks).await?;
        }
        result
    }

    fn check(locks: &[Lock], lock: &Lock) -> Result<()> {
        match locks.iter().find(|existing| existing.conflicts(lock)) {
            Some(existing) => Err(NfsError::LockDenied {
                conflicting: existing.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Add `lock` to `file`, unless it conflicts with a lock of another owner.
    pub async fn add(&self, file: &FileId, lock: Lock) -> Result<()> {
        self.with_locks(file, |locks| match Self::check(locks, &lock) {
            Ok(()) => {
                debug!("Adding {} on {}", lock, file);
                locks.push(lock);
                (true, Ok(()))
            }
            Err(e) => (false, Err(e)),
        })
        .await
    }

    /// Like [`add`](Self::add), without changing anything.
    pub async fn test(&self, file: &FileId, lock: &Lock) -> Result<()> {
        self.with_locks(file, |locks| (false, Self::check(locks, lock)))
            .await
    }

    /// Remove one occurrence of `lock`. Returns false if it was not held.
    pub async fn remove(&self, file: &FileId, lock: &Lock) -> Result<bool> {
        self.with_locks(file, |locks| match locks.iter().position(|l| l == lock) {
            Some(idx) => {
                locks.remove(idx);
                (true, Ok(true))
            }
            None => (false, Ok(false)),
        })
        .await
    }

    /// Drop every lock on `file`.
    pub async fn remove_all(&self, file: &FileId) -> Result<()> {
        self.with_locks(file, |locks| {
            let changed = !locks.is_empty();
            locks.clear();
            (changed, Ok(()))
        })
        .await
    }

    /// Locks currently held on `file`.
    pub async fn locks_on(&self, file: &FileId) -> Result<Vec<Lock>> {
        self.with_locks(file, |locks| (false, Ok(locks.clone())))
            .await
    }

    /// LOCK on behalf of `client`: add the lock and issue a lock state that
    /// removes it again when released.
    pub async fn lock(&self, client: &NfsClient, file: &FileId, lock: Lock) -> Result<StateId> {
        self.add(file, lock.clone()).await?;
        Ok(client.create_state(StateKind::Lock {
            file: file.clone(),
            lock,
        }))
    }
}

#[async_trait]
impl<X, S> StateRelease for LockManager<X, S>
where
    X: Exclusion,
    S: LockStore,
{
    async fn release(&self, client_id: u64, state: &NfsState) {
        if let StateKind::Lock { file, lock } = &state.kind {
            match self.remove(file, lock).await {
                Ok(_) => debug!("Released {} of client {:#x}", lock, client_id),
                Err(e) => warn!(
                    "Failed to release {} of client {:#x} on {}: {}",
                    lock, client_id, file, e
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientLimits, Releasers};
    use crate::clock::ManualClock;

    const OWNER1: &[u8] = b"owner1";
    const OWNER2: &[u8] = b"owner2";
    const TIMEOUT: Duration = Duration::from_secs(5);

    fn lock(begin: u64, end: i64, owner: &[u8]) -> Lock {
        Lock::new(begin, end, owner.to_vec()).unwrap()
    }

    fn file(name: &str) -> FileId {
        FileId::new(name.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_add_new() {
        let lm = LockManager::local(TIMEOUT);
        lm.add(&file("a"), lock(0, 1, OWNER1)).await.unwrap();
        assert_eq!(lm.locks_on(&file("a")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_add_conflicting() {
        let lm = LockManager::local(TIMEOUT);
        let f = file("a");
        lm.add(&f, lock(0, 1, OWNER1)).await.unwrap();
        match lm.add(&f, lock(0, 1, OWNER2)).await {
            Err(NfsError::LockDenied { conflicting }) => {
                assert_eq!(conflicting, lock(0, 1, OWNER1));
            }
            other => panic!("expected LockDenied, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remove_conflicting() {
        let lm = LockManager::local(TIMEOUT);
        let f = file("a");
        lm.add(&f, lock(0, 1, OWNER1)).await.unwrap();
        assert!(lm.remove(&f, &lock(0, 1, OWNER1)).await.unwrap());
        lm.add(&f, lock(0, 1, OWNER2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_missing() {
        let lm = LockManager::local(TIMEOUT);
        assert!(!lm.remove(&file("a"), &lock(0, 1, OWNER1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_conflicting_different_inode() {
        let lm = LockManager::local(TIMEOUT);
        lm.add(&file("a"), lock(0, 1, OWNER1)).await.unwrap();
        lm.add(&file("b"), lock(0, 1, OWNER2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_same_owner_overlap_allowed() {
        let lm = LockManager::local(TIMEOUT);
        let f = file("a");
        lm.add(&f, lock(0, 10, OWNER1)).await.unwrap();
        lm.add(&f, lock(5, -1, OWNER1)).await.unwrap();
        assert_eq!(lm.locks_on(&f).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_test_does_not_mutate() {
        let lm = LockManager::local(TIMEOUT);
        let f = file("a");
        lm.test(&f, &lock(0, 1, OWNER1)).await.unwrap();
        assert!(lm.locks_on(&f).await.unwrap().is_empty());

        lm.add(&f, lock(0, 1, OWNER1)).await.unwrap();
        assert!(matches!(
            lm.test(&f, &lock(1, 2, OWNER2)).await,
            Err(NfsError::LockDenied { .. })
        ));
        assert_eq!(lm.locks_on(&f).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_all() {
        let lm = LockManager::local(TIMEOUT);
        let f = file("a");
        lm.add(&f, lock(0, 1, OWNER1)).await.unwrap();
        lm.add(&f, lock(5, 6, OWNER2)).await.unwrap();
        lm.remove_all(&f).await.unwrap();
        assert!(lm.locks_on(&f).await.unwrap().is_empty());
        lm.add(&f, lock(0, -1, OWNER2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_shared_backend_conflict_across_managers() {
        let exclusion = Arc::new(LocalExclusion::new());
        let store = Arc::new(MemoryLockStore::new());
        let lm1 = LockManager::new(exclusion.clone(), store.clone(), TIMEOUT);
        let lm2 = LockManager::new(exclusion, store, TIMEOUT);
        let f = file("file1");

        lm1.add(&f, lock(0, 1, OWNER1)).await.unwrap();
        assert!(matches!(
            lm2.add(&f, lock(0, 1, OWNER2)).await,
            Err(NfsError::LockDenied { .. })
        ));
    }

    #[tokio::test]
    async fn test_shared_backend_same_owner_visible_everywhere() {
        let exclusion = Arc::new(LocalExclusion::new());
        let store = Arc::new(MemoryLockStore::new());
        let lm1 = LockManager::new(exclusion.clone(), store.clone(), TIMEOUT);
        let lm2 = LockManager::new(exclusion, store, TIMEOUT);
        let f = file("file1");

        lm1.add(&f, lock(0, 1, OWNER1)).await.unwrap();
        lm2.add(&f, lock(0, 1, OWNER1)).await.unwrap();

        let probe = lock(0, -1, b"someone-else");
        assert!(lm1.test(&f, &probe).await.is_err());
        assert!(lm2.test(&f, &probe).await.is_err());
    }

    #[tokio::test]
    async fn test_coordination_timeout_is_not_denial() {
        let exclusion = Arc::new(LocalExclusion::new());
        let lm = LockManager::new(
            exclusion.clone(),
            Arc::new(MemoryLockStore::new()),
            Duration::from_millis(20),
        );
        let f = file("busy");

        let held = exclusion.acquire(&f, TIMEOUT).await.unwrap();
        assert!(exclusion.is_held(&f).await.unwrap());

        let err = lm.add(&f, lock(0, 1, OWNER1)).await.unwrap_err();
        assert!(matches!(err, NfsError::LockCoordination { .. }));
        assert!(err.is_retryable());

        exclusion.release(held).await.unwrap();
        assert!(!exclusion.is_held(&f).await.unwrap());
        lm.add(&f, lock(0, 1, OWNER1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_exclusion_entries_are_dropped() {
        let lm = LockManager::local(TIMEOUT);
        lm.add(&file("a"), lock(0, 1, OWNER1)).await.unwrap();
        assert!(lm.exclusion().mutexes.is_empty());
    }

    #[tokio::test]
    async fn test_timed_out_waiter_leaves_no_entry() {
        let exclusion = Arc::new(LocalExclusion::new());
        let f = file("busy");

        let held = exclusion.acquire(&f, TIMEOUT).await.unwrap();
        assert!(exclusion
            .acquire(&f, Duration::from_millis(10))
            .await
            .is_err());
        exclusion.release(held).await.unwrap();
        assert!(exclusion.mutexes.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_release_racing_timeouts_leaves_no_entry() {
        let exclusion = Arc::new(LocalExclusion::new());
        let f = file("racy");

        for _ in 0..50 {
            let held = exclusion.acquire(&f, TIMEOUT).await.unwrap();
            let waiters: Vec<_> = (0..4u64)
                .map(|i| {
                    let exclusion = exclusion.clone();
                    let f = f.clone();
                    tokio::spawn(async move {
                        if let Ok(guard) = exclusion.acquire(&f, Duration::from_millis(1 + i)).await
                        {
                            exclusion.release(guard).await.unwrap();
                        }
                    })
                })
                .collect();
            tokio::time::sleep(Duration::from_millis(2)).await;
            exclusion.release(held).await.unwrap();
            for w in waiters {
                w.await.unwrap();
            }
            assert!(exclusion.mutexes.is_empty());
        }
    }

    struct FailingStore;

    #[async_trait]
    impl LockStore for FailingStore {
        async fn load(&self, _file: &FileId) -> Result<Vec<Lock>> {
            Err(NfsError::coordination("store unreachable"))
        }

        async fn save(&self, _file: &FileId, _locks: Vec<Lock>) -> Result<()> {
            Err(NfsError::coordination("store unreachable"))
        }
    }

    #[tokio::test]
    async fn test_store_failure_releases_exclusion() {
        let exclusion = Arc::new(LocalExclusion::new());
        let lm = LockManager::new(exclusion.clone(), Arc::new(FailingStore), TIMEOUT);
        let f = file("a");
        assert!(matches!(
            lm.add(&f, lock(0, 1, OWNER1)).await,
            Err(NfsError::LockCoordination { .. })
        ));
        assert!(!exclusion.is_held(&f).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_conflicting_adds() {
        let lm = Arc::new(LockManager::local(TIMEOUT));
        let f = file("contended");

        let tasks: Vec<_> = (0..16u8)
            .map(|i| {
                let lm = lm.clone();
                let f = f.clone();
                tokio::spawn(async move { lm.add(&f, lock(0, 100, &[i])).await.is_ok() })
            })
            .collect();

        let mut granted = 0;
        for t in tasks {
            if t.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
        assert_eq!(lm.locks_on(&f).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lock_state_released_with_client() {
        let lm = Arc::new(LockManager::local(TIMEOUT));
        let releasers: Releasers = Arc::new(vec![lm.clone() as Arc<dyn StateRelease>]);
        let client = NfsClient::new(
            1,
            b"c".to_vec(),
            [0; 8],
            String::new(),
            ClientLimits {
                lease_time: Duration::from_secs(90),
                max_session_slots: 4,
            },
            Arc::new(ManualClock::new()),
            releasers,
        );
        let f = file("a");

        let sid = lm.lock(&client, &f, lock(0, 10, OWNER1)).await.unwrap();
        assert!(matches!(
            client.state(&sid).unwrap().kind,
            StateKind::Lock { .. }
        ));

        client.release_state(&sid).await.unwrap();
        assert!(lm.locks_on(&f).await.unwrap().is_empty());
    }
}
