//! Read-through caching decorator over a [`VirtualFileSystem`].
//!
//! Three caches sit in front of the backing filesystem:
//!
//! | cache  | key            | value  | expiry                     |
//! |--------|----------------|--------|----------------------------|
//! | lookup | (parent, name) | inode  | `lifetime_ms` after write  |
//! | stat   | inode          | `Stat` | `lifetime_ms` after write  |
//! | parent | inode          | inode  | `parent_lifetime_ms` (100) |
//!
//! Filesystem statistics are memoized separately when
//! `fs_stat_lifetime_ms` is set. Mutations forwarded through the decorator
//! update or invalidate the affected entries. Concurrent misses on one key
//! share a single backend call.

use async_trait::async_trait;
use moka::future::Cache;
use std::future::Future;
use std::hash::Hash;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::VfsCacheConfig;
use crate::vfs::{FileType, FsStat, Inode, Stat, Subject, VirtualFileSystem};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LookupKey {
    parent: Inode,
    name: String,
}

impl LookupKey {
    fn new(parent: &Inode, name: &str) -> Self {
        LookupKey {
            parent: parent.clone(),
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    misses: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> HitMiss {
        let requests = self.requests.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        HitMiss {
            hits: requests.saturating_sub(misses),
            misses,
        }
    }
}

/// Hit and miss counts of one cache. Callers that waited on another
/// caller's load count as hits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HitMiss {
    pub hits: u64,
    pub misses: u64,
}

/// Counters of all caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub lookup: HitMiss,
    pub stat: HitMiss,
    pub parent: HitMiss,
    pub fs_stat: HitMiss,
}

/// Caching [`VirtualFileSystem`] decorator.
pub struct VfsCache<V> {
    inner: V,
    lookup_cache: Cache<LookupKey, Inode>,
    stat_cache: Cache<Inode, Stat>,
    parent_cache: Cache<Inode, Inode>,
    fs_stat_cache: Option<Cache<(), FsStat>>,
    lookup_counters: Counters,
    stat_counters: Counters,
    parent_counters: Counters,
    fs_stat_counters: Counters,
}

fn build_cache<K, T>(name: &str, max_entries: u64, ttl: Duration) -> Cache<K, T>
where
    K: Hash + Eq + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    Cache::builder()
        .name(name)
        .max_capacity(max_entries)
        .time_to_live(ttl)
        .build()
}

/// Recover the backend's error from the shared error handed to every
/// caller waiting on the same load. When the error is still shared, an
/// errno-carrying error is rebuilt from its code so status mapping holds.
fn unwrap_loader_error(e: Arc<io::Error>) -> io::Error {
    Arc::try_unwrap(e).unwrap_or_else(|e| match e.raw_os_error() {
        Some(code) => io::Error::from_raw_os_error(code),
        None => io::Error::new(e.kind(), e.to_string()),
    })
}

async fn read_through<K, T, F>(
    cache: &Cache<K, T>,
    counters: &Counters,
    key: K,
    load: F,
) -> io::Result<T>
where
    K: Hash + Eq + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    F: Future<Output = io::Result<T>>,
{
    counters.requests.fetch_add(1, Ordering::Relaxed);
    cache
        .try_get_with(key, async {
            counters.misses.fetch_add(1, Ordering::Relaxed);
            load.await
        })
        .await
        .map_err(unwrap_loader_error)
}

impl<V: VirtualFileSystem> VfsCache<V> {
    pub fn new(inner: V, config: &VfsCacheConfig) -> Self {
        let lifetime = Duration::from_millis(config.lifetime_ms);
        let fs_stat_cache = config
            .fs_stat_lifetime_ms
            .filter(|ms| *ms > 0)
            .map(|ms| build_cache("vfs-fsstat-cache", 1, Duration::from_millis(ms)));

        VfsCache {
            inner,
            lookup_cache: build_cache("vfs-lookup-cache", config.max_entries, lifetime),
            stat_cache: build_cache("vfs-stat-cache", config.max_entries, lifetime),
            parent_cache: build_cache(
                "vfs-parent-cache",
                config.max_entries,
                Duration::from_millis(config.parent_lifetime_ms),
            ),
            fs_stat_cache,
            lookup_counters: Counters::default(),
            stat_counters: Counters::default(),
            parent_counters: Counters::default(),
            fs_stat_counters: Counters::default(),
        }
    }

    /// The decorated filesystem
    pub fn inner(&self) -> &V {
        &self.inner
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            lookup: self.lookup_counters.snapshot(),
            stat: self.stat_counters.snapshot(),
            parent: self.parent_counters.snapshot(),
            fs_stat: self.fs_stat_counters.snapshot(),
        }
    }

    /// Drop the cached lookup of `name` in `parent`. For callers that change
    /// the backing store behind the decorator's back.
    pub async fn invalidate_lookup_cache(&self, parent: &Inode, name: &str) {
        self.lookup_cache
            .invalidate(&LookupKey::new(parent, name))
            .await;
    }

    /// Drop the cached attributes of `inode`.
    pub async fn invalidate_stat_cache(&self, inode: &Inode) {
        self.stat_cache.invalidate(inode).await;
    }

    /// Drop the memoized filesystem statistics.
    pub async fn invalidate_fs_stat(&self) {
        if let Some(cache) = &self.fs_stat_cache {
            cache.invalidate(&()).await;
        }
    }

    async fn update_lookup_cache(&self, parent: &Inode, name: &str, inode: &Inode) {
        self.lookup_cache
            .insert(LookupKey::new(parent, name), inode.clone())
            .await;
    }

    async fn update_parent_cache(&self, inode: &Inode, parent: &Inode) {
        self.parent_cache.insert(inode.clone(), parent.clone()).await;
    }
}

#[async_trait]
impl<V: VirtualFileSystem> VirtualFileSystem for VfsCache<V> {
    async fn lookup(&self, parent: &Inode, name: &str) -> io::Result<Inode> {
        read_through(
            &self.lookup_cache,
            &self.lookup_counters,
            LookupKey::new(parent, name),
            async {
                debug!("lookup cache miss: {}/{}", parent, name);
                self.inner.lookup(parent, name).await
            },
        )
        .await
    }

    async fn getattr(&self, inode: &Inode) -> io::Result<Stat> {
        read_through(
            &self.stat_cache,
            &self.stat_counters,
            inode.clone(),
            self.inner.getattr(inode),
        )
        .await
    }

    async fn parent_of(&self, inode: &Inode) -> io::Result<Inode> {
        read_through(
            &self.parent_cache,
            &self.parent_counters,
            inode.clone(),
            self.inner.parent_of(inode),
        )
        .await
    }

    async fn fs_stat(&self) -> io::Result<FsStat> {
        match &self.fs_stat_cache {
            Some(cache) => {
                read_through(cache, &self.fs_stat_counters, (), self.inner.fs_stat()).await
            }
            None => self.inner.fs_stat().await,
        }
    }

    async fn create(
        &self,
        parent: &Inode,
        ftype: FileType,
        name: &str,
        subject: &Subject,
        mode: u32,
    ) -> io::Result<Inode> {
        let inode = self
            .inner
            .create(parent, ftype, name, subject, mode)
            .await?;
        self.update_lookup_cache(parent, name, &inode).await;
        self.invalidate_stat_cache(parent).await;
        self.update_parent_cache(&inode, parent).await;
        Ok(inode)
    }

    async fn mkdir(
        &self,
        parent: &Inode,
        name: &str,
        subject: &Subject,
        mode: u32,
    ) -> io::Result<Inode> {
        let inode = self.inner.mkdir(parent, name, subject, mode).await?;
        self.update_lookup_cache(parent, name, &inode).await;
        self.invalidate_stat_cache(parent).await;
        Ok(inode)
    }

    async fn link(
        &self,
        parent: &Inode,
        target: &Inode,
        name: &str,
        subject: &Subject,
    ) -> io::Result<Inode> {
        let inode = self.inner.link(parent, target, name, subject).await?;
        self.update_lookup_cache(parent, name, &inode).await;
        self.invalidate_stat_cache(parent).await;
        self.invalidate_stat_cache(&inode).await;
        self.update_parent_cache(&inode, parent).await;
        Ok(inode)
    }

    async fn symlink(
        &self,
        parent: &Inode,
        name: &str,
        target: &str,
        subject: &Subject,
        mode: u32,
    ) -> io::Result<Inode> {
        let inode = self
            .inner
            .symlink(parent, name, target, subject, mode)
            .await?;
        self.update_lookup_cache(parent, name, &inode).await;
        self.invalidate_stat_cache(parent).await;
        Ok(inode)
    }

    async fn readlink(&self, inode: &Inode) -> io::Result<String> {
        self.inner.readlink(inode).await
    }

    async fn remove(&self, parent: &Inode, name: &str) -> io::Result<()> {
        let inode = self.lookup(parent, name).await?;
        self.inner.remove(parent, name).await?;
        self.invalidate_lookup_cache(parent, name).await;
        self.invalidate_stat_cache(parent).await;
        self.invalidate_stat_cache(&inode).await;
        Ok(())
    }

    async fn move_entry(
        &self,
        src: &Inode,
        old_name: &str,
        dest: &Inode,
        new_name: &str,
    ) -> io::Result<bool> {
        let changed = self
            .inner
            .move_entry(src, old_name, dest, new_name)
            .await?;
        if changed {
            self.invalidate_lookup_cache(src, old_name).await;
            self.invalidate_lookup_cache(dest, new_name).await;
            self.invalidate_stat_cache(src).await;
            self.invalidate_stat_cache(dest).await;
        }
        Ok(changed)
    }

    async fn setattr(&self, inode: &Inode, stat: &Stat) -> io::Result<()> {
        self.inner.setattr(inode, stat).await?;
        self.invalidate_stat_cache(inode).await;
        Ok(())
    }

    async fn read(&self, inode: &Inode, offset: u64, count: u32) -> io::Result<Vec<u8>> {
        self.inner.read(inode, offset, count).await
    }

    async fn write(&self, inode: &Inode, offset: u64, data: &[u8]) -> io::Result<u32> {
        let written = self.inner.write(inode, offset, data).await?;
        self.invalidate_stat_cache(inode).await;
        Ok(written)
    }

    async fn commit(&self, inode: &Inode, offset: u64, count: u32) -> io::Result<()> {
        self.invalidate_stat_cache(inode).await;
        self.inner.commit(inode, offset, count).await
    }
}
