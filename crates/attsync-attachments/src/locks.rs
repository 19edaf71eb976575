//! Per-directory mutual exclusion
//!
//! A reconciliation reads, plans, executes and re-reads one target directory.
//! Two calls on the same directory must not interleave, so each call holds
//! the directory's lock for the whole sequence. Calls on different
//! directories never contend.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = DashMap<String, Arc<Mutex<()>>>;

/// Drop the entry for `dir` once the map holds the only reference
fn evict_if_idle(locks: &LockMap, dir: &str) {
    locks.remove_if(dir, |_, mutex| Arc::strong_count(mutex) == 1);
}

/// Registry of async locks keyed by target directory
#[derive(Debug, Clone, Default)]
pub struct DirectoryLocks {
    inner: Arc<LockMap>,
}

impl DirectoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `dir`
    pub async fn acquire(&self, dir: &str) -> DirectoryGuard {
        let mutex = self
            .inner
            .entry(dir.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = Waiter {
            dir: dir.to_string(),
            locks: Arc::clone(&self.inner),
            lock: Some(mutex.lock_owned().boxed()),
        }
        .await;

        DirectoryGuard {
            dir: dir.to_string(),
            locks: Arc::clone(&self.inner),
            guard: Some(guard),
        }
    }

    /// Number of directories with a held or awaited lock
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Exclusive access to one directory; released on drop
#[derive(Debug)]
pub struct DirectoryGuard {
    dir: String,
    locks: Arc<LockMap>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl DirectoryGuard {
    pub fn dir(&self) -> &str {
        &self.dir
    }
}

impl Drop for DirectoryGuard {
    fn drop(&mut self) {
        self.guard.take();
        // The map's own reference is the only one left once nobody holds or awaits the lock
        evict_if_idle(&self.locks, &self.dir);
    }
}

/// A pending `acquire`. Abandoning it before the lock is granted releases its
/// reference and evicts the entry if nobody else uses it.
struct Waiter {
    dir: String,
    locks: Arc<LockMap>,
    lock: Option<BoxFuture<'static, OwnedMutexGuard<()>>>,
}

impl Future for Waiter {
    type Output = OwnedMutexGuard<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(lock) = self.lock.as_mut() else {
            return Poll::Pending;
        };
        match lock.poll_unpin(cx) {
            Poll::Ready(guard) => {
                self.lock = None;
                Poll::Ready(guard)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if self.lock.take().is_some() {
            evict_if_idle(&self.locks, &self.dir);
        }
    }
}
