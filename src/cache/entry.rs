//! Stampede-safe time-to-live cache cell.
//!
//! A [`TtlCell`] holds one value, the instant it was computed and a lock that
//! serializes recomputation of that value only. Fresh reads are two atomic
//! loads and never touch the lock. Stale reads queue on the lock and, once they
//! hold it, check whether another caller already refreshed the cell while they
//! were waiting; only the first caller actually runs the updater.

use crate::error::MimirError;
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Stamp meaning "never populated" or "forcibly expired".
const EXPIRED: u64 = 0;

/// How long a cached value is trusted without revalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ttl {
    /// Populate once, then serve until explicitly expired
    Forever,
    /// Attempt a refresh on every access
    Uncached,
    /// Serve for the given duration, then refresh
    Bounded(Duration),
}

impl Ttl {
    /// Map the classic signed "cache seconds" knob: negative caches forever,
    /// zero disables caching, positive values bound the age.
    pub fn from_seconds(seconds: i64) -> Self {
        match seconds {
            s if s < 0 => Ttl::Forever,
            0 => Ttl::Uncached,
            s => Ttl::Bounded(Duration::from_secs(s as u64)),
        }
    }

    pub fn is_forever(&self) -> bool {
        matches!(self, Ttl::Forever)
    }
}

/// How a read was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellOutcome {
    /// Fresh value returned without taking the lock
    Hit,
    /// This caller ran the updater and the value changed
    Refreshed,
    /// This caller revalidated a self-refreshing value that had not changed
    Revalidated,
    /// Another caller refreshed while this one waited on the lock
    Coalesced,
}

impl CellOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CellOutcome::Hit => "hit",
            CellOutcome::Refreshed => "refreshed",
            CellOutcome::Revalidated => "revalidated",
            CellOutcome::Coalesced => "coalesced",
        }
    }
}

/// A value that can revalidate itself more cheaply than being rebuilt.
#[async_trait]
pub trait SelfRefreshing: Send + Sync {
    /// Revalidate in place. Returns whether the content changed.
    async fn refresh(&self) -> Result<bool, MimirError>;
}

/// A single cached value guarded by its own refresh lock.
pub struct TtlCell<T> {
    value: ArcSwapOption<T>,
    /// Nanoseconds since `epoch` plus one, or `EXPIRED`
    created_at: AtomicU64,
    epoch: Instant,
    lock: Mutex<()>,
}

impl<T> TtlCell<T> {
    pub fn new() -> Self {
        Self {
            value: ArcSwapOption::empty(),
            created_at: AtomicU64::new(EXPIRED),
            epoch: Instant::now(),
            lock: Mutex::new(()),
        }
    }

    fn now_stamp(&self) -> u64 {
        let elapsed = self.epoch.elapsed().as_nanos();
        u64::try_from(elapsed)
            .unwrap_or(u64::MAX - 1)
            .saturating_add(1)
    }

    fn is_fresh(&self, ttl: Ttl, stamp: u64) -> bool {
        if stamp == EXPIRED {
            return false;
        }
        match ttl {
            Ttl::Forever => true,
            Ttl::Uncached => false,
            Ttl::Bounded(ttl) => {
                let age = self.now_stamp().saturating_sub(stamp);
                u128::from(age) <= ttl.as_nanos()
            }
        }
    }

    /// Force the next access to recompute, regardless of age. The current
    /// value stays visible to readers that already hold it.
    pub fn expire(&self) {
        self.created_at.store(EXPIRED, Ordering::Release);
    }

    /// The current value, without any staleness check.
    pub fn peek(&self) -> Option<Arc<T>> {
        self.value.load_full()
    }

    pub fn is_populated(&self) -> bool {
        self.value.load().is_some()
    }

    /// Core refresh protocol shared by both refresh strategies.
    ///
    /// `update` receives the previous value (if any) and returns the value to
    /// store plus whether it changed. On error nothing is stored and the cell
    /// stays eligible for the next attempt.
    async fn fetch_with<F, Fut, E>(&self, ttl: Ttl, update: F) -> Result<(Arc<T>, CellOutcome), E>
    where
        F: FnOnce(Option<Arc<T>>) -> Fut,
        Fut: Future<Output = Result<(Arc<T>, bool), E>>,
    {
        let observed = self.created_at.load(Ordering::Acquire);
        if self.is_fresh(ttl, observed) {
            if let Some(value) = self.value.load_full() {
                return Ok((value, CellOutcome::Hit));
            }
        }

        let _guard = self.lock.lock().await;

        // Someone else refreshed while we were queued on the lock
        let current = self.created_at.load(Ordering::Acquire);
        if current != EXPIRED && current != observed {
            if let Some(value) = self.value.load_full() {
                return Ok((value, CellOutcome::Coalesced));
            }
        }

        let previous = self.value.load_full();
        let (value, changed) = update(previous).await?;

        // Stamps strictly increase, even when the clock has not moved
        let stamp = self.now_stamp().max(current.saturating_add(1));

        // Value first, stamp second: a reader that sees the new stamp sees the new value.
        self.value.store(Some(value.clone()));
        self.created_at.store(stamp, Ordering::Release);

        let outcome = if changed {
            CellOutcome::Refreshed
        } else {
            CellOutcome::Revalidated
        };
        Ok((value, outcome))
    }

    /// Replace strategy: on staleness, build a brand-new value.
    pub async fn get<F, Fut, E>(&self, ttl: Ttl, updater: F) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.fetch(ttl, updater).await.map(|(value, _)| value)
    }

    /// Like [`TtlCell::get`], also reporting how the read was served.
    pub async fn fetch<F, Fut, E>(&self, ttl: Ttl, updater: F) -> Result<(Arc<T>, CellOutcome), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.fetch_with(ttl, |_previous| async move {
            updater().await.map(|value| (Arc::new(value), true))
        })
        .await
    }
}

impl<T: SelfRefreshing> TtlCell<T> {
    /// Mutate-in-place strategy: `create` runs only for the initial
    /// population; afterwards a stale cell asks its existing value to
    /// refresh itself and keeps the same allocation.
    pub async fn get_self_refreshing<F, Fut>(&self, ttl: Ttl, create: F) -> Result<Arc<T>, MimirError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, MimirError>>,
    {
        self.fetch_self_refreshing(ttl, create)
            .await
            .map(|(value, _)| value)
    }

    pub async fn fetch_self_refreshing<F, Fut>(
        &self,
        ttl: Ttl,
        create: F,
    ) -> Result<(Arc<T>, CellOutcome), MimirError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, MimirError>>,
    {
        self.fetch_with(ttl, |previous| async move {
            match previous {
                Some(value) => {
                    let changed = value.refresh().await?;
                    Ok((value, changed))
                }
                None => create().await.map(|value| (Arc::new(value), true)),
            }
        })
        .await
    }
}

impl<T> Default for TtlCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for TtlCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCell")
            .field("populated", &self.is_populated())
            .field("created_at", &self.created_at.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    async fn counted(counter: &AtomicUsize) -> Result<usize, MimirError> {
        Ok(counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    #[test]
    fn test_ttl_from_seconds() {
        assert_eq!(Ttl::from_seconds(-1), Ttl::Forever);
        assert_eq!(Ttl::from_seconds(0), Ttl::Uncached);
        assert_eq!(Ttl::from_seconds(5), Ttl::Bounded(Duration::from_secs(5)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stampede_on_empty_cell_runs_updater_once() {
        let cell = Arc::new(TtlCell::<usize>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let cell = cell.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    cell.get(Ttl::Bounded(Duration::from_secs(60)), || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, MimirError>(7)
                    })
                    .await
                })
            })
            .collect();

        for result in futures::future::join_all(tasks).await {
            assert_eq!(*result.unwrap().unwrap(), 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stampede_on_expired_cell_runs_updater_once() {
        let cell = Arc::new(TtlCell::<usize>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        cell.get(Ttl::Forever, || counted(&calls)).await.unwrap();
        cell.expire();

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let cell = cell.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    cell.get(Ttl::Forever, || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        counted(&calls).await
                    })
                    .await
                })
            })
            .collect();

        for result in futures::future::join_all(tasks).await {
            assert_eq!(*result.unwrap().unwrap(), 2);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stampede_on_aged_out_entry_runs_updater_once() {
        let cell = TtlCell::<usize>::new();
        let calls = AtomicUsize::new(0);
        let ttl = Ttl::Bounded(Duration::from_secs(10));

        cell.get(ttl, || counted(&calls)).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;

        let lookups = (0..32).map(|_| {
            cell.fetch(ttl, || async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                counted(&calls).await
            })
        });
        let results: Vec<_> = futures::future::join_all(lookups)
            .await
            .into_iter()
            .map(|result| result.unwrap())
            .collect();

        assert!(results.iter().all(|(value, _)| **value == 2));
        let refreshed = results
            .iter()
            .filter(|(_, outcome)| *outcome == CellOutcome::Refreshed)
            .count();
        let coalesced = results
            .iter()
            .filter(|(_, outcome)| *outcome == CellOutcome::Coalesced)
            .count();
        assert_eq!((refreshed, coalesced), (1, 31));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stampede_on_aged_out_entry_across_threads() {
        let cell = Arc::new(TtlCell::<usize>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let ttl = Ttl::Bounded(Duration::from_millis(200));

        cell.get(ttl, || counted(&calls)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let cell = cell.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    cell.get(ttl, || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        counted(&calls).await
                    })
                    .await
                })
            })
            .collect();

        for result in futures::future::join_all(tasks).await {
            assert_eq!(*result.unwrap().unwrap(), 2);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_ttl_window() {
        let cell = TtlCell::<usize>::new();
        let calls = AtomicUsize::new(0);
        let ttl = Ttl::Bounded(Duration::from_secs(10));

        let first = cell.get(ttl, || counted(&calls)).await.unwrap();

        tokio::time::advance(Duration::from_millis(9_999)).await;
        let second = cell.get(ttl, || counted(&calls)).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(2)).await;
        let third = cell.get(ttl, || counted(&calls)).await.unwrap();
        assert_eq!(*third, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let fourth = cell.get(ttl, || counted(&calls)).await.unwrap();
        assert!(Arc::ptr_eq(&third, &fourth));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forever_never_refreshes_until_expired() {
        let cell = TtlCell::<usize>::new();
        let calls = AtomicUsize::new(0);

        cell.get(Ttl::Forever, || counted(&calls)).await.unwrap();
        tokio::time::advance(Duration::from_secs(365 * 24 * 3600)).await;
        let value = cell.get(Ttl::Forever, || counted(&calls)).await.unwrap();
        assert_eq!(*value, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cell.expire();
        let value = cell.get(Ttl::Forever, || counted(&calls)).await.unwrap();
        assert_eq!(*value, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_forces_single_recompute_inside_window() {
        let cell = TtlCell::<usize>::new();
        let calls = AtomicUsize::new(0);
        let ttl = Ttl::Bounded(Duration::from_secs(60));

        cell.get(ttl, || counted(&calls)).await.unwrap();
        cell.expire();
        // Value survives expiry until the next access recomputes it
        assert_eq!(cell.peek().as_deref(), Some(&1));

        let (value, outcome) = cell.fetch(ttl, || counted(&calls)).await.unwrap();
        assert_eq!(*value, 2);
        assert_eq!(outcome, CellOutcome::Refreshed);

        let (_, outcome) = cell.fetch(ttl, || counted(&calls)).await.unwrap();
        assert_eq!(outcome, CellOutcome::Hit);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_uncached_refreshes_every_time() {
        let cell = TtlCell::<usize>::new();
        let calls = AtomicUsize::new(0);

        cell.get(Ttl::Uncached, || counted(&calls)).await.unwrap();
        cell.get(Ttl::Uncached, || counted(&calls)).await.unwrap();
        let value = cell.get(Ttl::Uncached, || counted(&calls)).await.unwrap();
        assert_eq!(*value, 3);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_value() {
        let cell = TtlCell::<usize>::new();

        cell.get(Ttl::Forever, || async { Ok::<_, MimirError>(1) })
            .await
            .unwrap();
        cell.expire();

        let failed = cell
            .get(Ttl::Forever, || async {
                Err::<usize, _>(MimirError::Parsing("broken".into()))
            })
            .await;
        assert!(matches!(failed, Err(MimirError::Parsing(_))));
        assert_eq!(cell.peek().as_deref(), Some(&1));

        // Still stale, so the next caller retries
        let value = cell
            .get(Ttl::Forever, || async { Ok::<_, MimirError>(2) })
            .await
            .unwrap();
        assert_eq!(*value, 2);
    }

    #[tokio::test]
    async fn test_failed_initial_population_leaves_cell_empty() {
        let cell = TtlCell::<usize>::new();
        let failed = cell
            .get(Ttl::Forever, || async {
                Err::<usize, _>(MimirError::Io("gone".into()))
            })
            .await;
        assert!(failed.is_err());
        assert!(!cell.is_populated());
    }

    struct Revalidating {
        refreshes: AtomicUsize,
    }

    #[async_trait]
    impl SelfRefreshing for Revalidating {
        async fn refresh(&self) -> Result<bool, MimirError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_self_refreshing_keeps_same_allocation() {
        let cell = TtlCell::<Revalidating>::new();
        let creates = AtomicUsize::new(0);
        let create = || async {
            creates.fetch_add(1, Ordering::SeqCst);
            Ok(Revalidating {
                refreshes: AtomicUsize::new(0),
            })
        };

        let first = cell.get_self_refreshing(Ttl::Forever, create).await.unwrap();
        cell.expire();
        let second = cell.get_self_refreshing(Ttl::Forever, create).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(creates.load(Ordering::SeqCst), 1);
        assert_eq!(second.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unchanged_self_refresh_reports_revalidated() {
        let cell = TtlCell::<Revalidating>::new();
        let create = || async {
            Ok(Revalidating {
                refreshes: AtomicUsize::new(0),
            })
        };

        let (_, outcome) = cell.fetch_self_refreshing(Ttl::Forever, create).await.unwrap();
        assert_eq!(outcome, CellOutcome::Refreshed);

        cell.expire();
        let (value, outcome) = cell.fetch_self_refreshing(Ttl::Forever, create).await.unwrap();
        assert_eq!(outcome, CellOutcome::Revalidated);
        assert_eq!(value.refreshes.load(Ordering::SeqCst), 1);

        let (_, outcome) = cell.fetch_self_refreshing(Ttl::Forever, create).await.unwrap();
        assert_eq!(outcome, CellOutcome::Hit);
    }
}
