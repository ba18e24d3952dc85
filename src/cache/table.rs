//! Concurrent key -> [`TtlCell`] map.
//!
//! Every cache layer stores its entries here. A key's cell is created exactly
//! once (under the shard lock of the underlying `DashMap`) and every later
//! lookup gets that same cell back, which is what makes the per-cell refresh
//! lock effective.
//!
//! Several tables may share a layer name (every parsed bundle owns its own
//! format table), so entry counts are reported as deltas: a table adds the
//! cells it creates and subtracts the ones it clears or drops.

use crate::cache::entry::{CellOutcome, SelfRefreshing, Ttl, TtlCell};
use crate::error::MimirError;
use crate::metrics::SharedMetrics;
use dashmap::DashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

pub struct KeyedCacheTable<K: Eq + Hash, T> {
    cells: DashMap<K, Arc<TtlCell<T>>>,
    layer: &'static str,
    metrics: SharedMetrics,
}

impl<K, T> KeyedCacheTable<K, T>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    pub fn new(layer: &'static str, metrics: SharedMetrics) -> Self {
        Self {
            cells: DashMap::new(),
            layer,
            metrics,
        }
    }

    pub fn layer(&self) -> &'static str {
        self.layer
    }

    /// The cell for `key`, materialized on first access.
    pub fn cell(&self, key: &K) -> Arc<TtlCell<T>> {
        if let Some(cell) = self.cells.get(key) {
            return cell.clone();
        }

        let mut created = false;
        let cell = self
            .cells
            .entry(key.clone())
            .or_insert_with(|| {
                created = true;
                Arc::new(TtlCell::new())
            })
            .clone();
        if created {
            self.metrics.add_entries(self.layer, 1);
        }
        cell
    }

    /// Replace-strategy lookup.
    pub async fn get<F, Fut, E>(&self, key: &K, ttl: Ttl, updater: F) -> Result<Arc<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let cell = self.cell(key);
        let start = Instant::now();
        let result = cell.fetch(ttl, updater).await;
        self.record(key, start, result.as_ref().map(|(_, outcome)| *outcome).ok());
        result.map(|(value, _)| value)
    }

    /// Force the next lookup of `key` to refresh.
    pub fn expire(&self, key: &K) {
        if let Some(cell) = self.cells.get(key) {
            cell.expire();
        }
    }

    /// Mark every cell stale without dropping values.
    pub fn expire_all(&self) {
        for cell in self.cells.iter() {
            cell.value().expire();
        }
    }

    /// Drop every cell. Callers already holding a value keep it.
    pub fn clear(&self) {
        let mut removed = 0i64;
        self.cells.retain(|_, _| {
            removed += 1;
            false
        });
        self.metrics.add_entries(self.layer, -removed);
    }

    /// Current value for `key` without refreshing.
    pub fn peek(&self, key: &K) -> Option<Arc<T>> {
        self.cells.get(key).and_then(|cell| cell.peek())
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    fn record(&self, key: &K, start: Instant, outcome: Option<CellOutcome>) {
        match outcome {
            Some(outcome) => {
                self.metrics.record_lookup(self.layer, outcome.as_str());
                if matches!(outcome, CellOutcome::Refreshed | CellOutcome::Revalidated) {
                    let elapsed = start.elapsed();
                    self.metrics
                        .record_refresh_duration(self.layer, elapsed.as_secs_f64());
                    debug!(
                        layer = self.layer,
                        cache_key = ?key,
                        outcome = outcome.as_str(),
                        duration_us = elapsed.as_micros() as u64,
                        "Cache entry refreshed"
                    );
                }
            }
            None => {
                self.metrics.record_refresh_failure(self.layer);
                debug!(layer = self.layer, cache_key = ?key, "Cache refresh failed");
            }
        }
    }
}

impl<K, T> KeyedCacheTable<K, T>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    T: SelfRefreshing,
{
    /// Mutate-in-place lookup: `create` runs once per cell, later staleness
    /// asks the existing value to refresh itself.
    pub async fn get_self_refreshing<F, Fut>(
        &self,
        key: &K,
        ttl: Ttl,
        create: F,
    ) -> Result<Arc<T>, MimirError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, MimirError>>,
    {
        let cell = self.cell(key);
        let start = Instant::now();
        let result = cell.fetch_self_refreshing(ttl, create).await;
        self.record(key, start, result.as_ref().map(|(_, outcome)| *outcome).ok());
        result.map(|(value, _)| value)
    }
}

impl<K: Eq + Hash, T> Drop for KeyedCacheTable<K, T> {
    fn drop(&mut self) {
        self.metrics.add_entries(self.layer, -(self.cells.len() as i64));
    }
}

impl<K: Eq + Hash, T> std::fmt::Debug for KeyedCacheTable<K, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedCacheTable")
            .field("layer", &self.layer)
            .field("entries", &self.cells.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::create_metrics;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_same_cell_per_key() {
        let table: KeyedCacheTable<String, u32> = KeyedCacheTable::new("test", create_metrics());
        let a = table.cell(&"a".to_string());
        let again = table.cell(&"a".to_string());
        let b = table.cell(&"b".to_string());

        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn test_keys_are_cached_independently() {
        let table: KeyedCacheTable<&'static str, usize> =
            KeyedCacheTable::new("test", create_metrics());
        let calls = AtomicUsize::new(0);
        let load = || async { Ok::<_, MimirError>(calls.fetch_add(1, Ordering::SeqCst)) };

        table.get(&"a", Ttl::Forever, load).await.unwrap();
        table.get(&"b", Ttl::Forever, load).await.unwrap();
        table.get(&"a", Ttl::Forever, load).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        table.expire(&"a");
        table.get(&"a", Ttl::Forever, load).await.unwrap();
        table.get(&"b", Ttl::Forever, load).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_clear_and_expire_all() {
        let table: KeyedCacheTable<u8, usize> = KeyedCacheTable::new("test", create_metrics());
        let calls = AtomicUsize::new(0);
        let load = || async { Ok::<_, MimirError>(calls.fetch_add(1, Ordering::SeqCst)) };

        table.get(&1, Ttl::Forever, load).await.unwrap();
        table.get(&2, Ttl::Forever, load).await.unwrap();

        table.expire_all();
        assert_eq!(table.peek(&1).as_deref(), Some(&0));
        table.get(&1, Ttl::Forever, load).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        table.clear();
        assert!(table.is_empty());
        assert!(table.peek(&1).is_none());
        table.get(&1, Ttl::Forever, load).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_lookups_are_counted_per_layer() {
        let metrics = create_metrics();
        let table: KeyedCacheTable<u8, u8> = KeyedCacheTable::new("widgets", metrics.clone());

        table
            .get(&1, Ttl::Forever, || async { Ok::<_, MimirError>(1) })
            .await
            .unwrap();
        table
            .get(&1, Ttl::Forever, || async { Ok::<_, MimirError>(1) })
            .await
            .unwrap();
        let _ = table
            .get(&2, Ttl::Forever, || async {
                Err::<u8, _>(MimirError::Io("nope".into()))
            })
            .await;

        let output = metrics.render();
        assert!(output.contains(r#"mimir_cache_lookups_total{layer="widgets",outcome="hit"} 1"#));
        assert!(output.contains(r#"mimir_cache_lookups_total{layer="widgets",outcome="refreshed"} 1"#));
        assert!(output.contains(r#"mimir_cache_refresh_failures_total{layer="widgets"} 1"#));
    }

    #[tokio::test]
    async fn test_revalidations_are_counted_separately() {
        struct Unchanged;

        #[async_trait::async_trait]
        impl SelfRefreshing for Unchanged {
            async fn refresh(&self) -> Result<bool, MimirError> {
                Ok(false)
            }
        }

        let metrics = create_metrics();
        let table: KeyedCacheTable<u8, Unchanged> = KeyedCacheTable::new("holders", metrics.clone());
        table
            .get_self_refreshing(&1, Ttl::Uncached, || async { Ok(Unchanged) })
            .await
            .unwrap();
        table
            .get_self_refreshing(&1, Ttl::Uncached, || async { Ok(Unchanged) })
            .await
            .unwrap();

        let output = metrics.render();
        assert!(output.contains(r#"mimir_cache_lookups_total{layer="holders",outcome="refreshed"} 1"#));
        assert!(output.contains(r#"mimir_cache_lookups_total{layer="holders",outcome="revalidated"} 1"#));
    }

    #[test]
    fn test_entry_gauge_summed_across_tables_of_one_layer() {
        let metrics = create_metrics();
        let gauge = |metrics: &SharedMetrics| {
            metrics
                .cache_entries
                .with_label_values(&["nested"])
                .get()
        };

        let first: KeyedCacheTable<u8, u8> = KeyedCacheTable::new("nested", metrics.clone());
        let second: KeyedCacheTable<u8, u8> = KeyedCacheTable::new("nested", metrics.clone());
        first.cell(&1);
        first.cell(&2);
        first.cell(&1);
        second.cell(&1);
        assert_eq!(gauge(&metrics), 3.0);

        drop(first);
        assert_eq!(gauge(&metrics), 1.0);

        second.clear();
        assert_eq!(gauge(&metrics), 0.0);
        assert!(format!("{:?}", second).contains("entries: 0"));
    }
}
