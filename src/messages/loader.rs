use crate::cache::{KeyedCacheTable, Ttl};
use crate::error::MimirError;
use crate::metrics::SharedMetrics;
use crate::services::bundles::{Encoding, ModificationMarker, SourceHandle, SourceLoader};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

pub const LOCATIONS_LAYER: &str = "locations";

/// Cached access to a [`SourceLoader`].
///
/// Locations are cached per filename for `cache_ttl`. Loading picks the
/// encoding configured for the filename and reports to the metrics.
pub struct BundleLoader {
    loader: Arc<dyn SourceLoader>,
    locations: KeyedCacheTable<String, Option<SourceHandle>>,
    cache_ttl: Ttl,
    file_cache_ttl: Ttl,
    default_encoding: Encoding,
    file_encodings: HashMap<String, Encoding>,
    metrics: SharedMetrics,
}

impl BundleLoader {
    pub fn new(
        loader: Arc<dyn SourceLoader>,
        cache_ttl: Ttl,
        file_cache_ttl: Ttl,
        default_encoding: Encoding,
        file_encodings: HashMap<String, Encoding>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            loader,
            locations: KeyedCacheTable::new(LOCATIONS_LAYER, metrics.clone()),
            cache_ttl,
            file_cache_ttl,
            default_encoding,
            file_encodings,
            metrics,
        }
    }

    pub fn cache_ttl(&self) -> Ttl {
        self.cache_ttl
    }

    pub fn file_cache_ttl(&self) -> Ttl {
        self.file_cache_ttl
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    pub fn encoding_for(&self, filename: &str) -> Encoding {
        self.file_encodings
            .get(filename)
            .copied()
            .unwrap_or(self.default_encoding)
    }

    /// Where `filename` currently lives, if anywhere.
    pub async fn locate(&self, filename: &str) -> Result<Option<SourceHandle>, MimirError> {
        let key = filename.to_string();
        let handle = self
            .locations
            .get(&key, self.cache_ttl, || self.loader.locate(filename))
            .await?;
        Ok(handle.as_ref().clone())
    }

    /// Locate `filename` again, bypassing and then replacing its cached
    /// location.
    pub async fn relocate(&self, filename: &str) -> Result<Option<SourceHandle>, MimirError> {
        self.locations.expire(&filename.to_string());
        self.locate(filename).await
    }

    /// The source's modification marker. A source that cannot report one is
    /// treated as having an unknown marker; a source that is gone is
    /// reported as [`MimirError::MissingSource`].
    pub async fn last_modified(
        &self,
        handle: &SourceHandle,
    ) -> Result<Option<ModificationMarker>, MimirError> {
        match self.loader.last_modified(handle).await {
            Ok(marker) => Ok(marker),
            Err(e @ MimirError::MissingSource(_)) => Err(e),
            Err(e) => {
                debug!(
                    location = %handle,
                    error = %e,
                    "Could not read modification marker, treating it as unknown"
                );
                Ok(None)
            }
        }
    }

    pub async fn load(
        &self,
        filename: &str,
        handle: &SourceHandle,
    ) -> Result<HashMap<String, String>, MimirError> {
        let encoding = self.encoding_for(filename);
        let start = Instant::now();
        let result = self.loader.load(handle, encoding).await;
        let elapsed = start.elapsed();

        let status = if result.is_ok() { "success" } else { "error" };
        self.metrics
            .record_source_load(handle.kind.as_str(), status, elapsed.as_secs_f64());

        match &result {
            Ok(properties) => debug!(
                location = %handle,
                encoding = encoding.as_str(),
                entries = properties.len(),
                duration_us = elapsed.as_micros() as u64,
                "Loaded bundle source"
            ),
            Err(e) => debug!(location = %handle, error = %e, "Failed to load bundle source"),
        }

        result
    }

    pub fn clear(&self) {
        self.locations.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::create_metrics;
    use crate::services::bundles::MemorySourceLoader;

    fn bundles(memory: Arc<MemorySourceLoader>, cache_ttl: Ttl) -> BundleLoader {
        let mut encodings = HashMap::new();
        encodings.insert("messages_ja".to_string(), Encoding::Utf8);
        BundleLoader::new(memory, cache_ttl, cache_ttl, Encoding::Latin1, encodings, create_metrics())
    }

    #[tokio::test]
    async fn test_locations_cached_until_cleared() {
        let memory = Arc::new(MemorySourceLoader::new());
        let bundles = bundles(memory.clone(), Ttl::Forever);

        assert!(bundles.locate("messages").await.unwrap().is_none());
        memory.insert("messages.properties", "a=1");
        assert!(bundles.locate("messages").await.unwrap().is_none());

        bundles.clear();
        assert!(bundles.locate("messages").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_uncached_locations_follow_the_source() {
        let memory = Arc::new(MemorySourceLoader::new());
        let bundles = bundles(memory.clone(), Ttl::Uncached);

        assert!(bundles.locate("messages").await.unwrap().is_none());
        memory.insert("messages.properties", "a=1");
        assert!(bundles.locate("messages").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_per_file_encoding() {
        let memory = Arc::new(MemorySourceLoader::new());
        memory.insert("messages_ja.properties", "greeting=こんにちは");
        memory.insert_bytes("messages_fr.properties", vec![b'a', b'=', 0xE9]);
        let bundles = bundles(memory, Ttl::Forever);

        let handle = bundles.locate("messages_ja").await.unwrap().unwrap();
        let props = bundles.load("messages_ja", &handle).await.unwrap();
        assert_eq!(props["greeting"], "こんにちは");

        let handle = bundles.locate("messages_fr").await.unwrap().unwrap();
        let props = bundles.load("messages_fr", &handle).await.unwrap();
        assert_eq!(props["a"], "é");
        assert_eq!(bundles.encoding_for("messages_fr"), Encoding::Latin1);
    }

    #[tokio::test]
    async fn test_marker_of_missing_source() {
        let memory = Arc::new(MemorySourceLoader::new());
        let bundles = bundles(memory, Ttl::Forever);
        let handle = SourceHandle::new("gone.properties", crate::services::bundles::SourceKind::Properties);
        assert!(matches!(
            bundles.last_modified(&handle).await,
            Err(MimirError::MissingSource(_))
        ));
    }

    #[tokio::test]
    async fn test_unreadable_marker_is_unknown() {
        let memory = Arc::new(MemorySourceLoader::new());
        memory.insert("messages.properties", "a=1");
        let bundles = bundles(memory.clone(), Ttl::Forever);
        let handle = bundles.locate("messages").await.unwrap().unwrap();

        memory.fail_next_marker("messages.properties", "permission denied");
        assert_eq!(bundles.last_modified(&handle).await.unwrap(), None);
        assert!(bundles.last_modified(&handle).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_relocate_replaces_cached_location() {
        let memory = Arc::new(MemorySourceLoader::new());
        memory.insert("messages.properties", "a=1");
        let bundles = bundles(memory.clone(), Ttl::Forever);
        assert!(bundles.locate("messages").await.unwrap().is_some());

        memory.remove("messages.properties");
        assert!(bundles.locate("messages").await.unwrap().is_some());
        assert!(bundles.relocate("messages").await.unwrap().is_none());
        assert!(bundles.locate("messages").await.unwrap().is_none());
    }
}
