use crate::cache::{KeyedCacheTable, Ttl};
use crate::error::MimirError;
use crate::messages::format::MessageFormat;
use crate::messages::locale::Locale;
use crate::metrics::SharedMetrics;
use std::collections::HashMap;
use std::sync::Arc;

pub const FORMATS_LAYER: &str = "formats";

/// Parsed key/value pairs plus the formats compiled from them.
///
/// The two are never separated: content is swapped as a whole, and a fresh
/// `BundleContent` always starts with an empty format table. Formats are
/// cached forever relative to the content they were compiled from.
pub struct BundleContent {
    properties: HashMap<String, String>,
    formats: KeyedCacheTable<(String, Locale), MessageFormat>,
}

impl BundleContent {
    pub fn new(properties: HashMap<String, String>, metrics: SharedMetrics) -> Self {
        Self {
            properties,
            formats: KeyedCacheTable::new(FORMATS_LAYER, metrics),
        }
    }

    pub fn empty(metrics: SharedMetrics) -> Self {
        Self::new(HashMap::new(), metrics)
    }

    pub fn property(&self, code: &str) -> Option<&str> {
        self.properties.get(code).map(String::as_str)
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Compiled format for `code`, compiled on first use. Codes without a
    /// value give `None` and leave no entry behind.
    pub async fn message_format(
        &self,
        code: &str,
        locale: &Locale,
    ) -> Result<Option<Arc<MessageFormat>>, MimirError> {
        let Some(pattern) = self.properties.get(code) else {
            return Ok(None);
        };

        let key = (code.to_string(), locale.clone());
        self.formats
            .get(&key, Ttl::Forever, || async {
                MessageFormat::compile(pattern, locale)
            })
            .await
            .map(Some)
    }

    pub fn cached_formats(&self) -> usize {
        self.formats.len()
    }
}

impl std::fmt::Debug for BundleContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleContent")
            .field("properties", &self.properties.len())
            .field("formats", &self.formats.len())
            .finish()
    }
}
