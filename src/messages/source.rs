//! The reloadable message source.
//!
//! Lookups go through these cache layers, each a [`KeyedCacheTable`]:
//!
//! - candidates: per (basename, locale), the fallback chain with the location
//!   each filename resolved to
//! - properties: per filename, a self-refreshing [`PropertiesHolder`]
//! - merged: per locale, every basename and fallback variant flattened into
//!   one view (only when `cache_ttl` is forever)
//! - fallback: per locale, the merged view of the fallback bundles
//! - formats: per content entry, compiled message formats
//!
//! With a bounded `cache_ttl` the merged view is skipped and each lookup
//! walks basenames in declared order and their fallback chains most specific
//! first, returning the first hit. Both modes give the same precedence.
//!
//! Codes that none of the basenames define are looked up in the fallback
//! bundles, always through a per-locale merged view of their own that is
//! kept for `fallback_cache_ttl`.

use crate::cache::{KeyedCacheTable, Ttl};
use crate::error::MimirError;
use crate::messages::content::BundleContent;
use crate::messages::format::MessageFormat;
use crate::messages::holder::PropertiesHolder;
use crate::messages::loader::BundleLoader;
use crate::messages::locale::{fallback_chain, Locale};
use crate::metrics::SharedMetrics;
use crate::services::bundles::{Encoding, SourceHandle, SourceLoader};
use futures::future::try_join_all;
use std::collections::{BTreeSet, HashMap};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

pub const CANDIDATES_LAYER: &str = "candidates";
pub const PROPERTIES_LAYER: &str = "properties";
pub const MERGED_LAYER: &str = "merged";
pub const FALLBACK_LAYER: &str = "fallback";

#[derive(Debug, Clone)]
pub struct MessageSourceConfig {
    /// Bundle basenames, highest precedence first
    pub basenames: Vec<String>,
    /// Candidate lists, locations and the merged view. `Forever` selects
    /// merged-view lookups.
    pub cache_ttl: Ttl,
    /// How often parsed files are revalidated; `None` follows `cache_ttl`
    pub file_cache_ttl: Option<Ttl>,
    pub fallback_to_system_locale: bool,
    pub system_locale: Option<Locale>,
    /// Encoding for `.properties` files without an override
    pub default_encoding: Encoding,
    /// Per-filename overrides, keyed by locale-qualified filename (`messages_ja`)
    pub file_encodings: HashMap<String, Encoding>,
    /// Bundles consulted only for codes that `basenames` do not define
    pub fallback_basenames: Vec<String>,
    /// How long merged fallback views are kept; `None` follows `cache_ttl`
    pub fallback_cache_ttl: Option<Ttl>,
}

impl Default for MessageSourceConfig {
    fn default() -> Self {
        Self {
            basenames: vec!["messages".to_string()],
            cache_ttl: Ttl::Forever,
            file_cache_ttl: None,
            fallback_to_system_locale: true,
            system_locale: None,
            default_encoding: Encoding::default(),
            file_encodings: HashMap::new(),
            fallback_basenames: Vec::new(),
            fallback_cache_ttl: None,
        }
    }
}

impl MessageSourceConfig {
    pub fn file_cache_ttl(&self) -> Ttl {
        self.file_cache_ttl.unwrap_or(self.cache_ttl)
    }

    pub fn fallback_cache_ttl(&self) -> Ttl {
        self.fallback_cache_ttl.unwrap_or(self.cache_ttl)
    }
}

/// One step of a fallback chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub filename: String,
    pub handle: Option<SourceHandle>,
}

/// A list of bundles for one locale, flattened by precedence.
#[derive(Debug)]
pub struct MergedView {
    pub locale: Locale,
    pub content: BundleContent,
    /// Contributing filenames, in the order they were applied
    pub sources: Vec<String>,
}

pub struct ReloadableMessageSource {
    config: MessageSourceConfig,
    bundles: Arc<BundleLoader>,
    candidates: KeyedCacheTable<(String, Locale), Vec<Candidate>>,
    properties: KeyedCacheTable<String, PropertiesHolder>,
    merged: KeyedCacheTable<Locale, MergedView>,
    fallback: KeyedCacheTable<Locale, MergedView>,
    parent: Option<Arc<ReloadableMessageSource>>,
    metrics: SharedMetrics,
}

impl ReloadableMessageSource {
    pub fn new(
        mut config: MessageSourceConfig,
        loader: Arc<dyn SourceLoader>,
        metrics: SharedMetrics,
    ) -> Result<Self, MimirError> {
        normalize_basenames(&mut config.basenames)?;
        normalize_basenames(&mut config.fallback_basenames)?;

        let bundles = Arc::new(BundleLoader::new(
            loader,
            config.cache_ttl,
            config.file_cache_ttl(),
            config.default_encoding,
            config.file_encodings.clone(),
            metrics.clone(),
        ));

        Ok(Self {
            candidates: KeyedCacheTable::new(CANDIDATES_LAYER, metrics.clone()),
            properties: KeyedCacheTable::new(PROPERTIES_LAYER, metrics.clone()),
            merged: KeyedCacheTable::new(MERGED_LAYER, metrics.clone()),
            fallback: KeyedCacheTable::new(FALLBACK_LAYER, metrics.clone()),
            bundles,
            config,
            parent: None,
            metrics,
        })
    }

    /// Consulted by [`ReloadableMessageSource::resolve_message`] for codes
    /// this source does not define.
    pub fn with_parent(mut self, parent: Arc<ReloadableMessageSource>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn parent(&self) -> Option<&Arc<ReloadableMessageSource>> {
        self.parent.as_ref()
    }

    pub fn config(&self) -> &MessageSourceConfig {
        &self.config
    }

    fn merged_mode(&self) -> bool {
        self.config.cache_ttl.is_forever()
    }

    /// Raw text for `code`, without argument formatting.
    pub async fn resolve_text(&self, code: &str, locale: &Locale) -> Result<Option<String>, MimirError> {
        let start = Instant::now();
        let result = self.lookup_text(code, locale).await;
        self.observe("text", start, &result);
        result
    }

    /// Compiled format for `code`.
    pub async fn resolve_format(
        &self,
        code: &str,
        locale: &Locale,
    ) -> Result<Option<Arc<MessageFormat>>, MimirError> {
        let start = Instant::now();
        let result = self.lookup_format(code, locale).await;
        self.observe("format", start, &result);
        result
    }

    /// Text for `code` (formatted when `args` is non-empty), falling back
    /// through the parent chain.
    pub async fn resolve_message<A>(
        &self,
        code: &str,
        args: &[A],
        locale: &Locale,
    ) -> Result<Option<String>, MimirError>
    where
        A: Display + Sync,
    {
        let mut source = Some(self);
        while let Some(current) = source {
            let resolved = if args.is_empty() {
                current.resolve_text(code, locale).await?
            } else {
                current
                    .resolve_format(code, locale)
                    .await?
                    .map(|format| format.format(args))
            };
            if resolved.is_some() {
                return Ok(resolved);
            }
            source = current.parent.as_deref();
        }
        Ok(None)
    }

    /// Every code defined for `locale` by the given basenames. Basenames
    /// that are not configured on this source, as primary or fallback
    /// bundles, are ignored.
    pub async fn bundle_codes(&self, locale: &Locale, basenames: &[&str]) -> Result<BTreeSet<String>, MimirError> {
        let mut codes = BTreeSet::new();
        for basename in self
            .config
            .basenames
            .iter()
            .chain(&self.config.fallback_basenames)
            .filter(|configured| basenames.contains(&configured.as_str()))
        {
            let candidates = self.candidates_for(basename, locale).await?;
            for candidate in candidates.iter().filter(|c| c.handle.is_some()) {
                let holder = self.holder_for(candidate).await?;
                codes.extend(holder.content().codes().map(str::to_string));
            }
        }
        Ok(codes)
    }

    /// Drop every cached layer. Values already handed out stay valid.
    pub fn clear_cache(&self) {
        info!(basenames = ?self.config.basenames, "Clearing entire message bundle cache");
        self.candidates.clear();
        self.properties.clear();
        self.merged.clear();
        self.fallback.clear();
        self.bundles.clear();
        self.metrics.record_clear();
    }

    pub fn clear_cache_including_ancestors(&self) {
        let mut source = Some(self);
        while let Some(current) = source {
            current.clear_cache();
            source = current.parent.as_deref();
        }
    }

    async fn lookup_text(&self, code: &str, locale: &Locale) -> Result<Option<String>, MimirError> {
        if let Some(text) = self.primary_text(code, locale).await? {
            return Ok(Some(text));
        }
        if self.config.fallback_basenames.is_empty() {
            return Ok(None);
        }
        let view = self.fallback_view(locale).await?;
        Ok(view.content.property(code).map(str::to_string))
    }

    async fn lookup_format(
        &self,
        code: &str,
        locale: &Locale,
    ) -> Result<Option<Arc<MessageFormat>>, MimirError> {
        if let Some(format) = self.primary_format(code, locale).await? {
            return Ok(Some(format));
        }
        if self.config.fallback_basenames.is_empty() {
            return Ok(None);
        }
        let view = self.fallback_view(locale).await?;
        view.content.message_format(code, locale).await
    }

    async fn primary_text(&self, code: &str, locale: &Locale) -> Result<Option<String>, MimirError> {
        if self.merged_mode() {
            let view = self.merged_view(locale).await?;
            return Ok(view.content.property(code).map(str::to_string));
        }

        for basename in &self.config.basenames {
            let candidates = self.candidates_for(basename, locale).await?;
            for candidate in candidates.iter().filter(|c| c.handle.is_some()) {
                let holder = self.holder_for(candidate).await?;
                if let Some(text) = holder.content().property(code) {
                    return Ok(Some(text.to_string()));
                }
            }
        }
        Ok(None)
    }

    async fn primary_format(
        &self,
        code: &str,
        locale: &Locale,
    ) -> Result<Option<Arc<MessageFormat>>, MimirError> {
        if self.merged_mode() {
            let view = self.merged_view(locale).await?;
            return view.content.message_format(code, locale).await;
        }

        for basename in &self.config.basenames {
            let candidates = self.candidates_for(basename, locale).await?;
            for candidate in candidates.iter().filter(|c| c.handle.is_some()) {
                let holder = self.holder_for(candidate).await?;
                if let Some(format) = holder.content().message_format(code, locale).await? {
                    return Ok(Some(format));
                }
            }
        }
        Ok(None)
    }

    /// The fallback chain for `basename`, each filename resolved to a location.
    async fn candidates_for(&self, basename: &str, locale: &Locale) -> Result<Arc<Vec<Candidate>>, MimirError> {
        let key = (basename.to_string(), locale.clone());
        self.candidates
            .get(&key, self.config.cache_ttl, || async {
                let system_locale = if self.config.fallback_to_system_locale {
                    self.config.system_locale.as_ref()
                } else {
                    None
                };

                let mut candidates = Vec::new();
                for filename in fallback_chain(basename, locale, system_locale) {
                    let handle = self.bundles.locate(&filename).await?;
                    candidates.push(Candidate { filename, handle });
                }
                Ok::<_, MimirError>(candidates)
            })
            .await
    }

    async fn holder_for(&self, candidate: &Candidate) -> Result<Arc<PropertiesHolder>, MimirError> {
        self.properties
            .get_self_refreshing(&candidate.filename, self.config.file_cache_ttl(), || {
                PropertiesHolder::load(
                    candidate.filename.clone(),
                    candidate.handle.clone(),
                    self.bundles.clone(),
                )
            })
            .await
    }

    async fn merged_view(&self, locale: &Locale) -> Result<Arc<MergedView>, MimirError> {
        self.merged
            .get(locale, self.config.cache_ttl, || {
                self.build_merged_view(locale, &self.config.basenames)
            })
            .await
    }

    async fn fallback_view(&self, locale: &Locale) -> Result<Arc<MergedView>, MimirError> {
        self.fallback
            .get(locale, self.config.fallback_cache_ttl(), || {
                self.build_merged_view(locale, &self.config.fallback_basenames)
            })
            .await
    }

    async fn build_merged_view(&self, locale: &Locale, basenames: &[String]) -> Result<MergedView, MimirError> {
        // Priority is (basename position, position in fallback chain); smaller wins.
        let mut layers = Vec::new();
        for (rank, basename) in basenames.iter().enumerate() {
            let candidates = self.candidates_for(basename, locale).await?;
            for (specificity, candidate) in candidates.iter().enumerate() {
                if candidate.handle.is_some() {
                    layers.push(((rank, specificity), candidate.clone()));
                }
            }
        }

        let holders = try_join_all(layers.iter().map(|(_, candidate)| self.holder_for(candidate))).await?;
        let mut ordered: Vec<_> = layers
            .into_iter()
            .map(|(priority, _)| priority)
            .zip(holders)
            .collect();

        // Lowest priority first so that higher priorities overwrite
        ordered.sort_by(|a, b| b.0.cmp(&a.0));

        let mut properties = HashMap::new();
        let mut sources = Vec::with_capacity(ordered.len());
        for (_, holder) in ordered {
            let content = holder.content();
            properties.extend(
                content
                    .properties()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
            sources.push(holder.filename().to_string());
        }

        debug!(
            locale = %locale,
            sources = sources.len(),
            entries = properties.len(),
            "Built merged message view"
        );

        Ok(MergedView {
            locale: locale.clone(),
            content: BundleContent::new(properties, self.metrics.clone()),
            sources,
        })
    }

    fn observe<T>(&self, kind: &str, start: Instant, result: &Result<Option<T>, MimirError>) {
        let status = match result {
            Ok(Some(_)) => "found",
            Ok(None) => "not_found",
            Err(_) => "error",
        };
        self.metrics
            .record_resolution(kind, status, start.elapsed().as_secs_f64());
    }
}

fn normalize_basenames(basenames: &mut [String]) -> Result<(), MimirError> {
    for basename in basenames.iter_mut() {
        let trimmed = basename.trim();
        if trimmed.is_empty() {
            return Err(MimirError::Config("basename must not be empty".to_string()));
        }
        *basename = trimmed.to_string();
    }
    Ok(())
}

impl std::fmt::Debug for ReloadableMessageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReloadableMessageSource")
            .field("basenames", &self.config.basenames)
            .field("fallback_basenames", &self.config.fallback_basenames)
            .field("cache_ttl", &self.config.cache_ttl)
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}
