use crate::cache::Ttl;
use crate::messages::locale::Locale;
use crate::messages::source::MessageSourceConfig;
use crate::services::bundles::Encoding;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

/// Default cache seconds: cache forever
const DEFAULT_CACHE_SECONDS: i64 = -1;

#[derive(Debug, Clone)]
pub struct BundlesConfig {
    pub basenames: Vec<String>,
    /// Replace `basenames` with those found under `base_dirs` at startup
    pub discover_basenames: bool,
    /// Consulted only for codes the primary basenames do not define
    pub fallback_basenames: Vec<String>,
    /// Roots searched in order for bundle files
    pub base_dirs: Vec<PathBuf>,
    pub default_encoding: Encoding,
    pub file_encodings: HashMap<String, Encoding>,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub cache_seconds: i64,
    /// Unset follows `cache_seconds`
    pub file_cache_seconds: Option<i64>,
    /// Unset follows `cache_seconds`
    pub fallback_cache_seconds: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct LocaleConfig {
    pub fallback_to_system_locale: bool,
    pub system_locale: Option<Locale>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bundles: BundlesConfig,
    pub cache: CacheConfig,
    pub locale: LocaleConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let basenames = lookup("MIMIR_BASENAMES")
            .map(|v| split_list(&v))
            .filter(|list| !list.is_empty())
            .unwrap_or_else(|| vec!["messages".to_string()]);

        let discover_basenames = lookup("MIMIR_DISCOVER_BASENAMES")
            .map(|v| parse_bool(&v))
            .unwrap_or(false);

        let fallback_basenames = lookup("MIMIR_FALLBACK_BASENAMES")
            .map(|v| split_list(&v))
            .unwrap_or_default();

        let base_dirs = lookup("MIMIR_BASE_DIRS")
            .map(|v| split_list(&v))
            .filter(|list| !list.is_empty())
            .unwrap_or_else(|| vec![".".to_string()])
            .into_iter()
            .map(PathBuf::from)
            .collect();

        let cache_seconds = match lookup("MIMIR_CACHE_SECONDS") {
            Some(v) => v
                .trim()
                .parse::<i64>()
                .with_context(|| format!("MIMIR_CACHE_SECONDS is not a number: {}", v))?,
            None => DEFAULT_CACHE_SECONDS,
        };

        let file_cache_seconds = optional_seconds(&lookup, "MIMIR_FILE_CACHE_SECONDS")?;
        let fallback_cache_seconds = optional_seconds(&lookup, "MIMIR_FALLBACK_CACHE_SECONDS")?;

        let fallback_to_system_locale = lookup("MIMIR_FALLBACK_TO_SYSTEM_LOCALE")
            .map(|v| parse_bool(&v))
            .unwrap_or(true);

        let system_locale = match lookup("MIMIR_SYSTEM_LOCALE") {
            Some(v) => Some(v.parse::<Locale>().context("Invalid MIMIR_SYSTEM_LOCALE")?),
            // An unusable LANG just means no system locale
            None => lookup("LANG").and_then(|v| Locale::from_posix(&v).ok()),
        }
        .filter(|locale| !locale.is_root());

        let default_encoding = lookup("MIMIR_DEFAULT_ENCODING")
            .map(|v| v.parse::<Encoding>())
            .transpose()
            .context("Invalid MIMIR_DEFAULT_ENCODING")?
            .unwrap_or_default();

        let file_encodings = match lookup("MIMIR_FILE_ENCODINGS") {
            Some(v) => parse_file_encodings(&v)?,
            None => HashMap::new(),
        };

        Ok(Self {
            bundles: BundlesConfig {
                basenames,
                discover_basenames,
                fallback_basenames,
                base_dirs,
                default_encoding,
                file_encodings,
            },
            cache: CacheConfig {
                cache_seconds,
                file_cache_seconds,
                fallback_cache_seconds,
            },
            locale: LocaleConfig {
                fallback_to_system_locale,
                system_locale,
            },
        })
    }

    pub fn to_message_source_config(&self) -> MessageSourceConfig {
        MessageSourceConfig {
            basenames: self.bundles.basenames.clone(),
            cache_ttl: Ttl::from_seconds(self.cache.cache_seconds),
            file_cache_ttl: self.cache.file_cache_seconds.map(Ttl::from_seconds),
            fallback_to_system_locale: self.locale.fallback_to_system_locale,
            system_locale: self.locale.system_locale.clone(),
            default_encoding: self.bundles.default_encoding,
            file_encodings: self.bundles.file_encodings.clone(),
            fallback_basenames: self.bundles.fallback_basenames.clone(),
            fallback_cache_ttl: self.cache.fallback_cache_seconds.map(Ttl::from_seconds),
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn optional_seconds<F>(lookup: &F, key: &str) -> Result<Option<i64>>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| {
            v.trim()
                .parse::<i64>()
                .with_context(|| format!("{} is not a number: {}", key, v))
        })
        .transpose()
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// `messages_ja=UTF-8,messages_de=ISO-8859-1`
fn parse_file_encodings(value: &str) -> Result<HashMap<String, Encoding>> {
    let mut encodings = HashMap::new();
    for pair in split_list(value) {
        let (filename, charset) = pair
            .split_once('=')
            .with_context(|| format!("Expected filename=charset in MIMIR_FILE_ENCODINGS, got '{}'", pair))?;
        let encoding = charset
            .trim()
            .parse::<Encoding>()
            .with_context(|| format!("Invalid encoding for {}", filename.trim()))?;
        encodings.insert(filename.trim().to_string(), encoding);
    }
    Ok(encodings)
}
