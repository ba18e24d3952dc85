//! Locale-aware message resolution on top of the cache layers.

pub mod content;
pub mod format;
pub mod holder;
pub mod loader;
pub mod locale;
pub mod source;

pub use content::BundleContent;
pub use format::MessageFormat;
pub use holder::PropertiesHolder;
pub use loader::BundleLoader;
pub use locale::{fallback_chain, filenames_for_locale, Locale};
pub use source::{Candidate, MergedView, MessageSourceConfig, ReloadableMessageSource};
