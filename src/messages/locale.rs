//! Locales and the locale fallback chain.
//!
//! Bundle sources are named `<basename>_<language>_<COUNTRY>_<variant>`,
//! dropping trailing parts for less specific variants. The fallback chain for
//! a lookup lists those names most-specific first, optionally followed by the
//! chain of the configured system locale, and always ends with the bare
//! basename.

use crate::error::MimirError;
use std::fmt;
use std::str::FromStr;

/// A language / country / variant triple.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Locale {
    language: String,
    country: String,
    variant: String,
}

impl Locale {
    /// Build a locale, normalizing language to lowercase and country to uppercase.
    pub fn new(language: &str, country: &str, variant: &str) -> Self {
        Self {
            language: language.to_lowercase(),
            country: country.to_uppercase(),
            variant: variant.to_string(),
        }
    }

    pub fn language_only(language: &str) -> Self {
        Self::new(language, "", "")
    }

    /// The empty locale; its fallback chain is just the basename.
    pub fn root() -> Self {
        Self::default()
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn country(&self) -> &str {
        &self.country
    }

    pub fn variant(&self) -> &str {
        &self.variant
    }

    pub fn is_root(&self) -> bool {
        self.language.is_empty() && self.country.is_empty() && self.variant.is_empty()
    }

    /// Parse a POSIX locale such as `de_DE.UTF-8@euro` (as found in `LANG`).
    /// `C` and `POSIX` map to the root locale.
    pub fn from_posix(value: &str) -> Result<Self, MimirError> {
        let name = value
            .split(&['.', '@'][..])
            .next()
            .unwrap_or_default()
            .trim();
        if name.eq_ignore_ascii_case("C") || name.eq_ignore_ascii_case("POSIX") {
            return Ok(Self::root());
        }
        name.parse()
    }
}

impl FromStr for Locale {
    type Err = MimirError;

    /// Accepts `de`, `de_DE`, `de-DE`, `de_AT_oo` and the empty string.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::root());
        }

        let normalized = s.replace('-', "_");
        let mut parts = normalized.splitn(3, '_');
        let language = parts.next().unwrap_or_default();
        let country = parts.next().unwrap_or_default();
        let variant = parts.next().unwrap_or_default();

        if !language.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(MimirError::Locale(format!("bad language in '{}'", s)));
        }
        if !country.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(MimirError::Locale(format!("bad country in '{}'", s)));
        }
        if !variant.is_empty() && language.is_empty() && country.is_empty() {
            return Err(MimirError::Locale(format!("variant without language or country in '{}'", s)));
        }

        Ok(Self::new(language, country, variant))
    }
}

impl fmt::Display for Locale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.language)?;
        if !self.country.is_empty() || !self.variant.is_empty() {
            write!(f, "_{}", self.country)?;
        }
        if !self.variant.is_empty() {
            write!(f, "_{}", self.variant)?;
        }
        Ok(())
    }
}

/// Locale-qualified filenames for one basename, most specific first.
///
/// `messages` + `de_AT_oo` gives `messages_de_AT_oo`, `messages_de_AT`,
/// `messages_de`. A country without a language keeps the empty slot
/// (`messages__US`).
pub fn filenames_for_locale(basename: &str, locale: &Locale) -> Vec<String> {
    let mut result = Vec::with_capacity(3);
    let mut name = String::from(basename);

    name.push('_');
    if !locale.language.is_empty() {
        name.push_str(&locale.language);
        result.push(name.clone());
    }

    name.push('_');
    if !locale.country.is_empty() {
        name.push_str(&locale.country);
        result.push(name.clone());
    }

    if !locale.variant.is_empty() && (!locale.language.is_empty() || !locale.country.is_empty()) {
        name.push('_');
        name.push_str(&locale.variant);
        result.push(name);
    }

    result.reverse();
    result
}

/// The full ordered candidate list for a lookup.
///
/// `system_locale` is the fallback locale when falling back to it is enabled;
/// its names are appended (without duplicates) when it differs from `locale`.
/// The bare basename is always last.
pub fn fallback_chain(basename: &str, locale: &Locale, system_locale: Option<&Locale>) -> Vec<String> {
    let mut filenames = filenames_for_locale(basename, locale);

    if let Some(system) = system_locale {
        if system != locale {
            for filename in filenames_for_locale(basename, system) {
                if !filenames.contains(&filename) {
                    filenames.push(filename);
                }
            }
        }
    }

    filenames.push(basename.to_string());
    filenames
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let locale: Locale = "de-at".parse().unwrap();
        assert_eq!(locale, Locale::new("de", "AT", ""));
        assert_eq!(locale.to_string(), "de_AT");

        let locale: Locale = "de_AT_oo".parse().unwrap();
        assert_eq!(locale.variant(), "oo");
        assert_eq!(locale.to_string(), "de_AT_oo");

        assert!("".parse::<Locale>().unwrap().is_root());
        assert!("d3".parse::<Locale>().is_err());
        assert_eq!(Locale::new("", "US", "").to_string(), "_US");
    }

    #[test]
    fn test_from_posix() {
        assert_eq!(Locale::from_posix("en_US.UTF-8").unwrap(), Locale::new("en", "US", ""));
        assert_eq!(Locale::from_posix("de_DE@euro").unwrap(), Locale::new("de", "DE", ""));
        assert!(Locale::from_posix("C").unwrap().is_root());
    }

    #[test]
    fn test_filenames_most_specific_first() {
        let names = filenames_for_locale("messages", &Locale::new("de", "AT", "oo"));
        assert_eq!(names, vec!["messages_de_AT_oo", "messages_de_AT", "messages_de"]);

        let names = filenames_for_locale("messages", &Locale::language_only("en"));
        assert_eq!(names, vec!["messages_en"]);

        let names = filenames_for_locale("messages", &Locale::new("", "US", ""));
        assert_eq!(names, vec!["messages__US"]);

        assert!(filenames_for_locale("messages", &Locale::root()).is_empty());
    }

    #[test]
    fn test_fallback_chain_ends_with_basename() {
        let chain = fallback_chain("i18n/messages", &Locale::new("de", "DE", ""), None);
        assert_eq!(chain, vec!["i18n/messages_de_DE", "i18n/messages_de", "i18n/messages"]);
    }

    #[test]
    fn test_fallback_chain_appends_system_locale_without_duplicates() {
        let system = Locale::new("de", "AT", "");
        let chain = fallback_chain("messages", &Locale::new("de", "DE", ""), Some(&system));
        assert_eq!(
            chain,
            vec!["messages_de_DE", "messages_de", "messages_de_AT", "messages"]
        );

        // Same locale as the system one: nothing extra
        let chain = fallback_chain("messages", &system, Some(&system));
        assert_eq!(chain, vec!["messages_de_AT", "messages_de", "messages"]);
    }
}
