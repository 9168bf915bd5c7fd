//! Translation lookup for field labels, help texts and selection labels.
//!
//! Keys are `"<Field>.string"`, `"<Field>.help"` and
//! `"<Field>.selection.<key>"`, scoped by model name:
//!
//! ```ignore
//! let catalog = StaticCatalog::new()
//!     .add("fr_FR", "User", "Name.string", "Nom");
//! builder.set_translator(Arc::new(catalog));
//! ```

use std::collections::HashMap;

/// A translation source. Returns `fallback` when it has no entry.
pub trait Translator: Send + Sync + 'static {
    fn translate(&self, lang: &str, model: &str, key: &str, fallback: &str) -> String;
}

/// Convenience: closures implement Translator.
impl<F> Translator for F
where
    F: Fn(&str, &str, &str, &str) -> String + Send + Sync + 'static,
{
    fn translate(&self, lang: &str, model: &str, key: &str, fallback: &str) -> String {
        (self)(lang, model, key, fallback)
    }
}

/// Translator that always returns the fallback.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTranslation;

impl Translator for NoTranslation {
    fn translate(&self, _lang: &str, _model: &str, _key: &str, fallback: &str) -> String {
        fallback.to_string()
    }
}

/// In-memory catalog keyed by (lang, model, key).
#[derive(Debug, Default, Clone)]
pub struct StaticCatalog {
    entries: HashMap<(String, String, String), String>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, lang: &str, model: &str, key: &str, text: &str) -> Self {
        self.entries.insert(
            (lang.to_string(), model.to_string(), key.to_string()),
            text.to_string(),
        );
        self
    }
}

impl Translator for StaticCatalog {
    fn translate(&self, lang: &str, model: &str, key: &str, fallback: &str) -> String {
        self.entries
            .get(&(lang.to_string(), model.to_string(), key.to_string()))
            .cloned()
            .unwrap_or_else(|| fallback.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_lookup_with_fallback() {
        let catalog = StaticCatalog::new().add("fr_FR", "User", "Name.string", "Nom");
        assert_eq!(catalog.translate("fr_FR", "User", "Name.string", "Name"), "Nom");
        assert_eq!(catalog.translate("de_DE", "User", "Name.string", "Name"), "Name");
        assert_eq!(NoTranslation.translate("fr_FR", "User", "x", "y"), "y");
    }

    #[test]
    fn closures_are_translators() {
        let upper = |_: &str, _: &str, _: &str, fallback: &str| fallback.to_uppercase();
        assert_eq!(upper.translate("en_US", "Tag", "Name.string", "name"), "NAME");
    }
}
