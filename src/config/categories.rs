//! Built-in blocked-site categories.

use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Embedded category lists.
pub const CATEGORIES: &str = include_str!("../../config/categories.toml");

fn table() -> &'static BTreeMap<String, Vec<String>> {
    static TABLE: OnceLock<BTreeMap<String, Vec<String>>> = OnceLock::new();
    TABLE.get_or_init(|| match toml::from_str(CATEGORIES) {
        Ok(table) => table,
        Err(e) => {
            tracing::error!("Embedded category table is invalid: {}", e);
            BTreeMap::new()
        }
    })
}

/// Domains of a named category, or `None` if the category is unknown.
pub fn domains(category: &str) -> Option<Vec<String>> {
    table().get(&category.trim().to_ascii_lowercase()).cloned()
}

/// Names of all built-in categories.
pub fn names() -> Vec<&'static str> {
    table().keys().map(String::as_str).collect()
}
