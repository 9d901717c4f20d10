use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};

/// Tables shipped with the binary. Overridden by a `[catalog]` section.
const EMBEDDED_CATALOG: &str = include_str!("../../catalog.toml");

/// Category assigned to connectors missing from the category table.
pub const FALLBACK_CATEGORY: &str = "Other";

/// Connector enrichment data used by the catalog service.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CatalogTables {
    /// connector id → category
    #[serde(default)]
    pub categories: BTreeMap<String, String>,
    /// Connector ids flagged as popular
    #[serde(default)]
    pub popular: BTreeSet<String>,
    /// connector id → feature list
    #[serde(default)]
    pub features: BTreeMap<String, Vec<String>>,
    /// Features used when neither upstream nor `features` has any
    #[serde(default = "default_features")]
    pub default_features: Vec<String>,
}

fn default_features() -> Vec<String> {
    vec![
        "Secure connection".to_string(),
        "Real-time sync".to_string(),
        "Automated workflows".to_string(),
    ]
}

impl CatalogTables {
    /// Parses tables from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// The tables embedded at build time.
    ///
    /// Falls back to empty tables with the generic feature list if the
    /// embedded file fails to parse.
    pub fn embedded() -> Self {
        Self::from_toml(EMBEDDED_CATALOG).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Embedded catalog tables are malformed, using empty tables");
            Self::empty()
        })
    }

    pub fn empty() -> Self {
        Self {
            categories: BTreeMap::new(),
            popular: BTreeSet::new(),
            features: BTreeMap::new(),
            default_features: default_features(),
        }
    }

    pub fn category_for(&self, connector_id: &str) -> &str {
        self.categories
            .get(connector_id)
            .map(String::as_str)
            .unwrap_or(FALLBACK_CATEGORY)
    }

    pub fn is_popular(&self, connector_id: &str) -> bool {
        self.popular.contains(connector_id)
    }

    pub fn features_for(&self, connector_id: &str) -> Vec<String> {
        self.features
            .get(connector_id)
            .cloned()
            .unwrap_or_else(|| self.default_features.clone())
    }
}

impl Default for CatalogTables {
    fn default() -> Self {
        Self::embedded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_tables_parse() {
        let tables = CatalogTables::from_toml(EMBEDDED_CATALOG).unwrap();
        assert_eq!(tables.category_for("gmail"), "Communication");
        assert!(tables.is_popular("gmail"));
        assert_eq!(tables.default_features.len(), 3);
    }

    #[test]
    fn test_fallbacks() {
        let tables = CatalogTables::embedded();
        assert_eq!(tables.category_for("unknown-svc"), FALLBACK_CATEGORY);
        assert!(!tables.is_popular("unknown-svc"));
        assert_eq!(tables.features_for("unknown-svc"), tables.default_features);
    }

    #[test]
    fn test_partial_override() {
        let tables = CatalogTables::from_toml(
            r#"
            popular = ["linear"]

            [categories]
            linear = "Engineering"
        "#,
        )
        .unwrap();

        assert_eq!(tables.category_for("linear"), "Engineering");
        assert!(tables.is_popular("linear"));
        assert_eq!(tables.category_for("gmail"), FALLBACK_CATEGORY);
        assert_eq!(tables.default_features, default_features());
    }
}
