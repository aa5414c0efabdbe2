use serde::{Deserialize, Serialize};

/// Tunables for the catalog store backing media/part lookups (spec §2.1).
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CatalogConfig {
    /// When true, use the in-memory `StaticCatalogStore` seeded from
    /// `static_catalog_path` instead of the sqlite-backed store.
    #[serde(default)]
    pub r#static: bool,
    #[serde(default = "default_static_catalog_path")]
    pub static_catalog_path: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            r#static: false,
            static_catalog_path: default_static_catalog_path(),
            database_url: default_database_url(),
        }
    }
}

fn default_static_catalog_path() -> String {
    "catalog.json".to_string()
}

fn default_database_url() -> String {
    "sqlite://catalog.db".to_string()
}
