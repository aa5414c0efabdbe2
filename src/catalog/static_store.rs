use std::collections::HashMap;

use async_trait::async_trait;

use crate::common::types::MediaId;

use super::{CatalogError, CatalogStore, Media};

/// `CatalogStore` backed by an in-memory map, seeded once at startup.
/// Intended for local development and tests where standing up sqlite is
/// unnecessary overhead.
#[derive(Default)]
pub struct StaticCatalogStore {
    media: HashMap<MediaId, Media>,
}

impl StaticCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, media: Media) {
        self.media.insert(media.id, media);
    }

    pub fn with_media(mut self, media: Media) -> Self {
        self.insert(media);
        self
    }

    /// Loads a JSON array of `Media` from `path`, as configured by
    /// `CatalogConfig::static_catalog_path`.
    pub fn load_from_file(path: &str) -> std::io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let items: Vec<Media> = serde_json::from_str(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut store = Self::new();
        for media in items {
            store.insert(media);
        }
        Ok(store)
    }
}

#[async_trait]
impl CatalogStore for StaticCatalogStore {
    async fn get_media(&self, media_id: MediaId) -> Result<Option<Media>, CatalogError> {
        Ok(self.media.get(&media_id).cloned())
    }
}
