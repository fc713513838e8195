//! Shared handles injected into every request handler.

use crate::{
    config::AppConfig,
    services::{metadata_index::MetadataIndex, multipart_registry::MultipartRegistry},
};
use std::sync::Arc;

/// Constructed once at start-up and cloned into each handler by axum.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub index: MetadataIndex,
    pub registry: MultipartRegistry,
}

impl AppState {
    pub fn new(config: AppConfig, index: MetadataIndex) -> Self {
        let registry = MultipartRegistry::new(
            config.temp_dir.clone(),
            config.storage_dir.clone(),
            config.multipart_ttl,
        );
        Self {
            config: Arc::new(config),
            index,
            registry,
        }
    }
}
