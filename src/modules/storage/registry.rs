// Copyright © 2025 mailvault.dev
// Licensed under MailVault License Agreement v1.0
// Unauthorized copying, modification, or distribution is prohibited.

use crate::modules::error::code::ErrorCode;
use crate::modules::error::MailVaultResult;
use crate::modules::storage::memory::MemoryStorage;
use crate::modules::storage::sql::SqlStorage;
use crate::modules::storage::{Storage, StorageConfig};
use crate::raise_error;
use std::collections::HashMap;
use std::sync::Arc;

type Constructor = Arc<dyn Fn() -> Arc<dyn Storage> + Send + Sync>;

/// Engine constructors keyed by name. The registry is an explicit
/// value handed around by the pipeline's configuration step, so
/// initialization order is plain code rather than link-time magic.
pub struct StorageRegistry {
    engines: HashMap<String, Constructor>,
}

impl Default for StorageRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl StorageRegistry {
    pub fn empty() -> Self {
        StorageRegistry {
            engines: HashMap::new(),
        }
    }

    /// Registry with the two built-in engines, "memory" and "sql".
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register("memory", || MemoryStorage::new());
        registry.register("sql", || SqlStorage::new());
        registry
    }

    pub fn register<F, S>(&mut self, name: &str, constructor: F)
    where
        F: Fn() -> Arc<S> + Send + Sync + 'static,
        S: Storage + 'static,
    {
        self.engines.insert(
            name.to_string(),
            Arc::new(move || {
                let storage: Arc<dyn Storage> = constructor();
                storage
            }),
        );
    }

    pub fn names(&self) -> Vec<&str> {
        self.engines.keys().map(String::as_str).collect()
    }

    /// Construct and initialize the engine selected by the settings.
    pub async fn open_configured(&self) -> MailVaultResult<Arc<dyn Storage>> {
        let config = StorageConfig::from_settings();
        self.open(&crate::modules::settings::cli::SETTINGS.storage_engine, &config)
            .await
    }

    /// Construct and initialize the named engine.
    pub async fn open(
        &self,
        name: &str,
        config: &StorageConfig,
    ) -> MailVaultResult<Arc<dyn Storage>> {
        let constructor = self.engines.get(name).ok_or_else(|| {
            raise_error!(
                format!("unknown storage engine {:?}", name),
                ErrorCode::UnknownStorageEngine
            )
        })?;
        let storage = constructor();
        storage.initialize(config).await?;
        Ok(storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_carry_both_engines() {
        let registry = StorageRegistry::with_defaults();
        let mut names = registry.names();
        names.sort_unstable();
        assert_eq!(names, ["memory", "sql"]);
        let storage = registry
            .open("memory", &StorageConfig::default())
            .await
            .unwrap();
        assert!(storage.get_message(1).await.is_err());
    }

    #[tokio::test]
    async fn unknown_engine_is_an_error() {
        let registry = StorageRegistry::with_defaults();
        let result = registry.open("postcard", &StorageConfig::default()).await;
        let err = match result {
            Ok(_) => panic!("expected an error"),
            Err(err) => err,
        };
        assert_eq!(err.code(), ErrorCode::UnknownStorageEngine);
    }

    #[tokio::test]
    async fn custom_engines_can_be_registered() {
        let mut registry = StorageRegistry::empty();
        registry.register("memory2", || MemoryStorage::new());
        assert!(registry
            .open("memory2", &StorageConfig::default())
            .await
            .is_ok());
    }
}
