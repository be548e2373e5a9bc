//! Configuration for opening a [`Table`](crate::Table).

use common::StorageConfig;
use common::storage::config::{
    AwsObjectStoreConfig, LocalObjectStoreConfig, ObjectStoreConfig, SlateDbStorageConfig,
};
use serde::Deserialize;

use crate::codec::MAX_CHUNK_SIZE;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::settings::Settings;

fn default_page_size() -> usize {
    256
}

fn default_max_chunk_size() -> usize {
    MAX_CHUNK_SIZE
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Config {
    /// Name of the table inside the storage. Several tables may share one
    /// storage.
    pub table_name: String,

    /// Storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Rows evaluated per page when a table operation walks all pages.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Largest slice of a fat field written to one row.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,

    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Config {
    /// In-memory table with default settings.
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            storage: StorageConfig::default(),
            page_size: default_page_size(),
            max_chunk_size: default_max_chunk_size(),
            retry: RetryPolicy::default(),
        }
    }

    /// Builds a config from flat settings.
    ///
    /// `table_name` is required. Optional: `page_size`, `max_chunk_size`,
    /// `max_retries`, `retry_base_delay_ms`, and a SlateDB backend selected by
    /// `storage_path`, stored under `object_store_path` on the local
    /// filesystem, in the `aws_bucket` of `aws_region`, or in memory.
    /// `slatedb_settings_path` points at a SlateDB settings file.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let mut config = Self::new(settings.require("table_name")?);
        if let Some(page_size) = settings.parse("page_size")? {
            config.page_size = page_size;
        }
        if let Some(max_chunk_size) = settings.parse("max_chunk_size")? {
            config.max_chunk_size = max_chunk_size;
        }
        if let Some(max_retries) = settings.parse("max_retries")? {
            config.retry.max_retries = max_retries;
        }
        if let Some(delay_ms) = settings.parse::<u64>("retry_base_delay_ms")? {
            config.retry.base_delay = std::time::Duration::from_millis(delay_ms);
        }
        if let Some(path) = settings.get("storage_path") {
            let object_store = match (
                settings.get("object_store_path"),
                settings.get("aws_bucket"),
            ) {
                (Some(local), _) => ObjectStoreConfig::Local(LocalObjectStoreConfig {
                    path: local.to_string(),
                }),
                (None, Some(bucket)) => ObjectStoreConfig::Aws(AwsObjectStoreConfig {
                    region: settings.require("aws_region")?.to_string(),
                    bucket: bucket.to_string(),
                }),
                (None, None) => ObjectStoreConfig::InMemory,
            };
            config.storage = StorageConfig::SlateDb(SlateDbStorageConfig {
                path: path.to_string(),
                object_store,
                settings_path: settings.get("slatedb_settings_path").map(str::to_string),
            });
        }
        config.validate()?;
        Ok(config)
    }

    /// Checks the values a table cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.table_name.is_empty() {
            return Err(Error::InvalidInput("table name must not be empty".to_string()));
        }
        if self.page_size == 0 {
            return Err(Error::InvalidInput(
                "page size must be greater than zero".to_string(),
            ));
        }
        if self.max_chunk_size == 0 || self.max_chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidInput(format!(
                "max chunk size must be between 1 and {}, got {}",
                MAX_CHUNK_SIZE, self.max_chunk_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn should_require_table_name() {
        let settings = Settings::from_vars([("PAGE_SIZE", "10")]);

        let result = Config::from_settings(&settings);

        assert_eq!(result, Err(Error::ConfigNotSet("TABLE_NAME".to_string())));
    }

    #[test]
    fn should_default_optional_settings() {
        let settings = Settings::from_vars([("TABLE_NAME", "articles")]);

        let config = Config::from_settings(&settings).unwrap();

        assert_eq!(config, Config::new("articles"));
        assert_eq!(config.page_size, 256);
        assert_eq!(config.max_chunk_size, 399_360);
        assert_eq!(config.storage, StorageConfig::InMemory);
    }

    #[test]
    fn should_read_optional_settings() {
        // given
        let settings = Settings::from_vars([
            ("TABLE_NAME", "articles"),
            ("PAGE_SIZE", "50"),
            ("MAX_CHUNK_SIZE", "1024"),
            ("MAX_RETRIES", "0"),
            ("RETRY_BASE_DELAY_MS", "20"),
            ("STORAGE_PATH", "records"),
            ("OBJECT_STORE_PATH", "/var/lib/chunks"),
        ]);

        // when
        let config = Config::from_settings(&settings).unwrap();

        // then
        assert_eq!(config.page_size, 50);
        assert_eq!(config.max_chunk_size, 1024);
        assert_eq!(config.retry.max_retries, 0);
        assert_eq!(config.retry.base_delay, Duration::from_millis(20));
        assert_eq!(
            config.storage,
            StorageConfig::SlateDb(SlateDbStorageConfig {
                path: "records".to_string(),
                object_store: ObjectStoreConfig::Local(LocalObjectStoreConfig {
                    path: "/var/lib/chunks".to_string(),
                }),
                settings_path: None,
            })
        );
    }

    #[test]
    fn should_require_region_for_aws_bucket() {
        let settings = Settings::from_vars([
            ("TABLE_NAME", "articles"),
            ("STORAGE_PATH", "records"),
            ("AWS_BUCKET", "chunks"),
        ]);

        let result = Config::from_settings(&settings);

        assert_eq!(result, Err(Error::ConfigNotSet("AWS_REGION".to_string())));
    }

    #[test]
    fn should_reject_chunk_size_above_limit() {
        let settings = Settings::from_vars([("TABLE_NAME", "t"), ("MAX_CHUNK_SIZE", "500000")]);

        let result = Config::from_settings(&settings);

        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn should_deserialize_config() {
        // given
        let json = r#"{
            "table_name": "articles",
            "page_size": 32,
            "retry": { "max_retries": 5, "max_delay": "1s" }
        }"#;

        // when
        let config: Config = serde_json::from_str(json).unwrap();

        // then
        assert_eq!(config.table_name, "articles");
        assert_eq!(config.page_size, 32);
        assert_eq!(config.max_chunk_size, MAX_CHUNK_SIZE);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.max_delay, Duration::from_secs(1));
        assert_eq!(config.storage, StorageConfig::InMemory);
    }
}
