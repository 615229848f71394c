use crate::model::ServingType;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "FeatureSetsConfigDef")]
pub struct FeatureSetsConfig {
    pub path: String,
    pub cache_ttl_seconds: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum FeatureSetsConfigDef {
    Path(String),
    Detailed {
        path: String,
        #[serde(default)]
        cache_ttl_seconds: Option<u64>,
    },
}

impl From<FeatureSetsConfigDef> for FeatureSetsConfig {
    fn from(value: FeatureSetsConfigDef) -> Self {
        match value {
            FeatureSetsConfigDef::Path(path) => FeatureSetsConfig {
                path,
                ..Default::default()
            },
            FeatureSetsConfigDef::Detailed {
                path,
                cache_ttl_seconds,
            } => FeatureSetsConfig {
                path,
                cache_ttl_seconds,
            },
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RedisType {
    #[default]
    SingleNode,
    RedisCluster,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OnlineStoreConfig {
    Memory {
        /// Optional JSON-lines file preloaded into the store at startup.
        #[serde(default)]
        seed_path: Option<String>,
    },
    Redis {
        #[serde(default)]
        redis_type: RedisType,
        connection_string: String,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutMode {
    /// Fail the whole call with `DeadlineExceeded`.
    #[default]
    Fail,
    /// Return the rows, marking every value still in flight with `ERROR`.
    Partial,
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_max_in_flight() -> usize {
    16
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResolverConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default)]
    pub timeout_mode: TimeoutMode,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_in_flight: default_max_in_flight(),
            timeout_mode: TimeoutMode::default(),
        }
    }
}

impl ResolverConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StagingConfig {
    Local { root: String },
    S3 { root: String },
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobStoreConfig {
    #[default]
    Memory,
    Sqlite {
        path: String,
    },
}

fn default_staging_ttl_seconds() -> u64 {
    24 * 60 * 60
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    128
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_chunk_size() -> usize {
    256
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    pub staging: StagingConfig,
    #[serde(default = "default_staging_ttl_seconds")]
    pub staging_ttl_seconds: u64,
    #[serde(default)]
    pub job_store: JobStoreConfig,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl BatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn staging_ttl(&self) -> Duration {
        Duration::from_secs(self.staging_ttl_seconds)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServingConfig {
    pub project: String,
    pub serving_type: ServingType,
    pub feature_sets: FeatureSetsConfig,
    pub online_store: OnlineStoreConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub batch: Option<BatchConfig>,
}

impl ServingConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Err(anyhow!("Empty configuration file"));
        }
        let config: ServingConfig = serde_saphyr::from_str(yaml).map_err(|err| anyhow!(err))?;
        if config.serving_type == ServingType::Batch && config.batch.is_none() {
            return Err(anyhow!(
                "Serving type BATCH requires a 'batch' configuration section"
            ));
        }
        if config.resolver.max_in_flight == 0 {
            return Err(anyhow!("resolver.max_in_flight must be greater than zero"));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    #[test]
    fn parse_config_online_memory() -> Result<()> {
        let project_dir = env!("CARGO_MANIFEST_DIR");
        let config_path = format!("{}/test_data/serving_online.yaml", project_dir);
        let yaml_str = fs::read_to_string(config_path)?;
        let config = ServingConfig::from_yaml_str(&yaml_str)?;
        assert_eq!(config.project, "driver_project");
        assert_eq!(config.serving_type, ServingType::Online);
        let expected_feature_sets = FeatureSetsConfig {
            path: "feature_sets.yaml".to_string(),
            cache_ttl_seconds: None,
        };
        assert_eq!(config.feature_sets, expected_feature_sets);
        assert_eq!(
            config.online_store,
            OnlineStoreConfig::Memory {
                seed_path: Some("online_seed.jsonl".to_string())
            }
        );
        assert_eq!(config.resolver.timeout_ms, 500);
        assert_eq!(config.resolver.max_in_flight, 8);
        assert_eq!(config.resolver.timeout_mode, TimeoutMode::Partial);
        assert!(config.batch.is_none());
        Ok(())
    }

    #[test]
    fn parse_config_batch() -> Result<()> {
        let project_dir = env!("CARGO_MANIFEST_DIR");
        let config_path = format!("{}/test_data/serving_batch.yaml", project_dir);
        let yaml_str = fs::read_to_string(config_path)?;
        let config = ServingConfig::from_yaml_str(&yaml_str)?;
        assert_eq!(config.serving_type, ServingType::Batch);
        assert_eq!(
            config.feature_sets,
            FeatureSetsConfig {
                path: "feature_sets.yaml".to_string(),
                cache_ttl_seconds: Some(30),
            }
        );
        assert_eq!(
            config.online_store,
            OnlineStoreConfig::Redis {
                redis_type: RedisType::SingleNode,
                connection_string: "localhost:6379".to_string(),
            }
        );
        assert_eq!(config.resolver, ResolverConfig::default());
        let batch = config.batch.expect("batch section");
        assert_eq!(
            batch.staging,
            StagingConfig::S3 {
                root: "s3://feast-staging/serving".to_string()
            }
        );
        assert_eq!(
            batch.job_store,
            JobStoreConfig::Sqlite {
                path: "data/jobs.db".to_string()
            }
        );
        assert_eq!(batch.workers, 2);
        assert_eq!(batch.queue_capacity, default_queue_capacity());
        assert_eq!(batch.poll_interval(), Duration::from_millis(200));
        Ok(())
    }

    #[test]
    fn batch_serving_requires_batch_section() {
        let yaml = r#"
project: p
serving_type: batch
feature_sets: feature_sets.yaml
online_store:
  type: memory
"#;
        assert!(ServingConfig::from_yaml_str(yaml).is_err());
        assert!(ServingConfig::from_yaml_str("   ").is_err());
    }
}
