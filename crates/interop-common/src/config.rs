//! Runtime configuration stored in the `interoperator-config` ConfigMap
//!
//! The config map holds a single YAML document under the `config` key. Any
//! field that is missing, zero or empty falls back to its default, and a
//! config map that cannot be fetched or parsed yields the defaults outright.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{ObjectMeta, PostParams};
use kube::{Api, Client};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::Error;

/// Name of the config map holding the runtime configuration
pub const CONFIG_MAP_NAME: &str = "interoperator-config";

/// Key inside the config map holding the YAML document
pub const CONFIG_MAP_KEY: &str = "config";

/// Default number of instance reconcile workers
pub const DEFAULT_INSTANCE_WORKER_COUNT: usize = 10;
/// Default number of binding reconcile workers
pub const DEFAULT_BINDING_WORKER_COUNT: usize = 20;
/// Default number of scheduler workers
pub const DEFAULT_SCHEDULER_WORKER_COUNT: usize = 10;
/// Default number of provisioner workers
pub const DEFAULT_PROVISIONER_WORKER_COUNT: usize = 10;
/// Default primary cluster id
pub const DEFAULT_PRIMARY_CLUSTER_ID: &str = "1";
/// Default resync period of the cluster membership controller
pub const DEFAULT_CLUSTER_RECONCILE_INTERVAL: &str = "20m";

/// Interoperator runtime configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InteroperatorConfig {
    /// Concurrent instance reconciles
    #[serde(default)]
    pub instance_worker_count: usize,

    /// Concurrent binding reconciles
    #[serde(default)]
    pub binding_worker_count: usize,

    /// Concurrent scheduler reconciles
    #[serde(default)]
    pub scheduler_worker_count: usize,

    /// Concurrent provisioner reconciles
    #[serde(default)]
    pub provisioner_worker_count: usize,

    /// Id of the primary cluster
    #[serde(default)]
    pub primary_cluster_id: String,

    /// Resync period for SFCluster reconciles, as a duration string ("20m", "1h30m")
    #[serde(default)]
    pub cluster_reconcile_interval: String,
}

impl InteroperatorConfig {
    /// Configuration with every field at its default
    pub fn defaults() -> Self {
        Self {
            instance_worker_count: DEFAULT_INSTANCE_WORKER_COUNT,
            binding_worker_count: DEFAULT_BINDING_WORKER_COUNT,
            scheduler_worker_count: DEFAULT_SCHEDULER_WORKER_COUNT,
            provisioner_worker_count: DEFAULT_PROVISIONER_WORKER_COUNT,
            primary_cluster_id: DEFAULT_PRIMARY_CLUSTER_ID.to_string(),
            cluster_reconcile_interval: DEFAULT_CLUSTER_RECONCILE_INTERVAL.to_string(),
        }
    }

    /// Replace zero or empty fields with their defaults
    pub fn with_defaults(mut self) -> Self {
        let defaults = Self::defaults();
        if self.instance_worker_count == 0 {
            self.instance_worker_count = defaults.instance_worker_count;
        }
        if self.binding_worker_count == 0 {
            self.binding_worker_count = defaults.binding_worker_count;
        }
        if self.scheduler_worker_count == 0 {
            self.scheduler_worker_count = defaults.scheduler_worker_count;
        }
        if self.provisioner_worker_count == 0 {
            self.provisioner_worker_count = defaults.provisioner_worker_count;
        }
        if self.primary_cluster_id.is_empty() {
            self.primary_cluster_id = defaults.primary_cluster_id;
        }
        if self.cluster_reconcile_interval.is_empty() {
            self.cluster_reconcile_interval = defaults.cluster_reconcile_interval;
        }
        self
    }

    /// Parsed cluster reconcile interval, falling back to the default on a bad value
    pub fn cluster_reconcile_interval(&self) -> Duration {
        parse_duration(&self.cluster_reconcile_interval).unwrap_or_else(|e| {
            warn!(
                value = %self.cluster_reconcile_interval,
                error = %e,
                "Invalid clusterReconcileInterval, using default"
            );
            Duration::from_secs(20 * 60)
        })
    }
}

/// Parse a config YAML document, applying defaults to unset fields
pub fn parse_config(yaml: &str) -> Result<InteroperatorConfig, Error> {
    let config: InteroperatorConfig = serde_yaml::from_str(yaml)?;
    Ok(config.with_defaults())
}

/// Parse a duration string made of `<number><unit>` pairs.
///
/// Units: `h`, `m`, `s`, `ms`. Example: `1h30m`, `20m`, `45s`.
pub fn parse_duration(s: &str) -> Result<Duration, Error> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::validation("empty duration"));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| Error::validation(format!("duration {s:?} is missing a unit")))?;
        if digits == 0 {
            return Err(Error::validation(format!("invalid duration {s:?}")));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| Error::validation(format!("invalid duration {s:?}")))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "h" => Duration::from_secs(value * 3600),
            "m" => Duration::from_secs(value * 60),
            "s" => Duration::from_secs(value),
            "ms" => Duration::from_millis(value),
            unit => {
                return Err(Error::validation(format!(
                    "unknown unit {unit:?} in duration {s:?}"
                )))
            }
        };
        total += part;
        rest = &rest[unit_len..];
    }
    Ok(total)
}

/// Access to the runtime configuration
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Current configuration; never fails, falling back to defaults
    async fn get_config(&self) -> InteroperatorConfig;

    /// Persist a configuration, creating the config map if needed
    async fn update_config(&self, config: &InteroperatorConfig) -> Result<(), Error>;
}

/// ConfigProvider backed by the `interoperator-config` ConfigMap
pub struct ConfigMapProvider {
    api: Api<ConfigMap>,
}

impl ConfigMapProvider {
    /// Read the config map from `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl ConfigProvider for ConfigMapProvider {
    async fn get_config(&self) -> InteroperatorConfig {
        let cm = match self.api.get(CONFIG_MAP_NAME).await {
            Ok(cm) => cm,
            Err(e) => {
                debug!(error = %e, "Config map unavailable, using defaults");
                return InteroperatorConfig::defaults();
            }
        };
        config_from_map(&cm)
    }

    async fn update_config(&self, config: &InteroperatorConfig) -> Result<(), Error> {
        let yaml = serde_yaml::to_string(config)?;
        match self.api.get(CONFIG_MAP_NAME).await {
            Ok(mut cm) => {
                cm.data
                    .get_or_insert_with(BTreeMap::new)
                    .insert(CONFIG_MAP_KEY.to_string(), yaml);
                self.api
                    .replace(CONFIG_MAP_NAME, &PostParams::default(), &cm)
                    .await?;
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                let cm = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(CONFIG_MAP_NAME.to_string()),
                        ..Default::default()
                    },
                    data: Some(BTreeMap::from([(CONFIG_MAP_KEY.to_string(), yaml)])),
                    ..Default::default()
                };
                self.api.create(&PostParams::default(), &cm).await?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

/// Extract the configuration from a config map, defaulting on any problem
pub fn config_from_map(cm: &ConfigMap) -> InteroperatorConfig {
    let Some(yaml) = cm.data.as_ref().and_then(|d| d.get(CONFIG_MAP_KEY)) else {
        return InteroperatorConfig::defaults();
    };
    parse_config(yaml).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to parse interoperator config, using defaults");
        InteroperatorConfig::defaults()
    })
}
