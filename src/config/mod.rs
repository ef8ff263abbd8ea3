//! Cluster-wide migration configuration
//!
//! The configuration lives in a ConfigMap (key `migrations`, JSON or YAML)
//! and is hot reloaded. Reconcilers never read it as ambient state: each
//! invocation takes one [`ConfigSnapshot`] from its [`ConfigHandle`] and
//! passes it down explicitly. A migration pins the snapshot it was admitted
//! under into its status, so later edits only affect migrations admitted
//! after the change.
//!
//! Propagation: a ConfigMap edit reaches the handle as soon as the watch
//! event is delivered. Pending migrations re-read the handle at least every
//! [`crate::controller::PENDING_REQUEUE`].

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::crd::{parse_quantity, PinnedMigrationConfig};

/// Default ConfigMap holding the migration configuration
pub const DEFAULT_CONFIG_MAP: &str = "ferry-config";

/// Key inside the ConfigMap
pub const CONFIG_MAP_KEY: &str = "migrations";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The document could not be parsed
    #[error("failed to parse migration config: {0}")]
    Parse(String),

    /// A field has an unusable value
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// Offending field (camelCase)
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

impl From<ConfigError> for crate::Error {
    fn from(e: ConfigError) -> Self {
        crate::Error::config(e.to_string())
    }
}

/// Migration options recognised in the ConfigMap
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct MigrationConfig {
    /// Skip the volume shareability check
    pub unsafe_migration_override: bool,

    /// Transfer rate cap per migration, as a quantity per second
    pub bandwidth_per_migration: String,

    /// Seconds without measurable progress before a migration is aborted
    pub progress_timeout: u64,

    /// Seconds allotted per GiB of guest memory
    #[serde(rename = "completionTimeoutPerGiB")]
    pub completion_timeout_per_gib: u64,

    /// Simultaneous outbound migrations allowed per source node
    pub parallel_outbound_migrations_per_node: u32,

    /// Simultaneous migrations allowed across the cluster
    pub parallel_migrations_per_cluster: u32,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            unsafe_migration_override: false,
            bandwidth_per_migration: "64Mi".to_string(),
            progress_timeout: 150,
            completion_timeout_per_gib: 800,
            parallel_outbound_migrations_per_node: 2,
            parallel_migrations_per_cluster: 5,
        }
    }
}

impl MigrationConfig {
    /// Parse and validate the `migrations` document
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        // YAML is a superset of JSON, so one parser covers both encodings
        let config: MigrationConfig =
            serde_yaml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read the configuration out of a ConfigMap
    ///
    /// A missing ConfigMap or key yields the defaults.
    pub fn from_config_map(config_map: Option<&ConfigMap>) -> Result<Self, ConfigError> {
        let raw = config_map
            .and_then(|cm| cm.data.as_ref())
            .and_then(|data| data.get(CONFIG_MAP_KEY));
        match raw {
            Some(raw) if !raw.trim().is_empty() => Self::parse(raw),
            _ => Ok(Self::default()),
        }
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bandwidth = self.bandwidth_bytes()?;
        if bandwidth == 0 {
            return Err(ConfigError::InvalidValue {
                field: "bandwidthPerMigration",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.progress_timeout == 0 {
            return Err(ConfigError::InvalidValue {
                field: "progressTimeout",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.completion_timeout_per_gib == 0 {
            return Err(ConfigError::InvalidValue {
                field: "completionTimeoutPerGiB",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.parallel_outbound_migrations_per_node == 0 {
            return Err(ConfigError::InvalidValue {
                field: "parallelOutboundMigrationsPerNode",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.parallel_migrations_per_cluster == 0 {
            return Err(ConfigError::InvalidValue {
                field: "parallelMigrationsPerCluster",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Bandwidth cap in bytes per second
    pub fn bandwidth_bytes(&self) -> Result<u64, ConfigError> {
        parse_quantity(&self.bandwidth_per_migration).map_err(|e| ConfigError::InvalidValue {
            field: "bandwidthPerMigration",
            reason: e.to_string(),
        })
    }
}

/// An immutable, versioned view of the configuration
#[derive(Clone, Debug)]
pub struct ConfigSnapshot {
    /// Monotonic version, bumped on every accepted change
    pub version: u64,
    /// The configuration values
    pub config: Arc<MigrationConfig>,
}

impl ConfigSnapshot {
    /// Snapshot of `config` at `version`
    pub fn new(version: u64, config: MigrationConfig) -> Self {
        Self {
            version,
            config: Arc::new(config),
        }
    }

    /// Values to pin into a migration admitted under this snapshot
    pub fn pin(&self) -> PinnedMigrationConfig {
        PinnedMigrationConfig {
            version: self.version,
            // validated on the way in
            bandwidth_per_migration: self.config.bandwidth_bytes().unwrap_or(0),
            progress_timeout: self.config.progress_timeout,
            completion_timeout_per_gib: self.config.completion_timeout_per_gib,
        }
    }
}

/// Read side of the configuration channel, cloned into every context
#[derive(Clone, Debug)]
pub struct ConfigHandle {
    rx: watch::Receiver<ConfigSnapshot>,
}

impl ConfigHandle {
    /// The latest snapshot
    pub fn current(&self) -> ConfigSnapshot {
        self.rx.borrow().clone()
    }

    /// A handle that always returns `config`
    ///
    /// Used by tests and by tools that do not watch the cluster.
    pub fn fixed(config: MigrationConfig) -> Self {
        let (_publisher, handle) = ConfigPublisher::new(config);
        handle
    }
}

/// Write side of the configuration channel
pub struct ConfigPublisher {
    tx: watch::Sender<ConfigSnapshot>,
}

impl ConfigPublisher {
    /// Create a channel seeded with `initial` at version 1
    pub fn new(initial: MigrationConfig) -> (Self, ConfigHandle) {
        let (tx, rx) = watch::channel(ConfigSnapshot::new(1, initial));
        (Self { tx }, ConfigHandle { rx })
    }

    /// Another read handle on the same channel
    pub fn handle(&self) -> ConfigHandle {
        ConfigHandle {
            rx: self.tx.subscribe(),
        }
    }

    /// Publish `config`, returning the new version if it differs from the current one
    pub fn publish(&self, config: MigrationConfig) -> Option<u64> {
        let mut published = None;
        self.tx.send_if_modified(|current| {
            if *current.config == config {
                return false;
            }
            let version = current.version + 1;
            *current = ConfigSnapshot::new(version, config);
            published = Some(version);
            true
        });
        published
    }

    /// Apply the contents of the ConfigMap (or its absence)
    ///
    /// A malformed document is logged and the previous snapshot kept.
    pub fn apply_config_map(
        &self,
        config_map: Option<&ConfigMap>,
    ) -> Result<Option<u64>, ConfigError> {
        let config = MigrationConfig::from_config_map(config_map)?;
        let version = self.publish(config);
        if let Some(version) = version {
            info!(version, "migration configuration updated");
        }
        Ok(version)
    }
}

/// Keep `publisher` in sync with the ConfigMap `name` in `namespace`
///
/// Runs until the watch stream ends (controller shutdown).
pub async fn watch_config_map(
    client: Client,
    namespace: String,
    name: String,
    publisher: ConfigPublisher,
) {
    let api: Api<ConfigMap> = Api::namespaced(client, &namespace);
    let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
    let mut stream = watcher(api, config).default_backoff().boxed();

    info!(namespace = %namespace, name = %name, "watching migration configuration");

    while let Some(event) = stream.next().await {
        let result = match event {
            Ok(watcher::Event::Apply(cm)) | Ok(watcher::Event::InitApply(cm)) => {
                publisher.apply_config_map(Some(&cm))
            }
            Ok(watcher::Event::Delete(_)) => publisher.apply_config_map(None),
            Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => continue,
            Err(e) => {
                warn!(error = %e, "configuration watch error");
                continue;
            }
        };
        if let Err(e) = result {
            warn!(error = %e, "ignoring invalid migration configuration, keeping previous values");
        } else {
            debug!(version = publisher.handle().current().version, "configuration event handled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn config_map(raw: &str) -> ConfigMap {
        ConfigMap {
            data: Some(BTreeMap::from([(CONFIG_MAP_KEY.to_string(), raw.to_string())])),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = MigrationConfig::default();
        assert!(!config.unsafe_migration_override);
        assert_eq!(config.bandwidth_bytes().unwrap(), 64 << 20);
        assert_eq!(config.progress_timeout, 150);
        assert_eq!(config.completion_timeout_per_gib, 800);
        assert_eq!(config.parallel_outbound_migrations_per_node, 2);
        assert_eq!(config.parallel_migrations_per_cluster, 5);
    }

    #[test]
    fn json_document_overrides_only_named_fields() {
        let raw = r#"{"bandwidthPerMigration": "1Mi", "progressTimeout": 5, "completionTimeoutPerGiB": 5}"#;
        let config = MigrationConfig::parse(raw).unwrap();
        assert_eq!(config.bandwidth_bytes().unwrap(), 1 << 20);
        assert_eq!(config.progress_timeout, 5);
        assert_eq!(config.completion_timeout_per_gib, 5);
        assert_eq!(config.parallel_outbound_migrations_per_node, 2);
    }

    #[test]
    fn yaml_document_is_accepted() {
        let config = MigrationConfig::parse("unsafeMigrationOverride: true\n").unwrap();
        assert!(config.unsafe_migration_override);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            MigrationConfig::parse(r#"{"bandwidthPerMigration": "fast"}"#),
            Err(ConfigError::InvalidValue { field: "bandwidthPerMigration", .. })
        ));
        assert!(matches!(
            MigrationConfig::parse(r#"{"parallelOutboundMigrationsPerNode": 0}"#),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            MigrationConfig::parse("{"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn missing_config_map_or_key_yields_defaults() {
        assert_eq!(
            MigrationConfig::from_config_map(None).unwrap(),
            MigrationConfig::default()
        );
        assert_eq!(
            MigrationConfig::from_config_map(Some(&ConfigMap::default())).unwrap(),
            MigrationConfig::default()
        );
    }

    #[test]
    fn pinned_values_carry_version_and_bytes() {
        let snapshot = ConfigSnapshot::new(7, MigrationConfig::default());
        let pinned = snapshot.pin();
        assert_eq!(pinned.version, 7);
        assert_eq!(pinned.bandwidth_per_migration, 64 << 20);
        assert_eq!(pinned.progress_timeout, 150);
    }

    // ==========================================================================
    // Story Tests: Hot Reload
    // ==========================================================================

    /// Story: an operator tightens timeouts while the controller runs
    ///
    /// Every accepted edit bumps the version seen by reconcilers; identical
    /// re-deliveries and malformed edits leave the snapshot alone.
    #[test]
    fn story_config_map_edits_propagate_as_new_snapshots() {
        let (publisher, handle) = ConfigPublisher::new(MigrationConfig::default());
        assert_eq!(handle.current().version, 1);

        // Operator sets a tiny bandwidth to force timeouts in a test cluster
        let cm = config_map(r#"{"bandwidthPerMigration": "1Mi", "progressTimeout": 5}"#);
        assert_eq!(publisher.apply_config_map(Some(&cm)).unwrap(), Some(2));

        let snapshot = handle.current();
        assert_eq!(snapshot.version, 2);
        assert_eq!(snapshot.config.progress_timeout, 5);

        // The watch re-delivers the same object: nothing changes
        assert_eq!(publisher.apply_config_map(Some(&cm)).unwrap(), None);
        assert_eq!(handle.current().version, 2);

        // A typo is rejected and the previous values stay in force
        let broken = config_map(r#"{"bandwidthPerMigration": "1Zi"}"#);
        assert!(publisher.apply_config_map(Some(&broken)).is_err());
        assert_eq!(handle.current().config.progress_timeout, 5);

        // Deleting the ConfigMap restores defaults
        assert_eq!(publisher.apply_config_map(None).unwrap(), Some(3));
        assert_eq!(*handle.current().config, MigrationConfig::default());
    }

    #[test]
    fn fixed_handle_returns_the_given_config() {
        let config = MigrationConfig {
            unsafe_migration_override: true,
            ..Default::default()
        };
        let handle = ConfigHandle::fixed(config.clone());
        assert_eq!(*handle.current().config, config);
    }
}
