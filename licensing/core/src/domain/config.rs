// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Licensing Service Configuration
//
// Kubernetes-style manifest (apiVersion/kind/metadata/spec) describing:
// - Application store backend and its timeout/retry policy
// - Notification queue + dead-letter queue identifiers and broker policy
// - Email service endpoint and failure alert threshold
// - HTTP API binding
// - Logging and metrics
//
// Configuration is read once at start-up and passed to constructors as plain
// structs; nothing below start-up reads the environment.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const API_VERSION: &str = "ea-licensing/v1";
pub const KIND: &str = "LicensingConfig";

/// Top-level configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicensingConfigManifest {
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: LicensingConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LicensingConfigSpec {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub notification: NotificationConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[default]
    InMemory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: BackendKind,

    /// PostgreSQL connection string (required for the postgres backend)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    /// Must be [`MIGRATED_TABLE_NAME`] on the postgres backend
    #[serde(default = "default_table_name")]
    pub table_name: String,

    /// Upper bound for a single store call
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// Retries for transient network errors only
    #[serde(default = "default_transient_retries")]
    pub max_transient_retries: u32,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub backend: BackendKind,

    #[serde(default = "default_notification_queue")]
    pub notification_queue: String,

    #[serde(default = "default_dead_letter_queue")]
    pub dead_letter_queue: String,

    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,

    /// Broker redrive policy: deliveries before a message is dead-lettered
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,

    /// Long-poll wait per receive call
    #[serde(default = "default_wait_time")]
    pub wait_time_secs: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_dead_letter_batch_size")]
    pub dead_letter_batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// `failureCount` at which an operational alert is raised; also the
    /// attempt count assumed when the broker reports none
    #[serde(default = "default_max_failure_count")]
    pub max_failure_count: u32,

    /// HTTP endpoint of the email service; when absent emails are only logged
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_endpoint: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_api_key: Option<String>,

    #[serde(default = "default_from_address")]
    pub from_address: String,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Execution deadline for a single request
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Shared secret for webhook signatures; unsigned webhooks are accepted when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Prometheus exporter port; metrics are not exported when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_port: Option<u16>,
}

/// Table created by the bundled migrations; its history table is `<name>_history`
pub const MIGRATED_TABLE_NAME: &str = "ea_applications";

fn default_table_name() -> String {
    MIGRATED_TABLE_NAME.to_string()
}

fn default_operation_timeout_ms() -> u64 {
    3_000
}

fn default_transient_retries() -> u32 {
    2
}

fn default_max_connections() -> u32 {
    5
}

fn default_notification_queue() -> String {
    "ea-notifications".to_string()
}

fn default_dead_letter_queue() -> String {
    "ea-notifications-dlq".to_string()
}

fn default_visibility_timeout() -> u64 {
    60
}

fn default_max_receive_count() -> u32 {
    3
}

fn default_wait_time() -> u64 {
    20
}

fn default_batch_size() -> usize {
    1
}

fn default_dead_letter_batch_size() -> usize {
    10
}

fn default_max_failure_count() -> u32 {
    3
}

fn default_from_address() -> String {
    "licensing@localhost".to_string()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_request_timeout_secs() -> u64 {
    29
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::InMemory,
            database_url: None,
            table_name: default_table_name(),
            operation_timeout_ms: default_operation_timeout_ms(),
            max_transient_retries: default_transient_retries(),
            max_connections: default_max_connections(),
        }
    }
}

impl StoreConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::InMemory,
            notification_queue: default_notification_queue(),
            dead_letter_queue: default_dead_letter_queue(),
            visibility_timeout_secs: default_visibility_timeout(),
            max_receive_count: default_max_receive_count(),
            wait_time_secs: default_wait_time(),
            batch_size: default_batch_size(),
            dead_letter_batch_size: default_dead_letter_batch_size(),
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(self.wait_time_secs)
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            max_failure_count: default_max_failure_count(),
            email_endpoint: None,
            email_api_key: None,
            from_address: default_from_address(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_api_port(),
            request_timeout_secs: default_request_timeout_secs(),
            webhook_secret: None,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: None,
        }
    }
}

impl Default for LicensingConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "ea-licensing".to_string(),
                version: Some("1.0.0".to_string()),
            },
            spec: LicensingConfigSpec::default(),
        }
    }
}

impl LicensingConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Discover configuration file using precedence order
    /// 1. EA_LICENSING_CONFIG_PATH environment variable
    /// 2. ./ea-licensing.yaml (working directory)
    /// 3. /etc/ea-licensing/config.yaml
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("EA_LICENSING_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./ea-licensing.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        let system_config = PathBuf::from("/etc/ea-licensing/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let mut config = if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?
        } else if let Some(path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", path);
            Self::from_yaml_file(path)?
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    /// Secrets are expected to arrive this way in container deployments
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("EA_LICENSING_DATABASE_URL") {
            tracing::info!("Environment override: EA_LICENSING_DATABASE_URL");
            self.spec.store.database_url = Some(url);
        }

        if let Some(key) = lookup("EA_LICENSING_EMAIL_API_KEY") {
            tracing::info!("Environment override: EA_LICENSING_EMAIL_API_KEY");
            self.spec.notification.email_api_key = Some(key);
        }

        if let Some(secret) = lookup("EA_LICENSING_WEBHOOK_SECRET") {
            tracing::info!("Environment override: EA_LICENSING_WEBHOOK_SECRET");
            self.spec.api.webhook_secret = Some(secret);
        }

        if let Some(val) = lookup("EA_LICENSING_MAX_RECEIVE_COUNT") {
            match val.trim().parse::<u32>() {
                Ok(count) => {
                    tracing::info!("Environment override: EA_LICENSING_MAX_RECEIVE_COUNT={}", count);
                    self.spec.queue.max_receive_count = count;
                }
                Err(_) => {
                    tracing::warn!(
                        "Invalid value for EA_LICENSING_MAX_RECEIVE_COUNT: '{}'. Ignoring.",
                        val
                    );
                }
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let spec = &self.spec;
        let needs_database =
            spec.store.backend == BackendKind::Postgres || spec.queue.backend == BackendKind::Postgres;
        if needs_database && spec.store.database_url.as_deref().map_or(true, str::is_empty) {
            anyhow::bail!("spec.store.database_url is required for the postgres backend");
        }

        if !is_sql_identifier(&spec.store.table_name) {
            anyhow::bail!(
                "Invalid spec.store.table_name: '{}'. Use letters, digits and underscores",
                spec.store.table_name
            );
        }

        if spec.store.backend == BackendKind::Postgres && spec.store.table_name != MIGRATED_TABLE_NAME {
            anyhow::bail!(
                "spec.store.table_name '{}' has no migration; the postgres backend uses '{}'",
                spec.store.table_name,
                MIGRATED_TABLE_NAME
            );
        }

        if spec.queue.notification_queue.is_empty() || spec.queue.dead_letter_queue.is_empty() {
            anyhow::bail!("spec.queue queue names cannot be empty");
        }

        if spec.queue.notification_queue == spec.queue.dead_letter_queue {
            anyhow::bail!("spec.queue.dead_letter_queue must differ from notification_queue");
        }

        if spec.queue.max_receive_count == 0 {
            anyhow::bail!("spec.queue.max_receive_count must be at least 1");
        }

        if spec.queue.visibility_timeout_secs == 0 {
            anyhow::bail!("spec.queue.visibility_timeout_secs must be at least 1");
        }

        if spec.queue.batch_size == 0 || spec.queue.dead_letter_batch_size == 0 {
            anyhow::bail!("spec.queue batch sizes must be at least 1");
        }

        if spec.notification.max_failure_count == 0 {
            anyhow::bail!("spec.notification.max_failure_count must be at least 1");
        }

        if let Some(endpoint) = &spec.notification.email_endpoint {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                anyhow::bail!("spec.notification.email_endpoint must start with http:// or https://");
            }
        }

        if !matches!(spec.observability.log_format.as_str(), "compact" | "json") {
            anyhow::bail!(
                "Invalid spec.observability.log_format: '{}'. Expected compact or json",
                spec.observability.log_format
            );
        }

        Ok(())
    }
}

fn is_sql_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
