use config::{Config, ConfigBuilder, ConfigError, File, FileFormat};
use config::builder::DefaultState;
use serde::Deserialize;
use std::time::Duration;

/// Environment variables consulted on top of the config file, and the config
/// key each one overrides.
pub const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("GENTRACE_BASE_URL", "endpoint.base_url"),
    ("GENTRACE_API_KEY", "endpoint.api_key"),
    ("EXPORT_MODE", "endpoint.export_mode"),
    ("POSTGRES_HOST", "postgres.host"),
    ("POSTGRES_PORT", "postgres.port"),
    ("POSTGRES_DB", "postgres.database"),
    ("POSTGRES_USER", "postgres.user"),
    ("POSTGRES_PASSWORD", "postgres.password"),
    ("POSTGRES_TABLE", "postgres.table"),
    ("CLICKHOUSE_HOST", "clickhouse.host"),
    ("CLICKHOUSE_PORT", "clickhouse.port"),
    ("CLICKHOUSE_DB", "clickhouse.database"),
    ("CLICKHOUSE_USER", "clickhouse.user"),
    ("CLICKHOUSE_PASSWORD", "clickhouse.password"),
    ("CLICKHOUSE_TABLE", "clickhouse.table"),
    ("ORGANIZATION_ID", "tenant.organization_id"),
    ("PIPELINE_ID", "tenant.pipeline_id"),
    ("LOG_LEVEL", "service.log_level"),
];

#[derive(Debug, Deserialize, Clone, Default)]
pub struct HarnessConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,
    #[serde(default)]
    pub tenant: TenantConfig,
    #[serde(default)]
    pub harness: TimingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub log_level: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "spancheck".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// How the OTLP client hands spans to the endpoint.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExportMode {
    /// Buffer every span and post them together on flush.
    #[default]
    Batch,
    /// Post each span as soon as it is sent.
    Simple,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EndpointConfig {
    pub base_url: String,
    pub api_key: String,
    pub export_mode: ExportMode,
    pub request_timeout_seconds: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000/api".to_string(),
            api_key: "gt-test-key".to_string(),
            export_mode: ExportMode::Batch,
            request_timeout_seconds: 10,
        }
    }
}

impl EndpointConfig {
    pub fn traces_url(&self) -> String {
        format!("{}/otel/v1/traces", self.base_url.trim_end_matches('/'))
    }

    pub fn health_url(&self) -> String {
        format!("{}/health", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub table: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "gentrace".to_string(),
            user: "gentrace".to_string(),
            password: "gentrace123".to_string(),
            table: "GTSpan".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClickHouseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub table: String,
    pub tls: bool,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8123,
            database: "default".to_string(),
            user: "default".to_string(),
            password: "gentrace123".to_string(),
            table: "GTSpan".to_string(),
            tls: false,
        }
    }
}

impl ClickHouseConfig {
    pub fn base_url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TenantConfig {
    pub organization_id: String,
    pub pipeline_id: String,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            organization_id: "test-org-id".to_string(),
            pipeline_id: "c10408c7-abde-5c19-b339-e8b1087c9b64".to_string(),
        }
    }
}

/// Wait bounds and intervals for the stages.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TimingConfig {
    pub flush_timeout_ms: u64,
    pub health_attempts: usize,
    pub health_retry_delay_ms: u64,
    pub row_max_wait_seconds: u64,
    pub row_poll_interval_ms: u64,
    pub column_settle_seconds: u64,
    pub column_max_wait_seconds: u64,
    pub column_poll_interval_ms: u64,
    /// Also count column-store spans whose name looks like one of ours.
    /// Breaks isolation between concurrent runs; off unless asked for.
    pub column_name_fallback: bool,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            flush_timeout_ms: 5000,
            health_attempts: 3,
            health_retry_delay_ms: 1000,
            row_max_wait_seconds: 30,
            row_poll_interval_ms: 1000,
            column_settle_seconds: 2,
            column_max_wait_seconds: 120,
            column_poll_interval_ms: 2000,
            column_name_fallback: false,
        }
    }
}

impl TimingConfig {
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    pub fn row_max_wait(&self) -> Duration {
        Duration::from_secs(self.row_max_wait_seconds)
    }

    pub fn row_poll_interval(&self) -> Duration {
        Duration::from_millis(self.row_poll_interval_ms)
    }

    pub fn column_settle(&self) -> Duration {
        Duration::from_secs(self.column_settle_seconds)
    }

    pub fn column_max_wait(&self) -> Duration {
        Duration::from_secs(self.column_max_wait_seconds)
    }

    pub fn column_poll_interval(&self) -> Duration {
        Duration::from_millis(self.column_poll_interval_ms)
    }
}

impl HarnessConfig {
    /// Load `path` (optional, TOML) and apply environment overrides.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder().add_source(File::with_name(path).required(false));
        Self::from_builder(builder, |var| std::env::var(var).ok())
    }

    /// Parse TOML text and apply overrides from `lookup` instead of the process environment.
    pub fn from_toml_str(
        toml: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let builder = Config::builder().add_source(File::from_str(toml, FileFormat::Toml));
        Self::from_builder(builder, lookup)
    }

    /// Reject settings no run can work with. Runs after CLI overrides.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timing = &self.harness;
        if !(self.endpoint.base_url.starts_with("http://")
            || self.endpoint.base_url.starts_with("https://"))
        {
            return Err(ConfigError::Message(format!(
                "endpoint.base_url must be an http(s) URL, got {:?}",
                self.endpoint.base_url
            )));
        }
        if timing.row_poll_interval_ms == 0 || timing.column_poll_interval_ms == 0 {
            return Err(ConfigError::Message(
                "poll intervals must be greater than zero".to_string(),
            ));
        }
        if timing.health_attempts == 0 {
            return Err(ConfigError::Message(
                "harness.health_attempts must be at least 1".to_string(),
            ));
        }
        if timing.column_settle_seconds > timing.column_max_wait_seconds {
            return Err(ConfigError::Message(format!(
                "column settle ({}s) exceeds the column wait budget ({}s)",
                timing.column_settle_seconds, timing.column_max_wait_seconds
            )));
        }
        Ok(())
    }

    fn from_builder(
        mut builder: ConfigBuilder<DefaultState>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        for (var, key) in ENV_OVERRIDES {
            builder = builder.set_override_option(*key, lookup(*var))?;
        }
        builder.build()?.try_deserialize()
    }
}
