use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the ingestion coordinator
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,
    /// Database configuration (metadata store and dedup ledger)
    pub database: DatabaseConfig,
    /// Dedup ledger lifetimes
    pub ledger: LedgerConfig,
    /// Object storage configuration
    pub s3: S3Config,
    /// Work queue configuration
    pub queue: QueueConfig,
    /// Reconciliation sweep configuration
    pub reconciler: ReconcilerConfig,
    /// API configuration
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// Dedup ledger lifetimes.
///
/// Reserved and confirmed lifetimes are configured independently. With the
/// default 24h confirmed lifetime, durably stored content becomes
/// re-ingestible a day later; leave `confirmed_ttl_secs` unset to keep
/// confirmed entries forever.
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// Lifetime of a reservation awaiting client upload, in seconds
    #[serde(default = "default_reserved_ttl_secs")]
    pub reserved_ttl_secs: u64,
    /// Lifetime of a confirmed entry in seconds; omit for no expiry
    #[serde(default = "default_confirmed_ttl_secs")]
    pub confirmed_ttl_secs: Option<u64>,
}

/// Object storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket name for photo storage
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, Storj gateways, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO-style gateways)
    #[serde(default)]
    pub force_path_style: bool,
    /// Presigned upload (PUT) URL expiration in seconds
    #[serde(default = "default_upload_url_expiry_secs")]
    pub upload_url_expiry_secs: u64,
    /// Presigned download (GET) URL expiration in seconds
    #[serde(default = "default_download_url_expiry_secs")]
    pub download_url_expiry_secs: u64,
    /// Content type recorded on uploaded photos
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

/// Work queue configuration
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: String,
    /// High-priority topic consumed first by the matching worker
    #[serde(default = "default_selfie_topic")]
    pub selfie_topic: String,
    /// Low-priority topic for event photo indexing
    #[serde(default = "default_event_photo_topic")]
    pub event_photo_topic: String,
    /// Delivery timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Enable SSL
    #[serde(default)]
    pub ssl_enabled: bool,
    /// SSL CA certificate path
    pub ssl_ca_location: Option<String>,
    /// SASL username
    pub sasl_username: Option<String>,
    /// SASL password
    pub sasl_password: Option<String>,
}

/// Reconciliation sweep configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ReconcilerConfig {
    /// Enable the background sweep
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Interval between sweeps in seconds
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Age after which a pending record is considered stuck, in seconds
    #[serde(default = "default_pending_timeout_secs")]
    pub pending_timeout_secs: u64,
}

/// API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "coordinator-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_run_migrations() -> bool {
    true
}

fn default_reserved_ttl_secs() -> u64 {
    86400
}

fn default_confirmed_ttl_secs() -> Option<u64> {
    Some(86400)
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_upload_url_expiry_secs() -> u64 {
    3600
}

fn default_download_url_expiry_secs() -> u64 {
    3600
}

fn default_content_type() -> String {
    "image/jpeg".to_string()
}

fn default_selfie_topic() -> String {
    "selfie_queue".to_string()
}

fn default_event_photo_topic() -> String {
    "event_photo_queue".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30000
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_pending_timeout_secs() -> u64 {
    600
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "coordinator-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/coordinator").required(false))
            .add_source(config::File::with_name("/etc/snapmatch/coordinator").required(false))
            // Override with environment variables
            // COORDINATOR__QUEUE__BOOTSTRAP_SERVERS -> queue.bootstrap_servers
            .add_source(
                config::Environment::with_prefix("COORDINATOR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get database connection timeout as Duration
    pub fn db_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.database.connect_timeout_secs)
    }

    /// Get database idle timeout as Duration
    pub fn db_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.database.idle_timeout_secs)
    }
}

impl LedgerConfig {
    /// Reservation lifetime as Duration
    pub fn reserved_ttl(&self) -> Duration {
        Duration::from_secs(self.reserved_ttl_secs)
    }

    /// Confirmed-entry lifetime as Duration; None means no expiry
    pub fn confirmed_ttl(&self) -> Option<Duration> {
        self.confirmed_ttl_secs.map(Duration::from_secs)
    }
}

impl S3Config {
    /// Presigned upload URL expiry as Duration
    pub fn upload_url_expiry(&self) -> Duration {
        Duration::from_secs(self.upload_url_expiry_secs)
    }

    /// Presigned download URL expiry as Duration
    pub fn download_url_expiry(&self) -> Duration {
        Duration::from_secs(self.download_url_expiry_secs)
    }
}

impl QueueConfig {
    /// Delivery timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl ReconcilerConfig {
    /// Sweep interval as Duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Pending-record timeout as Duration
    pub fn pending_timeout(&self) -> Duration {
        Duration::from_secs(self.pending_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(default_reserved_ttl_secs(), 86400);
        assert_eq!(default_confirmed_ttl_secs(), Some(86400));
        assert_eq!(default_selfie_topic(), "selfie_queue");
        assert_eq!(default_event_photo_topic(), "event_photo_queue");
        assert_eq!(default_pending_timeout_secs(), 600);
    }

    #[test]
    fn test_ledger_ttl_conversions() {
        let ledger = LedgerConfig {
            reserved_ttl_secs: 60,
            confirmed_ttl_secs: None,
        };
        assert_eq!(ledger.reserved_ttl(), Duration::from_secs(60));
        assert_eq!(ledger.confirmed_ttl(), None);
    }
}
