use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Upper bound on pooled PostgreSQL connections
    #[serde(default = "default_database_max_connections")]
    pub database_max_connections: u32,

    /// Redis connection string for the job queue and batch counters
    pub redis_url: String,

    /// HS256 secret shared with the web app that issues session tokens
    pub jwt_secret: String,

    /// Public base URL of the platform, used in invite links and templates
    #[serde(default = "default_platform_url")]
    pub platform_url: String,

    /// Resend API key (required by the worker only)
    #[serde(default)]
    pub resend_api_key: String,

    /// Resend API base URL
    #[serde(default = "default_resend_base_url")]
    pub resend_base_url: String,

    /// Sender address for invitation emails
    #[serde(default = "default_email_from")]
    pub email_from: String,

    /// Number of invitation jobs processed simultaneously by one worker
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Ceiling on job starts per second across one worker
    #[serde(default = "default_worker_rate")]
    pub worker_rate_per_second: u32,

    /// Sleep between polls when the queue is empty
    #[serde(default = "default_poll_interval_ms")]
    pub worker_poll_interval_ms: u64,

    /// How long a claimed job stays leased before it is redelivered
    #[serde(default = "default_worker_lease_secs")]
    pub worker_lease_secs: u64,

    /// Address the worker's Prometheus scrape listener binds to
    #[serde(default = "default_worker_metrics_addr")]
    pub worker_metrics_addr: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_database_max_connections() -> u32 {
    10
}

fn default_platform_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_resend_base_url() -> String {
    "https://api.resend.com".to_string()
}

fn default_email_from() -> String {
    "Vayam <noreply@vayam.app>".to_string()
}

fn default_worker_concurrency() -> usize {
    5
}

fn default_worker_rate() -> u32 {
    10
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_worker_lease_secs() -> u64 {
    60
}

fn default_worker_metrics_addr() -> String {
    "0.0.0.0:9091".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.worker_lease_secs)
    }
}
