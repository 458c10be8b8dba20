use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Upper bound on retained log bytes per job.
pub const DEFAULT_MAX_LOG_BYTES: u64 = 32 * 1024 * 1024;

/// Wall-clock ceiling for one job, just under the 15 minute compute limit.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(14 * 60);

pub const DEFAULT_LOG_SHIP_INTERVAL: Duration = Duration::from_secs(1);

/// Per-job execution limits and shipping cadence.
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Hard deadline for the subprocess or procedure.
    pub timeout: Duration,
    /// Minimum time between two ships of a growing log.
    pub log_ship_interval: Duration,
    /// Output bytes kept before the truncation marker.
    pub max_log_bytes: u64,
    /// Policy for every log/exit/size write.
    pub retry: RetryPolicy,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_JOB_TIMEOUT,
            log_ship_interval: DEFAULT_LOG_SHIP_INTERVAL,
            max_log_bytes: DEFAULT_MAX_LOG_BYTES,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Externally reachable base url, used to mint signed blob urls.
    pub public_url: String,
    /// Root directory of the object store.
    pub data_dir: PathBuf,
    /// JSON file of auth records. No file means nobody can authenticate.
    pub auth_file: Option<PathBuf>,
    /// Hex signing key for blob urls. Random per process when unset.
    pub signing_key: Option<String>,
    pub worker_concurrency: usize,
    pub queue_capacity: usize,
    /// Delay before answering an unauthorized request.
    pub unauthorized_delay: Duration,
    /// Lifetime of the log read url returned by `GET /api/exec`.
    pub read_url_ttl: Duration,
    pub activity_flush_interval: Duration,
    pub sweep_interval: Duration,
    /// Job and activity objects older than this are swept.
    pub job_retention: Duration,
    pub job: JobConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            public_url: "http://127.0.0.1:8080".to_string(),
            data_dir: PathBuf::from("rexec-data"),
            auth_file: None,
            signing_key: None,
            worker_concurrency: 4,
            queue_capacity: 64,
            unauthorized_delay: Duration::from_secs(1),
            read_url_ttl: Duration::from_secs(60),
            activity_flush_interval: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(5 * 60),
            job_retention: Duration::from_secs(24 * 60 * 60),
            job: JobConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn new(listen_addr: SocketAddr, data_dir: PathBuf) -> Self {
        Self {
            public_url: format!("http://{}", listen_addr),
            listen_addr,
            data_dir,
            ..Default::default()
        }
    }

    pub fn with_public_url(mut self, url: impl Into<String>) -> Self {
        self.public_url = url.into();
        self
    }

    pub fn with_auth_file(mut self, path: PathBuf) -> Self {
        self.auth_file = Some(path);
        self
    }

    pub fn with_job(mut self, job: JobConfig) -> Self {
        self.job = job;
        self
    }
}

/// Settings for [`ExecClient`](crate::client::ExecClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base url of the server, without `/api/exec`.
    pub url: String,
    /// Bearer secret sent in the `auth` header.
    pub auth: String,
    /// Wait between polls that made no progress.
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, auth: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth: auth.into(),
            poll_interval: DEFAULT_LOG_SHIP_INTERVAL,
            retry: RetryPolicy::with_attempts(7),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}
