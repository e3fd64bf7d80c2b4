//! Configuration types for the document pipeline.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built
//! via its [`PipelineConfigBuilder`]. Who the caller is (user id, auth
//! token) lives separately in [`SessionContext`], which is handed to the
//! orchestrator and HTTP client constructors instead of being read from
//! global state.

use crate::error::PipelineError;
use crate::progress::StageObserver;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the pipeline orchestrator and the HTTP job client.
///
/// # Example
/// ```rust
/// use paperflow::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .base_url("https://jobs.example.com")
///     .poll_interval_ms(5_000)
///     .poll_timeout_secs(900)
///     .build()
///     .unwrap();
/// assert_eq!(config.poll_interval().as_secs(), 5);
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Root URL of the remote job API. Default: `http://localhost:8080`.
    pub base_url: String,

    /// Delay between two status queries, in milliseconds. Default: 3000.
    pub poll_interval_ms: u64,

    /// How long a submitted job may stay non-terminal before it is failed
    /// with a timeout, in seconds. Default: 600.
    ///
    /// Detection on long documents routinely takes several minutes; rewrite
    /// jobs take longer still.
    pub poll_timeout_secs: u64,

    /// Per-request timeout for JSON API calls, in seconds. Default: 30.
    pub request_timeout_secs: u64,

    /// Timeout for the direct-to-storage upload, in seconds. Default: 120.
    pub upload_timeout_secs: u64,

    /// HTTP status that storage returns for an accepted signed POST. Default: 201.
    ///
    /// Storage success is judged by this code alone; the response body is ignored.
    pub upload_success_status: u16,

    /// Largest document accepted for upload, in bytes. Default: 30 MiB.
    pub max_upload_bytes: usize,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Observer attached to every task the orchestrator creates.
    pub observer: Option<Arc<dyn StageObserver>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            poll_interval_ms: 3_000,
            poll_timeout_secs: 600,
            request_timeout_secs: 30,
            upload_timeout_secs: 120,
            upload_success_status: 201,
            max_upload_bytes: 30 * 1024 * 1024,
            download_timeout_secs: 120,
            observer: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("base_url", &self.base_url)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .field("poll_timeout_secs", &self.poll_timeout_secs)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("upload_timeout_secs", &self.upload_timeout_secs)
            .field("upload_success_status", &self.upload_success_status)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .field("download_timeout_secs", &self.download_timeout_secs)
            .field("observer", &self.observer.as_ref().map(|_| "<dyn StageObserver>"))
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    /// Join an API path onto `base_url` without doubling slashes.
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// Builder for [`PipelineConfig`].
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = url.into();
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    pub fn poll_timeout_secs(mut self, secs: u64) -> Self {
        self.config.poll_timeout_secs = secs;
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs.max(1);
        self
    }

    pub fn upload_timeout_secs(mut self, secs: u64) -> Self {
        self.config.upload_timeout_secs = secs.max(1);
        self
    }

    pub fn upload_success_status(mut self, status: u16) -> Self {
        self.config.upload_success_status = status;
        self
    }

    pub fn max_upload_bytes(mut self, bytes: usize) -> Self {
        self.config.max_upload_bytes = bytes;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn StageObserver>) -> Self {
        self.config.observer = Some(observer);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if !(c.base_url.starts_with("http://") || c.base_url.starts_with("https://")) {
            return Err(PipelineError::InvalidConfig(format!(
                "base_url must be an http(s) URL, got '{}'",
                c.base_url
            )));
        }
        if c.poll_interval_ms == 0 {
            return Err(PipelineError::InvalidConfig(
                "poll interval must be > 0".into(),
            ));
        }
        if c.poll_timeout() < c.poll_interval() {
            return Err(PipelineError::InvalidConfig(format!(
                "poll timeout ({}s) must be at least one poll interval ({}ms)",
                c.poll_timeout_secs, c.poll_interval_ms
            )));
        }
        if !(200..=299).contains(&c.upload_success_status) {
            return Err(PipelineError::InvalidConfig(format!(
                "upload success status must be 2xx, got {}",
                c.upload_success_status
            )));
        }
        if c.max_upload_bytes == 0 {
            return Err(PipelineError::InvalidConfig(
                "max upload size must be > 0".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Session ──────────────────────────────────────────────────────────────

/// Supplies the bearer token for remote calls.
///
/// Read on every request so a refreshed token is picked up without
/// rebuilding the client.
pub trait TokenSource: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// A token fixed at construction time.
pub struct StaticToken(pub Option<String>);

impl TokenSource for StaticToken {
    fn token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Who is driving the pipeline.
#[derive(Clone)]
pub struct SessionContext {
    pub user_id: String,
    pub token: Arc<dyn TokenSource>,
}

impl SessionContext {
    pub fn new(user_id: impl Into<String>, token: Arc<dyn TokenSource>) -> Self {
        Self {
            user_id: user_id.into(),
            token,
        }
    }

    /// A session with a fixed token (or none).
    pub fn with_static_token(user_id: impl Into<String>, token: Option<String>) -> Self {
        Self::new(user_id, Arc::new(StaticToken(token)))
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("user_id", &self.user_id)
            .field("token", &"<redacted>")
            .finish()
    }
}
