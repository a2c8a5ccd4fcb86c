//! Centralized configuration for the bridge.
//!
//! Fixed limits live on associated-constant structs; the tunable parts of the
//! proxy and the query cache are plain structs with builder-style setters.

use crate::retry::RetryConfig;
use std::time::Duration;

/// Limits for the framed IPC transport.
pub struct IpcConfig;

impl IpcConfig {
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const MAX_CONNECTIONS: usize = 32;
    pub const MAX_CHANNEL_NAME_LEN: usize = 128;
}

/// Defaults for the query cache.
pub struct CacheDefaults;

impl CacheDefaults {
    pub const DEDUPING_INTERVAL: Duration = Duration::from_secs(2);
    pub const ERROR_RETRY_COUNT: u32 = 3;
    pub const ERROR_RETRY_INTERVAL: Duration = Duration::from_secs(5);
    pub const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(60);
    pub const FOCUS_THROTTLE_INTERVAL: Duration = Duration::from_secs(5);
    pub const LOADING_TIMEOUT: Duration = Duration::from_secs(3);
    pub const IDLE_EVICTION: Duration = Duration::from_secs(300);
}

/// Client RPC proxy settings.
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    /// Reject a call with `Timeout` once this much time passes without a
    /// response. `None` waits until the response or a disconnect.
    pub call_timeout: Option<Duration>,
}

impl ProxyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }
}

/// What happens to an entry once its last subscriber goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    Immediate,
    /// Keep the entry for this long; a new subscriber cancels the eviction.
    Idle(Duration),
    Never,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        EvictionPolicy::Idle(CacheDefaults::IDLE_EVICTION)
    }
}

/// Query cache settings, applied to every key unless overridden by
/// [`KeyOptions`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub deduping_interval: Duration,
    pub error_retry_count: u32,
    pub error_retry_interval: Duration,
    pub max_retry_interval: Duration,
    pub retry_jitter: bool,
    pub revalidate_on_focus: bool,
    pub revalidate_on_reconnect: bool,
    pub focus_throttle_interval: Duration,
    /// Fire the slow-loading callback when a fetch runs longer than this.
    pub loading_timeout: Option<Duration>,
    pub eviction: EvictionPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            deduping_interval: CacheDefaults::DEDUPING_INTERVAL,
            error_retry_count: CacheDefaults::ERROR_RETRY_COUNT,
            error_retry_interval: CacheDefaults::ERROR_RETRY_INTERVAL,
            max_retry_interval: CacheDefaults::MAX_RETRY_INTERVAL,
            retry_jitter: true,
            revalidate_on_focus: true,
            revalidate_on_reconnect: true,
            focus_throttle_interval: CacheDefaults::FOCUS_THROTTLE_INTERVAL,
            loading_timeout: Some(CacheDefaults::LOADING_TIMEOUT),
            eviction: EvictionPolicy::default(),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deduping_interval(mut self, interval: Duration) -> Self {
        self.deduping_interval = interval;
        self
    }

    pub fn with_error_retry(mut self, count: u32, interval: Duration) -> Self {
        self.error_retry_count = count;
        self.error_retry_interval = interval;
        self
    }

    pub fn with_retry_jitter(mut self, jitter: bool) -> Self {
        self.retry_jitter = jitter;
        self
    }

    pub fn with_loading_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.loading_timeout = timeout;
        self
    }

    pub fn with_focus_throttle_interval(mut self, interval: Duration) -> Self {
        self.focus_throttle_interval = interval;
        self
    }

    pub fn with_eviction(mut self, eviction: EvictionPolicy) -> Self {
        self.eviction = eviction;
        self
    }
}

/// Per-key overrides passed to `QueryCache::use_keyed`. `None` inherits the
/// cache-wide value.
#[derive(Debug, Clone, Default)]
pub struct KeyOptions {
    pub deduping_interval: Option<Duration>,
    pub error_retry_count: Option<u32>,
    pub error_retry_interval: Option<Duration>,
    pub revalidate_on_focus: Option<bool>,
    pub revalidate_on_reconnect: Option<bool>,
    pub loading_timeout: Option<Option<Duration>>,
}

impl KeyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deduping_interval(mut self, interval: Duration) -> Self {
        self.deduping_interval = Some(interval);
        self
    }

    pub fn error_retry(mut self, count: u32, interval: Duration) -> Self {
        self.error_retry_count = Some(count);
        self.error_retry_interval = Some(interval);
        self
    }

    pub fn revalidate_on_focus(mut self, enabled: bool) -> Self {
        self.revalidate_on_focus = Some(enabled);
        self
    }

    pub fn revalidate_on_reconnect(mut self, enabled: bool) -> Self {
        self.revalidate_on_reconnect = Some(enabled);
        self
    }

    pub fn loading_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.loading_timeout = Some(timeout);
        self
    }

    pub(crate) fn resolve(&self, config: &CacheConfig) -> ResolvedOptions {
        let retry = RetryConfig::new()
            .with_base_delay(
                self.error_retry_interval
                    .unwrap_or(config.error_retry_interval),
            )
            .with_max_delay(config.max_retry_interval)
            .with_jitter(config.retry_jitter);

        ResolvedOptions {
            deduping_interval: self.deduping_interval.unwrap_or(config.deduping_interval),
            error_retry_count: self.error_retry_count.unwrap_or(config.error_retry_count),
            retry,
            revalidate_on_focus: self.revalidate_on_focus.unwrap_or(config.revalidate_on_focus),
            revalidate_on_reconnect: self
                .revalidate_on_reconnect
                .unwrap_or(config.revalidate_on_reconnect),
            loading_timeout: self.loading_timeout.unwrap_or(config.loading_timeout),
        }
    }
}

/// Effective options for one cache entry.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedOptions {
    pub deduping_interval: Duration,
    pub error_retry_count: u32,
    pub retry: RetryConfig,
    pub revalidate_on_focus: bool,
    pub revalidate_on_reconnect: bool,
    pub loading_timeout: Option<Duration>,
}
