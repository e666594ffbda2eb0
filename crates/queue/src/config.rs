//! Queue configuration
//!
//! Built once at startup (usually via [`QueueConfig::from_env`]) and passed
//! into each component at construction. Nothing here is global.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Required variable is not set
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    /// Variable is set but does not parse
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },

    /// Values parse but contradict each other
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Whether `acquire` re-reads the lease after writing it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimVerification {
    /// Trust the write (last writer wins, undetected)
    None,
    /// Read the lease back and back off if another worker's write landed last
    #[default]
    ReadBack,
}

/// How producer tasks reach a processor. Selected once at construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Persist into the KV queue for polling workers
    #[default]
    KvQueue,
    /// POST each task to an HTTP endpoint
    Webhook {
        url: String,
        #[serde(with = "duration_secs")]
        timeout: Duration,
    },
    /// Run an in-process handler and store its result
    Direct,
}

impl DeliveryMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::KvQueue => "kv_queue",
            Self::Webhook { .. } => "webhook",
            Self::Direct => "direct",
        }
    }
}

/// What a push delivery (webhook, direct) does when it fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Surface the failure to the producer
    #[default]
    Reject,
    /// Enqueue into the KV queue and report a degraded acceptance
    QueueFallback,
}

/// Queue configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Deployment prefix prepended to every key
    pub key_prefix: String,

    /// TaskRecord TTL (abandonment bound)
    #[serde(with = "duration_secs")]
    pub task_ttl: Duration,

    /// LeaseRecord TTL (processing budget before a lease self-expires)
    #[serde(with = "duration_secs")]
    pub lease_ttl: Duration,

    /// ResultRecord TTL (consumer pickup window)
    #[serde(with = "duration_secs")]
    pub result_ttl: Duration,

    /// Index snapshots younger than this are served without listing
    #[serde(with = "duration_secs")]
    pub index_freshness: Duration,

    /// Index snapshots younger than this may be served when listing fails
    #[serde(with = "duration_secs")]
    pub index_staleness_tolerance: Duration,

    /// Maximum available ids tried per claim
    pub max_claim_candidates: usize,

    pub claim_verification: ClaimVerification,

    pub delivery: DeliveryMode,

    /// How long a direct-mode handler may run before the delivery fails
    #[serde(with = "duration_secs")]
    pub direct_timeout: Duration,

    pub fallback: FallbackPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            key_prefix: String::new(),
            task_ttl: Duration::from_secs(3600),
            lease_ttl: Duration::from_secs(300),
            result_ttl: Duration::from_secs(3600),
            index_freshness: Duration::from_secs(300),
            index_staleness_tolerance: Duration::from_secs(1800),
            max_claim_candidates: 8,
            claim_verification: ClaimVerification::ReadBack,
            delivery: DeliveryMode::KvQueue,
            direct_timeout: Duration::from_secs(30),
            fallback: FallbackPolicy::Reject,
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_task_ttl(mut self, ttl: Duration) -> Self {
        self.task_ttl = ttl;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = ttl;
        self
    }

    pub fn with_index_freshness(mut self, window: Duration) -> Self {
        self.index_freshness = window;
        self
    }

    pub fn with_index_staleness_tolerance(mut self, window: Duration) -> Self {
        self.index_staleness_tolerance = window;
        self
    }

    pub fn with_max_claim_candidates(mut self, max: usize) -> Self {
        self.max_claim_candidates = max.max(1);
        self
    }

    pub fn with_claim_verification(mut self, verification: ClaimVerification) -> Self {
        self.claim_verification = verification;
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryMode) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_direct_timeout(mut self, timeout: Duration) -> Self {
        self.direct_timeout = timeout;
        self
    }

    pub fn with_fallback(mut self, fallback: FallbackPolicy) -> Self {
        self.fallback = fallback;
        self
    }

    /// TTL of the shared index snapshot key
    ///
    /// Twice the freshness window, stretched to the staleness tolerance so a
    /// snapshot written by another worker is still readable as a fallback.
    pub fn index_snapshot_ttl(&self) -> Duration {
        (self.index_freshness * 2).max(self.index_staleness_tolerance)
    }

    /// Reject contradictory settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, ttl) in [
            ("task_ttl", self.task_ttl),
            ("lease_ttl", self.lease_ttl),
            ("result_ttl", self.result_ttl),
            ("index_freshness", self.index_freshness),
            ("direct_timeout", self.direct_timeout),
        ] {
            if ttl.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }
        if self.index_staleness_tolerance < self.index_freshness {
            return Err(ConfigError::Invalid(
                "index_staleness_tolerance must be at least index_freshness".to_string(),
            ));
        }
        if self.max_claim_candidates == 0 {
            return Err(ConfigError::Invalid(
                "max_claim_candidates must be at least 1".to_string(),
            ));
        }
        if let DeliveryMode::Webhook { url, timeout } = &self.delivery {
            if url.is_empty() {
                return Err(ConfigError::Invalid("webhook url is empty".to_string()));
            }
            if timeout.is_zero() {
                return Err(ConfigError::Invalid(
                    "webhook timeout must be non-zero".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `TASKRELAY_KEY_PREFIX`: key prefix (default: none)
    /// - `TASKRELAY_TASK_TTL_SECS`: task TTL (default: 3600)
    /// - `TASKRELAY_LEASE_TTL_SECS`: lease TTL (default: 300)
    /// - `TASKRELAY_RESULT_TTL_SECS`: result TTL (default: 3600)
    /// - `TASKRELAY_INDEX_FRESHNESS_SECS`: index freshness window (default: 300)
    /// - `TASKRELAY_INDEX_STALENESS_SECS`: index staleness tolerance (default: 1800)
    /// - `TASKRELAY_MAX_CLAIM_CANDIDATES`: ids tried per claim (default: 8)
    /// - `TASKRELAY_CLAIM_VERIFICATION`: `read_back` or `none` (default: read_back)
    /// - `TASKRELAY_DELIVERY_MODE`: `kv_queue`, `webhook` or `direct` (default: kv_queue)
    /// - `TASKRELAY_WEBHOOK_URL`: required for webhook mode
    /// - `TASKRELAY_WEBHOOK_TIMEOUT_SECS`: webhook timeout (default: 10)
    /// - `TASKRELAY_DIRECT_TIMEOUT_SECS`: direct handler timeout (default: 30)
    /// - `TASKRELAY_DELIVERY_FALLBACK`: `reject` or `queue` (default: reject)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup
    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(prefix) = lookup("TASKRELAY_KEY_PREFIX") {
            config.key_prefix = prefix;
        }
        if let Some(ttl) = parse_secs(&lookup, "TASKRELAY_TASK_TTL_SECS")? {
            config.task_ttl = ttl;
        }
        if let Some(ttl) = parse_secs(&lookup, "TASKRELAY_LEASE_TTL_SECS")? {
            config.lease_ttl = ttl;
        }
        if let Some(ttl) = parse_secs(&lookup, "TASKRELAY_RESULT_TTL_SECS")? {
            config.result_ttl = ttl;
        }
        if let Some(window) = parse_secs(&lookup, "TASKRELAY_INDEX_FRESHNESS_SECS")? {
            config.index_freshness = window;
        }
        if let Some(window) = parse_secs(&lookup, "TASKRELAY_INDEX_STALENESS_SECS")? {
            config.index_staleness_tolerance = window;
        }
        if let Some(raw) = lookup("TASKRELAY_MAX_CLAIM_CANDIDATES") {
            config.max_claim_candidates =
                raw.parse().map_err(|_| ConfigError::InvalidValue {
                    name: "TASKRELAY_MAX_CLAIM_CANDIDATES",
                    value: raw.clone(),
                })?;
        }
        if let Some(raw) = lookup("TASKRELAY_CLAIM_VERIFICATION") {
            config.claim_verification = match raw.as_str() {
                "read_back" => ClaimVerification::ReadBack,
                "none" => ClaimVerification::None,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        name: "TASKRELAY_CLAIM_VERIFICATION",
                        value: raw,
                    })
                }
            };
        }
        if let Some(raw) = lookup("TASKRELAY_DELIVERY_MODE") {
            config.delivery = match raw.as_str() {
                "kv_queue" => DeliveryMode::KvQueue,
                "direct" => DeliveryMode::Direct,
                "webhook" => DeliveryMode::Webhook {
                    url: lookup("TASKRELAY_WEBHOOK_URL")
                        .ok_or(ConfigError::Missing("TASKRELAY_WEBHOOK_URL"))?,
                    timeout: parse_secs(&lookup, "TASKRELAY_WEBHOOK_TIMEOUT_SECS")?
                        .unwrap_or(Duration::from_secs(10)),
                },
                _ => {
                    return Err(ConfigError::InvalidValue {
                        name: "TASKRELAY_DELIVERY_MODE",
                        value: raw,
                    })
                }
            };
        }
        if let Some(timeout) = parse_secs(&lookup, "TASKRELAY_DIRECT_TIMEOUT_SECS")? {
            config.direct_timeout = timeout;
        }
        if let Some(raw) = lookup("TASKRELAY_DELIVERY_FALLBACK") {
            config.fallback = match raw.as_str() {
                "reject" => FallbackPolicy::Reject,
                "queue" => FallbackPolicy::QueueFallback,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        name: "TASKRELAY_DELIVERY_FALLBACK",
                        value: raw,
                    })
                }
            };
        }

        config.validate()?;
        Ok(config)
    }
}

/// Read a whole-seconds duration from the process environment
pub fn env_secs(name: &'static str) -> Result<Option<Duration>, ConfigError> {
    parse_secs(&|key: &str| std::env::var(key).ok(), name)
}

fn parse_secs<F>(lookup: &F, name: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
        None => Ok(None),
    }
}

/// Serde support for Duration as whole seconds
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
