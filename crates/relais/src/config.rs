//! Client and pool configuration.
//!
//! Built in code with `with_*` builders; [`PoolConfig::from_env`] overlays
//! `RELAIS_*` environment variables for deployments that tune the pool without
//! recompiling.

use std::time::Duration;

use crate::bridge::codec::DEFAULT_MAX_LINE_BYTES;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be at least 1")]
    Zero { name: &'static str },
    #[error("invalid value for {var}: {value:?} ({reason})")]
    InvalidEnv {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Per-host supervision settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Bound on process start + setup + handshake. Model loading is slow.
    pub handshake_timeout: Duration,
    /// Deadline for one request/response round trip. `None` waits forever,
    /// which cannot tell a wedged host from a slow one.
    pub call_timeout: Option<Duration>,
    /// How long to wait at each shutdown escalation step.
    pub shutdown_grace: Duration,
    pub max_line_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(300),
            call_timeout: Some(Duration::from_secs(120)),
            shutdown_grace: Duration::from_secs(2),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl ClientConfig {
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_max_line_bytes(mut self, max: usize) -> Self {
        self.max_line_bytes = max;
        self
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of hosts, and of worker tasks (one per host).
    pub workers: usize,
    /// Target chunks per worker. Higher balances load better at the cost of
    /// more per-chunk bookkeeping.
    pub fan_out: usize,
    /// Smallest chunk, in lines, for short inputs.
    pub min_chunk: usize,
    /// Delay between consecutive host launches.
    pub stagger: Duration,
    pub client: ClientConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            fan_out: 4,
            min_chunk: 10,
            stagger: Duration::from_secs(1),
            client: ClientConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            ..Self::default()
        }
    }

    pub fn with_fan_out(mut self, fan_out: usize) -> Self {
        self.fan_out = fan_out;
        self
    }

    pub fn with_min_chunk(mut self, min_chunk: usize) -> Self {
        self.min_chunk = min_chunk;
        self
    }

    pub fn with_stagger(mut self, stagger: Duration) -> Self {
        self.stagger = stagger;
        self
    }

    pub fn with_client(mut self, client: ClientConfig) -> Self {
        self.client = client;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("workers", self.workers),
            ("fan_out", self.fan_out),
            ("min_chunk", self.min_chunk),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { name });
            }
        }
        Ok(())
    }

    /// Defaults overlaid with `RELAIS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().overlay(|var| std::env::var(var).ok())
    }

    /// Overlay settings from a variable lookup (the process environment in
    /// [`from_env`](Self::from_env)).
    pub fn overlay(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let read = |var: &'static str| -> Result<Option<u64>, ConfigError> {
            match lookup(var) {
                None => Ok(None),
                Some(value) => value
                    .trim()
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|e| ConfigError::InvalidEnv {
                        var,
                        value,
                        reason: e.to_string(),
                    }),
            }
        };
        let count = |var: &'static str, n: u64| -> Result<usize, ConfigError> {
            usize::try_from(n).map_err(|e| ConfigError::InvalidEnv {
                var,
                value: n.to_string(),
                reason: e.to_string(),
            })
        };

        if let Some(n) = read("RELAIS_WORKERS")? {
            self.workers = count("RELAIS_WORKERS", n)?;
        }
        if let Some(n) = read("RELAIS_FAN_OUT")? {
            self.fan_out = count("RELAIS_FAN_OUT", n)?;
        }
        if let Some(n) = read("RELAIS_MIN_CHUNK")? {
            self.min_chunk = count("RELAIS_MIN_CHUNK", n)?;
        }
        if let Some(ms) = read("RELAIS_STAGGER_MS")? {
            self.stagger = Duration::from_millis(ms);
        }
        if let Some(ms) = read("RELAIS_CALL_TIMEOUT_MS")? {
            // 0 disables the deadline
            self.client.call_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(ms) = read("RELAIS_HANDSHAKE_TIMEOUT_MS")? {
            self.client.handshake_timeout = Duration::from_millis(ms);
        }

        self.validate()?;
        Ok(self)
    }
}
