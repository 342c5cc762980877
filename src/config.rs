//! Client configuration with validated construction.
//!
//! Values arrive from the embedding application as opaque strings and
//! durations; validation happens once, loudly, before any component is
//! built. The public-key material is carried untouched for an outer
//! encryption layer — this crate never interprets it.

use std::time::Duration;

use thiserror::Error;

/// Target addresses for both channel kinds.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Endpoints {
    /// Address dialled by the persistent adapter.
    pub persistent: String,
    /// Address dialled per-call by the transient adapter.
    pub transient: String,
}

impl Endpoints {
    /// Build an endpoint pair.
    #[must_use]
    pub fn new(persistent: impl Into<String>, transient: impl Into<String>) -> Self {
        Self {
            persistent: persistent.into(),
            transient: transient.into(),
        }
    }
}

/// Configuration consumed by [`crate::manager::TransportManager`].
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Identity naming the one persistent connection; push handlers are
    /// keyed by it.
    pub connection_identity: String,
    /// Target addresses for both channel kinds.
    pub endpoints: Endpoints,
    /// Identifier of the public key used by an outer encryption layer.
    pub public_key_id: Option<String>,
    /// Opaque public-key material for an outer encryption layer.
    pub public_key: Option<String>,
    /// Interval between keep-alive frames on the persistent connection.
    pub keepalive_interval: Duration,
    /// Close the persistent connection after this long with no traffic in
    /// either direction.
    pub idle_timeout: Duration,
    /// Fixed deadline covering one whole transient exchange.
    pub transient_timeout: Duration,
    /// Scheduler concurrency cap.
    pub concurrency: usize,
}

/// Default keep-alive interval for the persistent connection.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
/// Default idle timeout for the persistent connection.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
/// Default deadline for one transient exchange.
pub const DEFAULT_TRANSIENT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default scheduler concurrency cap.
pub const DEFAULT_CONCURRENCY: usize = 24;

impl ClientConfig {
    /// Build a configuration with default timings and concurrency.
    #[must_use]
    pub fn new(
        connection_identity: impl Into<String>,
        persistent_addr: impl Into<String>,
        transient_addr: impl Into<String>,
    ) -> Self {
        Self {
            connection_identity: connection_identity.into(),
            endpoints: Endpoints::new(persistent_addr, transient_addr),
            public_key_id: None,
            public_key: None,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            transient_timeout: DEFAULT_TRANSIENT_TIMEOUT,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Override the keep-alive interval.
    #[must_use]
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Override the idle timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Override the transient exchange deadline.
    #[must_use]
    pub fn transient_timeout(mut self, timeout: Duration) -> Self {
        self.transient_timeout = timeout;
        self
    }

    /// Override the scheduler concurrency cap.
    #[must_use]
    pub fn concurrency(mut self, cap: usize) -> Self {
        self.concurrency = cap;
        self
    }

    /// Attach public-key material for an outer encryption layer.
    #[must_use]
    pub fn public_key(mut self, key_id: impl Into<String>, key: impl Into<String>) -> Self {
        self.public_key_id = Some(key_id.into());
        self.public_key = Some(key.into());
        self
    }

    /// Validate value ranges.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] naming the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection_identity.is_empty() {
            return Err(ConfigError::EmptyIdentity);
        }
        if self.endpoints.persistent.is_empty() {
            return Err(ConfigError::EmptyAddress("persistent"));
        }
        if self.endpoints.transient.is_empty() {
            return Err(ConfigError::EmptyAddress("transient"));
        }
        if self.keepalive_interval.is_zero() {
            return Err(ConfigError::ZeroKeepalive);
        }
        if self.idle_timeout <= self.keepalive_interval {
            return Err(ConfigError::KeepaliveNotBelowIdle);
        }
        if self.transient_timeout.is_zero() {
            return Err(ConfigError::ZeroTransientTimeout);
        }
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        Ok(())
    }
}

/// Configuration constraint violations.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The connection identity is empty.
    #[error("connection identity must not be empty")]
    EmptyIdentity,
    /// An endpoint address is empty.
    #[error("{0} address must not be empty")]
    EmptyAddress(&'static str),
    /// The keep-alive interval is zero.
    #[error("keepalive interval must be non-zero")]
    ZeroKeepalive,
    /// The idle timeout does not exceed the keep-alive interval.
    #[error("idle timeout must be greater than the keepalive interval")]
    KeepaliveNotBelowIdle,
    /// The transient exchange deadline is zero.
    #[error("transient timeout must be non-zero")]
    ZeroTransientTimeout,
    /// The concurrency cap is zero.
    #[error("concurrency cap must be at least 1")]
    ZeroConcurrency,
}
