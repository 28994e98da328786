//! Server configuration.

use std::{net::SocketAddr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{ServerError, tls::TlsConfig};

/// Which address families the listener accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenMode {
    /// Bind the first resolved address of either family.
    #[default]
    Both,
    /// Only bind IPv4 addresses.
    Ipv4Only,
    /// Only bind IPv6 addresses.
    Ipv6Only,
}

impl ListenMode {
    /// True if `addr` belongs to an accepted family.
    pub fn accepts(self, addr: &SocketAddr) -> bool {
        match self {
            Self::Both => true,
            Self::Ipv4Only => addr.is_ipv4(),
            Self::Ipv6Only => addr.is_ipv6(),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind, as `host:port`. Port 0 picks a free port.
    pub address: String,

    /// Address family filter.
    pub mode: ListenMode,

    /// Maximum concurrent clients. 0 means unbounded.
    pub max_clients: usize,

    /// Period of the background metrics and cleanup job.
    pub tick_interval: Duration,

    /// Enable TLS with a certificate chain and key loaded from PEM files.
    pub tls: Option<TlsConfig>,

    /// Time allowed for a client to complete the TLS handshake.
    pub tls_handshake_timeout: Duration,

    /// Disable Nagle's algorithm on accepted connections.
    pub no_delay: bool,
}

impl ServerConfig {
    /// Default bind address.
    pub const DEFAULT_ADDRESS: &'static str = "0.0.0.0:7000";

    /// Default background tick period.
    pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

    /// Default TLS handshake timeout.
    pub const DEFAULT_TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

    /// Configuration with defaults, listening on `address`.
    pub fn new(address: impl Into<String>) -> Self {
        Self { address: address.into(), ..Self::default() }
    }

    /// Check values that would otherwise fail later at runtime.
    ///
    /// # Errors
    ///
    /// [`ServerError::Config`] for an empty address or zero intervals.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.address.trim().is_empty() {
            return Err(ServerError::Config("bind address is empty".to_string()));
        }
        if self.tick_interval.is_zero() {
            return Err(ServerError::Config("tick interval must be non-zero".to_string()));
        }
        if self.tls.is_some() && self.tls_handshake_timeout.is_zero() {
            return Err(ServerError::Config("TLS handshake timeout must be non-zero".to_string()));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: Self::DEFAULT_ADDRESS.to_string(),
            mode: ListenMode::Both,
            max_clients: 0,
            tick_interval: Self::DEFAULT_TICK_INTERVAL,
            tls: None,
            tls_handshake_timeout: Self::DEFAULT_TLS_HANDSHAKE_TIMEOUT,
            no_delay: true,
        }
    }
}
