// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Collective runtime configuration.
//!
//! Sources in priority order (lowest to highest):
//! 1. Code defaults
//! 2. System config file at /opt/dynamo/etc/collective.toml
//! 3. TOML file from the DYN_COLLECTIVE_CONFIG_PATH environment variable
//! 4. Environment variables:
//!    - `DYN_COLLECTIVE_MAX_GROUPS`
//!    - `DYN_COLLECTIVE_BARRIER_*` -> `barrier.*`
//!    - `DYN_COLLECTIVE_TCP_*` -> `tcp.*`
//!
//! ## TOML Example
//!
//! ```toml
//! max_groups = 64
//!
//! [barrier]
//! liveness_interval_ms = 250
//!
//! [tcp]
//! rank = 1
//! peers = ["10.0.0.1:7000", "10.0.0.2:7000"]
//! ```

use std::time::Duration;

use anyhow::Context;
use dynamo_collective_transport::tcp::{TcpTransport, parse_tcp_endpoint};
use figment::{
    Figment, Provider,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("Configuration error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Top-level collective configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CollectiveConfig {
    /// Maximum number of live groups, counting the global group.
    #[validate(range(min = 1, max = 4096))]
    #[serde(default = "default_max_groups")]
    pub max_groups: usize,

    #[validate(nested)]
    #[serde(default)]
    pub barrier: BarrierConfig,

    /// TCP transport settings. None = the caller supplies a transport.
    #[validate(nested)]
    #[serde(default)]
    pub tcp: Option<TcpConfig>,
}

fn default_max_groups() -> usize {
    32
}

impl Default for CollectiveConfig {
    fn default() -> Self {
        Self {
            max_groups: default_max_groups(),
            barrier: BarrierConfig::default(),
            tcp: None,
        }
    }
}

impl CollectiveConfig {
    /// Create a Figment configuration with all sources merged.
    pub fn figment() -> Figment {
        let config_path = std::env::var("DYN_COLLECTIVE_CONFIG_PATH").unwrap_or_default();

        Figment::new()
            .merge(Serialized::defaults(CollectiveConfig::default()))
            .merge(Toml::file("/opt/dynamo/etc/collective.toml"))
            .merge(Toml::file(&config_path))
            // Top-level: DYN_COLLECTIVE_MAX_GROUPS
            .merge(Env::prefixed("DYN_COLLECTIVE_").only(&["max_groups"]))
            // Barrier: DYN_COLLECTIVE_BARRIER_LIVENESS_INTERVAL_MS, etc.
            .merge(
                Env::prefixed("DYN_COLLECTIVE_BARRIER_")
                    .map(|k| format!("barrier.{}", k.as_str().to_lowercase()).into()),
            )
            // TCP: DYN_COLLECTIVE_TCP_RANK, DYN_COLLECTIVE_TCP_PEERS (comma-separated), etc.
            .merge(
                Env::prefixed("DYN_COLLECTIVE_TCP_")
                    .map(|k| format!("tcp.{}", k.as_str().to_lowercase()).into()),
            )
    }

    /// Load configuration from default figment (env and files).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::extract_from(Self::figment())
    }

    /// Extract and validate configuration from any provider.
    ///
    /// # Example
    /// ```rust,ignore
    /// let config = CollectiveConfig::extract_from(
    ///     CollectiveConfig::figment().merge(("barrier.liveness_interval_ms", 20u64)),
    /// )?;
    /// ```
    pub fn extract_from<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Build a figment from defaults, then merge a custom provider.
    pub fn figment_with<T: Provider>(extra: T) -> Figment {
        Self::figment().merge(extra)
    }
}

/// Barrier timing.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BarrierConfig {
    /// How often a waiting member probes the peer it is waiting on.
    #[validate(range(min = 1))]
    #[serde(default = "default_liveness_interval_ms")]
    pub liveness_interval_ms: u64,

    /// Upper bound on a single liveness probe.
    #[validate(range(min = 1))]
    #[serde(default = "default_health_check_timeout_ms")]
    pub health_check_timeout_ms: u64,
}

fn default_liveness_interval_ms() -> u64 {
    100
}

fn default_health_check_timeout_ms() -> u64 {
    500
}

impl Default for BarrierConfig {
    fn default() -> Self {
        Self {
            liveness_interval_ms: default_liveness_interval_ms(),
            health_check_timeout_ms: default_health_check_timeout_ms(),
        }
    }
}

impl BarrierConfig {
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms.max(1))
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms.max(1))
    }
}

/// Settings for the reference TCP transport.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_tcp_world"))]
pub struct TcpConfig {
    /// Rank of this process.
    pub rank: u32,

    /// Listener address. Defaults to this rank's entry in `peers`.
    #[serde(default)]
    pub bind_addr: Option<String>,

    /// Rank-ordered endpoints of every process, this one included.
    ///
    /// Accepts a list, or a comma-separated string when set from the
    /// environment.
    #[serde(default, deserialize_with = "deserialize_peers")]
    pub peers: Vec<String>,

    #[validate(range(min = 1))]
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[validate(range(min = 1))]
    #[serde(default = "default_connect_retry_ms")]
    pub connect_retry_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_connect_retry_ms() -> u64 {
    50
}

fn validate_tcp_world(config: &TcpConfig) -> Result<(), ValidationError> {
    if config.peers.is_empty() {
        return Err(ValidationError::new("tcp_peers_empty"));
    }
    if config.rank as usize >= config.peers.len() {
        return Err(ValidationError::new("tcp_rank_out_of_range"));
    }
    Ok(())
}

fn deserialize_peers<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Peers {
        List(Vec<String>),
        Csv(String),
    }

    Ok(match Peers::deserialize(deserializer)? {
        Peers::List(peers) => peers,
        Peers::Csv(csv) => csv
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
    })
}

impl TcpConfig {
    pub fn new(rank: u32, peers: Vec<String>) -> Self {
        Self {
            rank,
            bind_addr: None,
            peers,
            connect_timeout_ms: default_connect_timeout_ms(),
            connect_retry_ms: default_connect_retry_ms(),
        }
    }

    /// Build the TCP transport these settings describe.
    pub fn build_transport(&self) -> Result<TcpTransport, ConfigError> {
        let mut builder = TcpTransport::builder()
            .rank(self.rank)
            .peers(self.peers.iter().cloned())
            .connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .connect_retry(Duration::from_millis(self.connect_retry_ms));

        if let Some(bind_addr) = &self.bind_addr {
            let addr = parse_tcp_endpoint(bind_addr)
                .with_context(|| format!("invalid tcp.bind_addr '{bind_addr}'"))?;
            builder = builder.bind_addr(addr);
        }

        Ok(builder.build()?)
    }
}
