// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::network::{Protocol, DEFAULT_MAX_CACHE_SIZE, HEADER_LEN};
use crate::reactor::ReactorKind;

use super::{AppError, AppResult};

/// Socket level settings shared by client and server engines.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    pub protocol: Protocol,
    /// bind address for servers, remote address for clients, group address for multicast
    pub host: String,
    pub port: u16,
    /// size of a single socket read
    pub recv_buffer_size: usize,
    /// connect/send/receive timeout in milliseconds, 0 disables it
    pub timeout_ms: u64,
    pub ttl: Option<u32>,
    pub keep_alive: bool,
    pub reuse_address: bool,
    /// upper bound of the per-node partial frame cache
    pub max_cache_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            protocol: Protocol::Tcp,
            host: "127.0.0.1".to_string(),
            port: 8000,
            recv_buffer_size: 8 * 1024,
            timeout_ms: 3000,
            ttl: None,
            keep_alive: true,
            reuse_address: true,
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// ping period in milliseconds, 0 disables the driver
    pub period_ms: u64,
    pub max_failures: u32,
    /// granularity of the driver's sleep loop
    pub slice_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            period_ms: 0,
            max_failures: 2,
            slice_ms: 500,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ReactorConfig {
    pub kind: ReactorKind,
    /// only meaningful for the readiness reactor
    pub edge_triggered: bool,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        ReactorConfig {
            kind: ReactorKind::default(),
            edge_triggered: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct MulticastConfig {
    /// local interface used to join the group
    pub interface: String,
    pub loopback: bool,
    pub broadcast: bool,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        MulticastConfig {
            interface: Ipv4Addr::UNSPECIFIED.to_string(),
            loopback: true,
            broadcast: false,
        }
    }
}

/// Configuration of one engine. Every engine receives its own copy at construction.
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct NetConfig {
    pub network: NetworkConfig,
    pub heartbeat: HeartbeatConfig,
    pub reactor: ReactorConfig,
    pub multicast: MulticastConfig,
}

impl NetConfig {
    pub fn new(protocol: Protocol, host: impl Into<String>, port: u16) -> Self {
        let mut config = NetConfig::default();
        config.network.protocol = protocol;
        config.network.host = host.into();
        config.network.port = port;
        config
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::new(Protocol::Tcp, host, port)
    }

    pub fn udp(host: impl Into<String>, port: u16) -> Self {
        Self::new(Protocol::Udp, host, port)
    }

    pub fn multicast(group: impl Into<String>, port: u16) -> Self {
        Self::new(Protocol::UdpMulticast, group, port)
    }

    /// Loads a config file and overlays `FRAMENET_<SECTION>__<KEY>` environment variables.
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<NetConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(
                config::Environment::with_prefix("FRAMENET")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let net_config: NetConfig = config.try_deserialize()?;
        net_config.validate()?;

        Ok(net_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        let network = &self.network;
        if network.recv_buffer_size == 0 {
            return Err(AppError::InvalidValue(
                "network.recv_buffer_size must be positive".into(),
            ));
        }
        if network.max_cache_size < HEADER_LEN {
            return Err(AppError::InvalidValue(format!(
                "network.max_cache_size {} is smaller than the frame header",
                network.max_cache_size
            )));
        }
        if let Some(ttl) = network.ttl {
            if ttl > 255 {
                return Err(AppError::InvalidValue(format!(
                    "network.ttl {} out of range 0..=255",
                    ttl
                )));
            }
        }
        if self.heartbeat.period_ms > 0 && self.heartbeat.slice_ms == 0 {
            return Err(AppError::InvalidValue(
                "heartbeat.slice_ms must be positive when heartbeats are enabled".into(),
            ));
        }
        if network.protocol == Protocol::UdpMulticast {
            let group: Ipv4Addr = network.host.parse().map_err(|_| {
                AppError::InvalidAddress(format!("multicast group {}", network.host))
            })?;
            if !group.is_multicast() {
                return Err(AppError::InvalidAddress(format!(
                    "{} is not a multicast address",
                    group
                )));
            }
            self.multicast
                .interface
                .parse::<Ipv4Addr>()
                .map_err(|_| {
                    AppError::InvalidAddress(format!(
                        "multicast interface {}",
                        self.multicast.interface
                    ))
                })?;
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        match self.network.timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn heartbeat_enabled(&self) -> bool {
        self.heartbeat.period_ms > 0
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat.period_ms)
    }

    pub fn heartbeat_slice(&self) -> Duration {
        Duration::from_millis(self.heartbeat.slice_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = NetConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.network.max_cache_size, 64 * 1024 * 1024);
        assert_eq!(config.timeout(), Some(Duration::from_millis(3000)));
        assert!(!config.heartbeat_enabled());
    }

    #[test]
    fn test_load_partial_file() -> AppResult<()> {
        let mut file = NamedTempFile::with_suffix(".toml")?;
        writeln!(
            file,
            "[network]\nprotocol = \"udp\"\nport = 9100\n\n[heartbeat]\nperiod_ms = 3000\nmax_failures = 4\n\n[reactor]\nkind = \"completion\"\nedge_triggered = false"
        )?;

        let config = NetConfig::set_up_config(file.path())?;
        assert_eq!(config.network.protocol, Protocol::Udp);
        assert_eq!(config.network.port, 9100);
        // untouched keys keep their defaults
        assert_eq!(config.network.host, "127.0.0.1");
        assert_eq!(config.heartbeat.max_failures, 4);
        assert_eq!(config.heartbeat.slice_ms, 500);
        assert_eq!(config.reactor.kind, ReactorKind::Completion);
        assert!(!config.reactor.edge_triggered);
        Ok(())
    }

    #[test]
    fn test_rejects_non_multicast_group() {
        let config = NetConfig::multicast("10.0.0.1", 8000);
        assert!(matches!(
            config.validate(),
            Err(AppError::InvalidAddress(_))
        ));
        let config = NetConfig::multicast("239.0.0.1", 8000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_tiny_cache() {
        let mut config = NetConfig::tcp("127.0.0.1", 8000);
        config.network.max_cache_size = 4;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_environment_overrides_file() -> AppResult<()> {
        let mut file = NamedTempFile::with_suffix(".toml")?;
        writeln!(file, "[multicast]\nloopback = true")?;
        std::env::set_var("FRAMENET_MULTICAST__LOOPBACK", "false");
        let config = NetConfig::set_up_config(file.path());
        std::env::remove_var("FRAMENET_MULTICAST__LOOPBACK");
        assert!(!config?.multicast.loopback);
        Ok(())
    }
}
