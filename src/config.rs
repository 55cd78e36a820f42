use std::fs::{read_to_string, write};
use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use serde::{Deserialize, Serialize};

///
/// The external endpoint pool and the internal address range it NATs for.
///
/// `internal_ip_*`/`internal_port_*` document the private-side range this
/// deployment's internal hosts live in; nothing in this crate enforces it
/// against incoming MAP/PEER requests (the source this was distilled from
/// doesn't either), it is schema-compatible config for a future validation
/// pass or an operator's own records. The external range is what
/// `AllocatorState` (`pcp_sdn_nat`) actually draws from. Only round-robin
/// allocation is implemented (per the forwarder-programmer design);
/// `ip_allocation_type`/`port_allocation_type` are accepted for config-file
/// compatibility but any value other than the default logs a warning at
/// startup rather than changing behavior.
///
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct NatPoolConfig {
    #[serde(default = "NatPoolConfig::internal_ip_low_end")]
    pub internal_ip_low_end: Ipv4Addr,
    #[serde(default = "NatPoolConfig::internal_ip_high_end")]
    pub internal_ip_high_end: Ipv4Addr,
    #[serde(default = "NatPoolConfig::internal_port_low_end")]
    pub internal_port_low_end: u16,
    #[serde(default = "NatPoolConfig::internal_port_high_end")]
    pub internal_port_high_end: u16,
    #[serde(default = "NatPoolConfig::external_ip_low_end")]
    pub external_ip_low_end: Ipv4Addr,
    #[serde(default = "NatPoolConfig::external_ip_high_end")]
    pub external_ip_high_end: Ipv4Addr,
    #[serde(default = "NatPoolConfig::external_port_low_end")]
    pub external_port_low_end: u16,
    #[serde(default = "NatPoolConfig::external_port_high_end")]
    pub external_port_high_end: u16,
    #[serde(default)]
    pub ip_allocation_type: IpAllocationType,
    #[serde(default)]
    pub port_allocation_type: PortAllocationType,
}

impl NatPoolConfig {
    fn internal_ip_low_end() -> Ipv4Addr {
        Ipv4Addr::new(172, 16, 0, 2)
    }

    fn internal_ip_high_end() -> Ipv4Addr {
        Ipv4Addr::new(172, 16, 255, 254)
    }

    fn internal_port_low_end() -> u16 {
        1
    }

    fn internal_port_high_end() -> u16 {
        65535
    }

    fn external_ip_low_end() -> Ipv4Addr {
        Ipv4Addr::new(200, 0, 0, 2)
    }

    fn external_ip_high_end() -> Ipv4Addr {
        Ipv4Addr::new(200, 0, 255, 254)
    }

    fn external_port_low_end() -> u16 {
        49152
    }

    fn external_port_high_end() -> u16 {
        65535
    }

    /// Enumerate every external IP the pool covers, low end to high end
    /// inclusive, for handing to `AllocatorState::new`.
    pub fn external_ips(&self) -> Vec<Ipv4Addr> {
        let low = u32::from(self.external_ip_low_end);
        let high = u32::from(self.external_ip_high_end);
        (low..=high).map(Ipv4Addr::from).collect()
    }

    pub fn external_ports(&self) -> std::ops::Range<u16> {
        self.external_port_low_end..self.external_port_high_end.saturating_add(1)
    }
}

impl Default for NatPoolConfig {
    fn default() -> Self {
        Self {
            internal_ip_low_end: Self::internal_ip_low_end(),
            internal_ip_high_end: Self::internal_ip_high_end(),
            internal_port_low_end: Self::internal_port_low_end(),
            internal_port_high_end: Self::internal_port_high_end(),
            external_ip_low_end: Self::external_ip_low_end(),
            external_ip_high_end: Self::external_ip_high_end(),
            external_port_low_end: Self::external_port_low_end(),
            external_port_high_end: Self::external_port_high_end(),
            ip_allocation_type: IpAllocationType::default(),
            port_allocation_type: PortAllocationType::default(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpAllocationType {
    #[default]
    #[serde(rename = "ROUND_ROBIN")]
    RoundRobin,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortAllocationType {
    #[default]
    #[serde(rename = "RANDOM")]
    Random,
}

///
/// Top-level controller configuration, persisted as JSON.
///
/// Every field has a factory default so a config file only needs to
/// override what differs; [`Config::load`] writes the full set of
/// defaults to disk the first time it runs without one, so operators have
/// something to edit rather than guessing the schema.
///
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    #[serde(default = "Config::pcp_server_listening_port")]
    pub pcp_server_listening_port: u16,
    #[serde(default = "Config::pcp_client_multicast_port")]
    pub pcp_client_multicast_port: u16,
    #[serde(default)]
    pub default_pcp_map_assigned_lifetime_seconds: u32,
    #[serde(default)]
    pub default_pcp_peer_assigned_lifetime_seconds: u32,
    #[serde(default = "Config::default_nat_flow_entry_priority")]
    pub default_nat_flow_entry_priority: u16,
    #[serde(default = "Config::default_mac_modifying_flow_entries_priority")]
    pub default_mac_modifying_flow_entries_priority: u16,
    #[serde(default = "Config::default_arp_forwarding_priority")]
    pub default_arp_forwarding_priority: u16,
    #[serde(default = "Config::default_pcp_forwarding_priority")]
    pub default_pcp_forwarding_priority: u16,
    #[serde(default)]
    pub default_nat_pool_config: NatPoolConfig,
    /// OpenFlow port number facing the internal (access) network. Spec's
    /// nominal schema does not enumerate this alongside the pool settings,
    /// but §4.3/§6 both require it (the controller assumes exactly one
    /// attached forwarder with two ports); see DESIGN.md.
    #[serde(default = "Config::access_port")]
    pub access_port: u32,
    /// OpenFlow port number facing the external network.
    #[serde(default = "Config::external_port")]
    pub external_port: u32,
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    fn pcp_server_listening_port() -> u16 {
        5351
    }

    fn pcp_client_multicast_port() -> u16 {
        5350
    }

    fn default_nat_flow_entry_priority() -> u16 {
        1
    }

    fn default_mac_modifying_flow_entries_priority() -> u16 {
        1
    }

    fn default_arp_forwarding_priority() -> u16 {
        2
    }

    fn default_pcp_forwarding_priority() -> u16 {
        3
    }

    fn access_port() -> u32 {
        1
    }

    fn external_port() -> u32 {
        2
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pcp_server_listening_port: Self::pcp_server_listening_port(),
            pcp_client_multicast_port: Self::pcp_client_multicast_port(),
            default_pcp_map_assigned_lifetime_seconds: 0,
            default_pcp_peer_assigned_lifetime_seconds: 0,
            default_nat_flow_entry_priority: Self::default_nat_flow_entry_priority(),
            default_mac_modifying_flow_entries_priority:
                Self::default_mac_modifying_flow_entries_priority(),
            default_arp_forwarding_priority: Self::default_arp_forwarding_priority(),
            default_pcp_forwarding_priority: Self::default_pcp_forwarding_priority(),
            default_nat_pool_config: NatPoolConfig::default(),
            access_port: Self::access_port(),
            external_port: Self::external_port(),
            log: LogConfig::default(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct LogConfig {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS")
)]
struct Cli {
    ///
    /// Path to the controller's JSON config file. Created with factory
    /// defaults on first run if it does not exist.
    ///
    /// Example: pcp-sdn --config /etc/pcp-sdn/config.json
    ///
    #[arg(long, short, default_value = "config.json")]
    config: PathBuf,
}

impl Config {
    ///
    /// Parse the command line, then load the config file it points at,
    /// creating it with factory defaults if it is not present.
    ///
    pub fn load() -> Result<Self> {
        let path = Cli::parse().config;
        if !path.exists() {
            let defaults = Self::default();
            write(&path, serde_json::to_string_pretty(&defaults)?)?;
            return Ok(defaults);
        }

        let config: Self = serde_json5::from_str(&read_to_string(&path)?)?;
        if config.default_nat_pool_config.ip_allocation_type != IpAllocationType::RoundRobin {
            log::warn!("ip_allocation_type other than ROUND_ROBIN is not implemented; ignoring");
        }
        Ok(config)
    }
}
