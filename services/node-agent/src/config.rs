//! Configuration for the node agent.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use stratus_id::NodeId;
use stratus_networking::{Block, MTU_DEFAULT_ETHERNET, MTU_MAX_JUMBO};

use crate::error::{Error, Result};

/// How VMs on this node obtain their external address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkMode {
    /// Lease client inside the namespace.
    #[default]
    Dhcp,
    /// Address leased from the node's static block.
    Static,
    /// No external network at all.
    Internal,
}

impl FromStr for NetworkMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dhcp" => Ok(Self::Dhcp),
            "static" => Ok(Self::Static),
            "internal" => Ok(Self::Internal),
            other => Err(Error::Configuration(format!(
                "unknown network mode: {}",
                other
            ))),
        }
    }
}

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    /// Root for disks, images, VM working dirs and local state.
    pub lib_dir: PathBuf,

    /// Directory holding VM unit files.
    pub systemd_dir: PathBuf,

    /// Runtime directory for sockets and pid files.
    pub run_dir: PathBuf,

    /// Where host interfaces show up once created.
    pub sysfs_net_dir: PathBuf,

    pub network_mode: NetworkMode,

    /// VLAN-over-VXLAN encapsulation for internal traffic.
    pub overlay: bool,

    pub jumbo_frames: bool,
    pub jumbo_mtu: u16,
    pub normal_mtu: u16,

    /// Bridges carrying external traffic.
    pub external_bridges: Vec<String>,

    /// Bridges carrying internal traffic without the overlay.
    pub internal_bridges: Vec<String>,

    /// Bridge carrying internal traffic with the overlay.
    pub overlay_bridge: String,

    /// Block used in static network mode.
    pub static_block: Option<Block>,

    /// Block for host-management addresses.
    pub host_block: Option<Block>,

    /// Seconds to wait for a started VM to report running.
    pub start_timeout: u32,

    /// Seconds to wait for a VM to stop after a shutdown request.
    pub stop_timeout: u32,

    /// Age after which a cached disk list is refreshed.
    pub refresh_rate: Duration,

    /// Age after which a cached running state is revalidated.
    pub virt_refresh: Duration,

    /// Pause after stopping a VM before tearing down its network.
    pub settle: Duration,

    /// Pause before polling for the public address.
    pub address_settle: Duration,

    /// Interval between reconciliation passes.
    pub reconcile_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: NodeId::new(),
            lib_dir: PathBuf::from("/var/lib/stratus"),
            systemd_dir: PathBuf::from("/etc/systemd/system"),
            run_dir: PathBuf::from("/var/run"),
            sysfs_net_dir: PathBuf::from("/sys/class/net"),
            network_mode: NetworkMode::Dhcp,
            overlay: false,
            jumbo_frames: false,
            jumbo_mtu: MTU_MAX_JUMBO,
            normal_mtu: MTU_DEFAULT_ETHERNET,
            external_bridges: vec!["br0".to_string()],
            internal_bridges: vec!["br0".to_string()],
            overlay_bridge: "brvx0".to_string(),
            static_block: None,
            host_block: None,
            start_timeout: 30,
            stop_timeout: 180,
            refresh_rate: Duration::from_secs(10),
            virt_refresh: Duration::from_secs(3),
            settle: Duration::from_secs(3),
            address_settle: Duration::from_secs(2),
            reconcile_interval: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        // Node ID can be provided or auto-generated
        let node_id = lookup("STRATUS_NODE_ID")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.node_id);

        let path = |key: &str, default: PathBuf| lookup(key).map(PathBuf::from).unwrap_or(default);
        let flag = |key: &str, default: bool| {
            lookup(key)
                .map(|s| matches!(s.as_str(), "1" | "true" | "yes"))
                .unwrap_or(default)
        };
        let list = |key: &str, default: Vec<String>| {
            lookup(key)
                .map(|s| {
                    s.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or(default)
        };

        let network_mode = match lookup("STRATUS_NETWORK_MODE") {
            Some(mode) => mode.parse()?,
            None => defaults.network_mode,
        };

        let config = Self {
            node_id,
            lib_dir: path("STRATUS_LIB_DIR", defaults.lib_dir),
            systemd_dir: path("STRATUS_SYSTEMD_DIR", defaults.systemd_dir),
            run_dir: path("STRATUS_RUN_DIR", defaults.run_dir),
            sysfs_net_dir: path("STRATUS_SYSFS_NET_DIR", defaults.sysfs_net_dir),
            network_mode,
            overlay: flag("STRATUS_OVERLAY", defaults.overlay),
            jumbo_frames: flag("STRATUS_JUMBO_FRAMES", defaults.jumbo_frames),
            jumbo_mtu: number(&lookup, "STRATUS_JUMBO_MTU", defaults.jumbo_mtu)?,
            normal_mtu: number(&lookup, "STRATUS_NORMAL_MTU", defaults.normal_mtu)?,
            external_bridges: list("STRATUS_EXTERNAL_BRIDGES", defaults.external_bridges),
            internal_bridges: list("STRATUS_INTERNAL_BRIDGES", defaults.internal_bridges),
            overlay_bridge: lookup("STRATUS_OVERLAY_BRIDGE").unwrap_or(defaults.overlay_bridge),
            static_block: block(&lookup, "STRATUS_STATIC_BLOCK")?,
            host_block: block(&lookup, "STRATUS_HOST_BLOCK")?,
            start_timeout: number(&lookup, "STRATUS_START_TIMEOUT", defaults.start_timeout)?,
            stop_timeout: number(&lookup, "STRATUS_STOP_TIMEOUT", defaults.stop_timeout)?,
            refresh_rate: Duration::from_secs(number(
                &lookup,
                "STRATUS_REFRESH_RATE",
                defaults.refresh_rate.as_secs(),
            )?),
            virt_refresh: defaults.virt_refresh,
            settle: defaults.settle,
            address_settle: defaults.address_settle,
            reconcile_interval: Duration::from_secs(number(
                &lookup,
                "STRATUS_RECONCILE_INTERVAL",
                defaults.reconcile_interval.as_secs(),
            )?),
        };

        if config.network_mode == NetworkMode::Static && config.static_block.is_none() {
            return Err(Error::Configuration(
                "static network mode requires STRATUS_STATIC_BLOCK".to_string(),
            ));
        }

        Ok(config)
    }

    /// Whether VMs can get an external network at all.
    pub fn internal_only(&self) -> bool {
        self.network_mode == NetworkMode::Internal
    }
}

fn number<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| Error::Configuration(format!("{} is not a number: {}", key, value))),
        None => Ok(default),
    }
}

/// Blocks are given as JSON objects, e.g.
/// `{"name":"public","subnet":"203.0.113.0/24","gateway":"203.0.113.1","interface":"br0"}`.
fn block<F>(lookup: &F, key: &str) -> Result<Option<Block>>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| serde_json::from_str(&value).map_err(|e| Error::parse(key, e)))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.network_mode, NetworkMode::Dhcp);
        assert_eq!(config.normal_mtu, 1500);
        assert_eq!(config.virt_refresh, Duration::from_secs(3));
        assert!(config.host_block.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("STRATUS_NETWORK_MODE", "internal"),
            ("STRATUS_JUMBO_FRAMES", "true"),
            ("STRATUS_EXTERNAL_BRIDGES", "br0, br1"),
            ("STRATUS_START_TIMEOUT", "12"),
            (
                "STRATUS_HOST_BLOCK",
                r#"{"name":"host","subnet":"10.250.0.0/24","gateway":"10.250.0.1","interface":"brhost"}"#,
            ),
        ])
        .unwrap();

        assert!(config.internal_only());
        assert!(config.jumbo_frames);
        assert_eq!(config.external_bridges, vec!["br0", "br1"]);
        assert_eq!(config.start_timeout, 12);
        assert_eq!(config.host_block.unwrap().interface, "brhost");
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            load(&[("STRATUS_NETWORK_MODE", "bridged")]),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            load(&[("STRATUS_STOP_TIMEOUT", "soon")]),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            load(&[("STRATUS_STATIC_BLOCK", "{")]),
            Err(Error::Parse { .. })
        ));
    }

    #[test]
    fn test_static_mode_requires_block() {
        assert!(matches!(
            load(&[("STRATUS_NETWORK_MODE", "static")]),
            Err(Error::Configuration(_))
        ));
    }
}
