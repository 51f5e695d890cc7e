//! Parsing of `ip --json` output.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::Deserialize;

use crate::NetworkError;

#[derive(Debug, Deserialize)]
struct Link {
    #[serde(default)]
    ifname: String,
    #[serde(default)]
    addr_info: Vec<AddrInfo>,
}

#[derive(Debug, Deserialize)]
struct AddrInfo {
    #[serde(default)]
    family: String,
    #[serde(default)]
    local: String,
    #[serde(default)]
    scope: String,
    #[serde(default)]
    dynamic: bool,
}

/// Global addresses found on one interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IfaceAddresses {
    pub v4: Option<Ipv4Addr>,
    pub v6: Option<Ipv6Addr>,
}

/// Extract the global addresses of `ifname` from `ip --json addr show`.
///
/// A static IPv6 address wins over one learned from router advertisements.
pub fn parse_iface_addresses(json: &str, ifname: &str) -> Result<IfaceAddresses, NetworkError> {
    let mut found = IfaceAddresses::default();
    if json.trim().is_empty() {
        return Ok(found);
    }

    let links: Vec<Link> = serde_json::from_str(json).map_err(|source| NetworkError::Parse {
        what: "ip address output",
        source,
    })?;

    let mut v6_dynamic = true;
    for info in links
        .iter()
        .filter(|link| link.ifname == ifname)
        .flat_map(|link| link.addr_info.iter())
        .filter(|info| info.scope == "global")
    {
        match info.family.as_str() {
            "inet" if found.v4.is_none() => {
                found.v4 = info.local.parse().ok();
            }
            "inet6" if found.v6.is_none() || v6_dynamic => {
                if let Ok(addr) = info.local.parse() {
                    found.v6 = Some(addr);
                    v6_dynamic = info.dynamic;
                }
            }
            _ => {}
        }
    }

    Ok(found)
}

/// One entry of a routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Destination prefix, or "default".
    pub destination: String,
    pub gateway: Option<IpAddr>,
    pub device: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRoute {
    dst: String,
    gateway: Option<String>,
    dev: Option<String>,
}

/// Parse `ip --json route show`.
pub fn parse_routes(json: &str) -> Result<Vec<Route>, NetworkError> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }

    let raw: Vec<RawRoute> = serde_json::from_str(json).map_err(|source| NetworkError::Parse {
        what: "ip route output",
        source,
    })?;

    Ok(raw
        .into_iter()
        .map(|route| Route {
            destination: route.dst,
            gateway: route.gateway.and_then(|gw| gw.parse().ok()),
            device: route.dev,
        })
        .collect())
}
