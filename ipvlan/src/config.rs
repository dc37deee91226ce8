//! Process wide driver configuration.
//!
//! A [`Config`] is built once at startup and shared (behind an `Arc`) by the driver and the
//! routing backend. Nothing in it changes while the daemon is running.

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr},
    str::FromStr,
    time::Duration,
};

use ipnet::Ipv4Net;
use tracing::warn;

use crate::{host::IpVlanMode, subnet::Subnet};

/// The smallest MTU the kernel accepts for an IPv4 capable link.
pub const MIN_MTU: u32 = 68;

/// Name of the routing backend used when none is configured.
pub const DEFAULT_ROUTING_MANAGER: &str = "gobgp";

/// Default local AS number.
pub const DEFAULT_ASN: u32 = 65000;

/// Default gRPC endpoint of the local BGP speaker.
pub const DEFAULT_SPEAKER: &str = "http://127.0.0.1:8080";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Operating mode of the driver.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Containers share the broadcast domain of the host interface, and use a gateway on it.
    #[default]
    L2,
    /// The host routes for the containers, which see their interface as directly connected.
    L3,
    /// Like [`Mode::L3`], but the container subnet is exchanged with other hosts over BGP.
    L3Routing,
}

impl Mode {
    /// The ipvlan link mode used for endpoint interfaces in this mode.
    pub fn ipvlan_mode(self) -> IpVlanMode {
        match self {
            Mode::L2 => IpVlanMode::L2,
            Mode::L3 | Mode::L3Routing => IpVlanMode::L3,
        }
    }

}

impl FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "l2" => Ok(Mode::L2),
            "l3" => Ok(Mode::L3),
            "l3routing" => Ok(Mode::L3Routing),
            _ => Err(ConfigError::InvalidMode(s.to_string())),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::L2 => "l2",
            Mode::L3 => "l3",
            Mode::L3Routing => "l3routing",
        })
    }
}

/// Errors raised while validating the startup configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid mode {0:?}, expected one of l2, l3, l3routing")]
    InvalidMode(String),
    #[error("mtu {0} is below the minimum of {MIN_MTU}")]
    MtuTooSmall(u32),
    #[error("subnet {0} has no room for container addresses")]
    SubnetTooSmall(Subnet),
    #[error("invalid gateway {0:?}")]
    InvalidGateway(String),
    #[error("host interface name can not be empty")]
    MissingHostInterface,
}

/// Settings for the BGP routing backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BgpConfig {
    /// Local AS number, also used for every neighbor.
    pub asn: u32,
    /// Router id announced to the speaker. The daemon falls back to the first address of the
    /// host interface if this is not set.
    pub router_id: Option<Ipv4Addr>,
    /// gRPC endpoint of the speaker.
    pub speaker: String,
    /// Upper bound on establishing the speaker connection.
    pub connect_timeout: Duration,
    /// Statically configured neighbors.
    pub neighbors: Vec<IpAddr>,
}

impl Default for BgpConfig {
    fn default() -> Self {
        Self {
            asn: DEFAULT_ASN,
            router_id: None,
            speaker: DEFAULT_SPEAKER.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            neighbors: Vec::new(),
        }
    }
}

/// Raw configuration values, as collected from the command line and the config file.
#[derive(Debug, Clone)]
pub struct ConfigArgs {
    pub mode: Mode,
    pub subnet: Subnet,
    pub gateway: Option<Ipv4Addr>,
    pub mtu: u32,
    pub host_interface: String,
    pub routing_manager: String,
    pub bgp: BgpConfig,
}

/// The validated driver configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Operating mode.
    pub mode: Mode,
    /// The container subnet, with host bits cleared.
    pub subnet: Subnet,
    /// Default gateway handed to containers. Only set in [`Mode::L2`].
    pub gateway: Option<Ipv4Addr>,
    /// MTU of the endpoint links.
    pub mtu: u32,
    /// Parent interface of the endpoint links.
    pub host_interface: String,
    /// Name of the routing backend.
    pub routing_manager: String,
    pub bgp: BgpConfig,
}

impl Config {
    /// Validate the raw values and resolve the gateway.
    pub fn new(args: ConfigArgs) -> Result<Config, ConfigError> {
        if args.mtu < MIN_MTU {
            return Err(ConfigError::MtuTooSmall(args.mtu));
        }
        if args.host_interface.is_empty() {
            return Err(ConfigError::MissingHostInterface);
        }

        let subnet = args.subnet.trunc();
        // A /32 leaves nothing once the network reservation is taken.
        if subnet.prefix_len() > 31 {
            return Err(ConfigError::SubnetTooSmall(subnet));
        }

        let gateway = match args.mode {
            Mode::L2 => {
                let gw = args.gateway.unwrap_or_else(|| subnet.first_host());
                // The gateway is reserved from the pool, so it must be a host address.
                let hosts = subnet.first_host()..=subnet.last_host();
                if subnet.contains_ip(gw) && !hosts.contains(&gw) {
                    return Err(ConfigError::InvalidGateway(gw.to_string()));
                }
                Some(gw)
            }
            Mode::L3 | Mode::L3Routing => {
                if let Some(gw) = args.gateway {
                    warn!(gateway = %gw, mode = %args.mode, "Ignoring gateway, containers route through the host in this mode");
                }
                None
            }
        };

        Ok(Config {
            mode: args.mode,
            subnet,
            gateway,
            mtu: args.mtu,
            host_interface: args.host_interface,
            routing_manager: args.routing_manager,
            bgp: args.bgp,
        })
    }
}

impl Default for ConfigArgs {
    fn default() -> Self {
        Self {
            mode: Mode::L2,
            subnet: Subnet::from(Ipv4Net::new_assert(Ipv4Addr::new(192, 168, 1, 0), 24)),
            gateway: None,
            mtu: 1500,
            host_interface: "eth1".to_string(),
            routing_manager: DEFAULT_ROUTING_MANAGER.to_string(),
            bgp: BgpConfig::default(),
        }
    }
}

/// Parse a gateway override, which is either a plain address or an address in CIDR notation.
pub fn parse_gateway(s: &str) -> Result<Ipv4Addr, ConfigError> {
    s.parse::<Ipv4Addr>()
        .or_else(|_| s.parse::<Ipv4Net>().map(|net| net.addr()))
        .map_err(|_| ConfigError::InvalidGateway(s.to_string()))
}
