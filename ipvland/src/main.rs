#[cfg(not(target_os = "linux"))]
compile_error!("the ipvlan driver only runs on linux");

use std::{
    error::Error,
    io,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{Args, Parser};
use ipvlan::{
    config::{parse_gateway, ConfigArgs, DEFAULT_ASN, DEFAULT_ROUTING_MANAGER, DEFAULT_SPEAKER},
    host::{HostNetwork, Netlink},
    routing::{Monitor, Registry, RoutingBackend},
    subnet::Subnet,
    BgpConfig, Config, Driver, Mode,
};
use ipvlan_api::Http;
use serde::Deserialize;
use tokio::{
    net::UnixListener,
    signal::unix::{self, SignalKind},
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Socket the orchestrator looks for plugins in.
const DEFAULT_SOCKET: &str = "/run/docker/plugins/ipvlan.sock";
const DEFAULT_SUBNET: &str = "192.168.1.0/24";
const DEFAULT_MTU: u32 = 1500;
const DEFAULT_HOST_INTERFACE: &str = "eth1";

#[derive(Parser)]
#[command(version)]
struct Cli {
    /// Enable debug logging.
    #[arg(short = 'd', long = "debug", default_value_t = false)]
    debug: bool,

    /// Path to a TOML file with driver settings.
    ///
    /// Keys are the long names of the flags below. A flag given on the command line takes
    /// precedence over the value in the file.
    #[arg(long = "config-file")]
    config_file: Option<PathBuf>,

    #[clap(flatten)]
    driver_args: DriverArguments,
}

#[derive(Debug, Default, Args, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct DriverArguments {
    /// Path of the unix socket to serve the plugin API on [default: /run/docker/plugins/ipvlan.sock].
    #[arg(short = 's', long = "socket")]
    socket: Option<PathBuf>,

    /// Driver mode, one of l2, l3 or l3routing [default: l2].
    #[arg(long = "mode")]
    mode: Option<String>,

    /// Gateway handed to containers in l2 mode. Defaults to the first address of the subnet.
    #[arg(long = "gateway")]
    gateway: Option<String>,

    /// Subnet to hand out container addresses from [default: 192.168.1.0/24].
    #[arg(long = "ipvlan-subnet")]
    ipvlan_subnet: Option<String>,

    /// MTU of the container links [default: 1500].
    #[arg(long = "mtu")]
    mtu: Option<u32>,

    /// Host interface the container links are attached to [default: eth1].
    #[arg(long = "host-interface")]
    host_interface: Option<String>,

    /// Routing backend used in l3routing mode [default: gobgp].
    #[arg(long = "routing-manager")]
    routing_manager: Option<String>,

    /// AS number of this host [default: 65000].
    #[arg(long = "bgp-as")]
    bgp_as: Option<u32>,

    /// BGP router id. Defaults to the first IPv4 address of the host interface.
    #[arg(long = "bgp-router-id")]
    bgp_router_id: Option<Ipv4Addr>,

    /// gRPC endpoint of the local BGP speaker [default: http://127.0.0.1:8080].
    #[arg(long = "bgp-speaker")]
    bgp_speaker: Option<String>,

    /// BGP neighbor to peer with. Can be given multiple times.
    #[arg(long = "bgp-neighbor")]
    bgp_neighbor: Vec<IpAddr>,
}

impl DriverArguments {
    /// Fill everything not set in `self` from `file`.
    fn merge(self, file: DriverArguments) -> DriverArguments {
        DriverArguments {
            socket: self.socket.or(file.socket),
            mode: self.mode.or(file.mode),
            gateway: self.gateway.or(file.gateway),
            ipvlan_subnet: self.ipvlan_subnet.or(file.ipvlan_subnet),
            mtu: self.mtu.or(file.mtu),
            host_interface: self.host_interface.or(file.host_interface),
            routing_manager: self.routing_manager.or(file.routing_manager),
            bgp_as: self.bgp_as.or(file.bgp_as),
            bgp_router_id: self.bgp_router_id.or(file.bgp_router_id),
            bgp_speaker: self.bgp_speaker.or(file.bgp_speaker),
            bgp_neighbor: if self.bgp_neighbor.is_empty() {
                file.bgp_neighbor
            } else {
                self.bgp_neighbor
            },
        }
    }

    fn socket(&self) -> PathBuf {
        self.socket
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET))
    }

    fn into_config_args(self) -> Result<ConfigArgs, Box<dyn Error>> {
        let mode = match self.mode {
            Some(mode) => mode.parse::<Mode>()?,
            None => Mode::default(),
        };
        let gateway = self.gateway.as_deref().map(parse_gateway).transpose()?;
        let subnet = self
            .ipvlan_subnet
            .as_deref()
            .unwrap_or(DEFAULT_SUBNET)
            .parse::<Subnet>()?;

        Ok(ConfigArgs {
            mode,
            subnet,
            gateway,
            mtu: self.mtu.unwrap_or(DEFAULT_MTU),
            host_interface: self
                .host_interface
                .unwrap_or_else(|| DEFAULT_HOST_INTERFACE.to_string()),
            routing_manager: self
                .routing_manager
                .unwrap_or_else(|| DEFAULT_ROUTING_MANAGER.to_string()),
            bgp: BgpConfig {
                asn: self.bgp_as.unwrap_or(DEFAULT_ASN),
                router_id: self.bgp_router_id,
                speaker: self
                    .bgp_speaker
                    .unwrap_or_else(|| DEFAULT_SPEAKER.to_string()),
                neighbors: self.bgp_neighbor,
                ..BgpConfig::default()
            },
        })
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_logging(cli.debug);

    if let Err(e) = run(cli).await {
        error!(err=%e, "Fatal error, exiting");
        std::process::exit(1);
    }
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let file_args = match &cli.config_file {
        Some(path) => load_config_file(path).await?,
        None => DriverArguments::default(),
    };
    let args = cli.driver_args.merge(file_args);
    let socket = args.socket();
    let config_args = args.into_config_args()?;

    let host = Arc::new(Netlink::new()?);
    if let Err(e) = host.link_index(&config_args.host_interface).await {
        error!(err=%e, interface = %config_args.host_interface, "Host interface is not usable");
        return Err(e.into());
    }

    let config = Arc::new(Config::new(config_args)?);
    info!(
        mode = %config.mode,
        subnet = %config.subnet,
        gateway = ?config.gateway,
        mtu = config.mtu,
        interface = %config.host_interface,
        "Starting ipvlan driver"
    );

    let (routing, monitor) = if config.mode == Mode::L3Routing {
        let (backend, monitor) = start_routing(&config, host.clone()).await?;
        (Some(backend), Some(monitor))
    } else {
        (None, None)
    };

    prepare_socket(&socket).await?;
    let listener = UnixListener::bind(&socket)?;
    let driver = Driver::new(config, host, routing, env!("CARGO_PKG_VERSION"));
    let _api = Http::spawn(Arc::new(driver), listener);
    info!(socket = %socket.display(), "Serving plugin API");

    let result = wait_for_shutdown(monitor).await;

    if let Err(e) = tokio::fs::remove_file(&socket).await {
        warn!(err=%e, socket = %socket.display(), "Failed to remove socket");
    }

    result
}

async fn load_config_file(path: &Path) -> Result<DriverArguments, Box<dyn Error>> {
    let content = tokio::fs::read_to_string(path).await?;
    let args = toml::from_str(&content)?;
    debug!(path = %path.display(), "Loaded config file");
    Ok(args)
}

/// Start the routing backend, and announce this host and the static neighbors to it.
async fn start_routing(
    config: &Arc<Config>,
    host: Arc<dyn HostNetwork>,
) -> Result<(Arc<dyn RoutingBackend>, Monitor), Box<dyn Error>> {
    let router_id = match config.bgp.router_id {
        Some(router_id) => router_id,
        None => host
            .link_addresses(&config.host_interface)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                format!(
                    "no IPv4 address on {} to use as router id",
                    config.host_interface
                )
            })?,
    };

    let backend = Registry::default().build(&config.routing_manager, config.clone(), host)?;
    let monitor = backend.start_monitoring().await?;

    backend.discover_new(true, IpAddr::V4(router_id))?;
    for neighbor in &config.bgp.neighbors {
        backend.discover_new(false, *neighbor)?;
    }
    info!(%router_id, asn = config.bgp.asn, neighbors = config.bgp.neighbors.len(), "Routing started");

    Ok((backend, monitor))
}

/// Create the socket directory and remove a socket left behind by a previous run.
async fn prepare_socket(path: &Path) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed stale socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    Ok(())
}

/// Wait for a termination signal, or for the routing engine to stop.
async fn wait_for_shutdown(monitor: Option<Monitor>) -> Result<(), Box<dyn Error>> {
    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;

    let routing = async move {
        match monitor {
            Some(monitor) => monitor.wait().await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down");
            Ok(())
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down");
            Ok(())
        }
        err = routing => {
            error!(err=%err, "Routing engine stopped");
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use clap::Parser;
    use ipvlan::Mode;

    use super::{Cli, DriverArguments};

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["ipvlan"]);
        assert_eq!(
            cli.driver_args.socket(),
            std::path::PathBuf::from("/run/docker/plugins/ipvlan.sock")
        );
        let args = cli.driver_args.into_config_args().unwrap();
        assert_eq!(args.mode, Mode::L2);
        assert_eq!(args.subnet.to_string(), "192.168.1.0/24");
        assert_eq!(args.mtu, 1500);
        assert_eq!(args.host_interface, "eth1");
        assert_eq!(args.routing_manager, "gobgp");
        assert_eq!(args.bgp.asn, 65000);
        assert_eq!(args.bgp.speaker, "http://127.0.0.1:8080");
    }

    #[test]
    fn command_line_wins_over_file() {
        let cli = Cli::parse_from([
            "ipvlan",
            "--mode",
            "l3routing",
            "--bgp-neighbor",
            "192.168.10.3",
            "--bgp-neighbor",
            "192.168.10.4",
        ]);
        let file: DriverArguments = toml::from_str(
            r#"
            mode = "l2"
            mtu = 9000
            ipvlan-subnet = "10.0.0.0/24"
            bgp-as = 65010
            bgp-neighbor = ["192.168.10.9"]
            "#,
        )
        .unwrap();

        let args = cli.driver_args.merge(file).into_config_args().unwrap();
        assert_eq!(args.mode, Mode::L3Routing);
        assert_eq!(args.mtu, 9000);
        assert_eq!(args.subnet.to_string(), "10.0.0.0/24");
        assert_eq!(args.bgp.asn, 65010);
        assert_eq!(
            args.bgp.neighbors,
            vec![
                IpAddr::V4(Ipv4Addr::new(192, 168, 10, 3)),
                IpAddr::V4(Ipv4Addr::new(192, 168, 10, 4)),
            ]
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        let cli = Cli::parse_from(["ipvlan", "--mode", "vxlan"]);
        assert!(cli.driver_args.into_config_args().is_err());

        let cli = Cli::parse_from(["ipvlan", "--ipvlan-subnet", "10.0.0.0"]);
        assert!(cli.driver_args.into_config_args().is_err());

        let cli = Cli::parse_from(["ipvlan", "--gateway", "10.0.0.1/24"]);
        assert_eq!(
            cli.driver_args.into_config_args().unwrap().gateway,
            Some(Ipv4Addr::new(10, 0, 0, 1))
        );
    }
}
