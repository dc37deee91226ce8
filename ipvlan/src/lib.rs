//! Core of the ipvlan network driver.
//!
//! The [`Driver`](driver::Driver) implements the network and endpoint lifecycle behind the remote
//! driver protocol. In routed mode, it hands the container subnet to a
//! [`RoutingBackend`](routing::RoutingBackend), which keeps the kernel routing table of the host
//! in sync with the routes learned from a local BGP speaker.

pub mod bgp;
pub mod config;
pub mod driver;
pub mod endpoint;
pub mod host;
pub mod ipam;
pub mod routing;
pub mod subnet;

pub use config::{BgpConfig, Config, ConfigError, Mode};
pub use driver::{Driver, DriverError};
