use std::{collections::HashMap, net::Ipv4Addr, sync::Arc};

use axum::{
    extract::{FromRequest, Request, State},
    http::{StatusCode, Uri},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use ipnet::Ipv4Net;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::net::UnixListener;
use tracing::{debug, error, warn};

use ipvlan::driver::{Driver, DriverError, EndpointInterface, JoinInfo, StaticRoute};

/// Scope reported to the orchestrator, networks of this driver are only known to this host.
const SCOPE: &str = "local";

/// Http API server handle. The server is spawned in a background task. If this handle is dropped,
/// the server is terminated.
pub struct Http {
    /// Channel to send cancellation to the http api server. We just keep a reference to it since
    /// dropping it will also cancel the receiver and thus the server.
    _cancel_tx: tokio::sync::oneshot::Sender<()>,
}

#[derive(Clone)]
/// Shared state accessible in HTTP endpoint handlers.
struct HttpServerState {
    driver: Arc<Driver>,
}

impl Http {
    /// Spawns the remote driver API server on an already bound unix socket.
    pub fn spawn(driver: Arc<Driver>, listener: UnixListener) -> Self {
        let server_state = HttpServerState { driver };
        let app = Router::new()
            .route("/status", get(get_status))
            .route("/Plugin.Activate", post(activate))
            .route("/NetworkDriver.GetCapabilities", post(get_capabilities))
            .route("/NetworkDriver.CreateNetwork", post(create_network))
            .route("/NetworkDriver.DeleteNetwork", post(delete_network))
            .route("/NetworkDriver.CreateEndpoint", post(create_endpoint))
            .route("/NetworkDriver.DeleteEndpoint", post(delete_endpoint))
            .route("/NetworkDriver.EndpointOperInfo", post(endpoint_info))
            .route("/NetworkDriver.Join", post(join))
            .route("/NetworkDriver.Leave", post(leave))
            .fallback(not_found)
            .with_state(server_state);

        let (_cancel_tx, cancel_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let server =
                axum::serve(listener, app.into_make_service()).with_graceful_shutdown(async {
                    cancel_rx.await.ok();
                });

            if let Err(e) = server.await {
                error!(err=%e, "Http API server error");
            }
        });
        Http { _cancel_tx }
    }
}

/// Error body of the remote driver protocol.
#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorResponse {
    #[serde(rename = "Err")]
    pub err: String,
}

impl ErrorResponse {
    fn new(err: impl ToString) -> Self {
        Self {
            err: err.to_string(),
        }
    }
}

/// Empty success body.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct EmptyResponse {}

type DriverResult<T> = Result<Json<T>, Json<ErrorResponse>>;

fn in_band(err: DriverError) -> Json<ErrorResponse> {
    warn!(err=%err, "Rejecting driver request");
    Json(ErrorResponse::new(err))
}

/// JSON request body. Unlike [`Json`], this does not look at the content type, since the
/// orchestrator sends a vendor specific one.
struct PluginRequest<T>(T);

impl<S, T> FromRequest<S> for PluginRequest<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<ErrorResponse>);

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let body = Bytes::from_request(req, state)
            .await
            .map_err(|e| decode_error(e.to_string()))?;
        serde_json::from_slice(&body)
            .map(PluginRequest)
            .map_err(|e| decode_error(e.to_string()))
    }
}

fn decode_error(msg: String) -> (StatusCode, Json<ErrorResponse>) {
    warn!(err = %msg, "Malformed request");
    let err = format!("Unable to decode JSON payload: {msg}");
    (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(err)))
}

async fn not_found(uri: Uri) -> StatusCode {
    warn!(%uri, "Unknown plugin endpoint");
    StatusCode::NOT_FOUND
}

async fn get_status(State(state): State<HttpServerState>) -> String {
    state.driver.status()
}

/// Handshake response.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ActivateResponse {
    pub implements: Vec<String>,
}

async fn activate() -> Json<ActivateResponse> {
    debug!("Plugin activated");
    Json(ActivateResponse {
        implements: vec!["NetworkDriver".to_string()],
    })
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CapabilitiesResponse {
    pub scope: String,
}

async fn get_capabilities() -> Json<CapabilitiesResponse> {
    Json(CapabilitiesResponse {
        scope: SCOPE.to_string(),
    })
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateNetworkRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(default)]
    pub options: serde_json::Value,
}

async fn create_network(
    State(state): State<HttpServerState>,
    PluginRequest(req): PluginRequest<CreateNetworkRequest>,
) -> DriverResult<EmptyResponse> {
    debug!(network = %req.network_id, options = ?req.options, "Create network");
    state
        .driver
        .create_network(&req.network_id)
        .await
        .map_err(in_band)?;
    Ok(Json(EmptyResponse {}))
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeleteNetworkRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
}

async fn delete_network(
    State(state): State<HttpServerState>,
    PluginRequest(req): PluginRequest<DeleteNetworkRequest>,
) -> DriverResult<EmptyResponse> {
    debug!(network = %req.network_id, "Delete network");
    state
        .driver
        .delete_network(&req.network_id)
        .map_err(in_band)?;
    Ok(Json(EmptyResponse {}))
}

/// Addresses of an endpoint interface, as sent and received by the orchestrator.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InterfaceBody {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,
    #[serde(
        rename = "AddressIPv6",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub address_ipv6: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac_address: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateEndpointRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
    #[serde(default)]
    pub interface: Option<InterfaceBody>,
    #[serde(default)]
    pub options: serde_json::Value,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateEndpointResponse {
    pub interface: InterfaceBody,
}

/// Parse an interface address, which is either a plain address or an address with prefix length.
fn parse_address(s: &str) -> Option<Ipv4Addr> {
    s.parse::<Ipv4Addr>()
        .ok()
        .or_else(|| s.parse::<Ipv4Net>().ok().map(|net| net.addr()))
}

async fn create_endpoint(
    State(state): State<HttpServerState>,
    PluginRequest(req): PluginRequest<CreateEndpointRequest>,
) -> Result<DriverResult<CreateEndpointResponse>, (StatusCode, Json<ErrorResponse>)> {
    debug!(
        network = %req.network_id,
        endpoint = %req.endpoint_id,
        "Create endpoint"
    );

    let requested = match req.interface.as_ref().map(|i| i.address.as_str()) {
        None | Some("") => None,
        Some(address) => match parse_address(address) {
            Some(ip) => Some(ip),
            None => return Err(decode_error(format!("invalid interface address {address}"))),
        },
    };

    Ok(state
        .driver
        .create_endpoint(&req.network_id, &req.endpoint_id, requested)
        .map(|iface| Json(interface_response(iface, requested.is_some())))
        .map_err(in_band))
}

/// The orchestrator rejects addresses it already assigned itself, so only new values are
/// returned.
fn interface_response(iface: EndpointInterface, address_requested: bool) -> CreateEndpointResponse {
    CreateEndpointResponse {
        interface: InterfaceBody {
            address: if address_requested {
                String::new()
            } else {
                format!("{}/{}", iface.address, iface.prefix_len)
            },
            address_ipv6: String::new(),
            mac_address: iface.mac.to_string(),
        },
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct EndpointRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
}

async fn delete_endpoint(
    State(state): State<HttpServerState>,
    PluginRequest(req): PluginRequest<EndpointRequest>,
) -> Json<EmptyResponse> {
    debug!(
        network = %req.network_id,
        endpoint = %req.endpoint_id,
        "Delete endpoint"
    );
    state.driver.delete_endpoint(&req.endpoint_id).await;
    Json(EmptyResponse {})
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct EndpointInfoResponse {
    pub value: HashMap<String, serde_json::Value>,
}

async fn endpoint_info(
    PluginRequest(req): PluginRequest<EndpointRequest>,
) -> Json<EndpointInfoResponse> {
    debug!(endpoint = %req.endpoint_id, "Endpoint info");
    Json(EndpointInfoResponse {
        value: HashMap::new(),
    })
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct JoinRequest {
    #[serde(rename = "NetworkID")]
    pub network_id: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
    #[serde(default)]
    pub sandbox_key: String,
    #[serde(default)]
    pub options: serde_json::Value,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InterfaceName {
    pub src_name: String,
    pub dst_prefix: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StaticRouteBody {
    pub destination: String,
    pub route_type: u8,
    #[serde(default)]
    pub next_hop: String,
}

impl From<StaticRoute> for StaticRouteBody {
    fn from(route: StaticRoute) -> Self {
        Self {
            destination: route.destination.to_string(),
            route_type: route.route_type,
            next_hop: route.next_hop.map(|nh| nh.to_string()).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct JoinResponse {
    pub interface_name: InterfaceName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub static_routes: Vec<StaticRouteBody>,
}

impl From<JoinInfo> for JoinResponse {
    fn from(info: JoinInfo) -> Self {
        Self {
            interface_name: InterfaceName {
                src_name: info.src_name,
                dst_prefix: info.dst_prefix.to_string(),
            },
            gateway: info.gateway.map(|gw| gw.to_string()),
            static_routes: info.static_routes.into_iter().map(Into::into).collect(),
        }
    }
}

async fn join(
    State(state): State<HttpServerState>,
    PluginRequest(req): PluginRequest<JoinRequest>,
) -> Json<JoinResponse> {
    debug!(
        network = %req.network_id,
        endpoint = %req.endpoint_id,
        sandbox = %req.sandbox_key,
        "Join"
    );
    let info = state.driver.join(&req.endpoint_id, &req.sandbox_key).await;
    Json(info.into())
}

async fn leave(
    State(state): State<HttpServerState>,
    PluginRequest(req): PluginRequest<EndpointRequest>,
) -> Json<EmptyResponse> {
    debug!(
        network = %req.network_id,
        endpoint = %req.endpoint_id,
        "Leave"
    );
    state.driver.leave(&req.endpoint_id);
    Json(EmptyResponse {})
}

#[cfg(test)]
mod tests {
    use std::{
        net::Ipv4Addr,
        path::{Path, PathBuf},
        sync::Arc,
    };

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{UnixListener, UnixStream},
    };

    use ipvlan::{
        config::ConfigArgs,
        host::{HostError, HostNetwork, HostRoute, IpVlanMode},
        subnet::Subnet,
        Config, Driver, Mode,
    };

    use super::Http;

    /// Host which accepts every operation without doing anything.
    struct NullHost;

    #[async_trait]
    impl HostNetwork for NullHost {
        async fn link_index(&self, _: &str) -> Result<u32, HostError> {
            Ok(1)
        }

        async fn link_addresses(&self, _: &str) -> Result<Vec<Ipv4Addr>, HostError> {
            Ok(Vec::new())
        }

        async fn create_ipvlan(
            &self,
            _: &str,
            _: &str,
            _: IpVlanMode,
            _: u32,
        ) -> Result<(), HostError> {
            Ok(())
        }

        async fn delete_link(&self, name: &str) -> Result<(), HostError> {
            Err(HostError::LinkNotFound(name.to_string()))
        }

        async fn add_route(&self, _: &HostRoute) -> Result<(), HostError> {
            Ok(())
        }

        async fn del_route(&self, _: &HostRoute) -> Result<(), HostError> {
            Ok(())
        }

        async fn flush_bgp_routes(&self, _: &str) -> Result<usize, HostError> {
            Ok(0)
        }

        async fn ensure_masquerade(&self, _: Subnet) -> Result<(), HostError> {
            Ok(())
        }
    }

    struct Server {
        path: PathBuf,
        _http: Http,
    }

    impl Drop for Server {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    fn serve(name: &str, mode: Mode, subnet: &str) -> Server {
        let file = format!("ipvlan-api-{}-{name}.sock", std::process::id());
        let path = std::env::temp_dir().join(file);
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).unwrap();

        let config = Config::new(ConfigArgs {
            mode,
            subnet: subnet.parse().unwrap(),
            ..ConfigArgs::default()
        })
        .unwrap();
        let driver = Driver::new(Arc::new(config), Arc::new(NullHost), None, "0.2.0");

        Server {
            path,
            _http: Http::spawn(Arc::new(driver), listener),
        }
    }

    async fn call(socket: &Path, method: &str, uri: &str, body: &str) -> (u16, String) {
        let mut stream = UnixStream::connect(socket).await.unwrap();
        let request = format!(
            "{method} {uri} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/vnd.docker.plugins.v1.2+json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        let (head, body) = response.split_once("\r\n\r\n").unwrap();
        let status = head.split(' ').nth(1).unwrap().parse().unwrap();
        (status, body.to_string())
    }

    async fn post(socket: &Path, method: &str, body: Value) -> (u16, Value) {
        let (status, body) = call(socket, "POST", method, &body.to_string()).await;
        (status, serde_json::from_str(&body).unwrap())
    }

    #[tokio::test]
    async fn handshake() {
        let server = serve("handshake", Mode::L2, "192.168.1.0/24");

        let (status, body) = call(&server.path, "POST", "/Plugin.Activate", "").await;
        assert_eq!(status, 200);
        assert_eq!(
            serde_json::from_str::<Value>(&body).unwrap(),
            json!({"Implements": ["NetworkDriver"]})
        );

        let (status, body) = call(&server.path, "POST", "/NetworkDriver.GetCapabilities", "").await;
        assert_eq!(status, 200);
        assert_eq!(
            serde_json::from_str::<Value>(&body).unwrap(),
            json!({"Scope": "local"})
        );

        let (status, body) = call(&server.path, "GET", "/status", "").await;
        assert_eq!(status, 200);
        assert_eq!(body, "ipvlan plugin 0.2.0\n");
    }

    #[tokio::test]
    async fn unknown_path() {
        let server = serve("unknown", Mode::L2, "192.168.1.0/24");
        let (status, _) = call(&server.path, "POST", "/NetworkDriver.Unknown", "{}").await;
        assert_eq!(status, 404);
    }

    #[tokio::test]
    async fn malformed_body() {
        let server = serve("malformed", Mode::L2, "192.168.1.0/24");
        let (status, body) = call(
            &server.path,
            "POST",
            "/NetworkDriver.CreateNetwork",
            "{\"NetworkID\":",
        )
        .await;
        assert_eq!(status, 400);
        let body: Value = serde_json::from_str(&body).unwrap();
        assert!(body["Err"]
            .as_str()
            .unwrap()
            .starts_with("Unable to decode JSON payload: "));
    }

    #[tokio::test]
    async fn one_network_only() {
        let server = serve("one-network", Mode::L2, "192.168.1.0/24");

        let (status, body) = post(
            &server.path,
            "/NetworkDriver.CreateNetwork",
            json!({"NetworkID": "net1", "Options": {}}),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body, json!({}));

        let (status, body) = post(
            &server.path,
            "/NetworkDriver.CreateNetwork",
            json!({"NetworkID": "net2"}),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(
            body,
            json!({"Err": "You get just one network, and you already made net1"})
        );

        let (_, body) = post(
            &server.path,
            "/NetworkDriver.DeleteNetwork",
            json!({"NetworkID": "net2"}),
        )
        .await;
        assert_eq!(body, json!({"Err": "Network net2 not found"}));
    }

    #[tokio::test]
    async fn l2_endpoint_lifecycle() {
        let server = serve("l2-lifecycle", Mode::L2, "192.168.1.0/24");
        post(
            &server.path,
            "/NetworkDriver.CreateNetwork",
            json!({"NetworkID": "net1"}),
        )
        .await;

        let (_, body) = post(
            &server.path,
            "/NetworkDriver.CreateEndpoint",
            json!({"NetworkID": "other", "EndpointID": "ep1"}),
        )
        .await;
        assert_eq!(body, json!({"Err": "No such network other"}));

        let (status, body) = post(
            &server.path,
            "/NetworkDriver.CreateEndpoint",
            json!({"NetworkID": "net1", "EndpointID": "0123456789", "Interface": null}),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(
            body,
            json!({"Interface": {"Address": "192.168.1.2/24", "MacAddress": "7a:42:c0:a8:01:02"}})
        );

        let (_, body) = post(
            &server.path,
            "/NetworkDriver.Join",
            json!({"NetworkID": "net1", "EndpointID": "0123456789", "SandboxKey": "/var/run/docker/netns/1"}),
        )
        .await;
        assert_eq!(
            body,
            json!({
                "InterfaceName": {"SrcName": "01234", "DstPrefix": "eth"},
                "Gateway": "192.168.1.1",
            })
        );

        let (_, body) = post(
            &server.path,
            "/NetworkDriver.EndpointOperInfo",
            json!({"NetworkID": "net1", "EndpointID": "0123456789"}),
        )
        .await;
        assert_eq!(body, json!({"Value": {}}));

        for method in ["/NetworkDriver.Leave", "/NetworkDriver.DeleteEndpoint"] {
            let (status, body) = post(
                &server.path,
                method,
                json!({"NetworkID": "net1", "EndpointID": "0123456789"}),
            )
            .await;
            assert_eq!(status, 200);
            assert_eq!(body, json!({}));
        }
    }

    #[tokio::test]
    async fn requested_address_is_not_echoed() {
        let server = serve("requested", Mode::L2, "192.168.1.0/24");
        post(
            &server.path,
            "/NetworkDriver.CreateNetwork",
            json!({"NetworkID": "net1"}),
        )
        .await;

        let (_, body) = post(
            &server.path,
            "/NetworkDriver.CreateEndpoint",
            json!({"NetworkID": "net1", "EndpointID": "ep1", "Interface": {"Address": "192.168.1.50/24"}}),
        )
        .await;
        assert_eq!(body, json!({"Interface": {"MacAddress": "7a:42:c0:a8:01:32"}}));

        let (status, _) = post(
            &server.path,
            "/NetworkDriver.CreateEndpoint",
            json!({"NetworkID": "net1", "EndpointID": "ep2", "Interface": {"Address": "nope"}}),
        )
        .await;
        assert_eq!(status, 400);
    }

    #[tokio::test]
    async fn l3_join_has_connected_route() {
        let server = serve("l3-join", Mode::L3, "10.0.0.0/24");
        post(
            &server.path,
            "/NetworkDriver.CreateNetwork",
            json!({"NetworkID": "net1"}),
        )
        .await;
        post(
            &server.path,
            "/NetworkDriver.CreateEndpoint",
            json!({"NetworkID": "net1", "EndpointID": "ep1"}),
        )
        .await;

        let (_, body) = post(
            &server.path,
            "/NetworkDriver.Join",
            json!({"NetworkID": "net1", "EndpointID": "ep1", "SandboxKey": "sb"}),
        )
        .await;
        assert_eq!(
            body,
            json!({
                "InterfaceName": {"SrcName": "ep1", "DstPrefix": "eth"},
                "StaticRoutes": [{"Destination": "0.0.0.0/0", "RouteType": 1, "NextHop": ""}],
            })
        );
    }
}
