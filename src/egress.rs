//! Egress Manager (brass) client.
//!
//! Negotiates the egress point with the control plane. The Add-Egress
//! response carries the user's private tunnel addresses, the ordered
//! egress socket addresses, the server's key material, and the uplink
//! SPI that becomes the dataplane session id. The parsed response is
//! immutable and shared by reference between the session and datapath.

use crate::auth::AuthAndSignResponse;
use crate::crypto::CryptoSuite;
use crate::http::{HttpFetcherInterface, HttpRequest, HttpResponse};
use crate::looper::LooperThread;
use crate::status::Status;
use crate::vpn::{IpFamily, IpRange, TunnelConfig};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

/// Outcome callbacks, implemented by the session.
pub trait EgressNotification: Send + Sync {
    fn egress_available(&self, is_rekey: bool);
    fn egress_unavailable(&self, status: Status);
}

/// The session's view of the egress collaborator.
pub trait EgressManagerInterface: Send + Sync {
    /// Request an egress node for the bridge dataplane. Validation errors
    /// surface synchronously; HTTP outcomes arrive as notifications.
    fn get_egress_node_for_bridge(
        &self,
        auth_response: Arc<AuthAndSignResponse>,
    ) -> Result<(), Status>;

    /// Request an egress node over the PPN control plane (IpSec/bridge).
    fn get_egress_node_for_ppn_ipsec(
        &self,
        params: PpnDataplaneRequestParams,
    ) -> Result<(), Status>;

    /// The most recently stored response.
    fn get_egress_session_details(&self) -> Result<Arc<AddEgressResponse>, Status>;

    /// Quiesce: in-flight exchanges complete silently.
    fn stop(&self);
}

/// Client-side parameters of a PPN add-egress request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PpnDataplaneRequestParams {
    pub client_public_value: String,
    pub client_nonce: String,
    pub suite: CryptoSuite,
    pub downlink_spi: u32,
    pub blind_signed_token: Option<String>,
    pub is_rekey: bool,
}

/// One user private address entry from the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PrivateIpRange {
    #[serde(default)]
    pub ipv4_range: Option<String>,
    #[serde(default)]
    pub ipv6_range: Option<String>,
}

/// The `ppn_dataplane` payload of an Add-Egress response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PpnDataplaneResponse {
    #[serde(default)]
    pub user_private_ip: Vec<PrivateIpRange>,
    #[serde(default)]
    pub egress_point_sock_addr: Vec<String>,
    #[serde(default)]
    pub egress_point_public_value: String,
    #[serde(default)]
    pub server_nonce: String,
    pub uplink_spi: u32,
    pub expiry: DateTime<Utc>,
}

#[derive(Deserialize)]
struct AddEgressJson {
    ppn_dataplane: PpnDataplaneResponse,
}

/// A decoded Add-Egress response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddEgressResponse {
    ppn_dataplane: PpnDataplaneResponse,
}

impl AddEgressResponse {
    /// Decode from an HTTP response; non-200 maps onto the status error.
    pub fn decode_from_response(response: &HttpResponse) -> Result<Self, Status> {
        let status = response.to_status();
        if !status.is_ok() {
            return Err(status);
        }
        Self::decode_from_json(&response.json_body)
    }

    /// Decode from a raw JSON body.
    pub fn decode_from_json(json_body: &str) -> Result<Self, Status> {
        let parsed: AddEgressJson = serde_json::from_str(json_body)
            .map_err(|e| Status::invalid_argument(format!("malformed add-egress response: {}", e)))?;
        if parsed.ppn_dataplane.egress_point_sock_addr.is_empty() {
            return Err(Status::invalid_argument(
                "add-egress response has no egress socket addresses",
            ));
        }
        Ok(Self {
            ppn_dataplane: parsed.ppn_dataplane,
        })
    }

    pub fn ppn_dataplane(&self) -> &PpnDataplaneResponse {
        &self.ppn_dataplane
    }

    /// Ordered egress socket addresses as they appeared on the wire.
    pub fn egress_point_sock_addrs(&self) -> &[String] {
        &self.ppn_dataplane.egress_point_sock_addr
    }

    /// The server-assigned uplink SPI (dataplane session id).
    pub fn uplink_spi(&self) -> u32 {
        self.ppn_dataplane.uplink_spi
    }

    /// Build the tunnel configuration from the user private addresses plus
    /// the fixed DNS entries.
    pub fn to_tunnel_config(&self) -> Result<TunnelConfig, Status> {
        let mut tunnel_ip_addresses = Vec::new();
        for entry in &self.ppn_dataplane.user_private_ip {
            if let Some(v4) = &entry.ipv4_range {
                tunnel_ip_addresses.push(IpRange::parse(IpFamily::V4, v4)?);
            }
            if let Some(v6) = &entry.ipv6_range {
                tunnel_ip_addresses.push(IpRange::parse(IpFamily::V6, v6)?);
            }
        }
        if tunnel_ip_addresses.is_empty() {
            return Err(Status::invalid_argument(
                "add-egress response has no user private addresses",
            ));
        }

        Ok(TunnelConfig {
            tunnel_ip_addresses,
            tunnel_dns_addresses: TunnelConfig::default_dns_addresses(),
            is_metered: false,
        })
    }
}

struct EgressState {
    brass_url: String,
    http_fetcher: Arc<dyn HttpFetcherInterface>,
    looper: Arc<LooperThread>,
    inner: Mutex<EgressInner>,
}

#[derive(Default)]
struct EgressInner {
    handler: Option<Weak<dyn EgressNotification>>,
    response: Option<Arc<AddEgressResponse>>,
    stopped: bool,
}

impl EgressState {
    fn notify(&self, f: impl FnOnce(&dyn EgressNotification)) {
        let handler = {
            let inner = self.inner.lock().expect("egress lock poisoned");
            if inner.stopped {
                return;
            }
            inner.handler.clone()
        };
        if let Some(handler) = handler.and_then(|h| h.upgrade()) {
            f(&*handler);
        }
    }

    fn run_exchange(state: &Arc<EgressState>, body: serde_json::Value, is_rekey: bool) {
        let looper = state.looper.clone();
        let state = state.clone();
        looper.post(move || {
            if state.inner.lock().expect("egress lock poisoned").stopped {
                debug!("Add-egress exchange skipped, client stopped");
                return;
            }

            let request = HttpRequest::new(&state.brass_url, body.to_string());
            let response = state.http_fetcher.post_json(&request);

            match AddEgressResponse::decode_from_response(&response) {
                Ok(parsed) => {
                    let parsed = Arc::new(parsed);
                    debug!(
                        uplink_spi = parsed.uplink_spi(),
                        endpoints = parsed.egress_point_sock_addrs().len(),
                        is_rekey,
                        "Add-egress exchange succeeded"
                    );
                    state.inner.lock().expect("egress lock poisoned").response =
                        Some(parsed);
                    state.notify(|h| h.egress_available(is_rekey));
                }
                Err(status) => {
                    warn!(%status, is_rekey, "Add-egress exchange failed");
                    state.notify(|h| h.egress_unavailable(status));
                }
            }
        });
    }
}

/// Brass egress client driving `HttpFetcherInterface`.
pub struct EgressManager {
    state: Arc<EgressState>,
}

impl EgressManager {
    pub fn new(
        brass_url: impl Into<String>,
        http_fetcher: Arc<dyn HttpFetcherInterface>,
        looper: Arc<LooperThread>,
    ) -> Self {
        Self {
            state: Arc::new(EgressState {
                brass_url: brass_url.into(),
                http_fetcher,
                looper,
                inner: Mutex::new(EgressInner::default()),
            }),
        }
    }

    /// Install the outcome handler. Called once, before any request.
    pub fn register_notification_handler(&self, handler: Weak<dyn EgressNotification>) {
        self.state
            .inner
            .lock()
            .expect("egress lock poisoned")
            .handler = Some(handler);
    }
}

impl EgressManagerInterface for EgressManager {
    fn get_egress_node_for_bridge(
        &self,
        auth_response: Arc<AuthAndSignResponse>,
    ) -> Result<(), Status> {
        if self.state.brass_url.is_empty() {
            return Err(Status::failed_precondition("brass url not configured"));
        }
        if auth_response.jwt_token.is_empty() {
            return Err(Status::invalid_argument("auth response has no jwt token"));
        }

        let body = json!({ "auth_token": auth_response.jwt_token });
        EgressState::run_exchange(&self.state, body, false);
        Ok(())
    }

    fn get_egress_node_for_ppn_ipsec(
        &self,
        params: PpnDataplaneRequestParams,
    ) -> Result<(), Status> {
        if self.state.brass_url.is_empty() {
            return Err(Status::failed_precondition("brass url not configured"));
        }
        if params.client_public_value.is_empty() {
            return Err(Status::invalid_argument("missing client public value"));
        }

        let is_rekey = params.is_rekey;
        let body = json!({
            "ppn": {
                "client_public_value": params.client_public_value,
                "client_nonce": params.client_nonce,
                "suite": params.suite.to_string(),
                "downlink_spi": params.downlink_spi,
                "blind_signed_token": params.blind_signed_token,
                "is_rekey": params.is_rekey,
            }
        });
        EgressState::run_exchange(&self.state, body, is_rekey);
        Ok(())
    }

    fn get_egress_session_details(&self) -> Result<Arc<AddEgressResponse>, Status> {
        self.state
            .inner
            .lock()
            .expect("egress lock poisoned")
            .response
            .clone()
            .ok_or_else(|| Status::failed_precondition("no egress session established"))
    }

    fn stop(&self) {
        self.state.inner.lock().expect("egress lock poisoned").stopped = true;
    }
}
