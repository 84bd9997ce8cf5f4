//! Session controller test suite: fakes plus shared harness.

use super::*;
use crate::auth::{AuthAndSignResponse, AuthInterface};
use crate::crypto::{CryptoSuite, TransformParams};
use crate::datapath::{DatapathInterface, DatapathNotification};
use crate::egress::{AddEgressResponse, EgressManagerInterface, PpnDataplaneRequestParams};
use crate::timer::TimerInterface;
use crate::vpn::{
    FdPacketPipe, NetworkInfo, NetworkType, TunnelConfig, VpnServiceInterface,
};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::mpsc;
use std::time::Duration;


/// First tun fd handed out by the fake VPN service.
pub(super) const TUN_FD_BASE: i32 = 0xbeef;
/// First protected-socket fd handed out by the fake VPN service.
pub(super) const NETWORK_FD_BASE: i32 = 0xbeef + 1000;

/// Wire fixture for the initial connect (uplink_spi 1234).
pub(super) const ADD_EGRESS_BODY: &str = r#"{
  "ppn_dataplane": {
    "user_private_ip": [{
      "ipv4_range": "10.2.2.123/32",
      "ipv6_range": "fec2:0001::3/64"
    }],
    "egress_point_sock_addr": ["64.9.240.165:2153", "[2604:ca00:f001:4::5]:2153"],
    "egress_point_public_value": "a22j+91TxHtS5qa625KCD5ybsyzPR1wkTDWHV2qSQQc=",
    "server_nonce": "Uzt2lEzyvZYzjLAP3E+dAA==",
    "uplink_spi": 1234,
    "expiry": "2020-08-07T01:06:13+00:00"
  }
}"#;

/// Wire fixture for a rekey response (uplink_spi 123).
pub(super) const REKEY_ADD_EGRESS_BODY: &str = r#"{
  "ppn_dataplane": {
    "user_private_ip": [{
      "ipv4_range": "10.2.2.123/32",
      "ipv6_range": "fec2:0001::3/64"
    }],
    "egress_point_sock_addr": ["64.9.240.165:2153", "[2604:ca00:f001:4::5]:2153"],
    "egress_point_public_value": "a22j+91TxHtS5qa625KCD5ybsyzPR1wkTDWHV2qSQQc=",
    "server_nonce": "Uzt2lEzyvZYzjLAP3E+dAA==",
    "uplink_spi": 123,
    "expiry": "2020-08-07T01:06:13+00:00"
  }
}"#;

pub(super) const V6_ENDPOINT: &str = "[2604:ca00:f001:4::5]:2153";
pub(super) const V4_ENDPOINT: &str = "64.9.240.165:2153";

pub(super) fn cellular(network_id: Option<u32>) -> NetworkInfo {
    NetworkInfo::new(network_id, NetworkType::Cellular)
}

pub(super) fn wifi() -> NetworkInfo {
    NetworkInfo::new(None, NetworkType::Wifi)
}

/// The tunnel configuration the fixture must produce.
pub(super) fn expected_tunnel_config() -> TunnelConfig {
    use crate::vpn::IpRange;
    TunnelConfig {
        tunnel_ip_addresses: vec![IpRange::v4("10.2.2.123", 32), IpRange::v6("fec2:0001::3", 64)],
        tunnel_dns_addresses: TunnelConfig::default_dns_addresses(),
        is_metered: false,
    }
}

// ============================================================================
// Fake Auth
// ============================================================================

#[derive(Clone)]
pub(super) enum AuthBehavior {
    /// Post `auth_successful(is_rekey)`.
    Succeed,
    /// Post `auth_failure(status)`.
    Fail(Status),
    /// Record the call, post nothing.
    Silent,
}

pub(super) struct FakeAuth {
    target: Mutex<Option<(Weak<Session>, Arc<LooperThread>)>>,
    pub behavior: Mutex<AuthBehavior>,
    pub started: Mutex<Vec<bool>>,
    pub stopped: AtomicBool,
    response: Mutex<Arc<AuthAndSignResponse>>,
}

impl FakeAuth {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            target: Mutex::new(None),
            behavior: Mutex::new(AuthBehavior::Succeed),
            started: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            response: Mutex::new(Arc::new(AuthAndSignResponse {
                jwt_token: "jwt".into(),
                blinded_token_signatures: vec!["sig1".into()],
            })),
        })
    }

    pub fn install(&self, session: &Arc<Session>, looper: &Arc<LooperThread>) {
        *self.target.lock().unwrap() = Some((Arc::downgrade(session), looper.clone()));
    }

    pub fn set_behavior(&self, behavior: AuthBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }
}

impl AuthInterface for FakeAuth {
    fn start(&self, is_rekey: bool) {
        self.started.lock().unwrap().push(is_rekey);
        let behavior = self.behavior.lock().unwrap().clone();
        let Some((session, looper)) = self.target.lock().unwrap().clone() else {
            return;
        };
        match behavior {
            AuthBehavior::Succeed => looper.post(move || {
                if let Some(session) = session.upgrade() {
                    session.auth_successful(is_rekey);
                }
            }),
            AuthBehavior::Fail(status) => looper.post(move || {
                if let Some(session) = session.upgrade() {
                    session.auth_failure(status);
                }
            }),
            AuthBehavior::Silent => {}
        }
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn auth_response(&self) -> Option<Arc<AuthAndSignResponse>> {
        Some(self.response.lock().unwrap().clone())
    }
}

// ============================================================================
// Fake Egress Manager
// ============================================================================

#[derive(Clone)]
pub(super) enum EgressBehavior {
    /// Return Ok and post `egress_available(is_rekey)`.
    Succeed,
    /// Return the error synchronously.
    FailSync(Status),
    /// Return Ok and post `egress_unavailable(status)`.
    FailAsync(Status),
}

pub(super) struct FakeEgressManager {
    target: Mutex<Option<(Weak<Session>, Arc<LooperThread>)>>,
    pub behavior: Mutex<EgressBehavior>,
    pub bridge_calls: Mutex<Vec<Arc<AuthAndSignResponse>>>,
    pub ppn_calls: Mutex<Vec<PpnDataplaneRequestParams>>,
    pub stopped: AtomicBool,
    details: Mutex<Arc<AddEgressResponse>>,
}

impl FakeEgressManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            target: Mutex::new(None),
            behavior: Mutex::new(EgressBehavior::Succeed),
            bridge_calls: Mutex::new(Vec::new()),
            ppn_calls: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            details: Mutex::new(Arc::new(
                AddEgressResponse::decode_from_json(ADD_EGRESS_BODY).unwrap(),
            )),
        })
    }

    pub fn install(&self, session: &Arc<Session>, looper: &Arc<LooperThread>) {
        *self.target.lock().unwrap() = Some((Arc::downgrade(session), looper.clone()));
    }

    pub fn set_behavior(&self, behavior: EgressBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn set_details_json(&self, json_body: &str) {
        *self.details.lock().unwrap() =
            Arc::new(AddEgressResponse::decode_from_json(json_body).unwrap());
    }

    fn complete(&self, is_rekey: bool) -> Result<(), Status> {
        let behavior = self.behavior.lock().unwrap().clone();
        let Some((session, looper)) = self.target.lock().unwrap().clone() else {
            return Ok(());
        };
        match behavior {
            EgressBehavior::Succeed => {
                looper.post(move || {
                    if let Some(session) = session.upgrade() {
                        session.egress_available(is_rekey);
                    }
                });
                Ok(())
            }
            EgressBehavior::FailSync(status) => Err(status),
            EgressBehavior::FailAsync(status) => {
                looper.post(move || {
                    if let Some(session) = session.upgrade() {
                        session.egress_unavailable(status);
                    }
                });
                Ok(())
            }
        }
    }
}

impl EgressManagerInterface for FakeEgressManager {
    fn get_egress_node_for_bridge(
        &self,
        auth_response: Arc<AuthAndSignResponse>,
    ) -> Result<(), Status> {
        self.bridge_calls.lock().unwrap().push(auth_response);
        self.complete(false)
    }

    fn get_egress_node_for_ppn_ipsec(
        &self,
        params: PpnDataplaneRequestParams,
    ) -> Result<(), Status> {
        let is_rekey = params.is_rekey;
        self.ppn_calls.lock().unwrap().push(params);
        self.complete(is_rekey)
    }

    fn get_egress_session_details(&self) -> Result<Arc<AddEgressResponse>, Status> {
        Ok(self.details.lock().unwrap().clone())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Fake Datapath
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct SwitchCall {
    pub session_id: u32,
    pub endpoints: Vec<String>,
    pub network_info: Option<NetworkInfo>,
    pub network_fd: Option<i32>,
    pub tun_fd: Option<i32>,
    pub counter: u32,
}

pub(super) struct FakeDatapath {
    pub handler: Mutex<Option<Weak<dyn DatapathNotification>>>,
    pub start_calls: Mutex<Vec<(u32, TransformParams, CryptoSuite)>>,
    pub start_result: Mutex<Result<(), Status>>,
    pub switch_calls: Mutex<Vec<SwitchCall>>,
    pub switch_result: Mutex<Result<(), Status>>,
    pub rekey_calls: Mutex<Vec<(String, String)>>,
    pub rekey_result: Mutex<Result<(), Status>>,
    pub stopped: AtomicBool,
}

impl FakeDatapath {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handler: Mutex::new(None),
            start_calls: Mutex::new(Vec::new()),
            start_result: Mutex::new(Ok(())),
            switch_calls: Mutex::new(Vec::new()),
            switch_result: Mutex::new(Ok(())),
            rekey_calls: Mutex::new(Vec::new()),
            rekey_result: Mutex::new(Ok(())),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn last_switch(&self) -> SwitchCall {
        self.switch_calls
            .lock()
            .unwrap()
            .last()
            .expect("no switch_network call recorded")
            .clone()
    }
}

impl DatapathInterface for FakeDatapath {
    fn register_notification_handler(&self, handler: Weak<dyn DatapathNotification>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    fn start(
        &self,
        egress_response: Arc<AddEgressResponse>,
        params: &TransformParams,
        suite: CryptoSuite,
    ) -> Result<(), Status> {
        self.start_calls
            .lock()
            .unwrap()
            .push((egress_response.uplink_spi(), params.clone(), suite));
        self.start_result.lock().unwrap().clone()
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn switch_network(
        &self,
        session_id: u32,
        endpoints: &[String],
        network_info: Option<&NetworkInfo>,
        network_pipe: Option<&FdPacketPipe>,
        tun_pipe: Option<&FdPacketPipe>,
        counter: u32,
    ) -> Result<(), Status> {
        self.switch_calls.lock().unwrap().push(SwitchCall {
            session_id,
            endpoints: endpoints.to_vec(),
            network_info: network_info.cloned(),
            network_fd: network_pipe.map(|p| p.fd()),
            tun_fd: tun_pipe.map(|p| p.fd()),
            counter,
        });
        self.switch_result.lock().unwrap().clone()
    }

    fn rekey(&self, local_public_value: &str, remote_public_value: &str) -> Result<(), Status> {
        self.rekey_calls
            .lock()
            .unwrap()
            .push((local_public_value.into(), remote_public_value.into()));
        self.rekey_result.lock().unwrap().clone()
    }
}

// ============================================================================
// Fake VPN Service
// ============================================================================

pub(super) struct FakeVpnService {
    next_tun_fd: AtomicI32,
    next_network_fd: AtomicI32,
    pub tunnel_configs: Mutex<Vec<TunnelConfig>>,
    pub socket_networks: Mutex<Vec<NetworkInfo>>,
    pub fail_next_tunnel: AtomicBool,
    pub fail_next_socket: AtomicBool,
}

impl FakeVpnService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_tun_fd: AtomicI32::new(TUN_FD_BASE),
            next_network_fd: AtomicI32::new(NETWORK_FD_BASE),
            tunnel_configs: Mutex::new(Vec::new()),
            socket_networks: Mutex::new(Vec::new()),
            fail_next_tunnel: AtomicBool::new(false),
            fail_next_socket: AtomicBool::new(false),
        })
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnel_configs.lock().unwrap().len()
    }

    pub fn socket_count(&self) -> usize {
        self.socket_networks.lock().unwrap().len()
    }
}

impl VpnServiceInterface for FakeVpnService {
    fn create_tunnel(&self, config: &TunnelConfig) -> Result<FdPacketPipe, Status> {
        if self.fail_next_tunnel.swap(false, Ordering::SeqCst) {
            return Err(Status::internal("tunnel creation failed"));
        }
        self.tunnel_configs.lock().unwrap().push(config.clone());
        Ok(FdPacketPipe::new(
            self.next_tun_fd.fetch_add(1, Ordering::SeqCst),
        ))
    }

    fn create_protected_network_socket(
        &self,
        network_info: &NetworkInfo,
    ) -> Result<FdPacketPipe, Status> {
        if self.fail_next_socket.swap(false, Ordering::SeqCst) {
            return Err(Status::internal("socket creation failed"));
        }
        self.socket_networks.lock().unwrap().push(network_info.clone());
        Ok(FdPacketPipe::new(
            self.next_network_fd.fetch_add(1, Ordering::SeqCst),
        ))
    }
}

// ============================================================================
// Fake Timer Interface
// ============================================================================

/// Records armed timers; never schedules anything. Tests drive expiries
/// through `TimerManager::timer_expired`.
pub(super) struct FakeTimerInterface {
    pub started: Mutex<Vec<(i32, Duration)>>,
    pub cancelled: Mutex<Vec<i32>>,
}

impl FakeTimerInterface {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
        })
    }

    pub fn started_with(&self, duration: Duration) -> Vec<i32> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, d)| *d == duration)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn last_started(&self) -> (i32, Duration) {
        *self
            .started
            .lock()
            .unwrap()
            .last()
            .expect("no timer armed")
    }
}

impl TimerInterface for FakeTimerInterface {
    fn start_timer(&self, timer_id: i32, duration: Duration) -> Result<(), Status> {
        self.started.lock().unwrap().push((timer_id, duration));
        Ok(())
    }

    fn cancel_timer(&self, timer_id: i32) {
        self.cancelled.lock().unwrap().push(timer_id);
    }
}

// ============================================================================
// Recording Notification
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Event {
    ControlPlaneConnected,
    StatusUpdated,
    ControlPlaneDisconnected(Status),
    PermanentFailure(Status),
    DatapathConnected,
    DatapathDisconnected(Option<NetworkInfo>, Status),
}

pub(super) struct RecordingNotification {
    pub events: Mutex<Vec<Event>>,
}

impl RecordingNotification {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Events with `StatusUpdated` filtered out, for order assertions.
    pub fn lifecycle_events(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| *e != Event::StatusUpdated)
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|e| predicate(e)).count()
    }
}

impl SessionNotification for RecordingNotification {
    fn control_plane_connected(&self) {
        self.events.lock().unwrap().push(Event::ControlPlaneConnected);
    }

    fn status_updated(&self) {
        self.events.lock().unwrap().push(Event::StatusUpdated);
    }

    fn control_plane_disconnected(&self, status: &Status) {
        self.events
            .lock()
            .unwrap()
            .push(Event::ControlPlaneDisconnected(status.clone()));
    }

    fn permanent_failure(&self, status: &Status) {
        self.events
            .lock()
            .unwrap()
            .push(Event::PermanentFailure(status.clone()));
    }

    fn datapath_connected(&self) {
        self.events.lock().unwrap().push(Event::DatapathConnected);
    }

    fn datapath_disconnected(&self, network_info: Option<&NetworkInfo>, status: &Status) {
        self.events
            .lock()
            .unwrap()
            .push(Event::DatapathDisconnected(
                network_info.cloned(),
                status.clone(),
            ));
    }
}

// ============================================================================
// Harness
// ============================================================================

pub(super) struct TestHarness {
    pub looper: Arc<LooperThread>,
    pub auth: Arc<FakeAuth>,
    pub egress: Arc<FakeEgressManager>,
    pub datapath: Arc<FakeDatapath>,
    pub vpn: Arc<FakeVpnService>,
    pub timer: Arc<FakeTimerInterface>,
    pub timer_manager: Arc<TimerManager>,
    pub notification: Arc<RecordingNotification>,
    pub session: Arc<Session>,
}

pub(super) fn bridge_config() -> KryptonConfig {
    KryptonConfig {
        zinc_url: "http://www.example.com/auth".into(),
        brass_url: "http://www.example.com/addegress".into(),
        service_type: "service_type".into(),
        ..KryptonConfig::default()
    }
}

pub(super) fn ppn_config() -> KryptonConfig {
    KryptonConfig {
        bridge_over_ppn: true,
        ..bridge_config()
    }
}

pub(super) fn make_harness(config: KryptonConfig) -> TestHarness {
    let looper = Arc::new(LooperThread::new("session-test"));
    let auth = FakeAuth::new();
    let egress = FakeEgressManager::new();
    let datapath = FakeDatapath::new();
    let vpn = FakeVpnService::new();
    let timer = FakeTimerInterface::new();
    let timer_manager = Arc::new(TimerManager::new(timer.clone()));
    let notification = RecordingNotification::new();

    let session = Session::new(
        auth.clone(),
        egress.clone(),
        datapath.clone(),
        vpn.clone(),
        timer_manager.clone(),
        config,
        looper.clone(),
    );
    session.register_notification_handler(notification.clone());
    auth.install(&session, &looper);
    egress.install(&session, &looper);

    TestHarness {
        looper,
        auth,
        egress,
        datapath,
        vpn,
        timer,
        timer_manager,
        notification,
        session,
    }
}

impl TestHarness {
    /// Wait until every job posted so far has run.
    pub fn drain(&self) {
        let (tx, rx) = mpsc::channel();
        self.looper.post(move || {
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(3))
            .expect("looper did not drain");
    }

    /// Drain enough rounds for a full start -> auth -> egress -> notify
    /// cascade.
    pub fn settle(&self) {
        for _ in 0..4 {
            self.drain();
        }
    }

    /// Run the happy-path control-plane flow to `Connected`.
    pub fn connect(&self) {
        self.session.start();
        self.settle();
        assert_eq!(self.session.state(), State::Connected);
        assert!(self.session.latest_status().is_ok());
    }

    /// Connect, bring up the datapath on cellular network 1234, and
    /// confirm establishment.
    pub fn connect_on_cellular(&self) {
        self.connect();
        self.session
            .set_network(Some(cellular(Some(1234))))
            .expect("set_network failed");
        self.session.datapath_established();
        self.settle();

        assert_eq!(
            self.notification.count(|e| *e == Event::DatapathConnected),
            1
        );
        assert_eq!(self.session.active_tun_fd(), Some(TUN_FD_BASE));
    }

    /// The rekey timer id, assuming the default 300 s cadence.
    pub fn rekey_timer_ids(&self) -> Vec<i32> {
        self.timer.started_with(Duration::from_secs(300))
    }

    /// Armed reattempt timers (500 ms cadence).
    pub fn reattempt_timer_ids(&self) -> Vec<i32> {
        self.timer.started_with(Duration::from_millis(500))
    }
}
