//! Krypton Session Controller
//!
//! Top-level state machine driving the VPN from idle through auth,
//! egress negotiation, dataplane establishment, network switching,
//! reconnection, and periodic rekeying. The session owns the tunnel and
//! network pipes, the per-session crypto, and the reattempt/rekey
//! timers; collaborators report back by invoking the observer methods
//! on the notification thread.
//!
//! ## Event flow
//!
//! `start()` fires the auth exchange; `auth_successful` drives egress
//! negotiation; `egress_available` parses endpoints, arms the rekey
//! timer, announces `ControlPlaneConnected`, and starts the datapath.
//! Network changes enter via `set_network`; datapath health enters via
//! the `DatapathNotification` observers and may provoke a bounded
//! reconnect schedule over the egress candidates.

mod control;
pub mod endpoint;
mod network;
#[cfg(test)]
mod tests;

pub use endpoint::{EndpointCandidates, MAX_REATTEMPTS};

use crate::auth::{AuthInterface, AuthNotification};
use crate::config::KryptonConfig;
use crate::crypto::{CryptoSuite, SessionCrypto};
use crate::datapath::{DatapathInterface, DatapathNotification};
use crate::egress::{AddEgressResponse, EgressManagerInterface, EgressNotification};
use crate::looper::LooperThread;
use crate::status::Status;
use crate::timer::TimerManager;
use crate::vpn::{FdPacketPipe, NetworkInfo, VpnServiceInterface};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::debug;

/// Sentinel for "no timer armed".
pub(crate) const NO_TIMER: i32 = -1;

/// Session lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Created; auth not yet completed.
    Initialized,
    /// Egress response received and parsed.
    EgressSessionCreated,
    /// Control plane fully negotiated; datapath starting.
    ControlPlaneConnected,
    /// Datapath configured; tunnel may or may not be passing traffic yet.
    Connected,
    /// Unrecoverable for this session; embedder must create a new one.
    SessionError,
    /// Permanent failure; no new session will help.
    PermanentError,
    /// Stopped by the embedder.
    Stopped,
}

impl State {
    /// Whether the session has reached a state where posted work must
    /// become a no-op.
    pub fn is_inactive(&self) -> bool {
        matches!(
            self,
            State::SessionError | State::PermanentError | State::Stopped
        )
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Initialized => "kInitialized",
            State::EgressSessionCreated => "kEgressSessionCreated",
            State::ControlPlaneConnected => "kControlPlaneConnected",
            State::Connected => "kConnected",
            State::SessionError => "kSessionError",
            State::PermanentError => "kPermanentError",
            State::Stopped => "kStopped",
        };
        write!(f, "{}", s)
    }
}

/// Embedder lifecycle callbacks.
///
/// Invoked on the notification thread; handlers may reenter the session
/// API freely.
pub trait SessionNotification: Send + Sync {
    fn control_plane_connected(&self);
    fn status_updated(&self);
    fn control_plane_disconnected(&self, status: &Status);
    fn permanent_failure(&self, status: &Status);
    fn datapath_connected(&self);
    fn datapath_disconnected(&self, network_info: Option<&NetworkInfo>, status: &Status);
}

/// Snapshot of session internals for the debug surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDebugInfo {
    pub state: String,
    pub status: String,
    pub successful_rekeys: u32,
    pub network_switches: u32,
}

pub(crate) struct SessionInner {
    state: State,
    latest_status: Status,
    notification: Option<Arc<dyn SessionNotification>>,
    active_network_info: Option<NetworkInfo>,
    /// A network change arrived before the control plane came up; apply
    /// it once the datapath is configured.
    pending_network_switch: bool,
    active_tun_pipe: Option<FdPacketPipe>,
    active_network_pipe: Option<FdPacketPipe>,
    endpoint_candidates: Option<EndpointCandidates>,
    egress_response: Option<Arc<AddEgressResponse>>,
    /// Server-assigned uplink SPI; doubles as the dataplane session id.
    uplink_spi: u32,
    reattempt_count: u32,
    reattempt_timer_id: i32,
    rekey_timer_id: i32,
    successful_rekeys: u32,
    /// Counts accepted `set_network` calls; the implicit initial switch
    /// counts as 1.
    network_switches: u32,
    is_rekey: bool,
    crypto: SessionCrypto,
}

/// The session controller. Construct with [`Session::new`]; all methods
/// take `&self` and serialize internally.
pub struct Session {
    config: KryptonConfig,
    auth: Arc<dyn AuthInterface>,
    egress_manager: Arc<dyn EgressManagerInterface>,
    datapath: Arc<dyn DatapathInterface>,
    vpn_service: Arc<dyn VpnServiceInterface>,
    timer_manager: Arc<TimerManager>,
    looper: Arc<LooperThread>,
    weak_self: Weak<Session>,
    inner: Mutex<SessionInner>,
}

impl Session {
    /// Create a session and register it as the datapath's event handler.
    pub fn new(
        auth: Arc<dyn AuthInterface>,
        egress_manager: Arc<dyn EgressManagerInterface>,
        datapath: Arc<dyn DatapathInterface>,
        vpn_service: Arc<dyn VpnServiceInterface>,
        timer_manager: Arc<TimerManager>,
        config: KryptonConfig,
        looper: Arc<LooperThread>,
    ) -> Arc<Self> {
        let session = Arc::new_cyclic(|weak: &Weak<Session>| Session {
            config,
            auth,
            egress_manager,
            datapath,
            vpn_service,
            timer_manager,
            looper,
            weak_self: weak.clone(),
            inner: Mutex::new(SessionInner {
                state: State::Initialized,
                latest_status: Status::ok(),
                notification: None,
                active_network_info: None,
                pending_network_switch: false,
                active_tun_pipe: None,
                active_network_pipe: None,
                endpoint_candidates: None,
                egress_response: None,
                uplink_spi: 0,
                reattempt_count: 0,
                reattempt_timer_id: NO_TIMER,
                rekey_timer_id: NO_TIMER,
                successful_rekeys: 0,
                network_switches: 1,
                is_rekey: false,
                crypto: SessionCrypto::new(),
            }),
        });

        let handler: Weak<dyn DatapathNotification> = session.weak_self.clone();
        session.datapath.register_notification_handler(handler);
        session
    }

    /// Install the embedder callback interface. Called once, before
    /// [`Session::start`].
    pub fn register_notification_handler(&self, handler: Arc<dyn SessionNotification>) {
        self.lock().notification = Some(handler);
    }

    // === Accessors ===

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.lock().state
    }

    /// Last terminal error; OK if none.
    pub fn latest_status(&self) -> Status {
        self.lock().latest_status.clone()
    }

    /// The network the session last accepted via `set_network`.
    pub fn active_network_info(&self) -> Option<NetworkInfo> {
        self.lock().active_network_info.clone()
    }

    /// Fill the debug surface.
    pub fn get_debug_info(&self) -> SessionDebugInfo {
        let inner = self.lock();
        SessionDebugInfo {
            state: inner.state.to_string(),
            status: inner.latest_status.to_string(),
            successful_rekeys: inner.successful_rekeys,
            network_switches: inner.network_switches,
        }
    }

    // === Internal helpers (shared by control.rs / network.rs) ===

    pub(crate) fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().expect("session lock poisoned")
    }

    /// The dataplane suite this session is parameterized with.
    pub(crate) fn suite(&self) -> CryptoSuite {
        // Suite selection is a config concern; both dialects currently
        // default to AES-128-GCM.
        CryptoSuite::Aes128Gcm
    }

    /// Whether the control plane speaks the PPN dialect.
    pub(crate) fn ppn_mode(&self) -> bool {
        self.config.bridge_over_ppn || self.config.ipsec_datapath
    }

    /// Post an embedder notification onto the looper.
    ///
    /// Never invoked inline: handlers may call back into the session.
    pub(crate) fn notify(
        &self,
        inner: &SessionInner,
        f: impl FnOnce(&dyn SessionNotification) + Send + 'static,
    ) {
        if let Some(notification) = inner.notification.clone() {
            self.looper.post(move || f(&*notification));
        } else {
            debug!("Notification dropped, no handler registered");
        }
    }

    /// Record a non-OK status and post `status_updated`.
    pub(crate) fn record_error(&self, inner: &mut SessionInner, status: Status) {
        inner.latest_status = status;
        self.notify(inner, |n| n.status_updated());
    }

    /// Cancel any armed reattempt and rekey timers.
    pub(crate) fn cancel_timers(&self, inner: &mut SessionInner) {
        if inner.reattempt_timer_id != NO_TIMER {
            self.timer_manager.cancel_timer(inner.reattempt_timer_id);
            inner.reattempt_timer_id = NO_TIMER;
        }
        if inner.rekey_timer_id != NO_TIMER {
            self.timer_manager.cancel_timer(inner.rekey_timer_id);
            inner.rekey_timer_id = NO_TIMER;
        }
    }

    // === Test-only accessors ===

    #[cfg(test)]
    pub(crate) fn reattempt_count(&self) -> u32 {
        self.lock().reattempt_count
    }

    #[cfg(test)]
    pub(crate) fn reattempt_timer_id(&self) -> i32 {
        self.lock().reattempt_timer_id
    }

    #[cfg(test)]
    pub(crate) fn active_tun_fd(&self) -> Option<i32> {
        self.lock().active_tun_pipe.as_ref().map(|p| p.fd())
    }

    #[cfg(test)]
    pub(crate) fn active_network_fd(&self) -> Option<i32> {
        self.lock().active_network_pipe.as_ref().map(|p| p.fd())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Session")
            .field("state", &inner.state)
            .field("latest_status", &inner.latest_status)
            .field("network_switches", &inner.network_switches)
            .field("successful_rekeys", &inner.successful_rekeys)
            .field("reattempt_count", &inner.reattempt_count)
            .finish()
    }
}

// The collaborator observer traits all route to the inherent methods so
// production collaborators holding `Weak<dyn …>` and tests driving the
// session directly go through identical code.

impl AuthNotification for Session {
    fn auth_successful(&self, is_rekey: bool) {
        Session::auth_successful(self, is_rekey);
    }

    fn auth_failure(&self, status: Status) {
        Session::auth_failure(self, status);
    }
}

impl EgressNotification for Session {
    fn egress_available(&self, is_rekey: bool) {
        Session::egress_available(self, is_rekey);
    }

    fn egress_unavailable(&self, status: Status) {
        Session::egress_unavailable(self, status);
    }
}

impl DatapathNotification for Session {
    fn datapath_established(&self) {
        Session::datapath_established(self);
    }

    fn datapath_failed(&self, status: Status, network_fd: i32) {
        Session::datapath_failed(self, status, network_fd);
    }

    fn datapath_permanent_failure(&self, status: Status) {
        Session::datapath_permanent_failure(self, status);
    }
}
