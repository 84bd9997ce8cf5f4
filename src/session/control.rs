//! Control-plane flow: auth, egress negotiation, and rekeying.

use super::{Session, SessionInner, State, NO_TIMER};
use crate::crypto::SessionCrypto;
use crate::egress::{AddEgressResponse, PpnDataplaneRequestParams};
use crate::status::Status;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

impl Session {
    /// Begin the control-plane flow. Precondition: state `Initialized`.
    pub fn start(&self) {
        {
            let inner = self.lock();
            if inner.state != State::Initialized {
                warn!(state = %inner.state, "Start ignored, session already driven");
                return;
            }
        }
        info!("Session starting, requesting auth");
        self.auth.start(false);
    }

    /// Quiesce the session: cancel timers, release pipes, stop
    /// collaborators.
    pub fn stop(&self) {
        {
            let mut inner = self.lock();
            if inner.state == State::Stopped {
                return;
            }
            self.cancel_timers(&mut inner);
            inner.active_tun_pipe = None;
            inner.active_network_pipe = None;
            inner.pending_network_switch = false;
            // A permanent error outlives Stop on the debug surface.
            if inner.state != State::PermanentError {
                inner.state = State::Stopped;
            }
            info!(state = %inner.state, "Session stopped");
        }
        self.datapath.stop();
        self.auth.stop();
        self.egress_manager.stop();
    }

    /// Re-run auth + egress with fresh key material, preserving the
    /// established tunnel.
    pub fn do_rekey(&self) {
        {
            let mut inner = self.lock();
            if inner.state != State::Connected {
                debug!(state = %inner.state, "Rekey ignored, session not connected");
                return;
            }
            inner.is_rekey = true;
            inner.crypto = SessionCrypto::new();
        }
        info!("Rekey starting, requesting auth");
        self.auth.start(true);
    }

    // === Auth observer ===

    pub fn auth_successful(&self, is_rekey: bool) {
        if self.lock().state.is_inactive() {
            debug!("Auth success ignored, session inactive");
            return;
        }
        debug!(is_rekey, "Auth successful, requesting egress node");

        let Some(auth_response) = self.auth.auth_response() else {
            self.handle_control_plane_failure(Status::internal(
                "auth reported success without a response",
            ));
            return;
        };

        let result = if self.ppn_mode() {
            let params = {
                let inner = self.lock();
                let material = inner.crypto.my_key_material();
                let blind_signed_token = if self.config.enable_blind_signing {
                    auth_response.blinded_token_signatures.first().cloned()
                } else {
                    None
                };
                PpnDataplaneRequestParams {
                    client_public_value: material.public_value,
                    client_nonce: material.nonce,
                    suite: self.suite(),
                    downlink_spi: inner.crypto.downlink_spi(),
                    blind_signed_token,
                    is_rekey,
                }
            };
            self.egress_manager.get_egress_node_for_ppn_ipsec(params)
        } else {
            self.egress_manager.get_egress_node_for_bridge(auth_response)
        };

        if let Err(status) = result {
            self.handle_control_plane_failure(status);
        }
    }

    pub fn auth_failure(&self, status: Status) {
        if self.lock().state.is_inactive() {
            debug!(%status, "Auth failure ignored, session inactive");
            return;
        }

        if status.is_permanent() {
            warn!(%status, "Auth failed permanently");
            let mut inner = self.lock();
            self.cancel_timers(&mut inner);
            self.record_error(&mut inner, status.clone());
            inner.state = State::PermanentError;
            self.notify(&inner, move |n| n.permanent_failure(&status));
        } else {
            warn!(%status, "Auth failed");
            self.handle_control_plane_failure(status);
        }
    }

    // === Egress observer ===

    pub fn egress_available(&self, is_rekey: bool) {
        // The bridge egress path does not carry the rekey flag; fall back
        // to the session's own bookkeeping set by `do_rekey`.
        let is_rekey = {
            let inner = self.lock();
            if inner.state.is_inactive() {
                debug!("Egress response ignored, session inactive");
                return;
            }
            is_rekey || inner.is_rekey
        };

        let details = match self.egress_manager.get_egress_session_details() {
            Ok(details) => details,
            Err(status) => {
                self.handle_control_plane_failure(status);
                return;
            }
        };

        if is_rekey {
            self.handle_rekey_egress(details);
        } else {
            self.handle_initial_egress(details);
        }
    }

    pub fn egress_unavailable(&self, status: Status) {
        if self.lock().state.is_inactive() {
            debug!(%status, "Egress failure ignored, session inactive");
            return;
        }
        warn!(%status, "Egress negotiation failed");
        self.handle_control_plane_failure(status);
    }

    // === Flow internals ===

    /// Egress response for the initial connect: parse endpoints, bind the
    /// server key material, arm the rekey timer, announce the control
    /// plane, and start the datapath.
    fn handle_initial_egress(&self, details: Arc<AddEgressResponse>) {
        let mut inner = self.lock();
        if inner.state != State::Initialized {
            debug!(state = %inner.state, "Duplicate egress response ignored");
            return;
        }

        if let Err(status) = self.adopt_egress_response(&mut inner, &details) {
            drop(inner);
            self.handle_control_plane_failure(status);
            return;
        }
        inner.state = State::EgressSessionCreated;

        self.start_rekey_timer(&mut inner);

        info!(
            uplink_spi = inner.uplink_spi,
            "Control plane connected"
        );
        self.notify(&inner, |n| n.control_plane_connected());
        inner.state = State::ControlPlaneConnected;

        let params = match inner
            .crypto
            .transform_params(self.suite(), inner.uplink_spi)
        {
            Ok(params) => params,
            Err(status) => {
                drop(inner);
                self.handle_control_plane_failure(status);
                return;
            }
        };

        if let Err(status) = self.datapath.start(details, &params, self.suite()) {
            warn!(%status, "Datapath init failed");
            self.record_error(&mut inner, status.clone());
            inner.state = State::SessionError;
            self.cancel_timers(&mut inner);
            self.notify(&inner, move |n| n.control_plane_disconnected(&status));
            return;
        }
        inner.state = State::Connected;
        debug!("Datapath configured");

        if inner.pending_network_switch {
            inner.pending_network_switch = false;
            if let Err(status) = self.apply_network_switch(&mut inner) {
                warn!(%status, "Deferred network switch failed");
            }
        }
    }

    /// Egress response for a rekey: bind the new server material and swap
    /// keys into the running datapath instead of restarting it.
    fn handle_rekey_egress(&self, details: Arc<AddEgressResponse>) {
        let mut inner = self.lock();

        if let Err(status) = self.adopt_egress_response(&mut inner, &details) {
            drop(inner);
            self.handle_control_plane_failure(status);
            return;
        }

        let local_public = inner.crypto.public_value_base64();
        let remote_public = inner
            .crypto
            .remote_public_value_base64()
            .expect("remote key material bound above");

        if let Err(status) = self.datapath.rekey(&local_public, &remote_public) {
            drop(inner);
            warn!(%status, "Datapath rekey failed");
            self.handle_control_plane_failure(status);
            return;
        }

        inner.successful_rekeys += 1;
        inner.is_rekey = false;
        info!(successful_rekeys = inner.successful_rekeys, "Rekey complete");
        self.start_rekey_timer(&mut inner);
    }

    /// Store the response, derive endpoint candidates, and bind the
    /// server's key material into the session crypto.
    fn adopt_egress_response(
        &self,
        inner: &mut SessionInner,
        details: &Arc<AddEgressResponse>,
    ) -> Result<(), Status> {
        let candidates = super::EndpointCandidates::parse(details.egress_point_sock_addrs())?;
        let dataplane = details.ppn_dataplane();
        inner.crypto.set_remote_key_material(
            &dataplane.egress_point_public_value,
            &dataplane.server_nonce,
        )?;
        inner.endpoint_candidates = Some(candidates);
        inner.uplink_spi = details.uplink_spi();
        inner.egress_response = Some(details.clone());
        Ok(())
    }

    /// Record a control-plane failure and park the session in
    /// `SessionError`.
    fn handle_control_plane_failure(&self, status: Status) {
        let mut inner = self.lock();
        if inner.state.is_inactive() {
            return;
        }
        self.cancel_timers(&mut inner);
        self.record_error(&mut inner, status.clone());
        inner.state = State::SessionError;
        self.notify(&inner, move |n| n.control_plane_disconnected(&status));
    }

    /// (Re-)arm the periodic rekey timer.
    ///
    /// Start failure is logged and the rekey cycle skipped; the session
    /// stays up.
    fn start_rekey_timer(&self, inner: &mut SessionInner) {
        if inner.rekey_timer_id != NO_TIMER {
            self.timer_manager.cancel_timer(inner.rekey_timer_id);
            inner.rekey_timer_id = NO_TIMER;
        }

        let weak = self.weak_self.clone();
        let looper = self.looper.clone();
        let callback = move || {
            looper.post(move || {
                if let Some(session) = weak.upgrade() {
                    session.handle_rekey_timer();
                }
            });
        };

        match self
            .timer_manager
            .start_timer(callback, Duration::from_secs(self.config.rekey_interval_secs))
        {
            Ok(timer_id) => inner.rekey_timer_id = timer_id,
            Err(status) => {
                warn!(%status, "Failed to arm rekey timer, skipping rekey cycle");
            }
        }
    }

    /// Rekey timer expiry.
    fn handle_rekey_timer(&self) {
        {
            let mut inner = self.lock();
            inner.rekey_timer_id = NO_TIMER;
        }
        debug!("Rekey timer fired");
        self.do_rekey();
    }
}
