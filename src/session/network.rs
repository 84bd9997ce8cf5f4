//! Network switching, pipe management, and the datapath reconnect flow.

use super::{Session, SessionInner, State, MAX_REATTEMPTS, NO_TIMER};
use crate::status::Status;
use crate::vpn::NetworkInfo;
use std::time::Duration;
use tracing::{debug, info, warn};

impl Session {
    /// Inform the session of the current platform network.
    ///
    /// `None` means no network is available: the datapath is pointed at
    /// nothing while the tun pipe is retained. Before the control plane
    /// is up the switch is recorded and deferred.
    pub fn set_network(&self, network_info: Option<NetworkInfo>) -> Result<(), Status> {
        let mut inner = self.lock();
        if inner.state.is_inactive() {
            return Err(Status::failed_precondition("session is not active"));
        }

        inner.network_switches += 1;
        inner.active_network_info = network_info.clone();
        match &network_info {
            Some(ni) => info!(network = %ni, switches = inner.network_switches, "Network changed"),
            None => info!(switches = inner.network_switches, "Network lost"),
        }

        if inner.state != State::Connected {
            inner.pending_network_switch = true;
            debug!(state = %inner.state, "Switch deferred until control plane connects");
            return Ok(());
        }

        self.apply_network_switch(&mut inner)
    }

    /// Drive the datapath onto `active_network_info`.
    ///
    /// Creates the tunnel on first use, a fresh protected socket on every
    /// switch, and hands both pipes to the datapath by reference. The
    /// displaced network pipe is released only after `switch_network`
    /// returns.
    pub(super) fn apply_network_switch(&self, inner: &mut SessionInner) -> Result<(), Status> {
        let Some(candidates) = inner.endpoint_candidates.clone() else {
            return Err(Status::failed_precondition("no egress endpoints negotiated"));
        };

        match inner.active_network_info.clone() {
            Some(network_info) => {
                if inner.active_tun_pipe.is_none() {
                    let egress = inner
                        .egress_response
                        .clone()
                        .ok_or_else(|| Status::failed_precondition("no egress response"))?;
                    let tunnel_config = egress.to_tunnel_config()?;
                    let tun_pipe = match self.vpn_service.create_tunnel(&tunnel_config) {
                        Ok(pipe) => pipe,
                        Err(status) => {
                            warn!(%status, "Tunnel creation failed");
                            self.handle_datapath_failure(inner, status.clone());
                            return Err(status);
                        }
                    };
                    info!(tun_fd = tun_pipe.fd(), "Tunnel created");
                    inner.active_tun_pipe = Some(tun_pipe);
                }

                let network_pipe = match self
                    .vpn_service
                    .create_protected_network_socket(&network_info)
                {
                    Ok(pipe) => pipe,
                    Err(status) => {
                        warn!(%status, network = %network_info, "Protected socket creation failed");
                        self.handle_datapath_failure(inner, status.clone());
                        return Err(status);
                    }
                };

                // The old pipe must outlive the switch call; the datapath
                // may still be draining its descriptor.
                let displaced = inner.active_network_pipe.replace(network_pipe);
                let result = self.datapath.switch_network(
                    inner.uplink_spi,
                    candidates.all(),
                    Some(&network_info),
                    inner.active_network_pipe.as_ref(),
                    inner.active_tun_pipe.as_ref(),
                    inner.network_switches,
                );
                drop(displaced);

                if let Err(status) = result {
                    warn!(%status, network = %network_info, "Network switch failed");
                    self.handle_datapath_failure(inner, status.clone());
                    return Err(status);
                }
                debug!(network = %network_info, "Network switch issued");
                Ok(())
            }
            None => {
                let result = self.datapath.switch_network(
                    inner.uplink_spi,
                    candidates.all(),
                    None,
                    None,
                    inner.active_tun_pipe.as_ref(),
                    inner.network_switches,
                );
                inner.active_network_pipe = None;

                if let Err(status) = result {
                    warn!(%status, "No-network switch failed");
                    self.handle_datapath_failure(inner, status.clone());
                    return Err(status);
                }
                debug!("Datapath switched to no network");
                Ok(())
            }
        }
    }

    // === Datapath observer ===

    /// The tunnel is passing traffic: clear the reconnect schedule.
    pub fn datapath_established(&self) {
        let mut inner = self.lock();
        if inner.state != State::Connected {
            debug!(state = %inner.state, "Datapath establishment ignored");
            return;
        }

        inner.reattempt_count = 0;
        if inner.reattempt_timer_id != NO_TIMER {
            self.timer_manager.cancel_timer(inner.reattempt_timer_id);
            inner.reattempt_timer_id = NO_TIMER;
        }
        info!("Datapath connected");
        self.notify(&inner, |n| n.datapath_connected());
    }

    /// A recoverable datapath failure.
    pub fn datapath_failed(&self, status: Status, network_fd: i32) {
        let mut inner = self.lock();
        if inner.state != State::Connected {
            debug!(state = %inner.state, %status, "Datapath failure ignored");
            return;
        }
        warn!(%status, network_fd, "Datapath failed");
        self.handle_datapath_failure(&mut inner, status);
    }

    /// An unrecoverable datapath failure: report immediately, no retry.
    pub fn datapath_permanent_failure(&self, status: Status) {
        let mut inner = self.lock();
        if inner.state != State::Connected {
            debug!(state = %inner.state, %status, "Datapath permanent failure ignored");
            return;
        }
        warn!(%status, "Datapath failed permanently");

        if inner.reattempt_timer_id != NO_TIMER {
            self.timer_manager.cancel_timer(inner.reattempt_timer_id);
            inner.reattempt_timer_id = NO_TIMER;
        }
        inner.reattempt_count = 0;
        self.record_error(&mut inner, status.clone());

        let network_info = inner.active_network_info.clone();
        self.notify(&inner, move |n| {
            n.datapath_disconnected(network_info.as_ref(), &status)
        });
    }

    /// Reconnect-timer expiry: recreate the protected socket and switch
    /// to the scheduled endpoint.
    pub fn attempt_datapath_reconnect(&self) {
        let mut inner = self.lock();
        if inner.state != State::Connected {
            debug!(state = %inner.state, "Reconnect attempt ignored");
            return;
        }
        inner.reattempt_timer_id = NO_TIMER;

        let Some(network_info) = inner.active_network_info.clone() else {
            debug!("Reconnect attempt skipped, no active network");
            return;
        };
        let Some(candidates) = inner.endpoint_candidates.clone() else {
            debug!("Reconnect attempt skipped, no egress endpoints");
            return;
        };
        let attempt = inner.reattempt_count.saturating_sub(1);
        let Some(endpoint) = candidates.reattempt(attempt).map(str::to_owned) else {
            debug!(attempt, "Reconnect schedule exhausted");
            return;
        };

        info!(attempt, endpoint = %endpoint, "Attempting datapath reconnect");

        let network_pipe = match self
            .vpn_service
            .create_protected_network_socket(&network_info)
        {
            Ok(pipe) => pipe,
            Err(status) => {
                warn!(%status, "Protected socket creation failed during reconnect");
                self.handle_datapath_failure(&mut inner, status);
                return;
            }
        };

        let displaced = inner.active_network_pipe.replace(network_pipe);
        let result = self.datapath.switch_network(
            inner.uplink_spi,
            std::slice::from_ref(&endpoint),
            Some(&network_info),
            inner.active_network_pipe.as_ref(),
            inner.active_tun_pipe.as_ref(),
            inner.network_switches,
        );
        drop(displaced);

        if let Err(status) = result {
            warn!(%status, endpoint = %endpoint, "Reconnect switch failed");
            self.handle_datapath_failure(&mut inner, status);
        }
    }

    // === Failure policy ===

    /// Bounded-retry policy shared by every datapath-class failure.
    ///
    /// Below the reattempt limit, arms the delay timer and counts the
    /// attempt; at the limit, reports `DatapathDisconnected` and resets
    /// the schedule, leaving the session `Connected` awaiting another
    /// network change.
    pub(super) fn handle_datapath_failure(&self, inner: &mut SessionInner, status: Status) {
        if inner.reattempt_count < MAX_REATTEMPTS {
            let weak = self.weak_self.clone();
            let looper = self.looper.clone();
            let callback = move || {
                looper.post(move || {
                    if let Some(session) = weak.upgrade() {
                        session.attempt_datapath_reconnect();
                    }
                });
            };

            let delay = Duration::from_millis(self.config.datapath_reattempt_delay_ms);
            match self.timer_manager.start_timer(callback, delay) {
                Ok(timer_id) => {
                    inner.reattempt_timer_id = timer_id;
                    inner.reattempt_count += 1;
                    self.record_error(inner, status.clone());
                    debug!(
                        reattempt = inner.reattempt_count,
                        delay_ms = delay.as_millis() as u64,
                        "Reconnect scheduled"
                    );
                }
                Err(timer_status) => {
                    // Retry skipped; the session stays up awaiting a
                    // network change or the next failure report.
                    warn!(%timer_status, "Failed to arm reconnect timer");
                    self.record_error(inner, status);
                }
            }
        } else {
            info!(
                reattempts = inner.reattempt_count,
                %status,
                "Reconnect schedule exhausted, reporting datapath disconnect"
            );
            inner.reattempt_count = 0;
            if inner.reattempt_timer_id != NO_TIMER {
                self.timer_manager.cancel_timer(inner.reattempt_timer_id);
                inner.reattempt_timer_id = NO_TIMER;
            }
            self.record_error(inner, status.clone());

            let network_info = inner.active_network_info.clone();
            self.notify(inner, move |n| {
                n.datapath_disconnected(network_info.as_ref(), &status)
            });
        }
    }
}
