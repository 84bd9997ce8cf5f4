//! Dataplane seam.
//!
//! The packet engine (encrypt/decrypt, MTU handling, tun and socket I/O)
//! lives behind `DatapathInterface`. The session configures it, hands it
//! borrowed pipe references on every network switch, and receives
//! lifecycle events through `DatapathNotification` on the notification
//! thread.

use crate::crypto::{CryptoSuite, TransformParams};
use crate::egress::AddEgressResponse;
use crate::status::Status;
use crate::vpn::{FdPacketPipe, NetworkInfo};
use std::sync::{Arc, Weak};

/// Events the datapath reports back to the session.
///
/// Implementations must invoke these from the notification thread; the
/// session mutates its state directly in response.
pub trait DatapathNotification: Send + Sync {
    /// The tunnel is passing traffic.
    fn datapath_established(&self);

    /// A recoverable failure; the session drives bounded reconnects.
    /// `network_fd` identifies the socket that failed.
    fn datapath_failed(&self, status: Status, network_fd: i32);

    /// An unrecoverable failure; no reconnect will be attempted.
    fn datapath_permanent_failure(&self, status: Status);
}

/// The session's view of the packet engine.
pub trait DatapathInterface: Send + Sync {
    /// Install the event handler. Called once during session construction.
    fn register_notification_handler(&self, handler: Weak<dyn DatapathNotification>);

    /// Configure the engine with the egress response and derived keys.
    /// Synchronous; establishment itself is reported via notification.
    fn start(
        &self,
        egress_response: Arc<AddEgressResponse>,
        params: &TransformParams,
        suite: CryptoSuite,
    ) -> Result<(), Status>;

    /// Tear the engine down.
    fn stop(&self);

    /// Point the tunnel at a (possibly absent) network.
    ///
    /// Pipe references are only valid for the duration of this call; the
    /// session keeps the underlying descriptors alive until the next
    /// switch completes.
    #[allow(clippy::too_many_arguments)]
    fn switch_network(
        &self,
        session_id: u32,
        endpoints: &[String],
        network_info: Option<&NetworkInfo>,
        network_pipe: Option<&FdPacketPipe>,
        tun_pipe: Option<&FdPacketPipe>,
        counter: u32,
    ) -> Result<(), Status>;

    /// Swap in fresh key material without restarting the tunnel.
    fn rekey(&self, local_public_value: &str, remote_public_value: &str) -> Result<(), Status>;
}
