//! Krypton: client-side VPN tunnel session controller.
//!
//! Drives a VPN session from idle through authentication, egress
//! negotiation, dataplane establishment, network switching, bounded
//! reconnection, and periodic rekeying, surfacing lifecycle events to
//! an embedder. Platform integration (HTTP transport, packet engine,
//! tun devices, protected sockets, timer scheduling) enters through
//! trait seams.

pub mod auth;
pub mod config;
pub mod crypto;
pub mod datapath;
pub mod egress;
pub mod http;
pub mod looper;
pub mod session;
pub mod status;
pub mod timer;
pub mod vpn;

// Re-export status types
pub use status::{Status, StatusCode};

// Re-export config types
pub use config::{ConfigError, KryptonConfig};

// Re-export executor and timer types
pub use looper::LooperThread;
pub use timer::{ThreadTimer, TimerInterface, TimerManager};

// Re-export HTTP seams
pub use http::{HttpFetcherInterface, HttpRequest, HttpResponse, OAuthTokenProvider};

// Re-export crypto types
pub use crypto::{CryptoSuite, KeyMaterial, SessionCrypto, TransformParams};

// Re-export auth types
pub use auth::{Auth, AuthAndSignResponse, AuthInterface, AuthNotification};

// Re-export egress types
pub use egress::{
    AddEgressResponse, EgressManager, EgressManagerInterface, EgressNotification,
    PpnDataplaneRequestParams, PpnDataplaneResponse, PrivateIpRange,
};

// Re-export datapath seams
pub use datapath::{DatapathInterface, DatapathNotification};

// Re-export VPN service types
pub use vpn::{
    FdPacketPipe, IpFamily, IpRange, NetworkInfo, NetworkType, TunnelConfig, VpnServiceInterface,
};

// Re-export session types
pub use session::{
    EndpointCandidates, Session, SessionDebugInfo, SessionNotification, State, MAX_REATTEMPTS,
};
