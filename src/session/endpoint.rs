//! Egress endpoint candidates and the reattempt schedule.
//!
//! The Add-Egress response lists socket addresses in wire order. The
//! session prefers IPv6: reconnect attempts walk an explicit four-slot
//! schedule of indices, two over the primary IPv6 candidate then two
//! over the primary IPv4 candidate. A family missing from the response
//! falls back to the other family's primary candidate.

use crate::status::Status;

/// Upper bound on datapath reconnect attempts per failure episode.
pub const MAX_REATTEMPTS: u32 = 4;

/// Parsed endpoint list plus the reattempt schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointCandidates {
    addrs: Vec<String>,
    schedule: [usize; MAX_REATTEMPTS as usize],
}

impl EndpointCandidates {
    /// Partition `sock_addrs` by family and build the schedule.
    ///
    /// IPv6 entries are recognized by their bracketed host part
    /// (`"[2604:ca00::5]:2153"`); everything else is IPv4.
    pub fn parse(sock_addrs: &[String]) -> Result<Self, Status> {
        if sock_addrs.is_empty() {
            return Err(Status::invalid_argument("no egress endpoints"));
        }

        let first_v6 = sock_addrs.iter().position(|a| a.starts_with('['));
        let first_v4 = sock_addrs.iter().position(|a| !a.starts_with('['));

        let v6 = first_v6.or(first_v4).expect("non-empty address list");
        let v4 = first_v4.or(first_v6).expect("non-empty address list");

        Ok(Self {
            addrs: sock_addrs.to_vec(),
            schedule: [v6, v6, v4, v4],
        })
    }

    /// All candidates in wire order, for first-time switches where the
    /// datapath picks.
    pub fn all(&self) -> &[String] {
        &self.addrs
    }

    /// The single candidate for reconnect attempt `attempt` (0-based).
    pub fn reattempt(&self, attempt: u32) -> Option<&str> {
        self.schedule
            .get(attempt as usize)
            .map(|&idx| self.addrs[idx].as_str())
    }
}
