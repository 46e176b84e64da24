use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, ensure};
use rand::Rng;

use crate::types::{GroupId, PeerInfo, ServerId};

/// Timer settings shared by every group of a server.
///
/// The heartbeat must fire several times per minimum election timeout or
/// followers start elections against a healthy leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingConfig {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    /// Bound on connecting to and writing to a peer.
    pub rpc_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(1000),
            election_timeout_max: Duration::from_millis(2000),
            heartbeat_interval: Duration::from_millis(250),
            rpc_timeout: Duration::from_millis(500),
        }
    }
}

impl TimingConfig {
    /// Uniformly drawn from `[election_timeout_min, election_timeout_max]`.
    pub fn random_election_timeout(&self) -> Duration {
        let min = self.election_timeout_min.as_millis() as u64;
        let max = (self.election_timeout_max.as_millis() as u64).max(min);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.election_timeout_min <= self.election_timeout_max,
            "election timeout min {:?} exceeds max {:?}",
            self.election_timeout_min,
            self.election_timeout_max
        );
        ensure!(
            self.heartbeat_interval < self.election_timeout_min,
            "heartbeat interval {:?} must be below the election timeout {:?}",
            self.heartbeat_interval,
            self.election_timeout_min
        );
        ensure!(!self.rpc_timeout.is_zero(), "rpc timeout must be positive");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub id: ServerId,
    pub listen_addr: SocketAddr,
    /// Address peers and clients are told to use; defaults to `listen_addr`.
    pub advertise_addr: String,
    pub community: String,
    pub peers: Vec<PeerInfo>,
    /// Groups created at startup with `peers` as their members.
    pub groups: Vec<GroupId>,
    pub timing: TimingConfig,
    pub max_batch_entries: usize,
}

impl ServerConfig {
    pub fn new(id: ServerId, listen_addr: SocketAddr, community: impl Into<String>) -> Self {
        Self {
            id,
            listen_addr,
            advertise_addr: listen_addr.to_string(),
            community: community.into(),
            peers: Vec::new(),
            groups: Vec::new(),
            timing: TimingConfig::default(),
            max_batch_entries: 64,
        }
    }

    /// How this server introduces itself to others.
    pub fn me(&self) -> PeerInfo {
        PeerInfo::new(self.id, self.advertise_addr.clone(), self.community.clone())
    }

    pub fn validate(&self) -> Result<()> {
        self.timing.validate()?;
        ensure!(!self.community.is_empty(), "community must not be empty");
        ensure!(self.max_batch_entries >= 1, "max batch entries must be at least 1");

        let mut seen = HashSet::new();
        for peer in &self.peers {
            ensure!(
                peer.id != self.id,
                "peer {} reuses this server's own id",
                peer.addr
            );
            ensure!(seen.insert(peer.id), "peer id {} is listed twice", peer.id);
            ensure!(
                peer.community == self.community,
                "peer {} is in community '{}', expected '{}'",
                peer.id,
                peer.community,
                self.community
            );
        }
        Ok(())
    }
}
