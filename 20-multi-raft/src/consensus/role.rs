use std::collections::{BTreeMap, BTreeSet};

use crate::message::NodeState;
use crate::types::{LogIndex, ServerId};

/// Role of a server within one group, carrying only the state that role needs.
#[derive(Debug)]
pub enum Role {
    Follower { leader: Option<ServerId> },
    Candidate(CandidateState),
    Leader(LeaderState),
}

impl Role {
    pub fn state(&self) -> NodeState {
        match self {
            Role::Follower { .. } => NodeState::Follower,
            Role::Candidate(_) => NodeState::Candidate,
            Role::Leader(_) => NodeState::Leader,
        }
    }
}

/// Votes collected for the current candidacy, own vote included.
#[derive(Debug)]
pub struct CandidateState {
    granted: BTreeSet<ServerId>,
}

impl CandidateState {
    pub fn new(own_id: ServerId) -> Self {
        Self {
            granted: BTreeSet::from([own_id]),
        }
    }

    pub fn record_vote(&mut self, voter: ServerId) {
        self.granted.insert(voter);
    }

    pub fn votes(&self) -> usize {
        self.granted.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationProgress {
    /// Next index to send to the peer.
    pub next_index: LogIndex,
    /// Highest index known to be replicated on the peer.
    pub match_index: LogIndex,
}

impl ReplicationProgress {
    fn new(latest_index: LogIndex) -> Self {
        Self {
            next_index: latest_index + 1,
            match_index: 0,
        }
    }
}

#[derive(Debug)]
pub struct LeaderState {
    progress: BTreeMap<ServerId, ReplicationProgress>,
}

impl LeaderState {
    pub fn new(latest_index: LogIndex, peers: impl IntoIterator<Item = ServerId>) -> Self {
        let progress = peers
            .into_iter()
            .map(|peer| (peer, ReplicationProgress::new(latest_index)))
            .collect();
        Self { progress }
    }

    pub fn progress(&self, peer: ServerId) -> Option<ReplicationProgress> {
        self.progress.get(&peer).copied()
    }

    pub fn add_peer(&mut self, peer: ServerId, latest_index: LogIndex) {
        self.progress
            .entry(peer)
            .or_insert_with(|| ReplicationProgress::new(latest_index));
    }

    pub fn remove_peer(&mut self, peer: ServerId) {
        self.progress.remove(&peer);
    }

    pub fn record_success(&mut self, peer: ServerId, index: LogIndex) {
        if let Some(progress) = self.progress.get_mut(&peer) {
            progress.match_index = progress.match_index.max(index);
            progress.next_index = progress.match_index + 1;
        }
    }

    /// Moves `next_index` back after a consistency rejection and returns
    /// whether it moved.
    ///
    /// Never jumps lower than the follower's hint + 1 and always retreats by at
    /// least one, so every index that could still conflict gets checked. A hint
    /// below `match_index` means the follower lost entries it had confirmed
    /// (a restart on a volatile log), so the match is forgotten.
    pub fn back_off(&mut self, peer: ServerId, hint: LogIndex) -> bool {
        let Some(progress) = self.progress.get_mut(&peer) else {
            return false;
        };
        if hint < progress.match_index {
            progress.match_index = hint;
        }
        let before = progress.next_index;
        let retreat = before.saturating_sub(1);
        progress.next_index = (hint + 1).min(retreat).max(progress.match_index + 1).max(1);
        progress.next_index < before
    }

    /// Servers (leader included) holding `index`.
    pub fn count_replicated(&self, index: LogIndex, leader_latest: LogIndex) -> usize {
        let leader = usize::from(leader_latest >= index);
        leader
            + self
                .progress
                .values()
                .filter(|progress| progress.match_index >= index)
                .count()
    }
}
