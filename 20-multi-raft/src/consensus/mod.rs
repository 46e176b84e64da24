//! Raft consensus for a single group.
//!
//! [`Consensus`] is a deterministic state machine: it never touches the
//! network or the clock. Its owner (the group worker in [`crate::group`])
//! feeds it timer expirations, peer messages and client commands, and flushes
//! the [`Actions`] it returns: messages to send, whether to re-arm the
//! election timer, and newly learned peers.
//!
//! The protocol is split by concern:
//!
//! - `election`: candidacy, voting and stepping down
//! - `replication`: AppendEntries on both sides and commit advancement
//! - `apply`: the in-order pipeline from committed entries to the state machine
//! - `transaction`: client sessions that commit a batch of proposals as a unit
//! - `membership`: adding and removing servers through configuration entries
//! - `client`: leader gating of client commands

mod apply;
mod client;
mod election;
mod membership;
mod replication;
mod role;
mod transaction;


use std::collections::BTreeMap;

use tokio::sync::oneshot;
use tracing::warn;

use crate::log::{LogError, LogStore};
use crate::message::{AddPeerResponse, CommandResponse, NodeState, PeerPayload};
use crate::state_machine::StateMachine;
use crate::types::{Entry, EntryPayload, GroupId, LogIndex, PeerInfo, ServerId, SessionId, Term};

pub use client::ClientCommand;
pub use role::{CandidateState, LeaderState, ReplicationProgress, Role};
pub use transaction::{Session, SessionStatus};

use transaction::SessionTable;

/// Where the answer to a client command is delivered once it is known.
pub type Responder = oneshot::Sender<CommandResponse>;

/// Where the answer to a membership change is delivered.
pub type MembershipResponder = oneshot::Sender<AddPeerResponse>;

/// Side effects requested by one call into [`Consensus`].
#[derive(Debug, Default)]
pub struct Actions {
    pub peer_messages: Vec<(ServerId, PeerPayload)>,
    pub reset_election_timer: bool,
    /// Servers that joined the group and need a transport link.
    pub learned_peers: Vec<PeerInfo>,
}

impl Actions {
    fn send(&mut self, to: ServerId, payload: PeerPayload) {
        self.peer_messages.push((to, payload));
    }
}

/// Point-in-time view of a group, for operators and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupStatus {
    pub group_id: GroupId,
    pub id: ServerId,
    pub state: NodeState,
    pub term: Term,
    pub leader: Option<ServerId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub latest_index: LogIndex,
    /// Every member, this server included, ordered by id.
    pub members: Vec<PeerInfo>,
    pub open_sessions: Vec<SessionId>,
}

pub struct Consensus {
    me: PeerInfo,
    group_id: GroupId,
    /// Other members of the group; never contains `me`.
    peers: BTreeMap<ServerId, PeerInfo>,
    /// False once a configuration without this server has been applied.
    member: bool,
    log: Box<dyn LogStore>,
    state_machine: Box<dyn StateMachine>,
    commit_index: LogIndex,
    last_applied: LogIndex,
    role: Role,
    sessions: SessionTable,
    pending: BTreeMap<LogIndex, Responder>,
    pending_membership: BTreeMap<LogIndex, MembershipResponder>,
    max_batch: usize,
}

impl Consensus {
    pub fn new(
        me: PeerInfo,
        group_id: GroupId,
        peers: impl IntoIterator<Item = PeerInfo>,
        log: Box<dyn LogStore>,
        state_machine: Box<dyn StateMachine>,
        max_batch: usize,
    ) -> Self {
        let peers = peers
            .into_iter()
            .filter(|peer| peer.id != me.id)
            .map(|peer| (peer.id, peer))
            .collect();
        Self {
            me,
            group_id,
            peers,
            member: true,
            log,
            state_machine,
            commit_index: 0,
            last_applied: 0,
            role: Role::Follower { leader: None },
            sessions: SessionTable::default(),
            pending: BTreeMap::new(),
            pending_membership: BTreeMap::new(),
            max_batch: max_batch.max(1),
        }
    }

    pub fn id(&self) -> ServerId {
        self.me.id
    }

    pub fn me(&self) -> &PeerInfo {
        &self.me
    }

    pub fn group_id(&self) -> &GroupId {
        &self.group_id
    }

    pub fn state(&self) -> NodeState {
        self.role.state()
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader(_))
    }

    pub fn current_term(&self) -> Term {
        self.log.current_term()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn latest_index(&self) -> LogIndex {
        self.log.latest_index()
    }

    pub fn log(&self) -> &dyn LogStore {
        self.log.as_ref()
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerInfo> {
        self.peers.values()
    }

    pub fn leader_id(&self) -> Option<ServerId> {
        match &self.role {
            Role::Leader(_) => Some(self.me.id),
            Role::Follower { leader } => *leader,
            Role::Candidate(_) => None,
        }
    }

    /// Address record of the leader, when this server knows one.
    pub fn leader_hint(&self) -> Option<&PeerInfo> {
        match self.leader_id()? {
            id if id == self.me.id => Some(&self.me),
            id => self.peers.get(&id),
        }
    }

    /// All members ordered by id, this server included while it is one.
    pub fn members(&self) -> Vec<PeerInfo> {
        let mut members: Vec<PeerInfo> = self.peers.values().cloned().collect();
        if self.member {
            members.push(self.me.clone());
        }
        members.sort_by_key(|peer| peer.id);
        members
    }

    pub fn status(&self) -> GroupStatus {
        GroupStatus {
            group_id: self.group_id.clone(),
            id: self.me.id,
            state: self.state(),
            term: self.current_term(),
            leader: self.leader_id(),
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            latest_index: self.log.latest_index(),
            members: self.members(),
            open_sessions: self.sessions.open_ids(),
        }
    }

    /// Strict majority of the current membership.
    fn majority(&self) -> usize {
        (self.peers.len() + usize::from(self.member)) / 2 + 1
    }

    /// Entry point for every message received from another server.
    pub fn step(&mut self, from: ServerId, payload: PeerPayload, actions: &mut Actions) {
        match payload {
            PeerPayload::AppendEntriesRequest(request) => {
                self.handle_append_entries(from, request, actions)
            }
            PeerPayload::AppendEntriesResponse(response) => {
                self.handle_append_entries_response(from, response, actions)
            }
            PeerPayload::RequestVoteRequest(request) => {
                self.handle_request_vote(from, request, actions)
            }
            PeerPayload::RequestVoteResponse(response) => {
                self.handle_request_vote_response(from, response, actions)
            }
            PeerPayload::TransactionBegin { session } => {
                self.observe_session(from, session, SessionStatus::Open)
            }
            PeerPayload::TransactionCommit { session } => {
                self.observe_session(from, session, SessionStatus::Committed)
            }
            PeerPayload::TransactionRollback { session } => {
                self.observe_session(from, session, SessionStatus::RolledBack)
            }
        }
    }

    /// Appends a new entry in the current term. Leader only.
    fn append_local(&mut self, payload: EntryPayload) -> Result<LogIndex, LogError> {
        let term = self.log.current_term();
        self.log.append(Entry::new(term, payload))
    }

    /// Answer given to a client that reached a server which cannot lead.
    fn redirect(&self) -> CommandResponse {
        match self.leader_hint() {
            Some(leader) if leader.id != self.me.id => CommandResponse::NotLeader(leader.addr.clone()),
            _ => CommandResponse::UnknownLeader,
        }
    }

    /// Resolves every in-flight client call after leadership was lost.
    fn fail_pending_calls(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        let membership = std::mem::take(&mut self.pending_membership);
        if pending.is_empty() && membership.is_empty() {
            return;
        }

        warn!(
            group = %self.group_id,
            calls = pending.len() + membership.len(),
            "leadership lost; failing pending calls"
        );
        let redirect = self.redirect();
        for (_, responder) in pending {
            let _ = responder.send(redirect.clone());
        }
        for (_, responder) in membership {
            let _ = responder.send(AddPeerResponse::Failure(
                "leadership lost before the change committed".to_string(),
            ));
        }
    }
}
