use tracing::{debug, error, info};

use super::role::Role;
use super::transaction::SessionStatus;
use super::{Actions, Consensus};
use crate::message::{AddPeerResponse, CommandResponse};
use crate::state_machine::StateMachineError;
use crate::types::{EntryPayload, LogIndex, PeerInfo, SessionId};

fn to_response(result: Result<Vec<u8>, StateMachineError>) -> CommandResponse {
    match result {
        Ok(data) => CommandResponse::Success(data),
        Err(err) => CommandResponse::failure(err),
    }
}

/// How far a transactional unit starting at some index can be applied.
enum Unit {
    /// Its commit marker is not committed yet.
    Pending,
    /// Entries `start..=last` are followed by their committed marker.
    Complete { last: LogIndex, marker: LogIndex },
    /// A different committed entry follows `start..=last`; the unit never
    /// completed and is skipped.
    Void { last: LogIndex },
}

impl Consensus {
    /// Feeds committed entries to the state machine in log order, once each.
    pub(super) fn apply_committed(&mut self, actions: &mut Actions) {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let Some(entry) = self.log.entry(index) else {
                error!(group = %self.group_id, index, "committed entry missing from log");
                return;
            };

            let term = entry.term;
            match entry.payload.clone() {
                EntryPayload::Command(data) => {
                    let response = to_response(self.state_machine.apply(&data));
                    self.resolve(index, response);
                }
                EntryPayload::Query(query) => {
                    // Reads only matter to the client waiting for them.
                    if let Some(responder) = self.pending.remove(&index) {
                        let _ = responder.send(to_response(self.state_machine.query(&query)));
                    }
                }
                EntryPayload::TransactionBegin { session } => {
                    self.sessions.observe(&session, SessionStatus::Open, term);
                    let response = CommandResponse::Success(session.as_bytes().to_vec());
                    self.resolve(index, response);
                }
                EntryPayload::Transactional { session, .. } => {
                    match self.scan_unit(index, &session) {
                        Unit::Pending => return,
                        Unit::Complete { last, marker } => {
                            let response = self.apply_unit(index, last);
                            self.sessions.observe(&session, SessionStatus::Committed, term);
                            self.resolve(marker, response);
                            self.last_applied = marker;
                        }
                        Unit::Void { last } => {
                            debug!(group = %self.group_id, %session, from = index, to = last, "skipping incomplete transaction");
                            self.last_applied = last;
                        }
                    }
                    continue;
                }
                EntryPayload::TransactionCommit { session } => {
                    // Only reached for a unit without proposals.
                    self.sessions.observe(&session, SessionStatus::Committed, term);
                    self.resolve(index, CommandResponse::Success(Vec::new()));
                }
                EntryPayload::Configuration { peers } => {
                    self.apply_configuration(index, peers, actions);
                }
            }
            self.last_applied = index;
        }
    }

    fn resolve(&mut self, index: LogIndex, response: CommandResponse) {
        if let Some(responder) = self.pending.remove(&index) {
            let _ = responder.send(response);
        }
    }

    /// Finds where the transactional run starting at `start` ends.
    ///
    /// Decisions are only taken on committed entries, which can no longer be
    /// replaced by a later leader.
    fn scan_unit(&self, start: LogIndex, session: &SessionId) -> Unit {
        let mut last = start;
        loop {
            let next = last + 1;
            if next > self.commit_index {
                return Unit::Pending;
            }
            match self.log.entry(next).map(|entry| &entry.payload) {
                Some(EntryPayload::Transactional { session: s, .. }) if s == session => last = next,
                Some(EntryPayload::TransactionCommit { session: s }) if s == session => {
                    return Unit::Complete { last, marker: next };
                }
                Some(_) => return Unit::Void { last },
                None => return Unit::Pending,
            }
        }
    }

    /// Applies `start..=last` as one unit.
    ///
    /// The answer is the first failure, if any entry failed, and otherwise the
    /// result of the last entry.
    fn apply_unit(&mut self, start: LogIndex, last: LogIndex) -> CommandResponse {
        let mut failure = None;
        let mut result = Vec::new();
        for index in start..=last {
            let Some(EntryPayload::Transactional { data, .. }) =
                self.log.entry(index).map(|entry| entry.payload.clone())
            else {
                continue;
            };
            match self.state_machine.apply(&data) {
                Ok(output) => result = output,
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }
        match failure {
            Some(err) => CommandResponse::failure(err),
            None => CommandResponse::Success(result),
        }
    }

    /// Installs the membership carried by a committed configuration entry.
    fn apply_configuration(&mut self, index: LogIndex, members: Vec<PeerInfo>, actions: &mut Actions) {
        self.member = members.iter().any(|peer| peer.id == self.me.id);
        let members: std::collections::BTreeMap<_, _> = members
            .into_iter()
            .filter(|peer| peer.id != self.me.id)
            .map(|peer| (peer.id, peer))
            .collect();

        let added: Vec<PeerInfo> = members
            .values()
            .filter(|peer| self.peers.get(&peer.id) != Some(*peer))
            .cloned()
            .collect();
        let removed: Vec<_> = self
            .peers
            .keys()
            .filter(|id| !members.contains_key(id))
            .copied()
            .collect();
        self.peers = members;

        info!(
            group = %self.group_id,
            index,
            added = ?added.iter().map(|peer| peer.id).collect::<Vec<_>>(),
            removed = ?removed,
            "membership changed"
        );
        actions.learned_peers.extend(added.iter().cloned());

        // A removed server only stops campaigning once it applies its own
        // removal, so it gets the new commit index before it is forgotten.
        for id in &removed {
            self.send_append_entries(*id, actions);
        }
        let latest = self.log.latest_index();
        if let Role::Leader(leader) = &mut self.role {
            for id in &removed {
                leader.remove_peer(*id);
            }
            for peer in &added {
                leader.add_peer(peer.id, latest);
            }
        }
        for peer in &added {
            self.send_append_entries(peer.id, actions);
        }

        if let Some(responder) = self.pending_membership.remove(&index) {
            let _ = responder.send(AddPeerResponse::Success);
        }
    }
}
