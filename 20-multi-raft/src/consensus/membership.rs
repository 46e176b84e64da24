use tracing::{info, warn};

use super::{Actions, Consensus, MembershipResponder};
use crate::message::AddPeerResponse;
use crate::types::{EntryPayload, PeerInfo, ServerId};

impl Consensus {
    /// Asks the leader to admit `peer` into the group.
    ///
    /// The answer arrives once the configuration entry naming the new member
    /// is committed and applied.
    pub fn add_peer(&mut self, peer: PeerInfo, responder: MembershipResponder, actions: &mut Actions) {
        if let Err(reason) = self.check_membership_change() {
            let _ = responder.send(AddPeerResponse::Failure(reason));
            return;
        }
        if peer.community != self.me.community {
            let _ = responder.send(AddPeerResponse::Failure(format!(
                "community mismatch: group runs in '{}', server {} is in '{}'",
                self.me.community, peer.id, peer.community
            )));
            return;
        }
        if peer == self.me || self.peers.get(&peer.id) == Some(&peer) {
            let _ = responder.send(AddPeerResponse::Success);
            return;
        }
        if peer.id == self.me.id || self.peers.contains_key(&peer.id) {
            let _ = responder.send(AddPeerResponse::Failure(format!(
                "server id {} is already a member at another address",
                peer.id
            )));
            return;
        }

        info!(group = %self.group_id, peer = peer.id, addr = %peer.addr, "adding member");
        let mut members = self.members();
        members.push(peer);
        self.propose_configuration(members, responder, actions);
    }

    /// Asks the leader to drop server `id` from the group.
    pub fn remove_peer(&mut self, id: ServerId, responder: MembershipResponder, actions: &mut Actions) {
        if let Err(reason) = self.check_membership_change() {
            let _ = responder.send(AddPeerResponse::Failure(reason));
            return;
        }
        if id == self.me.id {
            let _ = responder.send(AddPeerResponse::Failure(
                "the leader cannot remove itself".to_string(),
            ));
            return;
        }
        if !self.peers.contains_key(&id) {
            let _ = responder.send(AddPeerResponse::Success);
            return;
        }

        info!(group = %self.group_id, peer = id, "removing member");
        let members = self.members().into_iter().filter(|peer| peer.id != id).collect();
        self.propose_configuration(members, responder, actions);
    }

    /// Only a leader changes membership, and only one change at a time.
    fn check_membership_change(&self) -> Result<(), String> {
        if !self.is_leader() {
            return Err(match self.leader_hint() {
                Some(leader) => format!("not the leader; try {}", leader.addr),
                None => "no known leader".to_string(),
            });
        }
        let uncommitted = self
            .log
            .entries(self.commit_index + 1, self.log.latest_index() + 1);
        if uncommitted
            .iter()
            .any(|entry| matches!(entry.payload, EntryPayload::Configuration { .. }))
        {
            return Err("another membership change is in progress".to_string());
        }
        Ok(())
    }

    fn propose_configuration(
        &mut self,
        members: Vec<PeerInfo>,
        responder: MembershipResponder,
        actions: &mut Actions,
    ) {
        match self.append_local(EntryPayload::Configuration { peers: members }) {
            Ok(index) => {
                self.pending_membership.insert(index, responder);
                self.replicate(actions);
            }
            Err(err) => {
                warn!(group = %self.group_id, error = %err, "failed to append configuration");
                let _ = responder.send(AddPeerResponse::Failure(err.to_string()));
            }
        }
    }
}
