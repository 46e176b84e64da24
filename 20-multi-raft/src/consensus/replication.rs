use tracing::{debug, error, info, warn};

use super::role::Role;
use super::{Actions, Consensus};
use crate::log::LogError;
use crate::message::{
    AppendEntriesOutcome, AppendEntriesRequest, AppendEntriesResponse, PeerPayload,
};
use crate::types::{LogIndex, ServerId};

impl Consensus {
    /// Leader heartbeat: brings every follower closer to the leader's log.
    pub fn heartbeat_timeout(&mut self, actions: &mut Actions) {
        if self.is_leader() {
            self.broadcast_append_entries(actions);
        }
    }

    pub(super) fn broadcast_append_entries(&self, actions: &mut Actions) {
        for &peer in self.peers.keys() {
            self.send_append_entries(peer, actions);
        }
    }

    /// Sends the next batch the leader believes `peer` is missing.
    ///
    /// An empty batch is the heartbeat.
    pub(super) fn send_append_entries(&self, peer: ServerId, actions: &mut Actions) {
        let Role::Leader(leader) = &self.role else {
            return;
        };
        let Some(progress) = leader.progress(peer) else {
            return;
        };

        let prev_log_index = progress.next_index - 1;
        let Some(prev_log_term) = self.log.term_at(prev_log_index) else {
            error!(group = %self.group_id, peer, prev_log_index, "next index is past the log tail");
            return;
        };
        let until = (progress.next_index + self.max_batch as LogIndex).min(self.log.latest_index() + 1);
        let request = AppendEntriesRequest {
            term: self.log.current_term(),
            prev_log_index,
            prev_log_term,
            entries: self.log.entries(progress.next_index, until),
            leader_commit: self.commit_index,
        };
        actions.send(peer, PeerPayload::AppendEntriesRequest(request));
    }

    /// Pushes freshly appended entries out and commits what already has a majority.
    pub(super) fn replicate(&mut self, actions: &mut Actions) {
        self.broadcast_append_entries(actions);
        self.advance_commit_index(actions);
    }

    /// Highest index replicated on a majority whose entry is from the current term.
    ///
    /// Entries from earlier terms are only ever committed indirectly, together
    /// with a later current-term entry.
    pub(super) fn advance_commit_index(&mut self, actions: &mut Actions) {
        let Role::Leader(leader) = &self.role else {
            return;
        };
        let term = self.log.current_term();
        let latest = self.log.latest_index();
        let majority = self.majority();

        let mut commit = self.commit_index;
        for index in (self.commit_index + 1..=latest).rev() {
            if self.log.term_at(index) != Some(term) {
                break;
            }
            if leader.count_replicated(index, latest) >= majority {
                commit = index;
                break;
            }
        }

        if commit > self.commit_index {
            debug!(group = %self.group_id, commit, "commit index advanced");
            self.commit_index = commit;
            self.apply_committed(actions);
        }
    }

    pub(super) fn handle_append_entries(
        &mut self,
        from: ServerId,
        request: AppendEntriesRequest,
        actions: &mut Actions,
    ) {
        let outcome = self.accept_entries(from, &request, actions).unwrap_or_else(|err| {
            warn!(group = %self.group_id, leader = from, error = %err, "failed to accept entries");
            AppendEntriesOutcome::InternalError(err.to_string())
        });
        let response = AppendEntriesResponse {
            term: self.log.current_term(),
            outcome,
        };
        actions.send(from, PeerPayload::AppendEntriesResponse(response));
    }

    fn accept_entries(
        &mut self,
        from: ServerId,
        request: &AppendEntriesRequest,
        actions: &mut Actions,
    ) -> Result<AppendEntriesOutcome, LogError> {
        let current = self.log.current_term();
        if request.term < current {
            return Ok(AppendEntriesOutcome::StaleTerm);
        }
        if request.term == current && self.is_leader() {
            error!(group = %self.group_id, other = from, term = current, "two leaders in one term");
            return Ok(AppendEntriesOutcome::InternalError(format!(
                "server {} already leads term {current}",
                self.me.id
            )));
        }

        match self.role {
            Role::Follower { leader: Some(leader) } if leader == from && request.term == current => {
                actions.reset_election_timer = true;
            }
            _ => {
                if request.term == current {
                    info!(group = %self.group_id, leader = from, term = current, "following new leader");
                }
                self.become_follower(request.term, Some(from), actions)?;
            }
        }

        if self.log.term_at(request.prev_log_index) != Some(request.prev_log_term) {
            let hint = self
                .log
                .latest_index()
                .min(request.prev_log_index.saturating_sub(1));
            debug!(
                group = %self.group_id,
                prev_log_index = request.prev_log_index,
                hint,
                "previous entry does not match"
            );
            return Ok(AppendEntriesOutcome::InconsistentPrevEntry(hint));
        }

        let last = self
            .log
            .append_entries(request.prev_log_index, &request.entries, self.commit_index)?;

        let commit = request.leader_commit.min(last);
        if commit > self.commit_index {
            self.commit_index = commit;
            self.apply_committed(actions);
        }
        Ok(AppendEntriesOutcome::Success(last))
    }

    pub(super) fn handle_append_entries_response(
        &mut self,
        from: ServerId,
        response: AppendEntriesResponse,
        actions: &mut Actions,
    ) {
        let current = self.log.current_term();
        if response.term > current {
            info!(group = %self.group_id, term = response.term, peer = from, "newer term seen in append response");
            if let Err(err) = self.become_follower(response.term, None, actions) {
                warn!(group = %self.group_id, error = %err, "failed to adopt newer term");
            }
            return;
        }
        if response.term < current {
            return;
        }
        let Role::Leader(leader) = &mut self.role else {
            return;
        };

        match response.outcome {
            AppendEntriesOutcome::Success(index) => {
                leader.record_success(from, index);
                self.advance_commit_index(actions);
                if self.has_unsent(from) {
                    self.send_append_entries(from, actions);
                }
            }
            AppendEntriesOutcome::InconsistentPrevEntry(hint) => {
                if leader.back_off(from, hint) {
                    self.send_append_entries(from, actions);
                } else {
                    // Left to the next heartbeat.
                    debug!(group = %self.group_id, peer = from, hint, "rejection did not move next index");
                }
            }
            AppendEntriesOutcome::StaleTerm => {
                debug!(group = %self.group_id, peer = from, "stale term reply in current term");
            }
            AppendEntriesOutcome::InternalError(text) => {
                // Retried by the next heartbeat.
                warn!(group = %self.group_id, peer = from, error = %text, "follower failed to append");
            }
        }
    }

    fn has_unsent(&self, peer: ServerId) -> bool {
        match &self.role {
            Role::Leader(leader) => leader
                .progress(peer)
                .is_some_and(|progress| progress.next_index <= self.log.latest_index()),
            _ => false,
        }
    }
}
