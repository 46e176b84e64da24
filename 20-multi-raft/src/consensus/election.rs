use tracing::{debug, info, warn};

use super::role::{CandidateState, LeaderState, Role};
use super::{Actions, Consensus};
use crate::log::LogError;
use crate::message::{PeerPayload, RequestVoteRequest, RequestVoteResponse, VoteOutcome};
use crate::types::{ServerId, Term};

impl Consensus {
    /// The election timer expired without hearing from a leader.
    pub fn election_timeout(&mut self, actions: &mut Actions) {
        if self.is_leader() || !self.member {
            return;
        }
        if let Err(err) = self.start_election(actions) {
            warn!(group = %self.group_id, error = %err, "failed to start election");
            actions.reset_election_timer = true;
        }
    }

    /// Starts a candidacy right away, as if the election timer had fired.
    ///
    /// A leader steps down first, which hands the group to whoever wins the
    /// next election.
    pub fn campaign(&mut self, actions: &mut Actions) {
        if self.is_leader() {
            info!(group = %self.group_id, "campaign requested; leaving leadership");
            self.role = Role::Follower { leader: None };
            self.fail_pending_calls();
        }
        self.election_timeout(actions);
    }

    fn start_election(&mut self, actions: &mut Actions) -> Result<(), LogError> {
        let term = self.log.current_term() + 1;
        self.log.set_current_term(term)?;
        self.log.set_voted_for(Some(self.me.id))?;
        actions.reset_election_timer = true;

        if self.majority() <= 1 {
            info!(group = %self.group_id, term, "no other members; taking leadership");
            self.become_leader(actions);
            return Ok(());
        }

        info!(group = %self.group_id, term, "election timeout; starting candidacy");
        self.role = Role::Candidate(CandidateState::new(self.me.id));
        let request = RequestVoteRequest {
            term,
            last_log_index: self.log.latest_index(),
            last_log_term: self.log.latest_term(),
        };
        for &peer in self.peers.keys() {
            actions.send(peer, PeerPayload::RequestVoteRequest(request.clone()));
        }
        Ok(())
    }

    pub(super) fn become_leader(&mut self, actions: &mut Actions) {
        let term = self.log.current_term();
        info!(group = %self.group_id, term, "won election; leading");
        self.role = Role::Leader(LeaderState::new(
            self.log.latest_index(),
            self.peers.keys().copied(),
        ));
        self.broadcast_append_entries(actions);
        // A solitary leader commits on its own.
        self.advance_commit_index(actions);
    }

    /// Adopts `term` (when newer), follows `leader` and re-arms the election timer.
    pub(super) fn become_follower(
        &mut self,
        term: Term,
        leader: Option<ServerId>,
        actions: &mut Actions,
    ) -> Result<(), LogError> {
        self.step_down(term, leader, actions)?;
        actions.reset_election_timer = true;
        Ok(())
    }

    /// Like [`Consensus::become_follower`], but a running election timer keeps
    /// its deadline. Only a former leader, which has none, gets one armed.
    fn step_down(
        &mut self,
        term: Term,
        leader: Option<ServerId>,
        actions: &mut Actions,
    ) -> Result<(), LogError> {
        if term > self.log.current_term() {
            self.log.set_current_term(term)?;
        }

        let was_leader = self.is_leader();
        if !matches!(self.role, Role::Follower { .. }) {
            info!(group = %self.group_id, term, ?leader, "stepping down to follower");
        }
        self.role = Role::Follower { leader };
        if was_leader {
            self.fail_pending_calls();
            actions.reset_election_timer = true;
        }
        Ok(())
    }

    pub(super) fn handle_request_vote(
        &mut self,
        from: ServerId,
        request: RequestVoteRequest,
        actions: &mut Actions,
    ) {
        if !self.peers.contains_key(&from) {
            debug!(group = %self.group_id, candidate = from, term = request.term, "ignoring vote request from a non-member");
            return;
        }
        let outcome = self.decide_vote(from, &request, actions).unwrap_or_else(|err| {
            warn!(group = %self.group_id, error = %err, "failed to record vote");
            VoteOutcome::InternalError(err.to_string())
        });
        debug!(group = %self.group_id, candidate = from, term = request.term, ?outcome, "vote decided");
        let response = RequestVoteResponse {
            term: self.log.current_term(),
            outcome,
        };
        actions.send(from, PeerPayload::RequestVoteResponse(response));
    }

    fn decide_vote(
        &mut self,
        candidate: ServerId,
        request: &RequestVoteRequest,
        actions: &mut Actions,
    ) -> Result<VoteOutcome, LogError> {
        if request.term < self.log.current_term() {
            return Ok(VoteOutcome::StaleTerm);
        }
        if request.term > self.log.current_term() {
            // Only a granted vote postpones this server's own election.
            self.step_down(request.term, None, actions)?;
        }

        let last_term = self.log.latest_term();
        let up_to_date = request.last_log_term > last_term
            || (request.last_log_term == last_term
                && request.last_log_index >= self.log.latest_index());
        if !up_to_date {
            return Ok(VoteOutcome::InconsistentLog);
        }

        match self.log.voted_for() {
            Some(voted) if voted != candidate => Ok(VoteOutcome::AlreadyVoted),
            _ => {
                self.log.set_voted_for(Some(candidate))?;
                actions.reset_election_timer = true;
                Ok(VoteOutcome::Granted)
            }
        }
    }

    pub(super) fn handle_request_vote_response(
        &mut self,
        from: ServerId,
        response: RequestVoteResponse,
        actions: &mut Actions,
    ) {
        let current = self.log.current_term();
        if response.term > current {
            info!(group = %self.group_id, term = response.term, voter = from, "newer term seen in vote response");
            if let Err(err) = self.become_follower(response.term, None, actions) {
                warn!(group = %self.group_id, error = %err, "failed to adopt newer term");
            }
            return;
        }
        if response.term < current || !self.peers.contains_key(&from) {
            return;
        }

        let majority = self.majority();
        let Role::Candidate(candidate) = &mut self.role else {
            return;
        };
        match response.outcome {
            VoteOutcome::Granted => {
                candidate.record_vote(from);
                if candidate.votes() >= majority {
                    self.become_leader(actions);
                }
            }
            VoteOutcome::InternalError(text) => {
                warn!(group = %self.group_id, voter = from, error = %text, "voter failed");
            }
            outcome => {
                debug!(group = %self.group_id, voter = from, ?outcome, "vote refused");
            }
        }
    }
}
