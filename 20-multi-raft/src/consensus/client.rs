use tracing::warn;

use super::{Actions, Consensus, Responder};
use crate::message::{CommandResponse, PingResponse};
use crate::types::{EntryPayload, LogIndex, SessionId};

/// A client request as seen by one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// Outside a session the entry is logged at once; inside one it is held
    /// until the session commits.
    Proposal {
        session: Option<SessionId>,
        data: Vec<u8>,
    },
    Query(Vec<u8>),
    TransactionBegin {
        session: SessionId,
        anchor_index: LogIndex,
        origin: String,
    },
    TransactionCommit {
        session: SessionId,
    },
    TransactionRollback {
        session: SessionId,
    },
}

impl Consensus {
    /// Liveness check; answered by any role.
    pub fn ping(&self) -> PingResponse {
        PingResponse {
            term: self.log.current_term(),
            index: self.commit_index,
            state: self.state(),
        }
    }

    /// Accepts a client command on the leader; every other role redirects.
    ///
    /// `responder` is answered exactly once: immediately for redirects,
    /// rejections and buffered session proposals, otherwise when the entry it
    /// waits for is applied or leadership is lost.
    pub fn client_command(&mut self, command: ClientCommand, responder: Responder, actions: &mut Actions) {
        if !self.is_leader() {
            let _ = responder.send(self.redirect());
            return;
        }

        match command {
            ClientCommand::Proposal {
                session: Some(session),
                data,
            } => self.buffer_proposal(session, data, responder),
            ClientCommand::Proposal { session: None, data } => {
                self.propose(EntryPayload::Command(data), responder, actions)
            }
            ClientCommand::Query(query) => self.propose(EntryPayload::Query(query), responder, actions),
            ClientCommand::TransactionBegin {
                session,
                anchor_index,
                origin,
            } => self.begin_transaction(session, anchor_index, origin, responder, actions),
            ClientCommand::TransactionCommit { session } => {
                self.commit_transaction(session, responder, actions)
            }
            ClientCommand::TransactionRollback { session } => {
                self.rollback_transaction(session, responder, actions)
            }
        }
    }

    fn propose(&mut self, payload: EntryPayload, responder: Responder, actions: &mut Actions) {
        match self.append_local(payload) {
            Ok(index) => {
                self.pending.insert(index, responder);
                self.replicate(actions);
            }
            Err(err) => {
                warn!(group = %self.group_id, error = %err, "failed to append proposal");
                let _ = responder.send(CommandResponse::failure(err));
            }
        }
    }
}
