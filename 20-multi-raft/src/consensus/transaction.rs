//! Session-scoped transactions.
//!
//! Proposals made inside a session are held by the leader and reach the log
//! only on commit, as a run of `Transactional` entries closed by a
//! `TransactionCommit` marker. A rollback therefore never touches the log.
//! Sessions are tied to the term that opened them: once leadership moves on,
//! an open session can no longer commit and the client has to start over with
//! the new leader.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use super::{Actions, Consensus, Responder};
use crate::log::LogError;
use crate::message::{CommandResponse, PeerPayload, ROLLBACK_ACK};
use crate::types::{EntryPayload, LogIndex, ServerId, SessionId, Term};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Open,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub origin: String,
    /// Tail index the client believed current; advisory only.
    pub anchor_index: LogIndex,
    pub term: Term,
    pub status: SessionStatus,
    pub buffered: Vec<Vec<u8>>,
}

#[derive(Debug, Default)]
pub(super) struct SessionTable {
    sessions: BTreeMap<SessionId, Session>,
}

impl SessionTable {
    pub(super) fn get(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    fn get_mut(&mut self, id: &SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    fn insert(&mut self, session: Session) {
        self.sessions.insert(session.id.clone(), session);
    }

    /// Records what another server (or the log) says about a session.
    ///
    /// Unknown sessions are added; known ones only move forward out of `Open`.
    pub(super) fn observe(&mut self, id: &SessionId, status: SessionStatus, term: Term) {
        match self.sessions.get_mut(id) {
            Some(session) => {
                if session.status == SessionStatus::Open {
                    session.status = status;
                    if status != SessionStatus::Open {
                        session.buffered.clear();
                    }
                }
            }
            None => self.insert(Session {
                id: id.clone(),
                origin: String::new(),
                anchor_index: 0,
                term,
                status,
                buffered: Vec::new(),
            }),
        }
    }

    pub(super) fn open_ids(&self) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|session| session.status == SessionStatus::Open)
            .map(|session| session.id.clone())
            .collect()
    }
}

impl Consensus {
    pub fn session(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    /// Why `session` cannot be used by this leader right now, if it cannot.
    fn session_unusable(&self, id: &SessionId) -> Option<String> {
        let current = self.log.current_term();
        match self.sessions.get(id) {
            None => Some(format!("unknown session {id}")),
            Some(session) => match session.status {
                SessionStatus::Committed => Some(format!("session {id} already committed")),
                SessionStatus::RolledBack => Some(format!("session {id} already rolled back")),
                SessionStatus::Open if session.term != current => Some(format!(
                    "session {id} was opened in term {} and abandoned",
                    session.term
                )),
                SessionStatus::Open => None,
            },
        }
    }

    pub(super) fn begin_transaction(
        &mut self,
        id: SessionId,
        anchor_index: LogIndex,
        origin: String,
        responder: Responder,
        actions: &mut Actions,
    ) {
        let current = self.log.current_term();
        if let Some(existing) = self.sessions.get(&id) {
            let reason = match existing.status {
                SessionStatus::Open if existing.term == current => Some("is already open"),
                SessionStatus::Open => None,
                SessionStatus::Committed | SessionStatus::RolledBack => Some("has already finished"),
            };
            if let Some(reason) = reason {
                let _ = responder.send(CommandResponse::failure(format!("session {id} {reason}")));
                return;
            }
        }

        let latest = self.log.latest_index();
        if anchor_index != latest {
            debug!(group = %self.group_id, session = %id, anchor_index, latest, "transaction anchor is not the log tail");
        }

        let index = match self.append_local(EntryPayload::TransactionBegin {
            session: id.clone(),
        }) {
            Ok(index) => index,
            Err(err) => {
                warn!(group = %self.group_id, error = %err, "failed to log transaction start");
                let _ = responder.send(CommandResponse::failure(err));
                return;
            }
        };
        info!(group = %self.group_id, session = %id, %origin, index, "transaction opened");
        self.sessions.insert(Session {
            id: id.clone(),
            origin,
            anchor_index,
            term: current,
            status: SessionStatus::Open,
            buffered: Vec::new(),
        });
        self.pending.insert(index, responder);
        self.notify_peers(PeerPayload::TransactionBegin { session: id }, actions);
        self.replicate(actions);
    }

    /// Holds a proposal in its session until commit.
    pub(super) fn buffer_proposal(&mut self, id: SessionId, data: Vec<u8>, responder: Responder) {
        let response = match self.session_unusable(&id) {
            Some(reason) => CommandResponse::failure(reason),
            None => {
                if let Some(session) = self.sessions.get_mut(&id) {
                    session.buffered.push(data);
                }
                CommandResponse::Success(Vec::new())
            }
        };
        let _ = responder.send(response);
    }

    pub(super) fn commit_transaction(
        &mut self,
        id: SessionId,
        responder: Responder,
        actions: &mut Actions,
    ) {
        if let Some(reason) = self.session_unusable(&id) {
            let _ = responder.send(CommandResponse::failure(reason));
            return;
        }
        let buffered = match self.sessions.get_mut(&id) {
            Some(session) => std::mem::take(&mut session.buffered),
            None => Vec::new(),
        };

        let count = buffered.len();
        let marker = match self.append_unit(&id, buffered) {
            Ok(marker) => marker,
            Err(err) => {
                warn!(group = %self.group_id, session = %id, error = %err, "failed to log transaction");
                let _ = responder.send(CommandResponse::failure(err));
                return;
            }
        };

        info!(group = %self.group_id, session = %id, entries = count, marker, "transaction committing");
        if let Some(session) = self.sessions.get_mut(&id) {
            session.status = SessionStatus::Committed;
        }
        self.pending.insert(marker, responder);
        self.notify_peers(PeerPayload::TransactionCommit { session: id }, actions);
        self.replicate(actions);
    }

    /// Appends the buffered proposals and the closing marker; returns the marker's index.
    fn append_unit(&mut self, id: &SessionId, buffered: Vec<Vec<u8>>) -> Result<LogIndex, LogError> {
        for data in buffered {
            self.append_local(EntryPayload::Transactional {
                session: id.clone(),
                data,
            })?;
        }
        self.append_local(EntryPayload::TransactionCommit {
            session: id.clone(),
        })
    }

    pub(super) fn rollback_transaction(
        &mut self,
        id: SessionId,
        responder: Responder,
        actions: &mut Actions,
    ) {
        if let Some(reason) = self.session_unusable(&id) {
            let _ = responder.send(CommandResponse::failure(reason));
            return;
        }
        if let Some(session) = self.sessions.get_mut(&id) {
            info!(group = %self.group_id, session = %id, discarded = session.buffered.len(), "transaction rolled back");
            session.buffered.clear();
            session.status = SessionStatus::RolledBack;
        }
        let _ = responder.send(CommandResponse::Success(ROLLBACK_ACK.to_vec()));
        self.notify_peers(PeerPayload::TransactionRollback { session: id }, actions);
    }

    fn notify_peers(&self, payload: PeerPayload, actions: &mut Actions) {
        for &peer in self.peers.keys() {
            actions.send(peer, payload.clone());
        }
    }

    /// Mirrors a session transition announced by the leader.
    pub(super) fn observe_session(&mut self, from: ServerId, id: SessionId, status: SessionStatus) {
        if self.leader_id() != Some(from) {
            debug!(group = %self.group_id, peer = from, session = %id, "session notice from a non-leader");
        }
        let term = self.log.current_term();
        self.sessions.observe(&id, status, term);
        if let Some(session) = self.sessions.get_mut(&id) {
            if session.origin.is_empty() {
                session.origin = format!("server {from}");
            }
        }
    }
}
