//! GroupId → group routing.
//!
//! The registry owns every group hosted by this server. Groups named in the
//! configuration are created at startup; any other group comes to life the
//! first time a peer sends a message for it, seeded with that peer as its
//! only known member. Clients never create groups.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::consensus::{ClientCommand, Consensus};
use crate::group::{GroupHandle, spawn_group};
use crate::log::MemLog;
use crate::message::{
    AddPeerResponse, ClientPayload, ClientRequest, ClientResponse, ClientResponsePayload,
    CommandResponse, NodeState, PeerMessage, PingResponse,
};
use crate::state_machine::StateMachine;
use crate::transport::Transport;
use crate::types::{GroupId, PeerInfo};

/// Builds the application state machine for a newly created group.
pub trait StateMachineFactory: Send + Sync + 'static {
    fn create(&self, group_id: &GroupId) -> Box<dyn StateMachine>;
}

impl<F> StateMachineFactory for F
where
    F: Fn(&GroupId) -> Box<dyn StateMachine> + Send + Sync + 'static,
{
    fn create(&self, group_id: &GroupId) -> Box<dyn StateMachine> {
        self(group_id)
    }
}

pub struct GroupRegistry {
    config: ServerConfig,
    transport: Transport,
    factory: Arc<dyn StateMachineFactory>,
    groups: Mutex<HashMap<GroupId, GroupHandle>>,
}

impl GroupRegistry {
    pub fn new(
        config: ServerConfig,
        transport: Transport,
        factory: impl StateMachineFactory,
    ) -> Self {
        Self {
            config,
            transport,
            factory: Arc::new(factory),
            groups: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Learns the configured peers and creates the configured groups.
    pub async fn bootstrap(&self) {
        for peer in &self.config.peers {
            self.transport.learn(peer.clone()).await;
        }
        for group_id in &self.config.groups {
            self.get_or_create(group_id, self.config.peers.clone()).await;
        }
    }

    pub async fn get(&self, group_id: &GroupId) -> Option<GroupHandle> {
        let groups = self.groups.lock().await;
        groups
            .get(group_id)
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    /// Returns the group, creating it with `peers` as its initial members.
    pub async fn get_or_create(&self, group_id: &GroupId, peers: Vec<PeerInfo>) -> GroupHandle {
        let mut groups = self.groups.lock().await;
        if let Some(handle) = groups.get(group_id).filter(|handle| !handle.is_closed()) {
            return handle.clone();
        }

        info!(group = %group_id, members = peers.len() + 1, "creating group");
        let consensus = Consensus::new(
            self.config.me(),
            group_id.clone(),
            peers,
            Box::new(MemLog::new()),
            self.factory.create(group_id),
            self.config.max_batch_entries,
        );
        let handle = spawn_group(consensus, self.config.timing.clone(), self.transport.clone());
        groups.insert(group_id.clone(), handle.clone());
        handle
    }

    pub async fn group_ids(&self) -> Vec<GroupId> {
        let groups = self.groups.lock().await;
        let mut ids: Vec<GroupId> = groups.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Delivers a message from peer `from`, creating the group on first contact.
    pub async fn route_peer(&self, from: &PeerInfo, message: PeerMessage) -> Result<()> {
        let handle = self.get_or_create(&message.group_id, vec![from.clone()]).await;
        handle.deliver(from.id, message.payload)
    }

    /// Answers one client request; unknown groups have no leader.
    pub async fn route_client(&self, origin: &str, request: ClientRequest) -> ClientResponse {
        let group_id = request.group_id;
        let Some(handle) = self.get(&group_id).await else {
            let payload = match request.payload {
                ClientPayload::Ping => ClientResponsePayload::Ping(PingResponse {
                    term: 0,
                    index: 0,
                    state: NodeState::Follower,
                }),
                other => wrap(&other, CommandResponse::UnknownLeader),
            };
            return ClientResponse { group_id, payload };
        };

        let command = match request.payload {
            ClientPayload::Ping => {
                let payload = match handle.ping().await {
                    Ok(ping) => ClientResponsePayload::Ping(ping),
                    Err(err) => {
                        warn!(group = %group_id, error = %err, "ping failed");
                        ClientResponsePayload::Ping(PingResponse {
                            term: 0,
                            index: 0,
                            state: NodeState::Follower,
                        })
                    }
                };
                return ClientResponse { group_id, payload };
            }
            ClientPayload::Proposal { ref session, ref entry } => ClientCommand::Proposal {
                session: session.clone(),
                data: entry.clone(),
            },
            ClientPayload::Query { ref query } => ClientCommand::Query(query.clone()),
            ClientPayload::TransactionBegin {
                ref session,
                anchor_index,
            } => ClientCommand::TransactionBegin {
                session: session.clone(),
                anchor_index,
                origin: origin.to_string(),
            },
            ClientPayload::TransactionCommit { ref session } => ClientCommand::TransactionCommit {
                session: session.clone(),
            },
            ClientPayload::TransactionRollback { ref session } => {
                ClientCommand::TransactionRollback {
                    session: session.clone(),
                }
            }
        };

        let response = handle.command(command).await.unwrap_or_else(|err| {
            warn!(group = %group_id, error = %err, "group unavailable");
            CommandResponse::failure(format!("group {group_id} unavailable"))
        });
        ClientResponse {
            group_id,
            payload: wrap(&request.payload, response),
        }
    }

    /// Asks the local member of `group_id` to admit `peer`.
    pub async fn add_server(&self, group_id: &GroupId, peer: PeerInfo) -> AddPeerResponse {
        let Some(handle) = self.get(group_id).await else {
            return AddPeerResponse::Failure(format!("unknown group {group_id}"));
        };
        handle.add_peer(peer).await.unwrap_or_else(|err| {
            warn!(group = %group_id, error = %err, "group unavailable");
            AddPeerResponse::Failure(format!("group {group_id} unavailable"))
        })
    }

    pub async fn shutdown(&self) {
        let mut groups = self.groups.lock().await;
        for (_, handle) in groups.drain() {
            let _ = handle.shutdown();
        }
        self.transport.shutdown().await;
    }
}

/// Tags a command outcome with the kind of request it answers.
fn wrap(request: &ClientPayload, response: CommandResponse) -> ClientResponsePayload {
    match request {
        ClientPayload::Query { .. } => ClientResponsePayload::Query { response },
        ClientPayload::TransactionBegin { .. }
        | ClientPayload::TransactionCommit { .. }
        | ClientPayload::TransactionRollback { .. } => ClientResponsePayload::Transaction { response },
        ClientPayload::Ping | ClientPayload::Proposal { .. } => {
            ClientResponsePayload::Proposal { response }
        }
    }
}
