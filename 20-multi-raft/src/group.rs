//! The task that owns one group.
//!
//! Each group runs as a single worker task holding its [`Consensus`]. Peer
//! messages, client commands and timer expirations are all serialized through
//! the worker's channel, so the consensus state has exactly one writer.
//! [`GroupHandle`] is the cheap, cloneable front door to that task.

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until};
use tracing::{debug, info};

use crate::config::TimingConfig;
use crate::consensus::{Actions, ClientCommand, Consensus, GroupStatus};
use crate::message::{AddPeerResponse, CommandResponse, NodeState, PeerMessage, PeerPayload, PingResponse};
use crate::transport::Transport;
use crate::types::{GroupId, PeerInfo, ServerId};

enum GroupEvent {
    Peer {
        from: ServerId,
        payload: PeerPayload,
    },
    Ping {
        respond_to: oneshot::Sender<PingResponse>,
    },
    Command {
        command: ClientCommand,
        respond_to: oneshot::Sender<CommandResponse>,
    },
    AddPeer {
        peer: PeerInfo,
        respond_to: oneshot::Sender<AddPeerResponse>,
    },
    RemovePeer {
        id: ServerId,
        respond_to: oneshot::Sender<AddPeerResponse>,
    },
    Status {
        respond_to: oneshot::Sender<GroupStatus>,
    },
    Campaign,
    Shutdown,
}

#[derive(Clone)]
pub struct GroupHandle {
    group_id: GroupId,
    events: mpsc::UnboundedSender<GroupEvent>,
}

impl GroupHandle {
    pub fn group_id(&self) -> &GroupId {
        &self.group_id
    }

    /// True once the worker has stopped.
    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    /// Hands a peer message to the worker without waiting for it.
    pub fn deliver(&self, from: ServerId, payload: PeerPayload) -> Result<()> {
        self.send(GroupEvent::Peer { from, payload })
    }

    pub async fn ping(&self) -> Result<PingResponse> {
        let (respond_to, rx) = oneshot::channel();
        self.send(GroupEvent::Ping { respond_to })?;
        rx.await.context("ping response channel closed")
    }

    /// Submits a client command and waits for its outcome.
    pub async fn command(&self, command: ClientCommand) -> Result<CommandResponse> {
        let (respond_to, rx) = oneshot::channel();
        self.send(GroupEvent::Command {
            command,
            respond_to,
        })?;
        rx.await.context("command response channel closed")
    }

    pub async fn propose(&self, data: Vec<u8>) -> Result<CommandResponse> {
        self.command(ClientCommand::Proposal {
            session: None,
            data,
        })
        .await
    }

    pub async fn add_peer(&self, peer: PeerInfo) -> Result<AddPeerResponse> {
        let (respond_to, rx) = oneshot::channel();
        self.send(GroupEvent::AddPeer { peer, respond_to })?;
        rx.await.context("add peer response channel closed")
    }

    pub async fn remove_peer(&self, id: ServerId) -> Result<AddPeerResponse> {
        let (respond_to, rx) = oneshot::channel();
        self.send(GroupEvent::RemovePeer { id, respond_to })?;
        rx.await.context("remove peer response channel closed")
    }

    pub async fn status(&self) -> Result<GroupStatus> {
        let (respond_to, rx) = oneshot::channel();
        self.send(GroupEvent::Status { respond_to })?;
        rx.await.context("status response channel closed")
    }

    /// Starts an election now instead of waiting for the timer.
    pub fn campaign(&self) -> Result<()> {
        self.send(GroupEvent::Campaign)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(GroupEvent::Shutdown)
    }

    fn send(&self, event: GroupEvent) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| anyhow::anyhow!("group {} has stopped", self.group_id))
    }
}

/// Starts the worker for `consensus` and returns its handle.
pub fn spawn_group(consensus: Consensus, timing: TimingConfig, transport: Transport) -> GroupHandle {
    let (events, rx) = mpsc::unbounded_channel();
    let handle = GroupHandle {
        group_id: consensus.group_id().clone(),
        events,
    };
    let worker = GroupWorker {
        election_deadline: Instant::now() + timing.random_election_timeout(),
        last_state: consensus.state(),
        consensus,
        timing,
        transport,
        events: rx,
    };
    tokio::spawn(worker.run());
    handle
}

struct GroupWorker {
    consensus: Consensus,
    timing: TimingConfig,
    transport: Transport,
    events: mpsc::UnboundedReceiver<GroupEvent>,
    election_deadline: Instant,
    last_state: NodeState,
}

impl GroupWorker {
    async fn run(mut self) {
        let group = self.consensus.group_id().clone();
        info!(%group, id = self.consensus.id(), "group started");

        let mut heartbeat = interval(self.timing.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let leading = self.consensus.is_leader();
            let mut actions = Actions::default();
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(GroupEvent::Shutdown) | None => break,
                    Some(event) => self.handle_event(event, &mut actions),
                },
                _ = sleep_until(self.election_deadline), if !leading => {
                    self.consensus.election_timeout(&mut actions);
                    actions.reset_election_timer = true;
                }
                _ = heartbeat.tick(), if leading => {
                    self.consensus.heartbeat_timeout(&mut actions);
                }
            }

            if !leading && self.consensus.is_leader() {
                heartbeat.reset();
            }
            self.log_role_change();
            self.flush(actions).await;
        }

        info!(%group, "group stopped");
    }

    fn handle_event(&mut self, event: GroupEvent, actions: &mut Actions) {
        match event {
            GroupEvent::Peer { from, payload } => self.consensus.step(from, payload, actions),
            GroupEvent::Ping { respond_to } => {
                let _ = respond_to.send(self.consensus.ping());
            }
            GroupEvent::Command {
                command,
                respond_to,
            } => self.consensus.client_command(command, respond_to, actions),
            GroupEvent::AddPeer { peer, respond_to } => {
                self.consensus.add_peer(peer, respond_to, actions)
            }
            GroupEvent::RemovePeer { id, respond_to } => {
                self.consensus.remove_peer(id, respond_to, actions)
            }
            GroupEvent::Status { respond_to } => {
                let _ = respond_to.send(self.consensus.status());
            }
            GroupEvent::Campaign => self.consensus.campaign(actions),
            GroupEvent::Shutdown => {}
        }
    }

    async fn flush(&mut self, actions: Actions) {
        for peer in actions.learned_peers {
            self.transport.learn(peer).await;
        }
        let group_id = self.consensus.group_id();
        for (to, payload) in actions.peer_messages {
            let message = PeerMessage {
                group_id: group_id.clone(),
                payload,
            };
            self.transport.send(to, message).await;
        }
        if actions.reset_election_timer {
            self.election_deadline = Instant::now() + self.timing.random_election_timeout();
        }
    }

    fn log_role_change(&mut self) {
        let state = self.consensus.state();
        if state != self.last_state {
            debug!(
                group = %self.consensus.group_id(),
                from = %self.last_state,
                to = %state,
                term = self.consensus.current_term(),
                "role changed"
            );
            self.last_state = state;
        }
    }
}
