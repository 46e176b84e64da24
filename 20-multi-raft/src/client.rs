//! Async client for talking to a group.
//!
//! [`Client`] keeps one connection open, follows `not_leader` redirects to
//! the server named in them and retries `unknown_leader` answers against the
//! other known servers after a short pause.

use std::time::Duration;

use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::message::{
    AddPeerResponse, ClientPayload, ClientRequest, ClientResponse, ClientResponsePayload,
    CommandResponse, PingResponse, Preamble, read_message, write_message,
};
use crate::types::{GroupId, LogIndex, PeerInfo, SessionId};

const DEFAULT_ATTEMPTS: usize = 10;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no server is configured")]
    NoServers,

    #[error("no leader found after {attempts} attempts")]
    NoLeader { attempts: usize },

    #[error("command failed: {}", String::from_utf8_lossy(.0))]
    Failure(Vec<u8>),

    #[error("unexpected response: {0}")]
    Unexpected(String),

    #[error("server closed the connection")]
    Closed,

    #[error("request timed out")]
    Timeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

struct Connection {
    addr: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

pub struct Client {
    id: String,
    credentials: String,
    servers: Vec<String>,
    next_server: usize,
    connection: Option<Connection>,
    attempts: usize,
    retry_delay: Duration,
    request_timeout: Duration,
}

impl Client {
    pub fn new(id: impl Into<String>, servers: Vec<String>) -> Self {
        Self {
            id: id.into(),
            credentials: String::new(),
            servers,
            next_server: 0,
            connection: None,
            attempts: DEFAULT_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            request_timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_credentials(mut self, credentials: impl Into<String>) -> Self {
        self.credentials = credentials.into();
        self
    }

    pub fn with_retries(mut self, attempts: usize, retry_delay: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }

    /// Bound on connecting and on waiting for each answer.
    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Address of the server currently connected to, if any.
    pub fn connected_to(&self) -> Option<&str> {
        self.connection.as_ref().map(|connection| connection.addr.as_str())
    }

    /// Pings whichever server the client is connected to; no redirects.
    pub async fn ping(&mut self, group_id: &GroupId) -> Result<PingResponse, ClientError> {
        match self.round_trip(group_id, ClientPayload::Ping).await?.payload {
            ClientResponsePayload::Ping(ping) => Ok(ping),
            other => Err(ClientError::Unexpected(format!("{other:?}"))),
        }
    }

    pub async fn propose(&mut self, group_id: &GroupId, entry: Vec<u8>) -> Result<Vec<u8>, ClientError> {
        self.command(group_id, ClientPayload::Proposal {
            session: None,
            entry,
        })
        .await
    }

    pub async fn query(&mut self, group_id: &GroupId, query: Vec<u8>) -> Result<Vec<u8>, ClientError> {
        self.command(group_id, ClientPayload::Query { query }).await
    }

    pub async fn begin_transaction(
        &mut self,
        group_id: &GroupId,
        session: &SessionId,
        anchor_index: LogIndex,
    ) -> Result<Vec<u8>, ClientError> {
        self.command(group_id, ClientPayload::TransactionBegin {
            session: session.clone(),
            anchor_index,
        })
        .await
    }

    /// Adds `entry` to an open session; it is applied only on commit.
    pub async fn propose_in(
        &mut self,
        group_id: &GroupId,
        session: &SessionId,
        entry: Vec<u8>,
    ) -> Result<Vec<u8>, ClientError> {
        self.command(group_id, ClientPayload::Proposal {
            session: Some(session.clone()),
            entry,
        })
        .await
    }

    pub async fn commit_transaction(
        &mut self,
        group_id: &GroupId,
        session: &SessionId,
    ) -> Result<Vec<u8>, ClientError> {
        self.command(group_id, ClientPayload::TransactionCommit {
            session: session.clone(),
        })
        .await
    }

    pub async fn rollback_transaction(
        &mut self,
        group_id: &GroupId,
        session: &SessionId,
    ) -> Result<Vec<u8>, ClientError> {
        self.command(group_id, ClientPayload::TransactionRollback {
            session: session.clone(),
        })
        .await
    }

    /// Sends `payload` until a leader answers it.
    ///
    /// Only requests that provably went unanswered by a leader are sent again:
    /// failed connects and `not_leader`/`unknown_leader` replies. Once a
    /// request is written, a lost or late answer is returned as an error
    /// because the command may already be in the log.
    async fn command(&mut self, group_id: &GroupId, payload: ClientPayload) -> Result<Vec<u8>, ClientError> {
        for attempt in 1..=self.attempts {
            match self.connection().await {
                Ok(_) => {}
                Err(ClientError::NoServers) => return Err(ClientError::NoServers),
                Err(err) => {
                    debug!(attempt, error = %err, "connect failed; trying next server");
                    sleep(self.retry_delay).await;
                    continue;
                }
            }
            let response = self.round_trip(group_id, payload.clone()).await?;

            match response.payload.into_command() {
                Some(CommandResponse::Success(data)) => return Ok(data),
                Some(CommandResponse::Failure(data)) => return Err(ClientError::Failure(data)),
                Some(CommandResponse::NotLeader(addr)) => {
                    debug!(attempt, leader = %addr, "redirected to leader");
                    self.connection = None;
                    self.prefer(addr);
                }
                Some(CommandResponse::UnknownLeader) => {
                    debug!(attempt, "no leader known yet");
                    self.connection = None;
                    sleep(self.retry_delay).await;
                }
                None => return Err(ClientError::Unexpected("ping answer to a command".into())),
            }
        }
        Err(ClientError::NoLeader {
            attempts: self.attempts,
        })
    }

    /// Makes `addr` the next server to connect to.
    fn prefer(&mut self, addr: String) {
        match self.servers.iter().position(|server| *server == addr) {
            Some(position) => self.next_server = position,
            None => {
                self.servers.push(addr);
                self.next_server = self.servers.len() - 1;
            }
        }
    }

    async fn round_trip(&mut self, group_id: &GroupId, payload: ClientPayload) -> Result<ClientResponse, ClientError> {
        let request_timeout = self.request_timeout;
        let connection = self.connection().await?;
        let request = ClientRequest {
            group_id: group_id.clone(),
            payload,
        };
        let exchange = async {
            write_message(&mut connection.writer, &request).await?;
            read_message::<_, ClientResponse>(&mut connection.reader)
                .await?
                .ok_or(ClientError::Closed)
        };
        let result = match timeout(request_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout),
        };
        if result.is_err() {
            self.connection = None;
        }
        result
    }

    async fn connection(&mut self) -> Result<&mut Connection, ClientError> {
        if self.servers.is_empty() {
            return Err(ClientError::NoServers);
        }
        if self.connection.is_none() {
            let addr = self.servers[self.next_server % self.servers.len()].clone();
            self.next_server = (self.next_server + 1) % self.servers.len();

            let stream = timeout(self.request_timeout, TcpStream::connect(&addr))
                .await
                .map_err(|_| ClientError::Timeout)??;
            let (reader, mut writer) = stream.into_split();
            let preamble = Preamble::Client {
                id: self.id.clone(),
                credentials: self.credentials.clone(),
                data: Vec::new(),
            };
            write_message(&mut writer, &preamble).await?;
            debug!(server = %addr, "connected");
            self.connection = Some(Connection {
                addr,
                reader: BufReader::new(reader),
                writer,
            });
        }
        self.connection.as_mut().ok_or(ClientError::Closed)
    }
}

/// Sends a server-add preamble to `addr` asking it to admit `peer` into
/// `group_id`, and waits for the single answer.
pub async fn request_add_server(
    addr: &str,
    group_id: &GroupId,
    peer: &PeerInfo,
) -> Result<AddPeerResponse, ClientError> {
    let stream = timeout(DEFAULT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| ClientError::Timeout)??;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let preamble = Preamble::ServerAdd {
        group_id: group_id.clone(),
        id: peer.id,
        addr: peer.addr.clone(),
        community: peer.community.clone(),
    };
    write_message(&mut writer, &preamble).await?;
    timeout(DEFAULT_TIMEOUT, read_message::<_, AddPeerResponse>(&mut reader))
        .await
        .map_err(|_| ClientError::Timeout)??
        .ok_or(ClientError::Closed)
}
