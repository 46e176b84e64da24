//! Wire schema and JSON-lines framing.
//!
//! Every connection opens with one [`Preamble`]. What follows depends on it:
//! peers stream [`PeerMessage`]s, clients alternate [`ClientRequest`] and
//! [`ClientResponse`], and a server-add connection receives one
//! [`AddPeerResponse`] before it is closed. No acknowledgment is ever sent
//! for the preamble itself.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::types::{Entry, GroupId, LogIndex, PeerInfo, ServerId, SessionId, Term};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Acknowledgment payload returned for a rolled back transaction.
pub const ROLLBACK_ACK: &[u8] = b"rolled back";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Preamble {
    /// Another server; `peers` is everything it currently knows about.
    Server {
        id: ServerId,
        addr: String,
        community: String,
        peers: Vec<PeerInfo>,
    },
    Client {
        id: String,
        credentials: String,
        data: Vec<u8>,
    },
    /// A new server asking to join `group_id`.
    ServerAdd {
        group_id: GroupId,
        id: ServerId,
        addr: String,
        community: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMessage {
    pub group_id: GroupId,
    pub payload: PeerPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerPayload {
    AppendEntriesRequest(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
    RequestVoteRequest(RequestVoteRequest),
    RequestVoteResponse(RequestVoteResponse),
    TransactionBegin { session: SessionId },
    TransactionCommit { session: SessionId },
    TransactionRollback { session: SessionId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<Entry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub outcome: AppendEntriesOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppendEntriesOutcome {
    /// Last index the follower now shares with the leader.
    Success(LogIndex),
    StaleTerm,
    /// Back-off hint: the follower's last index that may still match.
    InconsistentPrevEntry(LogIndex),
    InternalError(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub outcome: VoteOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteOutcome {
    Granted,
    StaleTerm,
    AlreadyVoted,
    InconsistentLog,
    InternalError(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub group_id: GroupId,
    pub payload: ClientPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientPayload {
    Ping,
    Proposal {
        session: Option<SessionId>,
        entry: Vec<u8>,
    },
    Query {
        query: Vec<u8>,
    },
    TransactionBegin {
        session: SessionId,
        anchor_index: LogIndex,
    },
    TransactionCommit {
        session: SessionId,
    },
    TransactionRollback {
        session: SessionId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientResponse {
    pub group_id: GroupId,
    pub payload: ClientResponsePayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientResponsePayload {
    Ping(PingResponse),
    Proposal { response: CommandResponse },
    Query { response: CommandResponse },
    Transaction { response: CommandResponse },
}

impl ClientResponsePayload {
    /// The command outcome carried by anything but a ping.
    pub fn into_command(self) -> Option<CommandResponse> {
        match self {
            ClientResponsePayload::Ping(_) => None,
            ClientResponsePayload::Proposal { response }
            | ClientResponsePayload::Query { response }
            | ClientResponsePayload::Transaction { response } => Some(response),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    pub term: Term,
    pub index: LogIndex,
    pub state: NodeState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Follower => write!(f, "follower"),
            NodeState::Candidate => write!(f, "candidate"),
            NodeState::Leader => write!(f, "leader"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandResponse {
    Success(Vec<u8>),
    UnknownLeader,
    /// Carries the address of the leader this server knows about.
    NotLeader(String),
    Failure(Vec<u8>),
}

impl CommandResponse {
    pub fn failure(text: impl fmt::Display) -> Self {
        CommandResponse::Failure(text.to_string().into_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddPeerResponse {
    Success,
    Failure(String),
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntryPayload;

    #[tokio::test]
    async fn append_entries_survives_framing() {
        let (mut writer, reader) = tokio::io::duplex(4096);
        let mut reader = tokio::io::BufReader::new(reader);
        let message = PeerMessage {
            group_id: GroupId::from("g"),
            payload: PeerPayload::AppendEntriesRequest(AppendEntriesRequest {
                term: 3,
                prev_log_index: 1,
                prev_log_term: 2,
                entries: vec![
                    Entry::command(3, b"x".to_vec()),
                    Entry::new(
                        3,
                        EntryPayload::TransactionCommit {
                            session: SessionId::from("s"),
                        },
                    ),
                ],
                leader_commit: 1,
            }),
        };

        write_message(&mut writer, &message)
            .await
            .expect("write message");
        let parsed = read_message::<_, PeerMessage>(&mut reader)
            .await
            .expect("read message")
            .expect("expected message");

        assert_eq!(message, parsed);
    }

    #[tokio::test]
    async fn garbage_line_is_invalid_data() {
        let (mut writer, reader) = tokio::io::duplex(256);
        let mut reader = tokio::io::BufReader::new(reader);
        writer.write_all(b"{\"type\":\"bogus\"}\n").await.unwrap();

        let err = read_message::<_, Preamble>(&mut reader)
            .await
            .expect_err("unknown preamble must not parse");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
