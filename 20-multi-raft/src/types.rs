//! Identifiers and log entry types shared by every layer.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Numeric identity of a server process.
pub type ServerId = u64;

/// Election epoch of a single group.
pub type Term = u64;

/// 1-based position in a group's log. Index 0 means "before the first entry".
pub type LogIndex = u64;

/// Opaque byte string naming one Raft group; the routing key of the registry.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(Vec<u8>);

impl GroupId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for GroupId {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes())
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_opaque(&self.0, f)
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId({self})")
    }
}

/// Client-chosen identifier of a transaction session.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Vec<u8>);

impl SessionId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_opaque(&self.0, f)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({self})")
    }
}

/// Printable identifiers render as text, anything else as hex.
fn fmt_opaque(bytes: &[u8], f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match std::str::from_utf8(bytes) {
        Ok(text) if text.chars().all(|c| !c.is_control()) => f.write_str(text),
        _ => {
            for byte in bytes {
                write!(f, "{byte:02x}")?;
            }
            Ok(())
        }
    }
}

/// A server as known to its peers.
///
/// `community` partitions which servers may share a group: two servers only
/// ever join the same group when their community strings are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: ServerId,
    pub addr: String,
    pub community: String,
}

impl PeerInfo {
    pub fn new(id: ServerId, addr: impl Into<String>, community: impl Into<String>) -> Self {
        Self {
            id,
            addr: addr.into(),
            community: community.into(),
        }
    }
}

/// One slot of a group's replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub term: Term,
    pub payload: EntryPayload,
}

impl Entry {
    pub fn new(term: Term, payload: EntryPayload) -> Self {
        Self { term, payload }
    }

    pub fn command(term: Term, data: Vec<u8>) -> Self {
        Self::new(term, EntryPayload::Command(data))
    }
}

/// What an entry carries.
///
/// Only `Command`, `Query` and `Transactional` entries reach the state
/// machine; the rest are bookkeeping interpreted by the consensus core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryPayload {
    Command(Vec<u8>),
    Query(Vec<u8>),
    TransactionBegin { session: SessionId },
    Transactional { session: SessionId, data: Vec<u8> },
    TransactionCommit { session: SessionId },
    /// Full membership of the group, leader included.
    Configuration { peers: Vec<PeerInfo> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_ids_display_as_text_or_hex() {
        assert_eq!(GroupId::from("orders").to_string(), "orders");
        assert_eq!(GroupId::new(vec![0x00u8, 0xff]).to_string(), "00ff");
        assert_eq!(format!("{:?}", SessionId::from("s1")), "SessionId(s1)");
    }
}
