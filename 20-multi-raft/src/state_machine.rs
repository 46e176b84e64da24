//! The application side of a group.
//!
//! Committed entries are handed to a [`StateMachine`] exactly once and in log
//! order. The consensus core never looks inside the bytes it applies.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateMachineError {
    #[error("malformed command: {0}")]
    Decode(#[from] bincode::Error),

    #[error("{0}")]
    Other(String),
}

/// Contract between a group and the application it replicates.
///
/// `apply` must be deterministic: every server applies the same commands in
/// the same order and has to reach the same state.
pub trait StateMachine: Send + 'static {
    fn apply(&mut self, command: &[u8]) -> Result<Vec<u8>, StateMachineError>;

    /// Read-only evaluation; never changes state.
    fn query(&self, query: &[u8]) -> Result<Vec<u8>, StateMachineError>;
}

/// Ignores everything and answers with empty results.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStateMachine;

impl StateMachine for NullStateMachine {
    fn apply(&mut self, _command: &[u8]) -> Result<Vec<u8>, StateMachineError> {
        Ok(Vec::new())
    }

    fn query(&self, _query: &[u8]) -> Result<Vec<u8>, StateMachineError> {
        Ok(Vec::new())
    }
}

/// Commands understood by [`KvStateMachine`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    Put { key: String, value: String },
    Delete { key: String },
    Get { key: String },
}

impl KvCommand {
    pub fn encode(&self) -> Result<Vec<u8>, StateMachineError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StateMachineError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Result of a [`KvCommand`]: the value held before (writes) or now (reads).
pub fn decode_kv_result(bytes: &[u8]) -> Result<Option<String>, StateMachineError> {
    Ok(bincode::deserialize(bytes)?)
}

/// String key-value map.
///
/// `BTreeMap` keeps iteration deterministic, which keeps `snapshot` output
/// identical across replicas.
#[derive(Debug, Default, Clone)]
pub struct KvStateMachine {
    data: BTreeMap<String, String>,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.data.get(key)
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.data.clone()
    }
}

impl StateMachine for KvStateMachine {
    fn apply(&mut self, command: &[u8]) -> Result<Vec<u8>, StateMachineError> {
        let previous = match KvCommand::decode(command)? {
            KvCommand::Put { key, value } => self.data.insert(key, value),
            KvCommand::Delete { key } => self.data.remove(&key),
            KvCommand::Get { key } => self.data.get(&key).cloned(),
        };
        Ok(bincode::serialize(&previous)?)
    }

    fn query(&self, query: &[u8]) -> Result<Vec<u8>, StateMachineError> {
        match KvCommand::decode(query)? {
            KvCommand::Get { key } => Ok(bincode::serialize(&self.data.get(&key))?),
            other => Err(StateMachineError::Other(format!(
                "{other:?} is not a read"
            ))),
        }
    }
}
