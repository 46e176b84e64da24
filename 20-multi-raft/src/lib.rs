//! Multi-group Raft server.
//!
//! One process hosts any number of independent replicated logs ("groups"),
//! each running its own Raft instance. Peers and clients share one TCP port;
//! the first line of every connection says who is calling and everything
//! after it is routed to the group named in each message.
//!
//! # Architecture
//!
//! - Each group is a single-writer worker task that owns its consensus
//!   state, so no group needs locks and groups never block each other.
//! - The consensus core is synchronous and deterministic. It returns the
//!   messages it wants sent instead of sending them, which lets the unit tests
//!   run whole clusters in memory.
//! - Network I/O lives in the accept loop, one task per inbound connection
//!   and one link task per outbound peer.
//!
//! # Modules
//!
//! - [`types`]: identifiers, peers and log entries
//! - [`message`]: wire schema and JSON-lines framing
//! - [`log`]: per-group log storage
//! - [`state_machine`]: the application contract and a key-value demo
//! - [`consensus`]: Raft for one group
//! - [`group`]: the worker task and its handle
//! - [`registry`]: GroupId routing with lazy group creation
//! - [`transport`]: outbound peer links
//! - [`server`]: accept loop and preamble dispatch
//! - [`client`]: async client library
//! - [`config`] and [`cli`]: server settings and the command line

pub mod cli;
pub mod client;
pub mod config;
pub mod consensus;
pub mod group;
pub mod log;
pub mod message;
pub mod registry;
pub mod server;
pub mod state_machine;
pub mod transport;
pub mod types;
