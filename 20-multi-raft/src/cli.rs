use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};

use crate::config::{ServerConfig, TimingConfig};
use crate::types::{GroupId, PeerInfo, ServerId};

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-group Raft server and client", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a server hosting one or more groups.
    Server(ServerArgs),
    /// Ask a server for its term, commit index and role in a group.
    Ping(TargetArgs),
    /// Store a value in a group's key-value map.
    Put {
        #[command(flatten)]
        target: TargetArgs,
        key: String,
        value: String,
    },
    /// Read a value from a group's key-value map.
    Get {
        #[command(flatten)]
        target: TargetArgs,
        key: String,
    },
    /// Remove a key from a group's key-value map.
    Delete {
        #[command(flatten)]
        target: TargetArgs,
        key: String,
    },
    /// Ask a group's leader to admit a server.
    Join(JoinArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Numeric server id, unique among all servers.
    #[arg(long)]
    pub id: ServerId,

    /// Socket address to accept peers and clients on.
    #[arg(long, default_value = "127.0.0.1:7100")]
    pub listen: SocketAddr,

    /// Address announced to peers; defaults to --listen.
    #[arg(long)]
    pub advertise: Option<String>,

    /// Only servers of the same community share groups.
    #[arg(long, default_value = "default")]
    pub community: String,

    /// Peer map entries: id=addr,id=addr,... (self may be included)
    #[arg(long, value_delimiter = ',')]
    pub peer: Vec<String>,

    /// Groups to create at startup.
    #[arg(long, value_delimiter = ',')]
    pub group: Vec<String>,

    #[arg(long, default_value_t = 1000)]
    pub election_min_ms: u64,

    #[arg(long, default_value_t = 2000)]
    pub election_max_ms: u64,

    #[arg(long, default_value_t = 250)]
    pub heartbeat_ms: u64,

    #[arg(long, default_value_t = 500)]
    pub rpc_timeout_ms: u64,

    /// Most entries carried by one AppendEntries request.
    #[arg(long, default_value_t = 64)]
    pub max_batch: usize,
}

impl ServerArgs {
    pub fn into_config(self) -> Result<ServerConfig> {
        let mut config = ServerConfig::new(self.id, self.listen, self.community);
        if let Some(advertise) = self.advertise {
            config.advertise_addr = advertise;
        }
        config.peers = parse_peers(&self.peer, &config.community)?
            .into_iter()
            .filter(|peer| peer.id != self.id)
            .collect();
        config.groups = self.group.iter().map(|name| GroupId::from(name.as_str())).collect();
        config.timing = TimingConfig {
            election_timeout_min: Duration::from_millis(self.election_min_ms),
            election_timeout_max: Duration::from_millis(self.election_max_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_ms),
            rpc_timeout: Duration::from_millis(self.rpc_timeout_ms),
        };
        config.max_batch_entries = self.max_batch;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug, Clone)]
pub struct TargetArgs {
    /// Servers to try, comma-separated; redirects are followed.
    #[arg(long, value_delimiter = ',', default_value = "127.0.0.1:7100")]
    pub server: Vec<String>,

    #[arg(long)]
    pub group: String,

    /// Identifier sent in the client preamble.
    #[arg(long, default_value = "cli")]
    pub client_id: String,

    /// Opaque credentials sent in the client preamble.
    #[arg(long, default_value = "")]
    pub credentials: String,

    /// How many times a request is sent before giving up on finding a leader.
    #[arg(long, default_value_t = 10)]
    pub attempts: usize,

    #[arg(long, default_value_t = 200)]
    pub retry_delay_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct JoinArgs {
    /// A member of the group, ideally its leader.
    #[arg(long)]
    pub server: String,

    #[arg(long)]
    pub group: String,

    /// Id of the server that should join.
    #[arg(long)]
    pub id: ServerId,

    /// Address of the server that should join.
    #[arg(long)]
    pub addr: String,

    #[arg(long, default_value = "default")]
    pub community: String,
}

impl JoinArgs {
    pub fn peer(&self) -> PeerInfo {
        PeerInfo::new(self.id, self.addr.clone(), self.community.clone())
    }
}

/// Parses `id=addr` entries; every peer joins `community`.
pub fn parse_peers(entries: &[String], community: &str) -> Result<Vec<PeerInfo>> {
    let mut peers: Vec<PeerInfo> = Vec::new();
    for entry in entries {
        let Some((id, addr)) = entry.split_once('=') else {
            return Err(anyhow!("invalid peer entry '{entry}', expected id=addr"));
        };
        let id: ServerId = id
            .trim()
            .parse()
            .with_context(|| format!("invalid peer id in '{entry}'"))?;
        if peers.iter().any(|peer| peer.id == id) {
            return Err(anyhow!("peer id {id} is listed twice"));
        }
        peers.push(PeerInfo::new(id, addr.trim(), community));
    }
    Ok(peers)
}
