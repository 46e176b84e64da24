//! Accept loop and per-connection dispatch.
//!
//! The first message on every connection is a [`Preamble`] that decides how
//! the rest of the stream is treated. Anything that is not a valid preamble,
//! or a message that fails to parse afterwards, closes the connection.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tracing::{debug, info, warn};

use crate::message::{ClientRequest, PeerMessage, Preamble, read_message, write_message};
use crate::registry::GroupRegistry;
use crate::types::{GroupId, PeerInfo, ServerId};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection closed before its preamble")]
    MissingPreamble,

    #[error("malformed message: {0}")]
    Malformed(#[source] io::Error),

    #[error("client preamble without an id")]
    AnonymousClient,

    #[error("server {id} belongs to community '{theirs}', this server to '{ours}'")]
    CommunityMismatch {
        id: ServerId,
        theirs: String,
        ours: String,
    },
}

pub struct Server {
    listener: TcpListener,
    registry: Arc<GroupRegistry>,
}

impl Server {
    pub fn new(listener: TcpListener, registry: Arc<GroupRegistry>) -> Self {
        Self { listener, registry }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<GroupRegistry> {
        Arc::clone(&self.registry)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, registry } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    registry.shutdown().await;
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => spawn_connection_handler(stream, peer, &registry),
                    Err(err) => warn!(error = ?err, "failed to accept connection"),
                },
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn spawn_connection_handler(stream: TcpStream, peer: SocketAddr, registry: &Arc<GroupRegistry>) {
    let registry = Arc::clone(registry);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, registry).await {
            warn!(peer = %peer, error = %err, "connection closed with error");
        }
    });
}

async fn handle_connection(stream: TcpStream, registry: Arc<GroupRegistry>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let preamble = read_message::<_, Preamble>(&mut reader)
        .await
        .map_err(ProtocolError::Malformed)?
        .ok_or(ProtocolError::MissingPreamble)?;

    match preamble {
        Preamble::Server {
            id,
            addr,
            community,
            peers,
        } => {
            let from = PeerInfo::new(id, addr, community);
            serve_peer(&registry, from, peers, &mut reader).await
        }
        Preamble::Client { id, .. } => serve_client(&registry, &id, &mut reader, &mut writer).await,
        Preamble::ServerAdd {
            group_id,
            id,
            addr,
            community,
        } => {
            let peer = PeerInfo::new(id, addr, community);
            serve_server_add(&registry, &group_id, peer, &mut writer).await
        }
    }
}

async fn serve_peer<R>(
    registry: &GroupRegistry,
    from: PeerInfo,
    known: Vec<PeerInfo>,
    reader: &mut R,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let ours = &registry.config().community;
    if &from.community != ours {
        return Err(ProtocolError::CommunityMismatch {
            id: from.id,
            theirs: from.community,
            ours: ours.clone(),
        }
        .into());
    }

    debug!(peer = from.id, addr = %from.addr, "peer connected");
    let transport = registry.transport();
    transport.learn(from.clone()).await;
    for peer in known.into_iter().filter(|peer| &peer.community == ours) {
        transport.learn(peer).await;
    }

    while let Some(message) = read_message::<_, PeerMessage>(reader)
        .await
        .map_err(ProtocolError::Malformed)?
    {
        if let Err(err) = registry.route_peer(&from, message).await {
            warn!(peer = from.id, error = %err, "failed to route peer message");
        }
    }

    debug!(peer = from.id, "peer disconnected");
    Ok(())
}

async fn serve_client<R, W>(
    registry: &GroupRegistry,
    id: &str,
    reader: &mut R,
    writer: &mut W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if id.is_empty() {
        return Err(ProtocolError::AnonymousClient.into());
    }
    debug!(client = id, "client connected");

    while let Some(request) = read_message::<_, ClientRequest>(reader)
        .await
        .map_err(ProtocolError::Malformed)?
    {
        let response = registry.route_client(id, request).await;
        write_message(writer, &response).await?;
    }

    debug!(client = id, "client disconnected");
    Ok(())
}

async fn serve_server_add<W>(
    registry: &GroupRegistry,
    group_id: &GroupId,
    peer: PeerInfo,
    writer: &mut W,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    info!(group = %group_id, peer = peer.id, addr = %peer.addr, "server asks to join");
    let response = registry.add_server(group_id, peer).await;
    write_message(writer, &response).await?;
    Ok(())
}
