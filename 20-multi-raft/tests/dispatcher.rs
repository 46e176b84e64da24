use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use multi_raft::{
    config::{ServerConfig, TimingConfig},
    message::{
        ClientPayload, ClientRequest, ClientResponse, ClientResponsePayload, CommandResponse,
        NodeState, PeerMessage, PeerPayload, PingResponse, Preamble, RequestVoteRequest,
        read_message, write_message,
    },
    registry::GroupRegistry,
    server::Server,
    state_machine::{NullStateMachine, StateMachine},
    transport::Transport,
    types::GroupId,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::oneshot,
    time::{sleep, timeout},
};

struct TestServer {
    addr: SocketAddr,
    registry: Arc<GroupRegistry>,
    _shutdown: oneshot::Sender<()>,
}

async fn start_server(community: &str, groups: &[&str]) -> Result<TestServer> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let mut config = ServerConfig::new(1, addr, community);
    config.groups = groups.iter().map(|name| GroupId::from(*name)).collect();
    config.timing = TimingConfig {
        election_timeout_min: Duration::from_millis(100),
        election_timeout_max: Duration::from_millis(200),
        heartbeat_interval: Duration::from_millis(30),
        rpc_timeout: Duration::from_millis(200),
    };
    config.validate()?;

    let transport = Transport::new(config.me(), config.timing.rpc_timeout);
    let registry = Arc::new(GroupRegistry::new(config, transport, |_: &GroupId| {
        Box::new(NullStateMachine) as Box<dyn StateMachine>
    }));
    registry.bootstrap().await;

    let server = Server::new(listener, Arc::clone(&registry));
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        let _ = server.run_until(shutdown).await;
    });

    Ok(TestServer {
        addr,
        registry,
        _shutdown: shutdown_tx,
    })
}

/// True when the server closed the connection.
async fn closed_by_server(stream: &mut TcpStream) -> Result<bool> {
    let mut buf = [0u8; 64];
    let read = timeout(Duration::from_secs(2), stream.read(&mut buf)).await?;
    Ok(matches!(read, Ok(0) | Err(_)))
}

async fn client_request(
    addr: SocketAddr,
    request: ClientRequest,
) -> Result<ClientResponse> {
    let stream = TcpStream::connect(addr).await?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    write_message(
        &mut writer,
        &Preamble::Client {
            id: "tester".into(),
            credentials: String::new(),
            data: Vec::new(),
        },
    )
    .await?;
    write_message(&mut writer, &request).await?;
    let response = timeout(
        Duration::from_secs(2),
        read_message::<_, ClientResponse>(&mut reader),
    )
    .await??
    .expect("server should answer");
    Ok(response)
}

#[tokio::test]
async fn garbage_preamble_closes_connection() -> Result<()> {
    let server = start_server("prod", &[]).await?;
    let mut stream = TcpStream::connect(server.addr).await?;
    stream.write_all(b"definitely not json\n").await?;

    assert!(closed_by_server(&mut stream).await?);
    Ok(())
}

#[tokio::test]
async fn foreign_community_peer_is_refused() -> Result<()> {
    let server = start_server("prod", &[]).await?;
    let mut stream = TcpStream::connect(server.addr).await?;
    write_message(
        &mut stream,
        &Preamble::Server {
            id: 7,
            addr: "127.0.0.1:1".into(),
            community: "dev".into(),
            peers: Vec::new(),
        },
    )
    .await?;

    assert!(closed_by_server(&mut stream).await?);
    assert!(server.registry.transport().known_peers().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn anonymous_client_is_refused() -> Result<()> {
    let server = start_server("prod", &[]).await?;
    let mut stream = TcpStream::connect(server.addr).await?;
    write_message(
        &mut stream,
        &Preamble::Client {
            id: String::new(),
            credentials: String::new(),
            data: Vec::new(),
        },
    )
    .await?;

    assert!(closed_by_server(&mut stream).await?);
    Ok(())
}

#[tokio::test]
async fn unknown_group_has_no_leader() -> Result<()> {
    let server = start_server("prod", &[]).await?;
    let group_id = GroupId::from("nowhere");

    let ping = client_request(
        server.addr,
        ClientRequest {
            group_id: group_id.clone(),
            payload: ClientPayload::Ping,
        },
    )
    .await?;
    assert_eq!(
        ping.payload,
        ClientResponsePayload::Ping(PingResponse {
            term: 0,
            index: 0,
            state: NodeState::Follower,
        })
    );

    let proposal = client_request(
        server.addr,
        ClientRequest {
            group_id: group_id.clone(),
            payload: ClientPayload::Proposal {
                session: None,
                entry: b"x".to_vec(),
            },
        },
    )
    .await?;
    assert_eq!(
        proposal.payload,
        ClientResponsePayload::Proposal {
            response: CommandResponse::UnknownLeader
        }
    );

    // Clients never create groups.
    assert!(server.registry.group_ids().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn solitary_group_serves_proposals() -> Result<()> {
    let server = start_server("prod", &["solo"]).await?;
    let group_id = GroupId::from("solo");

    let mut response = None;
    for _ in 0..50 {
        let answer = client_request(
            server.addr,
            ClientRequest {
                group_id: group_id.clone(),
                payload: ClientPayload::Proposal {
                    session: None,
                    entry: b"x".to_vec(),
                },
            },
        )
        .await?;
        match answer.payload.into_command() {
            Some(CommandResponse::UnknownLeader) => sleep(Duration::from_millis(50)).await,
            other => {
                response = other;
                break;
            }
        }
    }

    assert_eq!(response, Some(CommandResponse::Success(Vec::new())));
    Ok(())
}

#[tokio::test]
async fn peer_traffic_creates_group_lazily() -> Result<()> {
    let server = start_server("prod", &[]).await?;
    let mut stream = TcpStream::connect(server.addr).await?;
    write_message(
        &mut stream,
        &Preamble::Server {
            id: 9,
            addr: "127.0.0.1:1".into(),
            community: "prod".into(),
            peers: Vec::new(),
        },
    )
    .await?;
    write_message(
        &mut stream,
        &PeerMessage {
            group_id: GroupId::from("lazy"),
            payload: PeerPayload::RequestVoteRequest(RequestVoteRequest {
                term: 1,
                last_log_index: 0,
                last_log_term: 0,
            }),
        },
    )
    .await?;

    let mut created = false;
    for _ in 0..40 {
        if server.registry.group_ids().await == vec![GroupId::from("lazy")] {
            created = true;
            break;
        }
        sleep(Duration::from_millis(25)).await;
    }
    assert!(created, "group should be created by peer traffic");

    let handle = server
        .registry
        .get(&GroupId::from("lazy"))
        .await
        .expect("group exists");
    let status = handle.status().await?;
    assert!(status.term >= 1);
    assert!(status.members.iter().any(|member| member.id == 9));
    Ok(())
}
