use std::{net::SocketAddr, time::Duration};

use anyhow::Result;
use multi_raft::{
    client::{Client, ClientError},
    message::{
        ClientRequest, ClientResponse, ClientResponsePayload, CommandResponse, Preamble,
        read_message, write_message,
    },
    types::GroupId,
};
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::sleep,
};

#[derive(Debug)]
enum Seen {
    Preamble(Preamble),
    Request(ClientRequest),
}

/// A stand-in server that reports everything it reads and answers each
/// request with `answer`, or stays silent when there is none.
async fn fake_server(answer: Option<CommandResponse>) -> Result<(SocketAddr, mpsc::UnboundedReceiver<Seen>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve(stream, answer.clone(), seen_tx.clone()));
        }
    });
    Ok((addr, seen_rx))
}

async fn serve(stream: TcpStream, answer: Option<CommandResponse>, seen: mpsc::UnboundedSender<Seen>) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let Ok(Some(preamble)) = read_message::<_, Preamble>(&mut reader).await else {
        return;
    };
    let _ = seen.send(Seen::Preamble(preamble));

    while let Ok(Some(request)) = read_message::<_, ClientRequest>(&mut reader).await {
        let group_id = request.group_id.clone();
        let _ = seen.send(Seen::Request(request));
        if let Some(response) = &answer {
            let reply = ClientResponse {
                group_id,
                payload: ClientResponsePayload::Proposal {
                    response: response.clone(),
                },
            };
            if write_message(&mut writer, &reply).await.is_err() {
                return;
            }
        }
    }
}

async fn drain(seen: &mut mpsc::UnboundedReceiver<Seen>) -> Vec<Seen> {
    sleep(Duration::from_millis(100)).await;
    let mut all = Vec::new();
    while let Ok(item) = seen.try_recv() {
        all.push(item);
    }
    all
}

fn requests(seen: &[Seen]) -> usize {
    seen.iter().filter(|item| matches!(item, Seen::Request(_))).count()
}

#[tokio::test]
async fn unanswered_write_is_not_sent_twice() -> Result<()> {
    let (addr, mut seen) = fake_server(None).await?;
    let mut client = Client::new("writer", vec![addr.to_string()]).with_timeout(Duration::from_millis(200));

    let result = client.propose(&GroupId::from("g"), b"set x 1".to_vec()).await;
    assert!(matches!(result, Err(ClientError::Timeout)), "{result:?}");
    assert_eq!(requests(&drain(&mut seen).await), 1);
    Ok(())
}

#[tokio::test]
async fn unknown_leader_is_retried_up_to_the_attempt_limit() -> Result<()> {
    let (addr, mut seen) = fake_server(Some(CommandResponse::UnknownLeader)).await?;
    let mut client = Client::new("writer", vec![addr.to_string()])
        .with_credentials("secret")
        .with_retries(3, Duration::from_millis(10));

    let result = client.propose(&GroupId::from("g"), b"set x 1".to_vec()).await;
    assert!(matches!(result, Err(ClientError::NoLeader { attempts: 3 })), "{result:?}");

    let seen = drain(&mut seen).await;
    assert_eq!(requests(&seen), 3);
    for item in &seen {
        if let Seen::Preamble(preamble) = item {
            match preamble {
                Preamble::Client { id, credentials, .. } => {
                    assert_eq!((id.as_str(), credentials.as_str()), ("writer", "secret"));
                }
                other => panic!("unexpected preamble {other:?}"),
            }
        }
    }
    Ok(())
}

#[tokio::test]
async fn refused_connect_moves_on_to_the_next_server() -> Result<()> {
    let (addr, _seen) = fake_server(Some(CommandResponse::Success(b"ok".to_vec()))).await?;
    // Bound and dropped, so nothing listens there.
    let dead = TcpListener::bind("127.0.0.1:0").await?.local_addr()?;
    let mut client = Client::new("writer", vec![dead.to_string(), addr.to_string()])
        .with_retries(3, Duration::from_millis(10));

    let result = client.propose(&GroupId::from("g"), b"set x 1".to_vec()).await?;
    assert_eq!(result, b"ok".to_vec());
    assert_eq!(client.connected_to(), Some(addr.to_string().as_str()));
    Ok(())
}
