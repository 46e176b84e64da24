use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use multi_raft::{
    cli::{Cli, Command, TargetArgs},
    client::{Client, request_add_server},
    message::AddPeerResponse,
    registry::GroupRegistry,
    server::Server,
    state_machine::{KvCommand, KvStateMachine, StateMachine, decode_kv_result},
    transport::Transport,
    types::GroupId,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => {
            let config = args.into_config()?;
            let listener = TcpListener::bind(config.listen_addr)
                .await
                .with_context(|| format!("failed to bind {}", config.listen_addr))?;
            let transport = Transport::new(config.me(), config.timing.rpc_timeout);
            let registry = Arc::new(GroupRegistry::new(config, transport, |_: &GroupId| {
                Box::new(KvStateMachine::new()) as Box<dyn StateMachine>
            }));
            registry.bootstrap().await;

            let server = Server::new(listener, registry);
            info!("server listening on {}", server.local_addr()?);
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("server exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Ping(target) => {
            let mut client = client_for(&target);
            let ping = client.ping(&GroupId::from(target.group.as_str())).await?;
            println!("term={} index={} state={}", ping.term, ping.index, ping.state);
        }
        Command::Put { target, key, value } => {
            let command = KvCommand::Put { key, value };
            let previous = submit(&target, command, false).await?;
            println!("previous: {}", previous.as_deref().unwrap_or("<none>"));
        }
        Command::Get { target, key } => {
            let value = submit(&target, KvCommand::Get { key }, true).await?;
            println!("{}", value.as_deref().unwrap_or("<none>"));
        }
        Command::Delete { target, key } => {
            let previous = submit(&target, KvCommand::Delete { key }, false).await?;
            println!("removed: {}", previous.as_deref().unwrap_or("<none>"));
        }
        Command::Join(args) => {
            let group_id = GroupId::from(args.group.as_str());
            match request_add_server(&args.server, &group_id, &args.peer()).await? {
                AddPeerResponse::Success => println!("server {} joined {group_id}", args.id),
                AddPeerResponse::Failure(reason) => bail!("join refused: {reason}"),
            }
        }
    }

    Ok(())
}

fn client_for(target: &TargetArgs) -> Client {
    Client::new(target.client_id.clone(), target.server.clone())
        .with_credentials(target.credentials.clone())
        .with_retries(target.attempts, Duration::from_millis(target.retry_delay_ms))
}

async fn submit(target: &TargetArgs, command: KvCommand, read: bool) -> Result<Option<String>> {
    let mut client = client_for(target);
    let group_id = GroupId::from(target.group.as_str());
    let encoded = command.encode()?;
    let result = if read {
        client.query(&group_id, encoded).await?
    } else {
        client.propose(&group_id, encoded).await?
    };
    Ok(decode_kv_result(&result)?)
}
