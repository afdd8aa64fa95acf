//! Failover between a live and a backup broker
//!
//! Starts two local TCP listeners standing in for a live broker and its
//! backup, announces them through the topology handler, connects to the live
//! one, then kills it. The connection fails over to the backup and the
//! rebinder recreates the application's session there.
//!
//! Run with: cargo run -p halyard-client --example application_failover

use async_trait::async_trait;
use halyard_client::{
    ClientEvent, ClusterClient, FailoverConfig, ReconnectDelay, SessionRebinder, TcpConnection,
    TcpTransport, TransportConnection,
};
use halyard_topology::{ConnectionId, Connector, NodeUp, TopologyEvent, TopologyResponseHandler};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Resends the session greeting on the new broker
struct GreetingRebinder;

#[async_trait]
impl SessionRebinder<TcpConnection> for GreetingRebinder {
    async fn rebind(&self, connection: Arc<TcpConnection>) -> halyard_client::Result<()> {
        info!(remote = %connection.remote(), "Recreating session");
        connection.send(b"HELLO session-1\n").await
    }
}

/// Accept connections and drain them until `kill` fires
async fn broker(name: &'static str, listener: TcpListener, kill: oneshot::Receiver<()>) {
    // Dropping the set aborts every session task and closes its socket
    let mut sessions = JoinSet::new();
    let serve = async {
        loop {
            let Ok((mut socket, peer)) = listener.accept().await else {
                return;
            };
            info!(broker = name, %peer, "Client connected");
            sessions.spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    info!(broker = name, "Received {:?}", String::from_utf8_lossy(&buf[..n]));
                }
            });
        }
    };

    tokio::select! {
        _ = serve => {}
        _ = kill => warn!(broker = name, "Broker killed"),
    }
}

async fn bind() -> std::io::Result<(TcpListener, Connector)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    Ok((listener, Connector::new("127.0.0.1", port)))
}

#[tokio::main]
async fn main() -> halyard_client::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let (live_listener, live) = bind().await?;
    let (backup_listener, backup) = bind().await?;

    let (kill_live, live_killed) = oneshot::channel();
    let (_kill_backup, backup_killed) = oneshot::channel();
    let live_task = tokio::spawn(broker("live", live_listener, live_killed));
    tokio::spawn(broker("backup", backup_listener, backup_killed));

    let config = FailoverConfig::builder()
        .static_connector(live.clone())
        .max_reconnect_attempts(5)
        .reconnect_delay(ReconnectDelay::backoff(
            Duration::from_millis(100),
            2.0,
            Duration::from_secs(1),
        ))
        .connect_timeout(Duration::from_secs(2))
        .build();
    let client = ClusterClient::new(config, TcpTransport::new())?;

    // Topology as the live broker would announce it
    let handler = client.response_handler();
    handler.dispatch(
        ConnectionId::from_raw(0),
        TopologyEvent::NodeUp(
            NodeUp::new(1, "node-1", live.clone())
                .with_backup(backup.clone())
                .with_backup_group("group-a")
                .last(),
        ),
    );
    client.registry().wait_synchronized(Duration::from_secs(1)).await?;

    let connection = client.connect(GreetingRebinder).await?;
    let mut events = connection.subscribe();
    if let Some(transport) = connection.current() {
        transport.send(b"HELLO session-1\n").await?;
    }
    info!(state = ?connection.state(), "Connected to live broker");

    tokio::time::sleep(Duration::from_millis(200)).await;
    let _ = kill_live.send(());
    let _ = live_task.await;

    loop {
        match tokio::time::timeout(Duration::from_secs(10), events.recv()).await {
            Ok(Ok(ClientEvent::FailoverCompleted {
                target,
                attempts,
                elapsed,
                ..
            })) => {
                info!(%target, attempts, ?elapsed, "Failed over to backup");
                break;
            }
            Ok(Ok(ClientEvent::FailoverFailed { attempts, .. })) => {
                warn!(attempts, "Failover failed");
                break;
            }
            Ok(Ok(event)) => info!(?event, "Client event"),
            Ok(Err(e)) => {
                warn!("Event stream ended: {}", e);
                break;
            }
            Err(_) => {
                warn!("No failover within 10s");
                break;
            }
        }
    }

    info!(state = ?connection.state(), "Final state");
    tokio::time::sleep(Duration::from_millis(100)).await;
    connection.close().await;
    client.close();
    Ok(())
}
