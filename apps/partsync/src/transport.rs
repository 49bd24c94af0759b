/// WebSocket transport: connect, forward, reconnect.
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use sync_core::constants::{MAX_RECONNECT_ATTEMPTS, RECONNECT_DELAY_MS};
use sync_core::{LockKind, WireMessage};

/// What the engine sees of the connection.
#[derive(Debug)]
pub enum NetEvent {
    Connected,
    Disconnected,
    Incoming(WireMessage),
}

/// Derive the websocket endpoint from the relay base URL.
pub fn ws_url(server: &str, client_name: &str) -> String {
    let base = server.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    format!("{ws_base}/ws?clientName={}", client_name.replace(' ', "%20"))
}

/// Run the connection loop until the outbound channel closes or the retry
/// budget is spent. Every state change and inbound message lands on
/// `event_tx`.
pub fn spawn_transport(
    url: String,
    mut out_rx: UnboundedReceiver<WireMessage>,
    event_tx: UnboundedSender<NetEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut attempts = 0u32;
        loop {
            match connect_async(&url).await {
                Ok((stream, _)) => {
                    attempts = 0;
                    info!("connected to relay");
                    let _ = event_tx.send(NetEvent::Connected);

                    let (mut sink, mut source) = stream.split();
                    loop {
                        tokio::select! {
                            outbound = out_rx.recv() => {
                                let Some(msg) = outbound else { return };
                                let json = match serde_json::to_string(&msg) {
                                    Ok(json) => json,
                                    Err(err) => {
                                        warn!(%err, "failed to serialize outbound message");
                                        continue;
                                    }
                                };
                                if sink.send(Message::Text(json)).await.is_err() {
                                    break;
                                }
                            }
                            inbound = source.next() => {
                                match inbound {
                                    Some(Ok(Message::Text(text))) => {
                                        match WireMessage::decode(&text) {
                                            Ok(msg) => { let _ = event_tx.send(NetEvent::Incoming(msg)); }
                                            Err(err) => warn!(%err, "malformed message from relay ignored"),
                                        }
                                    }
                                    Some(Ok(Message::Ping(data))) => {
                                        let _ = sink.send(Message::Pong(data)).await;
                                    }
                                    Some(Ok(Message::Close(_))) | None => break,
                                    Some(Ok(_)) => {}
                                    Some(Err(err)) => {
                                        debug!(%err, "websocket read error");
                                        break;
                                    }
                                }
                            }
                        }
                    }
                    let _ = event_tx.send(NetEvent::Disconnected);
                    warn!("disconnected from relay");
                }
                Err(err) => {
                    debug!(%err, "connection attempt failed");
                }
            }

            attempts += 1;
            if attempts >= MAX_RECONNECT_ATTEMPTS {
                error!("giving up after {attempts} reconnect attempts");
                return;
            }
            tokio::time::sleep(Duration::from_millis(RECONNECT_DELAY_MS)).await;
        }
    })
}

/// One-shot lock/unlock used by the CLI subcommands.
pub async fn lock_command(
    server: &str,
    name: &str,
    file: &str,
    lock: bool,
) -> anyhow::Result<()> {
    let (stream, _) = connect_async(ws_url(server, name)).await?;
    let (mut sink, mut source) = stream.split();

    let msg = if lock {
        WireMessage::Lock {
            file: file.to_string(),
            lock_kind: LockKind::Editing,
        }
    } else {
        WireMessage::Unlock {
            file: file.to_string(),
        }
    };
    sink.send(Message::Text(serde_json::to_string(&msg)?)).await?;

    // The relay answers every lock change with a full snapshot.
    let wait = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(Ok(Message::Text(text))) = source.next().await {
            if let Ok(WireMessage::LockChanged { locks }) = serde_json::from_str(&text) {
                return Some(locks);
            }
        }
        None
    });

    match wait.await {
        Ok(Some(locks)) => {
            let held = locks.iter().find(|l| l.file == file);
            match (lock, held) {
                (true, Some(l)) if l.locked_by == name => {
                    println!("locked {file} as {name} ({})", l.lock_kind.as_str())
                }
                (true, Some(l)) => println!("lock denied: {file} held by {}", l.locked_by),
                (true, None) => println!("lock not visible for {file}"),
                (false, None) => println!("unlocked {file}"),
                (false, Some(l)) => println!("{file} still locked by {}", l.locked_by),
            }
        }
        _ => println!("no response from relay"),
    }
    Ok(())
}
