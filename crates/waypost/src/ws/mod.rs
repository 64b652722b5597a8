//! The message bus: connection registries, dispatch, fan-out, and the
//! background activities that keep sessions honest.

pub mod client;
pub mod hub;
pub mod reaper;
pub mod runtime;

pub use hub::{CreateSessionError, Hub, HubConfig, Outbound, WsSender};

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Keepalive ping cadence.
pub(crate) const PING_INTERVAL: Duration = Duration::from_secs(30);

/// A peer that produces no frame (pongs included) for this long is dead.
pub(crate) const PONG_WAIT: Duration = Duration::from_secs(60);

/// One writer task per connection: it alone owns the sink, so frames and
/// keepalive pings can never interleave on the wire.
pub(crate) fn spawn_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it.
        ping.tick().await;

        loop {
            tokio::select! {
                outbound = rx.recv() => {
                    match outbound {
                        Some(Outbound::Frame(envelope)) => {
                            let text = match serde_json::to_string(&envelope) {
                                Ok(text) => text,
                                Err(e) => {
                                    debug!(error = %e, "failed to serialize frame");
                                    continue;
                                }
                            };
                            if sink.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        Some(Outbound::Close(frame)) => {
                            let _ = sink.send(Message::Close(frame)).await;
                            break;
                        }
                        None => break,
                    }
                }
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Read the next frame, enforcing the pong deadline. Any frame (text,
/// binary, pong) counts as liveness; `None` means the connection is done.
pub(crate) async fn read_frame(stream: &mut SplitStream<WebSocket>) -> Option<Message> {
    loop {
        match tokio::time::timeout(PONG_WAIT, stream.next()).await {
            Err(_) => {
                debug!("peer missed the pong deadline");
                return None;
            }
            Ok(None) => return None,
            Ok(Some(Err(e))) => {
                debug!(error = %e, "websocket read error");
                return None;
            }
            Ok(Some(Ok(Message::Pong(_)))) | Ok(Some(Ok(Message::Ping(_)))) => {
                // Liveness only. Protocol-level pong replies are handled by
                // the websocket layer itself.
                continue;
            }
            Ok(Some(Ok(Message::Close(_)))) => return None,
            Ok(Some(Ok(message))) => return Some(message),
        }
    }
}
