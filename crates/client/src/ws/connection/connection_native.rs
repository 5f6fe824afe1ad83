//! Native socket transport using tokio-tungstenite.

use devchat_shared::{ClientCommand, ConnectionName, ServerEvent, WsEnvelope};
use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::{EventSink, ReconnectConfig, SendError, SocketConnection, SocketEvent, WsHandle};

/// A managed connection to one of the devchat socket endpoints.
///
/// The background task owns dialing and reconnection; it reports every
/// lifecycle change and decoded server event to its [`EventSink`]. Dropping or
/// closing the connection stops the task.
pub struct WsConnection {
    pub name: ConnectionName,
    /// Channel for sending commands
    sender: UnboundedSender<WsEnvelope<ClientCommand>>,
    task: JoinHandle<()>,
}

impl WsConnection {
    /// Start a connection. `url_builder` is called before every attempt and
    /// returns `None` while no credentials are available.
    pub fn spawn(
        url_builder: impl Fn() -> Option<String> + Send + Sync + 'static,
        events: EventSink,
        reconnect_config: ReconnectConfig,
    ) -> Self {
        let (sender, receiver) = unbounded();
        let name = events.name();
        let task = tokio::spawn(run_connection_loop(
            Arc::new(url_builder),
            events,
            receiver,
            reconnect_config,
        ));

        Self { name, sender, task }
    }

    /// Get a handle for sending commands
    pub fn handle(&self) -> WsHandle {
        WsHandle::new(self.sender.clone(), self.name)
    }
}

impl SocketConnection for WsConnection {
    fn send(&self, cmd: ClientCommand) -> Result<(), SendError> {
        self.handle().send(cmd)
    }

    fn close(&self) {
        self.task.abort();
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_connection_loop(
    url_builder: Arc<dyn Fn() -> Option<String> + Send + Sync>,
    events: EventSink,
    mut receiver: UnboundedReceiver<WsEnvelope<ClientCommand>>,
    reconnect_config: ReconnectConfig,
) {
    let name = events.name();
    let mut attempt = 0u32;

    loop {
        let Some(url) = url_builder() else {
            // No URL available (not authenticated yet)
            tokio::time::sleep(tokio::time::Duration::from_millis(1000)).await;
            continue;
        };

        events.emit(SocketEvent::Connecting);

        match connect_async(url.as_str()).await {
            Ok((ws_stream, _response)) => {
                attempt = 0;
                tracing::info!(connection = %name, "socket connected");
                events.emit(SocketEvent::Connect);

                let (mut write, mut read) = ws_stream.split();

                let reason = loop {
                    tokio::select! {
                        incoming = read.next() => match incoming {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<WsEnvelope<ServerEvent>>(&text) {
                                    Ok(envelope) => {
                                        tracing::trace!(connection = %name, event = envelope.payload.name(), "socket event");
                                        events.emit(SocketEvent::Server(envelope.payload));
                                    }
                                    Err(e) => {
                                        tracing::warn!(connection = %name, error = %e, "ignoring undecodable frame");
                                    }
                                }
                            }
                            Some(Ok(Message::Close(frame))) => {
                                break frame
                                    .map(|f| f.reason.as_str().to_string())
                                    .filter(|r| !r.is_empty())
                                    .unwrap_or_else(|| "closed by server".to_string());
                            }
                            // Pong is handled automatically by tungstenite
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                events.emit(SocketEvent::Error { message: e.to_string() });
                                break "transport error".to_string();
                            }
                            None => break "stream ended".to_string(),
                        },
                        outgoing = receiver.next() => match outgoing {
                            Some(cmd) => match serde_json::to_string(&cmd) {
                                Ok(json) => {
                                    if let Err(e) = write.send(Message::Text(json.into())).await {
                                        events.emit(SocketEvent::Error { message: e.to_string() });
                                        break "send failed".to_string();
                                    }
                                }
                                Err(e) => {
                                    tracing::error!(connection = %name, error = %e, "failed to serialize command");
                                }
                            },
                            None => {
                                // Every handle is gone, nothing can use this connection anymore.
                                events.emit(SocketEvent::Disconnect { reason: "client closed".to_string() });
                                return;
                            }
                        },
                    }
                };

                tracing::info!(connection = %name, %reason, "socket disconnected");
                if !events.emit(SocketEvent::Disconnect { reason }) {
                    return;
                }
                let delay = reconnect_config.delay_for_attempt(0);
                tokio::time::sleep(tokio::time::Duration::from_millis(delay as u64)).await;
            }
            Err(e) => {
                tracing::warn!(connection = %name, error = %e, attempt, "socket connect failed");
                if !events.emit(SocketEvent::Error {
                    message: e.to_string(),
                }) {
                    return;
                }

                if reconnect_config.max_attempts > 0 && attempt >= reconnect_config.max_attempts {
                    events.emit(SocketEvent::Error {
                        message: format!(
                            "Max reconnect attempts ({}) exceeded",
                            reconnect_config.max_attempts
                        ),
                    });
                    return;
                }

                let delay = reconnect_config.delay_for_attempt(attempt);
                tracing::debug!(connection = %name, delay_ms = delay, attempt = attempt + 1, "reconnecting");
                tokio::time::sleep(tokio::time::Duration::from_millis(delay as u64)).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::{mpsc, oneshot};
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;

    use crate::ws::connection::TaggedEvent;

    fn sink(name: ConnectionName) -> (EventSink, mpsc::UnboundedReceiver<TaggedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSink::new(name, 1, tx), rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TaggedEvent>) -> SocketEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("socket event within 5s")
            .expect("event queue open")
            .event
    }

    fn no_quick_retry() -> ReconnectConfig {
        ReconnectConfig {
            initial_delay_ms: 60_000,
            ..ReconnectConfig::default()
        }
    }

    #[tokio::test]
    async fn relays_server_events_and_close_reason() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/channel", listener.local_addr().unwrap());
        let (command_tx, command_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();

            // wait for the client's subscribe before pushing anything
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                let _ = command_tx.send(text.as_str().to_string());
            }

            let event = WsEnvelope::new(ServerEvent::ChannelCreated {
                workspace_id: "W1".to_string(),
                channel_id: "c9".to_string(),
            });
            let frame = serde_json::to_string(&event).unwrap();
            ws.send(Message::Text(frame.into())).await.unwrap();
            ws.send(Message::Text("not json".into())).await.unwrap();
            ws.close(Some(CloseFrame {
                code: CloseCode::Away,
                reason: "server restart".into(),
            }))
            .await
            .unwrap();
        });

        let (events, mut rx) = sink(ConnectionName::Channel);
        let conn = WsConnection::spawn(move || Some(url.clone()), events, no_quick_retry());

        assert_eq!(next_event(&mut rx).await, SocketEvent::Connecting);
        assert_eq!(next_event(&mut rx).await, SocketEvent::Connect);

        conn.send(ClientCommand::Subscribe {
            scope: "W1".to_string(),
        })
        .unwrap();
        let command: serde_json::Value = serde_json::from_str(&command_rx.await.unwrap()).unwrap();
        assert_eq!(command["type"], "subscribe");
        assert_eq!(command["data"]["scope"], "W1");

        // the undecodable frame is skipped
        assert_eq!(
            next_event(&mut rx).await,
            SocketEvent::Server(ServerEvent::ChannelCreated {
                workspace_id: "W1".to_string(),
                channel_id: "c9".to_string(),
            })
        );
        assert_eq!(
            next_event(&mut rx).await,
            SocketEvent::Disconnect {
                reason: "server restart".to_string()
            }
        );

        conn.close();
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/friends", listener.local_addr().unwrap());
        drop(listener);

        let (events, mut rx) = sink(ConnectionName::Friends);
        let config = ReconnectConfig {
            max_attempts: 1,
            initial_delay_ms: 10,
            ..ReconnectConfig::default()
        };
        let _conn = WsConnection::spawn(move || Some(url.clone()), events, config);

        assert_eq!(next_event(&mut rx).await, SocketEvent::Connecting);
        assert!(matches!(next_event(&mut rx).await, SocketEvent::Error { .. }));
        assert_eq!(next_event(&mut rx).await, SocketEvent::Connecting);
        assert!(matches!(next_event(&mut rx).await, SocketEvent::Error { .. }));
        assert_eq!(
            next_event(&mut rx).await,
            SocketEvent::Error {
                message: "Max reconnect attempts (1) exceeded".to_string()
            }
        );

        // the loop has ended and dropped its sink
        let closed = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert!(closed.is_none());
    }
}
