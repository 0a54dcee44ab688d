use super::error::{Result, SocketError};
use super::{Transport, TransportEvent};
use crate::protocol::SignalingEvent;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, trace, warn};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::{Mutex, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

/// One user's live socket to the signaling server.
///
/// `connect` may be called again after a disconnect; the same event
/// channel keeps delivering across reconnects.
pub struct Connection {
    url: String,
    ws_sink: Mutex<Option<WsSink>>,
    events_tx: Sender<TransportEvent>,
    connected_tx: watch::Sender<bool>,
}

impl Connection {
    pub fn new(url: impl Into<String>) -> (Arc<Self>, Receiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::channel(100);
        let (connected_tx, _) = watch::channel(false);
        let connection = Arc::new(Self {
            url: url.into(),
            ws_sink: Mutex::new(None),
            events_tx,
            connected_tx,
        });
        (connection, events_rx)
    }

    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Err(SocketError::AlreadyOpen);
        }

        debug!(target: "Client/Socket", "Dialing {}", self.url);
        let (ws, _response) = connect_async(self.url.as_str()).await?;
        let (sink, stream) = ws.split();

        *self.ws_sink.lock().await = Some(sink);
        self.connected_tx.send_replace(true);
        let _ = self.events_tx.send(TransportEvent::Connected).await;

        tokio::spawn(Self::read_pump(
            stream,
            self.events_tx.clone(),
            self.connected_tx.clone(),
        ));

        Ok(())
    }

    async fn read_pump(
        mut stream: WsStream,
        events_tx: Sender<TransportEvent>,
        connected_tx: watch::Sender<bool>,
    ) {
        loop {
            match stream.next().await {
                Some(Ok(msg)) => {
                    if msg.is_text() {
                        let text = match msg.into_text() {
                            Ok(text) => text,
                            Err(e) => {
                                warn!(target: "Client/Socket", "Non-UTF8 text frame: {e}");
                                continue;
                            }
                        };
                        match serde_json::from_str::<SignalingEvent>(&text) {
                            Ok(event) => {
                                trace!(target: "Client/Socket", "<-- {}", event.body.kind());
                                if events_tx
                                    .send(TransportEvent::EventReceived(event))
                                    .await
                                    .is_err()
                                {
                                    warn!(target: "Client/Socket", "Event receiver dropped, closing read pump");
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(target: "Client/Socket", "Discarding malformed frame: {e}");
                            }
                        }
                    } else if msg.is_close() {
                        trace!(target: "Client/Socket", "Received close frame");
                        break;
                    }
                }
                Some(Err(e)) => {
                    error!(target: "Client/Socket", "Error reading from websocket: {e}");
                    break;
                }
                None => {
                    trace!(target: "Client/Socket", "Websocket stream ended");
                    break;
                }
            }
        }

        connected_tx.send_replace(false);
        let _ = events_tx.send(TransportEvent::Disconnected).await;
    }
}

#[async_trait]
impl Transport for Connection {
    async fn send(&self, event: &SignalingEvent) -> Result<()> {
        let json = serde_json::to_string(event)?;
        let mut sink_guard = self.ws_sink.lock().await;
        let sink = sink_guard.as_mut().ok_or(SocketError::Closed)?;
        trace!(target: "Client/Socket", "--> {} ({} bytes)", event.body.kind(), json.len());
        sink.send(Message::text(json)).await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        *self.connected_tx.borrow()
    }

    fn subscribe_connected(&self) -> watch::Receiver<bool> {
        self.connected_tx.subscribe()
    }

    async fn close(&self) {
        let mut sink_guard = self.ws_sink.lock().await;
        if let Some(mut sink) = sink_guard.take() {
            let _ = sink.close().await;
        }
        self.connected_tx.send_replace(false);
    }
}
