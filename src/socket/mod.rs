//! Client-side transport connection: one WebSocket carrying JSON text
//! frames, with reconnect support and a trait seam for tests.

pub mod connection;
pub mod error;

pub use connection::Connection;
pub use error::{Result, SocketError};

use crate::protocol::SignalingEvent;
use async_trait::async_trait;
use tokio::sync::watch;

/// An event produced by the transport layer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The transport has successfully connected.
    Connected,
    /// A signaling event frame arrived from the server.
    EventReceived(SignalingEvent),
    /// The connection was lost.
    Disconnected,
}

/// Represents an active network connection to the signaling server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one signaling event as a text frame.
    async fn send(&self, event: &SignalingEvent) -> Result<()>;

    /// Current liveness of the underlying socket.
    fn is_connected(&self) -> bool;

    /// Watch channel observing liveness changes, for pause/resume loops.
    fn subscribe_connected(&self) -> watch::Receiver<bool>;

    /// Closes the connection.
    async fn close(&self);
}
