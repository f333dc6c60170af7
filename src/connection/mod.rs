//! # Peer Connections
//!
//! A peer connection is one negotiated transport session with a browser client.
//! The session registry never looks inside it; it only needs to:
//!
//! - read its identifier (`pc_id`), which is also the session identifier
//! - renegotiate it when the client sends a new offer for the same `pc_id`
//! - disconnect it during teardown
//! - hear about it closing or failing (an explicit subscription, see [`PeerConnection::subscribe`])
//! - optionally ask for its current transport state during idle sweeps
//!
//! [`SignalingConnectionFactory`] builds the production implementation on top of
//! the `webrtc` crate's `RTCPeerConnection`.

pub mod signaling;
#[cfg(test)]
pub mod testing;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

pub use signaling::SignalingConnectionFactory;

/// Transport state as reported by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// Terminal states mean the client is gone even if no notification arrived.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransportState::Disconnected | TransportState::Failed | TransportState::Closed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportState::New => "new",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Disconnected => "disconnected",
            TransportState::Failed => "failed",
            TransportState::Closed => "closed",
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle notifications published by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Closed,
    Failed,
}

/// An SDP blob plus its type, as sent by the browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            kind: "offer".to_string(),
        }
    }
}

/// The answer returned to the client, tagged with the connection id it must send
/// back when renegotiating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpAnswer {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub pc_id: String,
}

/// Handshake failures. These only ever fail the one request that caused them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalingError {
    #[error("expected a session description of type 'offer', got '{0}'")]
    UnexpectedType(String),
    #[error("malformed SDP: {0}")]
    MalformedSdp(String),
    #[error("connection {0} is already closed")]
    ConnectionClosed(String),
    #[error("peer connection error: {0}")]
    Transport(String),
}

/// The connection handle contract the registry depends on.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Identifier assigned when the connection was created.
    fn pc_id(&self) -> &str;

    /// Apply a new offer from the client. `restart` requests an ICE restart.
    async fn renegotiate(
        &self,
        offer: SessionDescription,
        restart: bool,
    ) -> Result<(), SignalingError>;

    /// The current local answer, if one has been produced.
    fn answer(&self) -> Option<SdpAnswer>;

    /// Close the transport. Must be safe to call on an already closed connection.
    async fn disconnect(&self) -> anyhow::Result<()>;

    /// Current transport state, or `None` when the connection cannot tell.
    fn state(&self) -> Option<TransportState> {
        None
    }

    /// Subscribe to lifecycle notifications. Dropping the receiver unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent>;
}

/// Creates connections for new clients.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(
        &self,
        offer: SessionDescription,
    ) -> Result<Arc<dyn PeerConnection>, SignalingError>;
}
