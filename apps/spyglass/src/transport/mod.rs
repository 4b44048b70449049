use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::ControlCommand;

pub mod polling;
pub mod webrtc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("signaling channel closed")]
    ChannelClosed,
    #[error("peer negotiation timed out")]
    NegotiationTimeout,
    #[error("webrtc error: {0}")]
    WebRtc(#[from] ::webrtc::Error),
}

/// Which transport currently carries the session, as surfaced to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Peer,
    Polling,
    None,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Peer => "peer",
            TransportKind::Polling => "polling",
            TransportKind::None => "none",
        }
    }
}

/// Connection-state changes reported by the peer transport. These are the
/// sole trigger for demotion out of the peer-active state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    Connected,
    Disconnected,
    Failed,
}

/// An open control path to the remote agent.
#[async_trait]
pub trait ControlSink: Send + Sync {
    fn is_open(&self) -> bool;

    async fn send(&self, command: &ControlCommand) -> Result<(), TransportError>;
}

/// Routes control commands to whichever transport is active. Commands sent
/// while no path is open are dropped, never queued.
#[derive(Default)]
pub struct ControlRouter {
    sink: parking_lot::RwLock<Option<Arc<dyn ControlSink>>>,
}

impl ControlRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, sink: Arc<dyn ControlSink>) {
        *self.sink.write() = Some(sink);
    }

    pub fn clear(&self) {
        *self.sink.write() = None;
    }

    pub fn is_open(&self) -> bool {
        self.sink.read().as_ref().is_some_and(|sink| sink.is_open())
    }

    /// Best-effort delivery: a command with no open path is dropped and
    /// never surfaces an error to the caller.
    pub async fn send(&self, command: ControlCommand) {
        let sink = self.sink.read().clone();
        match sink {
            Some(sink) if sink.is_open() => {
                if let Err(err) = sink.send(&command).await {
                    tracing::debug!(target = "control", error = %err, "control command dropped");
                }
            }
            _ => {
                tracing::trace!(target = "control", "no control path open; dropping command");
            }
        }
    }
}
