//! A remote desktop session for one device: owns the negotiator task and
//! exposes the operator-facing surface (state, frames, input).

pub mod negotiator;
pub mod signaling;

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::input::InputForwarder;
use crate::pipeline::FramePipeline;
use crate::protocol::NetworkQuality;
use crate::session::negotiator::Negotiator;
use crate::session::signaling::SignalingChannel;
use crate::transport::{ControlRouter, TransportKind};
use crate::transport::webrtc::PeerTransportConfig;

/// Where the session is in its lifecycle. `Degraded` and `Reconnecting`
/// are transient; the session only rests in `PeerActive`, `PollingActive`,
/// or `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    PeerActive,
    PollingActive,
    Degraded,
    Reconnecting,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::PeerActive => "peer_active",
            SessionState::PollingActive => "polling_active",
            SessionState::Degraded => "degraded",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Closed => "closed",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::PeerActive | SessionState::PollingActive)
    }

    pub fn transport(&self) -> TransportKind {
        match self {
            SessionState::PeerActive => TransportKind::Peer,
            SessionState::PollingActive => TransportKind::Polling,
            _ => TransportKind::None,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing knobs for transport negotiation.
#[derive(Debug, Clone)]
pub struct NegotiationConfig {
    /// Pause between peer setup attempts while signaling is not ready.
    pub offer_retry_interval: Duration,
    /// Attempt budget before giving up on the peer transport.
    pub offer_retry_limit: u32,
    /// Hard deadline for a peer connection to open after the offer.
    pub connect_timeout: Duration,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            offer_retry_interval: Duration::from_millis(500),
            offer_retry_limit: 10,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub device_id: String,
    /// JPEG quality hint for polled captures, 1-100.
    pub quality: u8,
    /// Polled capture rate.
    pub fps: u32,
    pub show_cursor: bool,
    /// When false, skip peer negotiation and go straight to polling.
    pub prefer_peer: bool,
    pub peer: PeerTransportConfig,
    pub negotiation: NegotiationConfig,
}

impl SessionConfig {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            quality: 60,
            fps: 30,
            show_cursor: true,
            prefer_peer: true,
            peer: PeerTransportConfig::default(),
            negotiation: NegotiationConfig::default(),
        }
    }
}

/// Point-in-time view of the session for status displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub connected: bool,
    pub transport: TransportKind,
    pub network_quality: NetworkQuality,
}

pub struct Session {
    device_id: String,
    pipeline: Arc<FramePipeline>,
    input: Arc<InputForwarder>,
    state_rx: watch::Receiver<SessionState>,
    stop_tx: watch::Sender<bool>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Spawns the negotiator and returns immediately; observe progress
    /// through [`Session::watch_state`].
    pub fn start(signaling: Arc<SignalingChannel>, config: SessionConfig) -> Self {
        let control = Arc::new(ControlRouter::new());
        let pipeline = Arc::new(FramePipeline::new());
        let input = Arc::new(InputForwarder::new(control.clone(), pipeline.clone()));
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (stop_tx, stop_rx) = watch::channel(false);
        let device_id = config.device_id.clone();

        let negotiator = Negotiator::new(
            signaling,
            config,
            control,
            pipeline.clone(),
            state_tx,
            stop_rx,
        );
        let task = tokio::spawn(negotiator.run());

        Self {
            device_id,
            pipeline,
            input,
            state_rx,
            stop_tx,
            task: StdMutex::new(Some(task)),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    pub fn status(&self) -> SessionStatus {
        let state = self.state();
        SessionStatus {
            state,
            connected: state.is_connected(),
            transport: state.transport(),
            network_quality: self.pipeline.quality(),
        }
    }

    /// Latest-wins frame store fed by whichever transport is active.
    pub fn pipeline(&self) -> Arc<FramePipeline> {
        self.pipeline.clone()
    }

    /// Input surface; events are dropped until control is enabled.
    pub fn input(&self) -> Arc<InputForwarder> {
        self.input.clone()
    }

    pub fn set_control_enabled(&self, enabled: bool) {
        self.input.set_enabled(enabled);
    }

    pub fn control_enabled(&self) -> bool {
        self.input.enabled()
    }

    /// Waits until the session reaches `target`, bounded by `timeout`.
    pub async fn wait_for(&self, target: SessionState, timeout: Duration) -> bool {
        let mut rx = self.watch_state();
        let reached = async {
            loop {
                if *rx.borrow() == target {
                    return;
                }
                if rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::time::timeout(timeout, reached).await.is_ok()
    }

    /// Signals the negotiator to tear down and waits for it to finish.
    /// Idempotent.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let task = self.task.lock().ok().and_then(|mut guard| guard.take());
        if let Some(mut task) = task {
            if tokio::time::timeout(Duration::from_secs(5), &mut task)
                .await
                .is_err()
            {
                tracing::warn!(target = "session", "negotiator did not stop in time; aborting");
                task.abort();
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
        if let Ok(mut guard) = self.task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}
