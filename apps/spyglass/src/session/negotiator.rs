//! The session state machine: attempt the peer transport, fall back to
//! polling, supervise whichever is active, and tear everything down
//! deterministically on stop.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::pipeline::{Frame, FramePipeline, FrameSource};
use crate::protocol::{FrameData, ServerEnvelope, decode_frame_image};
use crate::session::signaling::{SignalingChannel, SignalingSubscription};
use crate::session::{SessionConfig, SessionState};
use crate::transport::polling::PollingTransport;
use crate::transport::webrtc::PeerTransport;
use crate::transport::{ControlRouter, PeerEvent, TransportError};

/// How one pass through the peer transport ended.
enum PeerOutcome {
    /// Operator stopped the session.
    Stopped,
    /// The signaling channel closed underneath us.
    SignalingLost,
    /// Setup never completed; fall through to polling.
    Aborted(String),
    /// Was active, then the connection reported failed/disconnected.
    /// Demotion to polling is one-way: returning to the peer transport
    /// requires a fresh session.
    Degraded,
}

pub(crate) struct Negotiator {
    signaling: Arc<SignalingChannel>,
    config: SessionConfig,
    control: Arc<ControlRouter>,
    pipeline: Arc<FramePipeline>,
    state_tx: watch::Sender<SessionState>,
    stop_rx: watch::Receiver<bool>,
}

impl Negotiator {
    pub(crate) fn new(
        signaling: Arc<SignalingChannel>,
        config: SessionConfig,
        control: Arc<ControlRouter>,
        pipeline: Arc<FramePipeline>,
        state_tx: watch::Sender<SessionState>,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            signaling,
            config,
            control,
            pipeline,
            state_tx,
            stop_rx,
        }
    }

    pub(crate) async fn run(self) {
        let mut sub = self.signaling.subscribe(&self.config.device_id);
        self.set_state(SessionState::Connecting);

        if self.config.prefer_peer && !self.stopping() {
            match self.peer_session(&mut sub).await {
                PeerOutcome::Stopped | PeerOutcome::SignalingLost => {
                    self.control.clear();
                    self.set_state(SessionState::Closed);
                    return;
                }
                PeerOutcome::Aborted(reason) => {
                    tracing::info!(
                        target = "session",
                        device_id = %self.config.device_id,
                        reason,
                        "peer attempt aborted; falling back to polling"
                    );
                }
                PeerOutcome::Degraded => {
                    self.set_state(SessionState::Reconnecting);
                }
            }
        }

        self.polling_session(&mut sub).await;
        self.control.clear();
        self.set_state(SessionState::Closed);
    }

    fn stopping(&self) -> bool {
        *self.stop_rx.borrow()
    }

    fn set_state(&self, state: SessionState) {
        if *self.state_tx.borrow() != state {
            tracing::info!(
                target = "session",
                device_id = %self.config.device_id,
                state = state.as_str(),
                "session state changed"
            );
            let _ = self.state_tx.send(state);
        }
    }

    async fn peer_session(&self, sub: &mut SignalingSubscription) -> PeerOutcome {
        let mut stop = self.stop_rx.clone();

        // The signaling channel may still be connecting; retry on a fixed
        // interval up to the attempt budget before giving up on peer setup.
        let mut attempt = 0;
        while !self.signaling.is_open() {
            if self.signaling.is_closed() {
                return PeerOutcome::SignalingLost;
            }
            attempt += 1;
            if attempt > self.config.negotiation.offer_retry_limit {
                return PeerOutcome::Aborted("signaling channel never became ready".into());
            }
            tracing::debug!(
                target = "session",
                attempt,
                "signaling not ready; retrying peer setup"
            );
            tokio::select! {
                _ = tokio::time::sleep(self.config.negotiation.offer_retry_interval) => {}
                _ = wait_for_stop(&mut stop) => return PeerOutcome::Stopped,
            }
        }

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let peer = match PeerTransport::connect(
            self.signaling.clone(),
            &self.config.device_id,
            &self.config.peer,
            events_tx,
            self.pipeline.clone(),
        )
        .await
        {
            Ok(peer) => peer,
            Err(err) => return PeerOutcome::Aborted(err.to_string()),
        };

        // Offer is out; wait for the answer/candidates to produce an open
        // frame channel, bounded by the connect deadline.
        let deadline = tokio::time::sleep(self.config.negotiation.connect_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = wait_for_stop(&mut stop) => {
                    peer.close().await;
                    return PeerOutcome::Stopped;
                }
                _ = &mut deadline => {
                    peer.close().await;
                    return PeerOutcome::Aborted(TransportError::NegotiationTimeout.to_string());
                }
                event = events.recv() => match event {
                    Some(PeerEvent::Connected) => break,
                    Some(PeerEvent::Disconnected) | Some(PeerEvent::Failed) => {
                        peer.close().await;
                        return PeerOutcome::Aborted("peer connection failed during setup".into());
                    }
                    None => {
                        peer.close().await;
                        return PeerOutcome::Aborted("peer transport dropped".into());
                    }
                },
                message = sub.recv() => match message {
                    None => {
                        peer.close().await;
                        return PeerOutcome::SignalingLost;
                    }
                    Some(envelope) => self.route_envelope(&peer, envelope).await,
                },
            }
        }

        self.control.bind(peer.control_sink());
        self.set_state(SessionState::PeerActive);

        loop {
            tokio::select! {
                _ = wait_for_stop(&mut stop) => {
                    self.control.clear();
                    peer.close().await;
                    return PeerOutcome::Stopped;
                }
                event = events.recv() => match event {
                    Some(PeerEvent::Connected) => {}
                    Some(PeerEvent::Disconnected) | Some(PeerEvent::Failed) | None => {
                        tracing::warn!(
                            target = "session",
                            device_id = %self.config.device_id,
                            "peer transport degraded"
                        );
                        self.set_state(SessionState::Degraded);
                        self.control.clear();
                        self.pipeline.peer_gone();
                        peer.close().await;
                        return PeerOutcome::Degraded;
                    }
                },
                message = sub.recv() => match message {
                    None => {
                        self.control.clear();
                        self.pipeline.peer_gone();
                        peer.close().await;
                        return PeerOutcome::SignalingLost;
                    }
                    Some(envelope) => self.route_envelope(&peer, envelope).await,
                },
            }
        }
    }

    async fn polling_session(&self, sub: &mut SignalingSubscription) {
        if self.stopping() {
            return;
        }
        let mut stop = self.stop_rx.clone();

        // The websocket may still be connecting; give it the same budget
        // the peer path gets so the start request is not dropped.
        let mut open_rx = self.signaling.watch_open();
        if !*open_rx.borrow() {
            let budget = self.config.negotiation.offer_retry_interval
                * self.config.negotiation.offer_retry_limit;
            let became_open = tokio::time::timeout(budget, async {
                while !*open_rx.borrow() {
                    if open_rx.changed().await.is_err() {
                        return;
                    }
                }
            });
            tokio::select! {
                _ = became_open => {}
                _ = wait_for_stop(&mut stop) => return,
            }
        }
        if self.signaling.is_closed() {
            tracing::warn!(
                target = "session",
                device_id = %self.config.device_id,
                "signaling channel closed before polling could start"
            );
            return;
        }

        let polling = PollingTransport::start(
            self.signaling.clone(),
            self.config.device_id.clone(),
            self.config.quality,
            self.config.show_cursor,
            self.config.fps,
        );
        self.control.bind(polling.clone());
        self.set_state(SessionState::PollingActive);

        loop {
            tokio::select! {
                _ = wait_for_stop(&mut stop) => break,
                message = sub.recv() => match message {
                    None => {
                        tracing::warn!(
                            target = "session",
                            device_id = %self.config.device_id,
                            "signaling channel closed; ending session"
                        );
                        break;
                    }
                    Some(envelope) => self.route_polled(envelope),
                },
            }
        }

        self.control.clear();
        polling.stop();
    }

    async fn route_envelope(&self, peer: &Arc<PeerTransport>, envelope: ServerEnvelope) {
        match envelope {
            ServerEnvelope::WebrtcAnswer { data, .. } => {
                match peer.apply_answer(data.sdp).await {
                    Ok(()) => {
                        tracing::debug!(target = "session", "remote description set");
                    }
                    Err(err) => {
                        tracing::warn!(target = "session", error = %err, "failed to apply answer");
                    }
                }
            }
            ServerEnvelope::WebrtcIce { data, .. } => {
                if let Err(err) = peer.add_remote_candidate(data.candidate).await {
                    tracing::debug!(target = "session", error = %err, "failed to add remote candidate");
                }
            }
            ServerEnvelope::ScreenCapture { data, .. } => self.handle_polled_frame(data),
            ServerEnvelope::NetworkStatus { data, .. } => {
                self.pipeline.report_quality(data.quality);
            }
        }
    }

    fn route_polled(&self, envelope: ServerEnvelope) {
        match envelope {
            ServerEnvelope::ScreenCapture { data, .. } => self.handle_polled_frame(data),
            ServerEnvelope::NetworkStatus { data, .. } => {
                self.pipeline.report_quality(data.quality);
            }
            // Stray negotiation traffic after demotion is meaningless.
            ServerEnvelope::WebrtcAnswer { .. } | ServerEnvelope::WebrtcIce { .. } => {}
        }
    }

    fn handle_polled_frame(&self, data: FrameData) {
        if let Some(hint) = data.network_status {
            self.pipeline.report_quality(hint);
        }
        let Some(image) = data.image else { return };
        match decode_frame_image(&image) {
            Ok(image) => {
                self.pipeline.submit(Frame {
                    image,
                    width: data.width,
                    height: data.height,
                    source: FrameSource::Polling,
                });
            }
            Err(err) => {
                tracing::debug!(target = "session", error = %err, "discarding malformed polled frame");
            }
        }
    }
}

/// Resolves once the stop flag is raised. Checks the current value first
/// so a stop that landed before the call is never missed.
async fn wait_for_stop(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Session handle gone; it aborts this task on drop.
            std::future::pending::<()>().await;
        }
    }
}
