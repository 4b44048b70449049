//! Peer-to-peer transport: one WebRTC connection carrying an outbound
//! `control` channel (created before the offer so the offer advertises it)
//! and an inbound `screen` channel announced by the agent.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::pipeline::{Frame, FramePipeline, FrameSource};
use crate::protocol::{
    ClientEnvelope, ControlCommand, IceCandidateBlob, ScreenRecord, SignalData, decode_frame_image,
};
use crate::session::signaling::SignalingChannel;
use crate::transport::{ControlSink, PeerEvent, TransportError};

pub mod config;

pub use config::PeerTransportConfig;

pub struct PeerTransport {
    peer_connection: Arc<RTCPeerConnection>,
    control: Arc<PeerControlChannel>,
    closed: AtomicBool,
}

impl PeerTransport {
    /// Create the peer connection, wire up channel and state callbacks,
    /// and ship the offer over the signaling channel. The caller feeds the
    /// remote answer and trickled candidates back in as they arrive.
    pub async fn connect(
        signaling: Arc<SignalingChannel>,
        device_id: &str,
        config: &PeerTransportConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
        pipeline: Arc<FramePipeline>,
    ) -> Result<Arc<Self>, TransportError> {
        let api = APIBuilder::new().build();
        let rtc_config = RTCConfiguration {
            ice_servers: config.rtc_ice_servers(),
            ..Default::default()
        };
        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await?);

        // A setup error past this point must not orphan the connection.
        match Self::negotiate(&peer_connection, signaling, device_id, config, events, pipeline)
            .await
        {
            Ok(control) => Ok(Arc::new(Self {
                peer_connection,
                control,
                closed: AtomicBool::new(false),
            })),
            Err(err) => {
                if let Err(close_err) = peer_connection.close().await {
                    tracing::debug!(
                        target = "webrtc",
                        error = %close_err,
                        "error closing peer connection after failed setup"
                    );
                }
                Err(err)
            }
        }
    }

    async fn negotiate(
        peer_connection: &Arc<RTCPeerConnection>,
        signaling: Arc<SignalingChannel>,
        device_id: &str,
        config: &PeerTransportConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
        pipeline: Arc<FramePipeline>,
    ) -> Result<Arc<PeerControlChannel>, TransportError> {
        // The control channel must exist before the offer is generated.
        let data_channel = peer_connection
            .create_data_channel(
                &config.control_channel_label,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await?;
        let control = Arc::new(PeerControlChannel::new(data_channel));
        PeerControlChannel::observe_state(&control);

        let events_for_state = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let events = events_for_state.clone();
                Box::pin(async move {
                    tracing::debug!(target = "webrtc", ?state, "peer connection state changed");
                    let event = match state {
                        RTCPeerConnectionState::Connected => Some(PeerEvent::Connected),
                        RTCPeerConnectionState::Disconnected => Some(PeerEvent::Disconnected),
                        RTCPeerConnectionState::Failed => Some(PeerEvent::Failed),
                        _ => None,
                    };
                    if let Some(event) = event {
                        let _ = events.send(event);
                    }
                })
            },
        ));

        let screen_label = config.screen_channel_label.clone();
        let events_for_screen = events.clone();
        let pipeline_for_screen = pipeline.clone();
        peer_connection.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let events = events_for_screen.clone();
            let pipeline = pipeline_for_screen.clone();
            let screen_label = screen_label.clone();
            Box::pin(async move {
                tracing::debug!(target = "webrtc", label = %channel.label(), "data channel announced");
                if channel.label() != screen_label {
                    return;
                }
                setup_screen_channel(channel, events, pipeline);
            })
        }));

        let signaling_for_ice = signaling.clone();
        let device_for_ice = device_id.to_string();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let signaling = signaling_for_ice.clone();
            let device_id = device_for_ice.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(err) => {
                        tracing::warn!(target = "webrtc", error = %err, "failed to serialize ice candidate");
                        return;
                    }
                };
                signaling.send(ClientEnvelope::WebrtcSignal {
                    device_id,
                    data: SignalData::IceCandidate {
                        candidate: IceCandidateBlob {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        },
                    },
                });
            })
        }));

        let offer = peer_connection.create_offer(None).await?;
        peer_connection.set_local_description(offer).await?;

        // Candidates also trickle out of band; the offer only waits for
        // gathering up to the configured bound.
        let mut gather = peer_connection.gathering_complete_promise().await;
        let _ = tokio::time::timeout(config.gather_timeout, gather.recv()).await;

        let local = peer_connection
            .local_description()
            .await
            .ok_or_else(|| TransportError::Setup("local description missing after offer".into()))?;
        tracing::debug!(
            target = "webrtc",
            device_id,
            sdp_len = local.sdp.len(),
            "sending offer"
        );
        signaling.send(ClientEnvelope::WebrtcSignal {
            device_id: device_id.to_string(),
            data: SignalData::Offer { sdp: local.sdp },
        });

        Ok(control)
    }

    pub async fn apply_answer(&self, sdp: String) -> Result<(), TransportError> {
        let answer = RTCSessionDescription::answer(sdp)?;
        self.peer_connection.set_remote_description(answer).await?;
        Ok(())
    }

    pub async fn add_remote_candidate(
        &self,
        blob: IceCandidateBlob,
    ) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: blob.candidate,
            sdp_mid: blob.sdp_mid,
            sdp_mline_index: blob.sdp_mline_index,
            username_fragment: None,
        };
        self.peer_connection.add_ice_candidate(init).await?;
        Ok(())
    }

    pub async fn has_remote_description(&self) -> bool {
        self.peer_connection.remote_description().await.is_some()
    }

    pub fn control_sink(&self) -> Arc<dyn ControlSink> {
        self.control.clone()
    }

    /// Close the underlying peer connection. Idempotent: returns true only
    /// for the call that actually performed the close.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Err(err) = self.peer_connection.close().await {
            tracing::debug!(target = "webrtc", error = %err, "error closing peer connection");
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Frame records arrive as text or binary; binary is decoded to text
/// before parsing. A malformed record is logged and swallowed; a single
/// corrupt frame must not end the session.
fn setup_screen_channel(
    channel: Arc<RTCDataChannel>,
    events: mpsc::UnboundedSender<PeerEvent>,
    pipeline: Arc<FramePipeline>,
) {
    let events_for_open = events.clone();
    channel.on_open(Box::new(move || {
        let events = events_for_open.clone();
        Box::pin(async move {
            tracing::debug!(target = "webrtc", "screen channel open");
            let _ = events.send(PeerEvent::Connected);
        })
    }));

    let events_for_close = events.clone();
    channel.on_close(Box::new(move || {
        let events = events_for_close.clone();
        Box::pin(async move {
            tracing::debug!(target = "webrtc", "screen channel closed");
            let _ = events.send(PeerEvent::Disconnected);
        })
    }));

    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            let text = match String::from_utf8(message.data.to_vec()) {
                Ok(text) => text,
                Err(err) => {
                    tracing::debug!(target = "webrtc", error = %err, "discarding non-utf8 frame payload");
                    return;
                }
            };
            let record = match serde_json::from_str::<ScreenRecord>(&text) {
                Ok(record) => record,
                Err(err) => {
                    tracing::debug!(target = "webrtc", error = %err, "discarding malformed frame record");
                    return;
                }
            };
            let ScreenRecord::Frame {
                image,
                width,
                height,
            } = record;
            let image = match decode_frame_image(&image) {
                Ok(image) => image,
                Err(err) => {
                    tracing::debug!(target = "webrtc", error = %err, "discarding undecodable frame image");
                    return;
                }
            };
            pipeline.submit(Frame {
                image,
                width,
                height,
                source: FrameSource::Peer,
            });
        })
    }));
}

/// The outbound `control` data channel. Commands are written only while
/// the channel reports open and dropped otherwise.
struct PeerControlChannel {
    channel: Arc<RTCDataChannel>,
    open: AtomicBool,
}

impl PeerControlChannel {
    fn new(channel: Arc<RTCDataChannel>) -> Self {
        Self {
            channel,
            open: AtomicBool::new(false),
        }
    }

    fn observe_state(this: &Arc<Self>) {
        let for_open = Arc::clone(this);
        this.channel.on_open(Box::new(move || {
            Box::pin(async move {
                tracing::debug!(target = "webrtc", "control channel open");
                for_open.open.store(true, Ordering::SeqCst);
            })
        }));
        let for_close = Arc::clone(this);
        this.channel.on_close(Box::new(move || {
            let this = for_close.clone();
            Box::pin(async move {
                tracing::debug!(target = "webrtc", "control channel closed");
                this.open.store(false, Ordering::SeqCst);
            })
        }));
    }
}

#[async_trait]
impl ControlSink for PeerControlChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
            && self.channel.ready_state() == RTCDataChannelState::Open
    }

    async fn send(&self, command: &ControlCommand) -> Result<(), TransportError> {
        let text = serde_json::to_string(command)
            .map_err(|err| TransportError::Setup(err.to_string()))?;
        self.channel.send_text(text).await?;
        Ok(())
    }
}
