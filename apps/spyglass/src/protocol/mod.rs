//! Wire types shared with the coordination server and the remote agent.
//!
//! Everything on the wire is a JSON envelope `{type, device_id, data}`.
//! The envelope is modelled as two internally tagged enums: one for
//! messages we send ([`ClientEnvelope`]) and one for messages the server
//! relays to us ([`ServerEnvelope`]). Consumers never hand-filter by
//! `device_id`; the signaling channel dispatches on it.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Messages sent to the coordination server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    /// WebRTC negotiation payload relayed to the agent.
    WebrtcSignal { device_id: String, data: SignalData },
    /// Polling-mode capture request.
    ScreenCapture {
        device_id: String,
        data: CaptureRequest,
    },
    /// Pointer input relayed to the agent when no peer channel is open.
    MouseControl {
        device_id: String,
        data: ControlCommand,
    },
    /// Keyboard input relayed to the agent when no peer channel is open.
    KeyboardControl {
        device_id: String,
        data: ControlCommand,
    },
}

impl ClientEnvelope {
    pub fn device_id(&self) -> &str {
        match self {
            ClientEnvelope::WebrtcSignal { device_id, .. }
            | ClientEnvelope::ScreenCapture { device_id, .. }
            | ClientEnvelope::MouseControl { device_id, .. }
            | ClientEnvelope::KeyboardControl { device_id, .. } => device_id,
        }
    }
}

/// Messages the server relays to us. Unknown types fail to parse and are
/// skipped by the reader; the agent emits both `webrtc_answer` and the
/// older `webrtc_offer_response` spelling for the same payload, likewise
/// `screen_capture`/`screen_frame`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    #[serde(alias = "webrtc_offer_response")]
    WebrtcAnswer { device_id: String, data: AnswerData },
    WebrtcIce { device_id: String, data: IceData },
    #[serde(alias = "screen_frame")]
    ScreenCapture { device_id: String, data: FrameData },
    NetworkStatus {
        device_id: String,
        data: QualityReport,
    },
}

impl ServerEnvelope {
    pub fn device_id(&self) -> &str {
        match self {
            ServerEnvelope::WebrtcAnswer { device_id, .. }
            | ServerEnvelope::WebrtcIce { device_id, .. }
            | ServerEnvelope::ScreenCapture { device_id, .. }
            | ServerEnvelope::NetworkStatus { device_id, .. } => device_id,
        }
    }
}

/// Inner payload of a `webrtc_signal` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalData {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: IceCandidateBlob },
}

/// An ICE candidate in the browser's JSON shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceCandidateBlob {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerData {
    pub sdp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceData {
    pub candidate: IceCandidateBlob,
}

/// Polling capture request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureRequest {
    pub action: CaptureAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub show_cursor: Option<bool>,
}

impl CaptureRequest {
    pub fn start(quality: u8, show_cursor: bool) -> Self {
        Self {
            action: CaptureAction::Start,
            quality: Some(quality),
            show_cursor: Some(show_cursor),
        }
    }

    pub fn capture(quality: u8, show_cursor: bool) -> Self {
        Self {
            action: CaptureAction::Capture,
            quality: Some(quality),
            show_cursor: Some(show_cursor),
        }
    }

    pub fn stop() -> Self {
        Self {
            action: CaptureAction::Stop,
            quality: None,
            show_cursor: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureAction {
    Start,
    Capture,
    Stop,
}

/// Polling frame response body. `action` mirrors the request and is
/// ignored; a response without an image (e.g. the start acknowledgment)
/// carries no frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_status: Option<NetworkQuality>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    pub quality: NetworkQuality,
}

/// One record on the peer screen channel: `{type: "frame", image, width?, height?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ScreenRecord {
    Frame {
        image: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        width: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        height: Option<u32>,
    },
}

/// A single forwarded input event. Coordinates are always in the remote
/// screen's pixel space; `screenWidth`/`screenHeight` let the agent
/// cross-check the scaling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlCommand {
    Mouse {
        action: MouseAction,
        x: i64,
        y: i64,
        #[serde(rename = "screenWidth")]
        screen_width: u32,
        #[serde(rename = "screenHeight")]
        screen_height: u32,
        #[serde(rename = "deltaY", default, skip_serializing_if = "Option::is_none")]
        delta_y: Option<i32>,
    },
    Keyboard {
        action: KeyboardAction,
        #[serde(rename = "keyCode")]
        key_code: String,
        /// Legacy numeric key code, kept for agent compatibility.
        key: u32,
        modifiers: Vec<KeyModifier>,
    },
    Settings {
        action: SettingsAction,
        show_cursor: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseAction {
    Move,
    LeftClick,
    RightClick,
    DoubleClick,
    Scroll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyboardAction {
    Keypress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingsAction {
    Cursor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyModifier {
    Ctrl,
    Alt,
    Shift,
    Meta,
}

/// Derived network quality classification. Never a raw latency number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkQuality {
    #[default]
    Good,
    Medium,
    Slow,
}

impl NetworkQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkQuality::Good => "good",
            NetworkQuality::Medium => "medium",
            NetworkQuality::Slow => "slow",
        }
    }
}

/// Decode a base64 frame payload. A payload that fails to decode is a
/// malformed frame and is discarded by the caller.
pub fn decode_frame_image(image: &str) -> Result<Bytes, base64::DecodeError> {
    BASE64.decode(image).map(Bytes::from)
}

pub fn encode_frame_image(image: &[u8]) -> String {
    BASE64.encode(image)
}
