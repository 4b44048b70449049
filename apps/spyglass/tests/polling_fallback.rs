//! Session behavior when the peer transport is unavailable: fallback to
//! polled captures, capture cadence requests, and teardown.

mod common;

use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;

use spyglass_core::protocol::{
    CaptureRequest, ClientEnvelope, MouseAction, NetworkQuality, encode_frame_image,
};
use spyglass_core::session::signaling::SignalingChannel;
use spyglass_core::transport::TransportKind;
use spyglass_core::transport::webrtc::PeerTransportConfig;
use spyglass_core::{NegotiationConfig, Session, SessionConfig, SessionState};

use common::spawn_relay;

const DEVICE: &str = "device-under-test";

fn fast_config() -> SessionConfig {
    let mut config = SessionConfig::new(DEVICE);
    config.peer = PeerTransportConfig::host_only();
    config.peer.gather_timeout = Duration::from_millis(500);
    config.negotiation = NegotiationConfig {
        offer_retry_interval: Duration::from_millis(50),
        offer_retry_limit: 10,
        connect_timeout: Duration::from_millis(750),
    };
    config
}

async fn next_message(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("timed out waiting for client message")
        .expect("relay closed")
}

/// Reads client messages until one satisfies `pred`, returning it.
async fn wait_for_message(
    rx: &mut mpsc::UnboundedReceiver<Value>,
    pred: impl Fn(&Value) -> bool,
) -> Value {
    timeout(Duration::from_secs(10), async {
        loop {
            let message = rx.recv().await.expect("relay closed");
            if pred(&message) {
                return message;
            }
        }
    })
    .await
    .expect("timed out waiting for matching client message")
}

fn is_capture_action(message: &Value, action: &str) -> bool {
    message["type"] == "screen_capture" && message["data"]["action"] == action
}

#[tokio::test]
async fn channel_opens_and_delivers_without_an_open_watcher() {
    let mut relay = spawn_relay().await;
    let signaling = SignalingChannel::open(&relay.url);

    // Nobody holds a watch_open receiver here; plain is_open() polling
    // must still observe the connected socket.
    timeout(Duration::from_secs(5), async {
        while !signaling.is_open() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("channel never reported open");

    signaling.send(ClientEnvelope::ScreenCapture {
        device_id: DEVICE.into(),
        data: CaptureRequest::start(60, true),
    });
    let message = next_message(&mut relay.from_client).await;
    assert!(is_capture_action(&message, "start"), "got {message}");

    signaling.close();
}

#[tokio::test]
async fn falls_back_to_polling_when_peer_never_answers() {
    let mut relay = spawn_relay().await;
    let signaling = SignalingChannel::open(&relay.url);
    let session = Session::start(signaling.clone(), fast_config());

    // Peer setup runs first: the offer goes out and goes unanswered.
    let offer = wait_for_message(&mut relay.from_client, |m| m["type"] == "webrtc_signal").await;
    assert_eq!(offer["device_id"], DEVICE);
    assert_eq!(offer["data"]["type"], "offer");
    assert!(
        offer["data"]["sdp"].as_str().is_some_and(|s| !s.is_empty()),
        "offer should carry sdp"
    );

    assert!(
        session
            .wait_for(SessionState::PollingActive, Duration::from_secs(10))
            .await,
        "session should demote to polling, state: {}",
        session.state()
    );

    let start = wait_for_message(&mut relay.from_client, |m| is_capture_action(m, "start")).await;
    assert_eq!(start["device_id"], DEVICE);
    assert_eq!(start["data"]["quality"], 60);

    // Cadence requests follow the start.
    wait_for_message(&mut relay.from_client, |m| is_capture_action(m, "capture")).await;

    session.stop().await;
    signaling.close();
}

#[tokio::test]
async fn polled_frames_reach_the_pipeline() {
    let mut relay = spawn_relay().await;
    let signaling = SignalingChannel::open(&relay.url);
    let mut config = fast_config();
    config.prefer_peer = false;
    let session = Session::start(signaling.clone(), config);

    let start = next_message(&mut relay.from_client).await;
    assert!(is_capture_action(&start, "start"), "got {start}");
    assert!(
        session
            .wait_for(SessionState::PollingActive, Duration::from_secs(5))
            .await
    );

    // A frame for another device must be ignored.
    relay
        .to_client
        .send(
            json!({
                "type": "screen_capture",
                "device_id": "someone-else",
                "data": {"type": "frame", "image": encode_frame_image(b"wrong"), "width": 10, "height": 10}
            })
            .to_string(),
        )
        .unwrap();
    relay
        .to_client
        .send(
            json!({
                "type": "screen_capture",
                "device_id": DEVICE,
                "data": {
                    "image": encode_frame_image(b"polled-jpeg"),
                    "width": 800,
                    "height": 600,
                    "network_status": "slow"
                }
            })
            .to_string(),
        )
        .unwrap();

    let pipeline = session.pipeline();
    timeout(Duration::from_secs(5), async {
        loop {
            if pipeline.current().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("frame never arrived");

    let frame = pipeline.current().unwrap();
    assert_eq!(frame.image.as_ref(), b"polled-jpeg");
    assert_eq!(pipeline.dimensions(), Some((800, 600)));
    assert_eq!(session.status().network_quality, NetworkQuality::Slow);

    session.stop().await;
    signaling.close();
}

#[tokio::test]
async fn stop_sends_capture_stop() {
    let mut relay = spawn_relay().await;
    let signaling = SignalingChannel::open(&relay.url);
    let mut config = fast_config();
    config.prefer_peer = false;
    let session = Session::start(signaling.clone(), config);

    wait_for_message(&mut relay.from_client, |m| is_capture_action(m, "start")).await;

    session.stop().await;
    assert_eq!(session.state(), SessionState::Closed);

    wait_for_message(&mut relay.from_client, |m| is_capture_action(m, "stop")).await;
    signaling.close();
}

#[tokio::test]
async fn polling_control_rides_the_signaling_channel() {
    let mut relay = spawn_relay().await;
    let signaling = SignalingChannel::open(&relay.url);
    let mut config = fast_config();
    config.prefer_peer = false;
    let session = Session::start(signaling.clone(), config);

    wait_for_message(&mut relay.from_client, |m| is_capture_action(m, "start")).await;
    session.set_control_enabled(true);

    let viewport = spyglass_core::input::Viewport::new(0.0, 0.0, 640.0, 480.0);
    session
        .input()
        .click(MouseAction::LeftClick, 32.0, 48.0, viewport)
        .await;
    session.input().key_press("Enter", 13, Vec::new()).await;

    let mouse_move =
        wait_for_message(&mut relay.from_client, |m| m["type"] == "mouse_control").await;
    assert_eq!(mouse_move["data"]["action"], "move");
    let click = wait_for_message(&mut relay.from_client, |m| m["type"] == "mouse_control").await;
    assert_eq!(click["data"]["action"], "leftclick");
    // No frame dimensions yet, so coordinates map 1:1 and the viewport
    // stands in for the remote screen.
    assert_eq!(click["data"]["x"], 32);
    assert_eq!(click["data"]["y"], 48);
    assert_eq!(click["data"]["screenWidth"], 640);
    assert_eq!(click["data"]["screenHeight"], 480);

    let key = wait_for_message(&mut relay.from_client, |m| m["type"] == "keyboard_control").await;
    assert_eq!(key["data"]["keyCode"], "Enter");
    assert_eq!(key["data"]["key"], 13);

    session.stop().await;
    signaling.close();
}

#[tokio::test]
async fn unreachable_server_closes_the_session() {
    // Nothing listens here; the connect fails and the channel never
    // opens. The session must end on its own rather than park in a
    // polling state with a dead channel.
    let signaling = SignalingChannel::open("ws://127.0.0.1:9/ws");
    let mut config = fast_config();
    config.negotiation.offer_retry_interval = Duration::from_millis(20);
    config.negotiation.offer_retry_limit = 3;
    let session = Session::start(signaling.clone(), config);

    assert!(
        session
            .wait_for(SessionState::Closed, Duration::from_secs(5))
            .await,
        "session should close by itself, state: {}",
        session.state()
    );
    assert_ne!(session.status().transport, TransportKind::Peer);
    assert!(!session.status().connected);

    session.stop().await;
    signaling.close();
}

#[tokio::test]
async fn unreachable_server_closes_a_polling_only_session() {
    let signaling = SignalingChannel::open("ws://127.0.0.1:9/ws");
    let mut config = fast_config();
    config.prefer_peer = false;
    config.negotiation.offer_retry_interval = Duration::from_millis(20);
    config.negotiation.offer_retry_limit = 3;
    let session = Session::start(signaling.clone(), config);

    assert!(
        session
            .wait_for(SessionState::Closed, Duration::from_secs(5))
            .await,
        "session should close by itself, state: {}",
        session.state()
    );

    session.stop().await;
    signaling.close();
}
