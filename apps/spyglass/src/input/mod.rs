//! Translates operator viewport gestures into remote-space control
//! commands and forwards them over whichever control sink is bound.
//!
//! Events are fire-and-forget: when control is disabled or no sink is
//! bound the event is dropped, never queued for later delivery.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::pipeline::FramePipeline;
use crate::protocol::{
    ControlCommand, KeyModifier, KeyboardAction, MouseAction, SettingsAction,
};
use crate::transport::ControlRouter;

/// Pause between the synthetic move and the click that follows it, giving
/// the remote cursor time to land before the button event fires.
const CLICK_SETTLE: Duration = Duration::from_millis(10);

/// The on-screen rectangle the remote frame is rendered into, in operator
/// display coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

impl Viewport {
    pub fn new(left: f64, top: f64, width: f64, height: f64) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }
}

/// A cursor position mapped into remote screen space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemotePoint {
    pub x: i64,
    pub y: i64,
    pub screen_width: u32,
    pub screen_height: u32,
}

pub struct InputForwarder {
    control: Arc<ControlRouter>,
    pipeline: Arc<FramePipeline>,
    enabled: AtomicBool,
}

impl InputForwarder {
    pub fn new(control: Arc<ControlRouter>, pipeline: Arc<FramePipeline>) -> Self {
        Self {
            control,
            pipeline,
            enabled: AtomicBool::new(false),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Maps a viewport position to remote screen space using the latest
    /// frame dimensions. Falls back to a 1:1 mapping when no frame has
    /// reported its size yet, with the viewport itself standing in as
    /// the screen. Results are clamped to the remote bounds.
    pub fn map_point(&self, x: f64, y: f64, viewport: Viewport) -> RemotePoint {
        let Some((remote_w, remote_h)) = self.pipeline.dimensions() else {
            return RemotePoint {
                x: (x - viewport.left).round().max(0.0) as i64,
                y: (y - viewport.top).round().max(0.0) as i64,
                screen_width: viewport.width.round().max(0.0) as u32,
                screen_height: viewport.height.round().max(0.0) as u32,
            };
        };

        let scale = |offset: f64, viewport_extent: f64, remote_extent: u32| -> i64 {
            if viewport_extent <= 0.0 {
                return 0;
            }
            let mapped = (offset * f64::from(remote_extent) / viewport_extent).round();
            (mapped.max(0.0) as i64).min(i64::from(remote_extent))
        };

        RemotePoint {
            x: scale(x - viewport.left, viewport.width, remote_w),
            y: scale(y - viewport.top, viewport.height, remote_h),
            screen_width: remote_w,
            screen_height: remote_h,
        }
    }

    pub async fn mouse_move(&self, x: f64, y: f64, viewport: Viewport) {
        if !self.enabled() {
            return;
        }
        let point = self.map_point(x, y, viewport);
        self.send_mouse(MouseAction::Move, point, None).await;
    }

    /// Click at a viewport position. A positioning move always precedes
    /// the button event, with a short settle pause between the two.
    pub async fn click(&self, action: MouseAction, x: f64, y: f64, viewport: Viewport) {
        if !self.enabled() {
            return;
        }
        let point = self.map_point(x, y, viewport);
        self.send_mouse(MouseAction::Move, point, None).await;
        tokio::time::sleep(CLICK_SETTLE).await;
        self.send_mouse(action, point, None).await;
    }

    /// One scroll notch. Positive `delta_y` (wheel toward the operator)
    /// scrolls content down, which the agent encodes as -1.
    pub async fn scroll(&self, x: f64, y: f64, viewport: Viewport, delta_y: f64) {
        if !self.enabled() {
            return;
        }
        let point = self.map_point(x, y, viewport);
        let notch = if delta_y > 0.0 { -1 } else { 1 };
        self.send_mouse(MouseAction::Scroll, point, Some(notch)).await;
    }

    pub async fn key_press(&self, key_code: &str, key: u32, modifiers: Vec<KeyModifier>) {
        if !self.enabled() {
            return;
        }
        self.control
            .send(ControlCommand::Keyboard {
                action: KeyboardAction::Keypress,
                key_code: key_code.to_string(),
                key,
                modifiers,
            })
            .await;
    }

    /// Toggles the remote cursor overlay. Not gated on `enabled`; showing
    /// or hiding the cursor is a view preference, not remote control.
    pub async fn set_cursor_visible(&self, show_cursor: bool) {
        self.control
            .send(ControlCommand::Settings {
                action: SettingsAction::Cursor,
                show_cursor,
            })
            .await;
    }

    async fn send_mouse(&self, action: MouseAction, point: RemotePoint, delta_y: Option<i32>) {
        self.control
            .send(ControlCommand::Mouse {
                action,
                x: point.x,
                y: point.y,
                screen_width: point.screen_width,
                screen_height: point.screen_height,
                delta_y,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;

    use crate::pipeline::{Frame, FrameSource};
    use crate::transport::{ControlSink, TransportError};

    struct RecordingSink {
        sent: Mutex<Vec<ControlCommand>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }

        fn commands(&self) -> Vec<ControlCommand> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl ControlSink for RecordingSink {
        fn is_open(&self) -> bool {
            true
        }

        async fn send(&self, command: &ControlCommand) -> Result<(), TransportError> {
            self.sent.lock().push(command.clone());
            Ok(())
        }
    }

    fn forwarder_with_frame(width: u32, height: u32) -> (Arc<InputForwarder>, Arc<RecordingSink>) {
        let control = Arc::new(ControlRouter::new());
        let sink = RecordingSink::new();
        control.bind(sink.clone());
        let pipeline = Arc::new(FramePipeline::new());
        pipeline.submit(Frame {
            image: Bytes::from_static(b"px"),
            width: Some(width),
            height: Some(height),
            source: FrameSource::Polling,
        });
        let forwarder = Arc::new(InputForwarder::new(control, pipeline));
        forwarder.set_enabled(true);
        (forwarder, sink)
    }

    #[test]
    fn maps_viewport_to_remote_space() {
        let (forwarder, _sink) = forwarder_with_frame(1920, 1080);
        let viewport = Viewport::new(100.0, 50.0, 960.0, 540.0);

        let point = forwarder.map_point(100.0, 50.0, viewport);
        assert_eq!((point.x, point.y), (0, 0));

        let point = forwarder.map_point(1060.0, 590.0, viewport);
        assert_eq!((point.x, point.y), (1920, 1080));

        let point = forwarder.map_point(580.0, 320.0, viewport);
        assert_eq!((point.x, point.y), (960, 540));
        assert_eq!(point.screen_width, 1920);
        assert_eq!(point.screen_height, 1080);
    }

    #[test]
    fn mapped_points_never_leave_remote_bounds() {
        let (forwarder, _sink) = forwarder_with_frame(1280, 720);
        let viewport = Viewport::new(0.0, 0.0, 640.0, 360.0);

        // Positions outside the viewport clamp to the edges.
        for (x, y) in [(-50.0, -50.0), (700.0, 400.0), (10_000.0, -1.0)] {
            let point = forwarder.map_point(x, y, viewport);
            assert!((0..=1280).contains(&point.x), "x out of bounds: {}", point.x);
            assert!((0..=720).contains(&point.y), "y out of bounds: {}", point.y);
        }
    }

    #[test]
    fn falls_back_to_identity_without_dimensions() {
        let control = Arc::new(ControlRouter::new());
        let pipeline = Arc::new(FramePipeline::new());
        let forwarder = InputForwarder::new(control, pipeline);

        let point = forwarder.map_point(320.0, 240.0, Viewport::new(20.0, 40.0, 640.0, 480.0));
        assert_eq!((point.x, point.y), (300, 200));
        // The viewport stands in for the screen until a frame reports
        // its size.
        assert_eq!((point.screen_width, point.screen_height), (640, 480));
    }

    #[tokio::test]
    async fn click_sends_move_then_button() {
        let (forwarder, sink) = forwarder_with_frame(1000, 500);
        let viewport = Viewport::new(0.0, 0.0, 1000.0, 500.0);

        forwarder
            .click(MouseAction::LeftClick, 250.0, 125.0, viewport)
            .await;

        let commands = sink.commands();
        assert_eq!(commands.len(), 2);
        match &commands[0] {
            ControlCommand::Mouse { action, x, y, .. } => {
                assert_eq!(*action, MouseAction::Move);
                assert_eq!((*x, *y), (250, 125));
            }
            other => panic!("expected mouse command, got {other:?}"),
        }
        match &commands[1] {
            ControlCommand::Mouse { action, x, y, .. } => {
                assert_eq!(*action, MouseAction::LeftClick);
                assert_eq!((*x, *y), (250, 125));
            }
            other => panic!("expected mouse command, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn scroll_encodes_wheel_direction() {
        let (forwarder, sink) = forwarder_with_frame(800, 600);
        let viewport = Viewport::new(0.0, 0.0, 800.0, 600.0);

        forwarder.scroll(10.0, 10.0, viewport, 120.0).await;
        forwarder.scroll(10.0, 10.0, viewport, -120.0).await;

        let deltas: Vec<Option<i32>> = sink
            .commands()
            .iter()
            .map(|cmd| match cmd {
                ControlCommand::Mouse { delta_y, .. } => *delta_y,
                other => panic!("expected mouse command, got {other:?}"),
            })
            .collect();
        assert_eq!(deltas, vec![Some(-1), Some(1)]);
    }

    #[tokio::test]
    async fn disabled_forwarder_drops_everything() {
        let (forwarder, sink) = forwarder_with_frame(800, 600);
        forwarder.set_enabled(false);
        let viewport = Viewport::new(0.0, 0.0, 800.0, 600.0);

        forwarder.mouse_move(1.0, 1.0, viewport).await;
        forwarder
            .click(MouseAction::RightClick, 1.0, 1.0, viewport)
            .await;
        forwarder.key_press("KeyA", 65, Vec::new()).await;

        assert!(sink.commands().is_empty());
    }
}
