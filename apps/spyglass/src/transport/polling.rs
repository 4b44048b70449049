//! Fallback transport: periodic capture requests over the signaling
//! channel. Request/response pairs are independent and carry no sequence
//! numbers; a stale response that lands after a newer one is absorbed by
//! the frame pipeline's latest-wins rule.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::protocol::{CaptureRequest, ClientEnvelope, ControlCommand};
use crate::session::signaling::SignalingChannel;
use crate::transport::{ControlSink, TransportError};

pub struct PollingTransport {
    signaling: Arc<SignalingChannel>,
    device_id: String,
    quality: u8,
    show_cursor: Arc<AtomicBool>,
    stopped: AtomicBool,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl PollingTransport {
    /// Issue the start-capture request and begin the capture timer at
    /// `1000/fps` ms.
    pub fn start(
        signaling: Arc<SignalingChannel>,
        device_id: String,
        quality: u8,
        show_cursor: bool,
        fps: u32,
    ) -> Arc<Self> {
        let show_cursor = Arc::new(AtomicBool::new(show_cursor));
        signaling.send(ClientEnvelope::ScreenCapture {
            device_id: device_id.clone(),
            data: CaptureRequest::start(quality, show_cursor.load(Ordering::SeqCst)),
        });

        let task = tokio::spawn(capture_loop(
            signaling.clone(),
            device_id.clone(),
            quality,
            show_cursor.clone(),
            fps,
        ));

        Arc::new(Self {
            signaling,
            device_id,
            quality,
            show_cursor,
            stopped: AtomicBool::new(false),
            task: StdMutex::new(Some(task)),
        })
    }

    /// Cancel the capture timer and notify the agent. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut guard) = self.task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
        self.signaling.send(ClientEnvelope::ScreenCapture {
            device_id: self.device_id.clone(),
            data: CaptureRequest::stop(),
        });
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }
}

impl Drop for PollingTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn capture_loop(
    signaling: Arc<SignalingChannel>,
    device_id: String,
    quality: u8,
    show_cursor: Arc<AtomicBool>,
    fps: u32,
) {
    let period = Duration::from_millis((1000.0 / fps.max(1) as f64).round() as u64);
    let mut ticker = tokio::time::interval(period);
    // The start request already went out; captures begin one period later.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        signaling.send(ClientEnvelope::ScreenCapture {
            device_id: device_id.clone(),
            data: CaptureRequest::capture(quality, show_cursor.load(Ordering::SeqCst)),
        });
    }
}

#[async_trait]
impl ControlSink for PollingTransport {
    fn is_open(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst) && self.signaling.is_open()
    }

    async fn send(&self, command: &ControlCommand) -> Result<(), TransportError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        match command {
            ControlCommand::Mouse { .. } => {
                self.signaling.send(ClientEnvelope::MouseControl {
                    device_id: self.device_id.clone(),
                    data: command.clone(),
                });
            }
            ControlCommand::Keyboard { .. } => {
                self.signaling.send(ClientEnvelope::KeyboardControl {
                    device_id: self.device_id.clone(),
                    data: command.clone(),
                });
            }
            ControlCommand::Settings { show_cursor, .. } => {
                // Cursor preference rides the next capture request.
                self.show_cursor.store(*show_cursor, Ordering::SeqCst);
            }
        }
        Ok(())
    }
}
