//! Holds the latest received frame and the derived network-quality sample.
//!
//! Frames carry no sequence numbers; new arrivals unconditionally replace
//! the current frame (last-write-wins). Once peer frames are flowing,
//! polling-sourced frames for the same session are discarded so a stale
//! polled frame can never visually rewind the view.

use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::protocol::NetworkQuality;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSource {
    Peer,
    Polling,
}

/// One decoded frame: opaque compressed image plus the dimensions it was
/// captured at, when the sender included them.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: Bytes,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub source: FrameSource,
}

/// Inter-arrival gap classification for peer-delivered frames. Sits above
/// the agent's ping-latency bands since a frame gap includes encode time.
const GAP_GOOD: Duration = Duration::from_millis(250);
const GAP_MEDIUM: Duration = Duration::from_millis(750);

pub fn classify_gap(gap: Duration) -> NetworkQuality {
    if gap < GAP_GOOD {
        NetworkQuality::Good
    } else if gap < GAP_MEDIUM {
        NetworkQuality::Medium
    } else {
        NetworkQuality::Slow
    }
}

#[derive(Default)]
pub struct FramePipeline {
    current: RwLock<Option<Frame>>,
    dimensions: RwLock<Option<(u32, u32)>>,
    peer_streaming: AtomicBool,
    last_arrival: Mutex<Option<Instant>>,
    derived: RwLock<NetworkQuality>,
    reported: RwLock<NetworkQuality>,
}

impl FramePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a frame. Returns false when the frame was discarded under
    /// the peer-supersedes-polling rule.
    pub fn submit(&self, frame: Frame) -> bool {
        match frame.source {
            FrameSource::Peer => {
                self.peer_streaming.store(true, Ordering::SeqCst);
                self.record_arrival();
            }
            FrameSource::Polling => {
                if self.peer_streaming.load(Ordering::SeqCst) {
                    tracing::trace!(target = "pipeline", "discarding polled frame while peer streams");
                    return false;
                }
            }
        }

        if let (Some(width), Some(height)) = (frame.width, frame.height) {
            if width > 0 && height > 0 {
                *self.dimensions.write() = Some((width, height));
            }
        }
        *self.current.write() = Some(frame);
        true
    }

    /// Peer transport torn down: polled frames are acceptable again.
    pub fn peer_gone(&self) {
        self.peer_streaming.store(false, Ordering::SeqCst);
        *self.last_arrival.lock() = None;
    }

    pub fn peer_streaming(&self) -> bool {
        self.peer_streaming.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> Option<Frame> {
        self.current.read().clone()
    }

    /// Last known remote screen dimensions, set by the first frame that
    /// carried them.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        *self.dimensions.read()
    }

    /// Explicit hint from the remote side, used in polling mode.
    pub fn report_quality(&self, quality: NetworkQuality) {
        *self.reported.write() = quality;
    }

    /// The surfaced sample: derived from frame cadence while peer frames
    /// flow, otherwise the remote side's explicit hint.
    pub fn quality(&self) -> NetworkQuality {
        if self.peer_streaming.load(Ordering::SeqCst) {
            *self.derived.read()
        } else {
            *self.reported.read()
        }
    }

    fn record_arrival(&self) {
        let now = Instant::now();
        let mut last = self.last_arrival.lock();
        if let Some(previous) = last.replace(now) {
            *self.derived.write() = classify_gap(now - previous);
        }
    }
}
