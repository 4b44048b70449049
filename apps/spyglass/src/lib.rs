//! Operator-side core for remote desktop sessions: websocket signaling,
//! WebRTC peer transport with a polled-capture fallback, a latest-wins
//! frame pipeline, and input forwarding.

pub mod config;
pub mod input;
pub mod pipeline;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use config::Config;
pub use session::signaling::SignalingChannel;
pub use session::{NegotiationConfig, Session, SessionConfig, SessionState, SessionStatus};
