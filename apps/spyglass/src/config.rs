use std::env;
#[cfg(test)]
use std::sync::Mutex;

/// Spyglass application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Coordination server websocket URL
    pub server_url: String,
    /// Polled capture rate in frames per second
    pub fps: u32,
    /// JPEG quality hint for polled captures (1-100)
    pub quality: u8,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let server_url = env::var("SPYGLASS_SERVER")
            .unwrap_or_else(|_| "ws://127.0.0.1:8080/ws".to_string());
        // Normalize localhost to IPv4 to avoid IPv6 (::1) preference on macOS
        let server_url = if server_url.contains("://localhost") {
            server_url.replacen("localhost", "127.0.0.1", 1)
        } else {
            server_url
        };
        let fps = env::var("SPYGLASS_FPS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|fps| *fps > 0)
            .unwrap_or(30);
        let quality = env::var("SPYGLASS_QUALITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|q| (1..=100).contains(q))
            .unwrap_or(60);
        Self {
            server_url,
            fps,
            quality,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8080/ws".to_string(),
            fps: 30,
            quality: 60,
        }
    }
}
