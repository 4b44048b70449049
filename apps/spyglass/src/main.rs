use std::time::Duration;

use clap::Parser;
use spyglass_core::session::signaling::SignalingChannel;
use spyglass_core::{Config, Session, SessionConfig};

#[derive(Parser, Debug)]
#[command(name = "spyglass")]
struct Cli {
    /// Device identifier of the remote agent to view
    #[arg(long, short = 'd')]
    device: String,

    /// Coordination server websocket URL
    #[arg(long, env = "SPYGLASS_SERVER")]
    server: Option<String>,

    /// Polled capture rate in frames per second
    #[arg(long)]
    fps: Option<u32>,

    /// JPEG quality hint for polled captures (1-100)
    #[arg(long)]
    quality: Option<u8>,

    /// Skip peer negotiation and use the polling transport directly
    #[arg(long)]
    polling: bool,

    /// Allow forwarding mouse and keyboard input to the remote device
    #[arg(long)]
    control: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    spyglass_core::telemetry::init()?;

    let cli = Cli::parse();
    let defaults = Config::from_env();

    let server_url = cli.server.unwrap_or(defaults.server_url);
    let mut config = SessionConfig::new(cli.device);
    config.fps = cli.fps.unwrap_or(defaults.fps);
    config.quality = cli.quality.unwrap_or(defaults.quality);
    config.prefer_peer = !cli.polling;

    let signaling = SignalingChannel::open(&server_url);
    let session = Session::start(signaling.clone(), config);
    session.set_control_enabled(cli.control);

    let mut state_rx = session.watch_state();
    let status_task = {
        let pipeline = session.pipeline();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        tracing::info!(state = state_rx.borrow().as_str(), "session state");
                    }
                    _ = ticker.tick() => {
                        if let Some(frame) = pipeline.current() {
                            tracing::info!(
                                bytes = frame.image.len(),
                                quality = pipeline.quality().as_str(),
                                "latest frame"
                            );
                        }
                    }
                }
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    session.stop().await;
    signaling.close();
    status_task.abort();
    Ok(())
}
