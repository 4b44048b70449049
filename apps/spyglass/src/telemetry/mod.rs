use anyhow::{Result, anyhow};
use tracing_subscriber::{EnvFilter, fmt};

/// Install the global tracing subscriber. Filter comes from
/// `SPYGLASS_LOG` (standard `EnvFilter` syntax), defaulting to `info`.
/// Safe to call more than once.
pub fn init() -> Result<()> {
    let filter = EnvFilter::try_from_env("SPYGLASS_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    match fmt().with_env_filter(filter).try_init() {
        Ok(()) => Ok(()),
        Err(err)
            if err
                .to_string()
                .contains("attempted to set a global default subscriber more than once") =>
        {
            Ok(())
        }
        Err(err) => Err(anyhow!(err)),
    }
}
