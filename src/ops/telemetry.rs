use crate::config::{LogFormat, TelemetryConfig};
use anyhow::Result;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

/// Initialize logging; `--debug` or an explicit directive selects the level.
pub fn init_tracing(cfg: &TelemetryConfig) -> Result<()> {
    let level = cfg.effective_level();
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let installed = match cfg.log_format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_timer(fmt::time::UtcTime::rfc_3339()),
            )
            .try_init(),
        LogFormat::Text => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(fmt::time::UtcTime::rfc_3339()),
            )
            .try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("failed to init tracing: {e}"))
}
