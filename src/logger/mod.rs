// SPDX-License-Identifier: GPL-3.0-only

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn init_logger() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if cfg!(debug_assertions) {
            "warn,cosmic_output=debug"
        } else {
            "info"
        })
    });
    let fmt_layer = fmt::layer().compact().with_writer(std::io::stderr);
    let (journald, journald_err) = match tracing_journald::layer() {
        Ok(layer) => (Some(layer), None),
        Err(err) => (None, Some(err)),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(journald)
        .try_init()
        .context("Failed to install logger")?;
    log_panics::init();

    if let Some(err) = journald_err {
        warn!(?err, "Journald not available, logging to stderr only");
    }
    info!("Version: {}", std::env!("CARGO_PKG_VERSION"));
    if cfg!(debug_assertions) {
        debug!(
            "Debug build ({})",
            std::option_env!("GIT_HASH").unwrap_or("Unknown")
        );
    }

    Ok(())
}
