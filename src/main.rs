// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::error;

use clawline_provider::config::ClawlineConfig;

#[tokio::main]
async fn main() {
    let mut config = ClawlineConfig::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = config.apply_file_overlay() {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
    config.clamp_max_message_bytes();

    let handle = match clawline_provider::Lifecycle::start(config, None).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("fatal: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = handle.wait().await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}
