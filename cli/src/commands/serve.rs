// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! `ea-licensing serve`
//!
//! Runs the HTTP API and, unless `--api-only` is given, the notification
//! worker and dead-letter handler in the same process. Consumers are
//! cancelled after the HTTP server has drained.

use anyhow::{Context, Result};
use clap::Args;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use ea_licensing_core::domain::config::LicensingConfigManifest;
use ea_licensing_core::presentation::api;

use super::shutdown_signal;
use crate::bootstrap::Services;

#[derive(Args)]
pub struct ServeCommand {
    /// Serve the HTTP API only; run the consumers elsewhere
    #[arg(long)]
    api_only: bool,

    /// Override spec.api.port
    #[arg(long, env = "EA_LICENSING_PORT")]
    port: Option<u16>,
}

pub async fn execute(cmd: ServeCommand, config: LicensingConfigManifest) -> Result<()> {
    let addr = format!(
        "{}:{}",
        config.spec.api.bind_address,
        cmd.port.unwrap_or(config.spec.api.port)
    );
    let services = Services::build(config).await?;

    let mut consumers = Vec::new();
    if !cmd.api_only {
        let worker = Arc::new(services.notification_worker()?);
        let handler = Arc::new(services.dead_letter_handler());
        consumers.push((worker.shutdown_token(), worker.start()));
        consumers.push((handler.shutdown_token(), handler.start()));
    }

    let app = api::app(services.app_state(), services.request_timeout());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("EA licensing API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("HTTP server stopped, draining consumers");
    for (token, handle) in consumers {
        token.cancel();
        if let Err(e) = handle.await {
            error!(error = %e, "Consumer task ended abnormally");
        }
    }

    info!("Shutdown complete");
    Ok(())
}
