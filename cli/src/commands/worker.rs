// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Standalone consumers: `ea-licensing worker` and `ea-licensing dead-letter`

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use ea_licensing_core::domain::config::{BackendKind, LicensingConfigManifest};

use super::shutdown_signal;
use crate::bootstrap::Services;

fn warn_if_in_memory(config: &LicensingConfigManifest) {
    if config.spec.queue.backend == BackendKind::InMemory {
        warn!("Standalone consumer on the in-memory queue only sees jobs published by this process");
    }
}

/// Consume the notification queue until a shutdown signal arrives
pub async fn run_notification_worker(config: LicensingConfigManifest) -> Result<()> {
    warn_if_in_memory(&config);
    let services = Services::build(config).await?;
    let worker = Arc::new(services.notification_worker()?);
    let token = worker.shutdown_token();
    let handle = worker.start();

    shutdown_signal().await;
    token.cancel();
    handle.await?;

    info!("Notification worker exited");
    Ok(())
}

/// Consume the dead-letter queue until a shutdown signal arrives
pub async fn run_dead_letter_handler(config: LicensingConfigManifest) -> Result<()> {
    warn_if_in_memory(&config);
    let services = Services::build(config).await?;
    let handler = Arc::new(services.dead_letter_handler());
    let token = handler.shutdown_token();
    let handle = handler.start();

    shutdown_signal().await;
    token.cancel();
    handle.await?;

    info!("Dead-letter handler exited");
    Ok(())
}
