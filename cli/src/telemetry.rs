// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Process-wide logging and metrics set-up

use anyhow::{Context, Result};
use metrics::describe_counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Initialize tracing subscriber for logging.
///
/// `RUST_LOG` wins over `level` when set.
pub fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if format == "json" {
        builder.json().with_current_span(true).init();
    } else {
        builder.with_target(false).compact().init();
    }

    Ok(())
}

/// Serve Prometheus metrics on `addr` and register counter descriptions
pub fn init_metrics(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    describe_counter!("licensing_transitions_total", "Application status transitions by action");
    describe_counter!("licensing_notifications_sent_total", "Approval emails accepted by the email service");
    describe_counter!("licensing_notifications_failed_total", "Notification jobs left for redelivery");
    describe_counter!("licensing_dead_letters_total", "Dead-lettered notification jobs by outcome");
    describe_counter!(
        "licensing_notification_failure_alerts_total",
        "Applications whose notification failures reached the configured maximum"
    );

    info!("Prometheus metrics exporter listening on {}", addr);
    Ok(())
}
