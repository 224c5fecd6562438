// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod error;
pub mod commands;
pub mod intake;
pub mod queries;
pub mod notification_worker;
pub mod dead_letter_handler;

// Re-export use cases for convenience
pub use error::CommandError;
pub use commands::{ApplicationCommandUseCase, StandardApplicationCommandUseCase, CommandRequest, CommandOutcome};
pub use intake::{SubmitApplicationUseCase, StandardSubmitApplicationUseCase, SubmissionRequest, WebhookVerifier};
pub use queries::{ApplicationQueryService, StandardApplicationQueryService};
pub use notification_worker::{NotificationWorker, NotificationWorkerConfig, JobOutcome};
pub use dead_letter_handler::{DeadLetterHandler, DeadLetterHandlerConfig, BatchReport, DeadLetterError};
