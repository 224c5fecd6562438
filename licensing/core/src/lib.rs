// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Lib
//!
//! EA license application lifecycle: command handlers, the approval
//! notification pipeline and the HTTP API in front of them.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Domain model, use cases, adapters and presentation for EA licensing

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
