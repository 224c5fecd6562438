// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Mod
//!
//! Provides mod functionality for the system.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Aggregates, state machine rules and ports of the licensing context

pub mod actor;
pub mod application;
pub mod clock;
pub mod config;
pub mod history;
pub mod notification;
pub mod queue;
pub mod repository;
pub mod transition;
