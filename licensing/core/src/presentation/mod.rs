// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer (`ea-licensing-core`)
//!
//! HTTP surface that translates external requests into application service
//! calls. No business logic lives here; all real work is delegated to
//! `crate::application`.
//!
//! | Module | Transport | Description |
//! |--------|-----------|-------------|
//! | [`api`] | HTTP (Axum) | Command, query and webhook endpoints |

pub mod api;
