// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Acting principal for a command, resolved once at the API boundary.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::application::UserId;

/// Closed set of roles a caller can hold
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorRole {
    /// Ordinary developer; may only act on applications they own
    #[default]
    Owner,
    /// Administrator; may act on any application
    Admin,
}

impl ActorRole {
    /// Resolve the role claim forwarded by the authorizer.
    /// Anything other than `admin` is treated as an ordinary owner.
    pub fn from_claim(claim: Option<&str>) -> Self {
        match claim.map(str::trim) {
            Some(c) if c.eq_ignore_ascii_case("admin") => Self::Admin,
            _ => Self::Owner,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin)
    }

    /// Label used in generated history reasons ("rejected by developer")
    pub fn label(&self) -> &'static str {
        match self {
            Self::Owner => "developer",
            Self::Admin => "admin",
        }
    }
}

impl fmt::Display for ActorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: UserId,
    pub role: ActorRole,
}

impl Actor {
    pub fn new(id: impl Into<UserId>, role: ActorRole) -> Self {
        Self { id: id.into(), role }
    }

    pub fn owner(id: &str) -> Self {
        Self::new(UserId::from(id), ActorRole::Owner)
    }

    pub fn admin(id: &str) -> Self {
        Self::new(UserId::from(id), ActorRole::Admin)
    }
}
