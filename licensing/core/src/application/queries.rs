// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Read-side use cases: application listing and history pages.

use async_trait::async_trait;
use std::sync::Arc;

use crate::application::error::CommandError;
use crate::domain::actor::Actor;
use crate::domain::application::{Application, ApplicationKey, ApplicationStatus, UserId};
use crate::domain::history::{HistoryPage, PageRequest};
use crate::domain::repository::{ApplicationFilter, ApplicationStore};
use crate::domain::transition::StatusTransitionValidator;

#[async_trait]
pub trait ApplicationQueryService: Send + Sync {
    /// Owners see their own applications; admins see all.
    /// `status` is matched case-insensitively.
    async fn list_applications(
        &self,
        actor: Option<Actor>,
        status: Option<&str>,
    ) -> Result<Vec<Application>, CommandError>;

    /// History of one application, oldest first
    async fn list_history(
        &self,
        actor: Option<Actor>,
        sort_key: &str,
        owner_id: Option<&str>,
        page: PageRequest,
    ) -> Result<HistoryPage, CommandError>;
}

pub struct StandardApplicationQueryService {
    store: Arc<dyn ApplicationStore>,
}

impl StandardApplicationQueryService {
    pub fn new(store: Arc<dyn ApplicationStore>) -> Self {
        Self { store }
    }
}

fn require_actor(actor: Option<Actor>) -> Result<Actor, CommandError> {
    actor
        .filter(|a| !a.id.as_str().trim().is_empty())
        .ok_or(CommandError::Unauthenticated)
}

#[async_trait]
impl ApplicationQueryService for StandardApplicationQueryService {
    async fn list_applications(
        &self,
        actor: Option<Actor>,
        status: Option<&str>,
    ) -> Result<Vec<Application>, CommandError> {
        let actor = require_actor(actor)?;

        let status = status
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse::<ApplicationStatus>)
            .transpose()?;

        let filter = if actor.role.is_admin() {
            ApplicationFilter::default()
        } else {
            ApplicationFilter::for_user(actor.id.clone())
        }
        .with_status(status);

        Ok(self.store.list_applications(&filter).await?)
    }

    async fn list_history(
        &self,
        actor: Option<Actor>,
        sort_key: &str,
        owner_id: Option<&str>,
        page: PageRequest,
    ) -> Result<HistoryPage, CommandError> {
        let actor = require_actor(actor)?;
        let sort_key = sort_key.trim();
        if sort_key.is_empty() {
            return Err(CommandError::Validation("Missing application id".to_string()));
        }

        let owner = owner_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(UserId::from)
            .unwrap_or_else(|| actor.id.clone());
        StatusTransitionValidator::check_ownership(&actor, &owner)?;

        let key = ApplicationKey::new(owner, sort_key);
        if self.store.get(&key).await?.is_none() {
            return Err(CommandError::NotFound(key.sort_key));
        }

        Ok(self.store.list_history(&key, &page).await?)
    }
}
