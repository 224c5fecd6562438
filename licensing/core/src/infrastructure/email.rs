// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Email Sender Adapters
//!
//! Renders the approval email with Handlebars and hands it to the external
//! email service.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Implement the `EmailSender` port
//!
//! # Placeholders
//!
//! - `{{email}}`, `{{xAccount}}` - applicant contact
//! - `{{broker}}`, `{{accountNumber}}` - trading account
//! - `{{eaName}}` - licensed EA
//! - `{{appliedAt}}` - submission timestamp (RFC 3339)

use async_trait::async_trait;
use handlebars::Handlebars;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

use crate::domain::application::Application;
use crate::domain::config::NotificationConfig;
use crate::domain::notification::{EmailSender, NotificationError};

const APPROVAL_SUBJECT: &str = "approval_subject";
const APPROVAL_BODY: &str = "approval_body";

const DEFAULT_SUBJECT: &str = "Your {{eaName}} license has been approved";

const DEFAULT_BODY: &str = "Hello{{#if xAccount}} {{xAccount}}{{/if}},

Your license application for {{eaName}} has been approved.

Broker: {{broker}}
Account number: {{accountNumber}}
Submitted: {{appliedAt}}

The license is now active for this trading account.
";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct EmailContext<'a> {
    email: &'a str,
    x_account: &'a str,
    broker: &'a str,
    account_number: &'a str,
    ea_name: &'a str,
    applied_at: String,
}

impl<'a> From<&'a Application> for EmailContext<'a> {
    fn from(application: &'a Application) -> Self {
        Self {
            email: &application.contact.email,
            x_account: &application.contact.x_account,
            broker: &application.contact.broker,
            account_number: &application.contact.account_number,
            ea_name: &application.contact.ea_name,
            applied_at: application.applied_at.to_rfc3339(),
        }
    }
}

/// Rendered message ready for delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub text: String,
}

pub struct EmailTemplates {
    handlebars: Handlebars<'static>,
    from_address: String,
}

impl EmailTemplates {
    pub fn new(from_address: impl Into<String>) -> Result<Self, NotificationError> {
        Self::with_templates(from_address, DEFAULT_SUBJECT, DEFAULT_BODY)
    }

    pub fn with_templates(
        from_address: impl Into<String>,
        subject: &str,
        body: &str,
    ) -> Result<Self, NotificationError> {
        let mut handlebars = Handlebars::new();
        // Plain-text mail; no HTML escaping
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars
            .register_template_string(APPROVAL_SUBJECT, subject)
            .map_err(|e| NotificationError::Template(e.to_string()))?;
        handlebars
            .register_template_string(APPROVAL_BODY, body)
            .map_err(|e| NotificationError::Template(e.to_string()))?;

        Ok(Self {
            handlebars,
            from_address: from_address.into(),
        })
    }

    pub fn render_approval(&self, application: &Application) -> Result<RenderedEmail, NotificationError> {
        let context = EmailContext::from(application);
        let render = |name: &str| {
            self.handlebars
                .render(name, &context)
                .map_err(|e| NotificationError::Template(e.to_string()))
        };

        Ok(RenderedEmail {
            from: self.from_address.clone(),
            to: application.contact.email.clone(),
            subject: render(APPROVAL_SUBJECT)?.trim().to_string(),
            text: render(APPROVAL_BODY)?,
        })
    }
}

/// Posts rendered emails as JSON to an HTTP email service
pub struct HttpEmailSender {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    templates: EmailTemplates,
}

impl HttpEmailSender {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        templates: EmailTemplates,
        timeout: Duration,
    ) -> Result<Self, NotificationError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotificationError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
            templates,
        })
    }

    pub fn from_config(config: &NotificationConfig, endpoint: &str) -> Result<Self, NotificationError> {
        Self::new(
            endpoint,
            config.email_api_key.clone(),
            EmailTemplates::new(config.from_address.clone())?,
            Duration::from_millis(config.request_timeout_ms),
        )
    }
}

#[async_trait]
impl EmailSender for HttpEmailSender {
    async fn send_approval(&self, application: &Application) -> Result<(), NotificationError> {
        let email = self.templates.render_approval(application)?;

        let mut request = self.client.post(&self.endpoint).json(&email);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| NotificationError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotificationError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        debug!(to = %email.to, status = status.as_u16(), "Email service accepted message");
        Ok(())
    }
}

/// Development sender: renders and logs instead of delivering
pub struct LoggingEmailSender {
    templates: EmailTemplates,
}

impl LoggingEmailSender {
    pub fn new(templates: EmailTemplates) -> Self {
        Self { templates }
    }
}

#[async_trait]
impl EmailSender for LoggingEmailSender {
    async fn send_approval(&self, application: &Application) -> Result<(), NotificationError> {
        let email = self.templates.render_approval(application)?;
        info!(to = %email.to, subject = %email.subject, "Email delivery disabled, logging approval email");
        debug!(body = %email.text, "Approval email body");
        Ok(())
    }
}
