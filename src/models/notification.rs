//! Notification messages handed to the notifier.

use crate::models::tenant::Tenant;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, time::Duration};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => f.write_str("INFO"),
            Severity::Warning => f.write_str("WARNING"),
            Severity::Critical => f.write_str("CRITICAL"),
        }
    }
}

/// Who a notice is addressed to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Recipient {
    /// A tenant contact address. `name` is kept for logging.
    Tenant { name: String, email: String },
    /// The host administrator (address resolved by the notifier).
    Admin,
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::Tenant { name, email } => write!(f, "tenant {} <{}>", name, email),
            Recipient::Admin => f.write_str("admin"),
        }
    }
}

/// A single notification request.
///
/// When `dedup_key` is set, the notifier suppresses any further notice with
/// the same key until `cooldown` has elapsed since the last delivery.
#[derive(Clone, Debug)]
pub struct Notice {
    pub recipient: Recipient,
    pub subject: String,
    pub body: String,
    pub severity: Severity,
    pub dedup_key: Option<String>,
    pub cooldown: Duration,
}

impl Notice {
    pub fn to_tenant(
        tenant: &Tenant,
        severity: Severity,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self::to_address(&tenant.name, &tenant.email, severity, subject, body)
    }

    /// Address a tenant through an explicit address (e.g. a previous contact).
    pub fn to_address(
        name: &str,
        email: &str,
        severity: Severity,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            recipient: Recipient::Tenant {
                name: name.to_string(),
                email: email.to_string(),
            },
            subject: subject.into(),
            body: body.into(),
            severity,
            dedup_key: None,
            cooldown: Duration::ZERO,
        }
    }

    pub fn to_admin(severity: Severity, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            recipient: Recipient::Admin,
            subject: subject.into(),
            body: body.into(),
            severity,
            dedup_key: None,
            cooldown: Duration::ZERO,
        }
    }

    pub fn dedup(mut self, key: impl Into<String>, cooldown: Duration) -> Self {
        self.dedup_key = Some(key.into());
        self.cooldown = cooldown;
        self
    }
}

/// What happened to a notice the notifier accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Dropped because the same `dedup_key` was delivered within its cooldown.
    Suppressed,
    /// Delivery failed; the message sits in the retry queue.
    Queued,
}

/// A message waiting in the retry queue.
#[derive(Clone, Debug, FromRow)]
pub struct QueuedMail {
    pub id: Uuid,
    pub recipient: String,
    /// Already carries the `[SEVERITY]` prefix.
    pub subject: String,
    pub body: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}
