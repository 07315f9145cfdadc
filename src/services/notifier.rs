//! Notifier: rate-limited, queued email delivery.
//!
//! Notices carrying a `dedup_key` are suppressed while the key's cooldown is
//! running. A notice the transport cannot deliver is parked in the SQLite
//! `email_queue` and retried by [`Notifier::flush`]; only a failure to queue
//! surfaces as an error.

use crate::{
    config::NotifyConfig,
    models::notification::{Delivery, Notice, QueuedMail, Recipient},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{
    io,
    path::{Path, PathBuf},
    process::Stdio,
    str::FromStr,
    sync::Arc,
};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

const MIGRATION_SQL: &str = include_str!("../../migrations/0001_init.sql");

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("mail transport failed: {0}")]
    Transport(String),
    #[error("notification database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("cannot prepare notification database at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type NotifyResult<T> = Result<T, NotifyError>;

/// A rendered message ready for a transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingMail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Outcome of a queue flush.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: usize,
    pub still_queued: usize,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, mail: &OutgoingMail) -> NotifyResult<()>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &Notice) -> NotifyResult<Delivery>;

    /// Retry queued messages. Notifiers without a queue have nothing to do.
    async fn flush(&self) -> NotifyResult<FlushReport> {
        Ok(FlushReport::default())
    }
}

/// Hands messages to a sendmail-compatible binary (`sendmail -t -i`).
#[derive(Clone, Debug)]
pub struct SendmailTransport {
    binary: PathBuf,
    from: String,
}

impl SendmailTransport {
    pub fn new(binary: impl Into<PathBuf>, from: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            from: from.into(),
        }
    }

    /// RFC 5322 message with headers stripped of line breaks.
    pub fn render(&self, mail: &OutgoingMail) -> String {
        format!(
            "From: {}\r\nTo: {}\r\nSubject: {}\r\nDate: {}\r\n\
             MIME-Version: 1.0\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}\r\n",
            header_value(&self.from),
            header_value(&mail.to),
            header_value(&mail.subject),
            Utc::now().to_rfc2822(),
            mail.body.replace("\r\n", "\n").replace('\n', "\r\n"),
        )
    }
}

fn header_value(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

#[async_trait]
impl MailTransport for SendmailTransport {
    async fn send(&self, mail: &OutgoingMail) -> NotifyResult<()> {
        let message = self.render(mail);
        let failed = |err: io::Error| {
            NotifyError::Transport(format!("{}: {}", self.binary.display(), err))
        };

        let mut child = Command::new(&self.binary)
            .args(["-t", "-i"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(failed)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(message.as_bytes()).await.map_err(failed)?;
        }
        let output = child.wait_with_output().await.map_err(failed)?;
        if !output.status.success() {
            return Err(NotifyError::Transport(format!(
                "{} exited with {}: {}",
                self.binary.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        debug!("handed message for {} to {}", mail.to, self.binary.display());
        Ok(())
    }
}

/// SQLite-backed notifier with cooldown suppression and a retry queue.
#[derive(Clone)]
pub struct QueuedNotifier {
    db: SqlitePool,
    transport: Arc<dyn MailTransport>,
    admin_email: String,
}

impl QueuedNotifier {
    /// Wrap an existing pool. Call [`QueuedNotifier::migrate`] before use.
    pub fn new(db: SqlitePool, transport: Arc<dyn MailTransport>, admin_email: &str) -> Self {
        Self {
            db,
            transport,
            admin_email: admin_email.to_string(),
        }
    }

    /// Open (creating if needed) the configured database and migrate it.
    pub async fn connect(config: &NotifyConfig) -> NotifyResult<Self> {
        if let Some(parent) = sqlite_file(&config.database_url).and_then(Path::parent) {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| NotifyError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let options = SqliteConnectOptions::from_str(&config.database_url)?.create_if_missing(true);
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let transport = Arc::new(SendmailTransport::new(&config.sendmail, &config.mail_from));
        let notifier = Self::new(db, transport, &config.admin_email);
        notifier.migrate().await?;
        Ok(notifier)
    }

    /// Apply the embedded schema, statement by statement.
    pub async fn migrate(&self) -> NotifyResult<()> {
        let statements: Vec<&str> = MIGRATION_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        for stmt in statements {
            debug!("executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&self.db).await?;
        }
        Ok(())
    }

    /// Messages currently waiting for delivery, oldest first.
    pub async fn queued(&self) -> NotifyResult<Vec<QueuedMail>> {
        Ok(sqlx::query_as::<_, QueuedMail>(
            "SELECT id, recipient, subject, body, attempts, last_error, created_at \
             FROM email_queue ORDER BY created_at",
        )
        .fetch_all(&self.db)
        .await?)
    }

    fn address(&self, recipient: &Recipient) -> String {
        match recipient {
            Recipient::Tenant { email, .. } => email.clone(),
            Recipient::Admin => self.admin_email.clone(),
        }
    }

    async fn in_cooldown(&self, notice: &Notice) -> NotifyResult<bool> {
        let Some(key) = &notice.dedup_key else {
            return Ok(false);
        };
        let last: Option<DateTime<Utc>> =
            sqlx::query_scalar("SELECT last_sent_at FROM notification_log WHERE dedup_key = ?")
                .bind(key)
                .fetch_optional(&self.db)
                .await?;
        Ok(last.is_some_and(|at| {
            (Utc::now() - at).to_std().unwrap_or_default() < notice.cooldown
        }))
    }

    async fn record_delivery(&self, notice: &Notice) -> NotifyResult<()> {
        if let Some(key) = &notice.dedup_key {
            sqlx::query(
                "INSERT INTO notification_log (dedup_key, last_sent_at) VALUES (?, ?) \
                 ON CONFLICT(dedup_key) DO UPDATE SET last_sent_at = excluded.last_sent_at",
            )
            .bind(key)
            .bind(Utc::now())
            .execute(&self.db)
            .await?;
        }
        Ok(())
    }

    async fn enqueue(&self, mail: &OutgoingMail, error: &str) -> NotifyResult<()> {
        sqlx::query(
            "INSERT INTO email_queue (id, recipient, subject, body, attempts, last_error, created_at) \
             VALUES (?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(Uuid::new_v4())
        .bind(&mail.to)
        .bind(&mail.subject)
        .bind(&mail.body)
        .bind(error)
        .bind(Utc::now())
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for QueuedNotifier {
    async fn notify(&self, notice: &Notice) -> NotifyResult<Delivery> {
        if self.in_cooldown(notice).await? {
            debug!(
                "suppressed `{}` for {} (cooldown)",
                notice.subject, notice.recipient
            );
            return Ok(Delivery::Suppressed);
        }

        let mail = OutgoingMail {
            to: self.address(&notice.recipient),
            subject: format!("[{}] {}", notice.severity, notice.subject),
            body: notice.body.clone(),
        };

        let delivery = match self.transport.send(&mail).await {
            Ok(()) => {
                info!("notified {}: {}", notice.recipient, notice.subject);
                Delivery::Sent
            }
            Err(err) => {
                warn!(
                    "notification to {} failed, queued for retry: {}",
                    notice.recipient, err
                );
                self.enqueue(&mail, &err.to_string()).await?;
                Delivery::Queued
            }
        };
        self.record_delivery(notice).await?;
        Ok(delivery)
    }

    async fn flush(&self) -> NotifyResult<FlushReport> {
        let mut report = FlushReport::default();
        for queued in self.queued().await? {
            let mail = OutgoingMail {
                to: queued.recipient,
                subject: queued.subject,
                body: queued.body,
            };
            match self.transport.send(&mail).await {
                Ok(()) => {
                    sqlx::query("DELETE FROM email_queue WHERE id = ?")
                        .bind(queued.id)
                        .execute(&self.db)
                        .await?;
                    report.sent += 1;
                }
                Err(err) => {
                    warn!("queued message {} for {} still failing: {}", queued.id, mail.to, err);
                    sqlx::query(
                        "UPDATE email_queue SET attempts = attempts + 1, last_error = ? WHERE id = ?",
                    )
                    .bind(err.to_string())
                    .bind(queued.id)
                    .execute(&self.db)
                    .await?;
                    report.still_queued += 1;
                }
            }
        }
        info!(
            "queue flush: {} sent, {} still queued",
            report.sent, report.still_queued
        );
        Ok(report)
    }
}

/// Filesystem path behind a `sqlite:` URL, if it names a file.
fn sqlite_file(url: &str) -> Option<&Path> {
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() || path.starts_with(":memory:") {
        None
    } else {
        Some(Path::new(path))
    }
}
