pub mod accounts;
pub mod git_hosting;
pub mod lifecycle;
pub mod locks;
pub mod notifier;
pub mod provisioning_saga;
pub mod rollback_log;
pub mod ssh_keys;
pub mod tenant_store;
pub mod validator;

use crate::{
    config::AppConfig,
    models::notification::{Delivery, Notice},
    services::{
        accounts::{AccountProvisioner, SystemAccounts},
        git_hosting::{GitHosting, GiteaClient},
        locks::LockManager,
        notifier::{Notifier, QueuedNotifier},
        tenant_store::TenantStore,
    },
};
use anyhow::{Context, Result};
use std::{fmt, sync::Arc};
use tracing::{info, warn};

/// Everything an operation needs, wired once per invocation.
///
/// Git hosting and notifications are optional capabilities: `None` means the
/// deployment runs without them and the corresponding steps are skipped.
#[derive(Clone)]
pub struct TenantServices {
    pub config: Arc<AppConfig>,
    pub store: TenantStore,
    pub locks: LockManager,
    pub accounts: Arc<dyn AccountProvisioner>,
    pub git: Option<Arc<dyn GitHosting>>,
    pub notifier: Option<Arc<dyn Notifier>>,
}

/// Result of a best-effort notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NotificationOutcome {
    Delivered(Delivery),
    /// No notifier configured.
    Disabled,
    /// Dry-run: nothing was sent.
    Skipped,
    Failed(String),
}

impl fmt::Display for NotificationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationOutcome::Delivered(Delivery::Sent) => f.write_str("sent"),
            NotificationOutcome::Delivered(Delivery::Suppressed) => {
                f.write_str("suppressed (cooldown)")
            }
            NotificationOutcome::Delivered(Delivery::Queued) => f.write_str("queued for retry"),
            NotificationOutcome::Disabled => f.write_str("disabled"),
            NotificationOutcome::Skipped => f.write_str("skipped (dry-run)"),
            NotificationOutcome::Failed(err) => write!(f, "failed: {}", err),
        }
    }
}

impl TenantServices {
    pub fn new(
        config: AppConfig,
        accounts: Arc<dyn AccountProvisioner>,
        git: Option<Arc<dyn GitHosting>>,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Self {
        Self {
            store: TenantStore::new(&config.layout.tenants_dir),
            locks: LockManager::new(&config.layout.lock_dir),
            config: Arc::new(config),
            accounts,
            git,
            notifier,
        }
    }

    /// Wire the production collaborators described by `config`.
    pub async fn bootstrap(config: AppConfig) -> Result<Self> {
        let accounts = Arc::new(SystemAccounts::new(
            config.layout.clone(),
            config.uid_pool,
            config.sftp_group.clone(),
            config.nologin_shell.clone(),
        ));

        let git: Option<Arc<dyn GitHosting>> = match &config.gitea {
            Some(gitea) => {
                let client = GiteaClient::new(gitea).context("configuring Git hosting")?;
                info!("Git hosting enabled: {} (org {})", gitea.url, gitea.org);
                Some(Arc::new(client))
            }
            None => {
                info!("Git hosting not configured; repository steps are skipped");
                None
            }
        };

        let notifier: Option<Arc<dyn Notifier>> = match &config.notify {
            Some(notify) => {
                let queued = QueuedNotifier::connect(notify)
                    .await
                    .with_context(|| format!("opening notification queue {}", notify.database_url))?;
                Some(Arc::new(queued))
            }
            None => None,
        };

        Ok(Self::new(config, accounts, git, notifier))
    }

    pub fn dry_run(&self) -> bool {
        self.config.dry_run
    }

    /// Send a notice without ever failing the caller.
    pub async fn notify(&self, notice: &Notice) -> NotificationOutcome {
        if self.dry_run() {
            info!(
                "[dry-run] would notify {}: [{}] {}",
                notice.recipient, notice.severity, notice.subject
            );
            return NotificationOutcome::Skipped;
        }
        let Some(notifier) = &self.notifier else {
            return NotificationOutcome::Disabled;
        };
        match notifier.notify(notice).await {
            Ok(delivery) => NotificationOutcome::Delivered(delivery),
            Err(err) => {
                warn!("notification to {} failed: {}", notice.recipient, err);
                NotificationOutcome::Failed(err.to_string())
            }
        }
    }
}
