//! Lifecycle operations on existing tenants.
//!
//! Every entry point re-validates its input, takes the tenant lock and reads
//! the record before touching anything. Notifications are best-effort.
//! Deletion is a forward-only teardown: each step is attempted even when an
//! earlier one failed, and the report lists what was left behind.

use crate::{
    models::{
        notification::{Notice, Severity},
        tenant::{Tenant, TenantPaths, TenantStatus},
    },
    services::{
        NotificationOutcome, TenantServices,
        accounts::{AccountError, AccountState},
        locks::LockError,
        provisioning_saga::remove_symlink,
        ssh_keys::{AuthorizedKey, KeyError},
        tenant_store::{StoreError, TenantField},
        validator::{self, ValidationError},
    },
};
use std::{fmt, io::ErrorKind, path::PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("invalid SSH public key: {0}")]
    InvalidKey(#[from] KeyError),
    #[error("tenant `{0}` not found")]
    NotFound(String),
    #[error("deleting `{0}` requires explicit confirmation (--confirm-delete)")]
    ConfirmationRequired(String),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Store(StoreError),
    #[error("account operation for `{name}` failed: {source}")]
    Account {
        name: String,
        #[source]
        source: AccountError,
    },
    #[error("teardown of `{name}` incomplete: {}", .report.failures().join("; "))]
    TeardownIncomplete { name: String, report: TeardownReport },
}

impl From<StoreError> for LifecycleError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(name) => LifecycleError::NotFound(name),
            other => LifecycleError::Store(other),
        }
    }
}

/// Result of a field-level lifecycle operation.
#[derive(Debug)]
pub struct Updated {
    /// The record as stored (or as it would be, under dry-run).
    pub tenant: Tenant,
    /// False when the tenant already had the requested value.
    pub changed: bool,
    pub notifications: Vec<NotificationOutcome>,
}

#[derive(Debug)]
pub struct KeyRotated {
    pub tenant: Tenant,
    pub sha256: String,
    pub md5: String,
    pub notification: NotificationOutcome,
}

/// Everything `info` reports about a tenant.
#[derive(Debug)]
pub struct TenantInfo {
    pub tenant: Tenant,
    pub paths: TenantPaths,
    pub account: Option<AccountState>,
    /// Disk usage of the upload directory, in KB.
    pub usage_kb: Option<u64>,
    pub clone_url: Option<String>,
    pub authorized_keys: PathBuf,
}

/// Deletion steps, in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TeardownStep {
    Notify,
    RemoveSymlink,
    RemoveCollaborator,
    RemoveRemoteUser,
    RemoveRemoteRepo,
    RemoveChroot,
    RemoveAccount,
    RemoveRecord,
}

impl TeardownStep {
    pub const ALL: [TeardownStep; 8] = [
        TeardownStep::Notify,
        TeardownStep::RemoveSymlink,
        TeardownStep::RemoveCollaborator,
        TeardownStep::RemoveRemoteUser,
        TeardownStep::RemoveRemoteRepo,
        TeardownStep::RemoveChroot,
        TeardownStep::RemoveAccount,
        TeardownStep::RemoveRecord,
    ];

    fn is_remote(self) -> bool {
        matches!(
            self,
            TeardownStep::RemoveCollaborator
                | TeardownStep::RemoveRemoteUser
                | TeardownStep::RemoveRemoteRepo
        )
    }
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TeardownStep::Notify => "notify tenant",
            TeardownStep::RemoveSymlink => "remove web symlink",
            TeardownStep::RemoveCollaborator => "remove remote collaborator",
            TeardownStep::RemoveRemoteUser => "remove remote user",
            TeardownStep::RemoveRemoteRepo => "remove remote repository",
            TeardownStep::RemoveChroot => "remove chroot",
            TeardownStep::RemoveAccount => "remove OS account",
            TeardownStep::RemoveRecord => "remove tenant record",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Done,
    Skipped(&'static str),
    Failed(String),
}

#[derive(Clone, Debug, Default)]
pub struct TeardownReport {
    pub steps: Vec<(TeardownStep, StepOutcome)>,
    pub dry_run: bool,
}

impl TeardownReport {
    /// Failed steps, notification excluded: a missed goodbye leaves no residue.
    pub fn failures(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|(step, _)| *step != TeardownStep::Notify)
            .filter_map(|(step, outcome)| match outcome {
                StepOutcome::Failed(err) => Some(format!("{}: {}", step, err)),
                _ => None,
            })
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.failures().is_empty()
    }

    pub fn outcome(&self, step: TeardownStep) -> Option<&StepOutcome> {
        self.steps.iter().find(|(s, _)| *s == step).map(|(_, o)| o)
    }
}

impl TenantServices {
    pub async fn disable(&self, name: &str) -> Result<Updated, LifecycleError> {
        self.set_status(name, TenantStatus::Disabled).await
    }

    pub async fn enable(&self, name: &str) -> Result<Updated, LifecycleError> {
        self.set_status(name, TenantStatus::Active).await
    }

    async fn set_status(&self, name: &str, status: TenantStatus) -> Result<Updated, LifecycleError> {
        validator::validate_name(name)?;
        let _lock = self.locks.tenant(name)?;
        let mut tenant = self.store.read(name).await?;

        if tenant.status == status {
            info!("tenant {} is already {}", name, status);
            return Ok(Updated {
                tenant,
                changed: false,
                notifications: Vec::new(),
            });
        }

        if self.dry_run() {
            info!("[dry-run] would set tenant {} to {}", name, status);
            tenant.status = status;
        } else {
            let account = match status {
                TenantStatus::Disabled => self.accounts.lock(&tenant.sftp_username).await,
                TenantStatus::Active => self.accounts.unlock(&tenant.sftp_username).await,
            };
            account.map_err(|source| LifecycleError::Account {
                name: name.to_string(),
                source,
            })?;
            tenant = self
                .store
                .update_field(name, TenantField::Status(status))
                .await?;
            info!("tenant {} is now {}", name, status);
        }

        let notice = match status {
            TenantStatus::Disabled => Notice::to_tenant(
                &tenant,
                Severity::Warning,
                format!("Tenant {} disabled", name),
                "Your upload account has been disabled. Uploads and logins are refused \
                 until the account is re-enabled by the administrator.\n",
            ),
            TenantStatus::Active => Notice::to_tenant(
                &tenant,
                Severity::Info,
                format!("Tenant {} enabled", name),
                "Your upload account is active again.\n",
            ),
        };
        let notification = self.notify(&notice).await;

        Ok(Updated {
            tenant,
            changed: true,
            notifications: vec![notification],
        })
    }

    pub async fn update_quota(&self, name: &str, quota_kb: u64) -> Result<Updated, LifecycleError> {
        validator::validate_name(name)?;
        let quota_kb = validator::validate_quota_kb(quota_kb)?;
        let _lock = self.locks.tenant(name)?;
        let mut tenant = self.store.read(name).await?;
        let previous_mb = tenant.quota_mb();

        if self.dry_run() {
            info!("[dry-run] would set quota of {} to {} KB", name, quota_kb);
            tenant.quota_kb = quota_kb;
        } else {
            tenant = self
                .store
                .update_field(name, TenantField::QuotaKb(quota_kb))
                .await?;
            info!("quota of {} set to {} KB", name, quota_kb);
        }

        let notice = Notice::to_tenant(
            &tenant,
            Severity::Info,
            format!("Quota for {} updated", name),
            format!(
                "Your upload quota changed from {} MB to {} MB.\n",
                previous_mb,
                tenant.quota_mb()
            ),
        )
        .dedup(
            format!("quota-{}-{}", name, tenant.quota_kb),
            self.config.notify_cooldown,
        );
        let notification = self.notify(&notice).await;
        Ok(Updated {
            tenant,
            changed: true,
            notifications: vec![notification],
        })
    }

    /// Change the contact address. Both the old and the new address hear
    /// about it.
    pub async fn update_email(&self, name: &str, email: &str) -> Result<Updated, LifecycleError> {
        validator::validate_name(name)?;
        validator::validate_email(email)?;
        let _lock = self.locks.tenant(name)?;
        let mut tenant = self.store.read(name).await?;
        let previous = tenant.email.clone();

        if previous == email {
            return Ok(Updated {
                tenant,
                changed: false,
                notifications: Vec::new(),
            });
        }

        if self.dry_run() {
            info!("[dry-run] would change contact of {} to {}", name, email);
            tenant.email = email.to_string();
        } else {
            tenant = self
                .store
                .update_field(name, TenantField::Email(email.to_string()))
                .await?;
            info!("contact of {} changed from {} to {}", name, previous, email);
        }

        let subject = format!("Contact address for {} changed", name);
        let body = format!(
            "The contact address of tenant `{}` changed from {} to {}.\n\
             If you did not request this, contact the administrator.\n",
            name, previous, email
        );
        let old = Notice::to_address(name, &previous, Severity::Warning, &subject, &body);
        let new = Notice::to_tenant(&tenant, Severity::Info, subject, body);
        let notifications = vec![self.notify(&old).await, self.notify(&new).await];

        Ok(Updated {
            tenant,
            changed: true,
            notifications,
        })
    }

    /// Replace the tenant's authorized key and record its fingerprint.
    pub async fn rotate_ssh_key(
        &self,
        name: &str,
        public_key: &str,
    ) -> Result<KeyRotated, LifecycleError> {
        validator::validate_name(name)?;
        let key = AuthorizedKey::parse(public_key)?;
        let sha256 = key.fingerprint_sha256();
        let md5 = key.fingerprint_md5();

        let _lock = self.locks.tenant(name)?;
        let mut tenant = self.store.read(name).await?;

        if self.dry_run() {
            info!("[dry-run] would install {} key {} for {}", key.algorithm(), sha256, name);
            tenant.ssh_key_fingerprint = Some(sha256.clone());
        } else {
            self.accounts
                .install_authorized_key(&tenant.sftp_username, &key)
                .await
                .map_err(|source| LifecycleError::Account {
                    name: name.to_string(),
                    source,
                })?;
            tenant = self
                .store
                .update_field(name, TenantField::SshKeyFingerprint(Some(sha256.clone())))
                .await?;
        }

        let notice = Notice::to_tenant(
            &tenant,
            Severity::Info,
            format!("SSH key for {} rotated", name),
            format!(
                "A new {} key is now authorized for your upload account.\n\n\
                 Fingerprint: {}\n\
                 Legacy:      {}\n\n\
                 The previous key no longer grants access.\n",
                key.algorithm(),
                sha256,
                md5
            ),
        )
        .dedup(format!("ssh-key-{}-{}", name, sha256), self.config.notify_cooldown);
        let notification = self.notify(&notice).await;

        Ok(KeyRotated {
            tenant,
            sha256,
            md5,
            notification,
        })
    }

    /// Read-only summary of a tenant.
    pub async fn info(&self, name: &str) -> Result<TenantInfo, LifecycleError> {
        validator::validate_name(name)?;
        let tenant = self.store.read(name).await?;
        let paths = tenant.paths(&self.config.layout);

        let account = match self.accounts.account_state(&tenant.sftp_username).await {
            Ok(state) => Some(state),
            Err(err) => {
                warn!("cannot read account state of {}: {}", tenant.sftp_username, err);
                None
            }
        };
        let usage_kb = match disk_usage(&paths.upload_dir).await {
            Ok(bytes) => Some(bytes.div_ceil(1024)),
            Err(err) => {
                warn!("cannot measure {}: {}", paths.upload_dir.display(), err);
                None
            }
        };

        Ok(TenantInfo {
            clone_url: self.git.as_ref().map(|git| git.clone_url(tenant.repo_name())),
            authorized_keys: self.config.layout.authorized_keys_file(&tenant.sftp_username),
            tenant,
            paths,
            account,
            usage_kb,
        })
    }

    /// Tear a tenant down. `confirmed` must come from the caller explicitly.
    pub async fn delete(&self, name: &str, confirmed: bool) -> Result<TeardownReport, LifecycleError> {
        validator::validate_name(name)?;
        if !confirmed {
            return Err(LifecycleError::ConfirmationRequired(name.to_string()));
        }
        let _lock = self.locks.tenant(name)?;
        let tenant = self.store.read(name).await?;

        let mut report = TeardownReport {
            steps: Vec::with_capacity(TeardownStep::ALL.len()),
            dry_run: self.dry_run(),
        };
        for step in TeardownStep::ALL {
            let outcome = if step.is_remote() && self.git.is_none() {
                StepOutcome::Skipped("Git hosting disabled")
            } else if self.dry_run() && step != TeardownStep::Notify {
                info!("[dry-run] would {} for {}", step, name);
                StepOutcome::Skipped("dry-run")
            } else {
                self.teardown_step(step, &tenant).await
            };
            if let StepOutcome::Failed(err) = &outcome {
                warn!("delete {}: {} failed: {}", name, step, err);
            }
            report.steps.push((step, outcome));
        }

        if report.is_complete() {
            info!("tenant {} deleted", name);
            Ok(report)
        } else {
            Err(LifecycleError::TeardownIncomplete {
                name: name.to_string(),
                report,
            })
        }
    }

    async fn teardown_step(&self, step: TeardownStep, tenant: &Tenant) -> StepOutcome {
        let paths = tenant.paths(&self.config.layout);
        let repo = tenant.repo_name();
        let result: Result<(), String> = match (step, &self.git) {
            (TeardownStep::Notify, _) => {
                let notice = Notice::to_tenant(
                    tenant,
                    Severity::Warning,
                    format!("Tenant {} is being deleted", tenant.name),
                    "Your tenant account, uploaded content and repository are being removed.\n",
                );
                match self.notify(&notice).await {
                    NotificationOutcome::Failed(err) => Err(err),
                    NotificationOutcome::Disabled => {
                        return StepOutcome::Skipped("notifications disabled");
                    }
                    NotificationOutcome::Skipped => return StepOutcome::Skipped("dry-run"),
                    _ => Ok(()),
                }
            }
            (TeardownStep::RemoveSymlink, _) => {
                remove_symlink(&paths.web_link).await.map_err(|e| e.to_string())
            }
            (TeardownStep::RemoveCollaborator, Some(git)) => git
                .collaborator_remove(repo, &tenant.gitea_username)
                .await
                .map_err(|e| e.to_string()),
            (TeardownStep::RemoveRemoteUser, Some(git)) => git
                .user_delete(&tenant.gitea_username)
                .await
                .map_err(|e| e.to_string()),
            (TeardownStep::RemoveRemoteRepo, Some(git)) => {
                git.repo_delete(repo).await.map_err(|e| e.to_string())
            }
            (TeardownStep::RemoveChroot, _) => self
                .accounts
                .delete_chroot(&tenant.sftp_username)
                .await
                .map_err(|e| e.to_string()),
            (TeardownStep::RemoveAccount, _) => self
                .accounts
                .delete_account(&tenant.sftp_username)
                .await
                .map_err(|e| e.to_string()),
            (TeardownStep::RemoveRecord, _) => match self.store.remove(&tenant.name).await {
                Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
                Err(err) => Err(err.to_string()),
            },
            (_, None) => return StepOutcome::Skipped("Git hosting disabled"),
        };
        match result {
            Ok(()) => {
                info!("delete {}: {}", tenant.name, step);
                StepOutcome::Done
            }
            Err(err) => StepOutcome::Failed(err),
        }
    }
}

/// Apparent size of every regular file below `root`, in bytes.
/// Symlinks are not followed. A missing root counts as empty.
pub async fn disk_usage(root: &std::path::Path) -> std::io::Result<u64> {
    let mut total = 0u64;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        };
        while let Some(entry) = entries.next_entry().await? {
            let meta = fs::symlink_metadata(entry.path()).await?;
            if meta.is_dir() {
                pending.push(entry.path());
            } else if meta.is_file() {
                total += meta.len();
            }
        }
    }
    Ok(total)
}
