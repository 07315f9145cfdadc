//! Provisioning Saga: tenant creation as ten ordered steps with typed
//! compensations.
//!
//! Before step *k* runs, the compensations of steps 1..k-1 are already in the
//! rollback log. When a step fails, the logged compensations run in reverse
//! order, any placeholder record is purged and a single [`ProvisioningError`]
//! describes the failing step and every compensation outcome. Steps are never
//! retried here.

use crate::{
    models::{
        notification::{Notice, Severity},
        tenant::Tenant,
    },
    services::{
        NotificationOutcome, TenantServices,
        accounts::AccountError,
        git_hosting::Permission,
        locks::LockError,
        rollback_log::{Compensation, LogError, RollbackLog, Step},
        tenant_store::StoreError,
        validator::{self, ValidationError},
    },
};
use rand::{Rng, distr::Alphanumeric};
use std::{
    error::Error as StdError,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::fs;
use tracing::{error, info, warn};

const PASSWORD_LEN: usize = 24;

type BoxError = Box<dyn StdError + Send + Sync>;

/// Input of a creation attempt. `quota_kb` falls back to the configured default.
#[derive(Clone, Debug)]
pub struct CreateRequest {
    pub name: String,
    pub email: String,
    pub quota_kb: Option<u64>,
}

/// A successfully provisioned (or, under dry-run, planned) tenant.
#[derive(Debug)]
pub struct Provisioned {
    pub tenant: Tenant,
    /// Issued once for the OS account and the remote user; never persisted.
    pub password: String,
    pub clone_url: Option<String>,
    pub notification: NotificationOutcome,
    pub log_path: Option<PathBuf>,
    pub dry_run: bool,
}

/// What happened to one compensation during rollback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompensationOutcome {
    pub compensation: Compensation,
    pub error: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("tenant `{0}` already exists")]
    AlreadyExists(String),
    #[error("cannot provision `{name}`: {source}")]
    UidExhausted {
        name: String,
        #[source]
        source: AccountError,
    },
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("cannot start provisioning: {0}")]
    Log(#[from] LogError),
    #[error("provisioning `{name}` failed at {step}: {source}; {}", summarize(.compensations))]
    StepFailed {
        name: String,
        step: Step,
        #[source]
        source: BoxError,
        compensations: Vec<CompensationOutcome>,
        log_path: Option<PathBuf>,
    },
}

impl ProvisioningError {
    /// True unless a compensation itself failed and left residue behind.
    pub fn fully_compensated(&self) -> bool {
        match self {
            ProvisioningError::StepFailed { compensations, .. } => {
                compensations.iter().all(|c| c.error.is_none())
            }
            _ => true,
        }
    }
}

fn summarize(compensations: &[CompensationOutcome]) -> String {
    let failed = compensations.iter().filter(|c| c.error.is_some()).count();
    match (compensations.len(), failed) {
        (0, _) => "nothing to roll back".to_string(),
        (n, 0) => format!("rolled back {} step(s)", n),
        (n, f) => format!("{} of {} compensation(s) FAILED, manual cleanup required", f, n),
    }
}

/// Failure of a step: which step, and why.
struct StepFault {
    step: Step,
    source: BoxError,
}

fn fault<E>(step: Step) -> impl FnOnce(E) -> StepFault
where
    E: StdError + Send + Sync + 'static,
{
    move |err| StepFault {
        step,
        source: Box::new(err),
    }
}

/// 24 alphanumeric characters from the thread-local CSPRNG.
pub fn generate_password() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LEN)
        .map(char::from)
        .collect()
}

impl TenantServices {
    /// Create a tenant. See the module docs for the rollback contract.
    pub async fn create(&self, request: CreateRequest) -> Result<Provisioned, ProvisioningError> {
        let CreateRequest {
            name,
            email,
            quota_kb,
        } = request;
        validator::validate_name(&name)?;
        validator::validate_email(&email)?;
        let quota_kb =
            validator::validate_quota_kb(quota_kb.unwrap_or(self.config.default_quota_kb))?;

        let _tenant_lock = self.locks.tenant(&name)?;
        if self.store.exists(&name).await {
            return Err(ProvisioningError::AlreadyExists(name));
        }
        let _pool_lock = self.locks.uid_pool()?;

        let password = generate_password();
        let mut log = if self.dry_run() {
            RollbackLog::in_memory()
        } else {
            RollbackLog::create(&self.config.layout.ops_log_dir, &name).await?
        };
        info!(
            "provisioning tenant {} <{}> with quota {} KB{}",
            name,
            email,
            quota_kb,
            if self.dry_run() { " [dry-run]" } else { "" }
        );

        // Step 1 has no compensation; exhaustion aborts before any mutation.
        let uid = match self.accounts.allocate_uid().await {
            Ok(uid) => uid,
            Err(err) => {
                if let Err(log_err) = log.failed(Step::AllocateUid, &err.to_string()).await {
                    warn!("{}", log_err);
                }
                self.finish(&mut log, "aborted").await;
                return Err(match err {
                    AccountError::ExhaustedRange { .. } => {
                        ProvisioningError::UidExhausted { name, source: err }
                    }
                    other => ProvisioningError::StepFailed {
                        name,
                        step: Step::AllocateUid,
                        source: Box::new(other),
                        compensations: Vec::new(),
                        log_path: log.path().map(PathBuf::from),
                    },
                });
            }
        };
        let tenant = Tenant::new(&name, &email, uid, quota_kb);
        if let Err(err) = log.committed(Step::AllocateUid, None).await {
            return Err(self.roll_back(&name, &mut log, StepFault {
                step: Step::AllocateUid,
                source: Box::new(err),
            })
            .await);
        }
        info!("{}: uid {}", Step::AllocateUid, uid);

        if self.dry_run() {
            return Ok(self.plan(tenant, password));
        }

        match self.run_steps(&tenant, &password, &mut log).await {
            Ok(()) => {}
            Err(failure) => return Err(self.roll_back(&name, &mut log, failure).await),
        }

        let notification = self.welcome(&tenant).await;
        match &notification {
            NotificationOutcome::Failed(err) => {
                warn!("{} failed (tenant stays provisioned): {}", Step::Notify, err);
                if let Err(log_err) = log.failed(Step::Notify, err).await {
                    warn!("{}", log_err);
                }
            }
            _ => {
                if let Err(log_err) = log.committed(Step::Notify, None).await {
                    warn!("{}", log_err);
                }
            }
        }
        self.finish(&mut log, "provisioned").await;
        info!("tenant {} provisioned (uid {})", tenant.name, tenant.sftp_uid);

        Ok(Provisioned {
            clone_url: self.git.as_ref().map(|git| git.clone_url(tenant.repo_name())),
            tenant,
            password,
            notification,
            log_path: log.path().map(PathBuf::from),
            dry_run: false,
        })
    }

    /// Steps 2..9. Each committed step appends its compensation before the
    /// next one starts.
    async fn run_steps(
        &self,
        tenant: &Tenant,
        password: &str,
        log: &mut RollbackLog,
    ) -> Result<(), StepFault> {
        let name = tenant.name.as_str();
        let paths = tenant.paths(&self.config.layout);

        self.accounts
            .create_account(&tenant.sftp_username, &tenant.email, password, tenant.sftp_uid)
            .await
            .map_err(fault(Step::CreateAccount))?;
        commit(
            log,
            Step::CreateAccount,
            Some(Compensation::DeleteOsAccount {
                username: tenant.sftp_username.clone(),
            }),
        )
        .await?;

        self.accounts
            .create_chroot(&tenant.sftp_username)
            .await
            .map_err(fault(Step::CreateChroot))?;
        commit(
            log,
            Step::CreateChroot,
            Some(Compensation::RemoveChroot {
                username: tenant.sftp_username.clone(),
                path: paths.sftp_home.clone(),
            }),
        )
        .await?;

        if let Some(git) = &self.git {
            let repo = tenant.repo_name();

            git.repo_create(repo)
                .await
                .map_err(fault(Step::CreateRepo))?;
            commit(
                log,
                Step::CreateRepo,
                Some(Compensation::DeleteRemoteRepo {
                    repo: repo.to_string(),
                }),
            )
            .await?;

            git.user_create(&tenant.gitea_username, &tenant.email, password)
                .await
                .map_err(fault(Step::CreateRemoteUser))?;
            commit(
                log,
                Step::CreateRemoteUser,
                Some(Compensation::DeleteRemoteUser {
                    username: tenant.gitea_username.clone(),
                }),
            )
            .await?;

            git.collaborator_add(repo, &tenant.gitea_username, Permission::Read)
                .await
                .map_err(fault(Step::AddCollaborator))?;
            commit(
                log,
                Step::AddCollaborator,
                Some(Compensation::RemoveCollaborator {
                    repo: repo.to_string(),
                    username: tenant.gitea_username.clone(),
                }),
            )
            .await?;

            // Covered by the repository compensation.
            git.repo_initialize(repo, name, &tenant.email)
                .await
                .map_err(fault(Step::InitializeRepo))?;
            commit(log, Step::InitializeRepo, None).await?;
        } else {
            info!("Git hosting disabled: skipping steps 4-7 for {}", name);
        }

        create_symlink(&paths.upload_dir, &paths.web_link)
            .await
            .map_err(fault(Step::CreateSymlink))?;
        commit(
            log,
            Step::CreateSymlink,
            Some(Compensation::RemoveSymlink {
                path: paths.web_link.clone(),
            }),
        )
        .await?;

        // The record compensation is pushed only after the write lands; a
        // partial write is caught by the placeholder purge.
        self.store
            .write(tenant)
            .await
            .map_err(fault(Step::PersistRecord))?;
        commit(
            log,
            Step::PersistRecord,
            Some(Compensation::DeleteRecord {
                name: name.to_string(),
            }),
        )
        .await?;

        Ok(())
    }

    /// Run every logged compensation, last committed first, then purge any
    /// placeholder record.
    async fn roll_back(
        &self,
        name: &str,
        log: &mut RollbackLog,
        failure: StepFault,
    ) -> ProvisioningError {
        error!("{} failed for {}: {}", failure.step, name, failure.source);
        if let Err(err) = log.failed(failure.step, &failure.source.to_string()).await {
            warn!("{}", err);
        }

        let mut outcomes = Vec::new();
        for compensation in log.drain_reversed() {
            let result = self.compensate(&compensation).await;
            let error = result.err().map(|err| err.to_string());
            match &error {
                None => info!("compensated: {}", compensation),
                Some(err) => error!("compensation `{}` failed: {}", compensation, err),
            }
            if let Err(err) = log.compensated(&compensation, error.as_deref()).await {
                warn!("{}", err);
            }
            outcomes.push(CompensationOutcome {
                compensation,
                error,
            });
        }

        if self.store.exists(name).await {
            let purge = Compensation::DeleteRecord {
                name: name.to_string(),
            };
            let error = self.compensate(&purge).await.err().map(|e| e.to_string());
            if let Err(err) = log.compensated(&purge, error.as_deref()).await {
                warn!("{}", err);
            }
            outcomes.push(CompensationOutcome {
                compensation: purge,
                error,
            });
        }

        let outcome = if outcomes.iter().all(|c| c.error.is_none()) {
            "rolled_back"
        } else {
            "rollback_incomplete"
        };
        self.finish(log, outcome).await;

        ProvisioningError::StepFailed {
            name: name.to_string(),
            step: failure.step,
            source: failure.source,
            compensations: outcomes,
            log_path: log.path().map(PathBuf::from),
        }
    }

    /// Execute one compensation. Targets that are already gone count as done.
    async fn compensate(&self, compensation: &Compensation) -> Result<(), BoxError> {
        match compensation {
            Compensation::DeleteOsAccount { username } => {
                self.accounts.delete_account(username).await?
            }
            Compensation::RemoveChroot { username, .. } => {
                self.accounts.delete_chroot(username).await?
            }
            Compensation::DeleteRemoteRepo { repo } => {
                if let Some(git) = &self.git {
                    git.repo_delete(repo).await?;
                }
            }
            Compensation::DeleteRemoteUser { username } => {
                if let Some(git) = &self.git {
                    git.user_delete(username).await?;
                }
            }
            Compensation::RemoveCollaborator { repo, username } => {
                if let Some(git) = &self.git {
                    git.collaborator_remove(repo, username).await?;
                }
            }
            Compensation::RemoveSymlink { path } => remove_symlink(path).await?,
            Compensation::DeleteRecord { name } => match self.store.remove(name).await {
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(err) => return Err(Box::new(err)),
            },
        }
        Ok(())
    }

    /// Dry-run result: steps 2..10 are only described.
    fn plan(&self, tenant: Tenant, password: String) -> Provisioned {
        let paths = tenant.paths(&self.config.layout);
        for step in Step::ALL.into_iter().skip(1) {
            if step.is_remote() && self.git.is_none() {
                info!("[dry-run] {}: skipped, Git hosting disabled", step);
                continue;
            }
            let detail = match step {
                Step::CreateAccount => format!(
                    "would create OS account {} (uid {}, group {})",
                    tenant.sftp_username, tenant.sftp_uid, self.config.sftp_group
                ),
                Step::CreateChroot => format!(
                    "would create chroot {} with upload dir {}",
                    paths.sftp_home.display(),
                    paths.upload_dir.display()
                ),
                Step::CreateRepo => format!("would create remote repository {}", tenant.repo_name()),
                Step::CreateRemoteUser => {
                    format!("would create remote user {}", tenant.gitea_username)
                }
                Step::AddCollaborator => format!(
                    "would grant {} read access to {}",
                    tenant.gitea_username,
                    tenant.repo_name()
                ),
                Step::InitializeRepo => "would commit initial README".to_string(),
                Step::CreateSymlink => format!(
                    "would link {} -> {}",
                    paths.web_link.display(),
                    paths.upload_dir.display()
                ),
                Step::PersistRecord => format!(
                    "would write record under {}",
                    self.store.root().join(&tenant.name).display()
                ),
                Step::Notify => format!("would notify {}", tenant.email),
                Step::AllocateUid => continue,
            };
            info!("[dry-run] {}: {}", step, detail);
        }

        Provisioned {
            clone_url: self.git.as_ref().map(|git| git.clone_url(tenant.repo_name())),
            tenant,
            password,
            notification: NotificationOutcome::Skipped,
            log_path: None,
            dry_run: true,
        }
    }

    async fn welcome(&self, tenant: &Tenant) -> NotificationOutcome {
        let paths = tenant.paths(&self.config.layout);
        let mut body = format!(
            "Your tenant `{}` is ready.\n\n\
             SFTP user:      {}\n\
             Upload folder:  {}\n\
             Quota:          {} MB\n",
            tenant.name,
            tenant.sftp_username,
            paths.upload_dir.display(),
            tenant.quota_mb(),
        );
        if let Some(git) = &self.git {
            body.push_str(&format!(
                "Repository:     {} (read-only)\n",
                git.clone_url(tenant.repo_name())
            ));
        }
        body.push_str("\nYour password is handed over separately by the administrator.\n");

        let notice = Notice::to_tenant(
            tenant,
            Severity::Info,
            format!("Tenant {} provisioned", tenant.name),
            body,
        );
        self.notify(&notice).await
    }

    async fn finish(&self, log: &mut RollbackLog, outcome: &str) {
        if let Err(err) = log.finished(outcome).await {
            warn!("{}", err);
        }
    }
}

async fn commit(
    log: &mut RollbackLog,
    step: Step,
    compensation: Option<Compensation>,
) -> Result<(), StepFault> {
    log.committed(step, compensation)
        .await
        .map_err(fault(step))?;
    info!("{}: done", step);
    Ok(())
}

/// Expose the upload directory under the web root.
async fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::symlink(target, link).await
}

/// Remove `path` if it is a symlink. Anything else is left alone.
pub(crate) async fn remove_symlink(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path).await {
        Ok(meta) if meta.file_type().is_symlink() => fs::remove_file(path).await,
        Ok(_) => Err(io::Error::new(
            ErrorKind::AlreadyExists,
            format!("{} is not a symlink; refusing to remove it", path.display()),
        )),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
