//! Represents a provisioned tenant: an upload account, a chrooted home,
//! a remote content repository and the persisted record tying them together.

use crate::config::Layout;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, str::FromStr};

/// Lifecycle status of a tenant.
///
/// A tenant only ever moves between `Active` and `Disabled` while it exists;
/// creation always starts at `Active`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Disabled,
}

impl fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TenantStatus::Active => f.write_str("active"),
            TenantStatus::Disabled => f.write_str("disabled"),
        }
    }
}

impl FromStr for TenantStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(TenantStatus::Active),
            "disabled" => Ok(TenantStatus::Disabled),
            other => Err(format!("unknown tenant status `{}`", other)),
        }
    }
}

/// Status filter accepted by `list`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum StatusFilter {
    #[default]
    All,
    Active,
    Disabled,
}

impl StatusFilter {
    pub fn matches(self, status: TenantStatus) -> bool {
        match self {
            StatusFilter::All => true,
            StatusFilter::Active => status == TenantStatus::Active,
            StatusFilter::Disabled => status == TenantStatus::Disabled,
        }
    }
}

/// The persisted tenant record.
///
/// `name`, `sftp_username`, `sftp_uid` and `gitea_username` never change
/// after creation. Every mutation goes through [`Tenant::touch`] so that
/// `updated_at` always advances.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Tenant {
    /// Unique tenant identifier (validated, lowercase).
    pub name: String,

    /// Contact address for notifications.
    pub email: String,

    pub status: TenantStatus,

    /// OS upload account, derived 1:1 from `name`.
    pub sftp_username: String,

    /// Numeric identity allocated from the configured uid pool.
    pub sftp_uid: u32,

    /// Account on the Git hosting service, derived from `name`.
    pub gitea_username: String,

    /// Upload quota in kilobytes.
    pub quota_kb: u64,

    /// SHA256 fingerprint of the currently installed SSH key, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_fingerprint: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    /// Build a fresh, active tenant record. Nothing is persisted here.
    pub fn new(name: &str, email: &str, sftp_uid: u32, quota_kb: u64) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            email: email.to_string(),
            status: TenantStatus::Active,
            sftp_username: name.to_string(),
            sftp_uid,
            gitea_username: name.to_string(),
            quota_kb,
            ssh_key_fingerprint: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Refresh `updated_at`, guaranteeing it moves strictly forward even when
    /// the clock resolution would produce an identical timestamp.
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + Duration::microseconds(1)
        };
    }

    pub fn is_active(&self) -> bool {
        self.status == TenantStatus::Active
    }

    /// Quota expressed in whole megabytes.
    pub fn quota_mb(&self) -> u64 {
        self.quota_kb / 1024
    }

    /// Repository name on the Git hosting service.
    pub fn repo_name(&self) -> &str {
        &self.name
    }

    /// Filesystem locations derived from the tenant name and base directories.
    pub fn paths(&self, layout: &Layout) -> TenantPaths {
        TenantPaths::derive(&self.name, layout)
    }
}

/// Derived locations for a tenant. Never stored; always recomputed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TenantPaths {
    /// Chroot root, owned by root and not writable by the tenant.
    pub sftp_home: PathBuf,

    /// Writable directory nested inside the chroot, owned by the tenant.
    pub upload_dir: PathBuf,

    /// Local working copy of the tenant's content repository.
    pub git_worktree: PathBuf,

    /// Web-exposed symlink pointing at `upload_dir`.
    pub web_link: PathBuf,
}

impl TenantPaths {
    pub fn derive(name: &str, layout: &Layout) -> Self {
        let sftp_home = layout.sftp_home(name);
        Self {
            upload_dir: sftp_home.join(Layout::UPLOAD_SUBDIR),
            sftp_home,
            git_worktree: layout.git_dir.join(name),
            web_link: layout.web_dir.join(name),
        }
    }
}
