//! TenantStore: durable, file-backed tenant records.
//!
//! Every tenant owns one directory beneath the store root containing a single
//! `tenant.json` record. The directory *is* the existence check: a tenant
//! exists if and only if `root/{name}` is a directory. Records are rewritten
//! atomically (temp file + fsync + rename) with owner-only permissions.

use crate::models::tenant::{StatusFilter, Tenant, TenantStatus};
use futures::{Stream, stream};
use std::{
    fs::Permissions,
    io::{self, ErrorKind},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
};
use tracing::{debug, warn};

const RECORD_FILE: &str = "tenant.json";
const DIR_MODE: u32 = 0o700;
const RECORD_MODE: u32 = 0o600;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("tenant `{0}` not found")]
    NotFound(String),
    #[error("tenant record for `{name}` is unreadable: {source}")]
    Corrupt {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("persisting tenant `{name}` failed: {source}")]
    Persistence {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A single mutable field of a tenant record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TenantField {
    Email(String),
    Status(TenantStatus),
    QuotaKb(u64),
    SshKeyFingerprint(Option<String>),
}

impl TenantField {
    pub fn name(&self) -> &'static str {
        match self {
            TenantField::Email(_) => "email",
            TenantField::Status(_) => "status",
            TenantField::QuotaKb(_) => "quota_kb",
            TenantField::SshKeyFingerprint(_) => "ssh_key_fingerprint",
        }
    }

    fn apply(self, tenant: &mut Tenant) {
        match self {
            TenantField::Email(email) => tenant.email = email,
            TenantField::Status(status) => tenant.status = status,
            TenantField::QuotaKb(kb) => tenant.quota_kb = kb,
            TenantField::SshKeyFingerprint(fp) => tenant.ssh_key_fingerprint = fp,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TenantStore {
    /// Tenant database root.
    root: PathBuf,
}

impl TenantStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.record_dir(name).join(RECORD_FILE)
    }

    /// Directory presence is the existence check.
    pub async fn exists(&self, name: &str) -> bool {
        fs::metadata(self.record_dir(name))
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false)
    }

    pub async fn read(&self, name: &str) -> StoreResult<Tenant> {
        read_record(&self.record_path(name), name).await
    }

    /// Create the record if absent, otherwise fully rewrite it.
    pub async fn write(&self, tenant: &Tenant) -> StoreResult<()> {
        let persistence = |source: io::Error| StoreError::Persistence {
            name: tenant.name.clone(),
            source,
        };

        let dir = self.record_dir(&tenant.name);
        fs::create_dir_all(&dir).await.map_err(persistence)?;
        fs::set_permissions(&dir, Permissions::from_mode(DIR_MODE))
            .await
            .map_err(persistence)?;

        let payload = serde_json::to_vec_pretty(tenant).map_err(|err| StoreError::Persistence {
            name: tenant.name.clone(),
            source: io::Error::new(ErrorKind::InvalidData, err),
        })?;

        let final_path = dir.join(RECORD_FILE);
        let tmp_path = dir.join(format!(".{}.tmp", RECORD_FILE));
        if let Err(err) = write_synced(&tmp_path, &payload).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(persistence(err));
        }
        if let Err(err) = fs::rename(&tmp_path, &final_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(persistence(err));
        }

        debug!("wrote tenant record {}", final_path.display());
        Ok(())
    }

    /// Change one field and bump `updated_at`.
    pub async fn update_field(&self, name: &str, field: TenantField) -> StoreResult<Tenant> {
        let mut tenant = self.read(name).await?;
        debug!("updating `{}` on tenant {}", field.name(), name);
        field.apply(&mut tenant);
        tenant.touch();
        self.write(&tenant).await?;
        Ok(tenant)
    }

    /// Remove the record and its directory.
    pub async fn remove(&self, name: &str) -> StoreResult<()> {
        match fs::remove_dir_all(self.record_dir(name)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(name.to_string()))
            }
            Err(err) => Err(StoreError::Persistence {
                name: name.to_string(),
                source: err,
            }),
        }
    }

    /// Lazily enumerate tenants matching `filter`.
    ///
    /// Directory order is not sorted. Unreadable records are skipped with a
    /// warning; a missing store root yields an empty stream. The stream cannot
    /// be resumed once it ends, but `list` can be called again at any time.
    pub fn list(&self, filter: StatusFilter) -> impl Stream<Item = StoreResult<Tenant>> + Send + use<> {
        stream::try_unfold(Cursor::Unopened(self.root.clone()), move |cursor| {
            next_tenant(cursor, filter)
        })
    }
}

enum Cursor {
    Unopened(PathBuf),
    Open(fs::ReadDir),
}

async fn next_tenant(
    cursor: Cursor,
    filter: StatusFilter,
) -> StoreResult<Option<(Tenant, Cursor)>> {
    let mut entries = match cursor {
        Cursor::Unopened(root) => match fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::Io(err)),
        },
        Cursor::Open(entries) => entries,
    };

    while let Some(entry) = entries.next_entry().await? {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if name.starts_with('.') || !entry.file_type().await?.is_dir() {
            continue;
        }
        match read_record(&entry.path().join(RECORD_FILE), name).await {
            Ok(tenant) if filter.matches(tenant.status) => {
                return Ok(Some((tenant, Cursor::Open(entries))));
            }
            Ok(_) => {}
            Err(err) => warn!("skipping tenant directory `{}`: {}", name, err),
        }
    }

    Ok(None)
}

async fn read_record(path: &Path, name: &str) -> StoreResult<Tenant> {
    let raw = match fs::read(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(StoreError::NotFound(name.to_string()));
        }
        Err(err) => return Err(StoreError::Io(err)),
    };
    serde_json::from_slice(&raw).map_err(|source| StoreError::Corrupt {
        name: name.to_string(),
        source,
    })
}

async fn write_synced(path: &Path, payload: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(RECORD_MODE)
        .open(path)
        .await?;
    file.write_all(payload).await?;
    file.flush().await?;
    file.sync_all().await?;
    fs::set_permissions(path, Permissions::from_mode(RECORD_MODE)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use tempfile::tempdir;

    fn tenant(name: &str) -> Tenant {
        Tenant::new(name, &format!("ops@{name}.test"), 5000, 1024)
    }

    #[tokio::test]
    async fn write_then_read_round_trips_and_sets_permissions() {
        let dir = tempdir().unwrap();
        let store = TenantStore::new(dir.path());
        let acme = tenant("acme");

        assert!(!store.exists("acme").await);
        store.write(&acme).await.unwrap();
        assert!(store.exists("acme").await);
        assert_eq!(store.read("acme").await.unwrap(), acme);

        let dir_mode = std::fs::metadata(dir.path().join("acme"))
            .unwrap()
            .permissions()
            .mode();
        let file_mode = std::fs::metadata(dir.path().join("acme").join(RECORD_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, DIR_MODE);
        assert_eq!(file_mode & 0o777, RECORD_MODE);
    }

    #[tokio::test]
    async fn read_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let store = TenantStore::new(dir.path());
        assert!(matches!(
            store.read("ghost").await,
            Err(StoreError::NotFound(name)) if name == "ghost"
        ));
    }

    #[tokio::test]
    async fn update_field_bumps_updated_at() {
        let dir = tempdir().unwrap();
        let store = TenantStore::new(dir.path());
        store.write(&tenant("acme")).await.unwrap();

        let updated = store
            .update_field("acme", TenantField::QuotaKb(204800))
            .await
            .unwrap();
        assert_eq!(updated.quota_kb, 204800);
        assert!(updated.updated_at > updated.created_at);
        assert_eq!(store.read("acme").await.unwrap(), updated);

        assert!(matches!(
            store
                .update_field("ghost", TenantField::Status(TenantStatus::Disabled))
                .await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn remove_is_not_found_the_second_time() {
        let dir = tempdir().unwrap();
        let store = TenantStore::new(dir.path());
        store.write(&tenant("acme")).await.unwrap();
        store.remove("acme").await.unwrap();
        assert!(!store.exists("acme").await);
        assert!(matches!(
            store.remove("acme").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_filters_by_status_and_skips_junk() {
        let dir = tempdir().unwrap();
        let store = TenantStore::new(dir.path());
        store.write(&tenant("alpha")).await.unwrap();
        let mut beta = tenant("beta");
        beta.status = TenantStatus::Disabled;
        store.write(&beta).await.unwrap();
        std::fs::create_dir(dir.path().join("broken")).unwrap();
        std::fs::write(dir.path().join("broken").join(RECORD_FILE), b"{").unwrap();
        std::fs::write(dir.path().join("stray-file"), b"x").unwrap();
        std::fs::create_dir(dir.path().join(".hidden")).unwrap();

        let mut all: Vec<String> = store
            .list(StatusFilter::All)
            .map_ok(|t| t.name)
            .try_collect()
            .await
            .unwrap();
        all.sort();
        assert_eq!(all, vec!["alpha", "beta"]);

        let disabled: Vec<Tenant> = store
            .list(StatusFilter::Disabled)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(disabled.len(), 1);
        assert_eq!(disabled[0].name, "beta");
    }

    #[tokio::test]
    async fn list_on_missing_root_is_empty() {
        let dir = tempdir().unwrap();
        let store = TenantStore::new(dir.path().join("nope"));
        let tenants: Vec<Tenant> = store.list(StatusFilter::All).try_collect().await.unwrap();
        assert!(tenants.is_empty());
    }
}
