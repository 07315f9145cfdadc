//! In-memory collaborators and a sandboxed service graph for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    path::Path,
    sync::{Arc, Mutex},
};
use tempfile::TempDir;
use tenantctl::{
    config::{AppConfig, Layout, UidPool},
    models::notification::{Delivery, Notice},
    services::{
        TenantServices,
        accounts::{AccountError, AccountProvisioner, AccountResult, AccountState, scan_pool},
        git_hosting::{GitHosting, GitHostingError, GitResult, Permission},
        notifier::{MailTransport, NotifyError, NotifyResult, Notifier, OutgoingMail, QueuedNotifier},
        ssh_keys::AuthorizedKey,
    },
};

fn injected(op: &str) -> AccountError {
    AccountError::Command {
        command: op.to_string(),
        status: "exit status: 1".into(),
        stderr: "injected failure".into(),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FakeAccount {
    pub uid: u32,
    pub email: String,
    pub locked: bool,
    pub key: Option<String>,
}

/// OS accounts kept in memory; chroots are real directories in the sandbox.
pub struct FakeAccounts {
    layout: Layout,
    pool: UidPool,
    pub accounts: Mutex<BTreeMap<String, FakeAccount>>,
    failing: Mutex<HashSet<&'static str>>,
}

impl FakeAccounts {
    pub fn new(layout: Layout, pool: UidPool) -> Self {
        Self {
            layout,
            pool,
            accounts: Mutex::new(BTreeMap::new()),
            failing: Mutex::new(HashSet::new()),
        }
    }

    /// Make every future call of `op` fail.
    pub fn fail(&self, op: &'static str) {
        self.failing.lock().unwrap().insert(op);
    }

    fn check(&self, op: &'static str) -> AccountResult<()> {
        if self.failing.lock().unwrap().contains(op) {
            Err(injected(op))
        } else {
            Ok(())
        }
    }

    pub fn get(&self, username: &str) -> Option<FakeAccount> {
        self.accounts.lock().unwrap().get(username).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl AccountProvisioner for FakeAccounts {
    async fn allocate_uid(&self) -> AccountResult<u32> {
        self.check("allocate_uid")?;
        let taken: HashSet<u32> = self
            .accounts
            .lock()
            .unwrap()
            .values()
            .map(|a| a.uid)
            .collect();
        scan_pool::<AccountError>(self.pool, |uid| Ok(taken.contains(&uid)))?.ok_or(
            AccountError::ExhaustedRange {
                low: self.pool.low,
                high: self.pool.high,
            },
        )
    }

    async fn create_account(
        &self,
        username: &str,
        email: &str,
        _password: &str,
        uid: u32,
    ) -> AccountResult<()> {
        self.check("create_account")?;
        let mut accounts = self.accounts.lock().unwrap();
        if accounts.contains_key(username) {
            return Err(injected("useradd: user exists"));
        }
        accounts.insert(
            username.to_string(),
            FakeAccount {
                uid,
                email: email.to_string(),
                locked: false,
                key: None,
            },
        );
        Ok(())
    }

    async fn create_chroot(&self, username: &str) -> AccountResult<()> {
        self.check("create_chroot")?;
        let home = self.layout.sftp_home(username);
        let upload = home.join(Layout::UPLOAD_SUBDIR);
        std::fs::create_dir_all(&upload).map_err(|source| AccountError::Io {
            path: upload.clone(),
            source,
        })
    }

    async fn delete_account(&self, username: &str) -> AccountResult<()> {
        self.check("delete_account")?;
        self.accounts.lock().unwrap().remove(username);
        Ok(())
    }

    async fn delete_chroot(&self, username: &str) -> AccountResult<()> {
        self.check("delete_chroot")?;
        let home = self.layout.sftp_home(username);
        match std::fs::remove_dir_all(&home) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(AccountError::Io { path: home, source }),
        }
    }

    async fn lock(&self, username: &str) -> AccountResult<()> {
        self.check("lock")?;
        if let Some(account) = self.accounts.lock().unwrap().get_mut(username) {
            account.locked = true;
        }
        Ok(())
    }

    async fn unlock(&self, username: &str) -> AccountResult<()> {
        self.check("unlock")?;
        if let Some(account) = self.accounts.lock().unwrap().get_mut(username) {
            account.locked = false;
        }
        Ok(())
    }

    async fn account_state(&self, username: &str) -> AccountResult<AccountState> {
        Ok(match self.get(username) {
            None => AccountState::Missing,
            Some(account) if account.locked => AccountState::Locked,
            Some(_) => AccountState::Active,
        })
    }

    async fn install_authorized_key(
        &self,
        username: &str,
        key: &AuthorizedKey,
    ) -> AccountResult<()> {
        self.check("install_authorized_key")?;
        let mut accounts = self.accounts.lock().unwrap();
        let account = accounts
            .get_mut(username)
            .ok_or_else(|| AccountError::MissingAccount(username.to_string()))?;
        account.key = Some(key.to_line());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeGitState {
    pub repos: BTreeSet<String>,
    pub users: BTreeSet<String>,
    pub collaborators: BTreeSet<(String, String)>,
    pub initialized: BTreeSet<String>,
}

/// Remote Git service kept in memory.
#[derive(Default)]
pub struct FakeGit {
    pub state: Mutex<FakeGitState>,
    failing: Mutex<HashSet<&'static str>>,
}

impl FakeGit {
    pub fn fail(&self, op: &'static str) {
        self.failing.lock().unwrap().insert(op);
    }

    fn check(&self, op: &'static str) -> GitResult<()> {
        if self.failing.lock().unwrap().contains(op) {
            Err(GitHostingError::Api {
                operation: op.to_string(),
                status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                body: "injected failure".into(),
            })
        } else {
            Ok(())
        }
    }

    pub fn is_empty(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.repos.is_empty() && state.users.is_empty() && state.collaborators.is_empty()
    }
}

#[async_trait]
impl GitHosting for FakeGit {
    async fn repo_create(&self, repo: &str) -> GitResult<()> {
        self.check("repo_create")?;
        self.state.lock().unwrap().repos.insert(repo.to_string());
        Ok(())
    }

    async fn repo_delete(&self, repo: &str) -> GitResult<()> {
        self.check("repo_delete")?;
        let mut state = self.state.lock().unwrap();
        state.repos.remove(repo);
        state.initialized.remove(repo);
        state.collaborators.retain(|(r, _)| r != repo);
        Ok(())
    }

    async fn repo_initialize(&self, repo: &str, _tenant: &str, _email: &str) -> GitResult<()> {
        self.check("repo_initialize")?;
        self.state.lock().unwrap().initialized.insert(repo.to_string());
        Ok(())
    }

    async fn user_create(&self, username: &str, _email: &str, _password: &str) -> GitResult<()> {
        self.check("user_create")?;
        self.state.lock().unwrap().users.insert(username.to_string());
        Ok(())
    }

    async fn user_delete(&self, username: &str) -> GitResult<()> {
        self.check("user_delete")?;
        self.state.lock().unwrap().users.remove(username);
        Ok(())
    }

    async fn collaborator_add(
        &self,
        repo: &str,
        username: &str,
        permission: Permission,
    ) -> GitResult<()> {
        self.check("collaborator_add")?;
        assert_eq!(permission, Permission::Read);
        self.state
            .lock()
            .unwrap()
            .collaborators
            .insert((repo.to_string(), username.to_string()));
        Ok(())
    }

    async fn collaborator_remove(&self, repo: &str, username: &str) -> GitResult<()> {
        self.check("collaborator_remove")?;
        self.state
            .lock()
            .unwrap()
            .collaborators
            .remove(&(repo.to_string(), username.to_string()));
        Ok(())
    }

    fn clone_url(&self, repo: &str) -> String {
        format!("ssh://git@git.test:22/tenants/{}.git", repo)
    }
}

/// Records every notice; optionally fails them all.
#[derive(Default)]
pub struct RecordingNotifier {
    pub notices: Mutex<Vec<Notice>>,
    pub down: Mutex<bool>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notice: &Notice) -> NotifyResult<Delivery> {
        if *self.down.lock().unwrap() {
            return Err(NotifyError::Transport("smtp unreachable".into()));
        }
        self.notices.lock().unwrap().push(notice.clone());
        Ok(Delivery::Sent)
    }
}

/// Mail transport that keeps every message it is handed.
#[derive(Default)]
pub struct Outbox {
    pub sent: Mutex<Vec<OutgoingMail>>,
}

#[async_trait]
impl MailTransport for Outbox {
    async fn send(&self, mail: &OutgoingMail) -> NotifyResult<()> {
        self.sent.lock().unwrap().push(mail.clone());
        Ok(())
    }
}

/// A SQLite-backed notifier on a private in-memory database.
pub async fn queued_notifier(outbox: Arc<Outbox>) -> QueuedNotifier {
    let db = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let notifier = QueuedNotifier::new(db, outbox, "admin@host.test");
    notifier.migrate().await.unwrap();
    notifier
}

/// A full service graph rooted in a temporary directory.
pub struct Harness {
    pub dir: TempDir,
    pub services: TenantServices,
    pub accounts: Arc<FakeAccounts>,
    pub git: Arc<FakeGit>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(true, |_| {})
    }

    pub fn without_git() -> Self {
        Self::build(false, |_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut AppConfig)) -> Self {
        Self::build(true, tweak)
    }

    fn build(with_git: bool, tweak: impl FnOnce(&mut AppConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::defaults(Layout::under(dir.path()));
        tweak(&mut config);

        let accounts = Arc::new(FakeAccounts::new(config.layout.clone(), config.uid_pool));
        let git = Arc::new(FakeGit::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let services = TenantServices::new(
            config,
            accounts.clone(),
            if with_git {
                Some(git.clone() as Arc<dyn GitHosting>)
            } else {
                None
            },
            Some(notifier.clone() as Arc<dyn Notifier>),
        );

        Self {
            dir,
            services,
            accounts,
            git,
            notifier,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.services.config.layout
    }

    /// Assert nothing of `name` survives anywhere.
    pub async fn assert_no_residue(&self, name: &str) {
        let paths = tenantctl::models::tenant::TenantPaths::derive(name, self.layout());
        assert!(self.accounts.get(name).is_none(), "OS account {} left behind", name);
        assert!(!paths.sftp_home.exists(), "chroot {} left behind", paths.sftp_home.display());
        assert!(
            std::fs::symlink_metadata(&paths.web_link).is_err(),
            "symlink {} left behind",
            paths.web_link.display()
        );
        {
            let git = self.git.state.lock().unwrap();
            assert!(!git.repos.contains(name), "remote repository left behind");
            assert!(!git.users.contains(name), "remote user left behind");
            assert!(
                !git.collaborators.iter().any(|(r, u)| r == name || u == name),
                "collaborator left behind"
            );
        }
        assert!(!self.services.store.exists(name).await, "tenant record left behind");
    }

    /// Rollback log files written so far.
    pub fn operation_logs(&self) -> Vec<std::path::PathBuf> {
        list_files(&self.layout().ops_log_dir)
    }
}

fn list_files(dir: &Path) -> Vec<std::path::PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => {
            let mut files: Vec<_> = entries.map(|e| e.unwrap().path()).collect();
            files.sort();
            files
        }
        Err(_) => Vec::new(),
    }
}
