//! Account Provisioner: OS-level upload accounts and their chroot homes.
//!
//! The SFTP chroot contract: the chroot root (`uploads/{name}`) must be owned
//! by root and not writable by the tenant; only the nested upload directory
//! belongs to the tenant account.

use crate::{
    config::{Layout, UidPool},
    services::ssh_keys::AuthorizedKey,
};
use async_trait::async_trait;
use nix::unistd::{Gid, Group, Uid, User, chown};
use std::{
    fmt,
    fs::Permissions,
    io::{self, ErrorKind},
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::Stdio,
};
use thiserror::Error;
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
    process::Command,
};
use tracing::{debug, info, warn};

const CHROOT_MODE: u32 = 0o755;
const UPLOAD_DIR_MODE: u32 = 0o755;
const KEYS_DIR_MODE: u32 = 0o755;
const KEY_FILE_MODE: u32 = 0o600;
/// `groupadd` exit status for "group already exists".
const GROUPADD_EXISTS: i32 = 9;

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("uid pool {low}..={high} is exhausted")]
    ExhaustedRange { low: u32, high: u32 },
    #[error("OS account `{0}` does not exist")]
    MissingAccount(String),
    #[error("`{command}` failed ({status}): {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("cannot run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("account database lookup failed: {0}")]
    Lookup(#[from] nix::Error),
}

pub type AccountResult<T> = Result<T, AccountError>;

/// Login capability of an OS account as reported by `passwd -S`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccountState {
    Active,
    Locked,
    Missing,
}

impl fmt::Display for AccountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountState::Active => f.write_str("active"),
            AccountState::Locked => f.write_str("locked"),
            AccountState::Missing => f.write_str("missing"),
        }
    }
}

#[async_trait]
pub trait AccountProvisioner: Send + Sync {
    /// First uid in the pool not bound to any account.
    async fn allocate_uid(&self) -> AccountResult<u32>;

    /// Create the group (if absent) and a locked-shell account.
    async fn create_account(
        &self,
        username: &str,
        email: &str,
        password: &str,
        uid: u32,
    ) -> AccountResult<()>;

    /// Build the chroot home and its writable upload directory.
    async fn create_chroot(&self, username: &str) -> AccountResult<()>;

    /// Idempotent: a missing account is not an error.
    async fn delete_account(&self, username: &str) -> AccountResult<()>;

    /// Idempotent: a missing chroot is not an error.
    async fn delete_chroot(&self, username: &str) -> AccountResult<()>;

    /// A missing account is logged, not reported.
    async fn lock(&self, username: &str) -> AccountResult<()>;

    /// A missing account is logged, not reported.
    async fn unlock(&self, username: &str) -> AccountResult<()>;

    async fn account_state(&self, username: &str) -> AccountResult<AccountState>;

    /// Replace the account's authorized key material.
    async fn install_authorized_key(&self, username: &str, key: &AuthorizedKey)
    -> AccountResult<()>;
}

/// Linear scan from the pool's low bound for the first uid `is_taken`
/// reports as free.
pub fn scan_pool<E>(
    pool: UidPool,
    mut is_taken: impl FnMut(u32) -> Result<bool, E>,
) -> Result<Option<u32>, E> {
    for uid in pool.low..=pool.high {
        if !is_taken(uid)? {
            return Ok(Some(uid));
        }
    }
    Ok(None)
}

/// Provisioner backed by the local passwd/group databases and shadow-utils.
#[derive(Clone, Debug)]
pub struct SystemAccounts {
    layout: Layout,
    pool: UidPool,
    group: String,
    shell: PathBuf,
}

impl SystemAccounts {
    pub fn new(layout: Layout, pool: UidPool, group: impl Into<String>, shell: PathBuf) -> Self {
        Self {
            layout,
            pool,
            group: group.into(),
            shell,
        }
    }

    fn lookup(&self, username: &str) -> AccountResult<Option<User>> {
        Ok(User::from_name(username)?)
    }

    async fn ensure_group(&self) -> AccountResult<()> {
        if Group::from_name(&self.group)?.is_some() {
            return Ok(());
        }
        info!("creating group {}", self.group);
        match run("groupadd", &[self.group.as_str()], None).await {
            Err(AccountError::Command { status, .. })
                if status == format!("exit status: {}", GROUPADD_EXISTS) =>
            {
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }
}

#[async_trait]
impl AccountProvisioner for SystemAccounts {
    async fn allocate_uid(&self) -> AccountResult<u32> {
        let uid = scan_pool(self.pool, |uid| {
            User::from_uid(Uid::from_raw(uid)).map(|user| user.is_some())
        })?
        .ok_or(AccountError::ExhaustedRange {
            low: self.pool.low,
            high: self.pool.high,
        })?;
        debug!("allocated uid {}", uid);
        Ok(uid)
    }

    async fn create_account(
        &self,
        username: &str,
        email: &str,
        password: &str,
        uid: u32,
    ) -> AccountResult<()> {
        self.ensure_group().await?;

        let home = self.layout.sftp_home(username);
        let uid_arg = uid.to_string();
        let home_arg = home.to_string_lossy().into_owned();
        let shell_arg = self.shell.to_string_lossy().into_owned();
        run(
            "useradd",
            &[
                "--uid",
                uid_arg.as_str(),
                "--gid",
                self.group.as_str(),
                "--home-dir",
                home_arg.as_str(),
                "--no-create-home",
                "--shell",
                shell_arg.as_str(),
                "--comment",
                email,
                username,
            ],
            None,
        )
        .await?;

        // The account exists now; undo it ourselves if the password cannot be
        // set so the step stays all-or-nothing.
        let credentials = format!("{}:{}\n", username, password);
        if let Err(err) = run("chpasswd", &[], Some(credentials.as_str())).await {
            if let Err(cleanup) = run("userdel", &[username], None).await {
                warn!("could not remove half-created account {}: {}", username, cleanup);
            }
            return Err(err);
        }

        info!("created OS account {} (uid {})", username, uid);
        Ok(())
    }

    async fn create_chroot(&self, username: &str) -> AccountResult<()> {
        let user = self
            .lookup(username)?
            .ok_or_else(|| AccountError::MissingAccount(username.to_string()))?;
        let home = self.layout.sftp_home(username);
        let upload = home.join(Layout::UPLOAD_SUBDIR);

        fs::create_dir_all(&self.layout.uploads_dir)
            .await
            .map_err(io_at(&self.layout.uploads_dir))?;
        // Refuse to adopt a directory that is already there.
        fs::create_dir(&home).await.map_err(io_at(&home))?;

        let built = async {
            chown(&home, Some(Uid::from_raw(0)), Some(Gid::from_raw(0)))?;
            fs::set_permissions(&home, Permissions::from_mode(CHROOT_MODE))
                .await
                .map_err(io_at(&home))?;
            fs::create_dir(&upload).await.map_err(io_at(&upload))?;
            chown(&upload, Some(user.uid), Some(user.gid))?;
            fs::set_permissions(&upload, Permissions::from_mode(UPLOAD_DIR_MODE))
                .await
                .map_err(io_at(&upload))?;
            Ok::<_, AccountError>(())
        }
        .await;

        if let Err(err) = built {
            if let Err(cleanup) = fs::remove_dir_all(&home).await {
                warn!("could not remove half-built chroot {}: {}", home.display(), cleanup);
            }
            return Err(err);
        }

        info!("created chroot {}", home.display());
        Ok(())
    }

    async fn delete_account(&self, username: &str) -> AccountResult<()> {
        let keys = self.layout.authorized_keys_file(username);
        match fs::remove_file(&keys).await {
            Ok(()) => debug!("removed {}", keys.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(io_at(&keys)(err)),
        }

        if self.lookup(username)?.is_none() {
            debug!("OS account {} already absent", username);
            return Ok(());
        }
        run("userdel", &[username], None).await?;
        info!("deleted OS account {}", username);
        Ok(())
    }

    async fn delete_chroot(&self, username: &str) -> AccountResult<()> {
        let home = self.layout.sftp_home(username);
        match fs::remove_dir_all(&home).await {
            Ok(()) => {
                info!("removed chroot {}", home.display());
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("chroot {} already absent", home.display());
                Ok(())
            }
            Err(err) => Err(io_at(&home)(err)),
        }
    }

    async fn lock(&self, username: &str) -> AccountResult<()> {
        if self.lookup(username)?.is_none() {
            warn!("cannot lock {}: OS account does not exist", username);
            return Ok(());
        }
        // Expiring the account also refuses public-key logins.
        run("usermod", &["--lock", "--expiredate", "1", username], None).await?;
        info!("locked OS account {}", username);
        Ok(())
    }

    async fn unlock(&self, username: &str) -> AccountResult<()> {
        if self.lookup(username)?.is_none() {
            warn!("cannot unlock {}: OS account does not exist", username);
            return Ok(());
        }
        run("usermod", &["--unlock", "--expiredate", "", username], None).await?;
        info!("unlocked OS account {}", username);
        Ok(())
    }

    async fn account_state(&self, username: &str) -> AccountResult<AccountState> {
        if self.lookup(username)?.is_none() {
            return Ok(AccountState::Missing);
        }
        let status = run("passwd", &["--status", username], None).await?;
        Ok(parse_passwd_status(&status))
    }

    async fn install_authorized_key(
        &self,
        username: &str,
        key: &AuthorizedKey,
    ) -> AccountResult<()> {
        let user = self
            .lookup(username)?
            .ok_or_else(|| AccountError::MissingAccount(username.to_string()))?;
        let dir = &self.layout.authorized_keys_dir;
        fs::create_dir_all(dir).await.map_err(io_at(dir))?;
        fs::set_permissions(dir, Permissions::from_mode(KEYS_DIR_MODE))
            .await
            .map_err(io_at(dir))?;

        let target = self.layout.authorized_keys_file(username);
        let tmp = dir.join(format!(".{}.tmp", username));
        let written = async {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(KEY_FILE_MODE)
                .open(&tmp)
                .await?;
            file.write_all(format!("{}\n", key.to_line()).as_bytes())
                .await?;
            file.sync_all().await?;
            fs::set_permissions(&tmp, Permissions::from_mode(KEY_FILE_MODE)).await
        }
        .await;
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp).await;
            return Err(io_at(&tmp)(err));
        }
        if let Err(err) = chown(&tmp, Some(user.uid), Some(user.gid)) {
            let _ = fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        fs::rename(&tmp, &target).await.map_err(io_at(&target))?;

        info!("installed SSH key {} for {}", key.fingerprint_sha256(), username);
        Ok(())
    }
}

/// Interpret `passwd --status` output: `name L 2024-01-01 0 99999 7 -1`.
pub fn parse_passwd_status(output: &str) -> AccountState {
    match output.split_whitespace().nth(1) {
        Some("L") | Some("LK") => AccountState::Locked,
        _ => AccountState::Active,
    }
}

fn io_at(path: &Path) -> impl Fn(io::Error) -> AccountError + '_ {
    move |source| AccountError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Run an OS command, optionally feeding `stdin`, returning its stdout.
async fn run(program: &str, args: &[&str], stdin: Option<&str>) -> AccountResult<String> {
    // Never log stdin: it may carry a password.
    let command = format!("{} {}", program, args.join(" "));
    debug!("running `{}`", command.trim_end());

    let spawn_err = |source| AccountError::Spawn {
        command: command.clone(),
        source,
    };

    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(spawn_err)?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes()).await.map_err(spawn_err)?;
        drop(pipe);
    }

    let output = child.wait_with_output().await.map_err(spawn_err)?;
    if !output.status.success() {
        return Err(AccountError::Command {
            command,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn scan_pool_picks_lowest_free_uid() {
        let pool = UidPool {
            low: 5000,
            high: 5005,
        };
        let taken: HashSet<u32> = [5000, 5001, 5003].into_iter().collect();
        let uid = scan_pool::<()>(pool, |uid| Ok(taken.contains(&uid))).unwrap();
        assert_eq!(uid, Some(5002));
    }

    #[test]
    fn scan_pool_reports_exhaustion() {
        let pool = UidPool {
            low: 5000,
            high: 5002,
        };
        let uid = scan_pool::<()>(pool, |_| Ok(true)).unwrap();
        assert_eq!(uid, None);
    }

    #[test]
    fn scan_pool_propagates_lookup_errors() {
        let pool = UidPool {
            low: 5000,
            high: 5002,
        };
        assert_eq!(scan_pool(pool, |_| Err("nss down")), Err("nss down"));
    }

    #[test]
    fn passwd_status_parsing() {
        assert_eq!(
            parse_passwd_status("acme L 2026-01-01 0 99999 7 -1\n"),
            AccountState::Locked
        );
        assert_eq!(
            parse_passwd_status("acme LK 2026-01-01 0 99999 7 -1"),
            AccountState::Locked
        );
        assert_eq!(
            parse_passwd_status("acme P 2026-01-01 0 99999 7 -1"),
            AccountState::Active
        );
    }
}
