use crate::services::validator;
use anyhow::{Context, Result, bail};
use clap::Args;
use std::{
    env,
    fmt::Display,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

/// Lowest uid the pool may start at; everything below belongs to the OS.
pub const MIN_POOL_UID: u32 = 1000;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub layout: Layout,
    pub uid_pool: UidPool,
    pub default_quota_kb: u64,
    pub sftp_group: String,
    pub nologin_shell: PathBuf,
    /// `None` disables every Git hosting step.
    pub gitea: Option<GiteaConfig>,
    /// `None` disables notifications entirely.
    pub notify: Option<NotifyConfig>,
    pub notify_cooldown: Duration,
    pub dry_run: bool,
}

/// Base directories everything else is derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Tenant database root: one directory per tenant.
    pub tenants_dir: PathBuf,
    /// Per-attempt rollback logs.
    pub ops_log_dir: PathBuf,
    /// Advisory lock files.
    pub lock_dir: PathBuf,
    /// SFTP chroot homes.
    pub uploads_dir: PathBuf,
    pub git_dir: PathBuf,
    /// Web-exposed symlinks.
    pub web_dir: PathBuf,
    pub authorized_keys_dir: PathBuf,
}

impl Layout {
    /// Writable directory created inside each chroot.
    pub const UPLOAD_SUBDIR: &'static str = "htdocs";

    /// Every base directory nested under one root. Used for sandboxes.
    pub fn under(root: &Path) -> Self {
        Self {
            tenants_dir: root.join("tenants"),
            ops_log_dir: root.join("operations"),
            lock_dir: root.join("locks"),
            uploads_dir: root.join("uploads"),
            git_dir: root.join("git"),
            web_dir: root.join("www"),
            authorized_keys_dir: root.join("authorized_keys"),
        }
    }

    pub fn sftp_home(&self, username: &str) -> PathBuf {
        self.uploads_dir.join(username)
    }

    pub fn authorized_keys_file(&self, username: &str) -> PathBuf {
        self.authorized_keys_dir.join(username)
    }
}

/// Inclusive uid range tenants are allocated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UidPool {
    pub low: u32,
    pub high: u32,
}

impl UidPool {
    pub fn contains(&self, uid: u32) -> bool {
        (self.low..=self.high).contains(&uid)
    }
}

#[derive(Debug, Clone)]
pub struct GiteaConfig {
    pub url: String,
    pub token: String,
    /// Organisation owning every tenant repository.
    pub org: String,
    pub ssh_port: u16,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub admin_email: String,
    pub mail_from: String,
    /// sendmail-compatible binary (sendmail, msmtp, ...).
    pub sendmail: PathBuf,
    pub database_url: String,
}

/// Global command-line flags shared by every subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Load environment variables from this file first
    #[arg(long, global = true, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    /// Validate and log every step without mutating anything (overrides TENANTCTL_DRY_RUN)
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Tenant database root (overrides TENANTCTL_TENANTS_DIR)
    #[arg(long, global = true)]
    pub tenants_dir: Option<PathBuf>,

    /// Rollback log directory (overrides TENANTCTL_OPS_LOG_DIR)
    #[arg(long, global = true)]
    pub ops_log_dir: Option<PathBuf>,

    /// Git hosting base URL (overrides TENANTCTL_GITEA_URL)
    #[arg(long, global = true)]
    pub gitea_url: Option<String>,
}

impl AppConfig {
    /// Built-in defaults around a given layout: Git hosting and
    /// notifications disabled.
    pub fn defaults(layout: Layout) -> Self {
        Self {
            layout,
            uid_pool: UidPool {
                low: 5000,
                high: 5999,
            },
            default_quota_kb: 102_400,
            sftp_group: "sftp-tenants".into(),
            nologin_shell: PathBuf::from("/usr/sbin/nologin"),
            gitea: None,
            notify: None,
            notify_cooldown: Duration::from_secs(3600),
            dry_run: false,
        }
    }

    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args(args: &GlobalArgs) -> Result<Self> {
        if let Some(path) = &args.env_file {
            dotenvy::from_path(path)
                .with_context(|| format!("loading env file {}", path.display()))?;
        }

        // --- Environment fallback ---
        let layout = Layout {
            tenants_dir: args
                .tenants_dir
                .clone()
                .unwrap_or_else(|| env_path("TENANTCTL_TENANTS_DIR", "/var/lib/tenantctl/tenants")),
            ops_log_dir: args.ops_log_dir.clone().unwrap_or_else(|| {
                env_path("TENANTCTL_OPS_LOG_DIR", "/var/log/tenantctl/operations")
            }),
            lock_dir: env_path("TENANTCTL_LOCK_DIR", "/run/lock/tenantctl"),
            uploads_dir: env_path("TENANTCTL_UPLOADS_DIR", "/srv/uploads"),
            git_dir: env_path("TENANTCTL_GIT_DIR", "/srv/git"),
            web_dir: env_path("TENANTCTL_WEB_DIR", "/var/www/tenants"),
            authorized_keys_dir: env_path(
                "TENANTCTL_AUTHORIZED_KEYS_DIR",
                "/etc/ssh/authorized_keys",
            ),
        };

        let uid_pool = UidPool {
            low: env_parse("TENANTCTL_UID_MIN", 5000)?,
            high: env_parse("TENANTCTL_UID_MAX", 5999)?,
        };
        if uid_pool.low < MIN_POOL_UID {
            bail!(
                "TENANTCTL_UID_MIN {} falls inside the OS-reserved range (< {})",
                uid_pool.low,
                MIN_POOL_UID
            );
        }
        if uid_pool.low > uid_pool.high {
            bail!(
                "uid pool is empty: TENANTCTL_UID_MIN {} > TENANTCTL_UID_MAX {}",
                uid_pool.low,
                uid_pool.high
            );
        }

        let default_quota_kb = match env::var("TENANTCTL_DEFAULT_QUOTA_KB") {
            Ok(value) => validator::validate_quota(&value)
                .with_context(|| "parsing TENANTCTL_DEFAULT_QUOTA_KB")?,
            Err(_) => 102_400,
        };

        let gitea = match args.gitea_url.clone().or_else(|| env_opt("TENANTCTL_GITEA_URL")) {
            Some(url) => {
                let token = env_opt("TENANTCTL_GITEA_TOKEN")
                    .context("TENANTCTL_GITEA_TOKEN is required when a Gitea URL is set")?;
                let ssh_port = match env_opt("TENANTCTL_GITEA_SSH_PORT") {
                    Some(raw) => validator::validate_port(&raw)
                        .with_context(|| "parsing TENANTCTL_GITEA_SSH_PORT")?,
                    None => 22,
                };
                Some(GiteaConfig {
                    url: url.trim_end_matches('/').to_string(),
                    token,
                    org: env_string("TENANTCTL_GITEA_ORG", "tenants"),
                    ssh_port,
                    timeout: Duration::from_secs(env_parse("TENANTCTL_GITEA_TIMEOUT_SECS", 30)?),
                })
            }
            None => None,
        };

        let notify = if env_flag("TENANTCTL_NOTIFY", true)? {
            let admin_email = env_string("TENANTCTL_ADMIN_EMAIL", "root@localhost");
            let mail_from = env_string("TENANTCTL_MAIL_FROM", "tenantctl@localhost");
            for (key, value) in [
                ("TENANTCTL_ADMIN_EMAIL", &admin_email),
                ("TENANTCTL_MAIL_FROM", &mail_from),
            ] {
                validator::validate_email(value).with_context(|| format!("parsing {}", key))?;
            }
            Some(NotifyConfig {
                admin_email,
                mail_from,
                sendmail: env_path("TENANTCTL_SENDMAIL", "/usr/sbin/sendmail"),
                database_url: env_string(
                    "TENANTCTL_NOTIFY_DB_URL",
                    "sqlite:///var/lib/tenantctl/notifications.db",
                ),
            })
        } else {
            None
        };

        // --- Merge ---
        Ok(Self {
            layout,
            uid_pool,
            default_quota_kb,
            sftp_group: env_string("TENANTCTL_SFTP_GROUP", "sftp-tenants"),
            nologin_shell: env_path("TENANTCTL_NOLOGIN_SHELL", "/usr/sbin/nologin"),
            gitea,
            notify,
            notify_cooldown: Duration::from_secs(env_parse("TENANTCTL_NOTIFY_COOLDOWN_SECS", 3600)?),
            dry_run: args.dry_run || env_flag("TENANTCTL_DRY_RUN", false)?,
        })
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_string(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.into())
}

fn env_path(key: &str, default: &str) -> PathBuf {
    PathBuf::from(env_string(key, default))
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env_opt(key) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("parsing {} value `{}`: {}", key, value, err)),
        None => Ok(default),
    }
}

fn env_flag(key: &str, default: bool) -> Result<bool> {
    match env_opt(key) {
        Some(value) => parse_flag(&value).with_context(|| format!("parsing {}", key)),
        None => Ok(default),
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("expected a boolean, got `{}`", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_flag_accepts_common_spellings() {
        assert!(parse_flag("Yes").unwrap());
        assert!(parse_flag("1").unwrap());
        assert!(!parse_flag("off").unwrap());
        assert!(parse_flag("maybe").is_err());
    }

    #[test]
    fn defaults_load_without_any_environment() {
        let keys: Vec<String> = env::vars()
            .map(|(key, _)| key)
            .filter(|key| key.starts_with("TENANTCTL_"))
            .collect();
        for key in keys {
            // SAFETY: no other test in this crate reads or writes TENANTCTL_* variables.
            unsafe { env::remove_var(key) };
        }

        let cfg = AppConfig::from_env_and_args(&GlobalArgs::default()).unwrap();
        let notify = cfg.notify.expect("notifications are on by default");
        assert_eq!(notify.admin_email, "root@localhost");
        assert_eq!(notify.mail_from, "tenantctl@localhost");
        assert!(cfg.gitea.is_none());
        assert_eq!(cfg.uid_pool, UidPool { low: 5000, high: 5999 });
        assert_eq!(cfg.default_quota_kb, 102_400);
        assert_eq!(cfg.notify_cooldown, Duration::from_secs(3600));
        assert!(!cfg.dry_run);
    }

    #[test]
    fn uid_pool_bounds_are_inclusive() {
        let pool = UidPool {
            low: 5000,
            high: 5002,
        };
        assert!(pool.contains(5000));
        assert!(pool.contains(5002));
        assert!(!pool.contains(5003));
        assert!(!pool.contains(4999));
    }
}
