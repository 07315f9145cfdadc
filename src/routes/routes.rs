//! Command-line surface: one subcommand per tenant operation.
//!
//! ## Commands
//! - `create <name> <email> [quota_kb]`
//! - `delete <name> --confirm-delete`
//! - `info <name>`
//! - `list [all|active|disabled]`
//! - `enable <name>` / `disable <name>`
//! - `update-email <name> <email>`
//! - `update-quota <name> <quota_kb>`
//! - `rotate-ssh-key <name> <public_key|->`
//! - `queue-flush`
//!
//! Global flags (`--dry-run`, `--env-file`, ...) are accepted anywhere.

use crate::{
    config::GlobalArgs,
    errors::AppError,
    handlers::tenant_handlers,
    models::tenant::StatusFilter,
    services::{TenantServices, validator},
};
use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;

#[derive(Parser, Debug)]
#[command(
    name = "tenantctl",
    version,
    about = "Provision and manage isolated upload tenants"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Provision a tenant: OS account, chroot, repository, web link, record
    Create {
        name: String,
        email: String,
        /// Upload quota in KB (defaults to TENANTCTL_DEFAULT_QUOTA_KB)
        #[arg(value_parser = parse_quota)]
        quota_kb: Option<u64>,
    },
    /// Tear a tenant down completely
    Delete {
        name: String,
        /// Required: confirms the irreversible deletion
        #[arg(long)]
        confirm_delete: bool,
    },
    /// Show status, account, quota, usage and directories
    Info { name: String },
    /// List tenants
    List {
        #[arg(value_enum, default_value_t = StatusFilter::All)]
        status: StatusFilter,
    },
    /// Re-enable a disabled tenant
    Enable { name: String },
    /// Disable a tenant and lock its account
    Disable { name: String },
    /// Change the contact address
    UpdateEmail { name: String, email: String },
    /// Change the upload quota
    UpdateQuota {
        name: String,
        #[arg(value_parser = parse_quota)]
        quota_kb: u64,
    },
    /// Replace the tenant's SSH public key (`-` reads it from stdin)
    RotateSshKey { name: String, public_key: String },
    /// Retry queued notifications
    QueueFlush,
}

fn parse_quota(raw: &str) -> Result<u64, String> {
    validator::validate_quota(raw).map_err(|err| err.to_string())
}

/// Run one command against the wired services.
pub async fn dispatch(command: Command, services: &TenantServices) -> Result<(), AppError> {
    match command {
        Command::Create {
            name,
            email,
            quota_kb,
        } => tenant_handlers::create(services, name, email, quota_kb).await,
        Command::Delete {
            name,
            confirm_delete,
        } => tenant_handlers::delete(services, name, confirm_delete).await,
        Command::Info { name } => tenant_handlers::info(services, name).await,
        Command::List { status } => tenant_handlers::list(services, status).await,
        Command::Enable { name } => tenant_handlers::enable(services, name).await,
        Command::Disable { name } => tenant_handlers::disable(services, name).await,
        Command::UpdateEmail { name, email } => {
            tenant_handlers::update_email(services, name, email).await
        }
        Command::UpdateQuota { name, quota_kb } => {
            tenant_handlers::update_quota(services, name, quota_kb).await
        }
        Command::RotateSshKey { name, public_key } => {
            let public_key = if public_key == "-" {
                let mut buf = String::new();
                tokio::io::stdin()
                    .read_to_string(&mut buf)
                    .await
                    .map_err(|err| AppError::internal(format!("reading key from stdin: {}", err)))?;
                buf
            } else {
                public_key
            };
            tenant_handlers::rotate_ssh_key(services, name, public_key).await
        }
        Command::QueueFlush => tenant_handlers::queue_flush(services).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_create_with_optional_quota() {
        let cli = Cli::try_parse_from(["tenantctl", "create", "acme", "ops@acme.test"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Create { quota_kb: None, .. }
        ));

        let cli = Cli::try_parse_from([
            "tenantctl",
            "--dry-run",
            "create",
            "acme",
            "ops@acme.test",
            "204800",
        ])
        .unwrap();
        assert!(cli.global.dry_run);
        assert!(matches!(
            cli.command,
            Command::Create {
                quota_kb: Some(204800),
                ..
            }
        ));

        assert!(Cli::try_parse_from(["tenantctl", "create", "acme", "ops@acme.test", "0"]).is_err());
    }

    #[test]
    fn list_defaults_to_all_and_delete_takes_flag() {
        let cli = Cli::try_parse_from(["tenantctl", "list"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::List {
                status: StatusFilter::All
            }
        ));
        let cli = Cli::try_parse_from(["tenantctl", "list", "disabled"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::List {
                status: StatusFilter::Disabled
            }
        ));

        let cli = Cli::try_parse_from(["tenantctl", "delete", "acme", "--confirm-delete"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Delete {
                confirm_delete: true,
                ..
            }
        ));
        let cli = Cli::try_parse_from(["tenantctl", "delete", "acme"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Delete {
                confirm_delete: false,
                ..
            }
        ));
    }
}
