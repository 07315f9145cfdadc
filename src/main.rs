use clap::Parser;
use std::process::ExitCode;
use tenantctl::{
    config::AppConfig,
    errors::{AppError, ExitStatus},
    routes::routes::{Cli, dispatch},
    services::TenantServices,
};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // --- Logging setup ---
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.global.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitStatus::Success.into(),
        Err(err) => {
            eprintln!("error: {}", err);
            err.exit_code()
        }
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    // --- Parse config ---
    let cfg = AppConfig::from_env_and_args(&cli.global)?;
    tracing::debug!("effective configuration: {:?}", redacted(&cfg));
    if cfg.dry_run {
        tracing::info!("dry-run: no changes will be made");
    }

    // --- Initialize services ---
    let services = TenantServices::bootstrap(cfg).await?;

    dispatch(cli.command, &services).await
}

/// Debug view of the config without secrets.
fn redacted(cfg: &AppConfig) -> AppConfig {
    let mut shown = cfg.clone();
    if let Some(gitea) = shown.gitea.as_mut() {
        gitea.token = "<redacted>".into();
    }
    shown
}
