//! Command handlers: call the services and render results on stdout.
//! Diagnostics go through `tracing` (stderr); stdout carries results only.

use crate::{
    errors::{AppError, ExitStatus},
    models::tenant::{StatusFilter, Tenant},
    services::{
        NotificationOutcome, TenantServices,
        lifecycle::{LifecycleError, StepOutcome, TeardownReport, Updated},
        provisioning_saga::CreateRequest,
    },
};
use chrono::SecondsFormat;
use futures::TryStreamExt;
use std::path::Path;
use tokio::fs;

pub async fn create(
    services: &TenantServices,
    name: String,
    email: String,
    quota_kb: Option<u64>,
) -> Result<(), AppError> {
    let provisioned = services
        .create(CreateRequest {
            name,
            email,
            quota_kb,
        })
        .await?;
    let tenant = &provisioned.tenant;
    let paths = tenant.paths(&services.config.layout);

    if provisioned.dry_run {
        println!("[dry-run] tenant {} would be created; nothing was changed", tenant.name);
    } else {
        println!("tenant {} created", tenant.name);
    }
    println!("  email:      {}", tenant.email);
    println!("  sftp user:  {} (uid {})", tenant.sftp_username, tenant.sftp_uid);
    println!("  quota:      {} KB ({} MB)", tenant.quota_kb, tenant.quota_mb());
    println!("  upload dir: {}", paths.upload_dir.display());
    println!("  web link:   {}", paths.web_link.display());
    if let Some(url) = &provisioned.clone_url {
        println!("  repository: {}", url);
    }
    if !provisioned.dry_run {
        println!("  password:   {}", provisioned.password);
        println!("  (shown once; it is not stored anywhere)");
    }
    println!("  notify:     {}", provisioned.notification);
    if let Some(path) = &provisioned.log_path {
        println!("  log:        {}", path.display());
    }
    Ok(())
}

pub async fn delete(services: &TenantServices, name: String, confirmed: bool) -> Result<(), AppError> {
    let report = services.delete(&name, confirmed).await;
    match report {
        Ok(report) => {
            print_teardown(&name, &report);
            Ok(())
        }
        Err(LifecycleError::TeardownIncomplete { name, report }) => {
            print_teardown(&name, &report);
            Err(AppError::new(
                ExitStatus::IncompleteTeardown,
                format!(
                    "teardown of `{}` incomplete; clean up manually: {}",
                    name,
                    report.failures().join("; ")
                ),
            ))
        }
        Err(err) => Err(err.into()),
    }
}

fn print_teardown(name: &str, report: &TeardownReport) {
    let prefix = if report.dry_run { "[dry-run] " } else { "" };
    println!("{}deleting tenant {}", prefix, name);
    for (step, outcome) in &report.steps {
        let status = match outcome {
            StepOutcome::Done => "ok".to_string(),
            StepOutcome::Skipped(why) => format!("skipped ({})", why),
            StepOutcome::Failed(err) => format!("FAILED: {}", err),
        };
        println!("  {:<28} {}", step.to_string(), status);
    }
}

pub async fn info(services: &TenantServices, name: String) -> Result<(), AppError> {
    let info = services.info(&name).await?;
    let tenant = &info.tenant;

    println!("Tenant:        {}", tenant.name);
    println!("Status:        {}", tenant.status);
    println!("Email:         {}", tenant.email);
    println!(
        "SFTP account:  {} (uid {}, {})",
        tenant.sftp_username,
        tenant.sftp_uid,
        info.account
            .map(|state| state.to_string())
            .unwrap_or_else(|| "unknown".into())
    );
    println!("Git user:      {}", tenant.gitea_username);
    if let Some(url) = &info.clone_url {
        println!("Repository:    {}", url);
    }
    println!("Quota:         {} KB ({} MB)", tenant.quota_kb, tenant.quota_mb());
    match info.usage_kb {
        Some(used) => println!(
            "Usage:         {} KB ({}% of quota)",
            used,
            used.saturating_mul(100) / tenant.quota_kb.max(1)
        ),
        None => println!("Usage:         unknown"),
    }
    println!(
        "SSH key:       {}",
        tenant.ssh_key_fingerprint.as_deref().unwrap_or("none")
    );
    println!("Created:       {}", timestamp(tenant, true));
    println!("Updated:       {}", timestamp(tenant, false));
    println!("Directories:");
    for (label, path) in [
        ("sftp home", info.paths.sftp_home.as_path()),
        ("upload dir", info.paths.upload_dir.as_path()),
        ("web link", info.paths.web_link.as_path()),
        ("git worktree", info.paths.git_worktree.as_path()),
        ("ssh keys", info.authorized_keys.as_path()),
    ] {
        println!("  {:<13} {} {}", label, path.display(), presence(path).await);
    }
    Ok(())
}

pub async fn list(services: &TenantServices, filter: StatusFilter) -> Result<(), AppError> {
    let mut tenants: Vec<Tenant> = services.store.list(filter).try_collect().await?;
    tenants.sort_by(|a, b| a.name.cmp(&b.name));

    if tenants.is_empty() {
        println!("no tenants");
        return Ok(());
    }
    println!(
        "{:<20} {:<8} {:>6} {:>10}  {:<32} {}",
        "NAME", "STATUS", "UID", "QUOTA MB", "EMAIL", "CREATED"
    );
    for tenant in &tenants {
        println!(
            "{:<20} {:<8} {:>6} {:>10}  {:<32} {}",
            tenant.name,
            tenant.status.to_string(),
            tenant.sftp_uid,
            tenant.quota_mb(),
            tenant.email,
            tenant.created_at.format("%Y-%m-%d")
        );
    }
    println!("{} tenant(s)", tenants.len());
    Ok(())
}

pub async fn enable(services: &TenantServices, name: String) -> Result<(), AppError> {
    let updated = services.enable(&name).await?;
    print_update(services, &updated, &format!("tenant {} enabled", name));
    Ok(())
}

pub async fn disable(services: &TenantServices, name: String) -> Result<(), AppError> {
    let updated = services.disable(&name).await?;
    print_update(services, &updated, &format!("tenant {} disabled", name));
    Ok(())
}

pub async fn update_email(services: &TenantServices, name: String, email: String) -> Result<(), AppError> {
    let updated = services.update_email(&name, &email).await?;
    print_update(
        services,
        &updated,
        &format!("contact of {} is now {}", name, updated.tenant.email),
    );
    Ok(())
}

pub async fn update_quota(services: &TenantServices, name: String, quota_kb: u64) -> Result<(), AppError> {
    let updated = services.update_quota(&name, quota_kb).await?;
    print_update(
        services,
        &updated,
        &format!(
            "quota of {} is now {} KB ({} MB)",
            name,
            updated.tenant.quota_kb,
            updated.tenant.quota_mb()
        ),
    );
    Ok(())
}

pub async fn rotate_ssh_key(services: &TenantServices, name: String, public_key: String) -> Result<(), AppError> {
    let rotated = services.rotate_ssh_key(&name, &public_key).await?;
    let prefix = if services.dry_run() { "[dry-run] " } else { "" };
    println!("{}SSH key for {} rotated", prefix, name);
    println!("  fingerprint: {}", rotated.sha256);
    println!("  legacy:      {}", rotated.md5);
    println!("  notify:      {}", rotated.notification);
    Ok(())
}

pub async fn queue_flush(services: &TenantServices) -> Result<(), AppError> {
    let Some(notifier) = &services.notifier else {
        println!("notifications are disabled; nothing to flush");
        return Ok(());
    };
    if services.dry_run() {
        println!("[dry-run] queue flush skipped");
        return Ok(());
    }
    let report = notifier.flush().await?;
    println!(
        "{} message(s) sent, {} still queued",
        report.sent, report.still_queued
    );
    Ok(())
}

fn print_update(services: &TenantServices, updated: &Updated, done: &str) {
    let prefix = if services.dry_run() { "[dry-run] " } else { "" };
    if !updated.changed {
        println!("nothing to do: tenant {} unchanged", updated.tenant.name);
        return;
    }
    println!("{}{}", prefix, done);
    for outcome in &updated.notifications {
        if *outcome != NotificationOutcome::Disabled {
            println!("  notify: {}", outcome);
        }
    }
}

fn timestamp(tenant: &Tenant, created: bool) -> String {
    let at = if created {
        tenant.created_at
    } else {
        tenant.updated_at
    };
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

async fn presence(path: &Path) -> &'static str {
    match fs::symlink_metadata(path).await {
        Ok(_) => "",
        Err(_) => "(missing)",
    }
}
