mod common;

use common::{Harness, Outbox, queued_notifier};
use std::{sync::Arc, time::Duration};
use tenantctl::{
    models::{
        notification::{Delivery, Recipient, Severity},
        tenant::{StatusFilter, TenantStatus},
    },
    services::{
        NotificationOutcome,
        accounts::AccountState,
        lifecycle::{LifecycleError, StepOutcome, TeardownStep},
        locks::LockError,
        notifier::Notifier,
        provisioning_saga::CreateRequest,
    },
};
use futures::TryStreamExt;

const KEY: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAABAgMEBQYHCAkKCwwNDg8QERITFBUWFxgZGhscHR4f ops@acme";

async fn provisioned(h: &Harness, name: &str) {
    h.services
        .create(CreateRequest {
            name: name.to_string(),
            email: format!("ops@{}.test", name),
            quota_kb: None,
        })
        .await
        .unwrap();
}

fn severities(h: &Harness) -> Vec<Severity> {
    h.notifier.notices().iter().map(|n| n.severity).collect()
}

#[tokio::test]
async fn quota_update_round_trips() {
    let h = Harness::new();
    provisioned(&h, "acme").await;

    let updated = h.services.update_quota("acme", 204_800).await.unwrap();
    assert_eq!(updated.tenant.quota_kb, 204_800);
    assert_eq!(updated.tenant.quota_mb(), 200);
    assert!(updated.tenant.updated_at > updated.tenant.created_at);

    let stored = h.services.store.read("acme").await.unwrap();
    assert_eq!(stored, updated.tenant);

    let notice = h.notifier.notices().pop().unwrap();
    assert!(notice.body.contains("from 100 MB to 200 MB"), "{}", notice.body);

    assert!(matches!(
        h.services.update_quota("acme", 0).await,
        Err(LifecycleError::Validation(_))
    ));
}

#[tokio::test]
async fn repeated_quota_notice_is_suppressed_within_cooldown() {
    let h = Harness::with_config(|cfg| cfg.notify_cooldown = Duration::from_secs(60));
    provisioned(&h, "acme").await;

    h.services.update_quota("acme", 204_800).await.unwrap();
    let notice = h.notifier.notices().pop().unwrap();
    assert_eq!(notice.dedup_key.as_deref(), Some("quota-acme-204800"));
    assert_eq!(notice.cooldown, Duration::from_secs(60));

    let outbox = Arc::new(Outbox::default());
    let mut services = h.services.clone();
    services.notifier = Some(Arc::new(queued_notifier(outbox.clone()).await) as Arc<dyn Notifier>);

    let sent = NotificationOutcome::Delivered(Delivery::Sent);
    let suppressed = NotificationOutcome::Delivered(Delivery::Suppressed);
    let first = services.update_quota("acme", 409_600).await.unwrap();
    assert_eq!(first.notifications, vec![sent.clone()]);
    let repeat = services.update_quota("acme", 409_600).await.unwrap();
    assert_eq!(repeat.notifications, vec![suppressed]);
    // A different value is news again.
    let other = services.update_quota("acme", 102_400).await.unwrap();
    assert_eq!(other.notifications, vec![sent]);

    assert_eq!(outbox.sent.lock().unwrap().len(), 2);
    assert_eq!(services.store.read("acme").await.unwrap().quota_kb, 102_400);
}

#[tokio::test]
async fn disable_and_enable_notify_with_matching_severity() {
    let h = Harness::new();
    provisioned(&h, "acme").await;

    let disabled = h.services.disable("acme").await.unwrap();
    assert!(disabled.changed);
    assert_eq!(disabled.tenant.status, TenantStatus::Disabled);
    assert!(h.accounts.get("acme").unwrap().locked);

    let enabled = h.services.enable("acme").await.unwrap();
    assert_eq!(enabled.tenant.status, TenantStatus::Active);
    assert!(!h.accounts.get("acme").unwrap().locked);

    assert_eq!(
        severities(&h),
        vec![Severity::Info, Severity::Warning, Severity::Info]
    );
    assert_eq!(
        h.services.store.read("acme").await.unwrap().status,
        TenantStatus::Active
    );
}

#[tokio::test]
async fn disabling_twice_is_a_no_op() {
    let h = Harness::new();
    provisioned(&h, "acme").await;

    h.services.disable("acme").await.unwrap();
    let before = h.services.store.read("acme").await.unwrap();

    let again = h.services.disable("acme").await.unwrap();
    assert!(!again.changed);
    assert!(again.notifications.is_empty());
    assert_eq!(h.services.store.read("acme").await.unwrap(), before);
    assert_eq!(h.notifier.notices().len(), 2);
}

#[tokio::test]
async fn list_filters_by_status() {
    let h = Harness::new();
    for name in ["alpha", "bravo", "charlie"] {
        provisioned(&h, name).await;
    }
    h.services.disable("bravo").await.unwrap();

    let mut active: Vec<String> = h
        .services
        .store
        .list(StatusFilter::Active)
        .map_ok(|t| t.name)
        .try_collect()
        .await
        .unwrap();
    active.sort();
    assert_eq!(active, vec!["alpha", "charlie"]);

    let disabled: Vec<String> = h
        .services
        .store
        .list(StatusFilter::Disabled)
        .map_ok(|t| t.name)
        .try_collect()
        .await
        .unwrap();
    assert_eq!(disabled, vec!["bravo"]);
}

#[tokio::test]
async fn delete_removes_everything_and_is_idempotent() {
    let h = Harness::new();
    provisioned(&h, "acme").await;

    let report = h.services.delete("acme", true).await.unwrap();
    assert!(report.is_complete());
    assert_eq!(report.steps.len(), TeardownStep::ALL.len());
    assert!(report.steps.iter().all(|(_, outcome)| *outcome == StepOutcome::Done));
    h.assert_no_residue("acme").await;

    // Notify goes out first, while the tenant still exists.
    let last = h.notifier.notices().pop().unwrap();
    assert_eq!(last.severity, Severity::Warning);

    assert!(matches!(
        h.services.delete("acme", true).await,
        Err(LifecycleError::NotFound(name)) if name == "acme"
    ));
}

#[tokio::test]
async fn delete_requires_confirmation() {
    let h = Harness::new();
    provisioned(&h, "acme").await;

    assert!(matches!(
        h.services.delete("acme", false).await,
        Err(LifecycleError::ConfirmationRequired(_))
    ));
    assert!(h.services.store.exists("acme").await);
    assert!(h.accounts.get("acme").is_some());
}

#[tokio::test]
async fn delete_keeps_going_past_a_failed_step() {
    let h = Harness::new();
    provisioned(&h, "acme").await;
    h.accounts.fail("delete_chroot");

    let err = h.services.delete("acme", true).await.unwrap_err();
    let LifecycleError::TeardownIncomplete { report, .. } = &err else {
        panic!("expected an incomplete teardown, got {}", err);
    };
    assert!(matches!(
        report.outcome(TeardownStep::RemoveChroot),
        Some(StepOutcome::Failed(_))
    ));
    assert_eq!(report.failures().len(), 1);
    assert!(err.to_string().contains("remove chroot"));

    // Only the chroot survives.
    assert!(h.layout().sftp_home("acme").exists());
    assert!(h.accounts.get("acme").is_none());
    assert!(h.git.is_empty());
    assert!(!h.services.store.exists("acme").await);
}

#[tokio::test]
async fn delete_without_git_skips_remote_steps() {
    let h = Harness::without_git();
    provisioned(&h, "acme").await;

    let report = h.services.delete("acme", true).await.unwrap();
    for step in [
        TeardownStep::RemoveCollaborator,
        TeardownStep::RemoveRemoteUser,
        TeardownStep::RemoveRemoteRepo,
    ] {
        assert_eq!(
            report.outcome(step),
            Some(&StepOutcome::Skipped("Git hosting disabled"))
        );
    }
    h.assert_no_residue("acme").await;
}

#[tokio::test]
async fn update_email_notifies_old_and_new_address() {
    let h = Harness::new();
    provisioned(&h, "acme").await;

    let updated = h
        .services
        .update_email("acme", "billing@acme.test")
        .await
        .unwrap();
    assert!(updated.changed);
    assert_eq!(updated.notifications.len(), 2);
    assert_eq!(
        h.services.store.read("acme").await.unwrap().email,
        "billing@acme.test"
    );

    let notices = h.notifier.notices();
    let addressed: Vec<(String, Severity)> = notices[1..]
        .iter()
        .map(|n| match &n.recipient {
            Recipient::Tenant { email, .. } => (email.clone(), n.severity),
            Recipient::Admin => panic!("unexpected admin notice"),
        })
        .collect();
    assert_eq!(
        addressed,
        vec![
            ("ops@acme.test".to_string(), Severity::Warning),
            ("billing@acme.test".to_string(), Severity::Info),
        ]
    );

    let same = h
        .services
        .update_email("acme", "billing@acme.test")
        .await
        .unwrap();
    assert!(!same.changed);

    assert!(matches!(
        h.services.update_email("acme", "nope").await,
        Err(LifecycleError::Validation(_))
    ));
}

#[tokio::test]
async fn rotate_ssh_key_installs_key_and_records_fingerprint() {
    let h = Harness::new();
    provisioned(&h, "acme").await;

    let rotated = h.services.rotate_ssh_key("acme", KEY).await.unwrap();
    assert_eq!(
        rotated.sha256,
        "SHA256:ZkAslGjFiUHdGf/WUL8rQvkib4PTvQatUV0OUQSncCA"
    );
    assert_eq!(
        rotated.tenant.ssh_key_fingerprint.as_deref(),
        Some(rotated.sha256.as_str())
    );
    assert_eq!(h.accounts.get("acme").unwrap().key.as_deref(), Some(KEY));

    let notice = h.notifier.notices().pop().unwrap();
    assert!(notice.body.contains("SHA256:ZkAslGjFiUHdGf/WUL8rQvkib4PTvQatUV0OUQSncCA"));
    assert!(notice.body.contains("MD5:0f:a2:0a:d7:38:3e:65:45:08:6b:63:84:1c:ff:dc:ba"));
}

#[tokio::test]
async fn rotate_rejects_malformed_keys() {
    let h = Harness::new();
    provisioned(&h, "acme").await;

    for bad in ["", "ssh-ed25519", "ssh-ed25519 !!!notbase64", "ssh-dss AAAAB3NzaC1kc3M="] {
        assert!(
            matches!(
                h.services.rotate_ssh_key("acme", bad).await,
                Err(LifecycleError::InvalidKey(_))
            ),
            "accepted `{}`",
            bad
        );
    }
    assert!(h.accounts.get("acme").unwrap().key.is_none());
    assert!(
        h.services
            .store
            .read("acme")
            .await
            .unwrap()
            .ssh_key_fingerprint
            .is_none()
    );
}

#[tokio::test]
async fn operations_on_unknown_tenants_are_not_found() {
    let h = Harness::new();

    assert!(matches!(
        h.services.disable("ghost").await,
        Err(LifecycleError::NotFound(_))
    ));
    assert!(matches!(
        h.services.update_quota("ghost", 1024).await,
        Err(LifecycleError::NotFound(_))
    ));
    assert!(matches!(
        h.services.info("ghost").await,
        Err(LifecycleError::NotFound(_))
    ));
    assert!(matches!(
        h.services.rotate_ssh_key("ghost", KEY).await,
        Err(LifecycleError::NotFound(_))
    ));
    assert!(h.notifier.notices().is_empty());
}

#[tokio::test]
async fn info_reports_account_usage_and_paths() {
    let h = Harness::new();
    provisioned(&h, "acme").await;
    let tenant = h.services.store.read("acme").await.unwrap();
    std::fs::write(tenant.paths(h.layout()).upload_dir.join("index.html"), vec![b'x'; 1500])
        .unwrap();

    let info = h.services.info("acme").await.unwrap();
    assert_eq!(info.account, Some(AccountState::Active));
    assert_eq!(info.usage_kb, Some(2));
    assert_eq!(
        info.clone_url.as_deref(),
        Some("ssh://git@git.test:22/tenants/acme.git")
    );
    assert_eq!(info.authorized_keys, h.layout().authorized_keys_file("acme"));
    assert_eq!(info.paths, tenant.paths(h.layout()));
}

#[tokio::test]
async fn dry_run_leaves_records_untouched() {
    let h = Harness::new();
    provisioned(&h, "acme").await;
    let before = h.services.store.read("acme").await.unwrap();

    let mut dry = h.services.clone();
    let mut config = (*dry.config).clone();
    config.dry_run = true;
    dry.config = std::sync::Arc::new(config);

    let planned = dry.disable("acme").await.unwrap();
    assert_eq!(planned.tenant.status, TenantStatus::Disabled);
    assert_eq!(planned.notifications, vec![NotificationOutcome::Skipped]);

    dry.update_quota("acme", 1024).await.unwrap();
    let report = dry.delete("acme", true).await.unwrap();
    assert!(report.dry_run);
    assert_eq!(
        report.outcome(TeardownStep::RemoveRecord),
        Some(&StepOutcome::Skipped("dry-run"))
    );

    assert_eq!(h.services.store.read("acme").await.unwrap(), before);
    assert!(!h.accounts.get("acme").unwrap().locked);
    assert_eq!(h.notifier.notices().len(), 1);
}

#[tokio::test]
async fn busy_tenant_lock_blocks_lifecycle_calls() {
    let h = Harness::new();
    provisioned(&h, "acme").await;
    let _held = h.services.locks.tenant("acme").unwrap();

    assert!(matches!(
        h.services.disable("acme").await,
        Err(LifecycleError::Lock(LockError::Busy(_)))
    ));
    assert!(matches!(
        h.services.delete("acme", true).await,
        Err(LifecycleError::Lock(LockError::Busy(_)))
    ));
    assert!(h.services.store.exists("acme").await);
}
