//! Per-attempt rollback log for tenant creation.
//!
//! Holds the ordered compensations of the steps committed so far and mirrors
//! every event as one JSON line in `create-<name>-<timestamp>.log`. The file
//! is never removed; the in-memory view dies with the attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    fmt, io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

/// The ten provisioning steps, in execution order.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    AllocateUid = 1,
    CreateAccount,
    CreateChroot,
    CreateRepo,
    CreateRemoteUser,
    AddCollaborator,
    InitializeRepo,
    CreateSymlink,
    PersistRecord,
    Notify,
}

impl Step {
    pub const ALL: [Step; 10] = [
        Step::AllocateUid,
        Step::CreateAccount,
        Step::CreateChroot,
        Step::CreateRepo,
        Step::CreateRemoteUser,
        Step::AddCollaborator,
        Step::InitializeRepo,
        Step::CreateSymlink,
        Step::PersistRecord,
        Step::Notify,
    ];

    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn describe(self) -> &'static str {
        match self {
            Step::AllocateUid => "allocate uid",
            Step::CreateAccount => "create OS account",
            Step::CreateChroot => "create chroot tree",
            Step::CreateRepo => "create remote repository",
            Step::CreateRemoteUser => "create remote user",
            Step::AddCollaborator => "add read-only collaborator",
            Step::InitializeRepo => "initialize repository content",
            Step::CreateSymlink => "create web symlink",
            Step::PersistRecord => "persist tenant record",
            Step::Notify => "notify",
        }
    }

    /// Steps that talk to the Git hosting service.
    pub fn is_remote(self) -> bool {
        matches!(
            self,
            Step::CreateRepo | Step::CreateRemoteUser | Step::AddCollaborator | Step::InitializeRepo
        )
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step {}/10 ({})", self.number(), self.describe())
    }
}

/// The inverse of one committed step.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Compensation {
    DeleteOsAccount { username: String },
    RemoveChroot { username: String, path: PathBuf },
    DeleteRemoteRepo { repo: String },
    DeleteRemoteUser { username: String },
    RemoveCollaborator { repo: String, username: String },
    RemoveSymlink { path: PathBuf },
    DeleteRecord { name: String },
}

impl fmt::Display for Compensation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compensation::DeleteOsAccount { username } => write!(f, "delete OS account {}", username),
            Compensation::RemoveChroot { path, .. } => write!(f, "remove chroot {}", path.display()),
            Compensation::DeleteRemoteRepo { repo } => write!(f, "delete remote repository {}", repo),
            Compensation::DeleteRemoteUser { username } => write!(f, "delete remote user {}", username),
            Compensation::RemoveCollaborator { repo, username } => {
                write!(f, "remove collaborator {} from {}", username, repo)
            }
            Compensation::RemoveSymlink { path } => write!(f, "remove symlink {}", path.display()),
            Compensation::DeleteRecord { name } => write!(f, "delete tenant record {}", name),
        }
    }
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("rollback log {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("encoding rollback log entry failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Serialize, Debug)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Event<'a> {
    Started {
        tenant: &'a str,
        attempt: Uuid,
    },
    StepCommitted {
        step: Step,
        #[serde(skip_serializing_if = "Option::is_none")]
        compensation: Option<&'a Compensation>,
    },
    StepFailed {
        step: Step,
        error: &'a str,
    },
    Compensated {
        compensation: &'a Compensation,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<&'a str>,
    },
    Finished {
        outcome: &'a str,
    },
}

#[derive(Serialize, Debug)]
struct Line<'a> {
    at: DateTime<Utc>,
    #[serde(flatten)]
    event: Event<'a>,
}

/// Rollback log of a single creation attempt.
#[derive(Debug)]
pub struct RollbackLog {
    sink: Option<(PathBuf, File)>,
    entries: Vec<Compensation>,
}

impl RollbackLog {
    /// Open a fresh log file for `tenant` under `dir` and record `started`.
    pub async fn create(dir: &Path, tenant: &str) -> Result<Self, LogError> {
        let path = dir.join(format!(
            "create-{}-{}.log",
            tenant,
            Utc::now().format("%Y%m%dT%H%M%S%.6fZ")
        ));
        let io_err = |source| LogError::Io {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(dir).await.map_err(io_err)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(io_err)?;
        debug!("rollback log at {}", path.display());

        let mut log = Self {
            sink: Some((path, file)),
            entries: Vec::new(),
        };
        log.write(Event::Started {
            tenant,
            attempt: Uuid::new_v4(),
        })
        .await?;
        Ok(log)
    }

    /// A log that only keeps its in-memory view (dry-run).
    pub fn in_memory() -> Self {
        Self {
            sink: None,
            entries: Vec::new(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.sink.as_ref().map(|(path, _)| path.as_path())
    }

    /// Compensations recorded so far, in commit order.
    pub fn compensations(&self) -> &[Compensation] {
        &self.entries
    }

    /// Record a committed step. The compensation is kept in memory even
    /// when writing the line fails.
    pub async fn committed(
        &mut self,
        step: Step,
        compensation: Option<Compensation>,
    ) -> Result<(), LogError> {
        let pushed = compensation.is_some();
        self.entries.extend(compensation);
        let recorded = if pushed { self.entries.last() } else { None };
        let line = serialize(Event::StepCommitted {
            step,
            compensation: recorded,
        })?;
        self.append(line).await
    }

    pub async fn failed(&mut self, step: Step, error: &str) -> Result<(), LogError> {
        self.write(Event::StepFailed { step, error }).await
    }

    pub async fn compensated(
        &mut self,
        compensation: &Compensation,
        error: Option<&str>,
    ) -> Result<(), LogError> {
        self.write(Event::Compensated {
            compensation,
            error,
        })
        .await
    }

    pub async fn finished(&mut self, outcome: &str) -> Result<(), LogError> {
        self.write(Event::Finished { outcome }).await
    }

    /// Drain the compensations, last committed first.
    pub fn drain_reversed(&mut self) -> Vec<Compensation> {
        let mut entries = std::mem::take(&mut self.entries);
        entries.reverse();
        entries
    }

    async fn write(&mut self, event: Event<'_>) -> Result<(), LogError> {
        let line = serialize(event)?;
        self.append(line).await
    }

    async fn append(&mut self, mut line: Vec<u8>) -> Result<(), LogError> {
        let Some((path, file)) = self.sink.as_mut() else {
            return Ok(());
        };
        line.push(b'\n');
        let written = async {
            file.write_all(&line).await?;
            file.sync_data().await
        }
        .await;
        written.map_err(|source| LogError::Io {
            path: path.clone(),
            source,
        })
    }
}

fn serialize(event: Event<'_>) -> Result<Vec<u8>, LogError> {
    Ok(serde_json::to_vec(&Line {
        at: Utc::now(),
        event,
    })?)
}
