use crate::services::{
    lifecycle::LifecycleError, locks::LockError, notifier::NotifyError,
    provisioning_saga::ProvisioningError, tenant_store::StoreError,
};
use std::{fmt, process::ExitCode};

/// Process exit status per failure class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitStatus {
    Success = 0,
    Internal = 1,
    Validation = 2,
    Precondition = 3,
    ResourceExhausted = 4,
    StepFailure = 5,
    Persistence = 6,
    IncompleteTeardown = 7,
}

impl From<ExitStatus> for ExitCode {
    fn from(status: ExitStatus) -> Self {
        ExitCode::from(status as u8)
    }
}

/// An operator-facing failure: a message and the exit status it maps to.
#[derive(Debug)]
pub struct AppError {
    pub status: ExitStatus,
    pub message: String,
}

impl AppError {
    pub fn new(status: ExitStatus, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for exit status 1.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ExitStatus::Internal, msg)
    }

    /// Shortcut for a precondition failure (exit status 3).
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::new(ExitStatus::Precondition, msg)
    }

    pub fn exit_code(&self) -> ExitCode {
        self.status.into()
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(format!("{:#}", err))
    }
}

impl From<LockError> for AppError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Busy(_) => AppError::precondition(err.to_string()),
            LockError::Io { .. } => AppError::internal(err.to_string()),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        let status = match err {
            StoreError::NotFound(_) => ExitStatus::Precondition,
            StoreError::Corrupt { .. } | StoreError::Persistence { .. } | StoreError::Io(_) => {
                ExitStatus::Persistence
            }
        };
        AppError::new(status, err.to_string())
    }
}

impl From<NotifyError> for AppError {
    fn from(err: NotifyError) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<ProvisioningError> for AppError {
    fn from(err: ProvisioningError) -> Self {
        let status = match &err {
            ProvisioningError::Validation(_) => ExitStatus::Validation,
            ProvisioningError::AlreadyExists(_) => ExitStatus::Precondition,
            ProvisioningError::UidExhausted { .. } => ExitStatus::ResourceExhausted,
            ProvisioningError::Lock(LockError::Busy(_)) => ExitStatus::Precondition,
            ProvisioningError::Lock(_) | ProvisioningError::Log(_) => ExitStatus::Internal,
            ProvisioningError::StepFailed { .. } => ExitStatus::StepFailure,
        };
        let mut message = err.to_string();
        if let ProvisioningError::StepFailed {
            compensations,
            log_path,
            ..
        } = &err
        {
            for outcome in compensations {
                match &outcome.error {
                    None => message.push_str(&format!("\n  undone: {}", outcome.compensation)),
                    Some(e) => message.push_str(&format!(
                        "\n  NOT undone: {} ({})",
                        outcome.compensation, e
                    )),
                }
            }
            if let Some(path) = log_path {
                message.push_str(&format!("\n  rollback log: {}", path.display()));
            }
        }
        AppError::new(status, message)
    }
}

impl From<LifecycleError> for AppError {
    fn from(err: LifecycleError) -> Self {
        let status = match &err {
            LifecycleError::Validation(_) | LifecycleError::InvalidKey(_) => ExitStatus::Validation,
            LifecycleError::NotFound(_) | LifecycleError::ConfirmationRequired(_) => {
                ExitStatus::Precondition
            }
            LifecycleError::Lock(LockError::Busy(_)) => ExitStatus::Precondition,
            LifecycleError::Lock(_) => ExitStatus::Internal,
            LifecycleError::Store(_) => ExitStatus::Persistence,
            LifecycleError::Account { .. } => ExitStatus::StepFailure,
            LifecycleError::TeardownIncomplete { .. } => ExitStatus::IncompleteTeardown,
        };
        AppError::new(status, err.to_string())
    }
}
