//! Pure syntax and policy checks for tenant names, contact addresses,
//! quotas and ports. Nothing here touches the filesystem or the network.

use ::validator::ValidateEmail;
use thiserror::Error;

pub const NAME_MIN_LEN: usize = 3;
pub const NAME_MAX_LEN: usize = 20;

const EMAIL_MAX_LEN: usize = 254;

/// Names that collide with system accounts, service users or well-known
/// mailbox and host names.
const RESERVED_NAMES: &[&str] = &[
    "admin",
    "administrator",
    "root",
    "daemon",
    "bin",
    "sys",
    "sync",
    "nobody",
    "operator",
    "backup",
    "system",
    "www",
    "www-data",
    "web",
    "mail",
    "postmaster",
    "hostmaster",
    "webmaster",
    "abuse",
    "noreply",
    "support",
    "ftp",
    "sftp",
    "ssh",
    "git",
    "gitea",
    "nginx",
    "certbot",
    "msmtp",
    "api",
    "cdn",
    "static",
    "assets",
    "localhost",
    "default",
    "public",
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("tenant name `{name}` must be between 3 and 20 characters")]
    InvalidLength { name: String },
    #[error("tenant name `{name}` may only contain lowercase letters, digits, `-` and `_`")]
    InvalidCharset { name: String },
    #[error("tenant name `{name}` {reason}")]
    InvalidBoundary { name: String, reason: &'static str },
    #[error("tenant name `{name}` is reserved")]
    Reserved { name: String },
    #[error("`{0}` is not a valid email address")]
    InvalidFormat(String),
    #[error("quota `{0}` must be a positive integer number of KB")]
    NotPositiveInteger(String),
    #[error("port `{0}` must be an integer between 1 and 65535")]
    InvalidPort(String),
}

pub type ValidationResult<T> = Result<T, ValidationError>;

fn is_separator(c: char) -> bool {
    c == '-' || c == '_'
}

/// Validate a tenant name.
///
/// - 3–20 characters
/// - lowercase letters, digits, `-` and `_` only
/// - must start and end with a letter or digit
/// - no two separators in a row (`--`, `__`, `-_`, `_-`)
/// - not a reserved word
pub fn validate_name(name: &str) -> ValidationResult<()> {
    let len = name.chars().count();
    if !(NAME_MIN_LEN..=NAME_MAX_LEN).contains(&len) {
        return Err(ValidationError::InvalidLength {
            name: name.to_string(),
        });
    }

    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9') || is_separator(c))
    {
        return Err(ValidationError::InvalidCharset {
            name: name.to_string(),
        });
    }

    if name.starts_with(is_separator) || name.ends_with(is_separator) {
        return Err(ValidationError::InvalidBoundary {
            name: name.to_string(),
            reason: "must start and end with a lowercase letter or digit",
        });
    }

    let chars: Vec<char> = name.chars().collect();
    if chars
        .windows(2)
        .any(|pair| is_separator(pair[0]) && is_separator(pair[1]))
    {
        return Err(ValidationError::InvalidBoundary {
            name: name.to_string(),
            reason: "cannot contain consecutive separators",
        });
    }

    if RESERVED_NAMES.contains(&name) {
        return Err(ValidationError::Reserved {
            name: name.to_string(),
        });
    }

    Ok(())
}

/// Validate a contact address. Single-label hosts (`root@localhost`) are
/// accepted; line breaks never are, so the value is safe in mail headers.
pub fn validate_email(addr: &str) -> ValidationResult<()> {
    if addr.len() > EMAIL_MAX_LEN || addr.trim() != addr || !addr.validate_email() {
        return Err(ValidationError::InvalidFormat(addr.to_string()));
    }
    Ok(())
}

/// Parse and validate a quota given as raw operator input.
pub fn validate_quota(raw: &str) -> ValidationResult<u64> {
    let kb = raw
        .trim()
        .parse::<u64>()
        .map_err(|_| ValidationError::NotPositiveInteger(raw.to_string()))?;
    validate_quota_kb(kb)
}

/// Validate an already-numeric quota.
pub fn validate_quota_kb(kb: u64) -> ValidationResult<u64> {
    if kb == 0 {
        return Err(ValidationError::NotPositiveInteger(kb.to_string()));
    }
    Ok(kb)
}

/// Parse and validate a TCP port.
pub fn validate_port(raw: &str) -> ValidationResult<u16> {
    match raw.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(ValidationError::InvalidPort(raw.to_string())),
    }
}
