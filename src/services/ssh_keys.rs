//! OpenSSH public key parsing and fingerprints.

use base64::{Engine as _, engine::general_purpose};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Key algorithms accepted for tenant uploads.
pub const ALLOWED_ALGORITHMS: &[&str] = &[
    "ssh-ed25519",
    "ssh-rsa",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
    "sk-ssh-ed25519@openssh.com",
    "sk-ecdsa-sha2-nistp256@openssh.com",
];

const MAX_COMMENT_LEN: usize = 256;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("expected a single `<algorithm> <base64> [comment]` line")]
    Malformed,
    #[error("key algorithm `{0}` is not accepted")]
    UnsupportedAlgorithm(String),
    #[error("key material is not valid base64")]
    InvalidEncoding,
    #[error("key declares `{declared}` but its material encodes `{embedded}`")]
    AlgorithmMismatch { declared: String, embedded: String },
}

/// A validated single-line OpenSSH public key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthorizedKey {
    algorithm: String,
    blob: Vec<u8>,
    comment: Option<String>,
}

impl AuthorizedKey {
    /// Parse `algorithm base64 [comment]`. Option prefixes
    /// (`command="..."`, `from=...`) are refused.
    pub fn parse(line: &str) -> Result<Self, KeyError> {
        let line = line.trim();
        if line.is_empty() || line.contains(['\n', '\r', '\0']) {
            return Err(KeyError::Malformed);
        }

        let mut parts = line.splitn(3, char::is_whitespace);
        let algorithm = parts.next().ok_or(KeyError::Malformed)?;
        let encoded = parts
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(KeyError::Malformed)?;
        let comment = parts
            .next()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        if !ALLOWED_ALGORITHMS.contains(&algorithm) {
            return Err(KeyError::UnsupportedAlgorithm(algorithm.to_string()));
        }
        if comment
            .as_deref()
            .is_some_and(|c| c.len() > MAX_COMMENT_LEN || c.chars().any(char::is_control))
        {
            return Err(KeyError::Malformed);
        }

        let blob = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| KeyError::InvalidEncoding)?;
        let embedded = embedded_algorithm(&blob).ok_or(KeyError::InvalidEncoding)?;
        if embedded != algorithm {
            return Err(KeyError::AlgorithmMismatch {
                declared: algorithm.to_string(),
                embedded: embedded.to_string(),
            });
        }

        Ok(Self {
            algorithm: algorithm.to_string(),
            blob,
            comment,
        })
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// The line written to the authorized keys file.
    pub fn to_line(&self) -> String {
        let encoded = general_purpose::STANDARD.encode(&self.blob);
        match &self.comment {
            Some(comment) => format!("{} {} {}", self.algorithm, encoded, comment),
            None => format!("{} {}", self.algorithm, encoded),
        }
    }

    /// `SHA256:<unpadded base64>`, as printed by `ssh-keygen -l`.
    pub fn fingerprint_sha256(&self) -> String {
        let digest = Sha256::digest(&self.blob);
        format!("SHA256:{}", general_purpose::STANDARD_NO_PAD.encode(digest))
    }

    /// Legacy `MD5:aa:bb:...` form.
    pub fn fingerprint_md5(&self) -> String {
        let digest = md5::compute(&self.blob);
        let hex: Vec<String> = digest.0.iter().map(|b| format!("{:02x}", b)).collect();
        format!("MD5:{}", hex.join(":"))
    }
}

/// The algorithm name stored as the first length-prefixed string of a key blob.
fn embedded_algorithm(blob: &[u8]) -> Option<&str> {
    let len_bytes: [u8; 4] = blob.get(..4)?.try_into().ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let name = blob.get(4..4usize.checked_add(len)?)?;
    std::str::from_utf8(name).ok()
}
