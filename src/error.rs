//! Error taxonomy for proxy credential acquisition.
//!
//! Each variant maps to one failure class of the credential lifecycle. The acquisition flows
//! ([`crate::ca_exchange`], the myproxy refresh inside [`crate::orchestrator`]) convert most of
//! these into a logged failure and an absent result; only [`ProxyError::Ownership`] and
//! [`ProxyError::NoCredentialSource`] leave the orchestrator as hard failures.

use std::fmt;
use std::path::PathBuf;

/// Result alias used across the library
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Main error type for proxy credential operations
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    /// Key generation or CSR signing failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Certificate file missing, unreadable or without a usable validity block
    #[error("Cannot parse certificate {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    /// Proxy directory creation failed or the target file already exists
    #[error("Store error at {path}: {reason}")]
    Store { path: PathBuf, reason: String },

    /// The CA could not be reached
    #[error("Transport error: {0}")]
    Transport(String),

    /// The CA answered with something other than HTTP 200
    #[error("CA rejected the request with status {status}: {message}")]
    Rejected { status: u16, message: String },

    /// Bound credentials failed the permission audit
    #[error(transparent)]
    Ownership(#[from] OwnershipError),

    /// External proxy issuance failed
    #[error("Proxy issuance failed: {0}")]
    Issuance(String),

    /// No proxy file, local certificate directory or myproxy host available
    #[error("No credential source available for {identity}")]
    NoCredentialSource { identity: String },

    /// Certificate validity tolerance must be strictly positive
    #[error("Validity tolerance must be a positive number of hours, got {0}")]
    InvalidTolerance(i64),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ProxyError {
    /// Build a [`ProxyError::Crypto`] from any message
    pub fn crypto<S: Into<String>>(message: S) -> Self {
        Self::Crypto(message.into())
    }

    /// Build a [`ProxyError::Parse`] for the certificate at `path`
    pub fn parse<P: Into<PathBuf>, S: Into<String>>(path: P, reason: S) -> Self {
        Self::Parse {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Build a [`ProxyError::Store`] for the store location `path`
    pub fn store<P: Into<PathBuf>, S: Into<String>>(path: P, reason: S) -> Self {
        Self::Store {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// What was wrong with one audited path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Offence {
    /// A directory role the process cannot read
    NotReadable { user: String },
    /// A private file owned by someone else
    ForeignOwner { owner: String, expected: String },
    /// The bound path does not exist
    Missing,
}

/// One offending credential path found by the audit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipViolation {
    /// Configuration key the path was bound under (e.g. `X509_USER_KEY`)
    pub key: String,
    pub path: PathBuf,
    pub offence: Offence,
}

impl fmt::Display for OwnershipViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.offence {
            Offence::NotReadable { user } => write!(
                f,
                "{} ({}) not readable by {}",
                self.key,
                self.path.display(),
                user
            ),
            Offence::ForeignOwner { owner, expected } => write!(
                f,
                "{} ({}) owned by {} instead of {}",
                self.key,
                self.path.display(),
                owner,
                expected
            ),
            Offence::Missing => write!(f, "{} ({}) does not exist", self.key, self.path.display()),
        }
    }
}

/// Fatal audit failure listing every offending path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipError {
    pub violations: Vec<OwnershipViolation>,
}

impl OwnershipError {
    /// Offending paths in audit order
    pub fn paths(&self) -> Vec<&PathBuf> {
        self.violations.iter().map(|v| &v.path).collect()
    }
}

impl fmt::Display for OwnershipError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Certificates ownership problem")?;
        for violation in &self.violations {
            write!(f, "; {}", violation)?;
        }
        Ok(())
    }
}

impl std::error::Error for OwnershipError {}
