//! Permission audit of bound credential paths
//!
//! Before bound credentials are used, every path is checked against the identity of the running
//! process:
//!
//! - directory roles (`X509_CERT_DIR` and any `*CERT_DIR` variable) must be readable;
//! - every other credential file must be owned by the effective uid of the process.
//!
//! The audit collects every offending path before failing, so one run reports all problems.

use crate::credential_binding::{CredentialBinding, CREDENTIAL_KEY_PREFIX};
use crate::error::{Offence, OwnershipError, OwnershipViolation};
use nix::unistd::{access, geteuid, AccessFlags, Uid, User};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// Checks credential paths against an expected owner
#[derive(Debug, Clone, Copy)]
pub struct PermissionAuditor {
    expected_uid: Uid,
}

impl Default for PermissionAuditor {
    fn default() -> Self {
        Self::for_current_process()
    }
}

impl PermissionAuditor {
    /// Audit against the effective uid of this process
    pub fn for_current_process() -> Self {
        Self {
            expected_uid: geteuid(),
        }
    }

    /// Audit against an explicit owner
    pub fn for_uid(expected_uid: Uid) -> Self {
        Self { expected_uid }
    }

    /// Audit the three paths of a binding
    ///
    /// # Errors
    /// Returns [`OwnershipError`] listing every offending path.
    pub fn audit(&self, binding: &CredentialBinding) -> Result<(), OwnershipError> {
        let violations: Vec<_> = binding
            .entries()
            .filter_map(|(role, path)| self.check(role.env_key(), path, role.is_directory()))
            .collect();
        self.finish(violations)
    }

    /// Audit every `X509*` variable of the process environment
    pub fn audit_environment(&self) -> Result<(), OwnershipError> {
        self.audit_variables(std::env::vars_os().filter_map(|(key, value)| {
            Some((key.into_string().ok()?, value.into()))
        }))
    }

    /// Audit `(key, path)` pairs, ignoring keys outside the credential namespace
    pub fn audit_variables<I>(&self, variables: I) -> Result<(), OwnershipError>
    where
        I: IntoIterator<Item = (String, std::path::PathBuf)>,
    {
        let violations: Vec<_> = variables
            .into_iter()
            .filter(|(key, _)| key.starts_with(CREDENTIAL_KEY_PREFIX))
            .filter_map(|(key, path)| {
                let is_directory = key.to_lowercase().ends_with("cert_dir");
                self.check(&key, &path, is_directory)
            })
            .collect();
        self.finish(violations)
    }

    fn check(&self, key: &str, path: &Path, is_directory: bool) -> Option<OwnershipViolation> {
        let offence = if is_directory {
            self.check_readable(path)
        } else {
            self.check_owner(path)
        }?;
        tracing::error!(key, path = %path.display(), offence = ?offence, "Credential path failed audit");
        Some(OwnershipViolation {
            key: key.to_string(),
            path: path.to_path_buf(),
            offence,
        })
    }

    fn check_readable(&self, path: &Path) -> Option<Offence> {
        if !path.exists() {
            return Some(Offence::Missing);
        }
        // access(2) answers for the real uid of this process
        match access(path, AccessFlags::R_OK) {
            Ok(()) => None,
            Err(_) => Some(Offence::NotReadable {
                user: user_name(self.expected_uid),
            }),
        }
    }

    fn check_owner(&self, path: &Path) -> Option<Offence> {
        let metadata = match std::fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(_) => return Some(Offence::Missing),
        };
        let owner = Uid::from_raw(metadata.uid());
        if owner == self.expected_uid {
            return None;
        }
        Some(Offence::ForeignOwner {
            owner: user_name(owner),
            expected: user_name(self.expected_uid),
        })
    }

    fn finish(&self, violations: Vec<OwnershipViolation>) -> Result<(), OwnershipError> {
        if violations.is_empty() {
            Ok(())
        } else {
            Err(OwnershipError { violations })
        }
    }
}

/// Login name for `uid`, or the numeric uid when there is no passwd entry
pub fn user_name(uid: Uid) -> String {
    match User::from_uid(uid) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    }
}
