//! Credential bindings consumed by grid client code
//!
//! A [`CredentialBinding`] names the three paths a grid client needs: the CA certificates
//! directory, the user key and the user certificate. Bindings are always replaced as a whole.
//!
//! Where the binding ends up is decided by a [`CredentialSink`]:
//! - [`BindingSlot`] keeps it in a shared in-memory slot handed to downstream code.
//! - [`ProcessEnvironment`] exports it as `X509_*` variables for external grid tools.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

/// Environment variable naming the CA certificates directory
pub const CA_DIR_KEY: &str = "X509_CERT_DIR";
/// Environment variable naming the user private key
pub const USER_KEY_KEY: &str = "X509_USER_KEY";
/// Environment variable naming the user certificate
pub const USER_CERT_KEY: &str = "X509_USER_CERT";
/// Prefix shared by every credential variable swept by the audit
pub const CREDENTIAL_KEY_PREFIX: &str = "X509";

/// Logical role of a bound path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialRole {
    CaDir,
    UserKey,
    UserCert,
}

impl CredentialRole {
    pub const ALL: [CredentialRole; 3] = [Self::CaDir, Self::UserKey, Self::UserCert];

    pub fn env_key(self) -> &'static str {
        match self {
            Self::CaDir => CA_DIR_KEY,
            Self::UserKey => USER_KEY_KEY,
            Self::UserCert => USER_CERT_KEY,
        }
    }

    /// Directory roles only need to be readable; file roles must be owned
    pub fn is_directory(self) -> bool {
        matches!(self, Self::CaDir)
    }
}

/// Complete set of credential paths for one orchestration run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialBinding {
    pub ca_dir: PathBuf,
    pub user_key: PathBuf,
    pub user_cert: PathBuf,
}

impl CredentialBinding {
    pub fn new<P: Into<PathBuf>>(ca_dir: P, user_key: P, user_cert: P) -> Self {
        Self {
            ca_dir: ca_dir.into(),
            user_key: user_key.into(),
            user_cert: user_cert.into(),
        }
    }

    /// Binding where one combined proxy file serves as both key and certificate
    pub fn combined<P: Into<PathBuf>>(ca_dir: P, proxy_file: &Path) -> Self {
        Self {
            ca_dir: ca_dir.into(),
            user_key: proxy_file.to_path_buf(),
            user_cert: proxy_file.to_path_buf(),
        }
    }

    pub fn path(&self, role: CredentialRole) -> &Path {
        match role {
            CredentialRole::CaDir => &self.ca_dir,
            CredentialRole::UserKey => &self.user_key,
            CredentialRole::UserCert => &self.user_cert,
        }
    }

    /// `(role, path)` pairs in a fixed order
    pub fn entries(&self) -> impl Iterator<Item = (CredentialRole, &Path)> {
        CredentialRole::ALL
            .into_iter()
            .map(move |role| (role, self.path(role)))
    }
}

/// Destination of a credential binding
///
/// `bind` replaces all three paths at once; no observer may see a mix of old and new paths.
pub trait CredentialSink {
    fn bind(&self, binding: &CredentialBinding);
    fn clear(&self);
}

/// Shared in-memory slot holding the active binding
#[derive(Debug, Clone, Default)]
pub struct BindingSlot {
    active: Arc<RwLock<Option<CredentialBinding>>>,
}

impl BindingSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the active binding
    pub fn current(&self) -> Option<CredentialBinding> {
        match self.active.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl CredentialSink for BindingSlot {
    fn bind(&self, binding: &CredentialBinding) {
        let mut guard = match self.active.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(binding.clone());
    }

    fn clear(&self) {
        let mut guard = match self.active.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = None;
    }
}

static ENVIRONMENT_LOCK: Mutex<()> = Mutex::new(());

/// Exports bindings as process environment variables
///
/// All writers go through one process-wide lock so the three variables change together.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnvironment;

impl ProcessEnvironment {
    /// Binding currently exported, if all three variables are set
    pub fn current() -> Option<CredentialBinding> {
        let _guard = ENVIRONMENT_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Some(CredentialBinding {
            ca_dir: std::env::var_os(CA_DIR_KEY)?.into(),
            user_key: std::env::var_os(USER_KEY_KEY)?.into(),
            user_cert: std::env::var_os(USER_CERT_KEY)?.into(),
        })
    }
}

impl CredentialSink for ProcessEnvironment {
    fn bind(&self, binding: &CredentialBinding) {
        let _guard = ENVIRONMENT_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (role, path) in binding.entries() {
            std::env::set_var(role.env_key(), path);
        }
        tracing::debug!(
            ca_dir = %binding.ca_dir.display(),
            user_key = %binding.user_key.display(),
            user_cert = %binding.user_cert.display(),
            "Exported credential environment"
        );
    }

    fn clear(&self) {
        let _guard = ENVIRONMENT_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for role in CredentialRole::ALL {
            std::env::remove_var(role.env_key());
        }
    }
}
