//! Proxy Store Module
//!
//! Persists proxy credentials under a per-identity directory below the certificate base
//! directory:
//!
//! ```text
//! <base>/
//!   simple_ca/                 default CA certificates directory
//!   <identity>.pem             proxy issued by myproxy
//!   <identity>/
//!     .username                owner marker (optional)
//!     usercert.pem             pre-provisioned long-lived pair
//!     userkey.pem
//!     userproxy.crt            installed proxy
//!     <uuid>.pem               proxy fetched from the CA
//! ```
//!
//! # Security Features
//!
//! - **Restrictive file permissions**: 0600 (owner read/write only) on every key/cert file
//! - **No overwrite on create**: fresh proxies go to a random path opened with `create_new`, so a
//!   concurrent reader never sees a half-written credential
//! - **Replace, never edit**: installing a proxy copies a complete staged file over the target
//!
//! Two processes refreshing the same identity are not coordinated; the last install wins.

use crate::error::{ProxyError, Result};
use openssl::pkey::{PKey, Private};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// File name of an installed proxy inside the identity directory
pub const PROXY_FILE_NAME: &str = "userproxy.crt";
/// Owner marker written next to stored proxies
pub const OWNER_MARKER_FILE: &str = ".username";
/// Pre-provisioned certificate pair
pub const USER_KEY_FILE: &str = "userkey.pem";
pub const USER_CERT_FILE: &str = "usercert.pem";
/// Default CA certificates directory under the base directory
pub const DEFAULT_CA_DIR_NAME: &str = "simple_ca";

const PRIVATE_FILE_MODE: u32 = 0o600;

/// Filesystem store for proxy credentials
#[derive(Debug, Clone)]
pub struct ProxyStore {
    base_dir: PathBuf,
}

impl ProxyStore {
    /// Create a store rooted at `base_dir`
    ///
    /// The directory is not created here; identity directories are created lazily on save.
    pub fn new<P: Into<PathBuf>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Root directory of the store
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Directory holding everything that belongs to `identity`
    ///
    /// # Errors
    /// Returns [`ProxyError::Store`] if `identity` is empty, `.`, `..` or contains a path
    /// separator, so no layout path can leave the base directory.
    pub fn proxy_dir(&self, identity: &str) -> Result<PathBuf> {
        Ok(self.base_dir.join(checked_identity(&self.base_dir, identity)?))
    }

    /// Conventional path of the installed proxy for `identity`
    pub fn proxy_path(&self, identity: &str) -> Result<PathBuf> {
        Ok(self.proxy_dir(identity)?.join(PROXY_FILE_NAME))
    }

    /// Path where myproxy writes the proxy for `identity`
    pub fn myproxy_path(&self, identity: &str) -> Result<PathBuf> {
        let identity = checked_identity(&self.base_dir, identity)?;
        Ok(self.base_dir.join(format!("{}.pem", identity)))
    }

    /// Pre-provisioned `(key, cert)` pair for `identity`
    pub fn local_cert_pair(&self, identity: &str) -> Result<(PathBuf, PathBuf)> {
        let dir = self.proxy_dir(identity)?;
        Ok((dir.join(USER_KEY_FILE), dir.join(USER_CERT_FILE)))
    }

    /// CA certificates directory used when none is configured
    pub fn default_ca_dir(&self) -> PathBuf {
        self.base_dir.join(DEFAULT_CA_DIR_NAME)
    }

    /// Persist a freshly signed proxy
    ///
    /// Writes the private key PEM followed by `cert_pem` into a new random-named file inside the
    /// identity directory. The file is created with `create_new` and mode 0600.
    ///
    /// # Arguments
    /// * `private_key` - Key the certificate was issued for
    /// * `cert_pem` - PEM certificate body returned by the CA
    /// * `identity` - Owner of the proxy directory
    /// * `owner_tag` - Optional identity string recorded in `.username`
    ///
    /// # Errors
    /// Returns [`ProxyError::Store`] if:
    /// - The certificate body is empty
    /// - The identity directory cannot be created
    /// - The random path already exists (retry with a new name)
    /// - Writing the file fails
    pub fn save(
        &self,
        private_key: &PKey<Private>,
        cert_pem: &[u8],
        identity: &str,
        owner_tag: Option<&str>,
    ) -> Result<PathBuf> {
        let file_name = format!("{}.pem", uuid::Uuid::new_v4());
        self.save_as(private_key, cert_pem, identity, owner_tag, &file_name)
    }

    fn save_as(
        &self,
        private_key: &PKey<Private>,
        cert_pem: &[u8],
        identity: &str,
        owner_tag: Option<&str>,
        file_name: &str,
    ) -> Result<PathBuf> {
        if cert_pem.iter().all(u8::is_ascii_whitespace) {
            return Err(ProxyError::store(&self.base_dir, "Certificate body is empty"));
        }

        let dir = self.ensure_proxy_dir(identity)?;
        let key_pem = private_key
            .private_key_to_pem_pkcs8()
            .map_err(|e| ProxyError::crypto(format!("Failed to encode private key: {}", e)))?;

        let path = dir.join(file_name);
        let mut contents = key_pem;
        contents.extend_from_slice(cert_pem);
        write_private_file(&path, &contents)?;
        if let Some(tag) = owner_tag {
            self.write_owner_tag(&dir, tag)?;
        }

        tracing::debug!(path = %path.display(), identity, "Wrote proxy certificate");
        Ok(path)
    }

    /// Install a staged proxy file as the identity's `userproxy.crt`
    ///
    /// The staged file is copied over the destination, restricted to 0600 and removed.
    pub fn install(&self, staged: &Path, identity: &str, owner_tag: Option<&str>) -> Result<PathBuf> {
        let dir = self.ensure_proxy_dir(identity)?;
        let destination = dir.join(PROXY_FILE_NAME);
        if staged != destination {
            fs::copy(staged, &destination).map_err(|e| {
                ProxyError::store(
                    &destination,
                    format!("Failed to copy {}: {}", staged.display(), e),
                )
            })?;
            if let Err(e) = fs::remove_file(staged) {
                tracing::warn!(path = %staged.display(), error = %e, "Could not remove staged proxy");
            }
        }
        set_private_permissions(&destination)?;
        if let Some(tag) = owner_tag {
            self.write_owner_tag(&dir, tag)?;
        }

        tracing::info!(path = %destination.display(), identity, "Installed proxy certificate");
        Ok(destination)
    }

    /// Identity recorded in the owner marker, if any
    pub fn owner_tag(&self, identity: &str) -> Option<String> {
        fs::read_to_string(self.proxy_dir(identity).ok()?.join(OWNER_MARKER_FILE))
            .ok()
            .map(|tag| tag.trim().to_string())
    }

    fn ensure_proxy_dir(&self, identity: &str) -> Result<PathBuf> {
        let dir = self.proxy_dir(identity)?;
        fs::create_dir_all(&dir)
            .map_err(|e| ProxyError::store(&dir, format!("Failed to create directory: {}", e)))?;
        Ok(dir)
    }

    fn write_owner_tag(&self, dir: &Path, tag: &str) -> Result<()> {
        let marker = dir.join(OWNER_MARKER_FILE);
        fs::write(&marker, tag)
            .map_err(|e| ProxyError::store(&marker, format!("Failed to write owner marker: {}", e)))
    }
}

fn checked_identity<'i>(base_dir: &Path, identity: &'i str) -> Result<&'i str> {
    if identity.is_empty()
        || identity == "."
        || identity == ".."
        || identity.contains(['/', '\\', '\0'])
    {
        return Err(ProxyError::store(
            base_dir,
            format!("Invalid identity name {:?}", identity),
        ));
    }
    Ok(identity)
}

fn write_private_file(path: &Path, contents: &[u8]) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(PRIVATE_FILE_MODE);
    }

    let mut file = options.open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::AlreadyExists {
            ProxyError::store(path, "File already exists, retry with a new name")
        } else {
            ProxyError::store(path, format!("Failed to create file: {}", e))
        }
    })?;
    file.write_all(contents)
        .and_then(|_| file.flush())
        .map_err(|e| ProxyError::store(path, format!("Failed to write file: {}", e)))
}

fn set_private_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(PRIVATE_FILE_MODE))
            .map_err(|e| ProxyError::store(path, format!("Failed to set permissions: {}", e)))?;
    }
    Ok(())
}
