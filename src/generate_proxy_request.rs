//! Proxy Request Generation Module
//!
//! Generates the key material and PKCS#10 certificate signing request (CSR) that is sent to a
//! delegating CA in exchange for a short-lived proxy certificate.
//!
//! # Request Properties
//! - **Key Type**: RSA, 2048-bit by default, never below 1024-bit
//! - **Signature Algorithm**: SHA-256 with RSA
//! - **Subject**: a single common name (CN)
//! - **Version**: PKCS#10 v1
//!
//! The private key never leaves the process until it is written next to the signed
//! certificate by [`crate::proxy_store::ProxyStore::save`].
//!
//! # Example
//! ```rust,no_run
//! # use grid_proxy::generate_proxy_request::RsaProxyRequestBuilder;
//! # fn example() -> grid_proxy::error::Result<()> {
//! let (private_key, request) = RsaProxyRequestBuilder::new()
//!     .subject_common_name("alice".to_string())
//!     .key_size(2048)
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use crate::error::{ProxyError, Result};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509Name, X509Req};

const X509_REQ_VERSION_1: i32 = 0; // PKCS#10 v1 is represented by 0
/// Default RSA modulus size for proxy keys
pub const RSA_KEY_SIZE_DEFAULT: u32 = 2048;
/// Smallest RSA modulus accepted
pub const RSA_KEY_SIZE_MINIMUM: u32 = 1024;
/// Subject used when the CA ignores the requested name
pub const DEFAULT_SUBJECT_COMMON_NAME: &str = "TestUser";

/// Builder for an RSA key pair and a self-signed certificate signing request
///
/// # Examples
/// ```rust,no_run
/// # use grid_proxy::generate_proxy_request::RsaProxyRequestBuilder;
/// # fn example() -> grid_proxy::error::Result<()> {
/// let (key, csr) = RsaProxyRequestBuilder::new()
///     .subject_common_name("svc-irods".to_string())
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RsaProxyRequestBuilder {
    subject_common_name: String,
    key_size: u32,
}

impl Default for RsaProxyRequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RsaProxyRequestBuilder {
    /// Create a builder with the default subject and key size
    pub fn new() -> Self {
        Self {
            subject_common_name: DEFAULT_SUBJECT_COMMON_NAME.to_string(),
            key_size: RSA_KEY_SIZE_DEFAULT,
        }
    }

    /// Set the common name (CN) carried by the request
    pub fn subject_common_name(mut self, cn: String) -> Self {
        self.subject_common_name = cn;
        self
    }

    /// Set the RSA modulus size in bits
    ///
    /// # Arguments
    /// * `bits` - Key size; values below 1024 make `build()` fail
    pub fn key_size(mut self, bits: u32) -> Self {
        self.key_size = bits;
        self
    }

    /// Build the RSA key pair and the signed request
    ///
    /// # Returns
    /// * `Ok((PKey<Private>, X509Req))` - Tuple of (private key, signed CSR)
    ///
    /// # Errors
    /// Returns [`ProxyError::Crypto`] if:
    /// - The key size is below the minimum
    /// - The subject common name is empty
    /// - RSA key generation or CSR signing fails
    pub fn build(self) -> Result<(PKey<Private>, X509Req)> {
        if self.key_size < RSA_KEY_SIZE_MINIMUM {
            return Err(ProxyError::crypto(format!(
                "RSA key size {} is below the minimum of {} bits",
                self.key_size, RSA_KEY_SIZE_MINIMUM
            )));
        }
        if self.subject_common_name.is_empty() {
            return Err(ProxyError::crypto("Subject common name must not be empty"));
        }

        let rsa = openssl::rsa::Rsa::generate(self.key_size)
            .map_err(|e| ProxyError::crypto(format!("Failed to generate RSA keypair: {}", e)))?;
        let private_key = PKey::from_rsa(rsa)
            .map_err(|e| ProxyError::crypto(format!("Failed to create private key: {}", e)))?;

        let mut builder = X509Req::builder()
            .map_err(|e| ProxyError::crypto(format!("Failed to create CSR builder: {}", e)))?;
        builder
            .set_version(X509_REQ_VERSION_1)
            .map_err(|e| ProxyError::crypto(format!("Failed to set version: {}", e)))?;

        let mut name_builder = X509Name::builder()
            .map_err(|e| ProxyError::crypto(format!("Failed to create name builder: {}", e)))?;
        name_builder
            .append_entry_by_nid(Nid::COMMONNAME, &self.subject_common_name)
            .map_err(|e| ProxyError::crypto(format!("Failed to set CN: {}", e)))?;
        let subject_name = name_builder.build();

        builder
            .set_subject_name(&subject_name)
            .map_err(|e| ProxyError::crypto(format!("Failed to set subject: {}", e)))?;
        builder
            .set_pubkey(&private_key)
            .map_err(|e| ProxyError::crypto(format!("Failed to set public key: {}", e)))?;

        // Self-signature proves possession of the private key
        builder
            .sign(&private_key, MessageDigest::sha256())
            .map_err(|e| ProxyError::crypto(format!("Failed to sign CSR: {}", e)))?;

        Ok((private_key, builder.build()))
    }
}

/// Generate a key pair and CSR for `subject_name` with the default key size
pub fn generate_csr_and_key(subject_name: &str) -> Result<(PKey<Private>, X509Req)> {
    RsaProxyRequestBuilder::new()
        .subject_common_name(subject_name.to_string())
        .build()
}

/// Encode a CSR as the form fields expected by the delegation endpoint
pub fn encode_csr(request: &X509Req) -> Result<Vec<(String, String)>> {
    let pem = request
        .to_pem()
        .map_err(|e| ProxyError::crypto(format!("Failed to encode CSR as PEM: {}", e)))?;
    let pem = String::from_utf8(pem)
        .map_err(|e| ProxyError::crypto(format!("CSR PEM is not valid UTF-8: {}", e)))?;
    Ok(vec![("certificate_request".to_string(), pem)])
}

/// Read back the subject common name of a CSR
pub fn request_common_name(request: &X509Req) -> Option<String> {
    request
        .subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|cn| cn.to_string())
}
