//! Proxy acquisition from a delegating CA
//!
//! The exchange is a single round trip:
//!
//! 1. generate an RSA key and a CSR ([`crate::generate_proxy_request`]);
//! 2. `POST <base>/ca/o/delegateduser` with `certificate_request=<PEM CSR>`;
//! 3. on HTTP 200 with a PEM certificate body, store key and certificate through the
//!    [`ProxyStore`].
//!
//! [`CaExchange::proxy_from_ca`] never fails past its own boundary. Transport errors, non-200
//! answers and bodies that are not a certificate are logged and turned into `None`.

use crate::error::{ProxyError, Result};
use crate::generate_proxy_request::{
    encode_csr, RsaProxyRequestBuilder, DEFAULT_SUBJECT_COMMON_NAME, RSA_KEY_SIZE_DEFAULT,
};
use crate::proxy_store::ProxyStore;
use openssl::x509::X509;
use secrecy::{ExposeSecret, SecretString};
use std::path::PathBuf;
use std::time::Duration;

/// Path of the delegation endpoint relative to the CA base URL
pub const DELEGATION_PATH: &str = "ca/o/delegateduser";
const HTTP_OK: u16 = 200;

/// Raw answer from the CA
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// HTTP session able to reach the CA
pub trait CaClient {
    /// POST form `data` to `path` with extra `headers`
    ///
    /// Only failures to get any answer are errors; every HTTP status comes back as a
    /// [`CaResponse`].
    fn post(
        &self,
        path: &str,
        data: &[(String, String)],
        headers: &[(&str, &str)],
    ) -> Result<CaResponse>;
}

/// Blocking `reqwest` client for the CA
pub struct HttpCaClient {
    base_url: String,
    token: Option<SecretString>,
    client: reqwest::blocking::Client,
}

impl HttpCaClient {
    pub fn new(base_url: &str, token: Option<SecretString>, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProxyError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }
}

impl CaClient for HttpCaClient {
    fn post(
        &self,
        path: &str,
        data: &[(String, String)],
        headers: &[(&str, &str)],
    ) -> Result<CaResponse> {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut request = self.client.post(&url).form(data);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request
            .send()
            .map_err(|e| ProxyError::Transport(format!("POST {} failed: {}", url, e)))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .map_err(|e| ProxyError::Transport(format!("Reading response from {}: {}", url, e)))?;
        Ok(CaResponse {
            status,
            body: body.to_vec(),
        })
    }
}

/// CA exchange flow bound to a proxy store
pub struct CaExchange<'a> {
    store: &'a ProxyStore,
    subject_common_name: String,
    key_size: u32,
}

impl<'a> CaExchange<'a> {
    pub fn new(store: &'a ProxyStore) -> Self {
        Self {
            store,
            subject_common_name: DEFAULT_SUBJECT_COMMON_NAME.to_string(),
            key_size: RSA_KEY_SIZE_DEFAULT,
        }
    }

    pub fn subject_common_name(mut self, cn: String) -> Self {
        self.subject_common_name = cn;
        self
    }

    pub fn key_size(mut self, bits: u32) -> Self {
        self.key_size = bits;
        self
    }

    /// Request a proxy from the CA and store it for `identity`
    ///
    /// Returns the stored path, or `None` after logging why the exchange failed.
    pub fn proxy_from_ca(
        &self,
        client: &dyn CaClient,
        identity: &str,
        owner_tag: Option<&str>,
    ) -> Option<PathBuf> {
        match self.try_proxy_from_ca(client, identity, owner_tag) {
            Ok(path) => {
                tracing::debug!(path = %path.display(), identity, "Wrote certificate from CA");
                Some(path)
            }
            Err(ProxyError::Transport(reason)) => {
                tracing::error!(identity, reason = %reason, "CA is probably down");
                None
            }
            Err(ProxyError::Rejected { status, message }) => {
                tracing::error!(identity, status, message = %message, "Could not get proxy from CA");
                None
            }
            Err(e) => {
                tracing::error!(identity, error = %e, "Proxy exchange with CA failed");
                None
            }
        }
    }

    fn try_proxy_from_ca(
        &self,
        client: &dyn CaClient,
        identity: &str,
        owner_tag: Option<&str>,
    ) -> Result<PathBuf> {
        let (key, request) = RsaProxyRequestBuilder::new()
            .subject_common_name(self.subject_common_name.clone())
            .key_size(self.key_size)
            .build()?;

        let response = client.post(
            DELEGATION_PATH,
            &encode_csr(&request)?,
            &[("Accept-Encoding", "identity")],
        )?;
        if response.status != HTTP_OK {
            return Err(ProxyError::Rejected {
                status: response.status,
                message: String::from_utf8_lossy(&response.body).trim().to_string(),
            });
        }

        if let Err(e) = X509::from_pem(&response.body) {
            return Err(ProxyError::Rejected {
                status: response.status,
                message: format!("Response body is not a PEM certificate: {}", e),
            });
        }

        self.store.save(&key, &response.body, identity, owner_tag)
    }
}
