//! grid-proxy - Short-lived X.509 proxy credentials for grid clients
//!
//! Grid services (iRODS, GridFTP, ...) authenticate users with short-lived proxy certificates.
//! This library obtains such a proxy, keeps it on disk with restrictive permissions, binds its
//! paths for downstream client code and refuses to hand out credentials owned by someone else.
//!
//! # Overview
//!
//! A credential comes from one of three sources, chosen once per run:
//!
//! ```text
//! explicit proxy file ──► Direct
//! <base>/<identity>/  ──► LocalLookup     (userkey.pem + usercert.pem)
//! myproxy configured  ──► MyproxyRefresh  (<base>/<identity>.pem, re-issued when expired)
//!                             │
//!                    bind ──► audit ──► done
//! ```
//!
//! Proxies can also be requested from a delegating CA: a fresh RSA key and CSR are posted to the
//! CA and the signed certificate is stored next to its key.
//!
//! # Features
//!
//! - 🔐 **Fresh keys per request**: RSA (2048-bit default) with SHA-256 signed CSRs
//! - ⏱️ **Validity window**: native certificate parsing with a configurable grace period
//! - 🔒 **Private files**: every stored key/cert is created `create_new` with mode 0600
//! - 🔗 **Atomic binding**: CA dir, user key and user cert are always replaced together
//! - ✅ **Ownership audit**: every bound path is checked against the running uid
//!
//! # Quick Start
//!
//! ```bash
//! # Inspect a proxy
//! grid-proxy check /opt/certificates/alice.pem
//!
//! # Acquire, bind and audit credentials for an identity
//! grid-proxy acquire --identity alice
//! ```
//!
//! ## As a Library
//!
//! ```no_run
//! use grid_proxy::credential_binding::BindingSlot;
//! use grid_proxy::myproxy::{MyproxyLogon, SystemCommandRunner};
//! use grid_proxy::orchestrator::{AcquisitionRequest, ProxyOrchestrator};
//! use grid_proxy::proxy_store::ProxyStore;
//!
//! fn main() -> grid_proxy::error::Result<()> {
//!     let store = ProxyStore::new("/opt/certificates");
//!     let issuer = MyproxyLogon::new(SystemCommandRunner);
//!     let slot = BindingSlot::new();
//!
//!     let request = AcquisitionRequest::for_identity("alice");
//!     let outcome = ProxyOrchestrator::new(&store, &issuer, &slot)
//!         .run(&request)?;
//!     println!("Bound {} via {}", outcome.binding.user_cert.display(), outcome.plan.kind());
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! ## [`generate_proxy_request`]
//!
//! Builder for an RSA key and a PKCS#10 request carrying the subject CN.
//!
//! ```no_run
//! use grid_proxy::generate_proxy_request::RsaProxyRequestBuilder;
//!
//! let (key, csr) = RsaProxyRequestBuilder::new()
//!     .subject_common_name("alice".to_string())
//!     .key_size(2048)
//!     .build()?;
//! # Ok::<(), grid_proxy::error::ProxyError>(())
//! ```
//!
//! ## [`validity`]
//!
//! `valid = notBefore < now && notAfter > now - tolerance`. A certificate that expired less than
//! `tolerance` ago still counts as valid.
//!
//! ```no_run
//! use grid_proxy::validity::check_validity;
//!
//! let validity = check_validity("/opt/certificates/alice.pem", 1)?;
//! println!("valid until {}", validity.not_after);
//! # Ok::<(), grid_proxy::error::ProxyError>(())
//! ```
//!
//! ## [`proxy_store`]
//!
//! On-disk layout below the certificate base directory, plus `save`/`install` of proxies.
//!
//! ## [`ca_exchange`]
//!
//! `POST <ca>/ca/o/delegateduser` with the CSR; failures are logged and yield `None`.
//!
//! ## [`myproxy`]
//!
//! Issuance through `myproxy-logon`, passphrase on stdin only.
//!
//! ## [`credential_binding`]
//!
//! [`credential_binding::CredentialBinding`] and its sinks: an in-memory
//! [`credential_binding::BindingSlot`] and the `X509_*` process environment.
//!
//! ## [`permission_audit`]
//!
//! Ownership and readability checks of bound paths.
//!
//! ## [`orchestrator`]
//!
//! Source resolution, refresh, bind and audit.
//!
//! # Security Considerations
//!
//! - ✅ Keys never leave the process except into 0600 files
//! - ✅ Passphrases and tokens are held in `secrecy::SecretString` and never logged
//! - ✅ Unaudited credentials are unbound when the audit fails
//! - ⚠️ No cross-process lock: two refreshes of the same identity race, last writer wins
//! - ⚠️ Unix only (uid ownership, file modes)
//!
//! # Error Handling
//!
//! Library APIs return [`error::Result`] with the [`error::ProxyError`] taxonomy. Only
//! [`error::ProxyError::Ownership`] carries the full list of offending paths:
//!
//! ```no_run
//! use grid_proxy::error::ProxyError;
//! # fn example(result: grid_proxy::error::Result<()>) {
//! if let Err(ProxyError::Ownership(err)) = result {
//!     for path in err.paths() {
//!         eprintln!("refusing {}", path.display());
//!     }
//! }
//! # }
//! ```

pub mod ca_exchange;
pub mod configs;
pub mod credential_binding;
pub mod error;
pub mod generate_proxy_request;
pub mod myproxy;
pub mod orchestrator;
pub mod permission_audit;
pub mod proxy_store;
pub mod validity;

#[cfg(test)]
mod testutil;
