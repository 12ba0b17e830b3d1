//! Proxy Orchestrator
//!
//! Top-level flow for making a credential available to grid client code:
//!
//! ```text
//! resolve ─┬─ Direct          explicit proxy file, bound as key and cert
//!          ├─ LocalLookup     <base>/<identity>/userkey.pem + usercert.pem
//!          └─ MyproxyRefresh  <base>/<identity>.pem, re-issued when not live
//!    │
//!  bind ── audit ── done
//! ```
//!
//! The source is resolved once. Acquisition problems are logged and only surface as a failed run;
//! an audit failure clears the sink and is returned as [`ProxyError::Ownership`].
//!
//! When the sink exports to the process environment, enable
//! [`ProxyOrchestrator::sweep_environment`] so every `X509*` variable is audited as well, not only
//! the three bound paths.

use crate::credential_binding::{CredentialBinding, CredentialSink, CA_DIR_KEY};
use crate::error::{ProxyError, Result};
use crate::myproxy::{MyproxyRequest, ProxyIssuer, DEFAULT_LIFETIME_HOURS};
use crate::permission_audit::PermissionAuditor;
use crate::proxy_store::ProxyStore;
use crate::validity::{check_validity, DEFAULT_TOLERANCE_HOURS};
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// MyProxy server holding a stored credential for the identity
#[derive(Debug)]
pub struct MyproxySource {
    pub host: String,
    pub credential_name: String,
    pub passphrase: SecretString,
    pub lifetime_hours: u32,
}

impl MyproxySource {
    /// Source with the default requested lifetime (one week)
    pub fn new(host: String, credential_name: String, passphrase: SecretString) -> Self {
        Self {
            host,
            credential_name,
            passphrase,
            lifetime_hours: DEFAULT_LIFETIME_HOURS,
        }
    }
}

/// What the caller knows about the credential it wants
#[derive(Debug)]
pub struct AcquisitionRequest {
    pub identity: String,
    /// Explicit proxy file; wins over every other source
    pub proxy_file: Option<PathBuf>,
    pub myproxy: Option<MyproxySource>,
}

impl AcquisitionRequest {
    /// Request with no explicit file and no MyProxy server
    pub fn for_identity<S: Into<String>>(identity: S) -> Self {
        Self {
            identity: identity.into(),
            proxy_file: None,
            myproxy: None,
        }
    }
}

/// Credential source chosen for one run
#[derive(Debug, Clone)]
pub enum AcquisitionPlan<'r> {
    Direct {
        proxy_file: PathBuf,
    },
    LocalLookup {
        user_key: PathBuf,
        user_cert: PathBuf,
    },
    MyproxyRefresh {
        proxy_file: PathBuf,
        source: &'r MyproxySource,
    },
}

impl AcquisitionPlan<'_> {
    /// Short name used in logs and CLI output
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Direct { .. } => "direct",
            Self::LocalLookup { .. } => "local",
            Self::MyproxyRefresh { .. } => "myproxy",
        }
    }
}

/// Result of a successful run
#[derive(Debug, Clone)]
pub struct Orchestration<'r> {
    pub plan: AcquisitionPlan<'r>,
    pub binding: CredentialBinding,
}

/// Resolves, refreshes, binds and audits credentials
pub struct ProxyOrchestrator<'a> {
    store: &'a ProxyStore,
    issuer: &'a dyn ProxyIssuer,
    sink: &'a dyn CredentialSink,
    auditor: PermissionAuditor,
    ca_dir: PathBuf,
    tolerance_hours: i64,
    sweep_environment: bool,
}

impl<'a> ProxyOrchestrator<'a> {
    /// Orchestrator binding into `sink`, auditing against the effective uid of this process
    ///
    /// The CA directory defaults to `<base>/simple_ca` and the validity tolerance to one hour.
    pub fn new(
        store: &'a ProxyStore,
        issuer: &'a dyn ProxyIssuer,
        sink: &'a dyn CredentialSink,
    ) -> Self {
        Self {
            ca_dir: store.default_ca_dir(),
            store,
            issuer,
            sink,
            auditor: PermissionAuditor::for_current_process(),
            tolerance_hours: DEFAULT_TOLERANCE_HOURS,
            sweep_environment: false,
        }
    }

    /// Set the CA certificates directory bound as `X509_CERT_DIR`
    pub fn ca_dir<P: Into<PathBuf>>(mut self, ca_dir: P) -> Self {
        self.ca_dir = ca_dir.into();
        self
    }

    /// Set the auditor checking bound paths
    pub fn auditor(mut self, auditor: PermissionAuditor) -> Self {
        self.auditor = auditor;
        self
    }

    /// Set the grace period, in hours, after a MyProxy proxy's `notAfter`
    pub fn tolerance_hours(mut self, hours: i64) -> Self {
        self.tolerance_hours = hours;
        self
    }

    /// Also audit every `X509*` variable of the process environment after binding
    ///
    /// Enable together with [`crate::credential_binding::ProcessEnvironment`].
    pub fn sweep_environment(mut self, enabled: bool) -> Self {
        self.sweep_environment = enabled;
        self
    }

    /// Pick the credential source for `request`
    ///
    /// # Errors
    /// [`ProxyError::NoCredentialSource`] when there is no explicit file, no local certificate
    /// directory and no MyProxy server; [`ProxyError::Store`] when the identity cannot name a
    /// path inside the store.
    pub fn resolve<'r>(&self, request: &'r AcquisitionRequest) -> Result<AcquisitionPlan<'r>> {
        if let Some(proxy_file) = &request.proxy_file {
            return Ok(AcquisitionPlan::Direct {
                proxy_file: proxy_file.clone(),
            });
        }
        if self.store.proxy_dir(&request.identity)?.is_dir() {
            let (user_key, user_cert) = self.store.local_cert_pair(&request.identity)?;
            return Ok(AcquisitionPlan::LocalLookup {
                user_key,
                user_cert,
            });
        }
        if let Some(source) = &request.myproxy {
            return Ok(AcquisitionPlan::MyproxyRefresh {
                proxy_file: self.store.myproxy_path(&request.identity)?,
                source,
            });
        }
        Err(ProxyError::NoCredentialSource {
            identity: request.identity.clone(),
        })
    }

    /// Acquire, bind and audit a credential
    pub fn run<'r>(&self, request: &'r AcquisitionRequest) -> Result<Orchestration<'r>> {
        let plan = self.resolve(request)?;
        tracing::info!(identity = %request.identity, plan = plan.kind(), "Resolved credential source");

        let binding = match &plan {
            AcquisitionPlan::Direct { proxy_file } => {
                CredentialBinding::combined(&self.ca_dir, proxy_file)
            }
            AcquisitionPlan::LocalLookup {
                user_key,
                user_cert,
            } => CredentialBinding::new(&self.ca_dir, user_key, user_cert),
            AcquisitionPlan::MyproxyRefresh { proxy_file, source } => {
                self.refresh_from_myproxy(&request.identity, source, proxy_file)?;
                CredentialBinding::combined(&self.ca_dir, proxy_file)
            }
        };

        self.sink.bind(&binding);
        let audit = self.auditor.audit(&binding).and_then(|()| {
            if self.sweep_environment {
                self.auditor.audit_environment()
            } else {
                Ok(())
            }
        });
        if let Err(e) = audit {
            self.sink.clear();
            return Err(e.into());
        }

        tracing::info!(
            identity = %request.identity,
            user_cert = %binding.user_cert.display(),
            "Credentials bound"
        );
        Ok(Orchestration { plan, binding })
    }

    fn refresh_from_myproxy(
        &self,
        identity: &str,
        source: &MyproxySource,
        proxy_file: &Path,
    ) -> Result<()> {
        if self.is_live(proxy_file) {
            tracing::debug!(path = %proxy_file.display(), "Reusing live proxy");
            return Ok(());
        }

        let request = MyproxyRequest {
            host: source.host.clone(),
            identity: identity.to_string(),
            credential_name: source.credential_name.clone(),
            passphrase: SecretString::new(source.passphrase.expose_secret().clone()),
            lifetime_hours: source.lifetime_hours,
            output: proxy_file.to_path_buf(),
            env: HashMap::from([(CA_DIR_KEY.to_string(), self.ca_dir.display().to_string())]),
        };
        if let Err(e) = self.issuer.issue(&request) {
            tracing::error!(identity, host = %source.host, error = %e, "Proxy refresh failed");
        }

        if self.is_live(proxy_file) {
            Ok(())
        } else {
            Err(ProxyError::Issuance(format!(
                "No valid proxy for {} at {}",
                identity,
                proxy_file.display()
            )))
        }
    }

    fn is_live(&self, proxy_file: &Path) -> bool {
        if !proxy_file.exists() {
            return false;
        }
        match check_validity(proxy_file, self.tolerance_hours) {
            Ok(validity) => validity.valid,
            Err(e) => {
                tracing::warn!(path = %proxy_file.display(), error = %e, "Unreadable proxy");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential_binding::{BindingSlot, ProcessEnvironment};
    use crate::testutil;
    use chrono::{Duration, Utc};
    use nix::unistd::{geteuid, Uid};
    use std::cell::Cell;
    use std::fs;

    /// Issuer writing a proxy valid for `hours_left` hours
    struct FakeIssuer {
        hours_left: i64,
        calls: Cell<usize>,
    }

    impl FakeIssuer {
        fn valid() -> Self {
            Self {
                hours_left: 12,
                calls: Cell::new(0),
            }
        }
    }

    impl ProxyIssuer for FakeIssuer {
        fn issue(&self, request: &MyproxyRequest) -> Result<()> {
            self.calls.set(self.calls.get() + 1);
            assert!(request.env.contains_key(CA_DIR_KEY));
            let key = testutil::test_key();
            let now = Utc::now();
            let pem = testutil::combined_proxy_pem(
                &key,
                now - Duration::minutes(5),
                now + Duration::hours(self.hours_left),
            );
            fs::write(&request.output, pem).unwrap();
            Ok(())
        }
    }

    struct FailingIssuer;

    impl ProxyIssuer for FailingIssuer {
        fn issue(&self, _: &MyproxyRequest) -> Result<()> {
            Err(ProxyError::Issuance("myproxy-logon exited with 1".to_string()))
        }
    }

    fn workspace() -> (tempfile::TempDir, ProxyStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ProxyStore::new(dir.path());
        fs::create_dir(store.default_ca_dir()).unwrap();
        (dir, store)
    }

    fn myproxy_request(identity: &str) -> AcquisitionRequest {
        AcquisitionRequest {
            myproxy: Some(MyproxySource::new(
                "grid.example.org".to_string(),
                "irods".to_string(),
                SecretString::new("s3cret".to_string()),
            )),
            ..AcquisitionRequest::for_identity(identity)
        }
    }

    #[test]
    fn test_explicit_proxy_file_is_bound_as_key_and_cert() {
        let (_dir, store) = workspace();
        let proxy = store.base_dir().join("given.pem");
        fs::write(&proxy, b"proxy").unwrap();
        let slot = BindingSlot::new();
        let issuer = FakeIssuer::valid();

        let request = AcquisitionRequest {
            proxy_file: Some(proxy.clone()),
            ..myproxy_request("alice")
        };
        let outcome = ProxyOrchestrator::new(&store, &issuer, &slot)
            .run(&request)
            .unwrap();

        assert!(matches!(
            &outcome.plan,
            AcquisitionPlan::Direct { proxy_file } if *proxy_file == proxy
        ));
        assert_eq!(outcome.binding.user_key, proxy);
        assert_eq!(outcome.binding.user_cert, proxy);
        assert_eq!(slot.current(), Some(outcome.binding));
        assert_eq!(issuer.calls.get(), 0);
    }

    #[test]
    fn test_local_directory_binds_long_lived_pair() {
        let (_dir, store) = workspace();
        fs::create_dir(store.proxy_dir("alice").unwrap()).unwrap();
        let (key, cert) = store.local_cert_pair("alice").unwrap();
        fs::write(&key, b"key").unwrap();
        fs::write(&cert, b"cert").unwrap();
        let slot = BindingSlot::new();
        let issuer = FakeIssuer::valid();

        let request = myproxy_request("alice");
        let outcome = ProxyOrchestrator::new(&store, &issuer, &slot)
            .run(&request)
            .unwrap();

        assert_eq!(outcome.plan.kind(), "local");
        assert_eq!(
            outcome.binding,
            CredentialBinding::new(store.default_ca_dir(), key, cert)
        );
        assert_eq!(issuer.calls.get(), 0);
    }

    #[test]
    fn test_missing_myproxy_file_is_issued() {
        let (_dir, store) = workspace();
        let slot = BindingSlot::new();
        let issuer = FakeIssuer::valid();

        let request = myproxy_request("bob");
        let outcome = ProxyOrchestrator::new(&store, &issuer, &slot)
            .run(&request)
            .unwrap();

        let proxy = store.myproxy_path("bob").unwrap();
        match &outcome.plan {
            AcquisitionPlan::MyproxyRefresh { proxy_file, source } => {
                assert_eq!(*proxy_file, proxy);
                assert_eq!(source.host, "grid.example.org");
            }
            other => panic!("unexpected plan: {:?}", other),
        }
        assert_eq!(issuer.calls.get(), 1);
        assert!(check_validity(&proxy, 1).unwrap().valid);
        assert_eq!(slot.current().unwrap().user_cert, proxy);
    }

    #[test]
    fn test_live_myproxy_file_is_reused() {
        let (_dir, store) = workspace();
        let key = testutil::test_key();
        let now = Utc::now();
        fs::write(
            store.myproxy_path("bob").unwrap(),
            testutil::combined_proxy_pem(&key, now - Duration::hours(1), now + Duration::hours(6)),
        )
        .unwrap();
        let slot = BindingSlot::new();
        let issuer = FakeIssuer::valid();

        ProxyOrchestrator::new(&store, &issuer, &slot)
            .run(&myproxy_request("bob"))
            .unwrap();
        assert_eq!(issuer.calls.get(), 0);
    }

    #[test]
    fn test_expired_or_garbled_myproxy_file_is_refreshed() {
        let (_dir, store) = workspace();
        let key = testutil::test_key();
        let now = Utc::now();
        fs::write(
            store.myproxy_path("bob").unwrap(),
            testutil::combined_proxy_pem(&key, now - Duration::days(8), now - Duration::hours(3)),
        )
        .unwrap();
        fs::write(store.myproxy_path("carol").unwrap(), b"not a certificate").unwrap();
        let slot = BindingSlot::new();
        let issuer = FakeIssuer::valid();
        let orchestrator = ProxyOrchestrator::new(&store, &issuer, &slot);

        orchestrator.run(&myproxy_request("bob")).unwrap();
        orchestrator.run(&myproxy_request("carol")).unwrap();
        assert_eq!(issuer.calls.get(), 2);
    }

    #[test]
    fn test_failed_refresh_fails_the_run() {
        let (_dir, store) = workspace();
        let slot = BindingSlot::new();

        let request = myproxy_request("bob");
        let result = ProxyOrchestrator::new(&store, &FailingIssuer, &slot)
            .run(&request);

        assert!(matches!(result, Err(ProxyError::Issuance(_))));
        assert_eq!(slot.current(), None);
    }

    #[test]
    fn test_issued_proxy_still_expired_fails_the_run() {
        let (_dir, store) = workspace();
        let slot = BindingSlot::new();
        let issuer = FakeIssuer {
            hours_left: -5,
            calls: Cell::new(0),
        };

        let request = myproxy_request("bob");
        let result = ProxyOrchestrator::new(&store, &issuer, &slot).run(&request);
        assert!(matches!(result, Err(ProxyError::Issuance(_))));
        assert_eq!(issuer.calls.get(), 1);
    }

    #[test]
    fn test_no_source_is_an_error() {
        let (_dir, store) = workspace();
        let slot = BindingSlot::new();

        let request = AcquisitionRequest::for_identity("nobody");
        let result = ProxyOrchestrator::new(&store, &FailingIssuer, &slot)
            .run(&request);

        match result {
            Err(ProxyError::NoCredentialSource { identity }) => assert_eq!(identity, "nobody"),
            other => panic!("unexpected outcome: {:?}", other.map(|o| o.plan)),
        }
    }

    #[test]
    fn test_audit_failure_clears_binding() {
        let (_dir, store) = workspace();
        let slot = BindingSlot::new();
        let previous = CredentialBinding::new("/old/ca", "/old/key", "/old/cert");
        slot.bind(&previous);
        let issuer = FakeIssuer::valid();
        let foreign = Uid::from_raw(geteuid().as_raw().wrapping_add(4242));

        let request = myproxy_request("bob");
        let result = ProxyOrchestrator::new(&store, &issuer, &slot)
            .auditor(PermissionAuditor::for_uid(foreign))
            .run(&request);

        match result {
            Err(ProxyError::Ownership(err)) => {
                let proxy = store.myproxy_path("bob").unwrap();
                assert_eq!(err.paths(), vec![&proxy, &proxy]);
            }
            other => panic!("unexpected outcome: {:?}", other.map(|o| o.plan)),
        }
        assert_eq!(slot.current(), None);
    }

    #[test]
    fn test_configured_ca_dir_is_bound_and_passed_to_issuer() {
        let (dir, store) = workspace();
        let ca_dir = dir.path().join("grid-security");
        fs::create_dir(&ca_dir).unwrap();
        let slot = BindingSlot::new();
        let issuer = FakeIssuer::valid();

        let request = myproxy_request("bob");
        let outcome = ProxyOrchestrator::new(&store, &issuer, &slot)
            .ca_dir(&ca_dir)
            .run(&request)
            .unwrap();
        assert_eq!(outcome.binding.ca_dir, ca_dir);
    }

    #[test]
    fn test_escaping_identity_is_refused_before_issuing() {
        let (_dir, store) = workspace();
        let slot = BindingSlot::new();
        let issuer = FakeIssuer::valid();

        for identity in ["../../etc", "a/b", ".."] {
            let request = myproxy_request(identity);
            let result =
                ProxyOrchestrator::new(&store, &issuer, &slot).run(&request);
            assert!(matches!(result, Err(ProxyError::Store { .. })), "{}", identity);
        }
        assert_eq!(issuer.calls.get(), 0);
        assert_eq!(slot.current(), None);
    }

    #[test]
    fn test_environment_sweep_rejects_stray_credential_variable() {
        let _env = testutil::ENV_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let (dir, store) = workspace();
        let stray = dir.path().join("someone-elses-proxy.pem");
        std::env::set_var("X509_USER_PROXY", &stray);
        let issuer = FakeIssuer::valid();

        let request = myproxy_request("bob");
        let result = ProxyOrchestrator::new(&store, &issuer, &ProcessEnvironment)
            .sweep_environment(true)
            .run(&request);
        std::env::remove_var("X509_USER_PROXY");

        match result {
            Err(ProxyError::Ownership(err)) => {
                assert_eq!(err.violations.len(), 1);
                assert_eq!(err.violations[0].key, "X509_USER_PROXY");
                assert_eq!(err.violations[0].path, stray);
            }
            other => panic!("unexpected outcome: {:?}", other.map(|o| o.plan)),
        }
        assert_eq!(ProcessEnvironment::current(), None);
    }

    #[test]
    fn test_environment_sweep_passes_clean_environment() {
        let _env = testutil::ENV_LOCK
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::env::remove_var("X509_USER_PROXY");
        let (_dir, store) = workspace();
        let issuer = FakeIssuer::valid();

        let request = myproxy_request("bob");
        let outcome = ProxyOrchestrator::new(&store, &issuer, &ProcessEnvironment)
            .sweep_environment(true)
            .run(&request)
            .unwrap();
        assert_eq!(ProcessEnvironment::current(), Some(outcome.binding));
        ProcessEnvironment.clear();
    }
}
