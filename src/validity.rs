//! Certificate validity checks
//!
//! Reads the validity window of a PEM certificate and decides whether a stored proxy can still be
//! used. A certificate counts as valid when
//!
//! ```text
//! not_before < now  &&  not_after > now - tolerance
//! ```
//!
//! so a proxy that expired less than `tolerance` ago is still accepted. This absorbs clock skew
//! between the issuing service and this host; refresh logic depends on exactly this window.
//!
//! Parse failures are reported as [`ProxyError::Parse`] and never as "invalid": the caller needs
//! to tell "cannot decide" apart from "expired".

use crate::error::{ProxyError, Result};
use chrono::{DateTime, Duration, Utc};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::x509::X509;
use std::fs;
use std::path::{Path, PathBuf};

/// Default tolerance applied after `not_after`, in hours
pub const DEFAULT_TOLERANCE_HOURS: i64 = 1;

/// Outcome of a validity check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    pub valid: bool,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// A parsed proxy certificate read back from disk
#[derive(Debug, Clone)]
pub struct ProxyCertificate {
    pub path: PathBuf,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// Subject in OpenSSL one-line form, e.g. `/CN=alice/O=Example`
    pub subject_dn: String,
}

impl ProxyCertificate {
    /// Load the first certificate found in a PEM file
    ///
    /// Combined proxy files start with the private key; the certificate block after it is picked
    /// up all the same.
    pub fn from_pem_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let pem = fs::read(path).map_err(|e| ProxyError::parse(path, e.to_string()))?;
        let cert = X509::from_pem(&pem).map_err(|e| ProxyError::parse(path, e.to_string()))?;

        Ok(Self {
            path: path.to_path_buf(),
            not_before: asn1_to_utc(cert.not_before())
                .map_err(|reason| ProxyError::parse(path, reason))?,
            not_after: asn1_to_utc(cert.not_after())
                .map_err(|reason| ProxyError::parse(path, reason))?,
            subject_dn: subject_dn(&cert),
        })
    }

    /// Evaluate the validity window at `now` with a grace period of `tolerance` after `not_after`
    pub fn validity_at(&self, now: DateTime<Utc>, tolerance: Duration) -> Validity {
        Validity {
            valid: evaluate(self.not_before, self.not_after, now, tolerance),
            not_before: self.not_before,
            not_after: self.not_after,
        }
    }
}

/// Check the certificate at `cert_path` against the current time
///
/// # Errors
/// - [`ProxyError::InvalidTolerance`] when `tolerance_hours` is not positive or reaches past the
///   representable time range
/// - [`ProxyError::Parse`] when the file is missing or carries no parsable certificate
pub fn check_validity<P: AsRef<Path>>(cert_path: P, tolerance_hours: i64) -> Result<Validity> {
    let tolerance = tolerance_window(tolerance_hours)?;
    let cert = ProxyCertificate::from_pem_file(cert_path)?;
    let validity = cert.validity_at(Utc::now(), tolerance);
    tracing::debug!(
        path = %cert.path.display(),
        valid = validity.valid,
        not_before = %validity.not_before,
        not_after = %validity.not_after,
        "Checked certificate validity"
    );
    Ok(validity)
}

/// Convert a tolerance in hours into a [`Duration`]
///
/// # Errors
/// [`ProxyError::InvalidTolerance`] if `tolerance_hours` is zero, negative, or so large that
/// `now - tolerance` falls outside the supported date range.
pub fn tolerance_window(tolerance_hours: i64) -> Result<Duration> {
    if tolerance_hours <= 0 {
        return Err(ProxyError::InvalidTolerance(tolerance_hours));
    }
    let tolerance = Duration::try_hours(tolerance_hours)
        .ok_or(ProxyError::InvalidTolerance(tolerance_hours))?;
    Utc::now()
        .checked_sub_signed(tolerance)
        .ok_or(ProxyError::InvalidTolerance(tolerance_hours))?;
    Ok(tolerance)
}

/// The validity window decision at a fixed instant
///
/// A tolerance reaching before the earliest representable instant accepts any `not_after`.
pub fn evaluate(
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    now: DateTime<Utc>,
    tolerance: Duration,
) -> bool {
    let not_expired = match now.checked_sub_signed(tolerance) {
        Some(floor) => not_after > floor,
        None => true,
    };
    not_before < now && not_expired
}

/// Subject distinguished name of the certificate stored at `path`
pub fn get_dn_from_cert<P: AsRef<Path>>(path: P) -> Result<String> {
    let dn = ProxyCertificate::from_pem_file(path)?.subject_dn;
    tracing::debug!(dn = %dn, "Computed certificate DN");
    Ok(dn)
}

fn subject_dn(cert: &X509) -> String {
    let mut dn = String::new();
    for entry in cert.subject_name().entries() {
        let field = entry.object().nid().short_name().unwrap_or("UNDEF");
        let value = entry
            .data()
            .as_utf8()
            .map(|v| v.to_string())
            .unwrap_or_default();
        dn.push('/');
        dn.push_str(field);
        dn.push('=');
        dn.push_str(&value);
    }
    dn
}

fn asn1_to_utc(time: &Asn1TimeRef) -> std::result::Result<DateTime<Utc>, String> {
    let epoch = Asn1Time::from_unix(0).map_err(|e| e.to_string())?;
    let diff = epoch.diff(time).map_err(|e| e.to_string())?;
    let seconds = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    DateTime::<Utc>::from_timestamp(seconds, 0)
        .ok_or_else(|| format!("Timestamp {} out of range", seconds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use std::io::Write;

    fn write_cert(not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> tempfile::NamedTempFile {
        let key = testutil::test_key();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&testutil::combined_proxy_pem(&key, not_before, not_after))
            .unwrap();
        file
    }

    #[test]
    fn test_live_certificate_is_valid() {
        let now = Utc::now();
        let file = write_cert(now - Duration::hours(1), now + Duration::hours(10));
        let validity = check_validity(file.path(), DEFAULT_TOLERANCE_HOURS).unwrap();
        assert!(validity.valid);
        assert!(validity.not_before < now);
    }

    #[test]
    fn test_recently_expired_certificate_is_within_tolerance() {
        let now = Utc::now();
        let file = write_cert(now - Duration::hours(5), now - Duration::minutes(30));
        assert!(check_validity(file.path(), 1).unwrap().valid);
    }

    #[test]
    fn test_expired_beyond_tolerance_is_invalid() {
        let now = Utc::now();
        let file = write_cert(now - Duration::hours(5), now - Duration::minutes(90));
        let validity = check_validity(file.path(), 1).unwrap();
        assert!(!validity.valid);
    }

    #[test]
    fn test_not_yet_valid_certificate() {
        let now = Utc::now();
        let file = write_cert(now + Duration::hours(1), now + Duration::hours(10));
        assert!(!check_validity(file.path(), 1).unwrap().valid);
    }

    #[test]
    fn test_window_edges_are_exclusive() {
        let now = Utc::now();
        let tolerance = Duration::hours(1);
        assert!(!evaluate(now, now + Duration::hours(2), now, tolerance));
        assert!(!evaluate(
            now - Duration::hours(3),
            now - tolerance,
            now,
            tolerance
        ));
        assert!(evaluate(
            now - Duration::hours(3),
            now - tolerance + Duration::seconds(1),
            now,
            tolerance
        ));
    }

    #[test]
    fn test_missing_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = check_validity(dir.path().join("absent.pem"), 1);
        assert!(matches!(result, Err(ProxyError::Parse { .. })));
    }

    #[test]
    fn test_garbage_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not a certificate").unwrap();
        let result = check_validity(file.path(), 1);
        assert!(matches!(result, Err(ProxyError::Parse { .. })));
    }

    #[test]
    fn test_zero_tolerance_rejected() {
        let now = Utc::now();
        let file = write_cert(now - Duration::hours(1), now + Duration::hours(1));
        let result = check_validity(file.path(), 0);
        assert!(matches!(result, Err(ProxyError::InvalidTolerance(0))));
    }

    #[test]
    fn test_oversized_tolerance_is_rejected_not_fatal() {
        let now = Utc::now();
        let file = write_cert(now - Duration::hours(1), now + Duration::hours(1));
        for hours in [100_000_000_000, i64::MAX] {
            let result = check_validity(file.path(), hours);
            assert!(matches!(result, Err(ProxyError::InvalidTolerance(h)) if h == hours));
        }
        assert!(check_validity(file.path(), 24 * 365 * 100).unwrap().valid);
    }

    #[test]
    fn test_evaluate_with_unbounded_tolerance() {
        let now = Utc::now();
        assert!(evaluate(
            now - Duration::hours(3),
            now - Duration::days(365),
            now,
            Duration::MAX
        ));
        assert!(!evaluate(
            now + Duration::hours(1),
            now + Duration::hours(2),
            now,
            Duration::MAX
        ));
    }

    #[test]
    fn test_dates_survive_parsing() {
        let not_before = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let not_after = DateTime::<Utc>::from_timestamp(1_700_086_400, 0).unwrap();
        let file = write_cert(not_before, not_after);
        let cert = ProxyCertificate::from_pem_file(file.path()).unwrap();
        assert_eq!(cert.not_before, not_before);
        assert_eq!(cert.not_after, not_after);
    }

    #[test]
    fn test_subject_dn_one_line_form() {
        let now = Utc::now();
        let file = write_cert(now - Duration::hours(1), now + Duration::hours(1));
        assert_eq!(
            get_dn_from_cert(file.path()).unwrap(),
            "/CN=proxy/O=Grid Test"
        );
    }
}
