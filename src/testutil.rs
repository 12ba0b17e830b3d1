//! Test fixtures: self-signed certificates with arbitrary validity windows.

use chrono::{DateTime, Duration, Utc};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509Name, X509};
use std::sync::Mutex;

const X509_VERSION_3: i32 = 2;
const TEST_KEY_SIZE: u32 = 1024;

/// Held by every test that reads or writes `X509*` process variables
pub static ENV_LOCK: Mutex<()> = Mutex::new(());

pub fn test_key() -> PKey<Private> {
    let rsa = openssl::rsa::Rsa::generate(TEST_KEY_SIZE).unwrap();
    PKey::from_rsa(rsa).unwrap()
}

/// Self-signed certificate for `cn` valid over `[not_before, not_after]`
pub fn self_signed(
    key: &PKey<Private>,
    cn: &str,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
) -> X509 {
    let mut builder = X509::builder().unwrap();
    builder.set_version(X509_VERSION_3).unwrap();

    let mut serial = BigNum::new().unwrap();
    serial.rand(128, MsbOption::MAYBE_ZERO, false).unwrap();
    builder
        .set_serial_number(&serial.to_asn1_integer().unwrap())
        .unwrap();

    let mut name = X509Name::builder().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
    name.append_entry_by_nid(Nid::ORGANIZATIONNAME, "Grid Test")
        .unwrap();
    let name = name.build();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();

    builder
        .set_not_before(&Asn1Time::from_unix(not_before.timestamp()).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::from_unix(not_after.timestamp()).unwrap())
        .unwrap();
    builder.set_pubkey(key).unwrap();
    builder.sign(key, MessageDigest::sha256()).unwrap();
    builder.build()
}

/// PEM of a certificate valid from one hour ago until `hours_left` from now
pub fn live_certificate_pem(key: &PKey<Private>, cn: &str, hours_left: i64) -> Vec<u8> {
    let now = Utc::now();
    self_signed(
        key,
        cn,
        now - Duration::hours(1),
        now + Duration::hours(hours_left),
    )
    .to_pem()
    .unwrap()
}

/// Key PEM followed by certificate PEM, the layout of every stored proxy
pub fn combined_proxy_pem(
    key: &PKey<Private>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
) -> Vec<u8> {
    let mut pem = key.private_key_to_pem_pkcs8().unwrap();
    pem.extend(
        self_signed(key, "proxy", not_before, not_after)
            .to_pem()
            .unwrap(),
    );
    pem
}
