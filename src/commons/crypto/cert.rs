//! Certificate and CSR construction, parsing and validation.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use openssl::asn1::{Asn1Integer, Asn1Time, Asn1TimeRef};
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKeyRef, Private};
use openssl::stack::Stack;
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage,
    SubjectAlternativeName, SubjectKeyIdentifier,
};
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{
    X509, X509Builder, X509Name, X509NameRef, X509Ref, X509Req,
    X509ReqBuilder, X509ReqRef, X509StoreContext,
};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::FromDer;

use crate::commons::{CaResult, Error};
use crate::constants::{CERT_BACKDATE, SPIFFE_SCHEME};


//------------ Parsing -------------------------------------------------------

/// Parses the first certificate of a PEM string.
pub fn parse_certificate(pem: &str) -> CaResult<X509> {
    let pem = pem.trim();
    if pem.is_empty() {
        return Err(Error::validation("empty certificate"));
    }
    X509::from_pem(pem.as_bytes()).map_err(|e| {
        Error::validation(format!("invalid certificate PEM: {e}"))
    })
}

/// Parses all certificates in a PEM bundle.
pub fn parse_certificates(pem: &str) -> CaResult<Vec<X509>> {
    X509::stack_from_pem(pem.as_bytes()).map_err(|e| {
        Error::validation(format!("invalid certificate PEM: {e}"))
    })
}

pub fn certificate_to_pem(cert: &X509Ref) -> CaResult<String> {
    String::from_utf8(cert.to_pem()?).map_err(Error::custom)
}

pub fn parse_csr(pem: &str) -> CaResult<X509Req> {
    let pem = pem.trim();
    if pem.is_empty() {
        return Err(Error::signing("empty certificate signing request"));
    }
    X509Req::from_pem(pem.as_bytes())
        .map_err(|e| Error::signing(format!("invalid CSR: {e}")))
}

pub fn csr_to_pem(csr: &X509ReqRef) -> CaResult<String> {
    String::from_utf8(csr.to_pem()?).map_err(Error::custom)
}

/// Returns the URI SANs a CSR asks for.
pub fn csr_uri_sans(csr: &X509ReqRef) -> CaResult<Vec<String>> {
    let der = csr.to_der()?;
    let (_, parsed) = X509CertificationRequest::from_der(&der)
        .map_err(|e| Error::signing(format!("could not parse CSR: {e}")))?;

    let mut uris = Vec::new();
    if let Some(extensions) = parsed.requested_extensions() {
        for ext in extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = ext {
                for name in &san.general_names {
                    if let GeneralName::URI(uri) = name {
                        uris.push(uri.to_string());
                    }
                }
            }
        }
    }
    Ok(uris)
}

pub fn certificate_uri_sans(cert: &X509Ref) -> Vec<String> {
    cert.subject_alt_names()
        .map(|names| {
            names
                .iter()
                .filter_map(|name| name.uri().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}


//------------ Identifiers ---------------------------------------------------

/// Encodes a key identifier as lowercase, colon separated hex.
pub fn encode_key_id(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// The SHA-1 fingerprint of the certificate, used as root ID.
pub fn fingerprint(cert: &X509Ref) -> CaResult<String> {
    Ok(encode_key_id(&cert.digest(MessageDigest::sha1())?))
}

/// The encoded subject key identifier of a certificate.
pub fn signing_key_id(cert: &X509Ref) -> CaResult<String> {
    cert.subject_key_id()
        .map(|ski| encode_key_id(ski.as_slice()))
        .ok_or_else(|| {
            Error::validation("certificate has no subject key identifier")
        })
}

/// The signing key ID of the first certificate in a PEM string.
pub fn signing_key_id_of(pem: &str) -> CaResult<String> {
    let cert = parse_certificate(pem)?;
    signing_key_id(&cert)
}

/// Returns the low 64 bits of the serial number.
pub fn serial_number(cert: &X509Ref) -> CaResult<u64> {
    let bytes = cert.serial_number().to_bn()?.to_vec();
    let low = &bytes[bytes.len().saturating_sub(8)..];
    Ok(low.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

pub fn random_serial() -> CaResult<u64> {
    let mut bn = BigNum::new()?;
    bn.rand(63, MsbOption::MAYBE_ZERO, false)?;
    let bytes = bn.to_vec();
    Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

fn asn1_serial(serial: u64) -> CaResult<Asn1Integer> {
    Ok(BigNum::from_slice(&serial.to_be_bytes())?.to_asn1_integer()?)
}


//------------ Time ----------------------------------------------------------

pub fn asn1_time_to_chrono(time: &Asn1TimeRef) -> CaResult<DateTime<Utc>> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    let secs = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| Error::validation("certificate time out of range"))
}

pub fn not_before(cert: &X509Ref) -> CaResult<DateTime<Utc>> {
    asn1_time_to_chrono(cert.not_before())
}

pub fn not_after(cert: &X509Ref) -> CaResult<DateTime<Utc>> {
    asn1_time_to_chrono(cert.not_after())
}

/// Returns whether less than half of the validity period has passed.
pub fn less_than_half_time_passed(
    now: DateTime<Utc>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
) -> bool {
    not_after - now > (not_after - not_before) / 2
}

/// Validity starting a little in the past, capped at `max_not_after`.
fn validity(
    ttl: Duration,
    max_not_after: Option<DateTime<Utc>>,
) -> CaResult<(Asn1Time, Asn1Time)> {
    let now = Utc::now();
    let ttl = TimeDelta::from_std(ttl).map_err(Error::validation)?;
    let backdate =
        TimeDelta::from_std(CERT_BACKDATE).map_err(Error::validation)?;

    let mut end = now + ttl.max(TimeDelta::seconds(1));
    if let Some(max) = max_not_after {
        end = end.min(max);
    }

    Ok((
        Asn1Time::from_unix((now - backdate).timestamp())?,
        Asn1Time::from_unix(end.timestamp())?,
    ))
}


//------------ Building ------------------------------------------------------

fn common_name(cn: &str) -> CaResult<X509Name> {
    let mut builder = X509Name::builder()?;
    builder.append_entry_by_nid(Nid::COMMONNAME, cn)?;
    Ok(builder.build())
}

/// The identity URI of a CA for the given trust domain.
pub fn ca_uri(trust_domain: &str) -> String {
    format!("{SPIFFE_SCHEME}://{trust_domain}")
}

fn new_builder(
    serial: u64,
    subject: &X509NameRef,
    issuer: &X509NameRef,
) -> CaResult<X509Builder> {
    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    let serial = asn1_serial(serial)?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(subject)?;
    builder.set_issuer_name(issuer)?;
    Ok(builder)
}

/// Adds the key identifiers and URI SANs. A missing `issuer` means the
/// certificate is self-signed.
fn append_identity_extensions(
    builder: &mut X509Builder,
    issuer: Option<&X509Ref>,
    uris: &[String],
) -> CaResult<()> {
    let ski = SubjectKeyIdentifier::new()
        .build(&builder.x509v3_context(issuer, None))?;
    builder.append_extension(ski)?;

    let aki = AuthorityKeyIdentifier::new()
        .keyid(true)
        .build(&builder.x509v3_context(issuer, None))?;
    builder.append_extension(aki)?;

    if !uris.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for uri in uris {
            san.uri(uri);
        }
        let san = san.build(&builder.x509v3_context(issuer, None))?;
        builder.append_extension(san)?;
    }
    Ok(())
}

fn append_ca_extensions(builder: &mut X509Builder) -> CaResult<()> {
    builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .key_cert_sign()
            .crl_sign()
            .digital_signature()
            .build()?,
    )?;
    Ok(())
}

/// Creates a self-signed root certificate.
pub fn self_signed_root(
    key: &PKeyRef<Private>,
    cn: &str,
    trust_domain: &str,
    ttl: Duration,
) -> CaResult<X509> {
    let name = common_name(cn)?;
    let (not_before, not_after) = validity(ttl, None)?;

    let mut builder = new_builder(random_serial()?, &name, &name)?;
    builder.set_pubkey(key)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    append_ca_extensions(&mut builder)?;
    append_identity_extensions(&mut builder, None, &[ca_uri(trust_domain)])?;
    builder.sign(key, MessageDigest::sha256())?;
    Ok(builder.build())
}

/// Creates a CSR for the given key.
pub fn build_csr(
    key: &PKeyRef<Private>,
    cn: &str,
    uris: &[String],
    is_ca: bool,
) -> CaResult<X509Req> {
    let mut builder = X509ReqBuilder::new()?;
    builder.set_version(0)?;
    let name = common_name(cn)?;
    builder.set_subject_name(&name)?;
    builder.set_pubkey(key)?;

    let mut extensions = Stack::new()?;
    if !uris.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for uri in uris {
            san.uri(uri);
        }
        extensions.push(san.build(&builder.x509v3_context(None))?)?;
    }
    if is_ca {
        extensions.push(BasicConstraints::new().critical().ca().build()?)?;
    }
    builder.add_extensions(&extensions)?;
    builder.sign(key, MessageDigest::sha256())?;
    Ok(builder.build())
}

/// Checks the CSR's proof of possession and returns its URI SANs.
fn verified_csr_uris(csr: &X509ReqRef) -> CaResult<Vec<String>> {
    let public_key = csr.public_key()?;
    if !csr.verify(&public_key)? {
        return Err(Error::signing("CSR signature does not verify"));
    }
    csr_uri_sans(csr)
}

/// Signs a CSR for a CA certificate, e.g. the intermediate of another
/// datacenter.
pub fn sign_ca_csr(
    csr: &X509ReqRef,
    issuer: &X509Ref,
    issuer_key: &PKeyRef<Private>,
    ttl: Duration,
) -> CaResult<X509> {
    let uris = verified_csr_uris(csr)?;
    if !uris.iter().any(|uri| is_spiffe(uri)) {
        return Err(Error::signing("CSR does not carry a CA identity URI"));
    }

    let (not_before, not_after) = validity(ttl, Some(self::not_after(issuer)?))?;
    let mut builder =
        new_builder(random_serial()?, csr.subject_name(), issuer.subject_name())?;
    let public_key = csr.public_key()?;
    builder.set_pubkey(&public_key)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    append_ca_extensions(&mut builder)?;
    append_identity_extensions(&mut builder, Some(issuer), &uris)?;
    builder.sign(issuer_key, MessageDigest::sha256())?;
    Ok(builder.build())
}

/// Signs a leaf CSR. The leaf never outlives its issuer.
pub fn sign_leaf_csr(
    csr: &X509ReqRef,
    issuer: &X509Ref,
    issuer_key: &PKeyRef<Private>,
    ttl: Duration,
) -> CaResult<X509> {
    let uris = verified_csr_uris(csr)?;
    if !uris.iter().any(|uri| is_spiffe(uri)) {
        return Err(Error::signing("CSR does not carry a workload identity URI"));
    }

    let (not_before, not_after) = validity(ttl, Some(self::not_after(issuer)?))?;
    let mut builder =
        new_builder(random_serial()?, csr.subject_name(), issuer.subject_name())?;
    let public_key = csr.public_key()?;
    builder.set_pubkey(&public_key)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    builder.append_extension(BasicConstraints::new().critical().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .digital_signature()
            .key_encipherment()
            .key_agreement()
            .build()?,
    )?;
    builder.append_extension(
        ExtendedKeyUsage::new().server_auth().client_auth().build()?,
    )?;
    append_identity_extensions(&mut builder, Some(issuer), &uris)?;
    builder.sign(issuer_key, MessageDigest::sha256())?;
    Ok(builder.build())
}

/// Has `issuer` counter-sign `cert`: the result carries the subject, key
/// and validity of `cert` but chains to `issuer`.
pub fn cross_sign(
    cert: &X509Ref,
    issuer: &X509Ref,
    issuer_key: &PKeyRef<Private>,
) -> CaResult<X509> {
    let mut builder =
        new_builder(random_serial()?, cert.subject_name(), issuer.subject_name())?;
    let public_key = cert.public_key()?;
    builder.set_pubkey(&public_key)?;
    builder.set_not_before(cert.not_before())?;
    builder.set_not_after(cert.not_after())?;
    append_ca_extensions(&mut builder)?;
    append_identity_extensions(
        &mut builder,
        Some(issuer),
        &certificate_uri_sans(cert),
    )?;
    builder.sign(issuer_key, MessageDigest::sha256())?;
    Ok(builder.build())
}

fn is_spiffe(uri: &str) -> bool {
    uri.starts_with(&format!("{SPIFFE_SCHEME}://"))
}

/// Returns the trust domain of the first SPIFFE URI.
pub fn spiffe_trust_domain(uris: &[String]) -> Option<String> {
    let prefix = format!("{SPIFFE_SCHEME}://");
    uris.iter().find_map(|uri| {
        uri.strip_prefix(&prefix)
            .map(|rest| rest.split('/').next().unwrap_or_default().to_string())
    })
}


//------------ Validation ----------------------------------------------------

/// Verifies that `leaf_pem` chains to `root_pem` through the given
/// intermediates. Each intermediate entry may be a PEM bundle.
pub fn verify_chain(
    leaf_pem: &str,
    intermediates: &[String],
    root_pem: &str,
) -> CaResult<()> {
    let root = parse_certificate(root_pem)?;
    let leaf = parse_certificate(leaf_pem)?;

    let mut store = X509StoreBuilder::new()?;
    store.add_cert(root)?;
    let store = store.build();

    let mut chain = Stack::new()?;
    for pem in intermediates {
        for cert in parse_certificates(pem)? {
            chain.push(cert)?;
        }
    }

    let mut context = X509StoreContext::new()?;
    let failure = context.init(&store, &leaf, &chain, |c| {
        Ok(if c.verify_cert()? { None } else { Some(c.error()) })
    })?;

    match failure {
        None => Ok(()),
        Some(e) => Err(Error::validation(format!(
            "certificate does not chain to root: {e}"
        ))),
    }
}


//------------ Tests ---------------------------------------------------------
