//! CSR generation and issued-certificate inspection

use certkeeper_storage::entities::certificate;

use crate::pipeline::OrderError;

/// Build a DER-encoded PKCS#10 CSR for the certificate's subject and SANs,
/// signed with the given key PEM (the certificate's current default key).
pub fn build_csr(cert: &certificate::Model, key_pem: &str) -> Result<Vec<u8>, OrderError> {
    let key_pair = rcgen::KeyPair::from_pem(key_pem)
        .map_err(|e| OrderError::Csr(format!("key not usable for csr: {e}")))?;

    let mut params = rcgen::CertificateParams::new(cert.dns_identifiers())
        .map_err(|e| OrderError::Csr(format!("bad identifiers: {e}")))?;

    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, cert.subject.clone());
    params.distinguished_name = dn;

    let csr = params
        .serialize_request(&key_pair)
        .map_err(|e| OrderError::Csr(format!("csr signing failed: {e}")))?;

    Ok(csr.der().as_ref().to_vec())
}

/// NotBefore / NotAfter of the leaf certificate in a PEM chain, as unix
/// seconds
pub fn leaf_validity(chain_pem: &str) -> Result<(i64, i64), OrderError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(chain_pem.as_bytes())
        .map_err(|e| OrderError::CertParse(format!("not pem: {e}")))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| OrderError::CertParse(format!("not an x509 certificate: {e}")))?;

    let validity = cert.validity();
    Ok((
        validity.not_before.timestamp(),
        validity.not_after.timestamp(),
    ))
}

/// RFC 3339 timestamp (the ACME wire format) to unix seconds
pub fn parse_rfc3339_unix(value: Option<&str>) -> Option<i64> {
    let value = value?;
    chrono::DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.timestamp())
}
