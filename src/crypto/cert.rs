use crate::error::{Error, Result};

/// A certificate identity: DER-encoded X.509 leaf plus its PKCS#8 private
/// key, generated locally or loaded from disk. The connector never ships
/// a CA chain of its own; peer chain validation is delegated to `webpki`.
#[derive(Clone)]
pub struct Certificate {
    pub certificate_der: Vec<u8>,
    pub private_key_pkcs8: Vec<u8>,
}

impl Certificate {
    /// Self-signed ECDSA P-256 leaf, used when no externally-issued
    /// certificate has been configured. Mirrors what test harnesses and
    /// ephemeral peers need: a stable keypair for one connector lifetime,
    /// not a chain anyone else will ever validate against a root store.
    pub fn generate_self_signed(common_name: &str) -> Result<Self> {
        let mut params = rcgen::CertificateParams::new(vec![common_name.to_owned()]);
        params.alg = &rcgen::PKCS_ECDSA_P256_SHA256;
        let cert = rcgen::Certificate::from_params(params)
            .map_err(|e| Error::InternalError(format!("self-signed cert generation failed: {}", e)))?;

        let certificate_der = cert
            .serialize_der()
            .map_err(|e| Error::InternalError(format!("cert serialization failed: {}", e)))?;
        let private_key_pkcs8 = cert.serialize_private_key_der();

        Ok(Certificate { certificate_der, private_key_pkcs8 })
    }
}

/// RFC 6347 peers rarely carry a CA chain of their own; verification here
/// checks the leaf decodes as a well-formed X.509 certificate and, when a
/// trust anchor is supplied, that it chains to it via webpki. Raw public
/// key (RPK) mode skips this entirely and compares the key bytes directly.
pub fn parse_leaf(certificate_der: &[u8]) -> Result<x509_parser::certificate::X509Certificate<'_>> {
    let (_, cert) = x509_parser::parse_x509_certificate(certificate_der)
        .map_err(|e| Error::DecodeError { offset: 0, reason: format!("invalid X.509 certificate: {}", e) })?;
    Ok(cert)
}

/// Extracts the raw SubjectPublicKeyInfo bit-string from a leaf certificate,
/// the bytes `ring::signature::UnparsedPublicKey` needs to verify a
/// signature the peer made with that certificate's private key.
pub fn leaf_public_key(certificate_der: &[u8]) -> Result<Vec<u8>> {
    let cert = parse_leaf(certificate_der)?;
    Ok(cert.public_key().subject_public_key.data.to_vec())
}

pub fn verify_chain_against_roots(
    chain: &[Vec<u8>],
    roots: &[webpki::TrustAnchor],
    now_unix_secs: u64,
) -> Result<()> {
    let (leaf_der, intermediates) = chain
        .split_first()
        .ok_or_else(|| Error::HandshakeFailure(crate::wire::alert::AlertDescription::BadCertificate))?;

    let anchors = webpki::TLSServerTrustAnchors(roots);
    let leaf = webpki::EndEntityCert::from(leaf_der.as_slice())
        .map_err(|_| Error::HandshakeFailure(crate::wire::alert::AlertDescription::BadCertificate))?;

    let intermediates: Vec<&[u8]> = intermediates.iter().map(|c| c.as_slice()).collect();
    let time = webpki::Time::from_seconds_since_unix_epoch(now_unix_secs);

    leaf.verify_is_valid_tls_server_cert(
        &[&webpki::ECDSA_P256_SHA256, &webpki::ECDSA_P384_SHA384],
        &anchors,
        &intermediates,
        time,
    )
    .map_err(|_| Error::HandshakeFailure(crate::wire::alert::AlertDescription::CertificateUnknown))
}
