//! Optional OpenSSL module for signing and signature verification.
//!
//! This module provides an OpenSSL-based signer producing detached PKCS #7
//! signatures, see [`OpenSslSigner`], and the matching verifier, see
//! [`OpenSslVerifier`]. It is enabled by the `openssl` feature.

use std::io::Read;
use std::path::Path;

use openssl::nid::Nid;
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::pkey::{PKey, Private};
use openssl::stack::Stack;
use openssl::x509::{
    store::{X509Store, X509StoreBuilder},
    X509Ref, X509,
};

use crate::dss::{TokenKind, TrustMaterialToken};
use crate::signing::ExternalSigner;

/// Signs with a certificate and its private key.
pub struct OpenSslSigner {
    certificate: X509,
    private_key: PKey<Private>,
    chain: Stack<X509>,
}

impl OpenSslSigner {
    /// `chain` holds the intermediary certificates embedded next to the
    /// signer's own.
    pub fn new(certificate: X509, private_key: PKey<Private>, chain: Stack<X509>) -> Self {
        Self {
            certificate,
            private_key,
            chain,
        }
    }

    pub fn certificate(&self) -> &X509Ref {
        &self.certificate
    }

    /// Common name of the signing certificate, for the appearance templates.
    pub fn common_name(&self) -> Option<String> {
        common_name(&self.certificate)
    }
}

impl ExternalSigner for OpenSslSigner {
    fn sign(&mut self, content: &mut dyn Read) -> anyhow::Result<Vec<u8>> {
        // OpenSSL wants the signed content in one piece.
        let mut data = Vec::new();
        content.read_to_end(&mut data)?;

        let pkcs7 = Pkcs7::sign(
            &self.certificate,
            &self.private_key,
            &self.chain,
            &data,
            Pkcs7Flags::DETACHED | Pkcs7Flags::BINARY,
        )?;
        Ok(pkcs7.to_der()?)
    }
}

/// OpenSSL implementation of the signature verifier.
pub struct OpenSslVerifier {
    ca_store: X509Store,
    intermediaries: Stack<X509>,
}

impl OpenSslVerifier {
    /// Creates a new verifier with the given CA store and a set of untrusted
    /// intermediary certificates that might be needed in the verification.
    pub fn new(ca_store: X509Store, intermediaries: Stack<X509>) -> Self {
        Self {
            ca_store,
            intermediaries,
        }
    }
}

impl crate::SignatureVerifier for &OpenSslVerifier {
    /// Uses `openssl` crate [`Pkcs7`] structure as the returned value.
    ///
    /// It contains all the information about the signature, including the
    /// signer's certificate and identity.
    type Return = Pkcs7;

    fn verify(&self, pkcs7_der: &[u8], signed_data: [&[u8]; 2]) -> anyhow::Result<Self::Return> {
        let contiguous = signed_data.concat();

        let pkcs7 = Pkcs7::from_der(pkcs7_der)?;
        pkcs7.verify(
            &self.intermediaries,
            &self.ca_store,
            Some(&contiguous),
            None,
            Pkcs7Flags::empty(),
        )?;

        Ok(pkcs7)
    }
}

/// The first common name in a certificate's subject.
pub fn common_name(certificate: &X509Ref) -> Option<String> {
    let entry = certificate
        .subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()?;
    Some(entry.data().as_utf8().ok()?.to_string())
}

/// Wraps a certificate as trust material for the DSS.
pub fn certificate_token(certificate: &X509Ref) -> anyhow::Result<TrustMaterialToken> {
    Ok(TrustMaterialToken::new(
        TokenKind::Certificate,
        certificate.to_der()?,
    ))
}

/// Loads CA certificates from a directory containing PEM files.
pub fn load_ca_bundle_from_dir<P: AsRef<Path>>(dir: P) -> Result<X509StoreBuilder, anyhow::Error> {
    let mut builder = X509StoreBuilder::new()?;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let cert = X509::from_pem(&std::fs::read(&path)?)?;
        builder.add_cert(cert)?;
    }

    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::appearance::{TextBlock, VisualElement};
    use crate::dss::{extend_with_trust_material, SignatureValidationData};
    use crate::revisions::parse_revisions;
    use crate::signing::{PdfSignatureService, SigningParameters};
    use crate::test_support::{sample_pdf, test_font};

    use openssl::asn1::Asn1Time;
    use openssl::bn::{BigNum, MsbOption};
    use openssl::hash::MessageDigest;
    use openssl::rsa::Rsa;
    use openssl::x509::X509NameBuilder;

    fn self_signed(common_name: &str) -> (X509, PKey<Private>) {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();

        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_nid(Nid::COMMONNAME, common_name).unwrap();
        let name = name.build();

        let mut serial = BigNum::new().unwrap();
        serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();

        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        builder
            .set_serial_number(&serial.to_asn1_integer().unwrap())
            .unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(1).unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        (builder.build(), key)
    }

    fn verifier_trusting(certificate: &X509) -> OpenSslVerifier {
        let mut builder = X509StoreBuilder::new().unwrap();
        builder.add_cert(certificate.clone()).unwrap();
        OpenSslVerifier::new(builder.build(), Stack::new().unwrap())
    }

    #[test]
    fn sign_parse_verify_and_extend() {
        let (certificate, key) = self_signed("Jane Q Public");
        let mut signer = OpenSslSigner::new(certificate.clone(), key, Stack::new().unwrap());
        assert_eq!(signer.common_name().as_deref(), Some("Jane Q Public"));

        let params = SigningParameters {
            common_name: signer.common_name(),
            reason: Some("Approval".into()),
            visual: Some(VisualElement {
                left_text: Some(TextBlock {
                    text: "Signed by %CN_1% %CN_3%\n%DateTimeWithTimeZone%".into(),
                    font: Some(test_font()),
                    ..Default::default()
                }),
                dpi: 96,
                ..Default::default()
            }),
            ..Default::default()
        };
        let signed = PdfSignatureService::default()
            .sign_with(&sample_pdf(1), &params, &mut signer)
            .unwrap();

        let report = parse_revisions(&signed).unwrap();
        assert!(report.excluded.is_empty());
        let revision = &report.revisions[0];
        let verifier = verifier_trusting(&certificate);
        let pkcs7 = revision.verify_with(&signed, &verifier).unwrap();
        assert_eq!(pkcs7.to_der().unwrap(), revision.signature_value());

        let mut tampered = signed.clone();
        tampered[1] ^= 0x20;
        assert!(revision.verify_with(&tampered, &verifier).is_err());

        let material = SignatureValidationData::new(
            revision.signature_value().to_vec(),
            vec![certificate_token(&certificate).unwrap()],
        );
        let extension = extend_with_trust_material(&signed, &[material]).unwrap();
        assert!(extension.warnings.is_empty());

        let extended = parse_revisions(&extension.bytes).unwrap();
        assert!(extended.has_dss);
        assert_eq!(extended.revisions[0].vri_key(), revision.vri_key());
        assert!(!extended.revisions[0].covers_whole_document);
        extended.revisions[0]
            .verify_with(&extension.bytes, &verifier)
            .unwrap();
    }

    #[test]
    fn untrusted_signer_is_rejected() {
        let (certificate, key) = self_signed("Mallory");
        let (other, _) = self_signed("Someone Else");
        let mut signer = OpenSslSigner::new(certificate, key, Stack::new().unwrap());

        let signed = PdfSignatureService::default()
            .sign_with(&sample_pdf(1), &SigningParameters::default(), &mut signer)
            .unwrap();
        let revision = parse_revisions(&signed).unwrap().revisions.remove(0);
        assert!(revision
            .verify_with(&signed, &verifier_trusting(&other))
            .is_err());
    }

    #[test]
    fn ca_bundle_from_directory() {
        let (certificate, key) = self_signed("Test Root");
        let dir = std::env::temp_dir().join(format!("ltv_pdf_cas_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("root.pem"), certificate.to_pem().unwrap()).unwrap();

        let store = load_ca_bundle_from_dir(&dir).unwrap().build();
        std::fs::remove_dir_all(&dir).unwrap();
        let verifier = OpenSslVerifier::new(store, Stack::new().unwrap());

        let mut signer = OpenSslSigner::new(certificate, key, Stack::new().unwrap());
        let signed = PdfSignatureService::default()
            .sign_with(&sample_pdf(1), &SigningParameters::default(), &mut signer)
            .unwrap();
        let revision = parse_revisions(&signed).unwrap().revisions.remove(0);
        revision.verify_with(&signed, &verifier).unwrap();
    }
}
