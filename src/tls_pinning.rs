//! A `rustls` certificate verifier that pins to a single caller-supplied
//! leaf fingerprint instead of walking a trust chain. Used by both the
//! pairing HTTP client (§4.3) and the framed transport client (§4.5) —
//! the two places this crate talks TLS to a peer it has no CA for.

use std::fmt;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, Error as TlsError, SignatureScheme};
use sha2::{Digest, Sha256};

/// Verifies a server's leaf certificate matches a pinned SHA-256 fingerprint
/// and nothing else: no chain validation, no hostname check, no system
/// trust fallback. Pairing and transport only ever talk to a peer whose
/// fingerprint was already authenticated out of band (QR payload or trust
/// record), so chain-of-trust verification would be theater here.
pub struct PinnedLeafVerifier {
    pinned_fingerprint_lower: String,
    provider: Arc<CryptoProvider>,
}

impl fmt::Debug for PinnedLeafVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedLeafVerifier")
            .field("pinned_fingerprint_lower", &self.pinned_fingerprint_lower)
            .finish()
    }
}

impl PinnedLeafVerifier {
    pub fn new(pinned_fingerprint_lower: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            pinned_fingerprint_lower: pinned_fingerprint_lower.into().to_lowercase(),
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        })
    }
}

impl ServerCertVerifier for PinnedLeafVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        let mut hasher = Sha256::new();
        hasher.update(end_entity.as_ref());
        let digest = hex::encode(hasher.finalize());
        if digest == self.pinned_fingerprint_lower {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(TlsError::General(format!(
                "leaf certificate fingerprint {digest} does not match pinned {}",
                self.pinned_fingerprint_lower
            )))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_comparison_is_case_insensitive() {
        let verifier = PinnedLeafVerifier::new("AABBCC".to_string());
        assert_eq!(verifier.pinned_fingerprint_lower, "aabbcc");
    }
}
