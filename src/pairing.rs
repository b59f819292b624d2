//! Pairing client (C4): validates a scanned QR payload and drives the
//! confirm exchange against a pinned desktop endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::crypto_primitives::b64_decode;
use crate::error::{PairingError, QrMalformedReason};
use crate::tls_pinning::PinnedLeafVerifier;
use crate::trust::TrustRecord;

#[derive(Debug, Clone, Deserialize)]
struct RawQrPayload {
    pairing_token: String,
    pairing_code: String,
    pairing_nonce: String,
    desktop_device_id: String,
    desktop_display_name: String,
    pairing_endpoint: String,
    quic_endpoint: String,
    expires_at_utc: String,
    desktop_cert_fingerprint_sha256: String,
    protocol_version: String,
    signature_b64: String,
}

/// A QR payload that has passed every validation step of §4.3, with
/// case-normalized fields ready to drive the confirm exchange.
#[derive(Debug, Clone)]
pub struct QrPairingPayload {
    pub pairing_token: String,
    pub pairing_code: String,
    pub pairing_nonce: String,
    pub desktop_device_id: String,
    pub desktop_display_name: String,
    pub pairing_endpoint: Url,
    pub quic_host: String,
    pub quic_port: u16,
    pub expires_at_utc: DateTime<Utc>,
    pub desktop_cert_fingerprint_sha256: String,
    pub protocol_version: String,
}

/// Devices in the field send a bare `major.minor` (the spec's own example
/// is `"1.1"`), which isn't a strict semver triple, so pad a missing patch
/// component before handing it to the real parser.
fn parse_major_version(value: &str) -> Option<u64> {
    let normalized = match value.matches('.').count() {
        0 => format!("{value}.0.0"),
        1 => format!("{value}.0"),
        _ => value.to_string(),
    };
    semver::Version::parse(&normalized).ok().map(|v| v.major)
}

fn parse_host_port(value: &str) -> Option<(String, u16)> {
    let (host, port_str) = value.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port: u32 = port_str.parse().ok()?;
    if port == 0 || port > 65535 {
        return None;
    }
    Some((host.to_string(), port as u16))
}

/// Runs the seven-step validation order of §4.3 exactly in order; the
/// first failing step determines the error.
pub fn validate_qr_payload(bytes: &[u8]) -> Result<QrPairingPayload, PairingError> {
    // Step 1: UTF-8 JSON shape.
    let raw: RawQrPayload =
        serde_json::from_slice(bytes).map_err(|_| QrMalformedReason::NotJson)?;

    // Step 2: pairing_endpoint is an https URL with a non-empty host.
    let pairing_endpoint = Url::parse(&raw.pairing_endpoint).map_err(|_| QrMalformedReason::SchemeNotHttps)?;
    if pairing_endpoint.scheme() != "https" || pairing_endpoint.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(QrMalformedReason::SchemeNotHttps.into());
    }

    // Step 3: protocol_version major == 1.
    let major = parse_major_version(&raw.protocol_version).ok_or(QrMalformedReason::UnsupportedVersion)?;
    if major != 1 {
        return Err(QrMalformedReason::UnsupportedVersion.into());
    }

    // Step 4: expires_at_utc is a valid, strictly-future RFC-3339 timestamp.
    let expires_at_utc = DateTime::parse_from_rfc3339(&raw.expires_at_utc)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| QrMalformedReason::Expired)?;
    if expires_at_utc <= Utc::now() {
        return Err(QrMalformedReason::Expired.into());
    }

    // Step 5: fingerprint is exactly 64 hex characters (case-insensitive).
    let fingerprint = &raw.desktop_cert_fingerprint_sha256;
    if fingerprint.len() != 64 || !fingerprint.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(QrMalformedReason::FingerprintInvalid.into());
    }

    // Step 6: signature_b64 decodes to exactly 32 bytes.
    let signature = b64_decode(&raw.signature_b64).map_err(|_| QrMalformedReason::SignatureInvalid)?;
    if signature.len() != 32 {
        return Err(QrMalformedReason::SignatureInvalid.into());
    }

    // Step 7: quic_endpoint parses to (host, port) with 1 <= port <= 65535.
    let (quic_host, quic_port) =
        parse_host_port(&raw.quic_endpoint).ok_or(QrMalformedReason::QuicEndpointInvalid)?;

    Ok(QrPairingPayload {
        pairing_token: raw.pairing_token,
        pairing_code: raw.pairing_code,
        pairing_nonce: raw.pairing_nonce,
        desktop_device_id: raw.desktop_device_id,
        desktop_display_name: raw.desktop_display_name,
        pairing_endpoint,
        quic_host,
        quic_port,
        expires_at_utc,
        desktop_cert_fingerprint_sha256: fingerprint.to_lowercase(),
        protocol_version: raw.protocol_version,
    })
}

#[derive(Serialize)]
struct PairingConfirmBody<'a> {
    pairing_code: &'a str,
    pairing_confirm: PairingConfirmInner<'a>,
}

#[derive(Serialize)]
struct PairingConfirmInner<'a> {
    pairing_nonce: &'a str,
    scan_device_id: &'a str,
    scan_display_name: &'a str,
    scan_cert_fingerprint_sha256: &'a str,
    desktop_cert_fingerprint_sha256: &'a str,
    confirmed_at_utc: DateTime<Utc>,
}

#[derive(Deserialize)]
struct PairingConfirmResponse {
    trust_record: TrustRecord,
    scan_client_mtls: Option<ScanClientMtls>,
}

#[derive(Deserialize)]
pub struct ScanClientMtls {
    pub bundle_b64: String,
    pub password: String,
    pub fingerprint_sha256: String,
}

pub struct PairingOutcome {
    pub trust_record: TrustRecord,
    pub client_mtls: Option<ScanClientMtls>,
}

/// Drives the confirm exchange of §4.3. A fresh pinned HTTP client is built
/// per attempt, scoped to this one desktop fingerprint.
pub async fn confirm_pairing(
    payload: &QrPairingPayload,
    scan_device_id: &str,
    scan_display_name: &str,
    scan_cert_fingerprint_sha256: &str,
) -> Result<PairingOutcome, PairingError> {
    let span = tracing::info_span!("pairing.confirm", desktop_device_id = %payload.desktop_device_id);
    let _enter = span.enter();

    if payload.desktop_cert_fingerprint_sha256.is_empty() {
        return Err(PairingError::UntrustedEndpoint);
    }

    let tls_config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(PinnedLeafVerifier::new(&payload.desktop_cert_fingerprint_sha256))
        .with_no_client_auth();

    let client = reqwest::Client::builder()
        .use_preconfigured_tls(tls_config)
        .build()
        .map_err(|e| PairingError::Transport(e.to_string()))?;

    let body = PairingConfirmBody {
        pairing_code: &payload.pairing_code,
        pairing_confirm: PairingConfirmInner {
            pairing_nonce: &payload.pairing_nonce,
            scan_device_id,
            scan_display_name,
            scan_cert_fingerprint_sha256,
            desktop_cert_fingerprint_sha256: &payload.desktop_cert_fingerprint_sha256,
            confirmed_at_utc: Utc::now(),
        },
    };

    let url = format!("{}/pairing/confirm", payload.pairing_endpoint.as_str().trim_end_matches('/'));
    let response = client
        .post(&url)
        .json(&body)
        .send()
        .await
        .map_err(|e| PairingError::Transport(e.to_string()))?;

    let status = response.status().as_u16();
    match status {
        200 => {
            let parsed: PairingConfirmResponse = response
                .json()
                .await
                .map_err(|e| PairingError::Transport(e.to_string()))?;
            if parsed.scan_client_mtls.as_ref().is_some_and(|b| {
                crate::crypto_primitives::b64_decode(&b.bundle_b64).is_err() || b.fingerprint_sha256.len() != 64
            }) {
                return Err(PairingError::MalformedMtlsBundle);
            }
            tracing::info!(status, "pairing.confirm.accepted");
            Ok(PairingOutcome { trust_record: parsed.trust_record, client_mtls: parsed.scan_client_mtls })
        }
        401 => {
            tracing::warn!(status, "pairing.confirm.rejected");
            Err(PairingError::InvalidCode)
        }
        410 => {
            tracing::warn!(status, "pairing.confirm.rejected");
            Err(PairingError::Expired)
        }
        429 => {
            tracing::warn!(status, "pairing.confirm.rejected");
            Err(PairingError::LockedOut)
        }
        other => {
            tracing::warn!(status = other, "pairing.confirm.rejected");
            Err(PairingError::ServerRejected { status: other })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

    fn valid_payload_json(overrides: impl FnOnce(&mut serde_json::Value)) -> Vec<u8> {
        let mut value = serde_json::json!({
            "pairing_token": "tok-1",
            "pairing_code": "123456",
            "pairing_nonce": "nonce-1",
            "desktop_device_id": "desktop-1",
            "desktop_display_name": "Office Desktop",
            "pairing_endpoint": "https://192.168.1.44:7448",
            "quic_endpoint": "192.168.1.44:7447",
            "expires_at_utc": (Utc::now() + chrono::Duration::minutes(5)).to_rfc3339(),
            "desktop_cert_fingerprint_sha256": "a".repeat(64),
            "protocol_version": "1.1",
            "signature_b64": BASE64.encode([0u8; 32]),
        });
        overrides(&mut value);
        serde_json::to_vec(&value).unwrap()
    }

    #[test]
    fn accepts_well_formed_payload() {
        let bytes = valid_payload_json(|_| {});
        let parsed = validate_qr_payload(&bytes).unwrap();
        assert_eq!(parsed.quic_host, "192.168.1.44");
        assert_eq!(parsed.quic_port, 7447);
        assert_eq!(parsed.desktop_cert_fingerprint_sha256, "a".repeat(64));
    }

    #[test]
    fn rejects_http_scheme() {
        let bytes = valid_payload_json(|v| v["pairing_endpoint"] = serde_json::json!("http://192.168.1.44:7448"));
        let err = validate_qr_payload(&bytes).unwrap_err();
        assert_matches::assert_matches!(err, PairingError::QrMalformed(QrMalformedReason::SchemeNotHttps));
    }

    #[test]
    fn rejects_unsupported_major_version() {
        let bytes = valid_payload_json(|v| v["protocol_version"] = serde_json::json!("2.0"));
        let err = validate_qr_payload(&bytes).unwrap_err();
        assert_matches::assert_matches!(err, PairingError::QrMalformed(QrMalformedReason::UnsupportedVersion));
    }

    #[test]
    fn rejects_expired_timestamp() {
        let bytes =
            valid_payload_json(|v| v["expires_at_utc"] = serde_json::json!((Utc::now() - chrono::Duration::minutes(5)).to_rfc3339()));
        let err = validate_qr_payload(&bytes).unwrap_err();
        assert_matches::assert_matches!(err, PairingError::QrMalformed(QrMalformedReason::Expired));
    }

    #[test]
    fn rejects_short_fingerprint() {
        let bytes = valid_payload_json(|v| v["desktop_cert_fingerprint_sha256"] = serde_json::json!("abc"));
        let err = validate_qr_payload(&bytes).unwrap_err();
        assert_matches::assert_matches!(err, PairingError::QrMalformed(QrMalformedReason::FingerprintInvalid));
    }

    #[test]
    fn rejects_signature_of_wrong_length() {
        let bytes = valid_payload_json(|v| v["signature_b64"] = serde_json::json!(BASE64.encode([0u8; 16])));
        let err = validate_qr_payload(&bytes).unwrap_err();
        assert_matches::assert_matches!(err, PairingError::QrMalformed(QrMalformedReason::SignatureInvalid));
    }

    #[test]
    fn rejects_out_of_range_quic_port() {
        let bytes = valid_payload_json(|v| v["quic_endpoint"] = serde_json::json!("192.168.1.44:70000"));
        let err = validate_qr_payload(&bytes).unwrap_err();
        assert_matches::assert_matches!(err, PairingError::QrMalformed(QrMalformedReason::QuicEndpointInvalid));
    }

    #[test]
    fn rejects_non_json_payload() {
        let err = validate_qr_payload(b"not json").unwrap_err();
        assert_matches::assert_matches!(err, PairingError::QrMalformed(QrMalformedReason::NotJson));
    }
}
