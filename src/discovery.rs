//! Service discovery TXT record parsing (§6). The mDNS/Bonjour browser
//! itself is an external collaborator; this module only turns the
//! key/value map such a browser hands back into a typed endpoint.

use std::collections::HashMap;

const DEFAULT_PAIRING_SCHEME: &str = "https";
const DEFAULT_PAIRING_PORT: u16 = 7448;
const DEFAULT_QUIC_PORT: u16 = 7447;

/// A desktop endpoint resolved from a browsed TXT record, with scheme and
/// port defaults already applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredEndpoint {
    pub display_name: String,
    pub device_id: String,
    pub pairing_scheme: String,
    pub pairing_port: u16,
    pub quic_port: u16,
    pub pairing_cert_fingerprint_sha256: Option<String>,
}

/// Parses a TXT-record-shaped map into a [`DiscoveredEndpoint`], applying
/// the defaults of §6 for any field the browser didn't advertise.
/// `display_name` and `device_id` are required; their absence means the
/// record didn't describe a desktop peer at all, so this returns `None`
/// rather than an error.
pub fn parse_txt_record(fields: &HashMap<String, String>) -> Option<DiscoveredEndpoint> {
    let display_name = fields.get("display_name")?.clone();
    let device_id = fields.get("device_id")?.clone();

    let pairing_scheme = fields
        .get("pairing_scheme")
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| DEFAULT_PAIRING_SCHEME.to_string());

    let pairing_port = fields
        .get("pairing_port")
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PAIRING_PORT);

    let quic_port = fields
        .get("quic_port")
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_QUIC_PORT);

    let pairing_cert_fingerprint_sha256 =
        fields.get("pairing_cert_fingerprint_sha256").map(|f| f.to_lowercase());

    Some(DiscoveredEndpoint {
        display_name,
        device_id,
        pairing_scheme,
        pairing_port,
        quic_port,
        pairing_cert_fingerprint_sha256,
    })
}
