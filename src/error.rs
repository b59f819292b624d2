//! Crate-wide error taxonomy.
//!
//! Each subsystem gets its own `thiserror` enum; [`ScanError`] rolls them
//! up with `#[from]` so callers that just want "did this fail" can use
//! one type, while subsystem code keeps precise variants.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PairingError {
    #[error("qr payload malformed: {0}")]
    QrMalformed(#[from] QrMalformedReason),
    #[error("pairing code rejected by desktop")]
    InvalidCode,
    #[error("pairing code expired")]
    Expired,
    #[error("too many attempts, locked out")]
    LockedOut,
    #[error("desktop rejected pairing: {status}")]
    ServerRejected { status: u16 },
    #[error("endpoint has no pinned fingerprint, refusing to pair")]
    UntrustedEndpoint,
    #[error("desktop returned a malformed client-tls bundle")]
    MalformedMtlsBundle,
    #[error("http transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QrMalformedReason {
    #[error("payload is not valid utf-8 json")]
    NotJson,
    #[error("pairing_endpoint must be an https url with a host")]
    SchemeNotHttps,
    #[error("protocol_version major must be 1")]
    UnsupportedVersion,
    #[error("expires_at_utc is not a valid, future rfc3339 timestamp")]
    Expired,
    #[error("desktop_cert_fingerprint_sha256 must be exactly 64 hex characters")]
    FingerprintInvalid,
    #[error("signature_b64 must decode to exactly 32 bytes")]
    SignatureInvalid,
    #[error("quic_endpoint must be host:port with 1 <= port <= 65535")]
    QuicEndpointInvalid,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity document is corrupt: {0}")]
    Corrupt(String),
    #[error("legacy client-tls migration incomplete: missing {field}")]
    LegacyMigrationIncomplete { field: &'static str },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum TrustStoreError {
    #[error("trust store is corrupt: {0}")]
    Corrupt(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SecureChannelError {
    #[error("handshake protocol or session id mismatch")]
    HandshakeMismatch,
    #[error("frame counter {counter} is not greater than high-water mark {high_water}")]
    ReplayRejected { counter: i64, high_water: i64 },
    #[error("aead operation failed")]
    AeadFailure,
    #[error("outbound counter exhausted (2^32 frames sent)")]
    CounterExhausted,
    #[error("malformed frame: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("secure channel error: {0}")]
    SecureChannel(#[from] SecureChannelError),
    #[error("connection closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls error: {0}")]
    Tls(String),
    #[error("peer certificate did not match pinned fingerprint")]
    UntrustedPeer,
    #[error("handshake did not complete before send")]
    NotHandshaken,
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("payload hash mismatch: expected {expected}, computed {computed}")]
    PayloadHashMismatch { expected: String, computed: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Crate-wide rollup error.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Pairing(#[from] PairingError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    TrustStore(#[from] TrustStoreError),
    #[error(transparent)]
    SecureChannel(#[from] SecureChannelError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Recorder(#[from] RecorderError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("controller is in state {actual}, expected {expected}")]
    InvalidState { expected: &'static str, actual: &'static str },
    #[error("no trust record for paired peer {0}")]
    PeerNotTrusted(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ScanResult<T> = std::result::Result<T, ScanError>;
