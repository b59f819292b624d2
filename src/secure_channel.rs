//! Secure channel codec (C5): signed hello/ack handshake, ECDH+HKDF session
//! key derivation, and counter-framed AEAD envelopes with a replay window.
//!
//! This module only speaks JSON values in and out; it never touches a
//! socket. The framed transport client (§4.5) is the thing that puts these
//! envelopes on the wire.

use chrono::{DateTime, Utc};
use p256::ecdh::EphemeralSecret;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};

use crate::crypto_primitives::{b64_decode, b64_encode, hkdf_expand, open_with_nonce, seal_with_nonce, GCM_NONCE_LEN};
use crate::error::SecureChannelError;
use crate::ids::new_sortable_id;

pub const PROTOCOL_ID: &str = "provinode.scan.secure-channel.v1";
const SESSION_KEY_INFO: &[u8] = b"scan-device-secure-channel-v1";
const SESSION_KEY_MATERIAL_LEN: usize = 32 + 8;

pub const CONTROL_CHANNEL: u8 = 0x01;
pub const SAMPLE_CHANNEL: u8 = 0x02;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecureChannelHello {
    pub protocol: String,
    pub session_id: String,
    pub scan_device_id: String,
    pub scan_cert_fingerprint_sha256: String,
    pub hello_nonce: String,
    pub client_ephemeral_public_key_b64: String,
    pub created_at_utc: DateTime<Utc>,
    pub scan_signing_public_key_b64: String,
    pub hello_signature_b64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecureChannelAck {
    pub protocol: String,
    pub session_id: String,
    pub server_ephemeral_public_key_b64: String,
    pub ack_salt_b64: String,
}

/// JSON wire shape of one encrypted frame. `ciphertext_b64` and `tag_b64`
/// are split apart even though AES-GCM produces them as one buffer, to
/// match the envelope's declared field shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AeadEnvelope {
    pub protocol: String,
    pub payload_channel: u8,
    pub counter: u32,
    pub nonce_b64: String,
    pub ciphertext_b64: String,
    pub tag_b64: String,
}

const GCM_TAG_LEN: usize = 16;

fn canonical_hello_payload(
    session_id: &str,
    scan_device_id: &str,
    fingerprint_lower: &str,
    hello_nonce: &str,
    client_ephemeral_pub_b64: &str,
    signing_pub_b64: &str,
) -> String {
    format!(
        "{PROTOCOL_ID}\n{session_id}\n{scan_device_id}\n{fingerprint_lower}\n{hello_nonce}\n{client_ephemeral_pub_b64}\n{signing_pub_b64}"
    )
}

/// Holds the client's ephemeral secret between building the hello and
/// processing the peer's ack; deliberately not `Clone`/`Debug` (the
/// underlying secret zeroizes on drop).
pub struct ClientHandshake {
    ephemeral_secret: EphemeralSecret,
    session_id: String,
}

impl ClientHandshake {
    /// Builds the hello message (step 1-4 of §4.4) and returns a handle to
    /// complete the handshake once the peer's ack arrives.
    pub fn begin(
        session_id: &str,
        scan_device_id: &str,
        scan_cert_fingerprint_sha256: &str,
        signing_key_raw_scalar: &[u8; 32],
        signing_public_x963: &[u8],
    ) -> (Self, SecureChannelHello) {
        let ephemeral_secret = EphemeralSecret::random(&mut OsRng);
        let client_ephemeral_public_key_b64 =
            b64_encode(ephemeral_secret.public_key().to_encoded_point(false).as_bytes());
        let scan_signing_public_key_b64 = b64_encode(signing_public_x963);
        let hello_nonce = new_sortable_id();
        let fingerprint_lower = scan_cert_fingerprint_sha256.to_lowercase();

        let canonical = canonical_hello_payload(
            session_id,
            scan_device_id,
            &fingerprint_lower,
            &hello_nonce,
            &client_ephemeral_public_key_b64,
            &scan_signing_public_key_b64,
        );

        let signing_key = SigningKey::from_bytes(signing_key_raw_scalar.into())
            .expect("raw signing scalar is a valid P-256 key");
        let signature: Signature = signing_key.sign(canonical.as_bytes());

        let hello = SecureChannelHello {
            protocol: PROTOCOL_ID.to_string(),
            session_id: session_id.to_string(),
            scan_device_id: scan_device_id.to_string(),
            scan_cert_fingerprint_sha256: fingerprint_lower,
            hello_nonce,
            client_ephemeral_public_key_b64,
            created_at_utc: Utc::now(),
            scan_signing_public_key_b64,
            hello_signature_b64: b64_encode(&signature.to_bytes()),
        };

        (Self { ephemeral_secret, session_id: session_id.to_string() }, hello)
    }

    /// Validates the ack's protocol/session id (step 5), derives the
    /// session key material via ECDH+HKDF (step 6), and returns a ready
    /// [`SecureChannelState`].
    pub fn complete(self, ack: &SecureChannelAck) -> Result<SecureChannelState, SecureChannelError> {
        if ack.protocol != PROTOCOL_ID || ack.session_id != self.session_id {
            return Err(SecureChannelError::HandshakeMismatch);
        }

        let server_public_bytes = b64_decode(&ack.server_ephemeral_public_key_b64)
            .map_err(|e| SecureChannelError::Malformed(e.to_string()))?;
        let server_public = PublicKey::from_sec1_bytes(&server_public_bytes)
            .map_err(|e| SecureChannelError::Malformed(e.to_string()))?;

        let shared = self.ephemeral_secret.diffie_hellman(&server_public);
        let salt = b64_decode(&ack.ack_salt_b64).map_err(|e| SecureChannelError::Malformed(e.to_string()))?;

        let okm = hkdf_expand(shared.raw_secret_bytes(), &salt, SESSION_KEY_INFO, SESSION_KEY_MATERIAL_LEN);
        let mut encryption_key = [0u8; 32];
        let mut nonce_prefix = [0u8; 8];
        encryption_key.copy_from_slice(&okm[..32]);
        nonce_prefix.copy_from_slice(&okm[32..]);

        Ok(SecureChannelState { encryption_key, nonce_prefix, outbound_counter: 0, inbound_counter: -1 })
    }
}

/// Per-direction session key material plus the counters that enforce
/// strictly-increasing frame ordering (§4.4).
pub struct SecureChannelState {
    encryption_key: [u8; 32],
    nonce_prefix: [u8; 8],
    outbound_counter: u32,
    inbound_counter: i64,
}

fn nonce_for(prefix: &[u8; 8], counter: u32) -> [u8; GCM_NONCE_LEN] {
    let mut nonce = [0u8; GCM_NONCE_LEN];
    nonce[..8].copy_from_slice(prefix);
    nonce[8..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

impl SecureChannelState {
    /// Encrypts `plaintext` for `payload_channel`, advancing the outbound
    /// counter. Fails closed once 2³² frames have been sent in this
    /// direction (§4.4, §8 boundary behavior).
    pub fn encode_frame(&mut self, payload_channel: u8, plaintext: &[u8]) -> Result<AeadEnvelope, SecureChannelError> {
        let counter = self.outbound_counter;
        self.outbound_counter = self.outbound_counter.checked_add(1).ok_or(SecureChannelError::CounterExhausted)?;

        let nonce = nonce_for(&self.nonce_prefix, counter);
        let sealed = seal_with_nonce(&self.encryption_key, &nonce, plaintext).map_err(|_| SecureChannelError::AeadFailure)?;
        let split_at = sealed.len().saturating_sub(GCM_TAG_LEN);
        let (ciphertext, tag) = sealed.split_at(split_at);

        Ok(AeadEnvelope {
            protocol: PROTOCOL_ID.to_string(),
            payload_channel,
            counter,
            nonce_b64: b64_encode(&nonce),
            ciphertext_b64: b64_encode(ciphertext),
            tag_b64: b64_encode(tag),
        })
    }

    /// Decrypts an inbound envelope. A counter that is not strictly
    /// greater than the current high-water mark is a replay and is
    /// rejected without advancing state; a genuine AEAD failure is fatal
    /// to the session and must disconnect the caller.
    pub fn decode_frame(&mut self, envelope: &AeadEnvelope) -> Result<(u8, Vec<u8>), SecureChannelError> {
        let counter_i64 = i64::from(envelope.counter);
        if counter_i64 <= self.inbound_counter {
            return Err(SecureChannelError::ReplayRejected { counter: counter_i64, high_water: self.inbound_counter });
        }

        let nonce_bytes = b64_decode(&envelope.nonce_b64).map_err(|e| SecureChannelError::Malformed(e.to_string()))?;
        if nonce_bytes.len() != GCM_NONCE_LEN {
            return Err(SecureChannelError::Malformed("nonce is not 12 bytes".into()));
        }
        let mut nonce = [0u8; GCM_NONCE_LEN];
        nonce.copy_from_slice(&nonce_bytes);

        let mut sealed = b64_decode(&envelope.ciphertext_b64).map_err(|e| SecureChannelError::Malformed(e.to_string()))?;
        sealed.extend(b64_decode(&envelope.tag_b64).map_err(|e| SecureChannelError::Malformed(e.to_string()))?);

        let plaintext = open_with_nonce(&self.encryption_key, &nonce, &sealed).map_err(|_| SecureChannelError::AeadFailure)?;
        self.inbound_counter = counter_i64;
        Ok((envelope.payload_channel, plaintext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signing_material() -> ([u8; 32], Vec<u8>) {
        let signing_key = SigningKey::random(&mut OsRng);
        let raw: [u8; 32] = signing_key.to_bytes().into();
        let public = signing_key.verifying_key().to_encoded_point(false).as_bytes().to_vec();
        (raw, public)
    }

    fn handshake_pair() -> (SecureChannelState, SecureChannelState) {
        let (raw_scalar, signing_pub) = signing_material();
        let (client, hello) = ClientHandshake::begin("session-1", "scan-1", &"a".repeat(64), &raw_scalar, &signing_pub);

        let server_secret = EphemeralSecret::random(&mut OsRng);
        let server_public_b64 = b64_encode(server_secret.public_key().to_encoded_point(false).as_bytes());
        let salt = b"fixed-test-salt-0123456789abcd";

        let ack = SecureChannelAck {
            protocol: PROTOCOL_ID.to_string(),
            session_id: hello.session_id.clone(),
            server_ephemeral_public_key_b64: server_public_b64,
            ack_salt_b64: b64_encode(salt),
        };

        let client_public = PublicKey::from_sec1_bytes(
            &b64_decode(&hello.client_ephemeral_public_key_b64).unwrap(),
        )
        .unwrap();
        let server_shared = server_secret.diffie_hellman(&client_public);
        let okm = hkdf_expand(server_shared.raw_secret_bytes(), salt, SESSION_KEY_INFO, SESSION_KEY_MATERIAL_LEN);
        let mut server_key = [0u8; 32];
        let mut server_prefix = [0u8; 8];
        server_key.copy_from_slice(&okm[..32]);
        server_prefix.copy_from_slice(&okm[32..]);
        let server_state = SecureChannelState {
            encryption_key: server_key,
            nonce_prefix: server_prefix,
            outbound_counter: 0,
            inbound_counter: -1,
        };

        let client_state = client.complete(&ack).unwrap();
        (client_state, server_state)
    }

    #[test]
    fn ecdh_hkdf_derives_matching_key_material_on_both_sides() {
        let (client_state, server_state) = handshake_pair();
        assert_eq!(client_state.encryption_key, server_state.encryption_key);
        assert_eq!(client_state.nonce_prefix, server_state.nonce_prefix);
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let (mut client_state, mut server_state) = handshake_pair();
        let envelope = client_state.encode_frame(SAMPLE_CHANNEL, b"hello peer").unwrap();
        let (channel, plaintext) = server_state.decode_frame(&envelope).unwrap();
        assert_eq!(channel, SAMPLE_CHANNEL);
        assert_eq!(plaintext, b"hello peer");
    }

    #[test]
    fn replayed_counter_is_rejected_without_advancing_state() {
        let (mut client_state, mut server_state) = handshake_pair();
        let envelope = client_state.encode_frame(SAMPLE_CHANNEL, b"first").unwrap();
        server_state.decode_frame(&envelope).unwrap();

        let err = server_state.decode_frame(&envelope).unwrap_err();
        assert!(matches!(err, SecureChannelError::ReplayRejected { counter: 0, high_water: 0 }));
    }

    #[test]
    fn handshake_rejects_session_id_mismatch() {
        let (raw_scalar, signing_pub) = signing_material();
        let (client, hello) = ClientHandshake::begin("session-1", "scan-1", &"a".repeat(64), &raw_scalar, &signing_pub);
        let _ = hello;
        let ack = SecureChannelAck {
            protocol: PROTOCOL_ID.to_string(),
            session_id: "session-2".to_string(),
            server_ephemeral_public_key_b64: String::new(),
            ack_salt_b64: String::new(),
        };
        let err = client.complete(&ack).unwrap_err();
        assert!(matches!(err, SecureChannelError::HandshakeMismatch));
    }

    #[test]
    fn outbound_counter_exhaustion_is_refused_before_emission() {
        let (mut client_state, _server_state) = handshake_pair();
        client_state.outbound_counter = u32::MAX;
        let envelope = client_state.encode_frame(SAMPLE_CHANNEL, b"one more").unwrap();
        assert_eq!(envelope.counter, u32::MAX);
        let err = client_state.encode_frame(SAMPLE_CHANNEL, b"overflow").unwrap_err();
        assert!(matches!(err, SecureChannelError::CounterExhausted));
    }
}
