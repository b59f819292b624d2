//! Persistent device identity (C2): a P-256 signing keypair plus an
//! optional, encrypted-at-rest client mutual-TLS bundle.
//!
//! Mirrors the single-owner-plus-serialized-mutex shape this crate uses
//! for the trust store and session recorder: exactly one in-flight
//! mutation at a time, atomic write-to-temp-then-rename on every persist.

use std::path::{Path, PathBuf};

use ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::rand_core::OsRng;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::crypto_primitives::{b64_decode, b64_encode, open_with_embedded_nonce, seal_with_random_nonce};
use crate::error::IdentityError;
use crate::fsutil::{atomic_write, mark_excluded_from_backup, read_if_exists};
use crate::ids::{new_sortable_id, sha256_hex};

const CLIENT_TLS_BLOB_FORMAT: &str = "scan-device.identity.client-tls.v1";
const CLIENT_TLS_HKDF_INFO: &[u8] = b"scan-device-identity-client-tls-v1";

/// Derived identity material handed to the pairing client and secure
/// channel codec. Never persisted in this shape — the private scalar is
/// base64 only so it can travel to in-process signing calls without a
/// second copy of the raw bytes floating around.
#[derive(Clone)]
pub struct DeviceIdentityMaterial {
    pub device_id: String,
    pub fingerprint_sha256: String,
    pub signing_public_x963_b64: String,
    pub signing_private_scalar_b64: String,
}

impl DeviceIdentityMaterial {
    pub fn signing_key(&self) -> Result<SigningKey, IdentityError> {
        let bytes = b64_decode(&self.signing_private_scalar_b64)
            .map_err(|e| IdentityError::Corrupt(format!("private scalar base64: {e}")))?;
        SigningKey::from_slice(&bytes).map_err(|e| IdentityError::Corrupt(format!("private scalar: {e}")))
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, IdentityError> {
        let bytes = b64_decode(&self.signing_public_x963_b64)
            .map_err(|e| IdentityError::Corrupt(format!("public key base64: {e}")))?;
        VerifyingKey::from_sec1_bytes(&bytes).map_err(|e| IdentityError::Corrupt(format!("public key: {e}")))
    }

    pub fn sign(&self, payload: &[u8]) -> Result<[u8; 64], IdentityError> {
        let key = self.signing_key()?;
        let sig: Signature = key.sign(payload);
        Ok(sig.to_bytes().into())
    }
}

/// A mutual-TLS identity handed to the framed transport client.
#[derive(Clone, Serialize, Deserialize)]
pub struct ClientTlsBundle {
    pub bytes_b64: String,
    pub password: String,
    pub fingerprint_sha256: String,
}

#[derive(Serialize, Deserialize)]
struct EncryptedBlob {
    format: String,
    blob_b64: String,
}

#[derive(Serialize, Deserialize, Default)]
struct IdentityDocument {
    device_id: String,
    signing_private_scalar_b64: String,
    signing_public_x963_b64: String,
    client_tls: Option<EncryptedBlob>,

    // Legacy plaintext fields, migrated to `client_tls` on next load/write.
    #[serde(default)]
    legacy_client_tls_bytes_b64: Option<String>,
    #[serde(default)]
    legacy_client_tls_password: Option<String>,
    #[serde(default)]
    legacy_client_tls_fingerprint_sha256: Option<String>,
}

impl IdentityDocument {
    fn generate() -> Self {
        let signing_key = SigningKey::random(&mut OsRng);
        let verifying_key = VerifyingKey::from(&signing_key);
        let public_point = verifying_key.to_encoded_point(false);
        Self {
            device_id: new_sortable_id(),
            signing_private_scalar_b64: b64_encode(signing_key.to_bytes().as_slice()),
            signing_public_x963_b64: b64_encode(public_point.as_bytes()),
            client_tls: None,
            legacy_client_tls_bytes_b64: None,
            legacy_client_tls_password: None,
            legacy_client_tls_fingerprint_sha256: None,
        }
    }

    fn material(&self) -> DeviceIdentityMaterial {
        let fingerprint_sha256 = sha256_hex(
            &b64_decode(&self.signing_public_x963_b64).unwrap_or_default(),
        );
        DeviceIdentityMaterial {
            device_id: self.device_id.clone(),
            fingerprint_sha256,
            signing_public_x963_b64: self.signing_public_x963_b64.clone(),
            signing_private_scalar_b64: self.signing_private_scalar_b64.clone(),
        }
    }

    fn has_partial_legacy_triple(&self) -> bool {
        let present = [
            self.legacy_client_tls_bytes_b64.is_some(),
            self.legacy_client_tls_password.is_some(),
            self.legacy_client_tls_fingerprint_sha256.is_some(),
        ];
        let count = present.iter().filter(|p| **p).count();
        count > 0 && count < 3
    }

    fn has_full_legacy_triple(&self) -> bool {
        self.legacy_client_tls_bytes_b64.is_some()
            && self.legacy_client_tls_password.is_some()
            && self.legacy_client_tls_fingerprint_sha256.is_some()
    }

    fn client_tls_encryption_key(&self) -> [u8; 32] {
        let ikm = b64_decode(&self.signing_private_scalar_b64).unwrap_or_default();
        let salt = format!("scan-device:{}", self.device_id);
        let okm = crate::crypto_primitives::hkdf_expand(&ikm, salt.as_bytes(), CLIENT_TLS_HKDF_INFO, 32);
        let mut key = [0u8; 32];
        key.copy_from_slice(&okm);
        key
    }

    fn migrate_legacy_client_tls(&mut self) -> Result<(), IdentityError> {
        if !self.has_full_legacy_triple() {
            return Ok(());
        }
        let bundle = ClientTlsBundle {
            bytes_b64: self.legacy_client_tls_bytes_b64.take().unwrap(),
            password: self.legacy_client_tls_password.take().unwrap(),
            fingerprint_sha256: self.legacy_client_tls_fingerprint_sha256.take().unwrap().to_lowercase(),
        };
        self.encrypt_client_tls(&bundle)?;
        tracing::info!(device_id = %self.device_id, "identity.client_tls_migrated");
        Ok(())
    }

    fn encrypt_client_tls(&mut self, bundle: &ClientTlsBundle) -> Result<(), IdentityError> {
        let key = self.client_tls_encryption_key();
        let plaintext = serde_json::to_vec(bundle)?;
        let sealed = seal_with_random_nonce(&key, &plaintext, b"")
            .map_err(|_| IdentityError::Corrupt("client-tls encryption failed".into()))?;
        self.client_tls = Some(EncryptedBlob {
            format: CLIENT_TLS_BLOB_FORMAT.to_string(),
            blob_b64: b64_encode(&sealed),
        });
        Ok(())
    }

    fn decrypt_client_tls(&self) -> Result<Option<ClientTlsBundle>, IdentityError> {
        let Some(blob) = &self.client_tls else { return Ok(None) };
        if blob.format != CLIENT_TLS_BLOB_FORMAT {
            return Err(IdentityError::Corrupt(format!("unknown client-tls blob format {}", blob.format)));
        }
        let key = self.client_tls_encryption_key();
        let sealed = b64_decode(&blob.blob_b64).map_err(|e| IdentityError::Corrupt(e.to_string()))?;
        let plaintext = open_with_embedded_nonce(&key, &sealed, b"")
            .map_err(|_| IdentityError::Corrupt("client-tls decryption failed".into()))?;
        let bundle: ClientTlsBundle = serde_json::from_slice(&plaintext)?;
        Ok(Some(bundle))
    }
}

pub struct IdentityStore {
    path: PathBuf,
    doc: Mutex<IdentityDocument>,
}

impl IdentityStore {
    /// Load the identity document at `path`, creating and persisting a new
    /// one on first use. Fatal (`IdentityError::Corrupt` /
    /// `LegacyMigrationIncomplete`) if the existing document cannot be
    /// parsed or has a partial legacy triple.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, IdentityError> {
        let path = path.as_ref().to_path_buf();
        let doc = match read_if_exists(&path).await? {
            Some(bytes) => {
                let mut doc: IdentityDocument = serde_json::from_slice(&bytes)
                    .map_err(|e| IdentityError::Corrupt(format!("identity document: {e}")))?;
                if doc.has_partial_legacy_triple() {
                    return Err(IdentityError::LegacyMigrationIncomplete {
                        field: "legacy_client_tls_*",
                    });
                }
                let had_legacy = doc.has_full_legacy_triple();
                doc.migrate_legacy_client_tls()?;
                tracing::debug!(device_id = %doc.device_id, "identity.loaded");
                if had_legacy {
                    let bytes = serde_json::to_vec_pretty(&doc)?;
                    atomic_write(&path, &bytes).await?;
                }
                doc
            }
            None => {
                let doc = IdentityDocument::generate();
                let bytes = serde_json::to_vec_pretty(&doc)?;
                atomic_write(&path, &bytes).await?;
                mark_excluded_from_backup(&path);
                tracing::info!(device_id = %doc.device_id, "identity.created");
                doc
            }
        };
        Ok(Self { path, doc: Mutex::new(doc) })
    }

    pub async fn material(&self) -> DeviceIdentityMaterial {
        self.doc.lock().await.material()
    }

    pub async fn client_tls_identity(&self) -> Result<Option<ClientTlsBundle>, IdentityError> {
        self.doc.lock().await.decrypt_client_tls()
    }

    pub async fn persist_client_tls_identity(
        &self,
        bytes: &[u8],
        password: &str,
        fingerprint: &str,
    ) -> Result<(), IdentityError> {
        let mut doc = self.doc.lock().await;
        let bundle = ClientTlsBundle {
            bytes_b64: crate::crypto_primitives::b64_encode(bytes),
            password: password.to_string(),
            fingerprint_sha256: fingerprint.to_lowercase(),
        };
        doc.encrypt_client_tls(&bundle)?;
        doc.legacy_client_tls_bytes_b64 = None;
        doc.legacy_client_tls_password = None;
        doc.legacy_client_tls_fingerprint_sha256 = None;
        let serialized = serde_json::to_vec_pretty(&*doc)?;
        atomic_write(&self.path, &serialized).await?;
        tracing::info!(device_id = %doc.device_id, "identity.client_tls_persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_reload_yields_same_material() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let store = IdentityStore::open(&path).await.unwrap();
        let first = store.material().await;

        let reopened = IdentityStore::open(&path).await.unwrap();
        let second = reopened.material().await;

        assert_eq!(first.device_id, second.device_id);
        assert_eq!(first.fingerprint_sha256, second.fingerprint_sha256);
        assert_eq!(first.signing_private_scalar_b64, second.signing_private_scalar_b64);
    }

    #[tokio::test]
    async fn recreating_after_delete_yields_different_material() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let store = IdentityStore::open(&path).await.unwrap();
        let first = store.material().await;
        drop(store);

        tokio::fs::remove_file(&path).await.unwrap();
        let recreated = IdentityStore::open(&path).await.unwrap();
        let second = recreated.material().await;

        assert_ne!(first.device_id, second.device_id);
        assert_ne!(first.signing_private_scalar_b64, second.signing_private_scalar_b64);
    }

    #[tokio::test]
    async fn client_tls_round_trips_and_never_stores_plaintext_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        let store = IdentityStore::open(&path).await.unwrap();

        let raw_bytes = b"pkcs12-bundle-bytes";
        store
            .persist_client_tls_identity(raw_bytes, "hunter2", "AA".repeat(32).as_str())
            .await
            .unwrap();

        let bundle = store.client_tls_identity().await.unwrap().unwrap();
        assert_eq!(
            crate::crypto_primitives::b64_decode(&bundle.bytes_b64).unwrap(),
            raw_bytes
        );
        assert_eq!(bundle.password, "hunter2");

        let on_disk = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(!on_disk.contains(&crate::crypto_primitives::b64_encode(raw_bytes)));
        assert!(!on_disk.contains("hunter2"));
    }

    #[tokio::test]
    async fn partial_legacy_triple_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");

        let mut doc = IdentityDocument::generate();
        doc.legacy_client_tls_bytes_b64 = Some("deadbeef".into());
        // password and fingerprint intentionally left unset.
        let bytes = serde_json::to_vec_pretty(&doc).unwrap();
        atomic_write(&path, &bytes).await.unwrap();

        let err = IdentityStore::open(&path).await.unwrap_err();
        assert!(matches!(err, IdentityError::LegacyMigrationIncomplete { .. }));
    }
}
