//! Trust store (C3): an encrypted-at-rest map from peer device id to
//! trust record, with transparent migration of legacy plaintext files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::crypto_primitives::{b64_decode, b64_encode, open_with_embedded_nonce, seal_with_random_nonce};
use crate::error::TrustStoreError;
use crate::fsutil::{atomic_write, mark_excluded_from_backup, read_if_exists};

const TRUST_DOCUMENT_FORMAT: &str = "provinode.scan.trust.v1";
const TRUST_AEAD_INFO: &[u8] = b"scan-device-trust-store-v1";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TrustStatus {
    Trusted,
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustRecord {
    pub peer_device_id: String,
    pub peer_display_name: String,
    pub peer_cert_fingerprint_sha256: String,
    pub created_at_utc: DateTime<Utc>,
    pub last_seen_at_utc: DateTime<Utc>,
    pub status: TrustStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_cert_fingerprints_sha256: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize)]
struct EncryptedTrustDocument {
    format: String,
    blob_b64: String,
}

/// Distinguishes a freshly-parsed file as either the encrypted v1 format
/// or a legacy plaintext `{device_id: record}` map, without assuming
/// which one we're looking at ahead of time.
enum LoadedDocument {
    Encrypted(EncryptedTrustDocument),
    LegacyPlaintext(BTreeMap<String, TrustRecord>),
}

fn classify(bytes: &[u8]) -> Result<LoadedDocument, TrustStoreError> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| TrustStoreError::Corrupt(e.to_string()))?;
    let has_format_tag = value
        .as_object()
        .and_then(|obj| obj.get("format"))
        .and_then(|f| f.as_str())
        .map(|f| f == TRUST_DOCUMENT_FORMAT)
        .unwrap_or(false);
    if has_format_tag {
        let doc: EncryptedTrustDocument =
            serde_json::from_value(value).map_err(|e| TrustStoreError::Corrupt(e.to_string()))?;
        Ok(LoadedDocument::Encrypted(doc))
    } else {
        let map: BTreeMap<String, TrustRecord> =
            serde_json::from_value(value).map_err(|e| TrustStoreError::Corrupt(e.to_string()))?;
        Ok(LoadedDocument::LegacyPlaintext(map))
    }
}

async fn load_or_create_key(key_path: &Path) -> Result<[u8; 32], TrustStoreError> {
    if let Some(bytes) = read_if_exists(key_path).await? {
        let decoded = b64_decode(std::str::from_utf8(&bytes).map_err(|e| TrustStoreError::Corrupt(e.to_string()))?)
            .map_err(|e| TrustStoreError::Corrupt(e.to_string()))?;
        if decoded.len() != 32 {
            return Err(TrustStoreError::Corrupt("trust store key file is not 32 bytes".into()));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&decoded);
        Ok(key)
    } else {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        atomic_write(key_path, b64_encode(&key).as_bytes()).await?;
        mark_excluded_from_backup(key_path);
        Ok(key)
    }
}

fn key_path_for(trust_path: &Path) -> PathBuf {
    let mut name = trust_path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".key");
    trust_path.with_file_name(name)
}

pub struct TrustStore {
    path: PathBuf,
    key: [u8; 32],
    records: Mutex<BTreeMap<String, TrustRecord>>,
}

impl TrustStore {
    /// Fatal on startup if the existing file is neither the encrypted v1
    /// format nor a legacy plaintext map ([`TrustStoreError::Corrupt`]).
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, TrustStoreError> {
        let path = path.as_ref().to_path_buf();
        let key_path = key_path_for(&path);
        let key = load_or_create_key(&key_path).await?;

        let records = match read_if_exists(&path).await? {
            None => BTreeMap::new(),
            Some(bytes) => match classify(&bytes)? {
                LoadedDocument::LegacyPlaintext(map) => {
                    tracing::info!(count = map.len(), "trust_store.legacy_plaintext_loaded");
                    map
                }
                LoadedDocument::Encrypted(doc) => {
                    let sealed = b64_decode(&doc.blob_b64).map_err(|e| TrustStoreError::Corrupt(e.to_string()))?;
                    let plaintext = open_with_embedded_nonce(&key, &sealed, TRUST_AEAD_INFO)
                        .map_err(|_| TrustStoreError::Corrupt("trust store decryption failed".into()))?;
                    serde_json::from_slice(&plaintext)?
                }
            },
        };

        let store = Self { path, key, records: Mutex::new(records) };
        store.persist_locked(&*store.records.lock().await).await?;
        Ok(store)
    }

    async fn persist_locked(&self, records: &BTreeMap<String, TrustRecord>) -> Result<(), TrustStoreError> {
        let plaintext = serde_json::to_vec(records)?;
        let sealed = seal_with_random_nonce(&self.key, &plaintext, TRUST_AEAD_INFO)
            .map_err(|_| TrustStoreError::Corrupt("trust store encryption failed".into()))?;
        let doc = EncryptedTrustDocument {
            format: TRUST_DOCUMENT_FORMAT.to_string(),
            blob_b64: b64_encode(&sealed),
        };
        let bytes = serde_json::to_vec_pretty(&doc)?;
        atomic_write(&self.path, &bytes).await?;
        Ok(())
    }

    pub async fn upsert(&self, record: TrustRecord) -> Result<(), TrustStoreError> {
        let mut records = self.records.lock().await;
        tracing::info!(peer_device_id = %record.peer_device_id, status = ?record.status, "trust_store.upsert");
        records.insert(record.peer_device_id.clone(), record);
        self.persist_locked(&records).await
    }

    pub async fn trusted_peer(&self, device_id: &str) -> Option<TrustRecord> {
        let records = self.records.lock().await;
        records
            .get(device_id)
            .filter(|r| r.status == TrustStatus::Trusted)
            .cloned()
    }

    pub async fn all(&self) -> Vec<TrustRecord> {
        let records = self.records.lock().await;
        records.values().cloned().collect()
    }

    pub async fn revoke(&self, device_id: &str) -> Result<bool, TrustStoreError> {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(device_id) else { return Ok(false) };
        record.status = TrustStatus::Revoked;
        tracing::warn!(peer_device_id = %device_id, "trust_store.revoked");
        self.persist_locked(&records).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(device_id: &str) -> TrustRecord {
        let now = Utc::now();
        TrustRecord {
            peer_device_id: device_id.to_string(),
            peer_display_name: "Desktop".to_string(),
            peer_cert_fingerprint_sha256: "a".repeat(64),
            created_at_utc: now,
            last_seen_at_utc: now,
            status: TrustStatus::Trusted,
            previous_cert_fingerprints_sha256: None,
        }
    }

    #[tokio::test]
    async fn encrypted_file_has_format_tag_and_no_plaintext_identifiers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trust.json");
        let store = TrustStore::open(&path).await.unwrap();
        store.upsert(sample_record("desktop-1")).await.unwrap();

        let on_disk = tokio::fs::read_to_string(&path).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&on_disk).unwrap();
        assert_eq!(value["format"], TRUST_DOCUMENT_FORMAT);
        assert!(!on_disk.contains("desktop-1"));
        assert!(!on_disk.contains("Desktop"));
    }

    #[tokio::test]
    async fn legacy_plaintext_is_loaded_and_upgraded_on_next_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trust.json");

        let mut legacy = BTreeMap::new();
        legacy.insert("desktop-1".to_string(), sample_record("desktop-1"));
        tokio::fs::write(&path, serde_json::to_vec(&legacy).unwrap()).await.unwrap();

        let store = TrustStore::open(&path).await.unwrap();
        let record = store.trusted_peer("desktop-1").await.unwrap();
        assert_eq!(record.peer_device_id, "desktop-1");

        let on_disk = tokio::fs::read_to_string(&path).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&on_disk).unwrap();
        assert_eq!(value["format"], TRUST_DOCUMENT_FORMAT);
    }

    #[tokio::test]
    async fn revoke_transitions_status_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trust.json");
        let store = TrustStore::open(&path).await.unwrap();
        store.upsert(sample_record("desktop-1")).await.unwrap();

        assert!(store.revoke("desktop-1").await.unwrap());
        assert!(store.trusted_peer("desktop-1").await.is_none());

        let all = store.all().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, TrustStatus::Revoked);
    }

    #[tokio::test]
    async fn all_is_sorted_by_device_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trust.json");
        let store = TrustStore::open(&path).await.unwrap();
        store.upsert(sample_record("zzz")).await.unwrap();
        store.upsert(sample_record("aaa")).await.unwrap();

        let all = store.all().await;
        assert_eq!(all[0].peer_device_id, "aaa");
        assert_eq!(all[1].peer_device_id, "zzz");
    }
}
