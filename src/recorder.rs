//! Session recorder (C7): a content-addressed, append-only session
//! package with a manifest and an integrity digest over blobs and the
//! sample log.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::RecorderError;
use crate::fsutil::atomic_write;
use crate::ids::sha256_hex;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum SampleKind {
    KeyframeRgb,
    DepthFrame,
    MeshAnchorBatch,
    CameraPose,
    Intrinsics,
    Heartbeat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleEnvelope {
    pub session_id: String,
    pub sample_seq: i64,
    pub capture_time_ns: i64,
    pub clock_id: String,
    pub sample_kind: SampleKind,
    pub hash_sha256: String,
    pub payload_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

#[derive(Serialize)]
struct LogLine<'a> {
    sample_seq: i64,
    sample_kind: SampleKind,
    capture_time_ns: i64,
    hash_sha256: &'a str,
    blob_path: String,
    byte_size: usize,
}

#[derive(Serialize)]
struct Manifest {
    session_id: String,
    schema_version: &'static str,
    sample_count: u64,
    blob_count: u64,
    capture_started_at_utc: DateTime<Utc>,
    end_at_utc: DateTime<Utc>,
    producer_version: String,
    metadata: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct Integrity {
    manifest_sha256: String,
    samples_log_sha256: String,
    blob_hashes: BTreeMap<String, String>,
    provenance_digest: String,
}

const SCHEMA_VERSION: &str = "provinode.scan.session.v1";

fn blob_rel_path(hash_hex: &str) -> String {
    format!("blobs/sha256/{hash_hex}")
}

/// Single-writer session recorder. One instance owns exactly one session
/// directory for its lifetime.
pub struct SessionRecorder {
    session_dir: PathBuf,
    session_id: String,
    capture_started_at_utc: DateTime<Utc>,
    sample_count: u64,
    end_at_utc: DateTime<Utc>,
    blob_hashes: BTreeMap<String, String>,
    drop_count: u64,
}

impl SessionRecorder {
    /// Initializes the on-disk layout (`blobs/sha256/`, empty `samples.log`)
    /// under `session_root/session_id`.
    pub async fn create(session_root: impl AsRef<Path>, session_id: &str) -> Result<Self, RecorderError> {
        let session_dir = session_root.as_ref().join(session_id);
        tokio::fs::create_dir_all(session_dir.join("blobs").join("sha256")).await?;
        let log_path = session_dir.join("samples.log");
        if tokio::fs::metadata(&log_path).await.is_err() {
            atomic_write(&log_path, b"").await?;
        }

        let now = Utc::now();
        Ok(Self {
            session_dir,
            session_id: session_id.to_string(),
            capture_started_at_utc: now,
            sample_count: 0,
            end_at_utc: now,
            blob_hashes: BTreeMap::new(),
            drop_count: 0,
        })
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn drop_count(&self) -> u64 {
        self.drop_count
    }

    /// Hashes `payload`, writes the blob if new, and appends a log line.
    /// A hash mismatch against `envelope.hash_sha256` is the only fatal
    /// failure here; everything else about a bad sample is the caller's
    /// problem to retry or drop.
    pub async fn record(&mut self, envelope: &SampleEnvelope, payload: &[u8]) -> Result<(), RecorderError> {
        let computed = sha256_hex(payload);
        if computed != envelope.hash_sha256 {
            self.drop_count += 1;
            tracing::warn!(sample_seq = envelope.sample_seq, sample_kind = ?envelope.sample_kind, "recorder.record.hash_mismatch");
            return Err(RecorderError::PayloadHashMismatch { expected: envelope.hash_sha256.clone(), computed });
        }

        let rel_path = blob_rel_path(&computed);
        let blob_path = self.session_dir.join(&rel_path);
        if tokio::fs::metadata(&blob_path).await.is_err() {
            atomic_write(&blob_path, payload).await?;
        }

        let line = LogLine {
            sample_seq: envelope.sample_seq,
            sample_kind: envelope.sample_kind,
            capture_time_ns: envelope.capture_time_ns,
            hash_sha256: &computed,
            blob_path: rel_path.clone(),
            byte_size: payload.len(),
        };
        // serde_json's `Map` is BTreeMap-backed without the `preserve_order`
        // feature, so `to_vec` already emits sorted keys.
        let mut encoded = serde_json::to_vec(&line)?;
        encoded.push(b'\n');

        let log_path = self.session_dir.join("samples.log");
        let mut existing = tokio::fs::read(&log_path).await.unwrap_or_default();
        existing.extend_from_slice(&encoded);
        atomic_write(&log_path, &existing).await?;

        self.sample_count += 1;
        self.end_at_utc = Utc::now();
        self.blob_hashes.insert(rel_path, computed);
        Ok(())
    }

    /// Writes `session.manifest.json` and `integrity.json`, returning the
    /// session directory. Caller-supplied keys in `extra_metadata` win over
    /// the minimum set this function merges in.
    pub async fn finalize(&self, extra_metadata: BTreeMap<String, String>) -> Result<PathBuf, RecorderError> {
        let mut metadata = BTreeMap::new();
        metadata.insert("room.session_id".to_string(), self.session_id.clone());
        metadata.insert("schema_version".to_string(), SCHEMA_VERSION.to_string());
        metadata.insert("source_device_id".to_string(), String::new());
        metadata.insert("capture_started_at_utc".to_string(), self.capture_started_at_utc.to_rfc3339());
        for (k, v) in extra_metadata {
            metadata.insert(k, v);
        }

        let manifest = Manifest {
            session_id: self.session_id.clone(),
            schema_version: SCHEMA_VERSION,
            sample_count: self.sample_count,
            blob_count: self.blob_hashes.len() as u64,
            capture_started_at_utc: self.capture_started_at_utc,
            end_at_utc: self.end_at_utc,
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
            metadata,
        };

        let manifest_path = self.session_dir.join("session.manifest.json");
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;
        atomic_write(&manifest_path, &manifest_bytes).await.map_err(|e| {
            tracing::error!(session_dir = %self.session_dir.display(), error = %e, "recorder.finalize.manifest_write_failed");
            RecorderError::Io(e)
        })?;

        let log_bytes = tokio::fs::read(self.session_dir.join("samples.log")).await?;
        let provenance_digest = sha256_hex(format!("{}:{}:{}", self.session_id, self.sample_count, self.blob_hashes.len()).as_bytes());
        let integrity = Integrity {
            manifest_sha256: sha256_hex(&manifest_bytes),
            samples_log_sha256: sha256_hex(&log_bytes),
            blob_hashes: self.blob_hashes.clone(),
            provenance_digest,
        };
        let integrity_path = self.session_dir.join("integrity.json");
        atomic_write(&integrity_path, &serde_json::to_vec_pretty(&integrity)?).await?;

        Ok(self.session_dir.clone())
    }

    /// Copies the session directory to a sibling `<session_id>.roomcapture`,
    /// overwriting any existing copy atomically (remove-then-copy).
    pub async fn export(&self, destination_root: impl AsRef<Path>) -> Result<PathBuf, RecorderError> {
        let dest = destination_root.as_ref().join(format!("{}.roomcapture", self.session_id));
        if tokio::fs::metadata(&dest).await.is_ok() {
            tokio::fs::remove_dir_all(&dest).await?;
        }
        copy_dir_recursive(&self.session_dir, &dest).await?;
        Ok(dest)
    }
}

fn copy_dir_recursive<'a>(
    src: &'a Path,
    dst: &'a Path,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = std::io::Result<()>> + Send + 'a>> {
    Box::pin(async move {
        tokio::fs::create_dir_all(dst).await?;
        let mut entries = tokio::fs::read_dir(src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let dst_path = dst.join(entry.file_name());
            if file_type.is_dir() {
                copy_dir_recursive(&entry.path(), &dst_path).await?;
            } else {
                tokio::fs::copy(entry.path(), &dst_path).await?;
            }
        }
        Ok(())
    })
}

/// A per-session actor request, mirroring the single-owner-plus-channel
/// shape used elsewhere in this crate for serialized disk access.
pub enum RecorderRequest {
    Record { envelope: SampleEnvelope, payload: Vec<u8>, reply: tokio::sync::oneshot::Sender<Result<(), RecorderError>> },
    Finalize { extra_metadata: BTreeMap<String, String>, reply: tokio::sync::oneshot::Sender<Result<PathBuf, RecorderError>> },
    Export { destination_root: PathBuf, reply: tokio::sync::oneshot::Sender<Result<PathBuf, RecorderError>> },
}

/// Runs a [`SessionRecorder`] behind an `mpsc` channel so every mutation
/// is serialized through one task, matching the single-writer discipline
/// used by the identity and trust stores.
pub async fn run_recorder_actor(mut recorder: SessionRecorder, mut requests: mpsc::Receiver<RecorderRequest>) {
    while let Some(request) = requests.recv().await {
        match request {
            RecorderRequest::Record { envelope, payload, reply } => {
                let result = recorder.record(&envelope, &payload).await;
                let _ = reply.send(result);
            }
            RecorderRequest::Finalize { extra_metadata, reply } => {
                let result = recorder.finalize(extra_metadata).await;
                let _ = reply.send(result);
            }
            RecorderRequest::Export { destination_root, reply } => {
                let result = recorder.export(destination_root).await;
                let _ = reply.send(result);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_envelope(seq: i64, hash: &str) -> SampleEnvelope {
        SampleEnvelope {
            session_id: "session-1".to_string(),
            sample_seq: seq,
            capture_time_ns: 123,
            clock_id: "monotonic".to_string(),
            sample_kind: SampleKind::Heartbeat,
            hash_sha256: hash.to_string(),
            payload_ref: format!("blobs/sha256/{hash}"),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn record_then_finalize_produces_expected_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = SessionRecorder::create(dir.path(), "session-1").await.unwrap();

        let payload = b"payload";
        let hash = sha256_hex(payload);
        recorder.record(&sample_envelope(0, &hash), payload).await.unwrap();
        let session_dir = recorder.finalize(BTreeMap::new()).await.unwrap();

        assert!(session_dir.join("session.manifest.json").exists());
        assert!(session_dir.join("samples.log").exists());
        assert!(session_dir.join("integrity.json").exists());
        assert!(session_dir.join("blobs").join("sha256").join(&hash).exists());

        let manifest: serde_json::Value =
            serde_json::from_slice(&tokio::fs::read(session_dir.join("session.manifest.json")).await.unwrap()).unwrap();
        assert_eq!(manifest["sample_count"], 1);

        let integrity: serde_json::Value =
            serde_json::from_slice(&tokio::fs::read(session_dir.join("integrity.json")).await.unwrap()).unwrap();
        assert_eq!(integrity["blob_hashes"].as_object().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn hash_mismatch_is_rejected_and_counted_as_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = SessionRecorder::create(dir.path(), "session-1").await.unwrap();
        let err = recorder.record(&sample_envelope(0, &"a".repeat(64)), b"payload").await.unwrap_err();
        assert!(matches!(err, RecorderError::PayloadHashMismatch { .. }));
        assert_eq!(recorder.drop_count(), 1);
    }

    #[tokio::test]
    async fn export_copies_session_to_sibling_roomcapture_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = SessionRecorder::create(dir.path(), "session-1").await.unwrap();
        let payload = b"payload";
        let hash = sha256_hex(payload);
        recorder.record(&sample_envelope(0, &hash), payload).await.unwrap();
        recorder.finalize(BTreeMap::new()).await.unwrap();

        let exported = recorder.export(dir.path()).await.unwrap();
        assert_eq!(exported.file_name().unwrap().to_str().unwrap(), "session-1.roomcapture");
        assert!(exported.join("samples.log").exists());
    }

    #[tokio::test]
    async fn sample_seq_is_strictly_increasing_and_hashes_are_verifiable() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = SessionRecorder::create(dir.path(), "session-1").await.unwrap();
        for seq in 0..3i64 {
            let payload = format!("payload-{seq}");
            let hash = sha256_hex(payload.as_bytes());
            recorder.record(&sample_envelope(seq, &hash), payload.as_bytes()).await.unwrap();
        }
        let session_dir = recorder.finalize(BTreeMap::new()).await.unwrap();
        let log = tokio::fs::read_to_string(session_dir.join("samples.log")).await.unwrap();
        let seqs: Vec<i64> = log
            .lines()
            .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap()["sample_seq"].as_i64().unwrap())
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }
}
