//! Controller (C10): lifecycle glue between pairing, capture, and
//! finalize. Owns [`Settings`](crate::config::Settings) and is the single
//! place the bootstrap hooks of §6 are read and interpreted.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::capture::{CapturePipeline, FrameSource};
use crate::config::Settings;
use crate::error::{PairingError, ScanError, ScanResult};
use crate::identity::IdentityStore;
use crate::ids::new_sortable_id;
use crate::pairing::{confirm_pairing, validate_qr_payload};
use crate::recorder::{run_recorder_actor, RecorderRequest, SessionRecorder};
use crate::sequencer::SampleSequencer;
use crate::transport::{ClientTlsIdentity, TransportClient};
use crate::trust::{TrustRecord, TrustStatus, TrustStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Paired,
    Capturing,
    Finalized,
}

impl ControllerState {
    fn as_str(self) -> &'static str {
        match self {
            ControllerState::Idle => "Idle",
            ControllerState::Paired => "Paired",
            ControllerState::Capturing => "Capturing",
            ControllerState::Finalized => "Finalized",
        }
    }
}

/// A TCP endpoint resolved from QR import or LAN discovery, ready to hand
/// to the framed transport client for a secure connect attempt.
#[derive(Debug, Clone)]
pub struct ResolvedEndpoint {
    pub addr: SocketAddr,
    pub server_name_hint: String,
    pub pinned_fingerprint_sha256: String,
}

struct ActiveSession {
    session_id: String,
    recorder_tx: mpsc::Sender<RecorderRequest>,
    pipeline: Arc<CapturePipeline>,
    pipeline_task: JoinHandle<()>,
    transport: Option<Arc<TransportClient>>,
}

/// Lifecycle state machine: `Idle -> Paired -> Capturing -> Finalized ->
/// Idle`. Every transition is logged under the `controller.lifecycle`
/// span with `state`, `session_id`, and `peer_device_id` fields.
pub struct Controller {
    settings: Settings,
    identity: Arc<IdentityStore>,
    trust: Arc<TrustStore>,
    correlation_id: String,
    state: Mutex<ControllerState>,
    peer_device_id: Mutex<Option<String>>,
    active: Mutex<Option<ActiveSession>>,
    last_status: Mutex<String>,
}

impl Controller {
    /// Opens the identity and trust stores named by `settings`. Per §7,
    /// a load failure here is fatal at startup and propagates directly.
    pub async fn new(settings: Settings) -> ScanResult<Self> {
        let identity = Arc::new(IdentityStore::open(&settings.identity_path).await?);
        let trust = Arc::new(TrustStore::open(&settings.trust_store_path).await?);
        let correlation_id = new_sortable_id();

        tracing::info!(correlation_id = %correlation_id, "controller.started");

        Ok(Self {
            settings,
            identity,
            trust,
            correlation_id,
            state: Mutex::new(ControllerState::Idle),
            peer_device_id: Mutex::new(None),
            active: Mutex::new(None),
            last_status: Mutex::new("idle".to_string()),
        })
    }

    pub fn identity(&self) -> &IdentityStore {
        &self.identity
    }

    pub fn trust(&self) -> &TrustStore {
        &self.trust
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// A human-readable summary of the latest transition or error (§7).
    pub async fn status(&self) -> String {
        self.last_status.lock().await.clone()
    }

    pub async fn state(&self) -> ControllerState {
        *self.state.lock().await
    }

    async fn set_status(&self, state: ControllerState, message: impl Into<String>) {
        *self.state.lock().await = state;
        let message = message.into();
        let peer = self.peer_device_id.lock().await.clone();
        tracing::info!(
            correlation_id = %self.correlation_id,
            state = state.as_str(),
            peer_device_id = peer.as_deref().unwrap_or(""),
            "controller.lifecycle"
        );
        *self.last_status.lock().await = message;
    }

    async fn require_state(&self, expected: ControllerState) -> ScanResult<()> {
        let actual = *self.state.lock().await;
        if actual != expected {
            return Err(ScanError::InvalidState { expected: expected.as_str(), actual: actual.as_str() });
        }
        Ok(())
    }

    /// `Idle -> Paired`: validates the QR payload, drives the confirm
    /// exchange, and installs the returned trust record plus (optionally)
    /// client-TLS material.
    pub async fn pair(&self, qr_payload_bytes: &[u8], scan_display_name: &str) -> ScanResult<()> {
        self.require_state(ControllerState::Idle).await?;

        let payload = validate_qr_payload(qr_payload_bytes)?;
        let material = self.identity.material().await;

        let outcome = confirm_pairing(&payload, &material.device_id, scan_display_name, &material.fingerprint_sha256).await?;

        self.trust.upsert(outcome.trust_record.clone()).await?;
        if let Some(mtls) = outcome.client_mtls {
            let bytes = crate::crypto_primitives::b64_decode(&mtls.bundle_b64)
                .map_err(|_| ScanError::Pairing(PairingError::MalformedMtlsBundle))?;
            self.identity.persist_client_tls_identity(&bytes, &mtls.password, &mtls.fingerprint_sha256).await?;
        }

        *self.peer_device_id.lock().await = Some(outcome.trust_record.peer_device_id.clone());
        self.set_status(ControllerState::Paired, format!("paired with {}", outcome.trust_record.peer_device_id)).await;
        Ok(())
    }

    /// `Paired -> Capturing`: requires a matching trust record; attempts
    /// a transport connect if `endpoint` is given and a client-TLS bundle
    /// exists, otherwise (or on connect failure) falls back to
    /// local-only recording.
    pub async fn start_capture(
        &self,
        endpoint: Option<ResolvedEndpoint>,
        frame_source: impl FrameSource + Send + 'static,
    ) -> ScanResult<String> {
        self.require_state(ControllerState::Paired).await?;

        let peer_device_id = self
            .peer_device_id
            .lock()
            .await
            .clone()
            .ok_or_else(|| ScanError::InvalidState { expected: "Paired", actual: "Idle" })?;
        let trust_record = self
            .trust
            .trusted_peer(&peer_device_id)
            .await
            .ok_or_else(|| ScanError::PeerNotTrusted(peer_device_id.clone()))?;

        let session_id = self.settings.bootstrap.session_id_override.clone().unwrap_or_else(new_sortable_id);

        let recorder = SessionRecorder::create(&self.settings.session_root, &session_id).await?;
        let (recorder_tx, recorder_rx) = mpsc::channel(256);
        tokio::spawn(run_recorder_actor(recorder, recorder_rx));

        let material = self.identity.material().await;
        let sequencer = Arc::new(SampleSequencer::new());
        let pipeline = Arc::new(CapturePipeline::new(session_id.clone(), material.device_id.clone(), sequencer, recorder_tx.clone()));

        let transport = self.connect_transport(endpoint, &session_id, &trust_record, &material, Arc::clone(&pipeline)).await;
        if let Some(transport) = &transport {
            pipeline.attach_transport(Arc::clone(transport)).await;
        }

        let pipeline_for_task = Arc::clone(&pipeline);
        let pipeline_task = tokio::spawn(async move {
            pipeline_for_task.run(frame_source).await;
        });

        *self.active.lock().await = Some(ActiveSession { session_id: session_id.clone(), recorder_tx, pipeline, pipeline_task, transport });

        self.set_status(ControllerState::Capturing, format!("capturing session {session_id}")).await;
        Ok(session_id)
    }

    async fn connect_transport(
        &self,
        endpoint: Option<ResolvedEndpoint>,
        session_id: &str,
        trust_record: &TrustRecord,
        material: &crate::identity::DeviceIdentityMaterial,
        pipeline: Arc<CapturePipeline>,
    ) -> Option<Arc<TransportClient>> {
        let endpoint = endpoint?;
        if trust_record.status != TrustStatus::Trusted {
            tracing::warn!(peer_device_id = %trust_record.peer_device_id, "controller.capture.peer_not_trusted");
            return None;
        }

        // A client mutual-TLS bundle (§4.1) is opaque PKCS#12-style bytes;
        // turning it into the `CertificateDer`/`PrivateKeyDer` pair the TLS
        // stack wants is a platform-specific concern this crate doesn't
        // own. Connecting without one is still a valid outcome: the
        // desktop peer's handshake policy decides whether client auth is
        // mandatory.
        let client_identity: Option<ClientTlsIdentity> = None;
        if self.identity.client_tls_identity().await.ok().flatten().is_none() {
            tracing::debug!("controller.capture.no_client_tls_identity");
        }

        let signing_key = match material.signing_key() {
            Ok(k) => k,
            Err(e) => {
                tracing::warn!(error = %e, "controller.capture.signing_key_unavailable");
                return None;
            }
        };
        let signing_scalar: [u8; 32] = signing_key.to_bytes().into();
        let signing_public = match crate::crypto_primitives::b64_decode(&material.signing_public_x963_b64) {
            Ok(b) => b,
            Err(_) => return None,
        };

        let backpressure_handler: Arc<dyn Fn(f64, u32, u64, bool) + Send + Sync> = Arc::new(move |fps, stride, mesh_ms, drop_non_keyframes| {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move {
                pipeline.apply_backpressure_hint(fps, stride, mesh_ms, drop_non_keyframes).await;
            });
        });

        match TransportClient::connect(
            endpoint.addr,
            &endpoint.server_name_hint,
            &endpoint.pinned_fingerprint_sha256,
            client_identity,
            session_id,
            &material.device_id,
            &material.fingerprint_sha256,
            &signing_scalar,
            &signing_public,
            backpressure_handler,
        )
        .await
        {
            Ok((client, _state_rx)) => Some(Arc::new(client)),
            Err(e) => {
                tracing::warn!(error = %e, "controller.capture.transport_connect_failed_falling_back_local_only");
                None
            }
        }
    }

    /// `Capturing -> Finalized`: always attempts recorder finalize, always
    /// disconnects transport, even if one of the two fails.
    pub async fn stop_capture(&self) -> ScanResult<PathBuf> {
        self.require_state(ControllerState::Capturing).await?;

        let active = self.active.lock().await.take().ok_or_else(|| ScanError::InvalidState {
            expected: "Capturing",
            actual: "Idle",
        })?;

        active.pipeline_task.abort();
        let _ = active.pipeline_task.await;
        let (frame_counter, samples_dropped) = active.pipeline.stop().await;

        if let Some(transport) = &active.transport {
            transport.disconnect().await;
        }

        let material = self.identity.material().await;
        let mut extra_metadata = std::collections::BTreeMap::new();
        extra_metadata.insert("source_device_id".to_string(), material.device_id.clone());
        extra_metadata.insert("samples_total".to_string(), frame_counter.to_string());
        extra_metadata.insert("samples_dropped".to_string(), samples_dropped.to_string());

        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        active
            .recorder_tx
            .send(RecorderRequest::Finalize { extra_metadata, reply: reply_tx })
            .await
            .map_err(|_| ScanError::Config("recorder actor unavailable at finalize".to_string()))?;
        let session_dir = reply_rx
            .await
            .map_err(|_| ScanError::Config("recorder actor dropped reply channel".to_string()))??;

        if self.settings.bootstrap.auto_export {
            let (export_reply_tx, export_reply_rx) = tokio::sync::oneshot::channel();
            active
                .recorder_tx
                .send(RecorderRequest::Export { destination_root: self.settings.session_root.clone(), reply: export_reply_tx })
                .await
                .map_err(|_| ScanError::Config("recorder actor unavailable at export".to_string()))?;
            match export_reply_rx.await {
                Ok(Ok(export_dir)) => {
                    tracing::info!(export_dir = %export_dir.display(), "controller.capture.auto_exported");
                }
                Ok(Err(e)) => tracing::warn!(error = %e, "controller.capture.auto_export_failed"),
                Err(_) => tracing::warn!("controller.capture.auto_export_reply_dropped"),
            }
        }

        self.set_status(ControllerState::Finalized, format!("finalized session {}", active.session_id)).await;
        self.set_status(ControllerState::Idle, "idle, ready to pair or recapture").await;

        Ok(session_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BootstrapHooks;

    async fn test_settings(dir: &std::path::Path) -> Settings {
        Settings {
            session_root: dir.join("sessions"),
            identity_path: dir.join("identity.json"),
            trust_store_path: dir.join("trust.json"),
            log_filter: "info".to_string(),
            bootstrap: BootstrapHooks::default(),
        }
    }

    #[tokio::test]
    async fn starts_idle_and_reports_status() {
        let dir = tempfile::tempdir().unwrap();
        let controller = Controller::new(test_settings(dir.path()).await).await.unwrap();
        assert_eq!(controller.state().await, ControllerState::Idle);
    }

    #[tokio::test]
    async fn start_capture_from_idle_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let controller = Controller::new(test_settings(dir.path()).await).await.unwrap();

        struct NoFrames;
        #[async_trait::async_trait]
        impl FrameSource for NoFrames {
            async fn next_frame(&mut self) -> Option<crate::capture::Frame> {
                None
            }
        }

        let err = controller.start_capture(None, NoFrames).await.unwrap_err();
        assert!(matches!(err, ScanError::InvalidState { expected: "Paired", .. }));
    }

    #[tokio::test]
    async fn pair_then_capture_then_finalize_cycles_back_to_idle() {
        let dir = tempfile::tempdir().unwrap();
        let controller = Controller::new(test_settings(dir.path()).await).await.unwrap();

        let now = chrono::Utc::now();
        controller
            .trust
            .upsert(TrustRecord {
                peer_device_id: "desktop-1".to_string(),
                peer_display_name: "Office Desktop".to_string(),
                peer_cert_fingerprint_sha256: "a".repeat(64),
                created_at_utc: now,
                last_seen_at_utc: now,
                status: TrustStatus::Trusted,
                previous_cert_fingerprints_sha256: None,
            })
            .await
            .unwrap();
        *controller.peer_device_id.lock().await = Some("desktop-1".to_string());
        *controller.state.lock().await = ControllerState::Paired;

        struct OneFrame(bool);
        #[async_trait::async_trait]
        impl FrameSource for OneFrame {
            async fn next_frame(&mut self) -> Option<crate::capture::Frame> {
                if self.0 {
                    None
                } else {
                    self.0 = true;
                    Some(crate::capture::Frame {
                        timestamp_ns: 0,
                        camera_pose: [0.0; 16],
                        intrinsics: crate::capture::Intrinsics { matrix: [0.0; 9], width: 640, height: 480 },
                        image_jpeg: None,
                        depth_map: None,
                        mesh_anchors: None,
                    })
                }
            }
        }

        let session_id = controller.start_capture(None, OneFrame(false)).await.unwrap();
        assert_eq!(controller.state().await, ControllerState::Capturing);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let session_dir = controller.stop_capture().await.unwrap();
        assert!(session_dir.join("session.manifest.json").exists());
        assert!(session_dir.ends_with(&session_id));
        assert_eq!(controller.state().await, ControllerState::Idle);
    }

    #[tokio::test]
    async fn auto_export_produces_roomcapture_sibling_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = test_settings(dir.path()).await;
        settings.bootstrap.auto_export = true;
        let controller = Controller::new(settings).await.unwrap();

        let now = chrono::Utc::now();
        controller
            .trust
            .upsert(TrustRecord {
                peer_device_id: "desktop-1".to_string(),
                peer_display_name: "Office Desktop".to_string(),
                peer_cert_fingerprint_sha256: "a".repeat(64),
                created_at_utc: now,
                last_seen_at_utc: now,
                status: TrustStatus::Trusted,
                previous_cert_fingerprints_sha256: None,
            })
            .await
            .unwrap();
        *controller.peer_device_id.lock().await = Some("desktop-1".to_string());
        *controller.state.lock().await = ControllerState::Paired;

        struct NoFrames;
        #[async_trait::async_trait]
        impl FrameSource for NoFrames {
            async fn next_frame(&mut self) -> Option<crate::capture::Frame> {
                None
            }
        }

        let session_id = controller.start_capture(None, NoFrames).await.unwrap();
        let session_dir = controller.stop_capture().await.unwrap();

        let exported = session_dir.parent().unwrap().join(format!("{session_id}.roomcapture"));
        assert!(exported.join("session.manifest.json").exists());
    }
}
