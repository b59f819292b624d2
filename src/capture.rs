//! Capture pipeline (C9): drives sample production from an external frame
//! provider, applies backpressure, and fans out to the recorder and (when
//! attached) the transport.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::ids::sha256_hex;
use crate::recorder::{RecorderRequest, SampleEnvelope, SampleKind};
use crate::transport::TransportClient;

/// A 3x3 intrinsics matrix (row-major) plus the resolution it was
/// computed for.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Intrinsics {
    pub matrix: [f64; 9],
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct MeshAnchor {
    pub identifier: String,
    pub transform: [f64; 16],
    pub vertices: Vec<f64>,
    pub face_indices: Vec<u32>,
}

/// One tick of sensor data from the external frame provider. Fields are
/// optional because not every frame carries every modality.
#[derive(Debug, Clone)]
pub struct Frame {
    pub timestamp_ns: i64,
    pub camera_pose: [f64; 16],
    pub intrinsics: Intrinsics,
    pub image_jpeg: Option<Vec<u8>>,
    pub depth_map: Option<Vec<u8>>,
    pub mesh_anchors: Option<Vec<MeshAnchor>>,
}

/// External collaborator: the camera/depth/mesh acquisition stack. This
/// crate only drives the trait; it never implements acquisition.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Option<Frame>;
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineParams {
    pub keyframe_interval_sec: f64,
    pub depth_stride: u64,
    pub mesh_interval_sec: f64,
    pub drop_non_keyframes: bool,
}

impl Default for PipelineParams {
    fn default() -> Self {
        Self { keyframe_interval_sec: 1.0, depth_stride: 1, mesh_interval_sec: 1.0, drop_non_keyframes: false }
    }
}

impl PipelineParams {
    pub fn apply_backpressure_hint(&mut self, target_keyframe_fps: f64, depth_stride_hint: u32, mesh_update_interval_ms: u64, drop_non_keyframes: bool) {
        self.keyframe_interval_sec = if target_keyframe_fps > 0.0 { (1.0 / target_keyframe_fps).max(0.1) } else { 1.0 };
        self.depth_stride = depth_stride_hint.max(1) as u64;
        self.mesh_interval_sec = (mesh_update_interval_ms as f64 / 1000.0).max(0.1);
        self.drop_non_keyframes = drop_non_keyframes;
    }
}

struct PipelineState {
    frame_counter: u64,
    last_keyframe_ts_ns: i64,
    last_mesh_ts_ns: i64,
    samples_dropped: u64,
}

impl PipelineState {
    fn new() -> Self {
        Self { frame_counter: 0, last_keyframe_ts_ns: i64::MIN, last_mesh_ts_ns: i64::MIN, samples_dropped: 0 }
    }
}

/// Orchestrates one session's worth of sample production.
pub struct CapturePipeline {
    session_id: String,
    source_device_id: String,
    sequencer: Arc<crate::sequencer::SampleSequencer>,
    recorder_tx: mpsc::Sender<RecorderRequest>,
    transport: Mutex<Option<Arc<TransportClient>>>,
    params: Mutex<PipelineParams>,
    state: Mutex<PipelineState>,
}

impl CapturePipeline {
    pub fn new(
        session_id: impl Into<String>,
        source_device_id: impl Into<String>,
        sequencer: Arc<crate::sequencer::SampleSequencer>,
        recorder_tx: mpsc::Sender<RecorderRequest>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            source_device_id: source_device_id.into(),
            sequencer,
            recorder_tx,
            transport: Mutex::new(None),
            params: Mutex::new(PipelineParams::default()),
            state: Mutex::new(PipelineState::new()),
        }
    }

    pub async fn attach_transport(&self, transport: Arc<TransportClient>) {
        *self.transport.lock().await = Some(transport);
    }

    pub async fn detach_transport(&self) {
        *self.transport.lock().await = None;
    }

    pub async fn apply_backpressure_hint(&self, target_keyframe_fps: f64, depth_stride_hint: u32, mesh_update_interval_ms: u64, drop_non_keyframes: bool) {
        let mut params = self.params.lock().await;
        params.apply_backpressure_hint(target_keyframe_fps, depth_stride_hint, mesh_update_interval_ms, drop_non_keyframes);
    }

    /// Drives `source` until it yields `None`, emitting samples per §4.7.
    pub async fn run(&self, mut source: impl FrameSource) {
        let span = tracing::info_span!("capture.pipeline", session_id = %self.session_id);
        let _enter = span.enter();

        while let Some(frame) = source.next_frame().await {
            self.handle_frame(frame).await;
        }
    }

    async fn handle_frame(&self, frame: Frame) {
        let params = *self.params.lock().await;
        let mut state = self.state.lock().await;
        state.frame_counter += 1;
        let frame_counter = state.frame_counter;

        self.emit_pose_and_intrinsics(&frame).await;

        let elapsed_since_keyframe = nanos_to_secs(frame.timestamp_ns.saturating_sub(state.last_keyframe_ts_ns));
        if elapsed_since_keyframe >= params.keyframe_interval_sec {
            if let Some(image) = &frame.image_jpeg {
                self.emit_keyframe(frame.timestamp_ns, image).await;
                state.last_keyframe_ts_ns = frame.timestamp_ns;
            }
        }

        if !params.drop_non_keyframes {
            if frame_counter % params.depth_stride == 0 {
                if let Some(depth) = &frame.depth_map {
                    self.emit_depth(frame.timestamp_ns, depth).await;
                }
            }

            let elapsed_since_mesh = nanos_to_secs(frame.timestamp_ns.saturating_sub(state.last_mesh_ts_ns));
            if elapsed_since_mesh >= params.mesh_interval_sec {
                if let Some(anchors) = &frame.mesh_anchors {
                    if !anchors.is_empty() {
                        self.emit_mesh(frame.timestamp_ns, anchors).await;
                        state.last_mesh_ts_ns = frame.timestamp_ns;
                    }
                }
            }
        }

        if frame_counter % 30 == 0 {
            tracing::debug!(frame_counter, samples_dropped = state.samples_dropped, "capture.pipeline.progress");
            let dropped = state.samples_dropped;
            drop(state);
            self.emit_heartbeat(frame.timestamp_ns, frame_counter, dropped, false).await;
        }
    }

    async fn emit_pose_and_intrinsics(&self, frame: &Frame) {
        self.emit(SampleKind::CameraPose, frame.timestamp_ns, &pose_bytes(&frame.camera_pose), None).await;
        self.emit(SampleKind::Intrinsics, frame.timestamp_ns, &intrinsics_bytes(&frame.intrinsics), None).await;
    }

    async fn emit_keyframe(&self, ts: i64, image: &[u8]) {
        self.emit(SampleKind::KeyframeRgb, ts, image, None).await;
    }

    async fn emit_depth(&self, ts: i64, depth: &[u8]) {
        self.emit(SampleKind::DepthFrame, ts, depth, None).await;
    }

    async fn emit_mesh(&self, ts: i64, anchors: &[MeshAnchor]) {
        let payload = serde_json::to_vec(anchors).unwrap_or_default();
        self.emit(SampleKind::MeshAnchorBatch, ts, &payload, None).await;
    }

    async fn emit_heartbeat(&self, ts: i64, frame_counter: u64, samples_dropped: u64, session_end: bool) {
        let mut metadata = BTreeMap::new();
        metadata.insert("frame_counter".to_string(), frame_counter.to_string());
        metadata.insert("samples_dropped".to_string(), samples_dropped.to_string());
        if session_end {
            metadata.insert("session_end".to_string(), "true".to_string());
        }
        // The payload carries the same counters as the metadata so the
        // heartbeat still hashes to a non-empty, content-addressed blob.
        let payload = serde_json::to_vec(&metadata).unwrap_or_default();
        self.emit(SampleKind::Heartbeat, ts, &payload, Some(metadata)).await;
    }

    /// (a) hashes the payload, (b) obtains the next sample_seq, (c) builds
    /// the envelope, (d) writes to the recorder, (e) forwards to the
    /// transport if attached. Recorder and transport failures are isolated
    /// per-sample and never abort the pipeline.
    async fn emit(&self, kind: SampleKind, capture_time_ns: i64, payload: &[u8], metadata: Option<BTreeMap<String, String>>) {
        let hash = sha256_hex(payload);
        let sample_seq = self.sequencer.next_seq().await;
        let mut metadata = metadata.unwrap_or_default();
        metadata.insert("source_device_id".to_string(), self.source_device_id.clone());
        let envelope = SampleEnvelope {
            session_id: self.session_id.clone(),
            sample_seq,
            capture_time_ns,
            clock_id: "monotonic".to_string(),
            sample_kind: kind,
            hash_sha256: hash.clone(),
            payload_ref: format!("blobs/sha256/{hash}"),
            metadata: Some(metadata),
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = RecorderRequest::Record { envelope: envelope.clone(), payload: payload.to_vec(), reply: reply_tx };
        if self.recorder_tx.send(request).await.is_err() {
            tracing::warn!(sample_seq, sample_kind = ?kind, "capture.pipeline.recorder_actor_unavailable");
            self.bump_dropped().await;
            return;
        }
        match reply_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(sample_seq, sample_kind = ?kind, error = %e, "capture.pipeline.record_failed");
                self.bump_dropped().await;
                return;
            }
            Err(_) => {
                tracing::warn!(sample_seq, sample_kind = ?kind, "capture.pipeline.recorder_actor_dropped");
                self.bump_dropped().await;
                return;
            }
        }

        let transport = self.transport.lock().await.clone();
        if let Some(transport) = transport {
            let envelope_json = match serde_json::to_vec(&envelope) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(sample_seq, error = %e, "capture.pipeline.envelope_encode_failed");
                    self.bump_dropped().await;
                    return;
                }
            };
            if let Err(e) = transport.send_sample(sample_seq, &envelope_json, payload).await {
                tracing::warn!(sample_seq, sample_kind = ?kind, error = %e, "capture.pipeline.transport_send_failed");
                self.bump_dropped().await;
            }
        }
    }

    async fn bump_dropped(&self) {
        self.state.lock().await.samples_dropped += 1;
    }

    /// Pauses production (the caller stops polling the frame source),
    /// emits a final heartbeat, and returns the summary counters for
    /// `finalize`'s metadata.
    pub async fn stop(&self) -> (u64, u64) {
        let state = self.state.lock().await;
        let frame_counter = state.frame_counter;
        let samples_dropped = state.samples_dropped;
        drop(state);
        self.emit_heartbeat(Utc::now().timestamp_nanos_opt().unwrap_or(0), frame_counter, samples_dropped, true).await;
        (frame_counter, samples_dropped)
    }
}

fn nanos_to_secs(nanos: i64) -> f64 {
    nanos as f64 / 1_000_000_000.0
}

fn pose_bytes(pose: &[f64; 16]) -> Vec<u8> {
    serde_json::to_vec(pose.as_slice()).unwrap_or_default()
}

fn intrinsics_bytes(intrinsics: &Intrinsics) -> Vec<u8> {
    serde_json::to_vec(intrinsics).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::{run_recorder_actor, SessionRecorder};
    use crate::sequencer::SampleSequencer;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedFrames {
        frames: Vec<Frame>,
        index: usize,
    }

    #[async_trait]
    impl FrameSource for FixedFrames {
        async fn next_frame(&mut self) -> Option<Frame> {
            let frame = self.frames.get(self.index).cloned();
            self.index += 1;
            frame
        }
    }

    fn test_frame(ts: i64, with_image: bool) -> Frame {
        Frame {
            timestamp_ns: ts,
            camera_pose: [0.0; 16],
            intrinsics: Intrinsics { matrix: [0.0; 9], width: 640, height: 480 },
            image_jpeg: with_image.then(|| vec![1, 2, 3]),
            depth_map: None,
            mesh_anchors: None,
        }
    }

    async fn pipeline_fixture(dir: &std::path::Path) -> (CapturePipeline, tokio::task::JoinHandle<()>) {
        let recorder = SessionRecorder::create(dir, "session-1").await.unwrap();
        let (tx, rx) = mpsc::channel(32);
        let handle = tokio::spawn(run_recorder_actor(recorder, rx));
        let pipeline = CapturePipeline::new("session-1", "scan-1", Arc::new(SampleSequencer::new()), tx);
        (pipeline, handle)
    }

    #[tokio::test]
    async fn unconditional_pose_and_intrinsics_are_emitted_every_frame() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _handle) = pipeline_fixture(dir.path()).await;
        let source = FixedFrames { frames: vec![test_frame(0, false)], index: 0 };
        pipeline.run(source).await;

        let state = pipeline.state.lock().await;
        assert_eq!(state.frame_counter, 1);
    }

    #[tokio::test]
    async fn heartbeat_emitted_every_thirty_frames() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _handle) = pipeline_fixture(dir.path()).await;
        let frames: Vec<Frame> = (0..30).map(|i| test_frame(i * 1_000_000_000, false)).collect();
        let source = FixedFrames { frames, index: 0 };
        pipeline.run(source).await;

        let state = pipeline.state.lock().await;
        assert_eq!(state.frame_counter, 30);
    }

    #[tokio::test]
    async fn backpressure_hint_adjusts_keyframe_interval() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _handle) = pipeline_fixture(dir.path()).await;
        pipeline.apply_backpressure_hint(2.0, 4, 2000, true).await;
        let params = *pipeline.params.lock().await;
        assert_eq!(params.keyframe_interval_sec, 0.5);
        assert_eq!(params.depth_stride, 4);
        assert_eq!(params.mesh_interval_sec, 2.0);
        assert!(params.drop_non_keyframes);
    }

    #[tokio::test]
    async fn stop_emits_final_heartbeat_and_returns_counters() {
        let dir = tempfile::tempdir().unwrap();
        let (pipeline, _handle) = pipeline_fixture(dir.path()).await;
        let source = FixedFrames { frames: vec![test_frame(0, false)], index: 0 };
        pipeline.run(source).await;
        let (frame_counter, samples_dropped) = pipeline.stop().await;
        assert_eq!(frame_counter, 1);
        assert_eq!(samples_dropped, 0);
    }

    #[tokio::test]
    async fn recorder_failure_does_not_abort_the_pipeline() {
        // A full replay buffer / bad payload hash never happens on the
        // emit path since hashes are computed locally, but a closed
        // recorder channel must still let the pipeline finish the frame.
        let dir = tempfile::tempdir().unwrap();
        let recorder = SessionRecorder::create(dir.path(), "session-1").await.unwrap();
        let (tx, rx) = mpsc::channel(32);
        drop(rx);
        let processed = Arc::new(AtomicUsize::new(0));
        let _ = recorder;
        let pipeline = CapturePipeline::new("session-1", "scan-1", Arc::new(SampleSequencer::new()), tx);
        let source = FixedFrames { frames: vec![test_frame(0, true)], index: 0 };
        pipeline.run(source).await;
        processed.fetch_add(1, Ordering::SeqCst);
        assert_eq!(processed.load(Ordering::SeqCst), 1);
        assert!(pipeline.state.lock().await.samples_dropped > 0);
    }
}
