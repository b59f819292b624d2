//! Framed transport client (C6): a pinned-TLS byte stream carrying the
//! secure channel handshake and counter-framed AEAD envelopes, with a
//! bounded replay buffer for reconnect resume.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_rustls::{client::TlsStream, TlsConnector};
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::secure_channel::{
    AeadEnvelope, ClientHandshake, SecureChannelAck, SecureChannelHello, SecureChannelState, CONTROL_CHANNEL,
    PROTOCOL_ID, SAMPLE_CHANNEL,
};
use crate::tls_pinning::PinnedLeafVerifier;

const OUTER_HANDSHAKE_CHANNEL: u8 = 0x01;
const OUTER_LEGACY_SAMPLE_CHANNEL: u8 = 0x02;
const OUTER_ENVELOPE_CHANNEL: u8 = 0x03;
const REPLAY_BUFFER_CAPACITY: usize = 512;
const OUR_STREAM_ID: &str = "scan-device";
const PEER_RESUME_STREAM_ID: &str = "desktop-resume";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Ready,
    Disconnected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ControlMessage {
    ResumeCheckpoint { session_id: String, last_acked_sample_seq: i64, captured_at_utc: DateTime<Utc>, stream_id: String },
    BackpressureHint { target_keyframe_fps: f64, depth_stride_hint: u32, mesh_update_interval_ms: u64, drop_non_keyframes: bool },
}

type BackpressureHandler = Arc<dyn Fn(f64, u32, u64, bool) + Send + Sync>;

async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, channel: u8, payload: &[u8]) -> Result<(), TransportError> {
    writer.write_u8(channel).await?;
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<(u8, Vec<u8>), TransportError> {
    let channel = reader.read_u8().await?;
    let len = reader.read_u32().await?;
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok((channel, payload))
}

struct ReplayBuffer {
    entries: VecDeque<(i64, Vec<u8>)>,
}

impl ReplayBuffer {
    fn new() -> Self {
        Self { entries: VecDeque::new() }
    }

    fn push(&mut self, sample_seq: i64, plaintext: Vec<u8>) {
        if self.entries.len() >= REPLAY_BUFFER_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back((sample_seq, plaintext));
    }

    fn trim_up_to(&mut self, ack: i64) {
        self.entries.retain(|(seq, _)| *seq > ack);
    }

    fn entries_after(&self, ack: i64) -> Vec<(i64, Vec<u8>)> {
        let mut out: Vec<_> = self.entries.iter().filter(|(seq, _)| *seq > ack).cloned().collect();
        out.sort_by_key(|(seq, _)| *seq);
        out
    }
}

type OwnedWriteHalf = WriteHalf<TlsStream<TcpStream>>;
type OwnedReadHalf = ReadHalf<TlsStream<TcpStream>>;

pub struct ClientTlsIdentity {
    pub cert_chain_der: Vec<CertificateDer<'static>>,
    pub private_key_der: PrivateKeyDer<'static>,
}

pub struct TransportClient {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    secure: Arc<Mutex<SecureChannelState>>,
    replay_buffer: Arc<Mutex<ReplayBuffer>>,
    state_tx: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
    recv_task: Mutex<Option<JoinHandle<()>>>,
    session_id: String,
}

impl TransportClient {
    /// Opens a pinned TLS stream, drives the secure channel handshake to
    /// completion, and spawns the receive loop. Returns a watch receiver
    /// the caller can observe for connection state transitions.
    pub async fn connect(
        addr: SocketAddr,
        server_name_hint: &str,
        pinned_fingerprint_sha256: &str,
        client_identity: Option<ClientTlsIdentity>,
        session_id: &str,
        scan_device_id: &str,
        scan_cert_fingerprint_sha256: &str,
        signing_key_raw_scalar: &[u8; 32],
        signing_public_x963: &[u8],
        backpressure_handler: BackpressureHandler,
    ) -> Result<(Self, watch::Receiver<ConnectionState>), TransportError> {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let span = tracing::info_span!("transport.connect", session_id = %session_id);
        let _enter = span.enter();

        let tcp = TcpStream::connect(addr).await?;

        let verifier = PinnedLeafVerifier::new(pinned_fingerprint_sha256);
        let builder = rustls::ClientConfig::builder().dangerous().with_custom_certificate_verifier(verifier);
        let tls_config = match client_identity {
            Some(identity) => builder
                .with_client_auth_cert(identity.cert_chain_der, identity.private_key_der)
                .map_err(|e| TransportError::Tls(e.to_string()))?,
            None => builder.with_no_client_auth(),
        };

        let connector = TlsConnector::from(Arc::new(tls_config));
        let server_name = ServerName::try_from(server_name_hint.to_string())
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        let stream = connector.connect(server_name, tcp).await?;

        state_tx.send_replace(ConnectionState::Handshaking);
        let handshake_span = tracing::info_span!("transport.handshake", session_id = %session_id);
        let _handshake_enter = handshake_span.enter();

        let (mut read_half, mut write_half) = tokio::io::split(stream);

        let (handshake, hello) = ClientHandshake::begin(
            session_id,
            scan_device_id,
            scan_cert_fingerprint_sha256,
            signing_key_raw_scalar,
            signing_public_x963,
        );
        write_frame(&mut write_half, OUTER_HANDSHAKE_CHANNEL, &serde_json::to_vec(&hello)?).await?;

        let (ack_channel, ack_payload) = read_frame(&mut read_half).await?;
        if ack_channel != OUTER_HANDSHAKE_CHANNEL {
            return Err(TransportError::SecureChannel(crate::error::SecureChannelError::Malformed(
                "expected handshake ack on control channel".into(),
            )));
        }
        let ack: SecureChannelAck = serde_json::from_slice(&ack_payload)?;
        let secure_state = handshake.complete(&ack)?;

        state_tx.send_replace(ConnectionState::Ready);
        drop(_handshake_enter);
        drop(_enter);

        let writer = Arc::new(Mutex::new(write_half));
        let secure = Arc::new(Mutex::new(secure_state));
        let replay_buffer = Arc::new(Mutex::new(ReplayBuffer::new()));
        let cancel = CancellationToken::new();

        let recv_task = tokio::spawn(recv_loop(
            read_half,
            Arc::clone(&secure),
            Arc::clone(&replay_buffer),
            Arc::clone(&writer),
            state_tx.clone(),
            cancel.clone(),
            backpressure_handler,
        ));

        let client = Self {
            writer,
            secure,
            replay_buffer,
            state_tx,
            cancel,
            recv_task: Mutex::new(Some(recv_task)),
            session_id: session_id.to_string(),
        };

        client
            .send_control(&ControlMessage::ResumeCheckpoint {
                session_id: client.session_id.clone(),
                last_acked_sample_seq: -1,
                captured_at_utc: Utc::now(),
                stream_id: OUR_STREAM_ID.to_string(),
            })
            .await?;

        Ok((client, state_rx))
    }

    pub async fn send_control(&self, message: &ControlMessage) -> Result<(), TransportError> {
        let payload = serde_json::to_vec(message)?;
        let envelope = {
            let mut secure = self.secure.lock().await;
            secure.encode_frame(CONTROL_CHANNEL, &payload)?
        };
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, OUTER_ENVELOPE_CHANNEL, &serde_json::to_vec(&envelope)?).await
    }

    /// Sends a sample as `[env_len u32 BE][env_json][payload]` on the
    /// sample channel and buffers the plaintext frame for resume replay.
    pub async fn send_sample(&self, sample_seq: i64, envelope_json: &[u8], payload: &[u8]) -> Result<(), TransportError> {
        let mut inner = Vec::with_capacity(4 + envelope_json.len() + payload.len());
        inner.extend_from_slice(&(envelope_json.len() as u32).to_be_bytes());
        inner.extend_from_slice(envelope_json);
        inner.extend_from_slice(payload);

        self.send_sample_plaintext(sample_seq, &inner).await
    }

    async fn send_sample_plaintext(&self, sample_seq: i64, inner: &[u8]) -> Result<(), TransportError> {
        let envelope = {
            let mut secure = self.secure.lock().await;
            secure.encode_frame(SAMPLE_CHANNEL, inner)?
        };
        {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, OUTER_ENVELOPE_CHANNEL, &serde_json::to_vec(&envelope)?).await?;
        }
        self.replay_buffer.lock().await.push(sample_seq, inner.to_vec());
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Tears down the receive task and clears all session state. Safe to
    /// call more than once (idempotent): a second call finds no task left
    /// to await and just re-asserts the disconnected state.
    pub async fn disconnect(&self) {
        self.cancel.cancel();
        if let Some(task) = self.recv_task.lock().await.take() {
            let _ = task.await;
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
        tracing::info!(session_id = %self.session_id, "transport.disconnected");
    }
}

async fn recv_loop(
    mut reader: OwnedReadHalf,
    secure: Arc<Mutex<SecureChannelState>>,
    replay_buffer: Arc<Mutex<ReplayBuffer>>,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    state_tx: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
    backpressure_handler: BackpressureHandler,
) {
    let span = tracing::info_span!("transport.recv_loop");
    let _enter = span.enter();

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            result = read_frame(&mut reader) => result,
        };

        let (channel, payload) = match frame {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(error = %e, "transport.recv_loop.read_failed");
                break;
            }
        };

        match channel {
            OUTER_LEGACY_SAMPLE_CHANNEL => {
                tracing::warn!("transport.recv_loop.rejected_legacy_sample_channel");
                break;
            }
            OUTER_ENVELOPE_CHANNEL => {
                let envelope: AeadEnvelope = match serde_json::from_slice(&payload) {
                    Ok(e) => e,
                    Err(e) => {
                        tracing::warn!(error = %e, "transport.recv_loop.malformed_envelope");
                        continue;
                    }
                };
                if envelope.protocol != PROTOCOL_ID {
                    tracing::warn!("transport.recv_loop.protocol_mismatch");
                    continue;
                }

                let decoded = {
                    let mut secure = secure.lock().await;
                    secure.decode_frame(&envelope)
                };

                let (inner_channel, plaintext) = match decoded {
                    Ok(pair) => pair,
                    Err(crate::error::SecureChannelError::ReplayRejected { counter, high_water }) => {
                        tracing::warn!(counter, high_water, "transport.recv_loop.replay_dropped");
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "transport.recv_loop.aead_failure_fatal");
                        break;
                    }
                };

                if inner_channel == CONTROL_CHANNEL {
                    handle_control_message(&plaintext, &replay_buffer, &writer, &secure, &backpressure_handler).await;
                } else {
                    tracing::debug!(inner_channel, "transport.recv_loop.unexpected_inbound_sample");
                }
            }
            other => {
                tracing::warn!(channel = other, "transport.recv_loop.unexpected_outer_channel");
                break;
            }
        }
    }

    state_tx.send_replace(ConnectionState::Disconnected);
}

async fn handle_control_message(
    plaintext: &[u8],
    replay_buffer: &Arc<Mutex<ReplayBuffer>>,
    writer: &Arc<Mutex<OwnedWriteHalf>>,
    secure: &Arc<Mutex<SecureChannelState>>,
    backpressure_handler: &BackpressureHandler,
) {
    let message: ControlMessage = match serde_json::from_slice(plaintext) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(error = %e, "transport.recv_loop.malformed_control_message");
            return;
        }
    };

    match message {
        ControlMessage::ResumeCheckpoint { last_acked_sample_seq, stream_id, .. } => {
            let mut buffer = replay_buffer.lock().await;
            buffer.trim_up_to(last_acked_sample_seq);

            if stream_id == PEER_RESUME_STREAM_ID {
                let to_retransmit = buffer.entries_after(last_acked_sample_seq);
                drop(buffer);
                for (sample_seq, inner) in to_retransmit {
                    let envelope = {
                        let mut secure = secure.lock().await;
                        match secure.encode_frame(SAMPLE_CHANNEL, &inner) {
                            Ok(e) => e,
                            Err(e) => {
                                tracing::warn!(sample_seq, error = %e, "transport.resume.retransmit_failed");
                                continue;
                            }
                        }
                    };
                    let Ok(bytes) = serde_json::to_vec(&envelope) else { continue };
                    let mut w = writer.lock().await;
                    if let Err(e) = write_frame(&mut *w, OUTER_ENVELOPE_CHANNEL, &bytes).await {
                        tracing::warn!(sample_seq, error = %e, "transport.resume.retransmit_write_failed");
                    }
                }
            }
        }
        ControlMessage::BackpressureHint { target_keyframe_fps, depth_stride_hint, mesh_update_interval_ms, drop_non_keyframes } => {
            backpressure_handler(target_keyframe_fps, depth_stride_hint, mesh_update_interval_ms, drop_non_keyframes);
        }
    }
}
