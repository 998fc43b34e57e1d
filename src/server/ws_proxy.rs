//! WebSocket session proxy
//!
//! One `WsProxy` per accepted firmware connection. A receive task decodes
//! incoming frames and is the sole writer of inbound session state (capture
//! buffer, transcript, wake-word latch, speak-done counter); the orchestrator
//! and user handlers read-and-consume through the `listen` / `speak` /
//! `wait_for_talk_session` primitives. All downlink frames funnel through one
//! mpsc channel drained by a sender task that owns the socket sink and assigns
//! sequence numbers at send time, so downlink `seq` is strictly increasing
//! from 0 no matter which task emits.

use axum::extract::ws::{CloseFrame, Message};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::server::protocol::{
    self, FirmwareState, FrameKind, MsgType, ProtocolViolation, CHANNELS, CLOSE_PROTOCOL_ERROR,
    SAMPLE_RATE_HZ, SAMPLE_WIDTH,
};
use crate::voice::{wav, SpeechToText, TextToSpeech};

/// Max PCM bytes per downlink WAV/DATA frame.
pub const DOWN_WAV_CHUNK: usize = 4096;
/// Playback duration of one downlink segment in milliseconds.
pub const DOWN_SEGMENT_MILLIS: u64 = 2000;
/// The second segment is queued at half interval so the device can start it
/// before the first finishes; later segments pace one full interval each.
const DOWN_SEGMENT_STAGGER_MILLIS: u64 = DOWN_SEGMENT_MILLIS / 2;
/// Audio inactivity timeout while listening.
pub const LISTEN_AUDIO_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for the firmware to report playback finished.
const SPEAK_DEADLINE: Duration = Duration::from_secs(120);
/// Cadence of the cooperative polling primitives.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(50);

const LISTEN_TIMEOUT_MSG: &str = "timed out after audio data inactivity from firmware";
const SPEAK_TIMEOUT_MSG: &str = "timed out waiting for speaking finished event";

/// Errors surfaced to user conversation code. Protocol violations never reach
/// here; they close the socket with code 1003 instead.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("speech recognition result is empty")]
    EmptyTranscript,
    #[error("{0}")]
    Timeout(&'static str),
    #[error("websocket disconnected")]
    Disconnect,
}

/// A downlink message awaiting emission by the sender task.
#[derive(Debug)]
pub enum Outbound {
    Frame {
        kind: FrameKind,
        msg_type: MsgType,
        payload: Vec<u8>,
    },
    Text(String),
    Close {
        code: u16,
        reason: &'static str,
    },
}

/// Drain `rx` into the socket sink, assigning downlink sequence numbers in
/// send order. Exits on a Close message or a sink error.
pub async fn run_sender<S>(mut rx: mpsc::Receiver<Outbound>, mut sink: S)
where
    S: Sink<Message> + Unpin,
{
    let mut seq: u16 = 0;
    while let Some(out) = rx.recv().await {
        let msg = match out {
            Outbound::Frame {
                kind,
                msg_type,
                payload,
            } => {
                let bytes = protocol::encode(kind, msg_type, seq, &payload);
                seq = seq.wrapping_add(1);
                Message::Binary(bytes.into())
            }
            Outbound::Text(text) => Message::Text(text.into()),
            Outbound::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        };
        if sink.send(msg).await.is_err() {
            break;
        }
    }
}

/// Inbound session state. Written only by the receive task; the session API
/// reads-and-consumes.
#[derive(Default)]
struct SessionState {
    pcm_buffer: Vec<u8>,
    streaming: bool,
    data_counter: u64,
    transcript: Option<String>,
    message_error: Option<SessionError>,
    message_ready: bool,
    wakeword: bool,
    speaking: bool,
    speak_done_counter: u64,
    closed: bool,
}

#[derive(Serialize)]
struct RecordingSummary {
    text: String,
    sample_rate: u32,
    frames: usize,
    channels: u16,
    duration_seconds: f64,
    path: String,
}

pub struct WsProxy {
    state: Mutex<SessionState>,
    out_tx: mpsc::Sender<Outbound>,
    stt: Arc<dyn SpeechToText>,
    tts: Arc<dyn TextToSpeech>,
    recordings_dir: PathBuf,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

impl WsProxy {
    pub fn new(
        out_tx: mpsc::Sender<Outbound>,
        stt: Arc<dyn SpeechToText>,
        tts: Arc<dyn TextToSpeech>,
        recordings_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SessionState::default()),
            out_tx,
            stt,
            tts,
            recordings_dir,
            receive_task: Mutex::new(None),
        })
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn closed(&self) -> bool {
        self.state().closed
    }

    pub fn receive_task_finished(&self) -> bool {
        self.receive_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(false)
    }

    /// Spawn the receive task over a stream of WebSocket messages.
    pub fn spawn_receive<S>(self: &Arc<Self>, stream: S)
    where
        S: Stream<Item = Result<Message, axum::Error>> + Send + Unpin + 'static,
    {
        let proxy = self.clone();
        let handle = tokio::spawn(async move { proxy.run_receive(stream).await });
        *self.receive_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Mark the session closed and cancel the receive task.
    pub async fn close(&self) {
        self.state().closed = true;
        let handle = self
            .receive_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }

    // ─── Session API ─────────────────────────────────────────────

    /// Block until the firmware reports a wake-word, consuming the latch.
    /// Multiple wake-words arriving while nobody waits coalesce into one.
    pub async fn wait_for_talk_session(&self) -> Result<(), SessionError> {
        loop {
            {
                let mut state = self.state();
                if state.wakeword {
                    state.wakeword = false;
                    return Ok(());
                }
                if state.closed {
                    return Err(SessionError::Disconnect);
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Command the firmware into Listening and wait for a transcript.
    ///
    /// Raises `EmptyTranscript` when recognition produced no text,
    /// `Timeout` after 10 s without any uplink DATA frame (the firmware is
    /// commanded back to Idle first), and `Disconnect` when the session ends.
    pub async fn listen(&self) -> Result<String, SessionError> {
        self.send_state_command(FirmwareState::Listening).await?;

        let mut last_counter = self.state().data_counter;
        let mut last_data_time = Instant::now();
        loop {
            {
                let mut state = self.state();
                if let Some(err) = state.message_error.take() {
                    return Err(err);
                }
                if state.message_ready {
                    let text = state.transcript.take().unwrap_or_default();
                    state.message_ready = false;
                    return Ok(text);
                }
                if state.closed {
                    return Err(SessionError::Disconnect);
                }
                if state.data_counter != last_counter {
                    last_counter = state.data_counter;
                    last_data_time = Instant::now();
                }
            }
            if last_data_time.elapsed() >= LISTEN_AUDIO_TIMEOUT {
                if !self.closed() {
                    self.send_state_command(FirmwareState::Idle).await?;
                }
                return Err(SessionError::Timeout(LISTEN_TIMEOUT_MSG));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Synthesize `text`, stream it to the device in timed segments, and wait
    /// for the firmware's playback-finished event before commanding Idle.
    pub async fn speak(&self, text: &str) -> Result<(), SessionError> {
        let start_counter = self.state().speak_done_counter;
        let spoke = self.synthesize_and_stream(text).await?;
        if !spoke {
            // nothing reached the device (empty synthesis or reported error)
            return Ok(());
        }
        self.wait_for_speaking_finished(start_counter + 1, SPEAK_DEADLINE)
            .await?;
        if !self.closed() {
            self.send_state_command(FirmwareState::Idle).await?;
        }
        Ok(())
    }

    async fn wait_for_speaking_finished(
        &self,
        min_counter: u64,
        deadline: Duration,
    ) -> Result<(), SessionError> {
        let deadline = Instant::now() + deadline;
        loop {
            {
                let state = self.state();
                if state.speak_done_counter >= min_counter {
                    return Ok(());
                }
                if state.closed {
                    return Err(SessionError::Disconnect);
                }
            }
            if Instant::now() >= deadline {
                return Err(SessionError::Timeout(SPEAK_TIMEOUT_MSG));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Emit a STATE_CMD frame with a single-byte state payload.
    pub async fn send_state_command(&self, state: FirmwareState) -> Result<(), SessionError> {
        self.send_frame(FrameKind::StateCmd, MsgType::Data, vec![state as u8])
            .await
    }

    /// Command the firmware back to Idle.
    pub async fn reset_state(&self) -> Result<(), SessionError> {
        self.send_state_command(FirmwareState::Idle).await
    }

    // ─── Downlink plumbing ───────────────────────────────────────

    async fn send_frame(
        &self,
        kind: FrameKind,
        msg_type: MsgType,
        payload: Vec<u8>,
    ) -> Result<(), SessionError> {
        self.out_tx
            .send(Outbound::Frame {
                kind,
                msg_type,
                payload,
            })
            .await
            .map_err(|_| SessionError::Disconnect)
    }

    async fn send_text(&self, text: String) -> Result<(), SessionError> {
        self.out_tx
            .send(Outbound::Text(text))
            .await
            .map_err(|_| SessionError::Disconnect)
    }

    async fn send_json_error(&self, message: String) -> Result<(), SessionError> {
        self.send_text(json!({ "error": message }).to_string()).await
    }

    async fn close_with(&self, violation: ProtocolViolation) {
        warn!("protocol violation: {}", violation);
        let _ = self
            .out_tx
            .send(Outbound::Close {
                code: CLOSE_PROTOCOL_ERROR,
                reason: violation.close_reason(),
            })
            .await;
    }

    // ─── Receive loop (event router) ─────────────────────────────

    async fn run_receive<S>(self: Arc<Self>, mut stream: S)
    where
        S: Stream<Item = Result<Message, axum::Error>> + Unpin,
    {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Binary(data)) => {
                    if !self.handle_binary(&data).await {
                        break;
                    }
                }
                Ok(Message::Text(_)) => {
                    debug!("ignoring text message from firmware");
                }
                Ok(Message::Close(_)) => {
                    info!("websocket closed by firmware");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("websocket receive error: {}", e);
                    break;
                }
            }
        }
        let mut state = self.state();
        state.closed = true;
        state.speaking = false;
    }

    /// Decode and dispatch one binary message. Returns false when the
    /// session must end.
    async fn handle_binary(&self, data: &[u8]) -> bool {
        let frame = match protocol::decode(data) {
            Ok(frame) => frame,
            Err(violation) => {
                self.close_with(violation).await;
                return false;
            }
        };

        match FrameKind::from_u8(frame.kind) {
            Some(FrameKind::Pcm) => match MsgType::from_u8(frame.msg_type) {
                Some(MsgType::Start) => {
                    self.handle_start();
                    true
                }
                Some(MsgType::Data) => match self.handle_data(&frame.payload) {
                    Ok(()) => true,
                    Err(violation) => {
                        self.close_with(violation).await;
                        false
                    }
                },
                Some(MsgType::End) => self.handle_end(&frame.payload).await,
                None => {
                    self.close_with(ProtocolViolation::UnknownPcmMsgType).await;
                    false
                }
            },
            Some(FrameKind::WakewordEvt) => {
                self.handle_wakeword_event(frame.msg_type, &frame.payload);
                true
            }
            Some(FrameKind::StateEvt) => {
                self.handle_state_event(frame.msg_type, &frame.payload);
                true
            }
            Some(FrameKind::SpeakDoneEvt) => {
                self.handle_speak_done_event(frame.msg_type, &frame.payload);
                true
            }
            _ => {
                self.close_with(ProtocolViolation::UnsupportedKind).await;
                false
            }
        }
    }

    fn handle_start(&self) {
        info!("received START");
        let mut state = self.state();
        state.pcm_buffer.clear();
        state.streaming = true;
        state.message_error = None;
    }

    fn handle_data(&self, payload: &[u8]) -> Result<(), ProtocolViolation> {
        debug!("received DATA payload_bytes={}", payload.len());
        let mut state = self.state();
        if !state.streaming {
            return Err(ProtocolViolation::DataBeforeStart);
        }
        if payload.len() % usize::from(SAMPLE_WIDTH * CHANNELS) != 0 {
            return Err(ProtocolViolation::InvalidChunkLength);
        }
        state.pcm_buffer.extend_from_slice(payload);
        if !payload.is_empty() {
            state.data_counter += 1;
        }
        Ok(())
    }

    /// Validate the END frame against the accumulated capture and take the
    /// completed PCM out of the buffer.
    fn take_completed_capture(&self, payload: &[u8]) -> Result<Vec<u8>, ProtocolViolation> {
        let frame_bytes = usize::from(SAMPLE_WIDTH * CHANNELS);
        let mut state = self.state();
        if !state.streaming {
            return Err(ProtocolViolation::EndBeforeStart);
        }
        if payload.len() % frame_bytes != 0 {
            return Err(ProtocolViolation::InvalidTailLength);
        }
        state.pcm_buffer.extend_from_slice(payload);

        if state.pcm_buffer.is_empty() || state.pcm_buffer.len() % frame_bytes != 0 {
            return Err(ProtocolViolation::InvalidAccumulatedPcm);
        }
        state.streaming = false;
        Ok(std::mem::take(&mut state.pcm_buffer))
    }

    async fn handle_end(&self, payload: &[u8]) -> bool {
        info!("received END payload_bytes={}", payload.len());
        let frame_bytes = usize::from(SAMPLE_WIDTH * CHANNELS);

        let pcm = match self.take_completed_capture(payload) {
            Ok(pcm) => pcm,
            Err(violation) => {
                self.close_with(violation).await;
                return false;
            }
        };

        // Uplink audio fully received: firmware enters Thinking while we work.
        if self.send_state_command(FirmwareState::Thinking).await.is_err() {
            return false;
        }

        let frames = pcm.len() / frame_bytes;
        let duration_seconds = frames as f64 / f64::from(SAMPLE_RATE_HZ);

        let (_, filename) =
            match wav::save_recording(&self.recordings_dir, "rec_ws_", &pcm, SAMPLE_RATE_HZ) {
                Ok(saved) => saved,
                Err(e) => {
                    error!("failed to persist recording: {:#}", e);
                    return false;
                }
            };

        let summary = RecordingSummary {
            text: format!("Saved as {}", filename),
            sample_rate: SAMPLE_RATE_HZ,
            frames,
            channels: CHANNELS,
            duration_seconds: (duration_seconds * 1000.0).round() / 1000.0,
            path: self.recordings_dir.join(&filename).display().to_string(),
        };
        let summary_json = match serde_json::to_string(&summary) {
            Ok(json) => json,
            Err(e) => {
                error!("failed to serialize recording summary: {}", e);
                return false;
            }
        };
        if self.send_text(summary_json).await.is_err() {
            return false;
        }

        let transcript = match self.stt.transcribe(&pcm).await {
            Ok(text) => text,
            Err(e) => {
                error!("speech recognition failed: {:#}", e);
                return false;
            }
        };

        let mut state = self.state();
        if transcript.trim().is_empty() {
            state.message_error = Some(SessionError::EmptyTranscript);
        } else {
            state.transcript = Some(transcript);
            state.message_ready = true;
        }
        true
    }

    fn handle_wakeword_event(&self, msg_type: u8, payload: &[u8]) {
        if msg_type != MsgType::Data as u8 || payload.is_empty() {
            return;
        }
        info!("received wakeword event");
        self.state().wakeword = true;
    }

    fn handle_state_event(&self, msg_type: u8, payload: &[u8]) {
        if msg_type != MsgType::Data as u8 || payload.is_empty() {
            return;
        }
        // Log only; the firmware is the source of truth for its own state.
        info!("received firmware state={}", payload[0]);
    }

    fn handle_speak_done_event(&self, msg_type: u8, payload: &[u8]) {
        if msg_type != MsgType::Data as u8 || payload.is_empty() {
            return;
        }
        info!("received speak done event");
        let mut state = self.state();
        state.speak_done_counter += 1;
        state.speaking = false;
    }

    // ─── TTS segmenter ───────────────────────────────────────────

    /// Returns true when segments were actually emitted.
    async fn synthesize_and_stream(&self, text: &str) -> Result<bool, SessionError> {
        self.state().speaking = true;

        let wav_bytes = match self.tts.synthesize(text).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.state().speaking = false;
                self.send_json_error(format!("voicevox synthesis failed: {e}"))
                    .await?;
                return Ok(false);
            }
        };
        if wav_bytes.is_empty() {
            self.state().speaking = false;
            return Ok(false);
        }

        let audio = match wav::extract_pcm(&wav_bytes) {
            Ok(audio) => audio,
            Err(e) => {
                self.state().speaking = false;
                self.send_json_error(format!("voicevox synthesis failed: {e}"))
                    .await?;
                return Ok(false);
            }
        };
        if audio.pcm.is_empty() {
            self.state().speaking = false;
            return Ok(false);
        }
        if audio.sample_width != SAMPLE_WIDTH {
            self.state().speaking = false;
            self.send_json_error(format!("unsupported sample width {}", audio.sample_width))
                .await?;
            return Ok(false);
        }

        let segment_bytes = segment_bytes(audio.sample_rate, audio.channels, audio.sample_width);
        if segment_bytes == 0 {
            self.state().speaking = false;
            self.send_json_error("invalid segment size computed".to_string())
                .await?;
            return Ok(false);
        }

        self.send_segments(&audio.pcm, audio.sample_rate, audio.channels, segment_bytes)
            .await?;
        Ok(true)
    }

    async fn send_segments(
        &self,
        pcm: &[u8],
        sample_rate: u32,
        channels: u16,
        segment_bytes: usize,
    ) -> Result<(), SessionError> {
        let base_time = Instant::now();
        for (idx, segment) in pcm.chunks(segment_bytes).enumerate() {
            let target = base_time + Duration::from_millis(segment_offset_millis(idx));
            tokio::time::sleep_until(target).await;
            self.send_segment(segment, sample_rate, channels).await?;
        }
        Ok(())
    }

    async fn send_segment(
        &self,
        segment: &[u8],
        sample_rate: u32,
        channels: u16,
    ) -> Result<(), SessionError> {
        info!("sending segment bytes={}", segment.len());
        self.send_frame(
            FrameKind::Wav,
            MsgType::Start,
            protocol::wav_start_payload(sample_rate, channels),
        )
        .await?;
        for chunk in segment.chunks(DOWN_WAV_CHUNK) {
            self.send_frame(FrameKind::Wav, MsgType::Data, chunk.to_vec())
                .await?;
        }
        self.send_frame(FrameKind::Wav, MsgType::End, Vec::new()).await
    }
}

/// Bytes of PCM in one full downlink segment.
pub fn segment_bytes(sample_rate: u32, channels: u16, sample_width: u16) -> usize {
    let bytes_per_second = sample_rate as u64 * u64::from(channels) * u64::from(sample_width);
    (bytes_per_second as f64 * (DOWN_SEGMENT_MILLIS as f64 / 1000.0)) as usize
}

/// Emission offset of segment `idx` relative to the first emission.
pub fn segment_offset_millis(idx: usize) -> u64 {
    match idx {
        0 => 0,
        1 => DOWN_SEGMENT_STAGGER_MILLIS,
        k => DOWN_SEGMENT_STAGGER_MILLIS + (k as u64 - 1) * DOWN_SEGMENT_MILLIS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_bytes() {
        // 16 kHz mono 16-bit: 32000 B/s, 2 s segments
        assert_eq!(segment_bytes(16000, 1, 2), 64000);
        // 24 kHz mono 16-bit
        assert_eq!(segment_bytes(24000, 1, 2), 96000);
        // degenerate parameters
        assert_eq!(segment_bytes(0, 1, 2), 0);
    }

    #[test]
    fn test_segment_offsets() {
        assert_eq!(segment_offset_millis(0), 0);
        assert_eq!(segment_offset_millis(1), 1000);
        assert_eq!(segment_offset_millis(2), 3000);
        assert_eq!(segment_offset_millis(3), 5000);
        assert_eq!(segment_offset_millis(4), 7000);
    }

    #[test]
    fn test_segment_split_seven_seconds() {
        // 7.0 s of 16 kHz mono 16-bit PCM
        let pcm = vec![0u8; 224000];
        let sizes: Vec<usize> = pcm.chunks(segment_bytes(16000, 1, 2)).map(|c| c.len()).collect();
        assert_eq!(sizes, vec![64000, 64000, 64000, 32000]);
    }

    #[test]
    fn test_segment_split_exact_multiple() {
        let pcm = vec![0u8; 128000];
        let count = pcm.chunks(segment_bytes(16000, 1, 2)).count();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_recording_summary_serializes() {
        let summary = RecordingSummary {
            text: "Saved as rec_ws_x.wav".to_string(),
            sample_rate: 16000,
            frames: 16000,
            channels: 1,
            duration_seconds: (1.0004f64 * 1000.0).round() / 1000.0,
            path: "recordings/rec_ws_x.wav".to_string(),
        };
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&summary).unwrap()).unwrap();
        assert_eq!(value["frames"], 16000);
        assert_eq!(value["duration_seconds"], 1.0);
        assert_eq!(value["channels"], 1);
    }
}
