//! Legacy HTTP audio upload
//!
//! `POST /api/v1/audio` predates the WebSocket protocol: older firmware
//! uploads one utterance per request, as raw PCM16LE or μ-law, with the
//! codec and sample rate in headers. The body is archived as a WAV file
//! and a summary is returned. The μ-law decoder lives here only; the
//! WebSocket protocol is PCM16LE exclusively.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::server::ServerState;
use crate::voice::wav;

fn bad_request(detail: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "detail": detail }))).into_response()
}

pub async fn receive_audio(
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let codec = headers
        .get("X-Codec")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("pcm16le")
        .to_ascii_lowercase();
    if !matches!(codec.as_str(), "pcm16" | "pcm16le" | "mulaw" | "ulaw") {
        return bad_request("Unsupported codec. Use pcm16le (preferred) or mulaw.");
    }

    let sample_rate = match headers
        .get("X-Sample-Rate")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("16000")
        .parse::<u32>()
    {
        Ok(rate) if rate > 0 => rate,
        _ => return bad_request("X-Sample-Rate must be a positive integer."),
    };

    if body.is_empty() {
        return bad_request("Request body is empty.");
    }

    let pcm = if codec.starts_with("pcm16") {
        if body.len() % 2 != 0 {
            return bad_request("PCM16 payload size must be even.");
        }
        body.to_vec()
    } else {
        mulaw_to_pcm16(&body)
    };

    let frames = pcm.len() / 2;
    let duration_seconds = frames as f64 / f64::from(sample_rate);

    let (_, filename) = match wav::save_recording(&state.recordings_dir, "rec_", &pcm, sample_rate)
    {
        Ok(saved) => saved,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "detail": format!("Failed to save audio: {e}") })),
            )
                .into_response();
        }
    };

    Json(json!({
        "text": format!("Saved as {}", filename),
        "audio_mulaw": "",
        "sample_rate": sample_rate,
        "frames": frames,
        "duration_seconds": (duration_seconds * 1000.0).round() / 1000.0,
        "path": state.recordings_dir.join(&filename).display().to_string(),
    }))
    .into_response()
}

/// Convert a single μ-law byte to a 16-bit linear sample.
fn ulaw_byte_to_linear(sample: u8) -> i16 {
    let u_val = !sample;
    let mut t = ((i32::from(u_val & 0x0f)) << 3) + 0x84;
    t <<= (u_val & 0x70) >> 4;
    if u_val & 0x80 != 0 {
        (0x84 - t) as i16
    } else {
        (t - 0x84) as i16
    }
}

/// Decode μ-law bytes to PCM16LE.
fn mulaw_to_pcm16(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() * 2);
    for &b in payload {
        out.extend_from_slice(&ulaw_byte_to_linear(b).to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ulaw_silence_maps_to_zero() {
        // 0xFF and 0x7F both encode zero amplitude
        assert_eq!(ulaw_byte_to_linear(0xff), 0);
        assert_eq!(ulaw_byte_to_linear(0x7f), 0);
    }

    #[test]
    fn test_ulaw_sign_symmetry() {
        // Same magnitude bits with opposite sign bit decode to opposite samples
        for byte in 0x00..0x80u8 {
            let negative = ulaw_byte_to_linear(byte);
            let positive = ulaw_byte_to_linear(byte | 0x80);
            assert_eq!(negative, -positive);
        }
    }

    #[test]
    fn test_ulaw_extremes() {
        // 0x00 encodes the largest negative magnitude
        assert_eq!(ulaw_byte_to_linear(0x00), -32124);
        assert_eq!(ulaw_byte_to_linear(0x80), 32124);
    }

    #[test]
    fn test_mulaw_to_pcm16_doubles_length() {
        let decoded = mulaw_to_pcm16(&[0xff, 0x7f, 0x00]);
        assert_eq!(decoded.len(), 6);
        assert_eq!(i16::from_le_bytes([decoded[0], decoded[1]]), 0);
        assert_eq!(i16::from_le_bytes([decoded[4], decoded[5]]), -32124);
    }
}
