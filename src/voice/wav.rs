//! WAV container handling
//!
//! Extracts raw PCM and format parameters from synthesized WAV bytes, and
//! persists uplink recordings as timestamped WAV files via hound.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;

/// PCM payload and format parameters recovered from a WAV container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedAudio {
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Bytes per sample (bits_per_sample / 8).
    pub sample_width: u16,
}

/// Parse a WAV container and return its PCM bytes plus format parameters.
///
/// Walks the RIFF chunks manually so that streaming WAV files with
/// 0xFFFFFFFF chunk sizes still parse. Only integer PCM (format 1) is
/// returned as-is; the caller decides whether the sample width is usable.
pub fn extract_pcm(wav_bytes: &[u8]) -> Result<ExtractedAudio> {
    if wav_bytes.len() < 44 {
        anyhow::bail!("WAV data too short: {} bytes", wav_bytes.len());
    }
    if &wav_bytes[0..4] != b"RIFF" || &wav_bytes[8..12] != b"WAVE" {
        anyhow::bail!("not a valid WAV file");
    }

    let mut pos = 12; // after "WAVE"
    let mut data_range: Option<(usize, usize)> = None;
    let mut sample_rate = 0u32;
    let mut channels = 0u16;
    let mut bits_per_sample = 0u16;
    let mut audio_format = 0u16;

    while pos + 8 <= wav_bytes.len() {
        let chunk_id = &wav_bytes[pos..pos + 4];
        let chunk_size = u32::from_le_bytes([
            wav_bytes[pos + 4],
            wav_bytes[pos + 5],
            wav_bytes[pos + 6],
            wav_bytes[pos + 7],
        ]);

        if chunk_id == b"fmt " {
            if pos + 8 + 16 <= wav_bytes.len() {
                audio_format = u16::from_le_bytes([wav_bytes[pos + 8], wav_bytes[pos + 9]]);
                channels = u16::from_le_bytes([wav_bytes[pos + 10], wav_bytes[pos + 11]]);
                sample_rate = u32::from_le_bytes([
                    wav_bytes[pos + 12],
                    wav_bytes[pos + 13],
                    wav_bytes[pos + 14],
                    wav_bytes[pos + 15],
                ]);
                bits_per_sample = u16::from_le_bytes([wav_bytes[pos + 22], wav_bytes[pos + 23]]);
            }
            // 0xFFFFFFFF marks a streaming writer; the PCM fmt chunk is 16 bytes
            let real_size = if chunk_size == 0xFFFFFFFF { 16 } else { chunk_size as usize };
            pos += 8 + real_size;
        } else if chunk_id == b"data" {
            let start = pos + 8;
            let end = if chunk_size == 0xFFFFFFFF {
                wav_bytes.len()
            } else {
                (start + chunk_size as usize).min(wav_bytes.len())
            };
            data_range = Some((start, end));
            break;
        } else {
            let real_size = if chunk_size == 0xFFFFFFFF { 0 } else { chunk_size as usize };
            pos += 8 + real_size;
        }
    }

    let (start, end) = data_range.context("could not find data chunk in WAV")?;
    if audio_format != 1 {
        anyhow::bail!("unsupported WAV audio format: {}", audio_format);
    }
    if bits_per_sample == 0 || bits_per_sample % 8 != 0 {
        anyhow::bail!("unsupported WAV bit depth: {}", bits_per_sample);
    }

    Ok(ExtractedAudio {
        pcm: wav_bytes[start..end].to_vec(),
        sample_rate,
        channels,
        sample_width: bits_per_sample / 8,
    })
}

/// Persist 16-bit mono PCM as a timestamped WAV file under `dir`.
///
/// Filenames are `<prefix><UTC YYYYMMDD_HHMMSS_micros>.wav`, matching the
/// firmware debugging convention. Returns the full path and the bare name.
pub fn save_recording(
    dir: &Path,
    prefix: &str,
    pcm: &[u8],
    sample_rate: u32,
) -> Result<(PathBuf, String)> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create recordings dir {:?}", dir))?;

    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S_%6f");
    let filename = format!("{}{}.wav", prefix, timestamp);
    let filepath = dir.join(&filename);

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(&filepath, spec)
        .with_context(|| format!("failed to create WAV file {:?}", filepath))?;
    for chunk in pcm.chunks_exact(2) {
        writer.write_sample(i16::from_le_bytes([chunk[0], chunk[1]]))?;
    }
    writer.finalize()?;

    info!("saved WAV: {}", filename);
    Ok((filepath, filename))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_wav(samples: &[i16], sample_rate: u32, channels: u16) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
        cursor.into_inner()
    }

    #[test]
    fn test_extract_pcm_round_trip() {
        let samples: Vec<i16> = (0..1600).map(|i| (i % 100) as i16).collect();
        let wav = make_wav(&samples, 24000, 1);

        let audio = extract_pcm(&wav).unwrap();
        assert_eq!(audio.sample_rate, 24000);
        assert_eq!(audio.channels, 1);
        assert_eq!(audio.sample_width, 2);
        assert_eq!(audio.pcm.len(), samples.len() * 2);
        assert_eq!(
            i16::from_le_bytes([audio.pcm[2], audio.pcm[3]]),
            samples[1]
        );
    }

    #[test]
    fn test_extract_pcm_stereo() {
        let samples = vec![100i16; 800];
        let wav = make_wav(&samples, 44100, 2);
        let audio = extract_pcm(&wav).unwrap();
        assert_eq!(audio.channels, 2);
        assert_eq!(audio.sample_rate, 44100);
    }

    #[test]
    fn test_extract_pcm_rejects_garbage() {
        assert!(extract_pcm(&[0u8; 10]).is_err());
        assert!(extract_pcm(&[0u8; 100]).is_err());
        let mut wav = make_wav(&[0i16; 10], 16000, 1);
        wav[0] = b'X'; // break the RIFF magic
        assert!(extract_pcm(&wav).is_err());
    }

    #[test]
    fn test_save_recording() {
        let dir = tempfile::tempdir().unwrap();
        let pcm: Vec<u8> = (0..320u16).flat_map(|i| (i as i16).to_le_bytes()).collect();

        let (path, filename) = save_recording(dir.path(), "rec_ws_", &pcm, 16000).unwrap();
        assert!(filename.starts_with("rec_ws_"));
        assert!(filename.ends_with(".wav"));
        assert!(path.exists());

        let mut reader = hound::WavReader::open(&path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.sample_rate, 16000);
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.bits_per_sample, 16);
        let read: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(read.len(), 320);
        assert_eq!(read[5], 5);
    }
}
