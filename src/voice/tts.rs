//! Text-to-speech adapter
//!
//! Wraps the VOICEVOX engine HTTP API: an `audio_query` request builds the
//! synthesis parameters for a text, then `synthesis` renders them to a WAV
//! container. The session proxy depends only on the [`TextToSpeech`] trait.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};

use crate::config::TtsConfig;

/// A speech synthesizer producing a WAV container for a text.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;
}

/// VOICEVOX engine client.
pub struct VoicevoxClient {
    base_url: String,
    speaker: u32,
    client: Client,
}

impl VoicevoxClient {
    pub fn new(base_url: &str, speaker: u32) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            speaker,
            client: Client::new(),
        }
    }

    pub fn from_config(config: &TtsConfig) -> Self {
        Self::new(&config.base_url, config.speaker)
    }
}

#[async_trait]
impl TextToSpeech for VoicevoxClient {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        if text.is_empty() {
            return Ok(Vec::new());
        }

        debug!("voicevox audio_query speaker={}", self.speaker);
        let speaker = self.speaker.to_string();

        let query_response = self
            .client
            .post(format!("{}/audio_query", self.base_url))
            .query(&[("text", text), ("speaker", speaker.as_str())])
            .send()
            .await
            .context("failed to reach VOICEVOX engine")?;
        if !query_response.status().is_success() {
            let status = query_response.status();
            let detail = query_response.text().await.unwrap_or_default();
            anyhow::bail!("audio_query failed ({}): {}", status, detail);
        }
        let audio_query: serde_json::Value = query_response
            .json()
            .await
            .context("failed to parse audio_query response")?;

        let synthesis_response = self
            .client
            .post(format!("{}/synthesis", self.base_url))
            .query(&[("speaker", speaker.as_str())])
            .json(&audio_query)
            .send()
            .await
            .context("failed to reach VOICEVOX engine")?;
        if !synthesis_response.status().is_success() {
            let status = synthesis_response.status();
            let detail = synthesis_response.text().await.unwrap_or_default();
            anyhow::bail!("synthesis failed ({}): {}", status, detail);
        }

        let wav_bytes = synthesis_response
            .bytes()
            .await
            .context("failed to read synthesis response")?
            .to_vec();

        info!("voicevox synthesis produced {} bytes", wav_bytes.len());
        Ok(wav_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let tts = VoicevoxClient::new("http://localhost:50021", 29);
        assert_eq!(tts.base_url, "http://localhost:50021");
        assert_eq!(tts.speaker, 29);
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let tts = VoicevoxClient::new("http://localhost:50021/", 29);
        assert_eq!(tts.base_url, "http://localhost:50021");
    }
}
