//! Speech-to-text adapter
//!
//! Wraps the Google Cloud Speech REST API (`speech:recognize`) for
//! synchronous recognition of LINEAR16 16 kHz mono captures. The session
//! proxy only depends on the [`SpeechToText`] trait so tests can substitute
//! a stub recognizer.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::config::SttConfig;
use crate::server::protocol::SAMPLE_RATE_HZ;

/// A synchronous speech recognizer. Returns the concatenated transcript, or
/// an empty string when the recognizer produced no results; the caller
/// distinguishes empty from non-empty.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(&self, pcm: &[u8]) -> Result<String>;
}

/// Google Cloud Speech client.
pub struct CloudSpeechClient {
    endpoint: String,
    api_key: String,
    language: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct RecognizeResponse {
    #[serde(default)]
    results: Vec<RecognizeResult>,
}

#[derive(Debug, Deserialize)]
struct RecognizeResult {
    #[serde(default)]
    alternatives: Vec<RecognizeAlternative>,
}

#[derive(Debug, Deserialize)]
struct RecognizeAlternative {
    #[serde(default)]
    transcript: String,
}

impl CloudSpeechClient {
    pub fn new(endpoint: &str, api_key: &str, language: &str) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            language: language.to_string(),
            client: Client::new(),
        }
    }

    /// Create from config. The API key comes from `stt.api_key` or the
    /// `GOOGLE_API_KEY` environment variable.
    pub fn from_config(config: &SttConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var("GOOGLE_API_KEY").ok())
            .context("Google Speech API key not configured (set stt.api_key or GOOGLE_API_KEY)")?;
        Ok(Self::new(&config.endpoint, &api_key, &config.language))
    }
}

#[async_trait]
impl SpeechToText for CloudSpeechClient {
    async fn transcribe(&self, pcm: &[u8]) -> Result<String> {
        if pcm.is_empty() {
            return Ok(String::new());
        }

        debug!(
            "transcribing {} bytes ({:.1}s of audio)",
            pcm.len(),
            pcm.len() as f64 / (SAMPLE_RATE_HZ as f64 * 2.0)
        );

        let body = json!({
            "config": {
                "encoding": "LINEAR16",
                "sampleRateHertz": SAMPLE_RATE_HZ,
                "languageCode": self.language,
            },
            "audio": {
                "content": BASE64.encode(pcm),
            },
        });

        let response = self
            .client
            .post(format!("{}/v1/speech:recognize", self.endpoint))
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .context("failed to reach speech recognition service")?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            anyhow::bail!("speech recognition error ({}): {}", status, detail);
        }

        let parsed: RecognizeResponse = response
            .json()
            .await
            .context("failed to parse speech recognition response")?;

        let mut transcript = String::new();
        for result in &parsed.results {
            if let Some(alt) = result.alternatives.first() {
                info!("transcript: {}", alt.transcript);
                transcript.push_str(&alt.transcript);
            }
        }
        Ok(transcript)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation_trims_slash() {
        let client = CloudSpeechClient::new("https://speech.googleapis.com/", "k", "ja-JP");
        assert_eq!(client.endpoint, "https://speech.googleapis.com");
        assert_eq!(client.language, "ja-JP");
    }

    #[test]
    fn test_recognize_response_parses() {
        let raw = r#"{"results":[{"alternatives":[{"transcript":"こんにちは","confidence":0.9}]},
                      {"alternatives":[{"transcript":"世界"}]}]}"#;
        let parsed: RecognizeResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.results.len(), 2);
        assert_eq!(parsed.results[0].alternatives[0].transcript, "こんにちは");
    }

    #[test]
    fn test_recognize_response_empty() {
        let parsed: RecognizeResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.results.is_empty());
    }
}
