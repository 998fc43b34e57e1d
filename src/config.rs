//! Configuration management
//!
//! Server, recognizer and synthesizer settings with documented defaults,
//! persisted as TOML under the platform config directory.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    /// Speech recognition settings
    #[serde(default)]
    pub stt: SttConfig,
    /// Speech synthesis settings
    #[serde(default)]
    pub tts: TtsConfig,
    #[serde(default)]
    pub recordings: RecordingsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    /// Recognition language code
    #[serde(default = "default_language")]
    pub language: String,
    /// Recognition API endpoint
    #[serde(default = "default_stt_endpoint")]
    pub endpoint: String,
    /// API key; falls back to the GOOGLE_API_KEY environment variable
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_language() -> String {
    "ja-JP".to_string()
}

fn default_stt_endpoint() -> String {
    "https://speech.googleapis.com".to_string()
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            language: default_language(),
            endpoint: default_stt_endpoint(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// VOICEVOX engine base URL
    #[serde(default = "default_tts_url")]
    pub base_url: String,
    /// VOICEVOX speaker id
    #[serde(default = "default_speaker")]
    pub speaker: u32,
}

fn default_tts_url() -> String {
    "http://localhost:50021".to_string()
}

fn default_speaker() -> u32 {
    29
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            base_url: default_tts_url(),
            speaker: default_speaker(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingsConfig {
    /// Directory for archived uplink captures, created if absent
    #[serde(default = "default_recordings_dir")]
    pub dir: PathBuf,
}

fn default_recordings_dir() -> PathBuf {
    PathBuf::from("recordings")
}

impl Default for RecordingsConfig {
    fn default() -> Self {
        Self {
            dir: default_recordings_dir(),
        }
    }
}

impl Config {
    /// Load configuration from file, writing defaults on first run
    pub fn load() -> Result<Self> {
        let config_path = config_path()?;

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .context("Failed to read config file")?;
            let config: Config = toml::from_str(&contents)
                .context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = config_path()?;
        let parent = config_path.parent()
            .context("Config path has no parent")?;

        std::fs::create_dir_all(parent)
            .context("Failed to create config directory")?;

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }
}

/// Get the configuration file path
pub fn config_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "stackchan", "stackchan-server")
        .context("Failed to get project directories")?;
    Ok(base.config_dir().join("config.toml"))
}

/// Show current configuration
pub fn show_config() -> Result<()> {
    let config = Config::load()?;

    println!("Server:");
    println!("  host:           {}", config.server.host);
    println!("  port:           {}", config.server.port);
    println!("Speech recognition:");
    println!("  endpoint:       {}", config.stt.endpoint);
    println!("  language:       {}", config.stt.language);
    println!(
        "  api key:        {}",
        if config.stt.api_key.is_some() { "configured" } else { "from GOOGLE_API_KEY" }
    );
    println!("Speech synthesis:");
    println!("  base url:       {}", config.tts.base_url);
    println!("  speaker:        {}", config.tts.speaker);
    println!("Recordings:");
    println!("  dir:            {}", config.recordings.dir.display());

    Ok(())
}

/// Set the VOICEVOX speaker id
pub fn set_speaker(speaker: u32) -> Result<()> {
    let mut config = Config::load()?;
    config.tts.speaker = speaker;
    config.save()?;
    println!("VOICEVOX speaker set to {}", speaker);
    Ok(())
}

/// Set the VOICEVOX engine base URL
pub fn set_tts_url(url: &str) -> Result<()> {
    let mut config = Config::load()?;
    config.tts.base_url = url.trim_end_matches('/').to_string();
    config.save()?;
    println!("VOICEVOX base URL set to {}", config.tts.base_url);
    Ok(())
}

/// Set the recognition language code
pub fn set_language(language: &str) -> Result<()> {
    let mut config = Config::load()?;
    config.stt.language = language.to_string();
    config.save()?;
    println!("Recognition language set to {}", language);
    Ok(())
}
