//! Voice provider adapters
//!
//! External speech services the session proxy talks to:
//! - `stt`: Google Cloud Speech recognition of uplink captures
//! - `tts`: VOICEVOX synthesis of downlink speech
//! - `wav`: WAV container extraction and recording persistence

pub mod stt;
pub mod tts;
pub mod wav;

pub use stt::{CloudSpeechClient, SpeechToText};
pub use tts::{TextToSpeech, VoicevoxClient};
