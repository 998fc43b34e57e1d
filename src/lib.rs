//! stackchan-server — WebSocket session server for a talking-doll device
//!
//! The firmware streams microphone PCM over a WebSocket, signals wake-word
//! and playback events, and plays back synthesized speech sent over the same
//! socket in timed segments. This crate provides the session proxy and
//! framing protocol plus the application surface for conversation logic.
//!
//! # Example
//!
//! ```ignore
//! use stackchan_server::{server, StackchanApp};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let app = StackchanApp::new().on_talk_session(|proxy| async move {
//!         let text = proxy.listen().await?;
//!         proxy.speak(&text).await
//!     });
//!     server::start(app, "0.0.0.0", 8000, false, None, None).await
//! }
//! ```

pub mod cli;
pub mod config;
pub mod server;
pub mod voice;

// Re-export commonly used types for convenience
pub use config::Config;
pub use server::app::StackchanApp;
pub use server::ws_proxy::{SessionError, WsProxy};
pub use voice::{SpeechToText, TextToSpeech};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
