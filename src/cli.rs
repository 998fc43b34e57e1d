//! CLI interface for stackchan-server

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use crate::config;
use crate::server::app::StackchanApp;
use crate::server::ws_proxy::SessionError;

#[derive(Parser)]
#[command(name = "stackchan-server")]
#[command(about = "WebSocket voice session server for the stackchan talking doll", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server with the built-in echo application
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8000")]
        port: u16,
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Enable HTTPS
        #[arg(long)]
        https: bool,
        /// Path to SSL certificate
        #[arg(long)]
        cert: Option<String>,
        /// Path to SSL private key
        #[arg(long)]
        key: Option<String>,
    },
    /// Show or change the configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
        /// Set the VOICEVOX speaker id
        #[arg(long)]
        set_speaker: Option<u32>,
        /// Set the VOICEVOX engine base URL
        #[arg(long)]
        set_tts_url: Option<String>,
        /// Set the recognition language code
        #[arg(long)]
        set_language: Option<String>,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve {
            port,
            host,
            https,
            cert,
            key,
        }) => serve(&host, port, https, cert, key).await,
        Some(Commands::Config {
            show,
            set_speaker,
            set_tts_url,
            set_language,
        }) => {
            let mut handled = false;
            if let Some(speaker) = set_speaker {
                config::set_speaker(speaker)?;
                handled = true;
            }
            if let Some(url) = set_tts_url {
                config::set_tts_url(&url)?;
                handled = true;
            }
            if let Some(language) = set_language {
                config::set_language(&language)?;
                handled = true;
            }
            if show || !handled {
                config::show_config()?;
            }
            Ok(())
        }
        None => serve("0.0.0.0", 8000, false, None, None).await,
    }
}

async fn serve(
    host: &str,
    port: u16,
    https: bool,
    cert: Option<String>,
    key: Option<String>,
) -> Result<()> {
    let app = echo_app();
    crate::server::start(app, host, port, https, cert, key).await
}

/// The reference application: repeat back whatever the device heard.
/// A talk session ends on silence or an unrecognized utterance.
fn echo_app() -> StackchanApp {
    StackchanApp::new()
        .on_setup(|_proxy| async move {
            info!("WebSocket connected");
            Ok::<(), SessionError>(())
        })
        .on_talk_session(|proxy| async move {
            loop {
                let text = match proxy.listen().await {
                    Ok(text) => text,
                    Err(SessionError::EmptyTranscript) | Err(SessionError::Timeout(_)) => {
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                };
                info!("heard: {}", text);
                proxy.speak(&text).await?;
            }
        })
}
