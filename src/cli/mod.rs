use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "mirrorcast")]
#[command(about = "Real-time generative-mirror streaming client", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Stream frames to the processing server and display the results
    Stream {
        /// Processing server WebSocket URL
        #[arg(short, long, default_value = "ws://localhost:8765")]
        server: String,

        /// HTTP API base URL (transcription, prompt init)
        #[arg(short, long, default_value = "http://localhost:5556")]
        api: String,

        /// Access token; prompted for interactively when omitted
        #[arg(short, long)]
        credential: Option<String>,

        /// Disable the audio capture / caption cycle
        #[arg(long)]
        no_audio: bool,
    },

    /// Probe connectivity to the processing server and exit
    Check {
        /// Processing server WebSocket URL
        #[arg(short, long, default_value = "ws://localhost:8765")]
        server: String,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
