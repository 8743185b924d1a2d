mod cli;

use anyhow::{Context, Result};
use cli::{Cli, Commands};
use image::RgbImage;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use mirrorcast::api::ApiClient;
use mirrorcast::audio::SegmentRecorder;
use mirrorcast::auth::Credentials;
use mirrorcast::captions::CaptionStore;
use mirrorcast::config::StreamConfig;
use mirrorcast::display::DisplayScheduler;
use mirrorcast::outbound::FrameSource;
use mirrorcast::session::{self, SessionEvent, SessionStatus};
use mirrorcast::{audio, outbound};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mirrorcast=info".into()),
        )
        .init();

    let cli = Cli::parse_args();
    match cli.command {
        Commands::Stream {
            server,
            api,
            credential,
            no_audio,
        } => {
            let config = StreamConfig {
                server_url: server,
                api_url: api,
                ..StreamConfig::default()
            };
            let token = match credential {
                Some(token) => token,
                None => prompt_token("Server access token: ").await?,
            };
            stream(config, token, no_audio).await
        }
        Commands::Check { server } => check(&server).await,
    }
}

/// One-shot connectivity probe.
async fn check(server: &str) -> Result<()> {
    info!("Connecting to {server}...");
    let (_ws, response) = tokio_tungstenite::connect_async(server)
        .await
        .context("Failed to reach the processing server")?;
    info!("Server reachable (HTTP {})", response.status());
    Ok(())
}

async fn stream(config: StreamConfig, token: String, no_audio: bool) -> Result<()> {
    let credentials = Credentials::new(Some(token));

    // Terminal failures (exhausted reconnection, prolonged silence) restart
    // the whole engine cold rather than trying to limp on.
    loop {
        match run_engine(config.clone(), credentials.clone(), no_audio).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                error!("Engine stopped: {e:#}");
                warn!("Cold restart in 3s");
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }
    }
}

async fn run_engine(config: StreamConfig, credentials: Credentials, no_audio: bool) -> Result<()> {
    let api = Arc::new(ApiClient::new(config.api_url.clone())?);
    let captions = Arc::new(Mutex::new(CaptionStore::new(config.caption_window)));

    let mut handle = session::open(config.clone(), credentials.clone());
    let cancel = handle.cancellation();

    // Outbound pipeline. Real deployments hand in a camera adapter; the
    // bundled source renders a synthetic test pattern.
    let source: Box<dyn FrameSource> = Box::new(TestPatternSource::new(640, 480));
    outbound::spawn(
        config.clone(),
        source,
        handle.outbound.clone(),
        handle.status_stream(),
        cancel.clone(),
    );

    // Audio cycle; a missing input device disables captions but nothing else.
    let _recorder = if no_audio {
        None
    } else {
        match SegmentRecorder::start() {
            Ok(recorder) => {
                audio::spawn_cycle(
                    config.clone(),
                    recorder.buffer(),
                    recorder.format(),
                    api.clone(),
                    credentials.clone(),
                    captions.clone(),
                    cancel.clone(),
                );
                Some(recorder)
            }
            Err(e) => {
                warn!("Audio capture unavailable, captions disabled: {e:#}");
                None
            }
        }
    };

    // Display refresh loop: drives the crossfade scheduler and the caption
    // purge at ~60 Hz, standing in for a compositor's vsync tick.
    let (scheduler, decoder) =
        DisplayScheduler::new(&config, config.frame_width, config.frame_height);
    let refresh_captions = captions.clone();
    let refresh_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut scheduler = scheduler;
        let mut tick = tokio::time::interval(Duration::from_millis(16));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = refresh_cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            let now = Instant::now();
            scheduler.tick(now);
            if let Ok(mut store) = refresh_captions.lock() {
                store.purge(now);
            }
        }
    });

    // Connection-status indicator + one prompt init per authenticated start.
    let mut status_rx = handle.status_stream();
    let status_api = api.clone();
    let status_creds = credentials.clone();
    let status_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut was_lost = false;
        loop {
            tokio::select! {
                _ = status_cancel.cancelled() => break,
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            let status = *status_rx.borrow_and_update();
            match status {
                SessionStatus::Connecting => {
                    info!(
                        "Status: {}",
                        if was_lost { "reconnecting" } else { "connecting" }
                    );
                }
                SessionStatus::Active => {
                    info!("Status: connected");
                    was_lost = true;
                    if let Some(token) = status_creds.token() {
                        let api = status_api.clone();
                        tokio::spawn(async move {
                            if let Err(e) = api.init_prompt(&token).await {
                                warn!("Prompt init failed (non-fatal): {e:#}");
                            }
                        });
                    }
                }
                _ => {}
            }
        }
    });

    // Host event loop.
    let outcome = loop {
        let Some(event) = handle.events.recv().await else {
            break Ok(());
        };
        match event {
            SessionEvent::FrameReceived(bytes) => decoder.submit(bytes),
            SessionEvent::ConnectionLost { attempt } => {
                info!("Connection lost (attempt {attempt})");
            }
            SessionEvent::Unauthorized => {
                warn!("Credential rejected by the server");
                match prompt_token("New server access token: ").await {
                    Ok(token) => credentials.supply(token),
                    Err(e) => break Err(e),
                }
            }
            SessionEvent::Fatal(e) => break Err(e.into()),
        }
    };

    handle.close().await;
    outcome
}

async fn prompt_token(prompt: &str) -> Result<String> {
    let prompt = prompt.to_string();
    tokio::task::spawn_blocking(move || {
        eprint!("{prompt}");
        let token = rpassword::read_password().context("Failed to read token")?;
        if token.trim().is_empty() {
            anyhow::bail!("Empty token");
        }
        Ok(token.trim().to_string())
    })
    .await
    .context("Prompt task failed")?
}

/// Synthetic capture source: a slowly drifting gradient, enough to exercise
/// the full pipeline without a camera.
struct TestPatternSource {
    width: u32,
    height: u32,
    frame: u64,
}

impl TestPatternSource {
    fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frame: 0,
        }
    }
}

impl FrameSource for TestPatternSource {
    fn current_frame(&mut self) -> Result<RgbImage> {
        self.frame += 1;
        let shift = (self.frame % 256) as u32;
        let image = RgbImage::from_fn(self.width, self.height, |x, y| {
            image::Rgb([
                ((x + shift) % 256) as u8,
                ((y + shift) % 256) as u8,
                ((x + y) % 256) as u8,
            ])
        });
        Ok(image)
    }
}
