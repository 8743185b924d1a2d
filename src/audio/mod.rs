//! Audio capture cycle.
//!
//! A cpal input stream accumulates samples into the live segment. Every
//! `audio_interval` the cycle flushes the segment and starts the next with
//! no gap and no overlap, encodes the flushed samples as 16 kHz mono WAV,
//! and uploads them for transcription. Results feed the caption store. Each
//! segment's upload is independent: a slow or failed request never blocks
//! the next cycle.

use anyhow::Result;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, TranscribeOutcome};
use crate::auth::Credentials;
use crate::captions::CaptionStore;
use crate::config::StreamConfig;

/// Transcription uploads carry 16 kHz mono, matching what the server's
/// speech model expects.
const UPLOAD_SAMPLE_RATE: u32 = 16_000;

/// Shared sample accumulator between the cpal callback and the cycle task.
#[derive(Clone)]
pub struct SegmentBuffer {
    samples: Arc<Mutex<Vec<f32>>>,
}

impl SegmentBuffer {
    pub fn new() -> Self {
        Self {
            samples: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn append(&self, data: &[f32]) {
        if let Ok(mut buf) = self.samples.lock() {
            buf.extend_from_slice(data);
        }
    }

    /// Flush the live segment and start the next one. The swap is atomic
    /// under the lock, so consecutive segments neither overlap nor leave a
    /// gap in the sample timeline.
    pub fn take(&self) -> Vec<f32> {
        match self.samples.lock() {
            Ok(mut buf) => std::mem::take(&mut *buf),
            Err(_) => Vec::new(),
        }
    }
}

impl Default for SegmentBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Format of the raw samples a `SegmentBuffer` holds.
#[derive(Debug, Clone, Copy)]
pub struct SegmentFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Owns the cpal input stream. Keep it alive for as long as recording should
/// continue; dropping it stops capture.
pub struct SegmentRecorder {
    buffer: SegmentBuffer,
    format: SegmentFormat,
    _stream: cpal::Stream,
}

impl SegmentRecorder {
    /// Start recording from the default input device.
    pub fn start() -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| anyhow::anyhow!("No audio input device found"))?;
        let default_config = device
            .default_input_config()
            .map_err(|e| anyhow::anyhow!("No default input config: {}", e))?;

        let format = SegmentFormat {
            sample_rate: default_config.sample_rate().0,
            channels: default_config.channels(),
        };
        let config = cpal::StreamConfig {
            channels: format.channels,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let buffer = SegmentBuffer::new();
        let callback_buffer = buffer.clone();
        let stream = device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                callback_buffer.append(data);
            },
            |err| {
                warn!("Audio capture error: {err}");
            },
            None,
        )?;
        stream.play()?;

        info!(
            "Recording audio at {} Hz, {} channel(s)",
            format.sample_rate, format.channels
        );
        Ok(Self {
            buffer,
            format,
            _stream: stream,
        })
    }

    pub fn buffer(&self) -> SegmentBuffer {
        self.buffer.clone()
    }

    pub fn format(&self) -> SegmentFormat {
        self.format
    }
}

/// Spawn the record/upload/transcribe loop. Stops when `cancel` fires;
/// teardown also stops the per-segment timer, so no cycle outlives the
/// session it belongs to.
pub fn spawn_cycle(
    config: StreamConfig,
    buffer: SegmentBuffer,
    format: SegmentFormat,
    api: Arc<ApiClient>,
    credentials: Credentials,
    captions: Arc<Mutex<CaptionStore>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(config.audio_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick fires immediately; skip it so the first segment is
        // a full interval long
        tick.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }

            let samples = buffer.take();
            if samples.is_empty() {
                continue;
            }

            let Some(token) = credentials.token() else {
                // Unauthenticated: the segment is discarded, not queued.
                debug!("Dropping audio segment, no credential");
                continue;
            };

            let api = api.clone();
            let credentials = credentials.clone();
            let captions = captions.clone();
            tokio::spawn(async move {
                let wav = match tokio::task::spawn_blocking(move || {
                    segment_to_wav(&samples, format)
                })
                .await
                {
                    Ok(Ok(wav)) => wav,
                    Ok(Err(e)) => {
                        warn!("Segment encode failed: {e:#}");
                        return;
                    }
                    Err(e) => {
                        warn!("Segment encode task failed: {e}");
                        return;
                    }
                };

                match api.transcribe(&token, wav).await {
                    Ok(outcome) => apply_outcome(outcome, &credentials, &captions),
                    Err(e) => {
                        // Soft failure: log and move on; the next segment
                        // gets its own chance.
                        warn!("Transcription upload failed: {e:#}");
                    }
                }
            });
        }
    })
}

fn apply_outcome(
    outcome: TranscribeOutcome,
    credentials: &Credentials,
    captions: &Arc<Mutex<CaptionStore>>,
) {
    match outcome {
        TranscribeOutcome::Text(text) => {
            info!("Transcribed: {text:?}");
            if let Ok(mut store) = captions.lock() {
                store.push(text);
            }
        }
        TranscribeOutcome::Empty => {}
        TranscribeOutcome::Unauthorized => {
            warn!("Transcription rejected with 401; credential invalidated");
            credentials.invalidate();
        }
    }
}

/// Encode one segment as a 16 kHz mono 16-bit WAV.
fn segment_to_wav(samples: &[f32], format: SegmentFormat) -> Result<Vec<u8>> {
    let mono = downmix(samples, format.channels);
    let resampled = if format.sample_rate == UPLOAD_SAMPLE_RATE {
        mono
    } else {
        let target_len =
            (mono.len() as u64 * UPLOAD_SAMPLE_RATE as u64 / format.sample_rate as u64) as usize;
        linear_resample(&mono, format.sample_rate, UPLOAD_SAMPLE_RATE, target_len)
    };

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: UPLOAD_SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
    for sample in resampled {
        let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        writer.write_sample(value)?;
    }
    writer.finalize()?;
    Ok(cursor.into_inner())
}

/// Average interleaved channels down to mono.
fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels as usize)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Linear-interpolation resampler.
fn linear_resample(input: &[f32], from_rate: u32, to_rate: u32, output_len: usize) -> Vec<f32> {
    if input.is_empty() {
        return vec![0.0; output_len];
    }
    let ratio = from_rate as f64 / to_rate as f64;
    (0..output_len)
        .map(|i| {
            let src_pos = i as f64 * ratio;
            let idx = src_pos as usize;
            let frac = src_pos - idx as f64;
            let a = input.get(idx).copied().unwrap_or(0.0);
            let b = input.get(idx + 1).copied().unwrap_or(a);
            a + (b - a) * frac as f32
        })
        .collect()
}
