//! Outbound capture pipeline.
//!
//! Samples the host's capture source at a fixed cadence, rasterizes to the
//! profile's fixed dimensions, JPEG-compresses, and hands the bytes to the
//! session. Frames are never queued: if the transport is busy or the session
//! is not active, the frame is dropped and the next tick sends fresher
//! pixels instead.

use anyhow::Result;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::io::Cursor;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::config::StreamConfig;
use crate::display::cover_crop;
use crate::session::SessionStatus;

/// One encoded frame on its way out. Transient; consumed immediately by the
/// transport or dropped.
pub struct OutboundFrame {
    pub jpeg: Vec<u8>,
    pub captured: Instant,
}

/// Live capture feed, owned by the host. Device selection and enumeration
/// happen outside the core.
pub trait FrameSource: Send {
    /// The most recent frame available right now.
    fn current_frame(&mut self) -> Result<RgbImage>;
}

/// Spawn the capture/transmit loop. It stops when `cancel` fires.
pub fn spawn(
    config: StreamConfig,
    source: Box<dyn FrameSource>,
    frame_tx: mpsc::Sender<OutboundFrame>,
    status_rx: watch::Receiver<SessionStatus>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run(config, source, frame_tx, status_rx, cancel))
}

async fn run(
    config: StreamConfig,
    mut source: Box<dyn FrameSource>,
    frame_tx: mpsc::Sender<OutboundFrame>,
    status_rx: watch::Receiver<SessionStatus>,
    cancel: CancellationToken,
) {
    // Tick at twice the frame rate so send times don't drift a full interval
    // out of phase; the freshness check below enforces the real cadence.
    let mut tick = tokio::time::interval(config.frame_interval / 2);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_sent: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }

        if *status_rx.borrow() != SessionStatus::Active {
            continue;
        }
        let now = Instant::now();
        if !frame_due(last_sent, now, config.frame_interval) {
            continue;
        }

        let raw = match source.current_frame() {
            Ok(frame) => frame,
            Err(e) => {
                // Capture trouble is the host's to resolve; the session and
                // audio cycle keep running without us.
                warn!("Capture source unavailable: {e:#}");
                continue;
            }
        };

        let raster = cover_crop(&raw, config.frame_width, config.frame_height);
        let jpeg = match jpeg_encode(&raster, config.jpeg_quality) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Frame encode failed: {e:#}");
                continue;
            }
        };

        match frame_tx.try_send(OutboundFrame {
            jpeg,
            captured: now,
        }) {
            Ok(()) => last_sent = Some(now),
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Transport still busy with the previous frame; the next
                // tick will capture fresher pixels.
                trace!("Outbound slot full, dropping frame");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }
}

/// True once a full frame interval has passed since the last send.
fn frame_due(last_sent: Option<Instant>, now: Instant, interval: Duration) -> bool {
    match last_sent {
        None => true,
        Some(t) => now.duration_since(t) >= interval,
    }
}

/// JPEG-encode an RGB raster at the given quality.
fn jpeg_encode(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    image
        .write_with_encoder(encoder)
        .map_err(|e| anyhow::anyhow!("JPEG encode failed: {}", e))?;
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_frame_is_always_due() {
        assert!(frame_due(None, Instant::now(), Duration::from_millis(250)));
    }

    #[test]
    fn cadence_is_enforced_between_sends() {
        let interval = Duration::from_millis(250);
        let t0 = Instant::now();
        // the half-interval oversampling tick must be skipped
        assert!(!frame_due(Some(t0), t0 + Duration::from_millis(125), interval));
        assert!(frame_due(Some(t0), t0 + Duration::from_millis(250), interval));
        assert!(frame_due(Some(t0), t0 + Duration::from_secs(10), interval));
    }

    #[test]
    fn encoded_frame_is_a_jpeg() {
        let mut img = RgbImage::new(32, 32);
        for p in img.pixels_mut() {
            *p = image::Rgb([120, 40, 200]);
        }
        let bytes = jpeg_encode(&img, 80).unwrap();
        // SOI marker
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!(decoded.width(), 32);
    }

    #[test]
    fn raster_is_fixed_size_regardless_of_source_shape() {
        let wide = RgbImage::new(640, 360);
        let out = cover_crop(&wide, 512, 512);
        assert_eq!(out.dimensions(), (512, 512));

        let tall = RgbImage::new(360, 640);
        let out = cover_crop(&tall, 512, 512);
        assert_eq!(out.dimensions(), (512, 512));
    }
}
