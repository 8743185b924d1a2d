//! Inbound frame buffer and display scheduler.
//!
//! Processed frames arrive as JPEG bytes at whatever rate the network allows.
//! Decoding happens off the tick path; decoded frames land in a bounded FIFO
//! queue and are presented by a crossfade between two alternating surfaces,
//! at a cadence decoupled from arrival.
//!
//! Single-writer discipline: only `DisplayScheduler::tick` mutates the queue
//! and the surfaces. The decode side only appends, through a channel.

use image::RgbaImage;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::config::StreamConfig;

/// A decoded frame waiting to be displayed.
pub struct InboundFrame {
    pub image: RgbaImage,
    pub arrived: Instant,
}

/// Bounded FIFO of decoded frames. Insertion order is arrival order; frames
/// may be dropped but never reordered.
pub struct FrameQueue {
    frames: VecDeque<InboundFrame>,
    capacity: usize,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a frame. At capacity the oldest entry is evicted, so the
    /// display favors current reality over a replay of backlog.
    pub fn push(&mut self, frame: InboundFrame) {
        if self.frames.len() >= self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    /// If the queue has grown past half capacity, discard the older half.
    /// Returns the number of frames dropped.
    pub fn overflow_skip(&mut self) -> usize {
        if self.frames.len() <= self.capacity / 2 {
            return 0;
        }
        let drop = self.frames.len() / 2;
        self.frames.drain(..drop);
        drop
    }

    pub fn pop_front(&mut self) -> Option<InboundFrame> {
        self.frames.pop_front()
    }

    pub fn front(&self) -> Option<&InboundFrame> {
        self.frames.front()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// One display surface: an image and its opacity.
pub struct Surface {
    pub image: Option<RgbaImage>,
    pub opacity: f32,
}

/// Two raster surfaces. Exactly one is "current" (on top) at any instant;
/// roles exchange by index swap, never by pixel copy.
pub struct SurfacePair {
    surfaces: [Surface; 2],
    current: usize,
}

impl SurfacePair {
    fn new() -> Self {
        Self {
            surfaces: [
                Surface {
                    image: None,
                    opacity: 1.0,
                },
                Surface {
                    image: None,
                    opacity: 1.0,
                },
            ],
            current: 0,
        }
    }

    /// The surface currently on top.
    pub fn current(&self) -> &Surface {
        &self.surfaces[self.current]
    }

    /// The surface being prepared underneath.
    pub fn next(&self) -> &Surface {
        &self.surfaces[1 - self.current]
    }

    fn current_mut(&mut self) -> &mut Surface {
        &mut self.surfaces[self.current]
    }

    fn next_mut(&mut self) -> &mut Surface {
        &mut self.surfaces[1 - self.current]
    }

    /// Exchange roles. The new current comes up fully opaque, so the visible
    /// composite never dips to black.
    fn swap(&mut self) {
        self.current = 1 - self.current;
        self.surfaces[self.current].opacity = 1.0;
    }
}

/// Submits raw frame bytes for asynchronous decoding. A failed decode drops
/// that single frame.
///
/// One long-lived task decodes submissions sequentially, off the tick path.
/// Frames reach the queue in submit order even when a small frame follows a
/// large one; the queue's own eviction is the only place frames are dropped.
#[derive(Clone)]
pub struct FrameDecoder {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl FrameDecoder {
    pub fn submit(&self, bytes: Vec<u8>) {
        let _ = self.tx.send(bytes);
    }
}

/// Runs until every `FrameDecoder` handle is dropped.
async fn decode_loop(
    mut raw_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    decoded_tx: mpsc::UnboundedSender<InboundFrame>,
) {
    while let Some(bytes) = raw_rx.recv().await {
        let decoded = tokio::task::spawn_blocking(move || image::load_from_memory(&bytes)).await;
        match decoded {
            Ok(Ok(img)) => {
                let frame = InboundFrame {
                    image: img.to_rgba8(),
                    arrived: Instant::now(),
                };
                if decoded_tx.send(frame).is_err() {
                    break;
                }
            }
            Ok(Err(e)) => debug!("Dropping undecodable frame: {e}"),
            Err(e) => debug!("Decode task failed: {e}"),
        }
    }
}

/// Drives the crossfade between the two surfaces, once per host refresh tick.
pub struct DisplayScheduler {
    queue: FrameQueue,
    pair: SurfacePair,
    decoded_rx: mpsc::UnboundedReceiver<InboundFrame>,
    transitioning: bool,
    fade_step: f32,
    display_duration: Duration,
    last_transition: Instant,
    surface_width: u32,
    surface_height: u32,
}

impl DisplayScheduler {
    /// Create a scheduler sized for the given target surface, plus the decode
    /// handle the session feeds with inbound binary frames.
    pub fn new(config: &StreamConfig, width: u32, height: u32) -> (Self, FrameDecoder) {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (decoded_tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(decode_loop(raw_rx, decoded_tx));
        let scheduler = Self {
            queue: FrameQueue::new(config.frame_buffer_capacity),
            pair: SurfacePair::new(),
            decoded_rx: rx,
            transitioning: false,
            fade_step: config.fade_step,
            display_duration: config.display_duration,
            last_transition: Instant::now(),
            surface_width: width,
            surface_height: height,
        };
        (scheduler, FrameDecoder { tx: raw_tx })
    }

    /// Run one iteration of the transition state machine. Call once per
    /// display-refresh tick.
    pub fn tick(&mut self, now: Instant) {
        // Absorb decode completions first; this is the queue's only writer.
        while let Ok(frame) = self.decoded_rx.try_recv() {
            self.queue.push(frame);
        }

        if self.transitioning {
            self.advance_fade();
            return;
        }

        if self.queue.is_empty() {
            return;
        }
        if now.duration_since(self.last_transition) < self.display_duration {
            return;
        }
        self.begin_transition();
        self.last_transition = now;
    }

    fn begin_transition(&mut self) {
        let dropped = self.queue.overflow_skip();
        if dropped > 0 {
            trace!("Overflow skip: dropped {dropped} stale frames");
        }
        let Some(head) = self.queue.front() else {
            return;
        };
        let drawn = cover_crop(&head.image, self.surface_width, self.surface_height);
        let next = self.pair.next_mut();
        next.image = Some(drawn);
        next.opacity = 1.0;
        self.transitioning = true;
    }

    fn advance_fade(&mut self) {
        let step = self.fade_step;
        let current = self.pair.current_mut();
        current.opacity -= step;
        if current.opacity > 0.0 {
            return;
        }
        // Fade complete: exchange roles and consume the displayed frame.
        self.pair.swap();
        self.queue.pop_front();
        self.transitioning = false;
    }

    pub fn is_transitioning(&self) -> bool {
        self.transitioning
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Surfaces for the host compositor: (top, underneath).
    pub fn surfaces(&self) -> (&Surface, &Surface) {
        (self.pair.current(), self.pair.next())
    }
}

/// Scale `src` to cover `width x height` preserving aspect ratio, then
/// center-crop. The result always fills the full target; nothing is
/// letterboxed.
pub fn cover_crop<P>(
    src: &image::ImageBuffer<P, Vec<P::Subpixel>>,
    width: u32,
    height: u32,
) -> image::ImageBuffer<P, Vec<P::Subpixel>>
where
    P: image::Pixel<Subpixel = u8> + 'static,
{
    let (sw, sh) = src.dimensions();
    if sw == 0 || sh == 0 || width == 0 || height == 0 {
        return image::ImageBuffer::new(width, height);
    }
    if (sw, sh) == (width, height) {
        return src.clone();
    }

    let scale = f64::max(width as f64 / sw as f64, height as f64 / sh as f64);
    let scaled_w = ((sw as f64 * scale).round() as u32).max(width);
    let scaled_h = ((sh as f64 * scale).round() as u32).max(height);

    let scaled = image::imageops::resize(
        src,
        scaled_w,
        scaled_h,
        image::imageops::FilterType::Triangle,
    );
    let x = (scaled_w - width) / 2;
    let y = (scaled_h - height) / 2;
    image::imageops::crop_imm(&scaled, x, y, width, height).to_image()
}
