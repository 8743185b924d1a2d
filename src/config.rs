//! Stream profile configuration.
//!
//! One structure covers every tunable of the pipeline: raster size, cadence,
//! buffering, crossfade, heartbeat and backoff timing. The upstream server
//! rate-limits inbound frames to roughly one per `frame_interval`, so the
//! defaults here match its deployment constants.

use serde::Deserialize;
use std::time::Duration;

/// Full configuration for one streaming session.
///
/// All durations are expressed in milliseconds when deserialized.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// WebSocket endpoint of the processing server.
    pub server_url: String,
    /// Base URL of the HTTP API (transcription, prompt init).
    pub api_url: String,

    /// Width of the outbound raster sent to the server.
    pub frame_width: u32,
    /// Height of the outbound raster.
    pub frame_height: u32,
    /// JPEG quality (1-100) for outbound frames.
    pub jpeg_quality: u8,
    /// Minimum time between two outbound frames.
    #[serde(with = "millis")]
    pub frame_interval: Duration,

    /// Inbound frame queue capacity.
    pub frame_buffer_capacity: usize,
    /// Minimum dwell time of a displayed frame. Zero means transitions start
    /// as soon as the previous one completes and a frame is queued.
    #[serde(with = "millis")]
    pub display_duration: Duration,
    /// Opacity decrement applied to the fading surface each refresh tick.
    pub fade_step: f32,

    /// Heartbeat ping cadence while the session is active.
    #[serde(with = "millis")]
    pub ping_interval: Duration,
    /// Watchdog check cadence.
    #[serde(with = "millis")]
    pub health_check_interval: Duration,
    /// Force-close the connection when nothing has been seen for this long.
    #[serde(with = "millis")]
    pub stale_after: Duration,
    /// Escalate to a terminal restart when no processed frame has arrived
    /// for this long, regardless of reconnection state.
    #[serde(with = "millis")]
    pub max_no_update: Duration,

    /// First reconnection delay; doubles per consecutive failure.
    #[serde(with = "millis")]
    pub initial_reconnect_delay: Duration,
    /// Reconnection delay cap.
    #[serde(with = "millis")]
    pub max_reconnect_delay: Duration,
    /// Consecutive failures tolerated before giving up.
    pub max_reconnect_attempts: u32,
    /// A close this soon after the auth message is treated as a credential
    /// rejection rather than a transient drop.
    #[serde(with = "millis")]
    pub auth_grace: Duration,

    /// Length of one recorded audio segment.
    #[serde(with = "millis")]
    pub audio_interval: Duration,
    /// How long a caption entry stays in the live set.
    #[serde(with = "millis")]
    pub caption_window: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8765".to_string(),
            api_url: "http://localhost:5556".to_string(),
            frame_width: 512,
            frame_height: 512,
            jpeg_quality: 80,
            frame_interval: Duration::from_millis(250),
            frame_buffer_capacity: 16,
            display_duration: Duration::ZERO,
            fade_step: 0.1,
            ping_interval: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(60),
            max_no_update: Duration::from_secs(120),
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            max_reconnect_attempts: 10,
            auth_grace: Duration::from_secs(2),
            audio_interval: Duration::from_secs(10),
            caption_window: Duration::from_secs(15),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}
