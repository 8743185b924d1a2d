//! Real-time generative-mirror streaming client.
//!
//! Captures a live video feed, streams JPEG frames to a processing server
//! over a persistent WebSocket, and crossfades the processed frames it gets
//! back while the connection heals itself through drops. A parallel audio
//! cycle records short segments, uploads them for transcription, and keeps a
//! time-decaying caption overlay.
//!
//! The session engine ([`session`]) is the heart: handshake, heartbeat,
//! staleness watchdog, and bounded-backoff reconnection. [`outbound`] and
//! [`display`] are the two ends of the frame pipeline; [`audio`] and
//! [`captions`] form the transcription side channel.

pub mod api;
pub mod audio;
pub mod auth;
pub mod captions;
pub mod config;
pub mod display;
pub mod outbound;
pub mod protocol;
pub mod session;
