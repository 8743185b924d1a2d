//! Session manager.
//!
//! Owns the duplex connection to the processing server: authentication
//! handshake, heartbeat, staleness watchdog, and reconnection with
//! exponential backoff. Everything the rest of the client needs to know
//! arrives either on the status watch channel or the event stream.
//!
//! The server is trusted to close the connection on a bad credential rather
//! than send a rejection message, so the handshake moves to Active
//! optimistically; a close landing inside the auth grace window is read as
//! the de facto rejection signal.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::Credentials;
use crate::config::StreamConfig;
use crate::outbound::OutboundFrame;
use crate::protocol::ControlMessage;

/// Connection lifecycle states, published on a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Connecting,
    Authenticating,
    Active,
    Closing,
    Failed,
}

/// Conditions the session cannot recover from locally. The host reacts with
/// a cold restart of the engine.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("gave up reconnecting after {attempts} consecutive failures")]
    ReconnectExhausted { attempts: u32 },
    #[error("no processed frame received for {since:?}")]
    NoFramesReceived { since: Duration },
}

/// Events emitted to the host while the session runs.
#[derive(Debug)]
pub enum SessionEvent {
    /// One complete encoded image from the server.
    FrameReceived(Vec<u8>),
    /// The connection dropped; reconnection is scheduled. `attempt` counts
    /// consecutive failures since the last successful open.
    ConnectionLost { attempt: u32 },
    /// The credential was rejected and has been invalidated; the host must
    /// re-authenticate before the session resumes.
    Unauthorized,
    Fatal(FatalError),
}

/// Handle to a running session.
pub struct SessionHandle {
    /// Single-slot lane for outbound frames; `try_send` only, never queue.
    pub outbound: mpsc::Sender<OutboundFrame>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    status_rx: watch::Receiver<SessionStatus>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn status(&self) -> SessionStatus {
        *self.status_rx.borrow()
    }

    /// Watch stream of status transitions for the connection indicator.
    pub fn status_stream(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    /// Child token that dies with the session; companion tasks (outbound
    /// pipeline, audio cycle) hang their teardown on it.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Tear the session down. All connection timers stop with the task.
    pub async fn close(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Open a session: spawns the connection task and returns its handle.
pub fn open(config: StreamConfig, credentials: Credentials) -> SessionHandle {
    let (status_tx, status_rx) = watch::channel(SessionStatus::Idle);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::channel(1);
    let cancel = CancellationToken::new();

    let task = tokio::spawn(run(
        config,
        credentials,
        status_tx,
        event_tx,
        outbound_rx,
        cancel.clone(),
    ));

    SessionHandle {
        outbound: outbound_tx,
        events: event_rx,
        status_rx,
        cancel,
        task,
    }
}

/// Backoff delay before reconnect attempt `attempt` (0-based):
/// `min(initial * 2^attempt, max)`.
pub fn reconnect_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    if attempt >= 32 {
        return max;
    }
    initial.saturating_mul(1u32 << attempt).min(max)
}

enum ConnectionEnd {
    /// Socket closed or errored after a (presumed) successful auth.
    Dropped,
    /// Socket closed within the auth grace window: credential rejected.
    AuthRejected,
    /// `close()` was called.
    Cancelled,
    /// Absolute no-frames guard tripped.
    NoFrames(Duration),
}

async fn run(
    config: StreamConfig,
    credentials: Credentials,
    status_tx: watch::Sender<SessionStatus>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    mut outbound_rx: mpsc::Receiver<OutboundFrame>,
    cancel: CancellationToken,
) {
    let mut creds_watch = credentials.clone();
    let mut attempt: u32 = 0;
    // Baseline for the absolute staleness guard; survives reconnects.
    let mut last_frame = Instant::now();

    loop {
        if cancel.is_cancelled() {
            set_status(&status_tx, SessionStatus::Closing);
            return;
        }

        let Some(token) = credentials.token() else {
            // No credential: hold in Idle until the host supplies one.
            set_status(&status_tx, SessionStatus::Idle);
            tokio::select! {
                _ = cancel.cancelled() => {
                    set_status(&status_tx, SessionStatus::Closing);
                    return;
                }
                _ = creds_watch.changed() => {}
            }
            continue;
        };

        set_status(&status_tx, SessionStatus::Connecting);
        let end = run_connection(
            &config,
            &token,
            &status_tx,
            &event_tx,
            &mut outbound_rx,
            &mut attempt,
            &mut last_frame,
            &cancel,
        )
        .await;

        match end {
            Ok(ConnectionEnd::Cancelled) => {
                set_status(&status_tx, SessionStatus::Closing);
                return;
            }
            Ok(ConnectionEnd::AuthRejected) => {
                warn!("Server closed the connection during the auth grace window; credential invalidated");
                credentials.invalidate();
                attempt = 0;
                let _ = event_tx.send(SessionEvent::Unauthorized);
                continue;
            }
            Ok(ConnectionEnd::NoFrames(since)) => {
                set_status(&status_tx, SessionStatus::Failed);
                let _ = event_tx.send(SessionEvent::Fatal(FatalError::NoFramesReceived { since }));
                return;
            }
            Ok(ConnectionEnd::Dropped) => {
                debug!("Connection dropped");
            }
            Err(e) => {
                debug!("Connection attempt failed: {e:#}");
            }
        }

        if cancel.is_cancelled() {
            set_status(&status_tx, SessionStatus::Closing);
            return;
        }

        // The absolute guard is re-checked here as well: a connection that
        // opens (resetting the attempt counter) and drops before its first
        // health tick would otherwise never be measured against it.
        let frame_age = last_frame.elapsed();
        if frame_age > config.max_no_update {
            set_status(&status_tx, SessionStatus::Failed);
            let _ = event_tx.send(SessionEvent::Fatal(FatalError::NoFramesReceived {
                since: frame_age,
            }));
            return;
        }

        let delay = reconnect_delay(
            attempt,
            config.initial_reconnect_delay,
            config.max_reconnect_delay,
        );
        attempt += 1;
        let _ = event_tx.send(SessionEvent::ConnectionLost { attempt });

        if attempt >= config.max_reconnect_attempts {
            set_status(&status_tx, SessionStatus::Failed);
            let _ = event_tx.send(SessionEvent::Fatal(FatalError::ReconnectExhausted {
                attempts: attempt,
            }));
            return;
        }

        info!("Reconnecting in {delay:?} (attempt {attempt})");
        tokio::select! {
            _ = cancel.cancelled() => {
                set_status(&status_tx, SessionStatus::Closing);
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_connection(
    config: &StreamConfig,
    token: &str,
    status_tx: &watch::Sender<SessionStatus>,
    event_tx: &mpsc::UnboundedSender<SessionEvent>,
    outbound_rx: &mut mpsc::Receiver<OutboundFrame>,
    attempt: &mut u32,
    last_frame: &mut Instant,
    cancel: &CancellationToken,
) -> Result<ConnectionEnd> {
    let (ws_stream, _) = connect_async(&config.server_url)
        .await
        .context("Failed to connect to server")?;
    *attempt = 0;

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    set_status(status_tx, SessionStatus::Authenticating);
    let auth = ControlMessage::Auth {
        credential: token.to_string(),
    };
    ws_sender
        .send(WsMessage::Text(auth.to_json()))
        .await
        .context("Failed to send auth message")?;
    let auth_sent = Instant::now();

    // Optimistic: the server closes on a bad credential instead of replying.
    set_status(status_tx, SessionStatus::Active);
    info!("Session active");

    // Discard anything captured while disconnected; outbound always reflects
    // "now", never backlog.
    while outbound_rx.try_recv().is_ok() {}

    // Connection-scoped timers; dropping them on return is what guarantees
    // nothing fires across reconnect cycles.
    let start = tokio::time::Instant::now();
    let mut ping = tokio::time::interval_at(start + config.ping_interval, config.ping_interval);
    let mut health = tokio::time::interval_at(
        start + config.health_check_interval,
        config.health_check_interval,
    );
    let mut last_seen = Instant::now();

    let end_on_close = |auth_sent: Instant| {
        if auth_sent.elapsed() <= config.auth_grace {
            ConnectionEnd::AuthRejected
        } else {
            ConnectionEnd::Dropped
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_sender.send(WsMessage::Close(None)).await;
                return Ok(ConnectionEnd::Cancelled);
            }
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(WsMessage::Binary(bytes))) => {
                        let now = Instant::now();
                        last_seen = now;
                        *last_frame = now;
                        let _ = event_tx.send(SessionEvent::FrameReceived(bytes));
                    }
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Some(ControlMessage::Pong) = ControlMessage::parse(&text) {
                            last_seen = Instant::now();
                        }
                    }
                    Some(Ok(WsMessage::Pong(_))) | Some(Ok(WsMessage::Ping(_))) => {
                        last_seen = Instant::now();
                    }
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => {
                        return Ok(end_on_close(auth_sent));
                    }
                    _ => {}
                }
            }
            Some(frame) = outbound_rx.recv() => {
                if ws_sender.send(WsMessage::Binary(frame.jpeg)).await.is_err() {
                    return Ok(end_on_close(auth_sent));
                }
            }
            _ = ping.tick() => {
                let ping_msg = ControlMessage::Ping.to_json();
                if ws_sender.send(WsMessage::Text(ping_msg)).await.is_err() {
                    return Ok(end_on_close(auth_sent));
                }
            }
            _ = health.tick() => {
                if last_seen.elapsed() > config.stale_after {
                    // A silently stalled connection is as dead as a closed
                    // one; force the reconnect path.
                    warn!("No data for {:?}, force-closing stale connection", last_seen.elapsed());
                    let _ = ws_sender.send(WsMessage::Close(None)).await;
                    return Ok(ConnectionEnd::Dropped);
                }
                let frame_age = last_frame.elapsed();
                if frame_age > config.max_no_update {
                    return Ok(ConnectionEnd::NoFrames(frame_age));
                }
            }
        }
    }
}

fn set_status(tx: &watch::Sender<SessionStatus>, status: SessionStatus) {
    let previous = tx.send_replace(status);
    if previous != status {
        debug!("Session status: {previous:?} -> {status:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::{accept_async, WebSocketStream};

    fn test_config(url: String) -> StreamConfig {
        StreamConfig {
            server_url: url,
            ping_interval: Duration::from_millis(50),
            health_check_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(5),
            max_no_update: Duration::from_secs(60),
            initial_reconnect_delay: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_millis(40),
            max_reconnect_attempts: 5,
            auth_grace: Duration::ZERO,
            ..StreamConfig::default()
        }
    }

    async fn local_server() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    async fn accept_one(listener: &TcpListener) -> WebSocketStream<TcpStream> {
        let (stream, _) = listener.accept().await.unwrap();
        accept_async(stream).await.unwrap()
    }

    async fn next_event(handle: &mut SessionHandle) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), handle.events.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("event channel closed")
    }

    #[test]
    fn backoff_sequence_doubles_to_cap() {
        let initial = Duration::from_secs(1);
        let max = Duration::from_secs(30);
        let delays: Vec<u64> = (0..7)
            .map(|k| reconnect_delay(k, initial, max).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        // absurdly large attempts stay capped
        assert_eq!(reconnect_delay(64, initial, max), max);
    }

    #[tokio::test]
    async fn handshake_sends_auth_then_heartbeats() {
        let (listener, url) = local_server().await;
        let creds = Credentials::new(Some("tok-abc".into()));
        let mut handle = open(test_config(url), creds);

        let mut server = accept_one(&listener).await;
        let first = server.next().await.unwrap().unwrap();
        assert_eq!(
            first.into_text().unwrap(),
            r#"{"type":"auth","credential":"tok-abc"}"#
        );

        // ping cadence is 50ms; the next text frame must be a ping
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), server.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let WsMessage::Text(text) = msg {
                assert_eq!(ControlMessage::parse(&text), Some(ControlMessage::Ping));
                break;
            }
        }

        // a binary frame from the server surfaces as FrameReceived
        server
            .send(WsMessage::Binary(vec![0xFF, 0xD8, 0x01]))
            .await
            .unwrap();
        loop {
            match next_event(&mut handle).await {
                SessionEvent::FrameReceived(bytes) => {
                    assert_eq!(bytes, vec![0xFF, 0xD8, 0x01]);
                    break;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }

        assert_eq!(handle.status(), SessionStatus::Active);
        handle.close().await;
    }

    #[tokio::test]
    async fn watchdog_closes_stale_connection_and_schedules_reconnect() {
        let (listener, url) = local_server().await;
        let mut config = test_config(url);
        config.ping_interval = Duration::from_secs(60);
        config.health_check_interval = Duration::from_millis(40);
        config.stale_after = Duration::from_millis(40);

        let creds = Credentials::new(Some("tok".into()));
        let mut handle = open(config, creds);

        // First connection: accept, read auth, then stay silent.
        let mut server = accept_one(&listener).await;
        let _auth = server.next().await.unwrap().unwrap();

        match next_event(&mut handle).await {
            SessionEvent::ConnectionLost { attempt } => assert_eq!(attempt, 1),
            other => panic!("unexpected event: {other:?}"),
        }

        // The client must come back on its own.
        let second = tokio::time::timeout(Duration::from_secs(5), accept_one(&listener))
            .await
            .expect("no reconnection attempt");
        drop(second);
        handle.close().await;
    }

    #[tokio::test]
    async fn close_during_auth_grace_invalidates_credential() {
        let (listener, url) = local_server().await;
        let mut config = test_config(url);
        config.auth_grace = Duration::from_millis(500);

        let creds = Credentials::new(Some("bad-token".into()));
        let mut handle = open(config, creds.clone());

        let mut server = accept_one(&listener).await;
        let _auth = server.next().await.unwrap().unwrap();
        server.close(None).await.unwrap();

        match next_event(&mut handle).await {
            SessionEvent::Unauthorized => {}
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(creds.token(), None);

        // No retry with the stale credential: nothing connects until the
        // host supplies a new token.
        let no_retry =
            tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(no_retry.is_err());

        creds.supply("fresh-token".into());
        let mut server = tokio::time::timeout(Duration::from_secs(5), accept_one(&listener))
            .await
            .expect("no reconnect after new credential");
        let auth = server.next().await.unwrap().unwrap().into_text().unwrap();
        assert!(auth.contains("fresh-token"));

        handle.close().await;
    }

    #[tokio::test]
    async fn no_frames_guard_trips_across_reconnect_cycles() {
        let (listener, url) = local_server().await;
        let mut config = test_config(url);
        config.max_no_update = Duration::from_millis(100);
        config.initial_reconnect_delay = Duration::from_millis(1);
        config.max_reconnect_delay = Duration::from_millis(4);

        // A server that accepts every connection and drops it right after
        // the handshake keeps resetting the attempt counter; only the
        // absolute no-frames guard can end this.
        let server = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                if let Ok(mut ws) = accept_async(stream).await {
                    let _ = ws.next().await; // auth
                    let _ = ws.close(None).await;
                }
            }
        });

        let mut handle = open(config, Credentials::new(Some("tok".into())));
        loop {
            match next_event(&mut handle).await {
                SessionEvent::ConnectionLost { .. } => {}
                SessionEvent::Fatal(FatalError::NoFramesReceived { since }) => {
                    assert!(since >= Duration::from_millis(100));
                    break;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(handle.status(), SessionStatus::Failed);
        server.abort();
        handle.close().await;
    }

    #[tokio::test]
    async fn reconnect_exhaustion_escalates_to_fatal() {
        // Bind then drop to get a port nothing is listening on.
        let (listener, url) = local_server().await;
        drop(listener);

        let mut config = test_config(url);
        config.max_reconnect_attempts = 3;
        config.initial_reconnect_delay = Duration::from_millis(1);
        config.max_reconnect_delay = Duration::from_millis(4);

        let mut handle = open(config, Credentials::new(Some("tok".into())));

        let mut lost = 0;
        loop {
            match next_event(&mut handle).await {
                SessionEvent::ConnectionLost { attempt } => {
                    lost += 1;
                    assert_eq!(attempt, lost);
                }
                SessionEvent::Fatal(FatalError::ReconnectExhausted { attempts }) => {
                    assert_eq!(attempts, 3);
                    break;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(handle.status(), SessionStatus::Failed);
        handle.close().await;
    }
}
