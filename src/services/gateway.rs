//! Stream Gateway - WebSocket fan-out of the live and predicted channels
//!
//! One `ClientSession` per connection. After the handshake the session opens
//! its own subscription on each channel and runs two relay tasks plus a
//! reader that watches for the client going away. The first of the three to
//! finish wins: the session flips to Closing, the losers are aborted, and
//! teardown (drop both subscriptions, close the socket) runs exactly once.
//! A broken upstream therefore never leaves a client connection silently
//! half-alive, and a gone client never leaves subscriptions dangling.

use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::bus::{Bus, BusSubscription};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Which channel a relay task serves, for logs and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayChannel {
    Live,
    Forecast,
}

impl RelayChannel {
    fn as_str(&self) -> &'static str {
        match self {
            RelayChannel::Live => "live",
            RelayChannel::Forecast => "forecast",
        }
    }
}

/// Client session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Connecting,
    Accepted,
    Relaying,
    Closing,
    Closed,
}

impl SessionState {
    fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Accepted => "accepted",
            SessionState::Relaying => "relaying",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

/// Why a session left the Relaying state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionOutcome {
    LiveEnded,
    ForecastEnded,
    ClientDisconnected,
    SubscribeFailed,
}

impl SessionOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            SessionOutcome::LiveEnded => "live_ended",
            SessionOutcome::ForecastEnded => "forecast_ended",
            SessionOutcome::ClientDisconnected => "client_disconnected",
            SessionOutcome::SubscribeFailed => "subscribe_failed",
        }
    }
}

/// Bind the gateway listener and run the accept loop
pub async fn start_gateway(
    config: &Config,
    bus: Arc<dyn Bus>,
    metrics: Arc<Metrics>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = format!("{}:{}", config.gateway_bind_address(), config.gateway_port());
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "gateway_started");

    run_accept_loop(listener, config.clone(), bus, metrics, shutdown).await;
    Ok(())
}

/// Accept loop over an already-bound listener (tests bind an ephemeral port)
pub async fn run_accept_loop(
    listener: TcpListener,
    config: Config,
    bus: Arc<dyn Bus>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("gateway_shutdown");
                    return;
                }
            }
            result = listener.accept() => {
                match result {
                    Ok((socket, addr)) => {
                        let session = ClientSession::new(&config, bus.clone(), metrics.clone());
                        tokio::spawn(async move {
                            session.run(socket, addr).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "gateway_accept_failed");
                    }
                }
            }
        }
    }
}

/// One connected client: two subscription handles, one socket, no state
/// shared with other sessions.
struct ClientSession {
    id: String,
    state: SessionState,
    live_channel: String,
    predicted_channel: String,
    relay_poll_timeout: Duration,
    bus: Arc<dyn Bus>,
    metrics: Arc<Metrics>,
}

impl ClientSession {
    fn new(config: &Config, bus: Arc<dyn Bus>, metrics: Arc<Metrics>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            state: SessionState::Connecting,
            live_channel: config.live_channel().to_string(),
            predicted_channel: config.predicted_channel().to_string(),
            relay_poll_timeout: Duration::from_millis(config.relay_poll_timeout_ms()),
            bus,
            metrics,
        }
    }

    fn set_state(&mut self, next: SessionState) {
        debug!(session = %self.id, from = %self.state.as_str(), to = %next.as_str(), "session_state");
        self.state = next;
    }

    async fn run(mut self, socket: TcpStream, addr: SocketAddr) {
        let ws = match tokio_tungstenite::accept_async(socket).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(session = %self.id, peer = %addr, error = %e, "session_handshake_failed");
                return;
            }
        };

        self.set_state(SessionState::Accepted);
        self.metrics.record_session_opened();
        info!(session = %self.id, peer = %addr, "session_accepted");

        let outcome = self.relay(ws).await;

        self.set_state(SessionState::Closed);
        self.metrics.record_session_closed();
        info!(session = %self.id, peer = %addr, outcome = %outcome.as_str(), "session_closed");
    }

    async fn relay(&mut self, mut ws: WebSocketStream<TcpStream>) -> SessionOutcome {
        let live_sub = match self.bus.subscribe(&self.live_channel).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!(session = %self.id, channel = %self.live_channel, error = %e, "session_subscribe_failed");
                self.set_state(SessionState::Closing);
                let _ = ws.close(None).await;
                return SessionOutcome::SubscribeFailed;
            }
        };
        let forecast_sub = match self.bus.subscribe(&self.predicted_channel).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!(session = %self.id, channel = %self.predicted_channel, error = %e, "session_subscribe_failed");
                self.set_state(SessionState::Closing);
                let _ = ws.close(None).await;
                return SessionOutcome::SubscribeFailed;
            }
        };

        let (sink, source) = ws.split();
        let sink = Arc::new(Mutex::new(sink));

        self.set_state(SessionState::Relaying);

        let mut live_task = tokio::spawn(relay_task(
            live_sub,
            sink.clone(),
            RelayChannel::Live,
            self.relay_poll_timeout,
            self.metrics.clone(),
            self.id.clone(),
        ));
        let mut forecast_task = tokio::spawn(relay_task(
            forecast_sub,
            sink.clone(),
            RelayChannel::Forecast,
            self.relay_poll_timeout,
            self.metrics.clone(),
            self.id.clone(),
        ));
        let mut reader_task = tokio::spawn(drain_client(source, self.id.clone()));

        // First-completion-wins: the session does not wait for both streams.
        let outcome = tokio::select! {
            _ = &mut live_task => SessionOutcome::LiveEnded,
            _ = &mut forecast_task => SessionOutcome::ForecastEnded,
            _ = &mut reader_task => SessionOutcome::ClientDisconnected,
        };
        self.set_state(SessionState::Closing);

        // Cancel the losers; the subscription handles live inside the relay
        // tasks and are released as those futures drop.
        live_task.abort();
        forecast_task.abort();
        reader_task.abort();

        let mut sink = sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;

        outcome
    }
}

/// Forward every payload from one subscription to the client verbatim.
///
/// Ends when the client write fails or the subscription terminates. The
/// bounded poll timeout means an abort from the session side takes effect
/// within one poll interval at worst.
async fn relay_task(
    mut sub: Box<dyn BusSubscription>,
    sink: Arc<Mutex<WsSink>>,
    channel: RelayChannel,
    poll_timeout: Duration,
    metrics: Arc<Metrics>,
    session_id: String,
) {
    loop {
        match sub.poll(poll_timeout).await {
            Ok(Some(payload)) => {
                // Payloads on these channels are UTF-8 JSON; anything else
                // is malformed and not worth killing the session over.
                let text = match String::from_utf8(payload.to_vec()) {
                    Ok(text) => text,
                    Err(e) => {
                        debug!(session = %session_id, channel = %channel.as_str(), error = %e, "relay_non_utf8_payload");
                        continue;
                    }
                };

                let mut sink = sink.lock().await;
                if let Err(e) = sink.send(Message::text(text)).await {
                    debug!(session = %session_id, channel = %channel.as_str(), error = %e, "relay_client_write_failed");
                    return;
                }
                drop(sink);

                match channel {
                    RelayChannel::Live => metrics.record_relayed_live(),
                    RelayChannel::Forecast => metrics.record_relayed_forecast(),
                }
            }
            Ok(None) => {}
            Err(e) => {
                debug!(session = %session_id, channel = %channel.as_str(), error = %e, "relay_upstream_closed");
                return;
            }
        }
    }
}

/// Consume client frames until the connection goes away.
///
/// Clients send nothing meaningful on this endpoint; the loop exists to
/// observe the close handshake or a dropped connection promptly instead of
/// waiting for the next relay write to fail.
async fn drain_client(mut source: WsSource, session_id: String) {
    while let Some(msg) = source.next().await {
        match msg {
            Ok(Message::Close(_)) => {
                debug!(session = %session_id, "client_close_frame");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(session = %session_id, error = %e, "client_read_error");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testsupport::MemoryBus;
    use bytes::Bytes;

    async fn start_test_gateway(
        bus: Arc<MemoryBus>,
        metrics: Arc<Metrics>,
    ) -> (String, watch::Sender<bool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = Config::default().with_relay_poll_timeout_ms(100);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(run_accept_loop(listener, config, bus, metrics, shutdown_rx));

        (format!("ws://{}", addr), shutdown_tx)
    }

    /// Wait until `count` subscriptions are attached to a channel
    async fn wait_for_subscribers(bus: &MemoryBus, channel: &str, count: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while bus.subscriber_count(channel) != count {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {} subscribers on {}",
                count,
                channel
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_client_receives_both_channels_in_per_channel_order() {
        let bus = Arc::new(MemoryBus::new());
        let metrics = Arc::new(Metrics::new());
        let (url, _shutdown_tx) = start_test_gateway(bus.clone(), metrics.clone()).await;

        let (mut client, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        wait_for_subscribers(&bus, "density/live", 1).await;
        wait_for_subscribers(&bus, "density/predicted", 1).await;

        bus.publish("density/live", Bytes::from_static(b"{\"seq\":1}"));
        bus.publish("density/live", Bytes::from_static(b"{\"seq\":2}"));
        bus.publish("density/predicted", Bytes::from_static(b"{\"p\":1}"));
        bus.publish("density/live", Bytes::from_static(b"{\"seq\":3}"));

        let mut received = Vec::new();
        for _ in 0..4 {
            let msg = tokio::time::timeout(Duration::from_secs(2), client.next())
                .await
                .expect("timed out waiting for relayed message")
                .expect("stream ended early")
                .unwrap();
            received.push(msg.into_text().unwrap().to_string());
        }

        // Per-channel order is preserved; cross-channel interleaving is free
        let live: Vec<_> = received.iter().filter(|m| m.contains("seq")).collect();
        assert_eq!(live, vec!["{\"seq\":1}", "{\"seq\":2}", "{\"seq\":3}"]);
        assert!(received.iter().any(|m| m.contains("\"p\":1")));

        // Relay counters land just after each successful write
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let summary = metrics.report();
            if summary.relayed_live == 3 && summary.relayed_forecast == 1 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "relay counters never settled");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_client_disconnect_releases_both_subscriptions() {
        let bus = Arc::new(MemoryBus::new());
        let metrics = Arc::new(Metrics::new());
        let (url, _shutdown_tx) = start_test_gateway(bus.clone(), metrics.clone()).await;

        let (mut client, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        wait_for_subscribers(&bus, "density/live", 1).await;
        wait_for_subscribers(&bus, "density/predicted", 1).await;

        client.close(None).await.unwrap();

        // Both relay tasks must end and drop their handles within bounded time
        wait_for_subscribers(&bus, "density/live", 0).await;
        wait_for_subscribers(&bus, "density/predicted", 0).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let summary = metrics.report();
            if summary.sessions_closed == 1 && summary.active_sessions == 0 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "session never closed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_upstream_end_cancels_peer_relay_and_closes_client() {
        let bus = Arc::new(MemoryBus::new());
        let metrics = Arc::new(Metrics::new());
        let (url, _shutdown_tx) = start_test_gateway(bus.clone(), metrics.clone()).await;

        let (mut client, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        wait_for_subscribers(&bus, "density/live", 1).await;
        wait_for_subscribers(&bus, "density/predicted", 1).await;

        // Kill the live channel; the forecast relay must be cancelled too,
        // not left waiting on a healthy channel.
        bus.close_channel("density/live");

        wait_for_subscribers(&bus, "density/predicted", 0).await;

        // The client sees the server-initiated close rather than a
        // half-alive connection.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            match tokio::time::timeout_at(deadline, client.next()).await {
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(_))) => break,
                Err(_) => panic!("client connection stayed half-alive"),
            }
        }
    }

    #[tokio::test]
    async fn test_session_closes_exactly_once_per_client() {
        let bus = Arc::new(MemoryBus::new());
        let metrics = Arc::new(Metrics::new());
        let (url, _shutdown_tx) = start_test_gateway(bus.clone(), metrics.clone()).await;

        let (mut c1, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        let (mut c2, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        wait_for_subscribers(&bus, "density/live", 2).await;

        c1.close(None).await.unwrap();
        c2.close(None).await.unwrap();
        wait_for_subscribers(&bus, "density/live", 0).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let summary = metrics.report();
            if summary.sessions_closed == 2 {
                assert_eq!(summary.sessions_opened, 2);
                assert_eq!(summary.active_sessions, 0);
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "teardown incomplete");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
