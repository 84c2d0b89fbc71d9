//! Reconnecting WebSocket connection to the signaling server.

mod errors;

use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use roulette_model::{ClientMessage, ServerMessage};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::SignalingConfig;
use crate::session::SessionEvent;

pub use errors::SignalingErrors;

type WsTx = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsRx = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Exponential reconnect delay, doubling up to a ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = std::cmp::min(self.current * 2, self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

enum Disconnect {
    Lost,
    SessionGone,
}

pub struct SignalingClient {
    url: String,
    config: SignalingConfig,
}

impl SignalingClient {
    pub fn new(url: impl Into<String>, config: SignalingConfig) -> Self {
        Self {
            url: url.into(),
            config,
        }
    }

    async fn connect(&self) -> Result<(WsTx, WsRx), SignalingErrors> {
        tracing::info!("Signaling server url is: {}. Connecting...", self.url);
        match timeout(
            self.config.connect_timeout(),
            tokio_tungstenite::connect_async(self.url.as_str()),
        )
        .await
        {
            Ok(Ok((ws_stream, _))) => {
                tracing::info!("Connection successful!");
                Ok(ws_stream.split())
            }
            Ok(Err(err)) => Err(SignalingErrors::ConnectionFailed(err.to_string())),
            Err(_) => Err(SignalingErrors::ConnectTimeout),
        }
    }

    async fn send_message(ws_tx: &mut WsTx, message: &ClientMessage) -> Result<(), SignalingErrors> {
        let text = serde_json::to_string(message)?;
        if let Err(err) = ws_tx.send(Message::Text(Utf8Bytes::from(text))).await {
            tracing::error!("Failed to send text message: {err}");
            return Err(SignalingErrors::SendFailed);
        }
        Ok(())
    }

    /// Moves frames both ways until the connection or the session goes away.
    async fn pump(
        &self,
        mut ws_tx: WsTx,
        mut ws_rx: WsRx,
        mailbox: &mpsc::UnboundedSender<SessionEvent>,
        outbound: &mut mpsc::UnboundedReceiver<ClientMessage>,
    ) -> Disconnect {
        let liveness_timeout = self.config.liveness_timeout();
        let mut ping = tokio::time::interval(self.config.ping_interval());
        ping.tick().await;
        let liveness = sleep(liveness_timeout);
        tokio::pin!(liveness);

        loop {
            tokio::select! {
                frame = ws_rx.next() => {
                    liveness.as_mut().reset(Instant::now() + liveness_timeout);
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<ServerMessage>(&text) {
                                Ok(message) => {
                                    if mailbox.send(SessionEvent::Relay(message)).is_err() {
                                        return Disconnect::SessionGone;
                                    }
                                }
                                Err(err) => tracing::warn!(
                                    "Failed to parse incoming message: {err}, {}",
                                    text.as_str()
                                ),
                            }
                        }
                        Some(Ok(Message::Close(_))) => {
                            tracing::warn!("WebSocket connection closed by server");
                            return Disconnect::Lost;
                        }
                        Some(Ok(_)) => {} // Ping/pong only prove liveness
                        Some(Err(err)) => {
                            tracing::error!("WebSocket error: {err}");
                            return Disconnect::Lost;
                        }
                        None => return Disconnect::Lost,
                    }
                }
                message = outbound.recv() => match message {
                    Some(message) => {
                        tracing::debug!("Sending {message:?}");
                        if Self::send_message(&mut ws_tx, &message).await.is_err() {
                            return Disconnect::Lost;
                        }
                    }
                    None => {
                        let _ = ws_tx.close().await;
                        return Disconnect::SessionGone;
                    }
                },
                _ = ping.tick() => {
                    if let Err(err) = ws_tx.send(Message::Ping(Bytes::new())).await {
                        tracing::error!("Failed to send ping: {err}");
                        return Disconnect::Lost;
                    }
                }
                _ = &mut liveness => {
                    tracing::warn!("No traffic from signaling server for {liveness_timeout:?}");
                    return Disconnect::Lost;
                }
            }
        }
    }

    // Main loop (blocking). Returns Ok once the session stops listening.
    pub async fn run(
        self,
        mailbox: mpsc::UnboundedSender<SessionEvent>,
        mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
    ) -> Result<(), SignalingErrors> {
        let max_attempts = self.config.max_reconnect_attempts;
        let mut backoff = Backoff::new(
            self.config.reconnect_delay(),
            self.config.max_reconnect_delay(),
        );
        let mut failures = 0;

        loop {
            match self.connect().await {
                Ok((ws_tx, ws_rx)) => {
                    failures = 0;
                    backoff.reset();

                    let mut stale = 0;
                    while outbound.try_recv().is_ok() {
                        stale += 1;
                    }
                    if stale > 0 {
                        tracing::debug!("Discarded {stale} message(s) queued while disconnected");
                    }

                    if mailbox.send(SessionEvent::ServerConnected).is_err() {
                        return Ok(());
                    }
                    match self.pump(ws_tx, ws_rx, &mailbox, &mut outbound).await {
                        Disconnect::SessionGone => return Ok(()),
                        Disconnect::Lost => {
                            if mailbox.send(SessionEvent::ServerDisconnected).is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
                Err(err) => {
                    failures += 1;
                    tracing::error!(
                        "Failed to connect to signaling server: {err} (attempt {failures}/{max_attempts})"
                    );
                    if failures >= max_attempts {
                        return Err(SignalingErrors::ReconnectExhausted(failures));
                    }
                }
            }

            let delay = backoff.next_delay();
            tracing::info!("Retrying in {delay:?}");
            sleep(delay).await;
        }
    }
}
