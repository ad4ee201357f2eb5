//! WebSocket firehose consumer.
//!
//! Reads binary frames from a remote event stream, keeps the connection
//! alive with pings and forwards decoded events to a [`FirehoseHandler`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_websockets::{ClientBuilder, Message, Payload, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{EventError, EventResult};
use crate::event::StreamEvent;
use crate::frame::EventFrame;

/// Receives events read from a remote firehose.
#[async_trait]
pub trait FirehoseHandler: Send + Sync {
    async fn handle(&self, event: StreamEvent) -> EventResult<()>;
}

#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    pub ping_interval: Duration,
    /// The connection is closed when no pong arrives within this window.
    pub pong_timeout: Duration,
    /// Consecutive failed ping writes tolerated before giving up.
    pub max_ping_failures: u32,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(60),
            max_ping_failures: 4,
        }
    }
}

/// Address of a host's repository event stream.
pub fn subscribe_uri(host: &str, cursor: Option<i64>) -> String {
    let base = format!("ws://{host}/xrpc/com.atproto.sync.subscribeRepos");
    match cursor {
        Some(cursor) => format!("{base}?cursor={cursor}"),
        None => base,
    }
}

/// Open a WebSocket connection to `uri`.
pub async fn connect(uri: &str) -> EventResult<WebSocketStream<TcpStream>> {
    let parsed: http::Uri = uri
        .parse()
        .map_err(|_| EventError::InvalidUri(uri.to_string()))?;
    let host = parsed
        .host()
        .ok_or_else(|| EventError::InvalidUri(uri.to_string()))?
        .to_string();
    let port = parsed.port_u16().unwrap_or(80);
    let tcp = TcpStream::connect((host.as_str(), port)).await?;
    let (ws, _response) = ClientBuilder::from_uri(parsed).connect_on(tcp).await?;
    info!(%host, port, "connected to firehose");
    Ok(ws)
}

/// Consumes one firehose connection.
pub struct FirehoseConsumer<H> {
    handler: H,
    config: ConsumerConfig,
    last_seq: HashMap<String, i64>,
    cursor: Option<i64>,
}

impl<H: FirehoseHandler> FirehoseConsumer<H> {
    pub fn new(handler: H, config: ConsumerConfig) -> Self {
        Self {
            handler,
            config,
            last_seq: HashMap::new(),
            cursor: None,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Highest sequence number seen so far; reconnect from here.
    pub fn cursor(&self) -> Option<i64> {
        self.cursor
    }

    /// Read `ws` until the remote closes it, `shutdown` fires or an error
    /// occurs.
    pub async fn run<S>(
        &mut self,
        mut ws: WebSocketStream<S>,
        shutdown: CancellationToken,
    ) -> EventResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let period = self.config.ping_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_pong = Instant::now();
        let mut ping_failures = 0u32;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("firehose consumer shutting down");
                    let _ = tokio::time::timeout(Duration::from_secs(1), ws.close()).await;
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if last_pong.elapsed() > self.config.pong_timeout {
                        warn!(timeout = ?self.config.pong_timeout, "firehose pong timeout");
                        return Err(EventError::PongTimeout(self.config.pong_timeout));
                    }
                    let ping = Message::ping(Payload::from(Bytes::from_static(b"civpds")));
                    match ws.send(ping).await {
                        Ok(()) => ping_failures = 0,
                        Err(e) => {
                            ping_failures += 1;
                            warn!(error = %e, failures = ping_failures, "firehose ping failed");
                            if ping_failures >= self.config.max_ping_failures {
                                return Err(EventError::PingFailures(ping_failures));
                            }
                        }
                    }
                }
                msg = ws.next() => {
                    let msg = match msg {
                        None => return Ok(()),
                        Some(msg) => msg?,
                    };
                    if msg.is_close() {
                        debug!("firehose closed by remote");
                        return Ok(());
                    }
                    if msg.is_pong() {
                        last_pong = Instant::now();
                        continue;
                    }
                    if msg.is_ping() {
                        continue;
                    }
                    if !msg.is_binary() {
                        warn!("skipping non-binary firehose message");
                        continue;
                    }
                    self.handle_frame(Bytes::from(msg.into_payload())).await?;
                }
            }
        }
    }

    async fn handle_frame(&mut self, bytes: Bytes) -> EventResult<()> {
        let frame = match EventFrame::decode(bytes) {
            Ok(frame) => frame,
            Err(EventError::UnknownType(t)) => {
                debug!(message_type = %t, "skipping unknown firehose message");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let event = frame.event;
        if let StreamEvent::Error(err) = &event {
            if err.error == "ConsumerTooSlow" {
                return Err(EventError::ConsumerTooSlow);
            }
            return Err(EventError::Remote {
                error: err.error.clone(),
                message: err.message.clone().unwrap_or_default(),
            });
        }

        if let Some(seq) = event.seq() {
            if let Some(repo) = event.repo() {
                let prev = self.last_seq.entry(repo.to_string()).or_insert(seq);
                if seq < *prev {
                    warn!(did = %repo, seq, prev = *prev, "out-of-order firehose event");
                } else {
                    *prev = seq;
                }
            }
            self.cursor = Some(self.cursor.map_or(seq, |c| c.max(seq)));
        }
        self.handler.handle(event).await
    }
}
