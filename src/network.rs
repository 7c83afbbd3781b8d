//! Network client for CertStream WebSocket connection
//!
//! This module handles connecting to the certstream websocket and turning
//! its messages into [`CertificateEvent`]s. It is a thin transport: it never
//! retries or reconnects. The ingester owns that logic.

use crate::config::NetworkConfig;
use crate::core::{CertificateEvent, EventSource, EventStream};
use crate::error::{MalformedEvent, SourceError};
use crate::internal_metrics::Metrics;
use async_trait::async_trait;
use futures_util::stream::StreamExt;
use serde::de::Error as _;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

/// Parses a raw certstream JSON message into a certificate event
///
/// Both the full feed (`data.leaf_cert.all_domains`) and the domains-only
/// feed (`data` is a plain list of names) are understood.
///
/// # Returns
/// * `Ok(Some(event))` for a certificate update
/// * `Ok(None)` for heartbeats and other message types
/// * `Err` if the JSON is malformed or doesn't match the expected structure
pub fn parse_message(text: &str) -> Result<Option<CertificateEvent>, MalformedEvent> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum FeedData {
        DomainsOnly(Vec<String>),
        Certificate {
            leaf_cert: Value,
            #[serde(default)]
            chain: Option<Value>,
            #[serde(default)]
            source: Option<Value>,
            #[serde(default)]
            seen: Option<Value>,
        },
    }

    #[derive(Deserialize)]
    struct LeafDomains {
        all_domains: Vec<String>,
    }

    let mut message: Value = serde_json::from_str(text)?;

    if let Some(message_type) = message.get("message_type").and_then(Value::as_str) {
        if message_type != "certificate_update" {
            debug!(message_type, "Skipping non-certificate message");
            return Ok(None);
        }
    }

    let data = message
        .get_mut("data")
        .map(Value::take)
        .ok_or_else(|| serde_json::Error::missing_field("data"))?;

    let event = match FeedData::deserialize(data)? {
        FeedData::DomainsOnly(domains) => {
            let raw = json!({ "domains": domains });
            CertificateEvent::new(domains, raw)
        }
        FeedData::Certificate {
            leaf_cert,
            chain,
            source,
            seen,
        } => {
            let domains = LeafDomains::deserialize(&leaf_cert)?.all_domains;
            let source = source
                .or_else(|| message.get("source").cloned())
                .unwrap_or_else(|| json!({}));
            let timestamp = seen
                .or_else(|| message.get("timestamp").cloned())
                .unwrap_or(Value::Null);
            let raw = json!({
                "domains": domains,
                "leaf_cert": leaf_cert,
                "chain": chain.unwrap_or_else(|| json!([])),
                "source": source,
                "timestamp": timestamp,
            });
            CertificateEvent::new(domains, raw)
        }
    };

    Ok(Some(event))
}

/// Trait for WebSocket connections to enable testing with fake implementations
#[async_trait]
pub trait WebSocketConnection: Send {
    /// Reads the next message from the WebSocket connection
    ///
    /// # Returns
    /// * `Some(Ok(Message))` if a message was successfully received
    /// * `Some(Err(error))` if there was an error reading the message
    /// * `None` if the connection has been closed
    async fn read_message(&mut self) -> Option<Result<Message, WsError>>;

    /// Closes the connection. The default does nothing.
    async fn close(&mut self) {}
}

/// A live tungstenite WebSocket.
struct TungsteniteConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl WebSocketConnection for TungsteniteConnection {
    async fn read_message(&mut self) -> Option<Result<Message, WsError>> {
        self.stream.next().await
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "Error while closing websocket");
        }
    }
}

/// One session on a certstream feed.
///
/// Malformed messages are logged and skipped; only transport failures and
/// closure end the session.
pub struct CertStreamSession {
    connection: Box<dyn WebSocketConnection>,
    metrics: Arc<Metrics>,
    closed: bool,
}

impl CertStreamSession {
    pub fn new(connection: Box<dyn WebSocketConnection>, metrics: Arc<Metrics>) -> Self {
        Self {
            connection,
            metrics,
            closed: false,
        }
    }
}

#[async_trait]
impl EventStream for CertStreamSession {
    async fn next_event(&mut self) -> Result<CertificateEvent, SourceError> {
        loop {
            if self.closed {
                return Err(SourceError::StreamClosed);
            }

            match self.connection.read_message().await {
                Some(Ok(Message::Text(text))) => match parse_message(text.as_str()) {
                    Ok(Some(event)) => {
                        trace!(domains = event.domains.len(), "Parsed certificate update");
                        self.metrics.events_received_total.increment(1);
                        return Ok(event);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %e, "Failed to parse certstream message");
                        self.metrics.malformed_messages_total.increment(1);
                    }
                },
                Some(Ok(Message::Binary(_))) => {
                    debug!("Received binary message, ignoring");
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    trace!("Received ping/pong");
                }
                Some(Ok(Message::Frame(_))) => {
                    debug!("Received raw frame, ignoring");
                }
                Some(Ok(Message::Close(frame))) => {
                    info!(?frame, "Received close message from server");
                    self.closed = true;
                    return Err(SourceError::StreamClosed);
                }
                Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) | None => {
                    info!("WebSocket connection closed");
                    self.closed = true;
                    return Err(SourceError::StreamClosed);
                }
                Some(Err(e)) => {
                    self.closed = true;
                    return Err(SourceError::Stream(e.to_string()));
                }
            }
        }
    }

    async fn close(&mut self) {
        if !self.closed {
            self.connection.close().await;
            self.closed = true;
        }
    }
}

/// CertStream WebSocket source that opens sessions against the configured
/// feed URL.
pub struct CertStreamSource {
    url: String,
    allow_invalid_certs: bool,
    connect_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl CertStreamSource {
    /// Creates a new CertStream source
    ///
    /// # Arguments
    /// * `url` - The WebSocket URL to connect to (e.g., "wss://certstream.calidog.io")
    /// * `allow_invalid_certs` - Accept self-signed or otherwise invalid TLS certificates
    /// * `connect_timeout` - Upper bound on connecting and completing the handshake
    pub fn new(
        url: String,
        allow_invalid_certs: bool,
        connect_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            url,
            allow_invalid_certs,
            connect_timeout,
            metrics,
        }
    }

    pub fn from_config(config: &NetworkConfig, metrics: Arc<Metrics>) -> Self {
        Self::new(
            config.certstream_url.clone(),
            config.allow_invalid_certs,
            Duration::from_millis(config.connect_timeout_ms),
            metrics,
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn tls_connector(&self) -> Result<Option<Connector>, SourceError> {
        if !self.allow_invalid_certs {
            return Ok(None);
        }
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| SourceError::Connection(format!("failed to build TLS connector: {e}")))?;
        Ok(Some(Connector::NativeTls(tls)))
    }
}

#[async_trait]
impl EventSource for CertStreamSource {
    async fn connect(&self) -> Result<Box<dyn EventStream>, SourceError> {
        let connector = self.tls_connector()?;
        debug!(url = %self.url, "Attempting to connect");

        let handshake = connect_async_tls_with_config(self.url.as_str(), None, false, connector);
        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| {
                SourceError::Connection(format!(
                    "timed out connecting to {} after {:?}",
                    self.url, self.connect_timeout
                ))
            })?
            .map_err(|e| SourceError::Connection(format!("failed to connect to {}: {}", self.url, e)))?;

        info!(url = %self.url, "Connected to CertStream");
        Ok(Box::new(CertStreamSession::new(
            Box::new(TungsteniteConnection { stream: ws_stream }),
            self.metrics.clone(),
        )))
    }
}
