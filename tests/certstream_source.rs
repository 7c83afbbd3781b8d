//! Tests for the CertStream session and source.

use async_trait::async_trait;
use certstore::core::{EventSource, EventStream};
use certstore::error::SourceError;
use certstore::network::{CertStreamSession, CertStreamSource, WebSocketConnection};
use futures_util::SinkExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

mod helpers;
use helpers::test_metrics;

fn certificate_update(domains: &[&str]) -> String {
    serde_json::json!({
        "message_type": "certificate_update",
        "data": {
            "leaf_cert": {"all_domains": domains},
            "chain": [],
            "seen": 1700000000.5,
            "source": {"name": "Test Log", "url": "ct.example.net/log/"}
        }
    })
    .to_string()
}

/// A WebSocket that replays a fixed list of frames, then reports closure.
struct FakeWebSocket {
    frames: VecDeque<Result<Message, WsError>>,
    closed: Arc<AtomicBool>,
}

impl FakeWebSocket {
    fn new(frames: Vec<Result<Message, WsError>>) -> (Self, Arc<AtomicBool>) {
        let closed = Arc::new(AtomicBool::new(false));
        (
            Self {
                frames: frames.into(),
                closed: closed.clone(),
            },
            closed,
        )
    }
}

#[async_trait]
impl WebSocketConnection for FakeWebSocket {
    async fn read_message(&mut self) -> Option<Result<Message, WsError>> {
        self.frames.pop_front()
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn text(body: impl Into<String>) -> Result<Message, WsError> {
    Ok(Message::Text(body.into().into()))
}

#[tokio::test]
async fn test_session_skips_malformed_and_non_certificate_messages() {
    let (ws, _) = FakeWebSocket::new(vec![
        text(r#"{"message_type": "heartbeat", "timestamp": 1.0}"#),
        text("not json at all"),
        text(r#"{"message_type": "certificate_update", "data": {"update_type": "X509LogEntry"}}"#),
        Ok(Message::Ping(Vec::new().into())),
        text(certificate_update(&["a.example.com", "b.example.com"])),
    ]);
    let mut session = CertStreamSession::new(Box::new(ws), test_metrics());

    let event = session.next_event().await.unwrap();
    assert_eq!(event.domains, vec!["a.example.com", "b.example.com"]);
    assert_eq!(event.raw["source"]["name"], "Test Log");
    assert_eq!(event.raw["timestamp"], 1700000000.5);
}

#[tokio::test]
async fn test_close_frame_ends_session() {
    let (ws, _) = FakeWebSocket::new(vec![
        text(certificate_update(&["a.com"])),
        Ok(Message::Close(None)),
        text(certificate_update(&["never.com"])),
    ]);
    let mut session = CertStreamSession::new(Box::new(ws), test_metrics());

    assert!(session.next_event().await.is_ok());
    assert_eq!(session.next_event().await.unwrap_err(), SourceError::StreamClosed);
    // A closed session stays closed.
    assert_eq!(session.next_event().await.unwrap_err(), SourceError::StreamClosed);
}

#[tokio::test]
async fn test_end_of_stream_is_closure() {
    let (ws, _) = FakeWebSocket::new(vec![]);
    let mut session = CertStreamSession::new(Box::new(ws), test_metrics());
    assert_eq!(session.next_event().await.unwrap_err(), SourceError::StreamClosed);
}

#[tokio::test]
async fn test_transport_error_is_reported() {
    let (ws, _) = FakeWebSocket::new(vec![Err(WsError::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "reset",
    )))]);
    let mut session = CertStreamSession::new(Box::new(ws), test_metrics());
    assert!(matches!(
        session.next_event().await,
        Err(SourceError::Stream(_))
    ));
}

#[tokio::test]
async fn test_close_releases_the_connection_once() {
    let (ws, closed) = FakeWebSocket::new(vec![text(certificate_update(&["a.com"]))]);
    let mut session = CertStreamSession::new(Box::new(ws), test_metrics());

    session.close().await;
    assert!(closed.load(Ordering::SeqCst));
    session.close().await;
    assert_eq!(session.next_event().await.unwrap_err(), SourceError::StreamClosed);
}

#[tokio::test]
async fn test_connect_to_unreachable_endpoint_fails() {
    // Bind then drop to find a port with nothing listening on it.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let source = CertStreamSource::new(
        format!("ws://{addr}"),
        false,
        Duration::from_secs(5),
        test_metrics(),
    );
    assert!(matches!(
        source.connect().await,
        Err(SourceError::Connection(_))
    ));
}

#[tokio::test]
async fn test_source_reads_events_from_local_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        ws.send(Message::Text(r#"{"message_type": "heartbeat"}"#.into()))
            .await
            .unwrap();
        ws.send(Message::Text(certificate_update(&["live.example.com"]).into()))
            .await
            .unwrap();
        ws.close(None).await.unwrap();
    });

    let source = CertStreamSource::new(
        format!("ws://{addr}"),
        false,
        Duration::from_secs(5),
        test_metrics(),
    );
    assert_eq!(source.url(), format!("ws://{addr}"));

    let mut stream = source.connect().await.unwrap();
    let event = stream.next_event().await.unwrap();
    assert_eq!(event.domains, vec!["live.example.com"]);
    assert_eq!(stream.next_event().await.unwrap_err(), SourceError::StreamClosed);
    stream.close().await;

    server.await.unwrap();
}
