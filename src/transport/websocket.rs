//! WebSocket client transport (tokio-tungstenite)

use async_stream::stream;
use async_trait::async_trait;
use futures::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};

use super::{CloseReason, Transport, TransportLink, TransportSignal, LINK_CHANNEL_CAPACITY};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{ClientMessage, ServerMessage};

/// Connects to the backend's WebSocket endpoint
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
    access_token: Option<String>,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            access_token: None,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            url: config.url.clone(),
            access_token: config.access_token.clone(),
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// URL actually dialed, including the `access_token` query parameter
    pub fn endpoint(&self) -> String {
        match &self.access_token {
            None => self.url.clone(),
            Some(token) => {
                let sep = if self.url.contains('?') { '&' } else { '?' };
                format!(
                    "{}{}access_token={}",
                    self.url,
                    sep,
                    urlencoding::encode(token)
                )
            }
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> SyncResult<TransportLink> {
        let endpoint = self.endpoint();
        let (socket, _response) = connect_async(endpoint.as_str())
            .await
            .map_err(connect_error)?;
        debug!(url = %self.url, "WebSocket established");

        let (mut sink, frames) = socket.split();
        let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(LINK_CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<TransportSignal>(LINK_CHANNEL_CAPACITY);

        // Writer: runs until the connection manager drops the outbound sender
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let payload = match serde_json::to_string(&message) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "Failed to serialize outbound message");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(payload.into())).await {
                    debug!(error = %e, "WebSocket write failed");
                    return;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        });

        // Reader: forwards signals until the first terminal one
        tokio::spawn(async move {
            let signals = inbound_signals(frames);
            futures::pin_mut!(signals);
            while let Some(signal) = signals.next().await {
                let terminal = !matches!(signal, TransportSignal::Message(_));
                if in_tx.send(signal).await.is_err() || terminal {
                    break;
                }
            }
        });

        Ok(TransportLink::new(out_tx, in_rx))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

fn connect_error(err: WsError) -> SyncError {
    match err {
        WsError::Http(response) => {
            let status = response.status().as_u16();
            let message = match status {
                401 => "unauthorized: backend refused the access token".to_string(),
                403 => "forbidden: access to the event source denied".to_string(),
                code => format!("HTTP {} during WebSocket handshake", code),
            };
            SyncError::Connection(message)
        }
        other => SyncError::Connection(other.to_string()),
    }
}

/// Turn raw frames into transport signals, ending after the first close/error
fn inbound_signals<S>(mut frames: S) -> impl Stream<Item = TransportSignal>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    stream! {
        loop {
            match frames.next().await {
                Some(Ok(Message::Text(text))) => match ServerMessage::parse(text.as_str()) {
                    Ok(message) => yield TransportSignal::Message(message),
                    Err(e) => warn!(error = %e, "Ignoring unparsable frame"),
                },
                Some(Ok(Message::Binary(data))) => {
                    match std::str::from_utf8(&data).ok().map(ServerMessage::parse) {
                        Some(Ok(message)) => yield TransportSignal::Message(message),
                        _ => debug!(len = data.len(), "Ignoring binary frame"),
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = match frame {
                        Some(f) => CloseReason::with_code(u16::from(f.code), f.reason.to_string()),
                        None => CloseReason::new("server closed connection"),
                    };
                    yield TransportSignal::Closed(reason);
                    break;
                }
                // ping/pong are answered by tungstenite itself
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    yield TransportSignal::Error(e.to_string());
                    break;
                }
                None => {
                    yield TransportSignal::Closed(CloseReason::new("WebSocket stream ended"));
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[test]
    fn test_endpoint_appends_token() {
        let transport =
            WebSocketTransport::new("ws://localhost:8055/websocket").with_access_token("a b&c");
        assert_eq!(
            transport.endpoint(),
            "ws://localhost:8055/websocket?access_token=a%20b%26c"
        );
    }

    #[test]
    fn test_endpoint_with_existing_query() {
        let transport =
            WebSocketTransport::new("ws://localhost/ws?v=2").with_access_token("tok");
        assert_eq!(transport.endpoint(), "ws://localhost/ws?v=2&access_token=tok");
        assert_eq!(transport.describe(), "ws://localhost/ws?v=2");
    }

    #[tokio::test]
    async fn test_inbound_signals_stop_after_close() {
        let frames = stream::iter(vec![
            Ok(Message::Text(r#"{"type":"ping"}"#.into())),
            Ok(Message::Text("not json".into())),
            Ok(Message::Close(None)),
            Ok(Message::Text(r#"{"type":"ping"}"#.into())),
        ]);
        let signals: Vec<TransportSignal> = inbound_signals(frames).collect().await;
        assert_eq!(
            signals,
            vec![
                TransportSignal::Message(ServerMessage::Ping),
                TransportSignal::Closed(CloseReason::new("server closed connection")),
            ]
        );
    }

    #[tokio::test]
    async fn test_inbound_signals_end_of_stream() {
        let frames = stream::iter(Vec::<Result<Message, WsError>>::new());
        let signals: Vec<TransportSignal> = inbound_signals(frames).collect().await;
        assert_eq!(
            signals,
            vec![TransportSignal::Closed(CloseReason::new("WebSocket stream ended"))]
        );
    }
}
