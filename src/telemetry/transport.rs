//! Telemetry Transport
//!
//! The `Connector` seam produces one live link per connection attempt.
//! `WebSocketConnector` is the production implementation.

use async_trait::async_trait;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info};

use super::TelemetryError;

/// Incoming text frames; the stream ending means the peer closed
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TelemetryError>> + Send>>;

/// Outgoing text frames
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TelemetryError> + Send>>;

/// One open connection, split into halves
pub struct TransportLink {
    pub incoming: FrameStream,
    pub outgoing: FrameSink,
}

/// Factory for transport links. Each call must return a fresh connection.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &str, token: Option<&str>) -> Result<TransportLink, TelemetryError>;
}

/// WebSocket connector (tokio-tungstenite)
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl WebSocketConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, endpoint: &str, token: Option<&str>) -> Result<TransportLink, TelemetryError> {
        let url = if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
            endpoint.to_string()
        } else {
            format!("ws://{}", endpoint)
        };

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TelemetryError::ConnectFailed(e.to_string()))?;

        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| TelemetryError::ConnectFailed(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        debug!("Connecting to {}", url);
        let (ws_stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| TelemetryError::ConnectFailed(format!("timed out after {:?}", self.connect_timeout)))?
            .map_err(|e| TelemetryError::ConnectFailed(e.to_string()))?;

        info!("Telemetry transport connected to {}", url);

        let (write, read) = ws_stream.split();

        let incoming = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(data)) => Some(Ok(String::from_utf8_lossy(&data).into_owned())),
                // Control frames; Close is followed by the stream ending
                Ok(_) => None,
                Err(e) => Some(Err(TelemetryError::Transport(e.to_string()))),
            })
        });

        let outgoing = write
            .with(|text: String| future::ready(Ok::<_, tungstenite::Error>(Message::Text(text))))
            .sink_map_err(|e| TelemetryError::Transport(e.to_string()));

        Ok(TransportLink {
            incoming: Box::pin(incoming),
            outgoing: Box::pin(outgoing),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused_is_connect_failed() {
        // Bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = WebSocketConnector::new(Duration::from_secs(2));
        let result = connector.connect(&format!("ws://{}", addr), None).await;
        assert!(matches!(result, Err(TelemetryError::ConnectFailed(_))));
    }

    #[tokio::test]
    async fn test_invalid_url_is_connect_failed() {
        let connector = WebSocketConnector::default();
        let result = connector.connect("ws://bad host/stream", None).await;
        assert!(matches!(result, Err(TelemetryError::ConnectFailed(_))));
    }
}
