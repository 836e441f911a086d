use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::trace;

use crate::error::TransportError;

/// Close status sent by the peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// Peer closed the connection, with its close frame if it sent one.
    Close(Option<CloseInfo>),
}

/// Whole-frame bidirectional message channel. `recv` must be cancel safe.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;

    /// `None` once the stream has ended without a close frame.
    async fn recv(&mut self) -> Option<Result<Frame, TransportError>>;

    async fn close(&mut self, code: u16) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError>;
}

/// WebSocket connector backed by `tokio-tungstenite`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|source| TransportError::Connect {
                url: url.to_string(),
                source,
            })?;
        Ok(Box::new(TungsteniteTransport { stream }))
    }
}

struct TungsteniteTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.stream.send(Message::text(frame)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(err) => return Some(Err(err.into())),
            };

            match message {
                Message::Text(text) => return Some(Ok(Frame::Text(text.to_string()))),
                Message::Close(frame) => {
                    return Some(Ok(Frame::Close(frame.map(|frame| CloseInfo {
                        code: u16::from(frame.code),
                        reason: frame.reason.to_string(),
                    }))))
                }
                other => trace!(kind = ?other, "ignoring non-text frame"),
            }
        }
    }

    async fn close(&mut self, code: u16) -> Result<(), TransportError> {
        self.stream
            .close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: "".into(),
            }))
            .await?;
        Ok(())
    }
}
