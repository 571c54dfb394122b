use crate::domain_port::*;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

impl From<ConnMessage> for Message {
    fn from(message: ConnMessage) -> Message {
        match message {
            ConnMessage::Text(t) => Message::Text(t),
            ConnMessage::Binary(b) => Message::Binary(b),
            ConnMessage::Ping => Message::Ping(Vec::new()),
            ConnMessage::Pong => Message::Pong(Vec::new()),
            ConnMessage::Close => Message::Close(None),
        }
    }
}

/// Raw frames never surface from a client stream; they map to `None`.
fn conn_message(message: Message) -> Option<ConnMessage> {
    match message {
        Message::Text(t) => Some(ConnMessage::Text(t)),
        Message::Binary(b) => Some(ConnMessage::Binary(b)),
        Message::Ping(_) => Some(ConnMessage::Ping),
        Message::Pong(_) => Some(ConnMessage::Pong),
        Message::Close(_) => Some(ConnMessage::Close),
        Message::Frame(_) => None,
    }
}

#[async_trait::async_trait]
impl ConnSender for SplitSink<WsStream, Message> {
    async fn send(&mut self, message: ConnMessage) -> anyhow::Result<()> {
        SinkExt::send(self, Message::from(message)).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ConnReceiver for SplitStream<WsStream> {
    async fn next(&mut self) -> Option<anyhow::Result<ConnMessage>> {
        loop {
            match StreamExt::next(self).await? {
                Ok(message) => {
                    if let Some(message) = conn_message(message) {
                        return Some(Ok(message));
                    }
                }
                Err(e) => return Some(Err(anyhow::Error::from(e))),
            }
        }
    }
}

/// Opens WebSocket channels with tokio-tungstenite.
pub struct WsConnector {
    handshake_timeout: Duration,
}

impl WsConnector {
    pub fn new(handshake_timeout: Duration) -> Self {
        Self { handshake_timeout }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait::async_trait]
impl Connector for WsConnector {
    async fn open(
        &self,
        url: &str,
    ) -> anyhow::Result<(Box<dyn ConnSender>, Box<dyn ConnReceiver>)> {
        let (stream, response) = tokio::time::timeout(self.handshake_timeout, connect_async(url))
            .await
            .map_err(|_| anyhow::anyhow!("handshake timed out after {:?}", self.handshake_timeout))??;
        tracing::debug!(status = %response.status(), "websocket handshake complete");

        let (sink, stream) = stream.split();
        Ok((Box::new(sink), Box::new(stream)))
    }
}
