//! Socket seam for the connection manager.
//!
//! [`Connector`] opens one [`Transport`] per attempt. The production
//! implementation speaks WebSocket via `tokio-tungstenite`; tests plug in
//! scripted transports.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use crate::error::Result;

/// What the socket produced next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Frame(String),
    /// The peer or the network ended the connection. `clean` is true only for
    /// an orderly close handshake with a normal close code.
    Closed { clean: bool },
}

#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Next text frame or close. Must be cancel-safe.
    async fn recv(&mut self) -> Inbound;

    async fn close(&mut self);
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, url: &Url) -> Result<Box<dyn Transport>>;
}

/// Opens real WebSocket connections (`ws://` and `wss://`).
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, url: &Url) -> Result<Box<dyn Transport>> {
        let (stream, response) = connect_async(url.as_str()).await?;
        debug!(status = %response.status(), %url, "websocket handshake complete");
        Ok(Box::new(WsTransport { stream }))
    }
}

pub struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Inbound {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Inbound::Frame(text),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => return Inbound::Frame(text),
                    Err(_) => debug!("ignoring non-utf8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let clean = frame.map_or(true, |f| f.code == CloseCode::Normal);
                    return Inbound::Closed { clean };
                }
                // Protocol-level ping/pong is answered by tungstenite itself.
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    debug!(error = %e, "websocket read error");
                    return Inbound::Closed { clean: false };
                }
                None => return Inbound::Closed { clean: false },
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "websocket close failed");
        }
    }
}
