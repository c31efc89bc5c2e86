//! Client transports: newline-delimited JSON over TCP, and JSON text frames
//! over WebSocket.

use crate::error::TransportError;
use crate::session::JsonConn;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::trace;

/// One JSON value per line in each direction.
pub struct LineConn<R, W> {
    lines: Lines<BufReader<R>>,
    writer: W,
}

impl<R, W> LineConn<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }
}

impl LineConn<OwnedReadHalf, OwnedWriteHalf> {
    pub fn from_tcp(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer)
    }
}

#[async_trait]
impl<R, W> JsonConn for LineConn<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn read_json(&mut self) -> Result<Option<Value>, TransportError> {
        // next_line is cancel-safe, so a partially read line survives a lost race.
        while let Some(line) = self.lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(line)?));
        }
        Ok(None)
    }

    async fn write_json(&mut self, value: &Value) -> Result<(), TransportError> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// One JSON value per text frame.
pub struct WsConn<S> {
    socket: WebSocketStream<S>,
}

impl<S> WsConn<S> {
    pub fn new(socket: WebSocketStream<S>) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl<S> JsonConn for WsConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_json(&mut self) -> Result<Option<Value>, TransportError> {
        while let Some(message) = self.socket.next().await {
            match message? {
                Message::Text(text) => return Ok(Some(serde_json::from_str(&text)?)),
                Message::Binary(bytes) => return Ok(Some(serde_json::from_slice(&bytes)?)),
                Message::Close(frame) => {
                    trace!(?frame, "websocket close frame");
                    return Ok(None);
                }
                // Ping replies are queued by tungstenite itself.
                _ => continue,
            }
        }
        Ok(None)
    }

    async fn write_json(&mut self, value: &Value) -> Result<(), TransportError> {
        let text = serde_json::to_string(value)?;
        self.socket.send(Message::Text(text)).await?;
        Ok(())
    }
}
