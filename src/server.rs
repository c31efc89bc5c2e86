//! Accept loops for the two client listeners. Each accepted connection gets
//! its own session task.

use crate::registry::StreamRegistry;
use crate::session::{ClientSession, JsonConn};
use crate::transport::{LineConn, WsConn};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info, info_span, warn, Instrument};

/// Serves newline-delimited JSON clients until the listener fails permanently.
pub async fn serve_tcp(listener: TcpListener, registry: StreamRegistry, queue_capacity: usize) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "accepting line clients");
    }
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "tcp accept failed");
                continue;
            }
        };
        let conn = LineConn::from_tcp(socket);
        spawn_session(conn, peer, "tcp", registry.clone(), queue_capacity);
    }
}

/// Serves WebSocket clients. The handshake runs inside the per-client task so
/// a slow handshake never blocks the accept loop.
pub async fn serve_ws(listener: TcpListener, registry: StreamRegistry, queue_capacity: usize) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "accepting websocket clients");
    }
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "websocket accept failed");
                continue;
            }
        };
        let registry = registry.clone();
        tokio::spawn(async move {
            match tokio_tungstenite::accept_async(socket).await {
                Ok(ws) => spawn_session(WsConn::new(ws), peer, "ws", registry, queue_capacity),
                Err(e) => warn!(%peer, error = %e, "websocket handshake failed"),
            }
        });
    }
}

fn spawn_session<C>(
    conn: C,
    peer: SocketAddr,
    transport: &'static str,
    registry: StreamRegistry,
    queue_capacity: usize,
) where
    C: JsonConn + 'static,
{
    let span = info_span!("session", %peer, transport);
    tokio::spawn(
        async move {
            info!("client connected");
            match ClientSession::new(conn, registry, queue_capacity).run().await {
                Ok(()) => info!("session finished"),
                Err(e) => error!(error = %e, "session failed"),
            }
        }
        .instrument(span),
    );
}
