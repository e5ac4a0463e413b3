//! WebSocket listener.
//!
//! Each accepted TCP connection is upgraded to a WebSocket and bound to one
//! [`Session`]. Binary messages are dispatched strictly in arrival order:
//! each dispatch runs on the blocking pool and completes before the next
//! message is read.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::error::ServerResult;
use crate::session::Session;

/// WebSocket server driving an [`Engine`].
pub struct SocketServer {
    engine: Arc<Engine>,
    listener: TcpListener,
    /// Semaphore for limiting concurrent connections.
    connection_semaphore: Arc<Semaphore>,
}

impl SocketServer {
    /// Binds to the engine's configured `listen` address.
    pub async fn bind(engine: Arc<Engine>) -> ServerResult<Self> {
        let listener = TcpListener::bind(engine.config().listen).await?;
        info!(addr = %listener.local_addr()?, "WebSocket server listening");

        let connection_semaphore = Arc::new(Semaphore::new(engine.config().max_sessions));
        Ok(Self {
            engine,
            listener,
            connection_semaphore,
        })
    }

    /// The bound address (useful with port `0`).
    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Runs the accept loop.
    ///
    /// This method runs indefinitely until an error occurs or the server is stopped.
    pub async fn run(&self) -> ServerResult<()> {
        loop {
            let Ok(permit) = self.connection_semaphore.clone().acquire_owned().await else {
                return Ok(());
            };

            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "Accepted new connection");
                    tokio::spawn(serve_connection(self.engine.clone(), stream, peer, permit));
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    // Continue accepting despite errors
                }
            }
        }
    }

    /// Runs the accept loop until `shutdown` completes.
    pub async fn run_until_shutdown<S>(&self, shutdown: S) -> ServerResult<()>
    where
        S: Future<Output = ()> + Send,
    {
        tokio::select! {
            result = self.run() => result,
            _ = shutdown => {
                info!("Shutdown signal received");
                Ok(())
            }
        }
    }
}

async fn serve_connection(
    engine: Arc<Engine>,
    stream: TcpStream,
    peer: SocketAddr,
    _permit: OwnedSemaphorePermit,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (session, mut outbox) = match engine.hub().create_session(engine.config().send_buffer) {
        Ok(created) => created,
        Err(e) => {
            warn!(%peer, error = %e, "Refusing connection");
            let _ = ws_tx.send(Message::Close(None)).await;
            return;
        }
    };
    info!(%peer, session = %session.id(), "Client connected");

    // Outbound forwarder with periodic Ping frames.
    let interval = engine.config().check_interval();
    let upload_timeout = engine.config().upload_timeout();
    let outbound_session = session.clone();
    let mut outbound = tokio::spawn(async move {
        let mut ping = tokio::time::interval(interval);
        // Skip the immediate first tick
        ping.tick().await;

        loop {
            tokio::select! {
                frame = outbox.recv() => match frame {
                    Some(frame) => {
                        if ws_tx.send(Message::Binary(frame)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ping.tick() => {
                    if outbound_session.idle_for() > interval * 2 {
                        warn!(session = %outbound_session.id(), "Client unresponsive, disconnecting");
                        break;
                    }
                    outbound_session.sweep_uploads(upload_timeout);
                    if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    loop {
        tokio::select! {
            message = ws_rx.next() => match message {
                Some(Ok(Message::Binary(data))) => dispatch(&engine, &session, data).await,
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Text(_))) => {
                    session.mark_alive();
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    debug!(session = %session.id(), "Client closed the connection");
                    break;
                }
                Some(Err(e)) => {
                    debug!(session = %session.id(), error = %e, "WebSocket read failed");
                    break;
                }
            },
            _ = &mut outbound => break,
            _ = session.disconnect_requested() => {
                debug!(session = %session.id(), "Disconnect requested");
                break;
            }
        }
    }

    outbound.abort();
    engine.hub().remove_session(session.id());
    info!(%peer, session = %session.id(), "Client disconnected");
}

async fn dispatch(engine: &Arc<Engine>, session: &Arc<Session>, data: Bytes) {
    let engine = engine.clone();
    let session = session.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || engine.dispatch(&session, &data)).await {
        warn!(error = %e, "Dispatch task failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::context::Context;
    use crate::error::HandlerResult;
    use mego_protocol::{Request, Response, decode_message, decode_value, encode_message, encode_value};
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_tungstenite::connect_async;

    const TIMEOUT: Duration = Duration::from_secs(5);

    type WsStream = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    fn sum(ctx: &mut Context) -> HandlerResult {
        let (a, b): (i64, i64) = ctx.bind()?;
        ctx.respond(&(a + b))
    }

    async fn boot(max_sessions: usize) -> (String, Arc<Engine>) {
        let config = EngineConfig::new("127.0.0.1:0".parse().unwrap()).with_max_sessions(max_sessions);
        let mut engine = Engine::new(config);
        engine.register("Sum", sum).unwrap();
        let engine = Arc::new(engine);

        let server = SocketServer::bind(engine.clone()).await.unwrap();
        let url = format!("ws://{}", server.local_addr().unwrap());
        tokio::spawn(async move { server.run().await });
        (url, engine)
    }

    async fn recv(ws: &mut WsStream) -> Response {
        loop {
            let message = timeout(TIMEOUT, ws.next()).await.unwrap().unwrap().unwrap();
            if let Message::Binary(data) = message {
                return decode_message(&data).unwrap();
            }
        }
    }

    async fn wait_for_sessions(engine: &Engine, expected: usize) {
        timeout(TIMEOUT, async {
            while engine.hub().len() != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn call_roundtrip_over_websocket() {
        let (url, engine) = boot(8).await;
        let (mut ws, _) = connect_async(&url).await.unwrap();

        let request = Request::call("Sum", encode_value(&[3, 4]).unwrap(), 1);
        ws.send(Message::Binary(encode_message(&request).unwrap())).await.unwrap();

        let response = recv(&mut ws).await;
        assert_eq!(response.id, 1);
        assert_eq!(decode_value::<i64>(&response.result).unwrap(), 7);
        assert_eq!(engine.hub().len(), 1);
    }

    #[tokio::test]
    async fn frames_are_answered_in_order() {
        let (url, _engine) = boot(8).await;
        let (mut ws, _) = connect_async(&url).await.unwrap();

        for id in 1..=5u64 {
            let request = Request::call("Sum", encode_value(&[id, id]).unwrap(), id);
            ws.send(Message::Binary(encode_message(&request).unwrap())).await.unwrap();
        }
        for id in 1..=5u64 {
            let response = recv(&mut ws).await;
            assert_eq!(response.id, id);
            assert_eq!(decode_value::<u64>(&response.result).unwrap(), id * 2);
        }
    }

    #[tokio::test]
    async fn close_removes_session_and_subscriptions() {
        let (url, engine) = boot(8).await;
        let (mut ws, _) = connect_async(&url).await.unwrap();

        let request = Request::subscribe("Chat", "Room1", 1);
        ws.send(Message::Binary(encode_message(&request).unwrap())).await.unwrap();
        recv(&mut ws).await;
        assert_eq!(engine.hub().subscribers("Chat", "Room1").len(), 1);

        ws.close(None).await.unwrap();
        wait_for_sessions(&engine, 0).await;
        assert!(engine.hub().subscribers("Chat", "Room1").is_empty());
    }

    #[tokio::test]
    async fn server_side_disconnect() {
        let (url, engine) = boot(8).await;
        let (mut ws, _) = connect_async(&url).await.unwrap();
        wait_for_sessions(&engine, 1).await;

        engine.hub().sessions()[0].disconnect();
        wait_for_sessions(&engine, 0).await;

        // The client observes the close.
        let closed = timeout(TIMEOUT, async {
            while let Some(Ok(message)) = ws.next().await {
                if message.is_close() {
                    break;
                }
            }
        })
        .await;
        assert!(closed.is_ok());
    }
}
