//! WebSocket server: binds the listener, upgrades and routes connections by
//! path, and runs the background age-sweep alongside the accept loop.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::interval;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::config::Config;
use crate::handler::{MessageHandler, Outgoing};
use crate::pool::MemoryPool;
use crate::stream_manager::StreamManager;

const PING_INTERVAL: Duration = Duration::from_secs(20);

pub struct Server {
    config: Arc<Config>,
    manager: Arc<StreamManager>,
    pool: Arc<MemoryPool>,
}

impl Server {
    pub fn new(config: Arc<Config>, manager: Arc<StreamManager>, pool: Arc<MemoryPool>) -> Self {
        Self { config, manager, pool }
    }

    pub async fn run(self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        self.serve(listener).await
    }

    /// Runs the accept loop against an already-bound listener. Split out
    /// from [`Server::run`] so tests can bind to an ephemeral port and learn
    /// its address before the server starts accepting.
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        info!(
            "listening on {} (path {})",
            listener.local_addr()?,
            self.config.path
        );

        let sweep_manager = self.manager.clone();
        let idle_threshold = self.config.idle_threshold();
        let sweep_interval = self.config.sweep_interval();
        tokio::spawn(async move {
            sweep_loop(sweep_manager, idle_threshold, sweep_interval).await;
        });

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept failed: {e}");
                    continue;
                }
            };

            let manager = self.manager.clone();
            let pool = self.pool.clone();
            let path = self.config.path.clone();
            tokio::spawn(async move {
                if let Err(e) =
                    handle_connection(stream, peer.to_string(), path, manager, pool).await
                {
                    debug!("{peer}: connection ended with error: {e}");
                }
            });
        }
    }
}

async fn sweep_loop(manager: Arc<StreamManager>, idle_threshold: Duration, period: Duration) {
    let mut ticker = interval(period);
    loop {
        ticker.tick().await;
        let deleted = manager.cleanup_old_streams(idle_threshold);
        if !deleted.is_empty() {
            info!("age sweep reclaimed {} idle stream(s): {:?}", deleted.len(), deleted);
        }
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

async fn handle_connection(
    stream: TcpStream,
    peer: String,
    expected_path: String,
    manager: Arc<StreamManager>,
    pool: Arc<MemoryPool>,
) -> Result<(), BoxError> {
    let callback = |req: &Request, response: Response| {
        if req.uri().path() == expected_path {
            Ok(response)
        } else {
            let body = format!("no such endpoint: {}", req.uri().path());
            let rejection: ErrorResponse = Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Some(body))
                .expect("building a 404 handshake response cannot fail");
            Err(rejection)
        }
    };

    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("{peer}: websocket handshake rejected: {e}");
            return Ok(());
        }
    };

    info!("{peer}: connected");
    let (mut write, mut read) = ws_stream.split();
    let mut handler = MessageHandler::new(manager, pool, peer.clone());
    let mut pings = interval(PING_INTERVAL);
    pings.tick().await; // first tick fires immediately; consume it

    loop {
        tokio::select! {
            _ = pings.tick() => {
                if write.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            msg = read.next() => {
                let Some(msg) = msg else { break };
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!("{peer}: receive error: {e}");
                        break;
                    }
                };

                let outgoing = match msg {
                    Message::Text(text) => Some(handler.handle_text(&text)),
                    Message::Binary(data) => handler.handle_binary(data),
                    Message::Ping(payload) => {
                        let _ = write.send(Message::Pong(payload)).await;
                        None
                    }
                    Message::Pong(_) => None,
                    Message::Close(_) => break,
                    Message::Frame(_) => None,
                };

                if let Some(outgoing) = outgoing {
                    let frame = match outgoing {
                        Outgoing::Text(json) => Message::Text(json),
                        Outgoing::Binary(data) => Message::Binary(data),
                    };
                    if write.send(frame).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    handler.handle_close();
    info!("{peer}: disconnected");
    let _ = write.close().await;
    Ok(())
}
