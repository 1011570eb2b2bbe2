use crate::broker::{handle_connection, BrokerCtx};
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

const MQTT_SUBPROTOCOL: &str = "mqtt";
const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    WebSocket,
}

impl Transport {
    pub fn label(self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::WebSocket => "websocket",
        }
    }
}

/// A bound listener that has not started accepting yet.
pub struct EdgeListener {
    transport: Transport,
    listener: TcpListener,
}

impl EdgeListener {
    pub async fn bind(transport: Transport, addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {} listener on {addr}", transport.label()))?;
        Ok(Self {
            transport,
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until `shutdown` flips or its sender goes away; each connection gets its own task.
    pub fn spawn(self, ctx: BrokerCtx, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let Self {
            transport,
            listener,
        } = self;
        if let Ok(addr) = listener.local_addr() {
            tracing::info!("{} listener bound on {}", transport.label(), addr);
        }
        tokio::spawn(async move {
            loop {
                let (stream, peer) = tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            tracing::warn!("{} accept error: {err:?}", transport.label());
                            ctx.bridge.on_connection_error(None, &err.to_string());
                            continue;
                        }
                    },
                    _ = shutdown.changed() => break,
                };
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let outcome = match transport {
                        Transport::Tcp => handle_connection(stream, ctx).await,
                        Transport::WebSocket => serve_websocket(stream, ctx).await,
                    };
                    if let Err(err) = outcome {
                        tracing::warn!(
                            "{} session error peer={peer} err={err:#}",
                            transport.label()
                        );
                    }
                });
            }
            tracing::info!("{} listener stopped", transport.label());
        })
    }
}

async fn serve_websocket(stream: TcpStream, ctx: BrokerCtx) -> Result<()> {
    let ws = match tokio_tungstenite::accept_hdr_async(stream, negotiate_subprotocol).await {
        Ok(ws) => ws,
        Err(err) => {
            ctx.bridge
                .on_connection_error(None, &format!("websocket handshake failed: {err}"));
            return Err(err).context("websocket handshake failed");
        }
    };
    let (engine_side, pump_side) = tokio::io::duplex(PIPE_CAPACITY);
    let engine = tokio::spawn(handle_connection(engine_side, ctx));
    pump(ws, pump_side).await;
    engine.await.context("websocket session task failed")?
}

fn negotiate_subprotocol(request: &Request, mut response: Response) -> Result<Response, ErrorResponse> {
    let offered = request
        .headers()
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|proto| proto.trim().eq_ignore_ascii_case(MQTT_SUBPROTOCOL));
    if offered {
        response
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(MQTT_SUBPROTOCOL));
    }
    Ok(response)
}

/// Shuttle binary frames between the socket and the engine's byte pipe until either side closes.
async fn pump(ws: WebSocketStream<TcpStream>, pipe: DuplexStream) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (mut pipe_rx, mut pipe_tx) = tokio::io::split(pipe);

    let inbound = async {
        while let Some(message) = ws_rx.next().await {
            match message {
                Ok(Message::Binary(data)) => {
                    if pipe_tx.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        let _ = pipe_tx.shutdown().await;
    };
    let outbound = async {
        let mut buf = vec![0u8; 8 * 1024];
        loop {
            match pipe_rx.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if ws_tx.send(Message::Binary(buf[..n].to_vec())).await.is_err() {
                        return;
                    }
                }
            }
        }
        let _ = ws_tx.close().await;
    };
    tokio::select! {
        _ = inbound => {}
        _ = outbound => {}
    }
}
