//! Common test harness utilities for integration tests.
//!
//! This module provides helpers for:
//! - Running a scripted permission service over plain HTTP
//! - Building broker configurations that point at it
//! - Speaking just enough MQTT to drive the broker

// Not all test files use all helpers; silence dead_code warnings for unused exports.
#![allow(dead_code)]

use gatehouse::config::{Config, Scheme};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

/// One request as seen by the fake permission service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenRequest {
    pub path: String,
    pub token: Option<String>,
    pub key: Option<String>,
}

/// Reply chosen by the scripted policy.
#[derive(Debug, Clone, Copy)]
pub struct Reply {
    pub status: u16,
    pub delay: Duration,
}

impl Reply {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

type Policy = Arc<dyn Fn(&SeenRequest) -> Reply + Send + Sync>;

/// Minimal HTTP/1.1 server standing in for the remote permission service.
pub struct FakePermissionServer {
    pub addr: SocketAddr,
    seen: Arc<Mutex<Vec<SeenRequest>>>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl FakePermissionServer {
    pub async fn start<F>(policy: F) -> Self
    where
        F: Fn(&SeenRequest) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake server");
        let addr = listener.local_addr().expect("fake server addr");
        let policy: Policy = Arc::new(policy);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        {
            let seen = seen.clone();
            let active = active.clone();
            let peak = peak.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((mut stream, _)) = listener.accept().await else {
                        continue;
                    };
                    let policy = policy.clone();
                    let seen = seen.clone();
                    let active = active.clone();
                    let peak = peak.clone();
                    tokio::spawn(async move {
                        let Some(request) = read_request(&mut stream).await else {
                            return;
                        };
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        seen.lock().push(request.clone());
                        let reply = policy(&request);
                        tokio::time::sleep(reply.delay).await;
                        let response = format!(
                            "HTTP/1.1 {} Scripted\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                            reply.status
                        );
                        let _ = stream.write_all(response.as_bytes()).await;
                        let _ = stream.shutdown().await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            });
        }
        Self {
            addr,
            seen,
            active,
            peak,
        }
    }

    pub fn requests(&self) -> Vec<SeenRequest> {
        self.seen.lock().clone()
    }

    pub fn hits(&self, path: &str) -> usize {
        self.seen.lock().iter().filter(|r| r.path == path).count()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Broker configuration pointing at this server over plain HTTP.
    pub fn config(&self) -> Config {
        config_for(self.addr)
    }
}

async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> Option<SeenRequest> {
    let mut raw = Vec::new();
    let mut buf = [0u8; 1024];
    while !raw.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        raw.extend_from_slice(&buf[..n]);
    }
    let text = String::from_utf8_lossy(&raw);
    let mut lines = text.split("\r\n");
    let path = lines.next()?.split_whitespace().nth(1)?.to_string();
    let mut token = None;
    let mut key = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            match name.trim().to_ascii_lowercase().as_str() {
                "x-api-token" => token = Some(value.trim().to_string()),
                "x-api-key" => key = Some(value.trim().to_string()),
                _ => {}
            }
        }
    }
    Some(SeenRequest { path, token, key })
}

/// Config with the remote at `addr`, both listeners on ephemeral loopback ports.
pub fn config_for(addr: SocketAddr) -> Config {
    let mut cfg = Config::default();
    cfg.remote.host = addr.ip().to_string();
    cfg.remote.port = addr.port();
    cfg.remote.scheme = Scheme::Http;
    cfg.remote.timeout_ms = 2_000;
    cfg.listeners.bind_host = "127.0.0.1".into();
    cfg.listeners.mqtt.enabled = true;
    cfg.listeners.mqtt.port = 0;
    cfg.listeners.websocket.enabled = true;
    cfg.listeners.websocket.port = 0;
    cfg
}

/// An address nothing is listening on.
pub async fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    listener.local_addr().expect("addr")
}

// -----------------------------------------------------------------------------
// MQTT client frames
// -----------------------------------------------------------------------------

fn mqtt_str(s: &str) -> Vec<u8> {
    let mut out = (s.len() as u16).to_be_bytes().to_vec();
    out.extend_from_slice(s.as_bytes());
    out
}

fn frame(header: u8, body: Vec<u8>) -> Vec<u8> {
    assert!(body.len() < 128, "test frames use a single length byte");
    let mut out = vec![header, body.len() as u8];
    out.extend(body);
    out
}

pub fn connect_frame(client_id: &str, username: &str, password: &str) -> Vec<u8> {
    let mut body = mqtt_str("MQTT");
    body.push(4);
    body.push(0xC2);
    body.extend_from_slice(&30u16.to_be_bytes());
    body.extend(mqtt_str(client_id));
    body.extend(mqtt_str(username));
    body.extend(mqtt_str(password));
    frame(0x10, body)
}

pub fn subscribe_frame(packet_id: u16, filters: &[&str]) -> Vec<u8> {
    let mut body = packet_id.to_be_bytes().to_vec();
    for filter in filters {
        body.extend(mqtt_str(filter));
        body.push(0x00);
    }
    frame(0x82, body)
}

pub fn publish_frame(topic: &str, payload: &[u8]) -> Vec<u8> {
    let mut body = mqtt_str(topic);
    body.extend_from_slice(payload);
    frame(0x30, body)
}

pub fn publish_qos1_frame(topic: &str, mid: u16, payload: &[u8]) -> Vec<u8> {
    let mut body = mqtt_str(topic);
    body.extend_from_slice(&mid.to_be_bytes());
    body.extend_from_slice(payload);
    frame(0x32, body)
}

pub async fn send<S: AsyncWrite + Unpin>(stream: &mut S, bytes: &[u8]) {
    stream.write_all(bytes).await.expect("write to broker");
}

/// Read exactly `n` bytes with a generous timeout.
pub async fn recv<S: AsyncRead + Unpin>(stream: &mut S, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("broker reply timed out")
        .expect("read from broker");
    buf
}

/// True when nothing arrives within `wait`.
pub async fn silent<S: AsyncRead + Unpin>(stream: &mut S, wait: Duration) -> bool {
    let mut buf = [0u8; 1];
    tokio::time::timeout(wait, stream.read(&mut buf)).await.is_err()
}
