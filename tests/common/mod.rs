//! Shared utilities for integration tests: scripted raw-TCP upstreams and
//! a proxy launcher.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};

use llm_replay_proxy::config::ProxyConfig;
use llm_replay_proxy::http::HttpServer;
use llm_replay_proxy::lifecycle::Shutdown;

/// What the mock upstream answers with.
#[derive(Clone)]
pub enum Reply {
    /// `Content-Length` response whose body is written in `parts`, `gap` apart.
    Sized {
        status: u16,
        parts: Vec<&'static str>,
        gap: Duration,
    },
    /// Chunked response, one HTTP chunk per part, `gap` apart.
    Chunked { parts: Vec<String>, gap: Duration },
    /// Chunked response; each part after the first waits for a permit.
    Gated { parts: Vec<String>, gate: Arc<Semaphore> },
    /// Chunked response that never ends; reports on `closed` when a write fails.
    Endless { part: &'static str, gap: Duration },
}

/// A request as the upstream saw it.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    /// Request line plus headers, as raw text.
    pub head: String,
    pub body: Vec<u8>,
}

impl CapturedRequest {
    pub fn request_line(&self) -> &str {
        self.head.lines().next().unwrap_or_default()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (n, v) = line.split_once(':')?;
            n.trim().eq_ignore_ascii_case(name).then(|| v.trim())
        })
    }
}

pub struct MockUpstream {
    pub addr: SocketAddr,
    pub requests: mpsc::UnboundedReceiver<CapturedRequest>,
    pub closed: mpsc::UnboundedReceiver<()>,
}

/// Start a mock upstream on an ephemeral port answering every connection
/// with `reply`.
pub async fn start_upstream(reply: Reply) -> MockUpstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (requests_tx, requests) = mpsc::unbounded_channel();
    let (closed_tx, closed) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let reply = reply.clone();
            let requests_tx = requests_tx.clone();
            let closed_tx = closed_tx.clone();
            tokio::spawn(async move {
                let mut socket = socket;
                let _ = socket.set_nodelay(true);
                let Some(captured) = read_request(&mut socket).await else {
                    return;
                };
                let _ = requests_tx.send(captured);
                if write_reply(&mut socket, reply).await.is_err() {
                    let _ = closed_tx.send(());
                }
            });
        }
    });

    MockUpstream { addr, requests, closed }
}

/// An address nothing listens on.
pub async fn dead_address() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

async fn read_request(socket: &mut TcpStream) -> Option<CapturedRequest> {
    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];
    let head_end = loop {
        let n = socket.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        raw.extend_from_slice(&buf[..n]);
        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
    };

    let head = String::from_utf8_lossy(&raw[..head_end]).into_owned();
    let mut captured = CapturedRequest {
        head,
        body: raw[head_end + 4..].to_vec(),
    };
    let length: usize = captured
        .header("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    while captured.body.len() < length {
        let n = socket.read(&mut buf).await.ok()?;
        if n == 0 {
            break;
        }
        captured.body.extend_from_slice(&buf[..n]);
    }
    Some(captured)
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        404 => "Not Found",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

async fn write_reply(socket: &mut TcpStream, reply: Reply) -> std::io::Result<()> {
    const CHUNKED_HEAD: &str = "HTTP/1.1 200 OK\r\nContent-Type: application/x-ndjson\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n";

    match reply {
        Reply::Sized { status, parts, gap } => {
            let length: usize = parts.iter().map(|p| p.len()).sum();
            let head = format!(
                "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                status,
                reason(status),
                length
            );
            socket.write_all(head.as_bytes()).await?;
            for (i, part) in parts.iter().enumerate() {
                if i > 0 {
                    tokio::time::sleep(gap).await;
                }
                socket.write_all(part.as_bytes()).await?;
                socket.flush().await?;
            }
        }
        Reply::Chunked { parts, gap } => {
            socket.write_all(CHUNKED_HEAD.as_bytes()).await?;
            for part in parts {
                tokio::time::sleep(gap).await;
                write_chunk(socket, part.as_bytes()).await?;
            }
            socket.write_all(b"0\r\n\r\n").await?;
        }
        Reply::Gated { parts, gate } => {
            socket.write_all(CHUNKED_HEAD.as_bytes()).await?;
            for (i, part) in parts.iter().enumerate() {
                if i > 0 {
                    if let Ok(permit) = gate.acquire().await {
                        permit.forget();
                    }
                }
                write_chunk(socket, part.as_bytes()).await?;
            }
            socket.write_all(b"0\r\n\r\n").await?;
        }
        Reply::Endless { part, gap } => {
            socket.write_all(CHUNKED_HEAD.as_bytes()).await?;
            loop {
                write_chunk(socket, part.as_bytes()).await?;
                tokio::time::sleep(gap).await;
            }
        }
    }
    socket.flush().await?;
    let _ = socket.shutdown().await;
    Ok(())
}

/// One HTTP chunk in a single write.
async fn write_chunk(socket: &mut TcpStream, bytes: &[u8]) -> std::io::Result<()> {
    let mut frame = format!("{:x}\r\n", bytes.len()).into_bytes();
    frame.extend_from_slice(bytes);
    frame.extend_from_slice(b"\r\n");
    socket.write_all(&frame).await?;
    socket.flush().await
}

/// Proxy configuration pointing at `upstream`, listening on an ephemeral port.
pub fn config_for(upstream: SocketAddr) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.upstream.base_url = format!("http://{}", upstream);
    config.upstream.connect_timeout_secs = 2;
    config
}

/// Start the proxy; returns its address and the shutdown handle.
pub async fn start_proxy(config: ProxyConfig) -> (SocketAddr, Shutdown) {
    let listener = TcpListener::bind(&config.listener.bind_address).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HttpServer::new(config).unwrap();
    let shutdown = Shutdown::new();
    let rx = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, rx).await;
    });
    (addr, shutdown)
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .pool_max_idle_per_host(0)
        .build()
        .unwrap()
}
