//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use app_server::http::{Phase, Route, ServeError, Server, ServerOptions};
use app_server::observability::MemoryLogger;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A server built for a test, not yet serving.
pub struct Harness {
    pub server: Server,
    pub logger: Arc<MemoryLogger>,
    pub root: CancellationToken,
    pub listener: TcpListener,
    pub addr: SocketAddr,
}

/// Build a server on an ephemeral loopback port with a memory logger.
pub async fn harness(options: ServerOptions, routes: Vec<Route>) -> Harness {
    let logger = Arc::new(MemoryLogger::new());
    let root = CancellationToken::new();
    let server = Server::new(root.clone(), "", options.with_logger(logger.clone())).unwrap();
    server.register_all(routes).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    Harness {
        server,
        logger,
        root,
        listener,
        addr,
    }
}

/// A server that is already serving.
pub struct Running {
    pub server: Server,
    pub logger: Arc<MemoryLogger>,
    pub root: CancellationToken,
    pub addr: SocketAddr,
    pub task: JoinHandle<Result<(), ServeError>>,
}

impl Running {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn stop(self) {
        self.server.shutdown(Duration::from_secs(2)).await.unwrap();
        self.task.await.unwrap().unwrap();
    }
}

/// Build and start serving; returns once the server reports `Serving`.
pub async fn start(options: ServerOptions, routes: Vec<Route>) -> Running {
    let Harness {
        server,
        logger,
        root,
        listener,
        addr,
    } = harness(options, routes).await;

    let mut phase = server.watch_phase();
    let serving = server.clone();
    let task = tokio::spawn(async move { serving.serve(listener).await });
    phase.wait_for(|p| *p == Phase::Serving).await.unwrap();

    Running {
        server,
        logger,
        root,
        addr,
        task,
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

/// A response read straight off the socket.
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub head: String,
    pub body: Vec<u8>,
}

/// Send raw bytes on an open connection.
pub async fn send_raw(stream: &mut TcpStream, request: &str) {
    stream.write_all(request.as_bytes()).await.unwrap();
}

/// Read one `Content-Length` framed response. `None` if the peer closed the
/// connection first.
pub async fn read_response(stream: &mut TcpStream) -> Option<RawResponse> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let status = head.split_whitespace().nth(1)?.parse().ok()?;
    let length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);

    while buf.len() < head_end + length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    Some(RawResponse {
        status,
        head,
        body: buf[head_end..head_end + length].to_vec(),
    })
}

pub fn get_request(path: &str, extra_headers: &[(&str, &str)]) -> String {
    let mut request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n");
    for (name, value) in extra_headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");
    request
}
