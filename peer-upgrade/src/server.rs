//! Installer HTTP surface: peers fetch lists and binaries, the local app lists.
//!
//! Routes (GET only):
//! - `/installers`, `/list`: JSON array of descriptors held by this device
//! - `/installers/<hash>`: raw installer bytes
//!
//! HTTP/1.1 keep-alive with `Content-Length` on every response.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use futures::StreamExt;
use peer_upgrade_core::short_hash;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::storage::InstallerStore;

/// Largest request head accepted before the connection is dropped.
const MAX_HEAD_LEN: usize = 16 * 1024;

const NOT_FOUND_BODY: &[u8] = br#"{"error":"not found"}"#;
const NOT_ALLOWED_BODY: &[u8] = br#"{"error":"method not allowed"}"#;

pub struct HttpServer {
    local_addr: SocketAddr,
    accept_task: Option<JoinHandle<()>>,
}

impl HttpServer {
    /// Listen on every interface; port 0 picks a free one.
    pub async fn bind(port: u16, store: InstallerStore) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
        let local_addr = listener.local_addr()?;
        info!(port = local_addr.port(), "installer server listening");
        Ok(Self {
            local_addr,
            accept_task: Some(tokio::spawn(accept_loop(listener, store))),
        })
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and drop every open connection.
    pub async fn shutdown(mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
            let _ = task.await;
        }
        info!(port = self.port(), "installer server stopped");
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

/// Connections live in the accept task's set, so aborting it closes them all.
async fn accept_loop(listener: TcpListener, store: InstallerStore) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let store = store.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, &store).await {
                            debug!(%peer, error = %e, "connection closed");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Request {
    method: String,
    path: String,
    keep_alive: bool,
}

/// Parse one request head from the front of `buf`. Returns the request and
/// the bytes it used, or None if the head is not complete yet.
fn parse_request(buf: &[u8]) -> io::Result<Option<(Request, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    let status = req
        .parse(buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let httparse::Status::Complete(consumed) = status else {
        return Ok(None);
    };
    let mut keep_alive = req.version != Some(0);
    for h in req.headers.iter() {
        if h.name.eq_ignore_ascii_case("Connection") {
            let value = String::from_utf8_lossy(h.value);
            if value.trim().eq_ignore_ascii_case("close") {
                keep_alive = false;
            } else if value.trim().eq_ignore_ascii_case("keep-alive") {
                keep_alive = true;
            }
        }
    }
    let request = Request {
        method: req.method.unwrap_or_default().to_string(),
        path: req.path.unwrap_or_default().to_string(),
        keep_alive,
    };
    Ok(Some((request, consumed)))
}

#[derive(Debug, PartialEq, Eq)]
enum Route<'a> {
    List,
    Installer(&'a str),
    Unknown,
}

fn route(path: &str) -> Route<'_> {
    let path = path.split('?').next().unwrap_or_default();
    match path {
        "/list" | "/installers" | "/installers/" => Route::List,
        _ => match path.strip_prefix("/installers/") {
            Some(hash) if !hash.is_empty() && !hash.contains('/') => Route::Installer(hash),
            _ => Route::Unknown,
        },
    }
}

async fn handle_connection(mut stream: TcpStream, store: &InstallerStore) -> io::Result<()> {
    let mut buf = Vec::with_capacity(4096);
    loop {
        let request = loop {
            if let Some((request, consumed)) = parse_request(&buf)? {
                buf.drain(..consumed);
                break request;
            }
            if buf.len() > MAX_HEAD_LEN {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "request head too large",
                ));
            }
            if stream.read_buf(&mut buf).await? == 0 {
                return Ok(());
            }
        };
        if !respond(&mut stream, store, &request).await? {
            return Ok(());
        }
    }
}

/// Write the response. Returns whether the connection stays open.
async fn respond(stream: &mut TcpStream, store: &InstallerStore, req: &Request) -> io::Result<bool> {
    if req.method != "GET" {
        debug!(method = %req.method, path = %req.path, "method not allowed");
        write_json(stream, "405 Method Not Allowed", NOT_ALLOWED_BODY, false).await?;
        return Ok(false);
    }
    let keep_alive = req.keep_alive;
    match route(&req.path) {
        Route::List => {
            let body = serde_json::to_vec(&store.list())?;
            write_json(stream, "200 OK", &body, keep_alive).await?;
        }
        Route::Installer(hash) => match store.get(hash) {
            Some(installer) => {
                debug!(hash = short_hash(hash), "serving installer");
                write_head(
                    stream,
                    "200 OK",
                    "application/octet-stream",
                    installer.size,
                    keep_alive,
                )
                .await?;
                let mut body = store.create_read_stream(hash);
                let mut sent = 0u64;
                while let Some(chunk) = body.next().await {
                    let chunk = chunk.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                    stream.write_all(&chunk).await?;
                    sent += chunk.len() as u64;
                }
                if sent != installer.size {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("installer changed on disk: sent {} of {}", sent, installer.size),
                    ));
                }
            }
            None => write_json(stream, "404 Not Found", NOT_FOUND_BODY, keep_alive).await?,
        },
        Route::Unknown => write_json(stream, "404 Not Found", NOT_FOUND_BODY, keep_alive).await?,
    }
    stream.flush().await?;
    Ok(keep_alive)
}

async fn write_head(
    stream: &mut TcpStream,
    status: &str,
    content_type: &str,
    len: u64,
    keep_alive: bool,
) -> io::Result<()> {
    let head = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: {}\r\n\r\n",
        status,
        content_type,
        len,
        if keep_alive { "keep-alive" } else { "close" }
    );
    stream.write_all(head.as_bytes()).await
}

async fn write_json(
    stream: &mut TcpStream,
    status: &str,
    body: &[u8],
    keep_alive: bool,
) -> io::Result<()> {
    write_head(stream, status, "application/json", body.len() as u64, keep_alive).await?;
    stream.write_all(body).await?;
    stream.flush().await
}
