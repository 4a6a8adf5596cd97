//! HTTP/1.1 front door: each accepted connection carries one request, bridged as one stream.
//!
//! Responses are written with chunked transfer encoding since the bridged engine does not
//! announce a length. Async-mode streams pull the body `pull_chunk` bytes at a time, only after
//! the previous chunk reached the socket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use bridge_core::{Client, HeaderList, HttpCallbacks, StreamError, StreamId};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const MAX_HEAD: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;

/// Callback as forwarded from the engine thread to the connection task.
#[derive(Debug)]
enum Event {
    Headers(HeaderList, bool),
    Data(Bytes, bool),
    Trailers(HeaderList),
    Complete,
    Cancel,
    Error(StreamError),
}

/// Forwards callbacks to the connection task.
struct ChannelCallbacks(mpsc::UnboundedSender<Event>);

impl ChannelCallbacks {
    fn send(&self, e: Event) {
        // Receiver gone means the connection task already finished.
        let _ = self.0.send(e);
    }
}

impl HttpCallbacks for ChannelCallbacks {
    fn on_headers(&mut self, headers: HeaderList, end_stream: bool) {
        self.send(Event::Headers(headers, end_stream));
    }
    fn on_data(&mut self, data: Bytes, end_stream: bool) {
        self.send(Event::Data(data, end_stream));
    }
    fn on_trailers(&mut self, trailers: HeaderList) {
        self.send(Event::Trailers(trailers));
    }
    fn on_complete(&mut self) {
        self.send(Event::Complete);
    }
    fn on_cancel(&mut self) {
        self.send(Event::Cancel);
    }
    fn on_error(&mut self, error: StreamError) {
        self.send(Event::Error(error));
    }
}

/// Settings each connection needs.
#[derive(Clone)]
pub struct Front {
    pub client: Client,
    pub async_mode: bool,
    pub pull_chunk: u64,
    next_id: Arc<AtomicU64>,
}

impl Front {
    pub fn new(client: Client, async_mode: bool, pull_chunk: u64) -> Self {
        Self {
            client,
            async_mode,
            pull_chunk: pull_chunk.max(1),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn next_id(&self) -> StreamId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Accept connections and bridge each one.
pub async fn run(bind: SocketAddr, front: Front) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    tracing::info!(%bind, "listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        let front = front.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, front).await {
                tracing::debug!(%peer, error = %e, "connection ended");
            }
        });
    }
}

/// Request head parsed into bridge headers.
struct RequestHead {
    headers: HeaderList,
    content_length: u64,
    head_len: usize,
}

/// Parse a complete request head. `Ok(None)` means more bytes are needed.
fn parse_head(buf: &[u8]) -> anyhow::Result<Option<RequestHead>> {
    let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut raw);
    let head_len = match req.parse(buf)? {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Ok(None),
    };
    let mut headers = HeaderList::new();
    headers.push(":method", req.method.unwrap_or("GET"));
    headers.push(":scheme", "http");
    headers.push(":path", req.path.unwrap_or("/"));
    let mut content_length = 0;
    for h in req.headers.iter() {
        let value = std::str::from_utf8(h.value)
            .context("non-UTF-8 header value")?
            .trim();
        let name = h.name.to_ascii_lowercase();
        match name.as_str() {
            "host" => headers.push(":authority", value),
            "content-length" => content_length = value.parse().context("bad content-length")?,
            "transfer-encoding" => bail!("request transfer-encoding not supported"),
            "connection" | "keep-alive" => {}
            _ => headers.push(name, value),
        }
    }
    Ok(Some(RequestHead {
        headers,
        content_length,
        head_len,
    }))
}

async fn handle_connection(stream: TcpStream, front: Front) -> anyhow::Result<()> {
    let (mut rd, mut wr) = stream.into_split();
    let mut buf = Vec::with_capacity(4096);
    let head = loop {
        let mut chunk = [0u8; 4096];
        let n = rd.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        match parse_head(&buf) {
            Ok(Some(head)) => break head,
            Ok(None) if buf.len() < MAX_HEAD => continue,
            Ok(None) => {
                write_simple(&mut wr, "431 Request Header Fields Too Large", "").await?;
                return Ok(());
            }
            Err(e) => {
                write_simple(&mut wr, "400 Bad Request", &e.to_string()).await?;
                return Ok(());
            }
        }
    };

    let id = front.next_id();
    let (tx, mut rx) = mpsc::unbounded_channel();
    front.client.start_stream(id, ChannelCallbacks(tx));
    let mut guard = CancelOnDrop {
        client: &front.client,
        id,
        armed: true,
    };
    tracing::debug!(stream = id, "request accepted");

    let body_start = buf.split_off(head.head_len);
    let mut remaining = head.content_length;
    front
        .client
        .send_headers(id, head.headers, remaining == 0);
    if remaining > 0 {
        let first = Bytes::from(body_start);
        let first = first.slice(..first.len().min(remaining as usize));
        remaining -= first.len() as u64;
        if !first.is_empty() {
            front.client.send_data(id, first, remaining == 0);
        }
        while remaining > 0 {
            let mut chunk = vec![0u8; remaining.min(16 * 1024) as usize];
            let n = rd.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            chunk.truncate(n);
            remaining -= n as u64;
            front.client.send_data(id, Bytes::from(chunk), remaining == 0);
        }
    }

    // Bytes past the declared body are read and discarded. EOF is only a half-close, so the
    // response is still written; a read error ends the connection and cancels the stream.
    let mut discard = [0u8; 512];
    let mut read_open = true;
    let mut head_written = false;
    loop {
        let event = tokio::select! {
            ev = rx.recv() => ev,
            r = rd.read(&mut discard), if read_open => {
                match r {
                    Ok(0) => {
                        tracing::debug!(stream = id, "peer finished sending");
                        read_open = false;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(stream = id, error = %e, "peer went away");
                        return Ok(());
                    }
                }
                continue;
            }
        };
        let Some(event) = event else {
            bail!("stream {id} callbacks dropped without a terminal event");
        };
        match event {
            Event::Headers(headers, end_stream) => {
                write_head(&mut wr, &headers).await?;
                head_written = true;
                if end_stream {
                    wr.write_all(b"0\r\n\r\n").await?;
                } else if front.async_mode {
                    front.client.resume_data(id, front.pull_chunk);
                }
            }
            Event::Data(data, end_stream) => {
                write_chunk(&mut wr, &data).await?;
                if end_stream {
                    wr.write_all(b"0\r\n\r\n").await?;
                } else if front.async_mode {
                    front.client.resume_data(id, data.len() as u64);
                }
            }
            Event::Trailers(trailers) => {
                let mut out = b"0\r\n".to_vec();
                for (name, value) in trailers.iter() {
                    out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
                }
                out.extend_from_slice(b"\r\n");
                wr.write_all(&out).await?;
            }
            Event::Complete | Event::Cancel => {
                guard.armed = false;
                break;
            }
            Event::Error(e) => {
                guard.armed = false;
                tracing::debug!(stream = id, code = ?e.code, message = %e.message, "stream failed");
                if !head_written {
                    write_simple(&mut wr, "502 Bad Gateway", &e.message).await?;
                }
                break;
            }
        }
    }
    wr.shutdown().await?;
    Ok(())
}

/// Cancels the stream if the connection task leaves before a terminal callback.
struct CancelOnDrop<'a> {
    client: &'a Client,
    id: StreamId,
    armed: bool,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.client.cancel_stream(self.id);
        }
    }
}

async fn write_head(wr: &mut OwnedWriteHalf, headers: &HeaderList) -> std::io::Result<()> {
    let status = headers.status().unwrap_or(200);
    let mut out = format!("HTTP/1.1 {status} {}\r\n", reason(status));
    for (name, value) in headers.iter().filter(|(n, _)| !n.starts_with(':')) {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("transfer-encoding: chunked\r\nconnection: close\r\n\r\n");
    wr.write_all(out.as_bytes()).await
}

async fn write_chunk(wr: &mut OwnedWriteHalf, data: &[u8]) -> std::io::Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    wr.write_all(format!("{:x}\r\n", data.len()).as_bytes())
        .await?;
    wr.write_all(data).await?;
    wr.write_all(b"\r\n").await
}

async fn write_simple(wr: &mut OwnedWriteHalf, status: &str, body: &str) -> std::io::Result<()> {
    let out = format!(
        "HTTP/1.1 {status}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );
    wr.write_all(out.as_bytes()).await
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "",
    }
}
