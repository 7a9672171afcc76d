//! One accepted client: read its request head, answer `200 OK`, then stream
//! heartbeats until the client goes away or the server shuts down.

use std::time::Duration;

use tracing::debug;

use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::Error;

/// The line every client receives once per interval
pub const HEARTBEAT: &[u8] = b"heartbeat\n";

pub(crate) const CHUNKED_HEAD: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nTransfer-Encoding: chunked\r\n\r\n";

pub(crate) const CLOSE_DELIMITED_HEAD: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\n";

// `HEARTBEAT` framed as a single chunk: hex length, CRLF, data, CRLF
pub(crate) const HEARTBEAT_CHUNK: &[u8] = b"a\r\nheartbeat\n\r\n";

pub(crate) const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

const READ_BUF_SIZE: usize = 1024;

// Upper bound on the goodbye: final chunk, FIN, then discarding client input
const LINGER: Duration = Duration::from_millis(500);

/// Why a connection stopped streaming
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamEnd {
    /// The peer hung up, or a read or write on it failed
    ClientClosed,
    /// The server's shutdown token fired
    Shutdown,
}

/// How the unbounded body is delimited
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Framing {
    /// One chunk per beat, terminated by the last chunk on shutdown
    Chunked,
    /// Raw lines; the body ends when the connection closes.
    /// HTTP/1.0 clients do not understand chunked transfer coding.
    CloseDelimited,
}

impl Framing {
    pub fn for_request(head: &RequestHead) -> Self {
        match head.version() {
            Some("HTTP/1.0") => Framing::CloseDelimited,
            _ => Framing::Chunked,
        }
    }

    fn response_head(self) -> &'static [u8] {
        match self {
            Framing::Chunked => CHUNKED_HEAD,
            Framing::CloseDelimited => CLOSE_DELIMITED_HEAD,
        }
    }

    fn beat(self) -> &'static [u8] {
        match self {
            Framing::Chunked => HEARTBEAT_CHUNK,
            Framing::CloseDelimited => HEARTBEAT,
        }
    }

    fn trailer(self) -> &'static [u8] {
        match self {
            Framing::Chunked => LAST_CHUNK,
            Framing::CloseDelimited => b"",
        }
    }
}

/// What was read of a request before the response started.
///
/// Every request gets the same stream; only the protocol version picks the
/// framing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestHead {
    line: String,
    complete: bool,
}

impl RequestHead {
    fn parse(raw: &[u8], complete: bool) -> Self {
        let first = raw.split(|&b| b == b'\n').next().unwrap_or_default();
        let line = String::from_utf8_lossy(first).trim_end().to_owned();

        Self { line, complete }
    }

    /// Raw request line, e.g. `GET / HTTP/1.1`
    pub fn line(&self) -> &str {
        &self.line
    }

    pub fn method(&self) -> Option<&str> {
        self.line.split_whitespace().next()
    }

    pub fn target(&self) -> Option<&str> {
        self.line.split_whitespace().nth(1)
    }

    pub fn version(&self) -> Option<&str> {
        self.line.split_whitespace().nth(2)
    }

    /// False when the head was cut off by the size cap or by EOF
    pub fn is_complete(&self) -> bool {
        self.complete
    }
}

fn head_terminated(buf: &[u8]) -> bool {
    buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.windows(2).any(|w| w == b"\n\n")
}

/// Read until the blank line ending the request head, `max` bytes, or EOF.
///
/// Returns `None` when the peer closed without sending a single byte.
pub async fn read_request_head<R>(reader: &mut R, max: usize) -> Result<Option<RequestHead>, Error>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(READ_BUF_SIZE.min(max));
    let mut chunk = [0u8; READ_BUF_SIZE];

    loop {
        if head_terminated(&buf) {
            return Ok(Some(RequestHead::parse(&buf, true)));
        }
        if buf.len() >= max {
            return Ok(Some(RequestHead::parse(&buf, false)));
        }

        let want = READ_BUF_SIZE.min(max - buf.len());
        let n = reader.read(&mut chunk[..want]).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Ok(Some(RequestHead::parse(&buf, false)));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Serve one client from request to the end of its heartbeat stream
pub async fn serve<S>(
    stream: S,
    interval: Duration,
    max_request_head: usize,
    cancel: CancellationToken,
) -> Result<StreamEnd, Error>
where
    S: AsyncRead + AsyncWrite,
{
    let (mut reader, mut writer) = split(stream);

    let head = select! {
        head = read_request_head(&mut reader, max_request_head) => head?,
        _ = cancel.cancelled() => return Ok(StreamEnd::Shutdown),
    };

    let Some(head) = head else {
        debug!("Peer closed before sending a request");
        return Ok(StreamEnd::ClientClosed);
    };

    let framing = Framing::for_request(&head);
    debug!(
        method = head.method().unwrap_or("-"),
        target = head.target().unwrap_or("-"),
        complete = head.is_complete(),
        ?framing,
        "Starting heartbeat stream"
    );

    select! {
        biased;
        res = write_flushed(&mut writer, framing.response_head()) => {
            if let Err(e) = res {
                debug!("Response head write failed: {e}");
                return Ok(StreamEnd::ClientClosed);
            }
        }
        _ = cancel.cancelled() => return Ok(StreamEnd::Shutdown),
    }

    Ok(heartbeat(&mut reader, &mut writer, framing, interval, &cancel).await)
}

enum Idle {
    Elapsed,
    Cancelled,
    PeerGone,
}

/// Write a beat, wait, repeat.
///
/// The wait is a plain sleep, not compensated for write time, so beats drift
/// by the cost of each write. While waiting, the read half is drained: EOF or
/// a read error means the client is gone, and anything else it sends is
/// discarded.
pub async fn heartbeat<R, W>(
    reader: &mut R,
    writer: &mut W,
    framing: Framing,
    interval: Duration,
    cancel: &CancellationToken,
) -> StreamEnd
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut scratch = [0u8; READ_BUF_SIZE];
    let mut beats: u64 = 0;

    loop {
        select! {
            biased;
            res = write_flushed(writer, framing.beat()) => {
                if let Err(e) = res {
                    debug!("Heartbeat write failed after {beats} beats: {e}");
                    return StreamEnd::ClientClosed;
                }
            }
            // A client that stopped reading must not hold up shutdown
            _ = cancel.cancelled() => {
                debug!("Abandoning stalled heartbeat write after {beats} beats");
                return StreamEnd::Shutdown;
            }
        }
        beats += 1;

        match idle(reader, &mut scratch, interval, cancel).await {
            Idle::Elapsed => {}
            Idle::PeerGone => {
                debug!("Client left after {beats} beats");
                return StreamEnd::ClientClosed;
            }
            Idle::Cancelled => {
                debug!("Closing heartbeat stream after {beats} beats");
                close(reader, writer, framing, &mut scratch).await;
                return StreamEnd::Shutdown;
            }
        }
    }
}

async fn idle<R>(
    reader: &mut R,
    scratch: &mut [u8],
    interval: Duration,
    cancel: &CancellationToken,
) -> Idle
where
    R: AsyncRead + Unpin,
{
    let pause = sleep(interval);
    tokio::pin!(pause);

    loop {
        select! {
            _ = &mut pause => return Idle::Elapsed,
            _ = cancel.cancelled() => return Idle::Cancelled,
            read = reader.read(scratch) => {
                match read {
                    Ok(0) | Err(_) => return Idle::PeerGone,
                    // Request body or pipelined requests, ignored
                    Ok(_) => {}
                }
            }
        }
    }
}

/// End the body, send FIN, then drain client input so closing the socket
/// does not reset it before the client has read the end of the body.
async fn close<R, W>(reader: &mut R, writer: &mut W, framing: Framing, scratch: &mut [u8])
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let goodbye = async {
        if write_flushed(writer, framing.trailer()).await.is_err() {
            return;
        }
        if writer.shutdown().await.is_err() {
            return;
        }
        while let Ok(n) = reader.read(scratch).await {
            if n == 0 {
                break;
            }
        }
    };

    if timeout(LINGER, goodbye).await.is_err() {
        debug!("Client did not finish within {LINGER:?} of shutdown");
    }
}

async fn write_flushed<W>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await
}
