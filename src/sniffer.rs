use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Give up looking for a first line once this many bytes are buffered
pub const MAX_SNIFF_BYTES: usize = 4096;

/// Which side of an HTTP exchange a stream carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to server: the first line is `METHOD PATH VERSION`
    Request,
    /// Server to client: the first line is `VERSION STATUS REASON`
    Response,
}

/// HTTP metadata recovered from the first line of a stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SniffResult {
    pub method: Option<String>,
    pub path: Option<String>,
    pub status: Option<String>,
}

/// Stream decorator that passively records the first line of traffic.
///
/// Reads and writes are forwarded untouched. Bytes returned by reads are
/// copied into a small side buffer until a `\n` is seen or more than
/// [`MAX_SNIFF_BYTES`] have accumulated, after which the sniffer freezes and
/// never inspects data again.
#[derive(Debug)]
pub struct Sniffer<S> {
    inner: S,
    direction: Direction,
    buffer: BytesMut,
    captured: bool,
    result: SniffResult,
}

impl<S> Sniffer<S> {
    pub fn new(inner: S, direction: Direction) -> Self {
        Self {
            inner,
            direction,
            buffer: BytesMut::new(),
            captured: false,
            result: SniffResult::default(),
        }
    }

    /// Whether sniffing has finished, successfully or not
    #[cfg(test)]
    pub fn is_captured(&self) -> bool {
        self.captured
    }

    #[cfg(test)]
    pub fn result(&self) -> &SniffResult {
        &self.result
    }

    pub fn into_parts(self) -> (S, SniffResult) {
        (self.inner, self.result)
    }

    fn observe(&mut self, data: &[u8]) {
        if self.captured || data.is_empty() {
            return;
        }

        self.buffer.extend_from_slice(data);

        if let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line = String::from_utf8_lossy(&self.buffer[..newline]).into_owned();
            self.capture(&line);
        } else if self.buffer.len() > MAX_SNIFF_BYTES {
            self.freeze();
        }
    }

    fn capture(&mut self, line: &str) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 2 {
            match self.direction {
                Direction::Request => {
                    self.result.method = Some(fields[0].to_string());
                    self.result.path = Some(fields[1].to_string());
                }
                Direction::Response => {
                    self.result.status = Some(fields[1].to_string());
                }
            }
        }
        self.freeze();
    }

    fn freeze(&mut self) {
        self.captured = true;
        // Release the allocation, not just the contents
        self.buffer = BytesMut::new();
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Sniffer<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            if !this.captured {
                this.observe(&buf.filled()[before..]);
            }
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Sniffer<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
