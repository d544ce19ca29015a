//! Plaintext-HTTP sniffing on a TLS port.
//!
//! The first read of a connection peeks up to [`SNIFF_WINDOW`] bytes. A
//! complete HTTP request with a `Host` header is answered with a 307 to the
//! same URL over HTTPS and the connection is closed. Anything else, a TLS
//! ClientHello included, is replayed byte for byte to the caller before the
//! stream reads from the socket again.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

/// Bytes read from a fresh connection before deciding how to treat it.
pub const SNIFF_WINDOW: usize = 2048;

const MAX_HEADERS: usize = 64;

enum SniffState {
    /// Nothing read yet.
    Unsniffed,
    /// Writing the redirect response.
    Redirecting { response: Vec<u8>, written: usize },
    /// Redirect written; shutting down the write half.
    ShuttingDown,
    /// Redirect sent and the stream closed.
    Closed,
    /// Not HTTP. Peeked bytes are returned first, then the socket.
    Passthrough { buf: Vec<u8>, pos: usize },
}

/// Stream wrapper that redirects plaintext HTTP to HTTPS.
pub struct SniffingStream<S> {
    inner: S,
    state: SniffState,
}

impl<S> SniffingStream<S> {
    /// Wraps a freshly accepted stream.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            state: SniffState::Unsniffed,
        }
    }

    /// The wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Returns true once a redirect has been issued for this connection.
    pub fn is_redirected(&self) -> bool {
        matches!(
            self.state,
            SniffState::Redirecting { .. } | SniffState::ShuttingDown | SniffState::Closed
        )
    }

    /// Returns true once the stream has been classified as not HTTP.
    pub fn is_passthrough(&self) -> bool {
        matches!(self.state, SniffState::Passthrough { .. })
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for SniffingStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            match &mut this.state {
                SniffState::Unsniffed => {
                    let mut peek = [0u8; SNIFF_WINDOW];
                    let mut peek_buf = ReadBuf::new(&mut peek);

                    this.state = match Pin::new(&mut this.inner).poll_read(cx, &mut peek_buf) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(e)) => {
                            // A failed peek is "not HTTP"; the socket reports the error again
                            debug!("Sniff read failed: {}", e);
                            SniffState::Passthrough {
                                buf: Vec::new(),
                                pos: 0,
                            }
                        }
                        Poll::Ready(Ok(())) => {
                            let peeked = peek_buf.filled();
                            match redirect_response(peeked) {
                                Some(response) => SniffState::Redirecting {
                                    response,
                                    written: 0,
                                },
                                None => SniffState::Passthrough {
                                    buf: peeked.to_vec(),
                                    pos: 0,
                                },
                            }
                        }
                    };
                }
                SniffState::Redirecting { response, written } => {
                    while *written < response.len() {
                        match Pin::new(&mut this.inner).poll_write(cx, &response[*written..]) {
                            Poll::Pending => return Poll::Pending,
                            Poll::Ready(Ok(0)) | Poll::Ready(Err(_)) => break,
                            Poll::Ready(Ok(n)) => *written += n,
                        }
                    }
                    this.state = SniffState::ShuttingDown;
                }
                SniffState::ShuttingDown => {
                    if Pin::new(&mut this.inner).poll_shutdown(cx).is_pending() {
                        return Poll::Pending;
                    }
                    this.state = SniffState::Closed;
                }
                SniffState::Closed => return Poll::Ready(Ok(())),
                SniffState::Passthrough { buf, pos } => {
                    if *pos < buf.len() {
                        let n = (buf.len() - *pos).min(out.remaining());
                        out.put_slice(&buf[*pos..*pos + n]);
                        *pos += n;
                        if *pos == buf.len() {
                            *buf = Vec::new();
                            *pos = 0;
                        }
                        return Poll::Ready(Ok(()));
                    }
                    return Pin::new(&mut this.inner).poll_read(cx, out);
                }
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for SniffingStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.is_redirected() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        Pin::new(&mut this.inner).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.is_redirected() {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.is_redirected() {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

/// Builds the redirect for a complete HTTP request, or `None` if `bytes`
/// is not one.
fn redirect_response(bytes: &[u8]) -> Option<Vec<u8>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);

    match request.parse(bytes) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return None,
    }

    let host = request
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("host"))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .map(str::trim)
        .filter(|h| !h.is_empty())?;

    // Only origin-form targets carry a path we can reuse
    let path = request.path.filter(|p| p.starts_with('/')).unwrap_or("/");

    debug!(host, path, "Redirecting plaintext HTTP to HTTPS");
    Some(
        format!(
            "HTTP/1.1 307 Temporary Redirect\r\nLocation: https://{}{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            host, path
        )
        .into_bytes(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn http_request_is_redirected() {
        let (mut client, server) = duplex(4096);
        let mut stream = SniffingStream::new(server);

        client
            .write_all(b"GET /foo HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        assert!(stream.is_redirected());

        // No further reads are serviced, even with more bytes on the socket
        let _ = client.write_all(b"more").await;
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);

        let err = stream.write(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);

        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 307 Temporary Redirect\r\n"));
        assert!(response.contains("Location: https://example.com/foo\r\n"));
        assert!(response.contains("Connection: close\r\n"));
    }

    #[test]
    fn redirect_keeps_port_and_query() {
        let response = redirect_response(
            b"GET /xui/login?next=%2F HTTP/1.1\r\nHost: panel.local:54321\r\nUser-Agent: curl\r\n\r\n",
        )
        .unwrap();
        let response = String::from_utf8(response).unwrap();
        assert!(response.contains("Location: https://panel.local:54321/xui/login?next=%2F\r\n"));
    }

    #[tokio::test]
    async fn non_http_bytes_are_replayed() {
        let (mut client, server) = duplex(4096);
        let mut stream = SniffingStream::new(server);

        let mut sent = vec![0x16, 0x03, 0x01, 0x02, 0x00, 0x01, 0x00, 0x01, 0xfc, 0x03, 0x03];
        sent.extend_from_slice(&[0xab; 5]);
        sent.extend_from_slice(b"hello");
        assert_eq!(sent.len(), 21);
        client.write_all(&sent).await.unwrap();

        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &sent[..]);
        assert!(stream.is_passthrough());

        // Afterwards the stream is transparent in both directions
        client.write_all(b"next").await.unwrap();
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"next");

        stream.write_all(b"reply").await.unwrap();
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"reply");
    }

    #[tokio::test]
    async fn replay_respects_small_reads() {
        let (mut client, server) = duplex(4096);
        let mut stream = SniffingStream::new(server);
        let sent = b"\x16\x03\x01 not http at all";
        client.write_all(sent).await.unwrap();

        let mut collected = Vec::new();
        let mut chunk = [0u8; 4];
        while collected.len() < sent.len() {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "stream ended after {} bytes", collected.len());
            collected.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(collected, sent);
    }

    #[tokio::test]
    async fn partial_request_is_passthrough() {
        let (mut client, server) = duplex(4096);
        let mut stream = SniffingStream::new(server);
        client.write_all(b"GET / HTTP/1.1\r\nHost: a").await.unwrap();

        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"GET / HTTP/1.1\r\nHost: a");
        assert!(stream.is_passthrough());
    }

    #[test]
    fn missing_host_is_passthrough() {
        assert!(redirect_response(b"GET / HTTP/1.0\r\n\r\n").is_none());
        assert!(redirect_response(b"GET / HTTP/1.1\r\nHost: \r\n\r\n").is_none());
    }

    #[tokio::test]
    async fn eof_before_any_bytes() {
        let (client, server) = duplex(64);
        drop(client);
        let mut stream = SniffingStream::new(server);

        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        assert!(stream.is_passthrough());
    }

    /// Fails its first read, then serves `data`.
    struct FlakyStream {
        failed: bool,
        data: &'static [u8],
    }

    impl AsyncRead for FlakyStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if !self.failed {
                self.failed = true;
                return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
            }
            let n = self.data.len().min(buf.remaining());
            buf.put_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for FlakyStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            data: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(data.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn peek_error_falls_back_to_passthrough() {
        let mut stream = SniffingStream::new(FlakyStream {
            failed: false,
            data: b"\x16\x03\x01after",
        });

        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        assert!(stream.is_passthrough());
        assert!(!stream.is_redirected());
        assert_eq!(&buf[..n], b"\x16\x03\x01after");
    }
}
