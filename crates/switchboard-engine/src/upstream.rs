//! Second-hop proxy connection factory.
//!
//! Plain targets travel as absolute-form requests over a TCP connection to
//! the upstream proxy. TLS targets are negotiated with CONNECT: the proxy's
//! response is buffered and parsed defensively, and anything other than a
//! 200 destroys the socket before a single byte of the caller's request
//! (which may carry credentials) can reach it — the buffered proxy response
//! is handed back for verbatim replay to the client instead.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use switchboard_routes::HostPort;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::http::IO_CHUNK_SIZE;

/// Explicit slot accounting around upstream-proxy sockets: a slot is
/// reserved synchronously before the connect starts and released when the
/// guard drops, so `in_use` stays correct while connects are pending.
pub struct ConnectionPool {
    in_use: Mutex<usize>,
    max_sockets: usize,
}

impl ConnectionPool {
    pub fn new(max_sockets: usize) -> Arc<Self> {
        Arc::new(Self {
            in_use: Mutex::new(0),
            max_sockets,
        })
    }

    pub fn reserve(self: &Arc<Self>) -> io::Result<PoolSlot> {
        let mut in_use = self.in_use.lock().expect("pool lock poisoned");
        if self.max_sockets > 0 && *in_use >= self.max_sockets {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("upstream proxy socket pool exhausted ({} in use)", *in_use),
            ));
        }
        *in_use += 1;
        Ok(PoolSlot {
            pool: Arc::clone(self),
        })
    }

    pub fn in_use(&self) -> usize {
        *self.in_use.lock().expect("pool lock poisoned")
    }
}

pub struct PoolSlot {
    pool: Arc<ConnectionPool>,
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        let mut in_use = self.pool.in_use.lock().expect("pool lock poisoned");
        *in_use = in_use.saturating_sub(1);
    }
}

/// Header block of the upstream proxy's CONNECT response. Duplicate header
/// names accumulate into a list; a colon-less line is a protocol error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ProxyConnectResponse {
    pub status_code: u16,
    pub status_text: String,
    pub headers: Vec<(String, Vec<String>)>,
}

pub(crate) fn parse_proxy_connect_response(head: &[u8]) -> io::Result<ProxyConnectResponse> {
    let text = std::str::from_utf8(head).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "proxy CONNECT response was not valid UTF-8",
        )
    })?;
    let mut lines = text.split("\r\n");
    let status_line = lines.next().filter(|line| !line.is_empty()).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "no header received from proxy CONNECT response",
        )
    })?;

    let mut parts = status_line.split(' ');
    let _version = parts.next();
    let status_code = parts
        .next()
        .and_then(|text| text.parse::<u16>().ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                "proxy CONNECT response had no status code",
            )
        })?;
    let status_text = parts.collect::<Vec<_>>().join(" ");

    let mut headers: Vec<(String, Vec<String>)> = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':').ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid header from proxy CONNECT response: {line:?}"),
            )
        })?;
        let name = name.to_ascii_lowercase();
        let value = value.trim_start().to_string();
        match headers.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, values)) => values.push(value),
            None => headers.push((name, vec![value])),
        }
    }

    Ok(ProxyConnectResponse {
        status_code,
        status_text,
        headers,
    })
}

/// Outcome of CONNECT negotiation with the upstream proxy.
pub(crate) enum ProxyTunnel {
    /// TLS transport toward the real destination, riding the proxy tunnel.
    Established(Box<tokio_rustls::client::TlsStream<PrefixedIo<TcpStream>>>),
    /// The proxy refused; its full buffered response is replayed to the
    /// client and the proxy socket is already destroyed.
    Refused { status_code: u16, replay: Vec<u8> },
}

/// Opens a TCP connection to the upstream proxy for a plaintext target.
/// The caller sends its request in absolute form on the returned socket.
pub(crate) async fn connect_plain(
    pool: &Arc<ConnectionPool>,
    proxy: &HostPort,
) -> io::Result<TcpStream> {
    let _slot = pool.reserve()?;
    TcpStream::connect((proxy.host.as_str(), proxy.port)).await
}

/// CONNECT-negotiates through the upstream proxy and, on success, completes
/// a client TLS handshake toward the real destination.
pub(crate) async fn connect_tls_tunnel(
    pool: &Arc<ConnectionPool>,
    proxy: &HostPort,
    target: &HostPort,
    keep_alive: bool,
    client_config: Arc<ClientConfig>,
) -> io::Result<ProxyTunnel> {
    let _slot = pool.reserve()?;
    let mut socket = TcpStream::connect((proxy.host.as_str(), proxy.port)).await?;

    let authority = target.authority();
    let proxy_connection = if keep_alive { "Keep-Alive" } else { "close" };
    let payload = format!(
        "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\nProxy-Connection: {proxy_connection}\r\n\r\n"
    );
    socket.write_all(payload.as_bytes()).await?;

    // Buffer arbitrary amounts of data until the full header block arrives;
    // bytes past the terminator belong to whatever follows.
    let mut buffered = Vec::with_capacity(1024);
    let header_end = loop {
        let mut chunk = [0_u8; IO_CHUNK_SIZE];
        let read = socket.read(&mut chunk).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "proxy connection ended before receiving CONNECT response",
            ));
        }
        buffered.extend_from_slice(&chunk[..read]);
        if let Some(index) = buffered
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
        {
            break index + 4;
        }
    };

    let response = parse_proxy_connect_response(&buffered[..header_end - 4])?;
    if response.status_code == 200 {
        let leftover = buffered.split_off(header_end);
        let server_name = ServerName::try_from(target.host.clone()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid TLS server name {:?}", target.host),
            )
        })?;
        let connector = TlsConnector::from(client_config);
        let tls = connector
            .connect(server_name, PrefixedIo::new(leftover, socket))
            .await?;
        return Ok(ProxyTunnel::Established(Box::new(tls)));
    }

    // The original request must never be written to this socket.
    drop(socket);
    Ok(ProxyTunnel::Refused {
        status_code: response.status_code,
        replay: buffered,
    })
}

/// Wraps a stream so that bytes read past a message boundary are served
/// before fresh reads from the underlying transport.
pub(crate) struct PrefixedIo<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> PrefixedIo<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedIo<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.offset < self.prefix.len() {
            let available = &self.prefix[self.offset..];
            let take = std::cmp::min(available.len(), buf.remaining());
            buf.put_slice(&available[..take]);
            self.offset += take;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedIo<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::io::AsyncReadExt;

    use super::{parse_proxy_connect_response, ConnectionPool, PrefixedIo};

    #[test]
    fn parses_connect_response_with_duplicate_headers() {
        let head = b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"hop\"\r\nProxy-Authenticate: Negotiate\r\nContent-Length: 0\r\n";
        let response = parse_proxy_connect_response(head).expect("parse");
        assert_eq!(response.status_code, 407);
        assert_eq!(response.status_text, "Proxy Authentication Required");

        let authenticate = response
            .headers
            .iter()
            .find(|(name, _)| name == "proxy-authenticate")
            .expect("header present");
        assert_eq!(
            authenticate.1,
            vec!["Basic realm=\"hop\"".to_string(), "Negotiate".to_string()]
        );
    }

    #[test]
    fn colonless_header_line_is_a_protocol_error() {
        let head = b"HTTP/1.1 200 Connection Established\r\nBogusHeaderLine\r\n";
        assert!(parse_proxy_connect_response(head).is_err());
    }

    #[test]
    fn empty_connect_response_is_rejected() {
        assert!(parse_proxy_connect_response(b"").is_err());
        assert!(parse_proxy_connect_response(b"HTTP/1.1\r\n").is_err());
    }

    #[test]
    fn pool_slots_release_on_drop() {
        let pool = ConnectionPool::new(2);
        let first = pool.reserve().expect("first slot");
        let _second = pool.reserve().expect("second slot");
        assert_eq!(pool.in_use(), 2);
        assert!(pool.reserve().is_err());

        drop(first);
        assert_eq!(pool.in_use(), 1);
        let _third = pool.reserve().expect("slot after release");
    }

    #[test]
    fn unbounded_pool_only_counts() {
        let pool = ConnectionPool::new(0);
        let _a = pool.reserve().expect("slot");
        let _b = pool.reserve().expect("slot");
        assert_eq!(pool.in_use(), 2);
    }

    #[tokio::test]
    async fn prefixed_io_serves_buffered_bytes_first() {
        let (mut writer, reader) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut writer, b" world")
            .await
            .expect("write");
        drop(writer);

        let mut io = PrefixedIo::new(b"hello".to_vec(), reader);
        let mut collected = Vec::new();
        io.read_to_end(&mut collected).await.expect("read");
        assert_eq!(collected, b"hello world");
    }
}
