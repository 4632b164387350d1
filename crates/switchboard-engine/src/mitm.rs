//! The TLS interception listener. Each handshake is driven lazily so the
//! ClientHello's SNI can select (or trigger issuance of) the per-hostname
//! certificate; decrypted requests then flow through the same forwarding
//! logic as the plaintext listener, with the HTTPS fixed-rule table and
//! CORS rewriting applied.

use std::io;

use switchboard_observe::{ErrorKind, EventSink, StatusEvent};
use switchboard_routes::{parse_host_port, resolve_route, HostPort, RuleTable, Scheme};
use switchboard_tls::TlsError;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::LazyConfigAcceptor;

use crate::forward::{forward_request, CorsDecor};
use crate::http::{
    header_value, parse_request_head, write_simple_response, BufferedStream, RequestHead,
};
use crate::session::ListenerShared;
use crate::shutdown::ConnectionGuard;

/// Allow-list echoed on preflights when the client did not name headers.
const DEFAULT_ALLOW_HEADERS: &str = "Content-Type, Authorization, X-Requested-With, Accept, \
     Origin, Cache-Control, Pragma, Expires, X-CSRF-Token, Range, If-Match, If-None-Match, \
     If-Modified-Since, If-Unmodified-Since";

pub(crate) async fn serve_connection<S>(
    shared: ListenerShared<S>,
    stream: TcpStream,
    guard: ConnectionGuard,
    mut close_rx: watch::Receiver<bool>,
) -> io::Result<()>
where
    S: EventSink + Send + Sync + 'static,
{
    tokio::select! {
        result = serve_tls(&shared, stream, &guard) => result,
        _ = close_rx.changed() => Ok(()),
    }
}

async fn serve_tls<S>(
    shared: &ListenerShared<S>,
    stream: TcpStream,
    guard: &ConnectionGuard,
) -> io::Result<()>
where
    S: EventSink + Send + Sync + 'static,
{
    let acceptor = LazyConfigAcceptor::new(tokio_rustls::rustls::server::Acceptor::default(), stream);
    let start = match acceptor.await {
        Ok(start) => start,
        Err(error) => {
            shared.sink.emit(StatusEvent::error(
                ErrorKind::ClientProtocol,
                format!("TLS client hello failed: {error}"),
                "tls-intercept".to_string(),
            ));
            return Ok(());
        }
    };

    let sni = start
        .client_hello()
        .server_name()
        .map(|name| name.to_string());
    let Some(server_name) = sni else {
        shared.sink.emit(StatusEvent::error(
            ErrorKind::ClientProtocol,
            "TLS client sent no SNI; no hostname-specific certificate can be selected".to_string(),
            "tls-intercept".to_string(),
        ));
        return Ok(());
    };

    // Issuance failures (most commonly an unloaded root authority) abort
    // only this connection; the listener keeps serving.
    let issued = match shared.issuer.issue(&server_name).await {
        Ok(issued) => issued,
        Err(error) => {
            let kind = match error {
                TlsError::RootCaNotLoaded => ErrorKind::RootCaNotLoaded,
                _ => ErrorKind::CertificateGeneration,
            };
            shared.sink.emit(StatusEvent::error(
                kind,
                format!("cannot issue certificate for {server_name}: {error}"),
                server_name.clone(),
            ));
            return Ok(());
        }
    };

    let tls = match start.into_stream(issued.server_config).await {
        Ok(tls) => tls,
        Err(error) => {
            shared.sink.emit(StatusEvent::error(
                ErrorKind::ClientProtocol,
                format!("TLS handshake failed: {error}"),
                server_name.clone(),
            ));
            return Ok(());
        }
    };

    let mut client = BufferedStream::new(tls);
    loop {
        let head = match client.read_head(shared.config.max_http_head_bytes).await? {
            Some(head) => head,
            None => return Ok(()),
        };
        let request = match parse_request_head(&head) {
            Ok(request) => request,
            Err(error) => {
                shared.sink.emit(StatusEvent::error(
                    ErrorKind::ClientProtocol,
                    error.to_string(),
                    server_name.clone(),
                ));
                write_simple_response(
                    &mut client.stream,
                    "400 Bad Request",
                    &[],
                    "invalid intercepted request",
                )
                .await?;
                return Ok(());
            }
        };

        guard.mark_busy();

        // The client still addresses the real hostname, so the original
        // Host header names the destination; the SNI hostname backstops a
        // missing header.
        let host_header_raw = header_value(&request.headers, "host")
            .unwrap_or(server_name.as_str())
            .to_string();
        let original = parse_host_port(&host_header_raw, Some(443))
            .unwrap_or_else(|_| HostPort::new(server_name.clone(), 443));
        let host_had_port = parse_host_port(&host_header_raw, None).is_ok();

        let plan = match resolve_route(
            shared.profile.as_deref(),
            RuleTable::Https,
            Scheme::Https,
            &original.host,
            original.port,
        ) {
            Ok(plan) => plan,
            Err(error) => {
                shared.sink.emit(StatusEvent::error(
                    ErrorKind::Config,
                    error.to_string(),
                    original.authority(),
                ));
                write_simple_response(
                    &mut client.stream,
                    "502 Bad Gateway",
                    &[],
                    &format!("invalid routing rule for {}", original.authority()),
                )
                .await?;
                return Ok(());
            }
        };

        if plan.bypass_cors && request.method == "OPTIONS" {
            write_preflight_response(&mut client.stream, &request).await?;
            guard.mark_idle();
            if request.connection_close {
                return Ok(());
            }
            continue;
        }

        let cors = plan.bypass_cors.then(|| CorsDecor {
            origin: header_value(&request.headers, "origin").map(str::to_string),
        });
        let host_header = Some(if host_had_port {
            plan.target.authority()
        } else {
            plan.target.host.clone()
        });

        let outcome = forward_request(shared, &mut client, request, plan, host_header, cors).await?;
        guard.mark_idle();
        if outcome.close_after {
            return Ok(());
        }
    }
}

/// Synthesizes the CORS preflight: echo the requested headers, allow the
/// common methods, and echo the Origin with credentials when one was sent.
async fn write_preflight_response<W>(sink: &mut W, request: &RequestHead) -> io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let allow_headers = header_value(&request.headers, "access-control-request-headers")
        .unwrap_or(DEFAULT_ALLOW_HEADERS);

    let mut response = String::from("HTTP/1.1 204 No Content\r\n");
    response.push_str(
        "Access-Control-Allow-Methods: GET, POST, PUT, DELETE, PATCH, OPTIONS, HEAD\r\n",
    );
    response.push_str(&format!("Access-Control-Allow-Headers: {allow_headers}\r\n"));
    response.push_str("Access-Control-Max-Age: 3600\r\n");
    match header_value(&request.headers, "origin") {
        Some(origin) => {
            response.push_str(&format!("Access-Control-Allow-Origin: {origin}\r\n"));
            response.push_str("Access-Control-Allow-Credentials: true\r\n");
        }
        None => response.push_str("Access-Control-Allow-Origin: *\r\n"),
    }
    response.push_str("\r\n");

    sink.write_all(response.as_bytes()).await?;
    sink.flush().await
}
