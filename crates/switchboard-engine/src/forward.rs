//! Request forwarding shared by the plaintext and intercepting listeners:
//! opens the upstream transport (direct, direct TLS, or through the
//! second-hop proxy), rewrites the request head, relays both bodies, and
//! maps failures onto the proxy's response vocabulary (502/504/500).

use std::io;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use switchboard_observe::{ErrorKind, EventSink, StatusEvent};
use switchboard_routes::{RoutePlan, Scheme};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::http::{
    header_value, parse_response_head, relay_body, remove_header, set_header, write_simple_response,
    BufferedStream, HttpHeader, RequestHead, ResponseHead,
};
use crate::session::ListenerShared;
use crate::upstream::{connect_plain, connect_tls_tunnel, ProxyTunnel};

pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Response-side CORS rewriting requested by a `bypassCors` mapping.
pub(crate) struct CorsDecor {
    pub origin: Option<String>,
}

pub(crate) struct ForwardOutcome {
    pub close_after: bool,
}

enum Transport {
    Stream(Box<dyn AsyncStream>),
    Refused { status_code: u16, replay: Vec<u8> },
}

enum UpstreamPhase {
    Responded {
        upstream: BufferedStream<Box<dyn AsyncStream>>,
        response: ResponseHead,
    },
    Refused {
        status_code: u16,
        replay: Vec<u8>,
    },
}

enum PhaseError {
    /// Reading the client's request body failed mid-forward.
    Client(io::Error),
    /// Connecting to or exchanging with the upstream failed.
    Upstream(io::Error),
}

pub(crate) async fn forward_request<C, S>(
    shared: &ListenerShared<S>,
    client: &mut BufferedStream<C>,
    mut request: RequestHead,
    plan: RoutePlan,
    host_header: Option<String>,
    cors: Option<CorsDecor>,
) -> io::Result<ForwardOutcome>
where
    C: AsyncRead + AsyncWrite + Unpin,
    S: EventSink + Send + Sync + 'static,
{
    let keep_alive = !request.connection_close;
    let context = plan.target.authority();
    let request_close = request.connection_close;

    if !plan.keep_host_header {
        if let Some(value) = host_header {
            set_header(&mut request.headers, "Host", value);
        }
    }

    let via_plain_proxy = plan.upstream_proxy.is_some() && plan.scheme == Scheme::Http;
    if via_plain_proxy {
        let authority = if plan.target.port == plan.scheme.default_port() {
            plan.target.host.clone()
        } else {
            plan.target.authority()
        };
        request.target = format!("{}://{}{}", plan.scheme.as_str(), authority, request.target);
        set_header(
            &mut request.headers,
            "Proxy-Connection",
            if keep_alive { "Keep-Alive" } else { "close" },
        );
    }

    let request_body_mode = request.body_mode;
    let head_limit = shared.config.max_http_head_bytes;
    let serialized_request = request.serialize();

    let upstream_phase = async {
        let transport = open_transport(shared, &plan, keep_alive)
            .await
            .map_err(PhaseError::Upstream)?;
        let stream = match transport {
            Transport::Refused {
                status_code,
                replay,
            } => {
                return Ok(UpstreamPhase::Refused {
                    status_code,
                    replay,
                })
            }
            Transport::Stream(stream) => stream,
        };

        let mut upstream = BufferedStream::new(stream);
        upstream
            .stream
            .write_all(&serialized_request)
            .await
            .map_err(PhaseError::Upstream)?;
        relay_body(client, &mut upstream.stream, request_body_mode, head_limit)
            .await
            .map_err(PhaseError::Client)?;
        upstream.stream.flush().await.map_err(PhaseError::Upstream)?;

        let head = upstream
            .read_head(head_limit)
            .await
            .map_err(PhaseError::Upstream)?
            .ok_or_else(|| {
                PhaseError::Upstream(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "upstream closed before response headers",
                ))
            })?;
        let response =
            parse_response_head(&head, &request.method).map_err(PhaseError::Upstream)?;
        Ok(UpstreamPhase::Responded { upstream, response })
    };

    let timeout = shared.config.request_timeout();
    let phase = match tokio::time::timeout(timeout, upstream_phase).await {
        Err(_) => {
            let message = format!(
                "request timed out after {} seconds",
                shared.config.request_timeout_secs
            );
            shared.sink.emit(StatusEvent::error(
                ErrorKind::UpstreamTimeout,
                message.clone(),
                context.clone(),
            ));
            write_simple_response(
                &mut client.stream,
                "504 Gateway Timeout",
                &cors_error_headers(cors.as_ref()),
                &format!("upstream timeout for {context}: {message}"),
            )
            .await?;
            return Ok(ForwardOutcome { close_after: true });
        }
        Ok(Err(PhaseError::Upstream(error))) => {
            shared.sink.emit(StatusEvent::error(
                ErrorKind::UpstreamConnect,
                error.to_string(),
                context.clone(),
            ));
            write_simple_response(
                &mut client.stream,
                "502 Bad Gateway",
                &cors_error_headers(cors.as_ref()),
                &format!("upstream request error for {context}: {error}"),
            )
            .await?;
            return Ok(ForwardOutcome { close_after: true });
        }
        Ok(Err(PhaseError::Client(error))) => {
            shared.sink.emit(StatusEvent::error(
                ErrorKind::ClientProtocol,
                format!("error piping client request: {error}"),
                context.clone(),
            ));
            write_simple_response(
                &mut client.stream,
                "500 Internal Server Error",
                &[],
                "proxy error piping client request",
            )
            .await?;
            return Ok(ForwardOutcome { close_after: true });
        }
        Ok(Ok(phase)) => phase,
    };

    match phase {
        UpstreamPhase::Refused {
            status_code,
            replay,
        } => {
            // The second-hop proxy rejected the CONNECT; the client observes
            // that response verbatim, then end-of-stream.
            shared.sink.emit(StatusEvent::error(
                ErrorKind::UpstreamConnect,
                format!("upstream proxy refused CONNECT with status {status_code}"),
                context.clone(),
            ));
            client.stream.write_all(&replay).await?;
            client.stream.flush().await?;
            Ok(ForwardOutcome { close_after: true })
        }
        UpstreamPhase::Responded {
            mut upstream,
            mut response,
        } => {
            if let Some(decor) = cors.as_ref() {
                apply_cors_rewrite(&mut response.headers, decor.origin.as_deref());
            }

            client.stream.write_all(&response.serialize()).await?;
            relay_body(
                &mut upstream,
                &mut client.stream,
                response.body_mode,
                head_limit,
            )
            .await?;
            client.stream.flush().await?;

            Ok(ForwardOutcome {
                close_after: request_close || response.connection_close,
            })
        }
    }
}

async fn open_transport<S>(
    shared: &ListenerShared<S>,
    plan: &RoutePlan,
    keep_alive: bool,
) -> io::Result<Transport>
where
    S: EventSink + Send + Sync + 'static,
{
    match (&plan.upstream_proxy, plan.scheme) {
        (Some(proxy), Scheme::Http) => {
            let socket = connect_plain(&shared.pool, proxy).await?;
            Ok(Transport::Stream(Box::new(socket)))
        }
        (Some(proxy), Scheme::Https) => {
            let tunnel = connect_tls_tunnel(
                &shared.pool,
                proxy,
                &plan.target,
                keep_alive,
                Arc::clone(&shared.upstream_tls),
            )
            .await?;
            match tunnel {
                ProxyTunnel::Established(tls) => Ok(Transport::Stream(tls)),
                ProxyTunnel::Refused {
                    status_code,
                    replay,
                } => Ok(Transport::Refused {
                    status_code,
                    replay,
                }),
            }
        }
        (None, Scheme::Http) => {
            let socket =
                TcpStream::connect((plan.target.host.as_str(), plan.target.port)).await?;
            Ok(Transport::Stream(Box::new(socket)))
        }
        (None, Scheme::Https) => {
            let socket =
                TcpStream::connect((plan.target.host.as_str(), plan.target.port)).await?;
            let server_name = ServerName::try_from(plan.target.host.clone()).map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid TLS server name {:?}", plan.target.host),
                )
            })?;
            let connector = TlsConnector::from(Arc::clone(&shared.upstream_tls));
            let tls = connector.connect(server_name, socket).await?;
            Ok(Transport::Stream(Box::new(tls)))
        }
    }
}

/// Origin echo with credentials when the request carried an Origin header,
/// wildcard otherwise; dynamic echoes must also vary on Origin so caches
/// stay correct, and frame-busting headers are dropped so the rewritten
/// content can be embedded cross-origin.
fn apply_cors_rewrite(headers: &mut Vec<HttpHeader>, origin: Option<&str>) {
    match origin {
        Some(origin) => {
            set_header(headers, "Access-Control-Allow-Origin", origin);
            set_header(headers, "Access-Control-Allow-Credentials", "true");
            let vary = header_value(headers, "vary").map(str::to_string);
            match vary {
                Some(existing) => set_header(headers, "Vary", format!("{existing}, Origin")),
                None => set_header(headers, "Vary", "Origin"),
            }
        }
        None => {
            set_header(headers, "Access-Control-Allow-Origin", "*");
            remove_header(headers, "Access-Control-Allow-Credentials");
        }
    }
    remove_header(headers, "Content-Security-Policy");
    remove_header(headers, "X-Frame-Options");
}

fn cors_error_headers(cors: Option<&CorsDecor>) -> Vec<HttpHeader> {
    let Some(decor) = cors else {
        return Vec::new();
    };
    match decor.origin.as_deref() {
        Some(origin) => vec![
            HttpHeader::new("Access-Control-Allow-Origin", origin),
            HttpHeader::new("Access-Control-Allow-Credentials", "true"),
            HttpHeader::new("Vary", "Origin"),
        ],
        None => vec![HttpHeader::new("Access-Control-Allow-Origin", "*")],
    }
}
