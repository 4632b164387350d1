//! The plaintext proxy listener: CONNECT tunnel setup (with rule-driven
//! redirection into the local TLS interception listener) and absolute-form
//! HTTP forwarding.

use std::io;

use switchboard_observe::{ErrorKind, EventSink, StatusEvent};
use switchboard_routes::{connect_intercepted, parse_host_port, resolve_route, HostPort, RuleTable};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::forward::forward_request;
use crate::http::{parse_absolute_target, parse_request_head, write_simple_response, BufferedStream, RequestHead};
use crate::session::ListenerShared;
use crate::shutdown::ConnectionGuard;

pub(crate) async fn serve_connection<S>(
    shared: ListenerShared<S>,
    stream: TcpStream,
    guard: ConnectionGuard,
    mut close_rx: watch::Receiver<bool>,
) -> io::Result<()>
where
    S: EventSink + Send + Sync + 'static,
{
    let mut client = BufferedStream::new(stream);
    tokio::select! {
        result = serve_requests(&shared, &mut client, &guard) => result,
        _ = close_rx.changed() => Ok(()),
    }
}

async fn serve_requests<S>(
    shared: &ListenerShared<S>,
    client: &mut BufferedStream<TcpStream>,
    guard: &ConnectionGuard,
) -> io::Result<()>
where
    S: EventSink + Send + Sync + 'static,
{
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
                    "http-listener".to_string(),
                ));
                write_simple_response(
                    &mut client.stream,
                    "400 Bad Request",
                    &[],
                    "invalid proxy request",
                )
                .await?;
                return Ok(());
            }
        };

        if request.method == "CONNECT" {
            guard.mark_busy();
            return tunnel(shared, client, request).await;
        }

        guard.mark_busy();
        let (scheme, original, path) = match parse_absolute_target(&request.target) {
            Ok(parsed) => parsed,
            Err(error) => {
                shared.sink.emit(StatusEvent::error(
                    ErrorKind::ClientProtocol,
                    error.to_string(),
                    request.target.clone(),
                ));
                write_simple_response(
                    &mut client.stream,
                    "400 Bad Request",
                    &[],
                    "proxy requests must use absolute-form targets",
                )
                .await?;
                return Ok(());
            }
        };

        let plan = match resolve_route(
            shared.profile.as_deref(),
            RuleTable::Http,
            scheme,
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

        let mut request = request;
        request.target = path;
        let host_header = Some(plan.target.host.clone());
        let outcome = forward_request(shared, client, request, plan, host_header, None).await?;
        guard.mark_idle();
        if outcome.close_after {
            return Ok(());
        }
    }
}

/// Establishes a raw byte tunnel. When routing rules mark the destination
/// as intercepted, the tunnel lands on the local TLS listener instead of
/// the real target; the client cannot tell the difference.
async fn tunnel<S>(
    shared: &ListenerShared<S>,
    client: &mut BufferedStream<TcpStream>,
    request: RequestHead,
) -> io::Result<()>
where
    S: EventSink + Send + Sync + 'static,
{
    let target = match parse_host_port(&request.target, Some(443)) {
        Ok(target) => target,
        Err(error) => {
            shared.sink.emit(StatusEvent::error(
                ErrorKind::ClientProtocol,
                error.to_string(),
                request.target.clone(),
            ));
            write_simple_response(
                &mut client.stream,
                "400 Bad Request",
                &[],
                "invalid CONNECT target",
            )
            .await?;
            return Ok(());
        }
    };

    let resolved = if connect_intercepted(shared.profile.as_deref(), &target.host, target.port) {
        HostPort::new("127.0.0.1", shared.mitm_port)
    } else {
        target.clone()
    };

    let mut upstream = match TcpStream::connect((resolved.host.as_str(), resolved.port)).await {
        Ok(stream) => stream,
        Err(error) => {
            shared.sink.emit(StatusEvent::error(
                ErrorKind::UpstreamConnect,
                error.to_string(),
                target.authority(),
            ));
            write_simple_response(
                &mut client.stream,
                "502 Bad Gateway",
                &[],
                &format!("tunnel connect failed for {}: {error}", target.authority()),
            )
            .await?;
            return Ok(());
        }
    };

    client
        .stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\nProxy-Agent: switchboard\r\n\r\n")
        .await?;
    if !client.read_buf.is_empty() {
        upstream.write_all(&client.read_buf).await?;
        client.read_buf.clear();
    }

    // Destroying either side of the tunnel destroys the other; a client
    // reset is routine teardown, not a reportable failure.
    match tokio::io::copy_bidirectional(&mut client.stream, &mut upstream).await {
        Ok(_) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::ConnectionReset => Ok(()),
        Err(error) => Err(error),
    }
}
