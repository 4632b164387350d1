mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use common::{
    engine_config, header_line, read_http_response, spawn_echo, spawn_origin,
    start_engine, write_test_authority,
};
use switchboard_engine::ProfileSelection;
use switchboard_observe::ErrorKind;
use switchboard_routes::{Mapping, Profile, ProxySettings};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn profile_with_http_rule(key: &str, mapping: Mapping) -> Profile {
    let mut http_fixed_rule = BTreeMap::new();
    http_fixed_rule.insert(key.to_string(), mapping);
    Profile {
        name: "test-profile".to_string(),
        proxy: ProxySettings {
            http_fixed_rule,
            ..ProxySettings::default()
        },
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn direct_connect_tunnel_relays_bytes_exactly() {
    let authority = write_test_authority("switchboard-tunnel");
    let (_engine, _sink, http_addr, _https_addr) = start_engine(
        engine_config(&authority),
        ProfileSelection::Direct,
        &[],
    )
    .await;
    let (echo_addr, mut echo_closed) = spawn_echo().await;

    let mut client = TcpStream::connect(http_addr).await.expect("connect proxy");
    client
        .write_all(format!("CONNECT {echo_addr} HTTP/1.1\r\nHost: {echo_addr}\r\n\r\n").as_bytes())
        .await
        .expect("write CONNECT");

    let mut head = Vec::new();
    let mut byte = [0_u8; 1];
    while !head.windows(4).any(|window| window == b"\r\n\r\n") {
        let read = client.read(&mut byte).await.expect("read established");
        assert_ne!(read, 0, "proxy closed before tunnel established");
        head.push(byte[0]);
    }
    let head_text = String::from_utf8_lossy(&head);
    assert!(
        head_text.starts_with("HTTP/1.1 200 Connection Established"),
        "head: {head_text}"
    );

    let payload = b"tunnel bytes \x00\x01\xfe\xff are opaque";
    client.write_all(payload).await.expect("write payload");
    let mut echoed = vec![0_u8; payload.len()];
    client.read_exact(&mut echoed).await.expect("read echo");
    assert_eq!(echoed, payload);

    // Closing the client side must close the target side too.
    drop(client);
    tokio::time::timeout(Duration::from_secs(2), echo_closed.recv())
        .await
        .expect("echo server should observe the close")
        .expect("close event");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forwards_absolute_uri_requests_with_host_rewrite() {
    let authority = write_test_authority("switchboard-forward");
    let (_engine, _sink, http_addr, _https_addr) = start_engine(
        engine_config(&authority),
        ProfileSelection::Direct,
        &[],
    )
    .await;
    let (origin_addr, mut recorded) =
        spawn_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\n\r\nupstream".to_vec()).await;

    let mut client = TcpStream::connect(http_addr).await.expect("connect proxy");
    client
        .write_all(
            format!(
                "GET http://{origin_addr}/hello?x=1 HTTP/1.1\r\nHost: original.test\r\nAccept: */*\r\nConnection: close\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .expect("write request");

    let (head, body) = read_http_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200 OK"), "head: {head}");
    assert_eq!(body, b"upstream");

    let raw = recorded.recv().await.expect("origin saw request");
    let request_text = String::from_utf8_lossy(&raw);
    assert!(
        request_text.starts_with("GET /hello?x=1 HTTP/1.1\r\n"),
        "request: {request_text}"
    );
    assert_eq!(header_line(&request_text, "host"), Some("127.0.0.1"));
    assert_eq!(header_line(&request_text, "accept"), Some("*/*"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn http_fixed_rule_rewrites_destination() {
    let authority = write_test_authority("switchboard-fixed-rule");
    let (origin_addr, mut recorded) =
        spawn_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec()).await;

    let profile = profile_with_http_rule(
        "a.test:80",
        Mapping {
            target: format!("http://{origin_addr}"),
            ..Mapping::default()
        },
    );
    let (_engine, _sink, http_addr, _https_addr) = start_engine(
        engine_config(&authority),
        ProfileSelection::Index(0),
        &[profile],
    )
    .await;

    let mut client = TcpStream::connect(http_addr).await.expect("connect proxy");
    client
        .write_all(
            b"GET http://a.test/resource HTTP/1.1\r\nHost: a.test\r\nConnection: close\r\n\r\n",
        )
        .await
        .expect("write request");

    let (head, body) = read_http_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200 OK"), "head: {head}");
    assert_eq!(body, b"ok");

    let raw = recorded.recv().await.expect("origin saw request");
    let request_text = String::from_utf8_lossy(&raw);
    assert!(request_text.starts_with("GET /resource HTTP/1.1\r\n"));
    assert_eq!(header_line(&request_text, "host"), Some("127.0.0.1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn keep_host_header_preserves_the_original_host() {
    let authority = write_test_authority("switchboard-keep-host");
    let (origin_addr, mut recorded) =
        spawn_origin(b"HTTP/1.1 204 No Content\r\n\r\n".to_vec()).await;

    let profile = profile_with_http_rule(
        "a.test:80",
        Mapping {
            target: format!("http://{origin_addr}"),
            keep_host_header: true,
            ..Mapping::default()
        },
    );
    let (_engine, _sink, http_addr, _https_addr) = start_engine(
        engine_config(&authority),
        ProfileSelection::Index(0),
        &[profile],
    )
    .await;

    let mut client = TcpStream::connect(http_addr).await.expect("connect proxy");
    client
        .write_all(b"GET http://a.test/ HTTP/1.1\r\nHost: a.test\r\nConnection: close\r\n\r\n")
        .await
        .expect("write request");

    let (head, _body) = read_http_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 204"), "head: {head}");

    let raw = recorded.recv().await.expect("origin saw request");
    let request_text = String::from_utf8_lossy(&raw);
    assert_eq!(header_line(&request_text, "host"), Some("a.test"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn origin_form_requests_get_a_400() {
    let authority = write_test_authority("switchboard-origin-form");
    let (_engine, sink, http_addr, _https_addr) = start_engine(
        engine_config(&authority),
        ProfileSelection::Direct,
        &[],
    )
    .await;

    let mut client = TcpStream::connect(http_addr).await.expect("connect proxy");
    client
        .write_all(b"GET /not-absolute HTTP/1.1\r\nHost: a.test\r\n\r\n")
        .await
        .expect("write request");

    let (head, _body) = read_http_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 400"), "head: {head}");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        !sink.errors_of_kind(ErrorKind::ClientProtocol).is_empty(),
        "client protocol error should be reported"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_tunnel_target_yields_502() {
    let authority = write_test_authority("switchboard-tunnel-502");
    let (_engine, sink, http_addr, _https_addr) = start_engine(
        engine_config(&authority),
        ProfileSelection::Direct,
        &[],
    )
    .await;

    // Bind-then-drop to find a port with no listener behind it.
    let dead_port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("probe bind");
        listener.local_addr().expect("probe addr").port()
    };

    let mut client = TcpStream::connect(http_addr).await.expect("connect proxy");
    client
        .write_all(format!("CONNECT 127.0.0.1:{dead_port} HTTP/1.1\r\n\r\n").as_bytes())
        .await
        .expect("write CONNECT");

    let (head, _body) = read_http_response(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 502"), "head: {head}");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        !sink.errors_of_kind(ErrorKind::UpstreamConnect).is_empty(),
        "upstream connect error should be reported"
    );
}
