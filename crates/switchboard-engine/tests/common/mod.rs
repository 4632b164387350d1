#![allow(dead_code)]

use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
};
use switchboard_engine::{EngineConfig, ProfileSelection, ProxyEngine};
use switchboard_observe::VecEventSink;
use switchboard_routes::Profile;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Root authority material written to disk the way the engine expects to
/// load it. The directory is removed on drop.
pub struct TestAuthority {
    pub dir: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub cert_pem: String,
}

impl Drop for TestAuthority {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

pub fn write_test_authority(prefix: &str) -> TestAuthority {
    let key = KeyPair::generate().expect("generate CA key");
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];
    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, "switchboard test root".to_string());
    params.distinguished_name = distinguished_name;
    let cert = params.self_signed(&key).expect("self sign CA");

    let now = SystemTime::now().duration_since(UNIX_EPOCH).expect("clock");
    let dir = std::env::temp_dir().join(format!(
        "{prefix}-{}-{}",
        std::process::id(),
        now.as_nanos()
    ));
    fs::create_dir_all(&dir).expect("create temp dir");
    let cert_path = dir.join("rootCA.crt");
    let key_path = dir.join("rootCA.key");
    let cert_pem = cert.pem();
    fs::write(&cert_path, &cert_pem).expect("write CA cert");
    fs::write(&key_path, key.serialize_pem()).expect("write CA key");

    TestAuthority {
        dir,
        cert_path,
        key_path,
        cert_pem,
    }
}

pub fn engine_config(authority: &TestAuthority) -> EngineConfig {
    EngineConfig {
        http_port: 0,
        https_port: 0,
        ca_cert_pem_path: authority.cert_path.to_string_lossy().to_string(),
        ca_key_pem_path: authority.key_path.to_string_lossy().to_string(),
        ..EngineConfig::default()
    }
}

pub async fn start_engine(
    config: EngineConfig,
    selection: ProfileSelection,
    profiles: &[Profile],
) -> (
    Arc<ProxyEngine<VecEventSink>>,
    VecEventSink,
    SocketAddr,
    SocketAddr,
) {
    let sink = VecEventSink::default();
    let engine = ProxyEngine::new(config, sink.clone()).expect("build engine");
    engine.start(selection, profiles).await.expect("start engine");
    let (http_addr, https_addr) = engine.listener_addrs().await.expect("listener addrs");
    (Arc::new(engine), sink, http_addr, https_addr)
}

/// Minimal origin server: answers every connection with the given response
/// bytes and records the raw request bytes (head plus content-length body).
pub async fn spawn_origin(response: Vec<u8>) -> (SocketAddr, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
    let addr = listener.local_addr().expect("origin addr");
    let (recorded_tx, recorded_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let response = response.clone();
            let recorded_tx = recorded_tx.clone();
            tokio::spawn(async move {
                let mut raw = Vec::new();
                let mut chunk = [0_u8; 4096];
                while !raw.windows(4).any(|window| window == b"\r\n\r\n") {
                    let Ok(read) = stream.read(&mut chunk).await else {
                        return;
                    };
                    if read == 0 {
                        return;
                    }
                    raw.extend_from_slice(&chunk[..read]);
                }

                let head_end = raw
                    .windows(4)
                    .position(|window| window == b"\r\n\r\n")
                    .map(|index| index + 4)
                    .unwrap_or(raw.len());
                let content_length = content_length_of(&raw[..head_end]);
                while raw.len() < head_end + content_length {
                    let Ok(read) = stream.read(&mut chunk).await else {
                        return;
                    };
                    if read == 0 {
                        break;
                    }
                    raw.extend_from_slice(&chunk[..read]);
                }

                let _ = recorded_tx.send(raw);
                let _ = stream.write_all(&response).await;
                let _ = stream.flush().await;
            });
        }
    });

    (addr, recorded_rx)
}

fn content_length_of(head: &[u8]) -> usize {
    let text = String::from_utf8_lossy(head);
    for line in text.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                return value.trim().parse().unwrap_or(0);
            }
        }
    }
    0
}

/// Echo server for tunnel tests; reports EOF so close propagation can be
/// asserted.
pub async fn spawn_echo() -> (SocketAddr, mpsc::UnboundedReceiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
    let addr = listener.local_addr().expect("echo addr");
    let (closed_tx, closed_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let closed_tx = closed_tx.clone();
            tokio::spawn(async move {
                let mut chunk = [0_u8; 4096];
                loop {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => {
                            let _ = closed_tx.send(());
                            return;
                        }
                        Ok(read) => {
                            if stream.write_all(&chunk[..read]).await.is_err() {
                                let _ = closed_tx.send(());
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    (addr, closed_rx)
}

/// Reads one HTTP response: the head as text plus a content-length body
/// (or everything until EOF when no length is given).
pub async fn read_http_response<S: AsyncRead + Unpin>(stream: &mut S) -> (String, Vec<u8>) {
    let mut raw = Vec::new();
    let mut chunk = [0_u8; 4096];
    while !raw.windows(4).any(|window| window == b"\r\n\r\n") {
        let read = stream.read(&mut chunk).await.expect("read response head");
        if read == 0 {
            break;
        }
        raw.extend_from_slice(&chunk[..read]);
    }

    let head_end = raw
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|index| index + 4)
        .unwrap_or(raw.len());
    let head = String::from_utf8_lossy(&raw[..head_end]).to_string();
    let mut body = raw[head_end..].to_vec();

    if let Some(length) = explicit_content_length(&head) {
        while body.len() < length {
            let read = stream.read(&mut chunk).await.expect("read response body");
            if read == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..read]);
        }
        body.truncate(length);
    } else {
        loop {
            let read = match stream.read(&mut chunk).await {
                Ok(read) => read,
                Err(_) => break,
            };
            if read == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..read]);
        }
    }

    (head, body)
}

fn explicit_content_length(head: &str) -> Option<usize> {
    for line in head.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                return value.trim().parse().ok();
            }
        }
    }
    None
}

pub fn header_line<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.split("\r\n").find_map(|line| {
        let (found, value) = line.split_once(':')?;
        if found.trim().eq_ignore_ascii_case(name) {
            Some(value.trim())
        } else {
            None
        }
    })
}
