//! One bound listener pair plus the machinery to tear it down. At most one
//! session's pair is bound at any time; the engine fully shuts the previous
//! session down before binding the next.

use std::net::SocketAddr;
use std::sync::Arc;

use rustls::ClientConfig;
use switchboard_observe::{EventSink, ListenerKind};
use switchboard_routes::Profile;
use switchboard_tls::CertificateIssuer;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::shutdown::ConnectionTracker;
use crate::upstream::ConnectionPool;
use crate::{mitm, plaintext};

/// Session marker for "no profile active".
pub const PROFILE_INDEX_NONE: i32 = -9;
/// Session marker for direct-connect mode (no routing rules).
pub const PROFILE_INDEX_DIRECT: i32 = -1;

/// Everything a connection handler needs, cloned per accepted socket.
pub(crate) struct ListenerShared<S: EventSink> {
    pub config: Arc<EngineConfig>,
    pub profile: Option<Arc<Profile>>,
    pub issuer: Arc<CertificateIssuer>,
    pub pool: Arc<ConnectionPool>,
    pub sink: Arc<S>,
    pub upstream_tls: Arc<ClientConfig>,
    /// Actual bound port of the TLS interception listener; CONNECT
    /// redirects substitute this for the original destination.
    pub mitm_port: u16,
}

impl<S: EventSink> Clone for ListenerShared<S> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            profile: self.profile.clone(),
            issuer: Arc::clone(&self.issuer),
            pool: Arc::clone(&self.pool),
            sink: Arc::clone(&self.sink),
            upstream_tls: Arc::clone(&self.upstream_tls),
            mitm_port: self.mitm_port,
        }
    }
}

/// A bound listener with its accept loop and connection tracker. Shutdown
/// resolves only once the accept task has ended, which drops the listening
/// socket and releases the port.
pub(crate) struct ListenerHandle {
    kind: ListenerKind,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    tracker: Arc<ConnectionTracker>,
    accept_task: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn spawn<S>(kind: ListenerKind, listener: TcpListener, shared: ListenerShared<S>) -> Self
    where
        S: EventSink + Send + Sync + 'static,
    {
        let local_addr = listener
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 0)));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tracker = ConnectionTracker::new();
        let accept_task = tokio::spawn(accept_loop(
            kind,
            listener,
            shutdown_rx,
            Arc::clone(&tracker),
            shared,
        ));

        Self {
            kind,
            local_addr,
            shutdown_tx,
            tracker,
            accept_task,
        }
    }

    pub fn kind(&self) -> ListenerKind {
        self.kind
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(mut self, force: bool) {
        let _ = self.shutdown_tx.send(true);
        self.tracker.shutdown(force);
        let _ = (&mut self.accept_task).await;
    }
}

async fn accept_loop<S>(
    kind: ListenerKind,
    listener: TcpListener,
    mut shutdown_rx: watch::Receiver<bool>,
    tracker: Arc<ConnectionTracker>,
    shared: ListenerShared<S>,
) where
    S: EventSink + Send + Sync + 'static,
{
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _client_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(_) => continue,
                };
                let (guard, close_rx) = tracker.register();
                let shared = shared.clone();
                tokio::spawn(async move {
                    let result = match kind {
                        ListenerKind::Http => {
                            plaintext::serve_connection(shared, stream, guard, close_rx).await
                        }
                        ListenerKind::Https => {
                            mitm::serve_connection(shared, stream, guard, close_rx).await
                        }
                    };
                    // Relay-level socket errors tear the connection down
                    // without reaching the status channel.
                    let _ = result;
                });
            }
            _ = shutdown_rx.changed() => break,
        }
    }
    // Falling out of the loop drops the listener and releases the port.
}

/// The one live listener pair and the profile marker it serves.
pub(crate) struct ActiveSession {
    pub active_profile_index: i32,
    pub http: ListenerHandle,
    pub https: ListenerHandle,
}

impl ActiveSession {
    pub fn http_addr(&self) -> SocketAddr {
        self.http.local_addr()
    }

    pub fn https_addr(&self) -> SocketAddr {
        self.https.local_addr()
    }

    pub async fn shutdown(self, force: bool) {
        tokio::join!(self.http.shutdown(force), self.https.shutdown(force));
    }
}
