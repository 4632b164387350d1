//! The engine instance: owns the root authority, certificate issuer,
//! upstream socket pool, and the single active session slot. The external
//! layer drives it with `start`/`stop` and observes the status channel.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use rustls::ClientConfig;
use switchboard_observe::{ErrorKind, EventSink, ListenerKind, StatusEvent};
use switchboard_routes::Profile;
use switchboard_tls::{
    upstream_client_config, CertificateIssuer, IssuerMetricsSnapshot, RootAuthority,
};
use thiserror::Error;
use tokio::net::TcpListener;

use crate::config::{ConfigError, EngineConfig};
use crate::session::{ActiveSession, ListenerHandle, ListenerShared, PROFILE_INDEX_NONE};
use crate::upstream::ConnectionPool;

/// What to activate: direct-connect mode (marker −1) or a profile index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileSelection {
    Direct,
    Index(usize),
}

impl ProfileSelection {
    /// Interprets the collaborator's numeric marker; −1 is direct-connect,
    /// non-negative values are profile indexes, anything else is invalid.
    pub fn from_marker(marker: i32) -> Option<Self> {
        match marker {
            -1 => Some(Self::Direct),
            index if index >= 0 => Some(Self::Index(index as usize)),
            _ => None,
        }
    }

    pub fn marker(&self) -> i32 {
        match self {
            Self::Direct => -1,
            Self::Index(index) => *index as i32,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind {listener} listener on {addr}: {source}")]
    Listen {
        listener: &'static str,
        addr: String,
        source: io::Error,
    },
}

pub struct ProxyEngine<S: EventSink> {
    config: Arc<EngineConfig>,
    issuer: Arc<CertificateIssuer>,
    pool: Arc<ConnectionPool>,
    upstream_tls: Arc<ClientConfig>,
    sink: Arc<S>,
    session: tokio::sync::Mutex<Option<ActiveSession>>,
}

impl<S> ProxyEngine<S>
where
    S: EventSink + Send + Sync + 'static,
{
    /// Builds the engine and loads the root authority. A missing or invalid
    /// authority is reported and leaves the engine degraded: plaintext
    /// proxying works, TLS interception fails per-connection.
    pub fn new(config: EngineConfig, sink: S) -> Result<Self, EngineError> {
        config.validate()?;
        let sink = Arc::new(sink);

        let authority = match RootAuthority::load(
            Path::new(&config.ca_cert_pem_path),
            Path::new(&config.ca_key_pem_path),
        ) {
            Ok(authority) => Some(Arc::new(authority)),
            Err(error) => {
                sink.emit(StatusEvent::error(
                    ErrorKind::RootCaNotLoaded,
                    error.to_string(),
                    format!("{}, {}", config.ca_cert_pem_path, config.ca_key_pem_path),
                ));
                None
            }
        };

        let issuer = Arc::new(CertificateIssuer::new(
            authority,
            config.leaf_cache_capacity,
            config.leaf_cache_ttl(),
        ));
        let pool = ConnectionPool::new(config.max_upstream_proxy_sockets);
        let upstream_tls = upstream_client_config(config.upstream_tls_insecure_skip_verify);

        Ok(Self {
            config: Arc::new(config),
            issuer,
            pool,
            upstream_tls,
            sink,
            session: tokio::sync::Mutex::new(None),
        })
    }

    pub fn root_authority_loaded(&self) -> bool {
        self.issuer.has_authority()
    }

    pub fn issuer_metrics(&self) -> IssuerMetricsSnapshot {
        self.issuer.metrics_snapshot()
    }

    pub fn upstream_pool_in_use(&self) -> usize {
        self.pool.in_use()
    }

    /// Starts a session for the selection, first fully tearing down any
    /// previous session so the port pair is released before rebinding. A
    /// bind failure rolls back whatever partially started before it is
    /// reported.
    pub async fn start(
        &self,
        selection: ProfileSelection,
        profiles: &[Profile],
    ) -> Result<(), EngineError> {
        let profile = match selection {
            ProfileSelection::Direct => None,
            ProfileSelection::Index(index) => match profiles.get(index) {
                Some(profile) => Some(Arc::new(profile.clone())),
                None => {
                    let error = ConfigError::InvalidProfileIndex {
                        index: index as i32,
                        count: profiles.len(),
                    };
                    self.sink.emit(StatusEvent::error(
                        ErrorKind::Config,
                        error.to_string(),
                        "start".to_string(),
                    ));
                    return Err(error.into());
                }
            },
        };

        let mut session = self.session.lock().await;
        if let Some(previous) = session.take() {
            previous.shutdown(true).await;
            self.sink.emit(StatusEvent::ProxyStopped);
        }

        let http_listener = match self.bind(self.config.http_port).await {
            Ok(listener) => listener,
            Err(source) => {
                return Err(self.report_bind_failure(ListenerKind::Http, self.config.http_port, source))
            }
        };
        let https_listener = match self.bind(self.config.https_port).await {
            Ok(listener) => listener,
            Err(source) => {
                // Release the half-started pair before the failure is
                // reported, so no partially-bound listeners outlive it.
                drop(http_listener);
                return Err(self.report_bind_failure(
                    ListenerKind::Https,
                    self.config.https_port,
                    source,
                ));
            }
        };
        let mitm_port = https_listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(self.config.https_port);

        let shared = ListenerShared {
            config: Arc::clone(&self.config),
            profile,
            issuer: Arc::clone(&self.issuer),
            pool: Arc::clone(&self.pool),
            sink: Arc::clone(&self.sink),
            upstream_tls: Arc::clone(&self.upstream_tls),
            mitm_port,
        };

        let http = ListenerHandle::spawn(ListenerKind::Http, http_listener, shared.clone());
        let https = ListenerHandle::spawn(ListenerKind::Https, https_listener, shared);

        self.sink.emit(StatusEvent::Listening {
            port: http.local_addr().port(),
            listener: http.kind(),
        });
        self.sink.emit(StatusEvent::Listening {
            port: https.local_addr().port(),
            listener: https.kind(),
        });

        *session = Some(ActiveSession {
            active_profile_index: selection.marker(),
            http,
            https,
        });
        self.sink.emit(StatusEvent::ProxyStarted {
            active_profile_index: selection.marker(),
        });
        Ok(())
    }

    /// Force-stops the active session; the returned future resolves once
    /// both listen sockets are closed. Idempotent.
    pub async fn stop(&self) {
        self.shutdown_session(true).await;
    }

    /// `force` destroys every tracked socket now; graceful closes only the
    /// idle ones and lets busy cycles complete. Listen sockets are closed
    /// either way before this resolves.
    pub async fn shutdown_session(&self, force: bool) {
        let mut session = self.session.lock().await;
        if let Some(active) = session.take() {
            active.shutdown(force).await;
            self.sink.emit(StatusEvent::ProxyStopped);
        }
    }

    pub async fn active_profile_index(&self) -> i32 {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| session.active_profile_index)
            .unwrap_or(PROFILE_INDEX_NONE)
    }

    /// Actual bound addresses of the live listener pair, if any.
    pub async fn listener_addrs(&self) -> Option<(SocketAddr, SocketAddr)> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|session| (session.http_addr(), session.https_addr()))
    }

    async fn bind(&self, port: u16) -> io::Result<TcpListener> {
        TcpListener::bind(format!("{}:{port}", self.config.listen_addr)).await
    }

    fn report_bind_failure(
        &self,
        kind: ListenerKind,
        port: u16,
        source: io::Error,
    ) -> EngineError {
        let addr = format!("{}:{port}", self.config.listen_addr);
        self.sink.emit(StatusEvent::error(
            ErrorKind::Listen,
            source.to_string(),
            addr.clone(),
        ));
        EngineError::Listen {
            listener: kind.as_str(),
            addr,
            source,
        }
    }
}
