//! Status and error events produced by the proxy engine toward whatever
//! external layer drives it (a UI shell, a supervisor, a test harness).
//!
//! The engine never prints; every externally visible condition is delivered
//! as a [`StatusEvent`] through an [`EventSink`]. Transport of the events is
//! the consumer's concern.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerKind {
    Http,
    Https,
}

impl ListenerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

/// Failure taxonomy reported on the status channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    RootCaNotLoaded,
    CertificateGeneration,
    Listen,
    UpstreamConnect,
    UpstreamTimeout,
    ClientProtocol,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::RootCaNotLoaded => "root_ca_not_loaded",
            Self::CertificateGeneration => "certificate_generation",
            Self::Listen => "listen",
            Self::UpstreamConnect => "upstream_connect",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::ClientProtocol => "client_protocol",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    Listening {
        port: u16,
        listener: ListenerKind,
    },
    ProxyStarted {
        active_profile_index: i32,
    },
    ProxyStopped,
    Error {
        kind: ErrorKind,
        message: String,
        context: String,
    },
}

impl StatusEvent {
    /// Failure event carrying enough context (`host:port`, underlying error
    /// text) for diagnosis. No failure path should discard information.
    pub fn error(kind: ErrorKind, message: impl Into<String>, context: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
            context: context.into(),
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: StatusEvent);
}

#[derive(Debug, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: StatusEvent) {}
}

/// Collects events in memory; used by tests to assert on engine behavior.
#[derive(Debug, Default, Clone)]
pub struct VecEventSink {
    events: Arc<Mutex<Vec<StatusEvent>>>,
}

impl VecEventSink {
    pub fn snapshot(&self) -> Vec<StatusEvent> {
        self.events.lock().expect("lock poisoned").clone()
    }

    pub fn errors_of_kind(&self, kind: ErrorKind) -> Vec<StatusEvent> {
        self.snapshot()
            .into_iter()
            .filter(|event| matches!(event, StatusEvent::Error { kind: found, .. } if *found == kind))
            .collect()
    }
}

impl EventSink for VecEventSink {
    fn emit(&self, event: StatusEvent) {
        self.events.lock().expect("lock poisoned").push(event);
    }
}
