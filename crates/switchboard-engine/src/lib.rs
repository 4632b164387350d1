//! switchboard: a locally-run, profile-switchable intercepting proxy.
//!
//! A plaintext listener accepts proxy traffic (CONNECT tunnels and
//! absolute-form HTTP); routing rules redirect in-scope CONNECTs into a
//! loopback TLS listener that terminates TLS with leaf certificates issued
//! on the fly under a private root authority, then forwards the decrypted
//! requests — directly or through a second-hop upstream proxy — with
//! per-profile destination and header rewriting.

pub mod config;

mod engine;
mod forward;
mod http;
mod mitm;
mod plaintext;
mod session;
mod shutdown;
mod upstream;

pub use config::{AppConfig, ConfigError, EngineConfig};
pub use engine::{EngineError, ProfileSelection, ProxyEngine};
pub use session::{PROFILE_INDEX_DIRECT, PROFILE_INDEX_NONE};
