//! Profile data model and routing-rule resolution.
//!
//! Profiles are owned by the external configuration layer and handed to the
//! engine by value when a session starts; everything in this crate is a pure
//! function over that structure. Rule matching follows the configuration
//! format's semantics: `hostUsingProxy`/`hostBypassProxy` entries match as
//! substrings of the destination hostname, fixed rules are exact
//! `host:port` keys.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct Profile {
    pub name: String,
    pub proxy: ProxySettings,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            name: String::new(),
            proxy: ProxySettings::default(),
        }
    }
}

impl Profile {
    pub fn validate(&self) -> Result<(), RouteConfigError> {
        if self.name.trim().is_empty() {
            return Err(RouteConfigError::MissingProfileName);
        }
        self.proxy.validate()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct ProxySettings {
    pub host_using_proxy: Vec<String>,
    pub host_bypass_proxy: Vec<String>,
    pub proxy_host: Option<String>,
    pub proxy_port: Option<u16>,
    pub http_fixed_rule: BTreeMap<String, Mapping>,
    pub https_fixed_rule: BTreeMap<String, Mapping>,
}

impl ProxySettings {
    fn validate(&self) -> Result<(), RouteConfigError> {
        for list in [&self.host_using_proxy, &self.host_bypass_proxy] {
            if list.iter().any(|entry| entry.trim().is_empty()) {
                return Err(RouteConfigError::EmptyHostEntry);
            }
        }
        for (key, mapping) in self
            .http_fixed_rule
            .iter()
            .chain(self.https_fixed_rule.iter())
        {
            parse_host_port(key, None)
                .map_err(|_| RouteConfigError::InvalidRuleKey { key: key.clone() })?;
            parse_mapping_target(&mapping.target)
                .map_err(|_| RouteConfigError::InvalidMappingTarget { key: key.clone() })?;
            if let Some(proxy) = mapping.customized_proxy.as_deref() {
                parse_host_port(proxy, Some(80))
                    .map_err(|_| RouteConfigError::InvalidCustomizedProxy { key: key.clone() })?;
            }
        }
        Ok(())
    }

    /// The profile-level remote proxy endpoint, if fully configured.
    pub fn remote_proxy(&self) -> Option<HostPort> {
        let host = self.proxy_host.as_deref()?.trim();
        if host.is_empty() {
            return None;
        }
        Some(HostPort {
            host: host.to_string(),
            port: self.proxy_port.unwrap_or(80),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct Mapping {
    pub target: String,
    pub customized_proxy: Option<String>,
    pub keep_host_header: bool,
    pub bypass_cors: bool,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouteConfigError {
    #[error("profile name is required")]
    MissingProfileName,
    #[error("host rule lists must not contain empty entries")]
    EmptyHostEntry,
    #[error("fixed rule key {key:?} is not a valid host:port")]
    InvalidRuleKey { key: String },
    #[error("fixed rule {key:?} has an invalid mapping target")]
    InvalidMappingTarget { key: String },
    #[error("fixed rule {key:?} has an invalid customizedProxy endpoint")]
    InvalidCustomizedProxy { key: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("mapping target {target:?} for {entry} could not be parsed")]
    InvalidMappingTarget { entry: String, target: String },
    #[error("invalid host:port authority {0:?}")]
    InvalidAuthority(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port` with IPv6 literals bracketed, as used on CONNECT request
    /// lines and Host headers.
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

/// Parses `host[:port]`, accepting bracketed IPv6 literals. Without a port,
/// `default_port` applies; a missing port with no default is an error.
pub fn parse_host_port(authority: &str, default_port: Option<u16>) -> Result<HostPort, RouteError> {
    let invalid = || RouteError::InvalidAuthority(authority.to_string());

    if let Some(rest) = authority.strip_prefix('[') {
        let (host, suffix) = rest.split_once(']').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port = match suffix {
            "" => default_port.ok_or_else(invalid)?,
            _ => suffix
                .strip_prefix(':')
                .and_then(|text| text.parse::<u16>().ok())
                .ok_or_else(invalid)?,
        };
        return Ok(HostPort::new(host, port));
    }

    match authority.rsplit_once(':') {
        Some((host, port_text)) if !host.contains(':') => {
            if host.is_empty() {
                return Err(invalid());
            }
            let port = port_text.parse::<u16>().map_err(|_| invalid())?;
            Ok(HostPort::new(host, port))
        }
        Some(_) => Err(invalid()),
        None => {
            if authority.is_empty() {
                return Err(invalid());
            }
            let port = default_port.ok_or_else(invalid)?;
            Ok(HostPort::new(authority, port))
        }
    }
}

/// Loopback destinations never route through an upstream proxy.
pub fn is_loopback_host(host: &str) -> bool {
    host.contains("localhost") || host.contains("127.0.0.1") || host.contains("::1")
}

fn matches_host_list(rules: &[String], host: &str) -> bool {
    rules
        .iter()
        .any(|rule| !rule.is_empty() && host.contains(rule.as_str()))
}

/// True when the host is in the use-proxy list and not excused by the
/// bypass list.
pub fn uses_remote_proxy(profile: &Profile, host: &str) -> bool {
    matches_host_list(&profile.proxy.host_using_proxy, host)
        && !matches_host_list(&profile.proxy.host_bypass_proxy, host)
}

/// Decides whether a CONNECT to `host:port` should be redirected to the
/// local TLS interception listener instead of tunneled to the real target.
pub fn connect_intercepted(profile: Option<&Profile>, host: &str, port: u16) -> bool {
    let Some(profile) = profile else {
        return false;
    };
    let key = HostPort::new(host, port).authority();
    profile.proxy.https_fixed_rule.contains_key(&key) || uses_remote_proxy(profile, host)
}

/// Which fixed-rule table applies; the plaintext and intercepted listeners
/// use distinct namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleTable {
    Http,
    Https,
}

/// A fully resolved forwarding decision for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePlan {
    pub scheme: Scheme,
    pub target: HostPort,
    pub upstream_proxy: Option<HostPort>,
    pub keep_host_header: bool,
    pub bypass_cors: bool,
}

impl RoutePlan {
    fn direct(scheme: Scheme, target: HostPort) -> Self {
        Self {
            scheme,
            target,
            upstream_proxy: None,
            keep_host_header: false,
            bypass_cors: false,
        }
    }
}

/// Parses a mapping target of the form `http[s]://host[:port]`, with the
/// port defaulting per scheme. Trailing path segments are ignored.
pub fn parse_mapping_target(target: &str) -> Result<(Scheme, HostPort), RouteError> {
    let (scheme, rest) = if let Some(rest) = target.strip_prefix("https://") {
        (Scheme::Https, rest)
    } else if let Some(rest) = target.strip_prefix("http://") {
        (Scheme::Http, rest)
    } else {
        return Err(RouteError::InvalidAuthority(target.to_string()));
    };
    let authority = rest.split('/').next().unwrap_or(rest);
    let host_port = parse_host_port(authority, Some(scheme.default_port()))?;
    Ok((scheme, host_port))
}

/// Resolves the forwarding plan for a request originally addressed to
/// `host:port` with `origin_scheme`, consulting the given fixed-rule table
/// first and the use/bypass proxy lists second. A matching mapping's target
/// decides the outbound scheme; otherwise the original scheme sticks.
/// Without a profile (direct session) the request goes straight to its
/// original destination.
pub fn resolve_route(
    profile: Option<&Profile>,
    table: RuleTable,
    origin_scheme: Scheme,
    host: &str,
    port: u16,
) -> Result<RoutePlan, RouteError> {
    let original = HostPort::new(host, port);
    let Some(profile) = profile else {
        return Ok(RoutePlan::direct(origin_scheme, original));
    };

    let rules = match table {
        RuleTable::Http => &profile.proxy.http_fixed_rule,
        RuleTable::Https => &profile.proxy.https_fixed_rule,
    };

    if let Some(mapping) = rules.get(&original.authority()) {
        let (scheme, target) =
            parse_mapping_target(&mapping.target).map_err(|_| RouteError::InvalidMappingTarget {
                entry: original.authority(),
                target: mapping.target.clone(),
            })?;
        let upstream_proxy = match mapping.customized_proxy.as_deref() {
            Some(proxy) if !is_loopback_host(&target.host) => {
                Some(parse_host_port(proxy, Some(80))?)
            }
            _ => None,
        };
        return Ok(RoutePlan {
            scheme,
            target,
            upstream_proxy,
            keep_host_header: mapping.keep_host_header,
            bypass_cors: mapping.bypass_cors,
        });
    }

    let mut plan = RoutePlan::direct(origin_scheme, original);
    if !is_loopback_host(host) && uses_remote_proxy(profile, host) {
        plan.upstream_proxy = profile.proxy.remote_proxy();
    }
    Ok(plan)
}
