//! Session configuration

use serde::{Deserialize, Serialize};

use crate::known_hosts::FingerprintHash;

/// SSH session configuration.
///
/// Host, port and username are fixed at construction; a `Session` never
/// changes them afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Connection timeout in seconds (default: 10)
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Client identification string sent to the server during the version
    /// exchange (e.g. `"SSH-2.0-myclient_1.0"`). `None` uses the crate
    /// default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,

    /// Hash algorithm used by `Session::fingerprint` (default: MD5)
    #[serde(default)]
    pub fingerprint_hash: FingerprintHash,
}

impl SessionConfig {
    /// Create a configuration for `host` and `username` with defaults for
    /// everything else.
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: username.into(),
            timeout_secs: default_timeout(),
            banner: None,
            fingerprint_hash: FingerprintHash::default(),
        }
    }

    /// Like [`SessionConfig::new`], but accepts a combined host
    /// specification: `"host"`, `"host:port"`, or `"[v6addr]:port"` for
    /// IPv6 addresses with an explicit port.
    pub fn for_host(host_spec: &str, username: impl Into<String>) -> Self {
        let (host, port) = split_host_port(host_spec);
        let mut config = Self::new(host, username);
        config.port = port;
        config
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_banner(mut self, banner: impl Into<String>) -> Self {
        self.banner = Some(banner.into());
        self
    }

    pub fn with_fingerprint_hash(mut self, hash: FingerprintHash) -> Self {
        self.fingerprint_hash = hash;
        self
    }
}

/// Split `"host"`, `"host:port"` or `"[v6addr]:port"` into host and port.
///
/// A bare IPv6 address (more than one `:`, no brackets) is taken verbatim
/// with the default port.
fn split_host_port(input: &str) -> (String, u16) {
    if let Some(rest) = input.strip_prefix('[') {
        if let Some((host, port)) = rest.split_once("]:") {
            if let Ok(port) = port.parse() {
                return (host.to_string(), port);
            }
        }
        // "[v6addr]" without a port
        return (rest.trim_end_matches(']').to_string(), default_port());
    }

    if input.matches(':').count() == 1 {
        if let Some((host, port)) = input.split_once(':') {
            if let Ok(port) = port.parse() {
                return (host.to_string(), port);
            }
        }
    }

    (input.to_string(), default_port())
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    10
}
