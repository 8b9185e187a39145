//! oxide-ssh - SSH session lifecycle and authentication core
//!
//! Sets up and manages an authenticated SSH transport session: network
//! connection, server identity verification against known-hosts files,
//! and client authentication. The wire protocol itself comes from the
//! russh engine; this crate drives it and hands an authorized transport
//! handle to channel-execution and file-transfer components.
//!
//! # Features
//! - Lifecycle state machine: connect → verify host identity → authenticate
//! - Host key verification against OpenSSH-syntax known_hosts files,
//!   including hashed hostnames and `[host]:port` entries
//! - Password, key pair, SSH agent and keyboard-interactive authentication
//! - One serial worker per session: operations never overlap, disconnect
//!   cancels queued and in-flight work
//! - MD5/SHA1 host key fingerprints for human verification
//!
//! In its simplest form:
//!
//! ```no_run
//! use oxide_ssh::{Session, SessionConfig};
//!
//! # async fn example() -> Result<(), oxide_ssh::SshError> {
//! let session = Session::new(SessionConfig::new("127.0.0.1", "user"));
//! session.connect().await?;
//! let status = session.known_host_status(None).await?;
//! session.authenticate_password("pass").await?;
//! assert!(session.is_authorized());
//! # Ok(())
//! # }
//! ```

mod agent;
mod auth;
mod config;
mod error;
mod handler;
mod known_hosts;
mod session;
mod worker;

pub use agent::is_agent_available;
pub use auth::{AuthMethod, Credentials, PromptResponder};
pub use config::SessionConfig;
pub use error::SshError;
pub use handler::ClientHandler;
pub use known_hosts::{FingerprintHash, KnownHostStatus};
pub use session::{Session, SessionState, TransportHandle};

use std::sync::OnceLock;
use std::time::Duration;

struct EngineDefaults {
    client_id: String,
    keepalive_interval: Option<Duration>,
}

static ENGINE: OnceLock<EngineDefaults> = OnceLock::new();

/// One-time, process-wide engine setup.
///
/// Builds the shared transport configuration template exactly once.
/// Sessions call this implicitly on construction; embedders that create
/// sessions from several threads at startup may call it eagerly. Safe to
/// call any number of times.
pub fn init() {
    engine_defaults();
}

fn engine_defaults() -> &'static EngineDefaults {
    ENGINE.get_or_init(|| EngineDefaults {
        client_id: format!("SSH-2.0-oxide_ssh_{}", env!("CARGO_PKG_VERSION")),
        keepalive_interval: Some(Duration::from_secs(30)),
    })
}

/// Per-connection engine configuration, from the process-wide template.
/// `banner` overrides the identification string sent to the server.
pub(crate) fn client_config(banner: Option<&str>) -> russh::client::Config {
    let defaults = engine_defaults();
    let client_id = russh::SshId::Standard(
        banner
            .map(|b| b.to_string())
            .unwrap_or_else(|| defaults.client_id.clone()),
    );
    russh::client::Config {
        client_id,
        inactivity_timeout: None,
        keepalive_interval: defaults.keepalive_interval,
        keepalive_max: 3,
        ..Default::default()
    }
}
