//! SSH Session lifecycle
//!
//! `Session` owns the transport through its worker task and exposes the
//! connect → verify host identity → authenticate sequence as async
//! operations. Operations on one session execute strictly one at a time,
//! in submission order; operations on different sessions are independent.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use russh::client::Msg;
use russh::Channel;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

use crate::auth::{AuthMethod, Credentials};
use crate::config::SessionConfig;
use crate::error::SshError;
use crate::known_hosts::{FingerprintHash, KnownHostStatus};
use crate::worker::{self, SessionCommand};

/// Lifecycle state of a session.
///
/// `Disconnected` is both initial and terminal; `Failed` is reached from
/// `Connecting` or `Authenticating` and only `connect` leaves it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Authorized,
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Authenticating => "authenticating",
            SessionState::Authorized => "authorized",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// State shared between the session facade, its worker and the handshake
/// handler. Transitions are written only by the worker.
pub(crate) struct SessionShared {
    state: RwLock<SessionState>,
    last_error: RwLock<Option<SshError>>,
    remote_banner: Arc<RwLock<Option<String>>>,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            state: RwLock::new(SessionState::Disconnected),
            last_error: RwLock::new(None),
            remote_banner: Arc::new(RwLock::new(None)),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        debug!("Session state -> {}", state);
        *self.state.write() = state;
    }

    pub(crate) fn record(&self, err: &SshError) {
        *self.last_error.write() = Some(err.clone());
    }

    pub(crate) fn last_error(&self) -> Option<SshError> {
        self.last_error.read().clone()
    }

    pub(crate) fn remote_banner(&self) -> Option<String> {
        self.remote_banner.read().clone()
    }

    pub(crate) fn clear_remote_banner(&self) {
        *self.remote_banner.write() = None;
    }

    pub(crate) fn remote_banner_slot(&self) -> Arc<RwLock<Option<String>>> {
        self.remote_banner.clone()
    }
}

/// An SSH session: transport ownership, host identity verification and
/// client authentication against one remote host.
///
/// Must be created inside a Tokio runtime; the session spawns its worker
/// on construction. Dropping the session tears the transport down.
pub struct Session {
    config: SessionConfig,
    shared: Arc<SessionShared>,
    cmd_tx: mpsc::Sender<SessionCommand>,
    cancel_tx: broadcast::Sender<()>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        crate::init();
        let shared = Arc::new(SessionShared::new());
        let session_id = Uuid::new_v4().to_string();
        let (cmd_tx, cancel_tx) = worker::spawn(config.clone(), shared.clone(), session_id);
        Self {
            config,
            shared,
            cmd_tx,
            cancel_tx,
        }
    }

    /// Submit a command and wait for its completion.
    async fn submit<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, SshError>>) -> SessionCommand,
    ) -> Result<T, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx.await.map_err(|_| SshError::Disconnected)?
    }

    /// Open the network connection and perform the transport handshake,
    /// using the configured timeout (10 s unless set otherwise).
    pub async fn connect(&self) -> Result<(), SshError> {
        self.connect_with_timeout(Duration::from_secs(self.config.timeout_secs))
            .await
    }

    /// Like [`Session::connect`] with an explicit deadline. Exceeding it
    /// aborts the in-progress handshake with [`SshError::Timeout`].
    pub async fn connect_with_timeout(&self, timeout: Duration) -> Result<(), SshError> {
        self.submit(|reply| SessionCommand::Connect { timeout, reply })
            .await
    }

    /// Release the transport and socket unconditionally and return to
    /// `Disconnected`. An operation queued or in flight completes with
    /// [`SshError::Cancelled`]. Idempotent.
    pub async fn disconnect(&self) {
        // Wake the worker first so the operation in flight is cancelled
        // rather than run to completion.
        let _ = self.cancel_tx.send(());
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(SessionCommand::Disconnect { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }

    /// Authenticate with the given credentials. Requires a connected
    /// session; one handshake per call, no internal retry.
    pub async fn authenticate(&self, credentials: Credentials) -> Result<(), SshError> {
        self.submit(|reply| SessionCommand::Authenticate { credentials, reply })
            .await
    }

    pub async fn authenticate_password(
        &self,
        password: impl Into<String>,
    ) -> Result<(), SshError> {
        self.authenticate(Credentials::password(password)).await
    }

    /// Authenticate by key pair. Pass `None` for `passphrase` when the
    /// private key is unencrypted.
    pub async fn authenticate_key_pair(
        &self,
        public_key: Option<&Path>,
        private_key: &Path,
        passphrase: Option<&str>,
    ) -> Result<(), SshError> {
        let credentials = match public_key {
            Some(public_key) => {
                Credentials::key_pair_with_public_key(public_key, private_key, passphrase)
            }
            None => Credentials::key_pair(private_key, passphrase),
        };
        self.authenticate(credentials).await
    }

    pub async fn authenticate_agent(&self) -> Result<(), SshError> {
        self.authenticate(Credentials::agent()).await
    }

    /// Authenticate by keyboard-interactive; `responder` answers each
    /// server prompt in order.
    pub async fn authenticate_interactive(
        &self,
        responder: impl FnMut(&str, bool) -> String + Send + 'static,
    ) -> Result<(), SshError> {
        self.authenticate(Credentials::interactive(responder)).await
    }

    /// Mechanisms the server advertises for the configured username, in
    /// server order. Requires a connected, not yet authenticated session.
    pub async fn supported_auth_methods(&self) -> Result<Vec<AuthMethod>, SshError> {
        self.submit(|reply| SessionCommand::QueryAuthMethods { reply })
            .await
    }

    /// Fingerprint of the server host key using the configured hash.
    pub async fn fingerprint(&self) -> Result<String, SshError> {
        self.fingerprint_with(self.config.fingerprint_hash).await
    }

    /// Fingerprint of the server host key using an explicit hash. Requires
    /// a connected session; no side effects.
    pub async fn fingerprint_with(&self, hash: FingerprintHash) -> Result<String, SshError> {
        self.submit(|reply| SessionCommand::Fingerprint { hash, reply })
            .await
    }

    /// Check the server's host key against known-hosts files, scanned in
    /// the given order (platform defaults when `None`). Requires a
    /// connected session.
    pub async fn known_host_status(
        &self,
        files: Option<Vec<PathBuf>>,
    ) -> Result<KnownHostStatus, SshError> {
        self.submit(|reply| SessionCommand::CheckKnownHosts { files, reply })
            .await
    }

    /// Append the server's host key to a known-hosts file (the default
    /// user file when `None`). With `salt`, `host_name` must already be
    /// salted, SHA1-hashed and base64-encoded, and the entry is written in
    /// hashed form. Requires a connected session.
    pub async fn add_known_host(
        &self,
        host_name: &str,
        port: u16,
        file: Option<PathBuf>,
        salt: Option<&str>,
    ) -> Result<(), SshError> {
        let host_name = host_name.to_string();
        let salt = salt.map(|s| s.to_string());
        self.submit(|reply| SessionCommand::AddKnownHost {
            host_name,
            port,
            file,
            salt,
            reply,
        })
        .await
    }

    /// Collaborator accessor: a non-owning handle to the authorized
    /// transport for channel-execution and file-transfer components.
    /// Fails until the session is authorized; the handle's operations fail
    /// once the session disconnects.
    pub fn handle(&self) -> Result<TransportHandle, SshError> {
        if self.shared.state() != SessionState::Authorized {
            let err = SshError::InvalidState(format!(
                "transport handle requires an authorized session (currently {})",
                self.shared.state()
            ));
            self.shared.record(&err);
            return Err(err);
        }
        Ok(TransportHandle {
            cmd_tx: self.cmd_tx.clone(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// True from `Connected` onwards (connected, authenticating or
    /// authorized).
    pub fn is_connected(&self) -> bool {
        matches!(
            self.shared.state(),
            SessionState::Connected | SessionState::Authenticating | SessionState::Authorized
        )
    }

    /// True exactly in `Authorized`.
    pub fn is_authorized(&self) -> bool {
        self.shared.state() == SessionState::Authorized
    }

    /// Most recent error delivered through any completion.
    pub fn last_error(&self) -> Option<SshError> {
        self.shared.last_error()
    }

    /// Banner the server sent during authentication, if any.
    pub fn remote_banner(&self) -> Option<String> {
        self.shared.remote_banner()
    }

    pub fn host(&self) -> &str {
        &self.config.host
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn username(&self) -> &str {
        &self.config.username
    }
}

/// Non-owning reference to an authorized session's transport.
///
/// Cloneable; all operations are serialized through the owning session's
/// worker. Must not be retained past the session's lifetime; operations
/// fail with [`SshError::Disconnected`] once the session is gone.
#[derive(Clone)]
pub struct TransportHandle {
    cmd_tx: mpsc::Sender<SessionCommand>,
}

impl TransportHandle {
    /// Open a session channel on the authorized transport.
    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::OpenSessionChannel { reply: reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx.await.map_err(|_| SshError::Disconnected)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::net::TcpListener;

    fn session_for(host: &str, port: u16) -> Session {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_env("OXIDE_SSH_LOG"))
            .try_init();
        Session::new(SessionConfig::new(host, "deploy").with_port(port))
    }

    /// A listener that accepts TCP connections but never speaks SSH, so
    /// the version exchange hangs until the connect deadline.
    async fn silent_listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn test_new_session_is_disconnected() {
        let session = session_for("localhost", 22);
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.is_connected());
        assert!(!session.is_authorized());
        assert!(session.last_error().is_none());
        assert!(session.remote_banner().is_none());
        assert_eq!(session.host(), "localhost");
        assert_eq!(session.port(), 22);
        assert_eq!(session.username(), "deploy");
    }

    #[tokio::test]
    async fn test_authenticate_requires_connection() {
        let session = session_for("localhost", 22);
        let err = session.authenticate_password("secret").await.unwrap_err();
        assert!(matches!(err, SshError::InvalidState(_)));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(matches!(
            session.last_error(),
            Some(SshError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_queries_require_connection() {
        let session = session_for("localhost", 22);

        assert!(matches!(
            session.fingerprint().await,
            Err(SshError::InvalidState(_))
        ));
        assert!(matches!(
            session.supported_auth_methods().await,
            Err(SshError::InvalidState(_))
        ));
        assert!(matches!(
            session.known_host_status(None).await,
            Err(SshError::InvalidState(_))
        ));
        assert!(matches!(
            session.add_known_host("localhost", 22, None, None).await,
            Err(SshError::InvalidState(_))
        ));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_handle_requires_authorization() {
        let session = session_for("localhost", 22);
        assert!(matches!(session.handle(), Err(SshError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let session = session_for("localhost", 22);
        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_timeout_to_silent_server() {
        let (_listener, port) = silent_listener().await;
        let session = session_for("127.0.0.1", port);

        let err = session
            .connect_with_timeout(Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, SshError::Timeout(_)));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(!session.is_connected());
        assert!(matches!(session.last_error(), Some(SshError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_connect_failure_to_closed_port() {
        // Bind-then-drop to get a port nothing listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let session = session_for("127.0.0.1", port);

        let err = session.connect().await.unwrap_err();
        assert!(matches!(
            err,
            SshError::ConnectionFailed(_) | SshError::Timeout(_)
        ));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_operations_after_failed_connect_need_reconnect() {
        let (_listener, port) = silent_listener().await;
        let session = session_for("127.0.0.1", port);

        let _ = session
            .connect_with_timeout(Duration::from_millis(100))
            .await;
        assert_eq!(session.state(), SessionState::Failed);

        // Failed is not "connected or later"
        assert!(matches!(
            session.fingerprint().await,
            Err(SshError::InvalidState(_))
        ));
        assert!(matches!(
            session.authenticate_password("secret").await,
            Err(SshError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_cancels_connect_in_flight() {
        let (_listener, port) = silent_listener().await;
        let session = Arc::new(session_for("127.0.0.1", port));

        let connecting = {
            let session = session.clone();
            tokio::spawn(async move {
                session.connect_with_timeout(Duration::from_secs(30)).await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = Instant::now();
        session.disconnect().await;

        let result = connecting.await.unwrap();
        assert!(matches!(result, Err(SshError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_queued_operations() {
        let (_listener, port) = silent_listener().await;
        let session = Arc::new(session_for("127.0.0.1", port));

        let connecting = {
            let session = session.clone();
            tokio::spawn(async move {
                session.connect_with_timeout(Duration::from_secs(30)).await
            })
        };
        // Let the connect start executing before queueing behind it
        tokio::time::sleep(Duration::from_millis(50)).await;
        let queued = {
            let session = session.clone();
            tokio::spawn(async move { session.fingerprint().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        session.disconnect().await;

        assert!(matches!(
            connecting.await.unwrap(),
            Err(SshError::Cancelled)
        ));
        // The queued fingerprint never ran; it is cancelled, not rejected
        // for state
        assert!(matches!(queued.await.unwrap(), Err(SshError::Cancelled)));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_operations_on_same_session_are_serialized() {
        let (_listener, port) = silent_listener().await;
        let session = session_for("127.0.0.1", port);
        let per_op = Duration::from_millis(300);

        let started = Instant::now();
        let (first, second) = tokio::join!(
            session.connect_with_timeout(per_op),
            session.connect_with_timeout(per_op),
        );
        let elapsed = started.elapsed();

        // Two timed-out connects, strictly one after the other: the
        // second starts only once the first has completed.
        assert!(matches!(first, Err(SshError::Timeout(_))));
        assert!(matches!(second, Err(SshError::Timeout(_))));
        assert!(
            elapsed >= Duration::from_millis(550),
            "operations overlapped: {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn test_sessions_do_not_serialize_against_each_other() {
        let (_listener_a, port_a) = silent_listener().await;
        let (_listener_b, port_b) = silent_listener().await;
        let a = session_for("127.0.0.1", port_a);
        let b = session_for("127.0.0.1", port_b);
        let per_op = Duration::from_millis(300);

        let started = Instant::now();
        let (ra, rb) = tokio::join!(
            a.connect_with_timeout(per_op),
            b.connect_with_timeout(per_op),
        );
        let elapsed = started.elapsed();

        assert!(ra.is_err() && rb.is_err());
        assert!(
            elapsed < Duration::from_millis(550),
            "independent sessions were serialized: {elapsed:?}"
        );
    }
}
