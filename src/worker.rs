//! Session worker task
//!
//! One task per session owns the transport; everything else talks to it
//! through an mpsc command channel. The queue is the FIFO ordering
//! guarantee and the single task is the mutual exclusion: two operations
//! on the same session never run their blocking work concurrently.
//!
//! Disconnect is signalled out-of-band on a broadcast channel so it can
//! cancel the operation in flight; the worker then answers every queued
//! command with a cancellation error until the disconnect command itself
//! arrives and tears the transport down.

use std::future::Future;
use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use russh::client::{self, Msg};
use russh::keys::PublicKey;
use russh::{Channel, Disconnect};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::auth::{self, AuthMethod, Credentials};
use crate::config::SessionConfig;
use crate::error::SshError;
use crate::handler::ClientHandler;
use crate::known_hosts::{self, FingerprintHash, KnownHostStatus};
use crate::session::{SessionShared, SessionState};

pub(crate) enum SessionCommand {
    Connect {
        timeout: Duration,
        reply: oneshot::Sender<Result<(), SshError>>,
    },
    Authenticate {
        credentials: Credentials,
        reply: oneshot::Sender<Result<(), SshError>>,
    },
    QueryAuthMethods {
        reply: oneshot::Sender<Result<Vec<AuthMethod>, SshError>>,
    },
    Fingerprint {
        hash: FingerprintHash,
        reply: oneshot::Sender<Result<String, SshError>>,
    },
    CheckKnownHosts {
        files: Option<Vec<PathBuf>>,
        reply: oneshot::Sender<Result<KnownHostStatus, SshError>>,
    },
    AddKnownHost {
        host_name: String,
        port: u16,
        file: Option<PathBuf>,
        salt: Option<String>,
        reply: oneshot::Sender<Result<(), SshError>>,
    },
    OpenSessionChannel {
        reply: oneshot::Sender<Result<Channel<Msg>, SshError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

impl SessionCommand {
    /// Answer the command with `err` without executing it.
    fn reject(self, err: SshError, shared: &SessionShared) {
        shared.record(&err);
        match self {
            SessionCommand::Connect { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            SessionCommand::Authenticate { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            SessionCommand::QueryAuthMethods { reply } => {
                let _ = reply.send(Err(err));
            }
            SessionCommand::Fingerprint { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            SessionCommand::CheckKnownHosts { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            SessionCommand::AddKnownHost { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            SessionCommand::OpenSessionChannel { reply } => {
                let _ = reply.send(Err(err));
            }
            SessionCommand::Disconnect { reply } => {
                let _ = reply.send(());
            }
        }
    }
}

/// The active transport: the engine handle plus what the server presented
/// during the handshake.
struct Transport {
    handle: client::Handle<ClientHandler>,
    host_key: PublicKey,
}

pub(crate) struct SessionWorker {
    config: SessionConfig,
    shared: Arc<SessionShared>,
    transport: Option<Transport>,
    session_id: String,
}

/// Spawn the worker task for a session. Returns the command sender and the
/// out-of-band cancellation sender used by disconnect.
pub(crate) fn spawn(
    config: SessionConfig,
    shared: Arc<SessionShared>,
    session_id: String,
) -> (mpsc::Sender<SessionCommand>, broadcast::Sender<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (cancel_tx, cancel_rx) = broadcast::channel(4);

    let worker = SessionWorker {
        config,
        shared,
        transport: None,
        session_id,
    };
    tokio::spawn(worker.run(cmd_rx, cancel_rx));

    (cmd_tx, cancel_tx)
}

/// Run `fut` unless the cancellation signal fires first, answering `reply`
/// either way. Returns whether the operation was cancelled.
async fn run_cancellable<T>(
    cancel_rx: &mut broadcast::Receiver<()>,
    shared: &SessionShared,
    reply: oneshot::Sender<Result<T, SshError>>,
    fut: impl Future<Output = Result<T, SshError>>,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel_rx.recv() => {
            shared.record(&SshError::Cancelled);
            let _ = reply.send(Err(SshError::Cancelled));
            true
        }
        result = fut => {
            if let Err(err) = &result {
                shared.record(err);
            }
            let _ = reply.send(result);
            false
        }
    }
}

impl SessionWorker {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<SessionCommand>,
        mut cancel_rx: broadcast::Receiver<()>,
    ) {
        debug!("Session worker started ({})", self.session_id);
        let mut draining = false;

        loop {
            let cmd = tokio::select! {
                biased;
                sig = cancel_rx.recv() => {
                    match sig {
                        Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                            draining = true;
                            continue;
                        }
                        // Session dropped; shut the worker down
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
            };

            if draining {
                match cmd {
                    SessionCommand::Disconnect { reply } => {
                        self.teardown().await;
                        while cancel_rx.try_recv().is_ok() {}
                        draining = false;
                        let _ = reply.send(());
                    }
                    other => other.reject(SshError::Cancelled, &self.shared),
                }
                continue;
            }

            let shared = Arc::clone(&self.shared);
            let cancelled = match cmd {
                SessionCommand::Connect { timeout, reply } => {
                    run_cancellable(&mut cancel_rx, &shared, reply, self.do_connect(timeout)).await
                }
                SessionCommand::Authenticate { credentials, reply } => {
                    run_cancellable(
                        &mut cancel_rx,
                        &shared,
                        reply,
                        self.do_authenticate(credentials),
                    )
                    .await
                }
                SessionCommand::QueryAuthMethods { reply } => {
                    run_cancellable(&mut cancel_rx, &shared, reply, self.do_query_methods()).await
                }
                SessionCommand::Fingerprint { hash, reply } => {
                    run_cancellable(&mut cancel_rx, &shared, reply, self.do_fingerprint(hash)).await
                }
                SessionCommand::CheckKnownHosts { files, reply } => {
                    run_cancellable(
                        &mut cancel_rx,
                        &shared,
                        reply,
                        self.do_check_known_hosts(files),
                    )
                    .await
                }
                SessionCommand::AddKnownHost {
                    host_name,
                    port,
                    file,
                    salt,
                    reply,
                } => {
                    run_cancellable(
                        &mut cancel_rx,
                        &shared,
                        reply,
                        self.do_add_known_host(host_name, port, file, salt),
                    )
                    .await
                }
                SessionCommand::OpenSessionChannel { reply } => {
                    run_cancellable(&mut cancel_rx, &shared, reply, self.do_open_channel()).await
                }
                SessionCommand::Disconnect { reply } => {
                    self.teardown().await;
                    while cancel_rx.try_recv().is_ok() {}
                    let _ = reply.send(());
                    false
                }
            };

            if cancelled {
                warn!(
                    "Operation cancelled by disconnect ({})",
                    self.session_id
                );
                draining = true;
            }
        }

        // Session dropped: release the transport and answer stragglers
        self.teardown().await;
        drain_pending(&mut cmd_rx, &self.shared);
        debug!("Session worker terminated ({})", self.session_id);
    }

    async fn do_connect(&mut self, timeout: Duration) -> Result<(), SshError> {
        match self.shared.state() {
            SessionState::Disconnected | SessionState::Failed => {}
            state => {
                return Err(SshError::InvalidState(format!(
                    "connect called while {state}"
                )));
            }
        }

        // A failed attempt can leave a dead transport behind
        self.transport = None;
        self.shared.clear_remote_banner();
        self.shared.set_state(SessionState::Connecting);

        info!(
            "Connecting to {}:{} as {} ({})",
            self.config.host, self.config.port, self.config.username, self.session_id
        );

        match self.handshake(timeout).await {
            Ok(transport) => {
                info!(
                    "Connected to {}:{} ({})",
                    self.config.host, self.config.port, self.session_id
                );
                self.transport = Some(transport);
                self.shared.set_state(SessionState::Connected);
                Ok(())
            }
            Err(err) => {
                warn!(
                    "Connection to {}:{} failed: {} ({})",
                    self.config.host, self.config.port, err, self.session_id
                );
                self.shared.set_state(SessionState::Failed);
                Err(err)
            }
        }
    }

    async fn handshake(&mut self, timeout: Duration) -> Result<Transport, SshError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| SshError::ConnectionFailed(format!("Failed to resolve {}: {}", addr, e)))?
            .next()
            .ok_or_else(|| SshError::ConnectionFailed(format!("No address found for {}", addr)))?;

        let ssh_config = crate::client_config(self.config.banner.as_deref());
        let host_key_slot = Arc::new(Mutex::new(None));
        let handler = ClientHandler::new(
            self.config.host.clone(),
            self.config.port,
            host_key_slot.clone(),
            self.shared.remote_banner_slot(),
        );

        let handle = tokio::time::timeout(
            timeout,
            client::connect(Arc::new(ssh_config), socket_addr, handler),
        )
        .await
        .map_err(|_| {
            SshError::Timeout(format!(
                "Connection to {} timed out after {:?}",
                addr, timeout
            ))
        })?
        .map_err(|e| match e {
            // Engine failures during the handshake are connection errors
            SshError::ProtocolError(msg) => SshError::ConnectionFailed(msg),
            other => other,
        })?;

        let host_key = host_key_slot
            .lock()
            .take()
            .ok_or_else(|| SshError::ProtocolError("server did not present a host key".to_string()))?;

        Ok(Transport { handle, host_key })
    }

    async fn do_authenticate(&mut self, credentials: Credentials) -> Result<(), SshError> {
        if self.shared.state() != SessionState::Connected {
            return Err(SshError::InvalidState(format!(
                "authentication requires a connected session (currently {})",
                self.shared.state()
            )));
        }
        let transport = self.transport.as_mut().ok_or(SshError::Disconnected)?;

        info!(
            "Authenticating {} by {} ({})",
            self.config.username,
            credentials.method_name(),
            self.session_id
        );
        self.shared.set_state(SessionState::Authenticating);

        match auth::authenticate(&mut transport.handle, &self.config.username, credentials).await {
            Ok(()) => {
                self.shared.set_state(SessionState::Authorized);
                Ok(())
            }
            Err(err) => {
                warn!(
                    "Authentication failed for {}: {} ({})",
                    self.config.username, err, self.session_id
                );
                self.shared.set_state(SessionState::Failed);
                Err(err)
            }
        }
    }

    async fn do_query_methods(&mut self) -> Result<Vec<AuthMethod>, SshError> {
        if self.shared.state() != SessionState::Connected {
            return Err(SshError::InvalidState(format!(
                "method query requires a connected session (currently {})",
                self.shared.state()
            )));
        }
        let transport = self.transport.as_mut().ok_or(SshError::Disconnected)?;

        let (methods, authorized) =
            auth::query_methods(&mut transport.handle, &self.config.username).await?;
        if authorized {
            // Server accepted the "none" probe outright
            info!(
                "Server authorized {} without credentials ({})",
                self.config.username, self.session_id
            );
            self.shared.set_state(SessionState::Authorized);
        }
        Ok(methods)
    }

    async fn do_fingerprint(&mut self, hash: FingerprintHash) -> Result<String, SshError> {
        let transport = self.connected_transport()?;
        Ok(known_hosts::session_fingerprint(&transport.host_key, hash))
    }

    async fn do_check_known_hosts(
        &mut self,
        files: Option<Vec<PathBuf>>,
    ) -> Result<KnownHostStatus, SshError> {
        let transport = self.connected_transport()?;
        let files = files.unwrap_or_else(known_hosts::default_files);
        Ok(known_hosts::check_files(
            &self.config.host,
            self.config.port,
            &transport.host_key,
            &files,
        ))
    }

    async fn do_add_known_host(
        &mut self,
        host_name: String,
        port: u16,
        file: Option<PathBuf>,
        salt: Option<String>,
    ) -> Result<(), SshError> {
        let transport = self.connected_transport()?;
        let file = match file {
            Some(file) => file,
            None => known_hosts::default_user_file().ok_or_else(|| {
                SshError::HostKeyStore("no default known hosts file available".to_string())
            })?,
        };
        known_hosts::append_entry(&host_name, port, &transport.host_key, &file, salt.as_deref())
    }

    async fn do_open_channel(&mut self) -> Result<Channel<Msg>, SshError> {
        if self.shared.state() != SessionState::Authorized {
            return Err(SshError::InvalidState(format!(
                "channels require an authorized session (currently {})",
                self.shared.state()
            )));
        }
        let transport = self.transport.as_ref().ok_or(SshError::Disconnected)?;
        transport
            .handle
            .channel_open_session()
            .await
            .map_err(|e| SshError::ProtocolError(e.to_string()))
    }

    /// Transport (and captured host key) of a connected-or-later session.
    fn connected_transport(&self) -> Result<&Transport, SshError> {
        match self.shared.state() {
            SessionState::Connected | SessionState::Authorized => {}
            state => {
                return Err(SshError::InvalidState(format!(
                    "operation requires a connected session (currently {state})"
                )));
            }
        }
        self.transport.as_ref().ok_or(SshError::Disconnected)
    }

    /// Release the transport and socket unconditionally.
    async fn teardown(&mut self) {
        if let Some(transport) = self.transport.take() {
            info!(
                "Disconnecting from {}:{} ({})",
                self.config.host, self.config.port, self.session_id
            );
            let _ = transport
                .handle
                .disconnect(Disconnect::ByApplication, "Session closed", "en")
                .await;
        }
        self.shared.set_state(SessionState::Disconnected);
    }
}

/// Answer everything still queued after the worker stops.
fn drain_pending(cmd_rx: &mut mpsc::Receiver<SessionCommand>, shared: &SessionShared) {
    cmd_rx.close();
    while let Ok(cmd) = cmd_rx.try_recv() {
        cmd.reject(SshError::Disconnected, shared);
    }
}
