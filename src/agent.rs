//! SSH Agent client
//!
//! Delegates public key authentication to the system agent: the agent
//! holds the private key material and signs the server challenge; this
//! crate only negotiates the handshake.
//!
//! # Platform Support
//! - **Unix/Linux/macOS**: `SSH_AUTH_SOCK` Unix domain socket
//! - **Windows**: `\\.\pipe\openssh-ssh-agent` named pipe (OpenSSH for Windows)

use std::future::Future;

use russh::client::Handle;
use russh::keys::agent::client::{AgentClient, AgentStream};
use russh::keys::ssh_key;
use russh::{AgentAuthError, CryptoVec, Signer};
use tracing::{debug, info, warn};

use crate::error::SshError;
use crate::handler::ClientHandler;

/// Send-safe wrapper around [`AgentClient`] implementing the [`Signer`] trait.
///
/// russh's built-in `impl Signer for AgentClient` captures a borrowed
/// `PublicKey` across an `.await` inside `authenticate_publickey_with`,
/// which the compiler cannot prove `Send` through RPITIT. Cloning the key
/// to an owned value before the async block keeps the future `Send`. The
/// clone is cheap (~64 bytes for Ed25519 keys).
struct AgentSigner<'a> {
    agent: &'a mut AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>,
}

impl Signer for AgentSigner<'_> {
    type Error = AgentAuthError;

    fn auth_publickey_sign(
        &mut self,
        key: &ssh_key::PublicKey,
        hash_alg: Option<ssh_key::HashAlg>,
        to_sign: CryptoVec,
    ) -> impl Future<Output = Result<CryptoVec, Self::Error>> + Send {
        let key_owned = key.clone();
        async move {
            self.agent
                .sign_request(&key_owned, hash_alg, to_sign)
                .await
                .map_err(Into::into)
        }
    }
}

/// SSH Agent client wrapper with a type-erased stream for cross-platform
/// support.
pub(crate) struct SshAgentClient {
    agent: AgentClient<Box<dyn AgentStream + Send + Unpin + 'static>>,
}

impl SshAgentClient {
    /// Connect to the system SSH Agent.
    pub(crate) async fn connect() -> Result<Self, SshError> {
        info!("Connecting to system SSH Agent");

        #[cfg(unix)]
        {
            let agent = AgentClient::connect_env().await.map_err(|e| {
                SshError::AgentNotAvailable(format!(
                    "Failed to connect to SSH Agent: {}. \
                     Make sure SSH_AUTH_SOCK is set and ssh-agent is running.",
                    e
                ))
            })?;
            debug!("Connected to SSH Agent via SSH_AUTH_SOCK");
            Ok(Self {
                agent: agent.dynamic(),
            })
        }

        #[cfg(windows)]
        {
            let agent = AgentClient::connect_named_pipe(r"\\.\pipe\openssh-ssh-agent")
                .await
                .map_err(|e| {
                    SshError::AgentNotAvailable(format!(
                        "Failed to connect to SSH Agent via named pipe: {}. \
                         Make sure the OpenSSH Authentication Agent service is running.",
                        e
                    ))
                })?;
            debug!("Connected to SSH Agent via named pipe");
            Ok(Self {
                agent: agent.dynamic(),
            })
        }

        #[cfg(not(any(unix, windows)))]
        {
            Err(SshError::AgentNotAvailable(
                "SSH Agent is not supported on this platform".to_string(),
            ))
        }
    }

    /// Try every identity the agent holds against the server until one is
    /// accepted.
    pub(crate) async fn authenticate(
        &mut self,
        handle: &mut Handle<ClientHandler>,
        username: &str,
    ) -> Result<(), SshError> {
        let keys = self
            .agent
            .request_identities()
            .await
            .map_err(|e| SshError::AgentError(format!("Failed to list agent keys: {}", e)))?;

        if keys.is_empty() {
            return Err(SshError::AgentError(
                "SSH Agent has no keys loaded. Add keys with: ssh-add".to_string(),
            ));
        }

        info!(
            "SSH Agent reports {} key(s), attempting authentication",
            keys.len()
        );

        let mut last_error: Option<String> = None;
        for key in &keys {
            debug!("Trying agent key: {} ({})", key.algorithm(), key.comment());

            match handle
                .authenticate_publickey_with(
                    username,
                    key.clone(),
                    None,
                    &mut AgentSigner {
                        agent: &mut self.agent,
                    },
                )
                .await
            {
                Ok(result) if result.success() => {
                    info!(
                        "SSH Agent authentication succeeded with key: {}",
                        key.comment()
                    );
                    return Ok(());
                }
                Ok(_failure) => {
                    debug!("Key rejected by server: {}", key.comment());
                }
                Err(e) => {
                    warn!("Agent signing error for key {}: {}", key.comment(), e);
                    last_error = Some(format!("{}", e));
                }
            }
        }

        Err(SshError::AuthenticationFailed(format!(
            "No agent key was accepted by the server (tried {} key(s)){}",
            keys.len(),
            last_error
                .map(|e| format!(". Last error: {}", e))
                .unwrap_or_default()
        )))
    }
}

/// Quick pre-check for agent availability; the actual connection may still
/// fail.
pub fn is_agent_available() -> bool {
    #[cfg(unix)]
    {
        std::env::var("SSH_AUTH_SOCK").is_ok()
    }

    #[cfg(windows)]
    {
        // The named pipe exists whenever the service is installed; actual
        // availability is checked on connect.
        true
    }

    #[cfg(not(any(unix, windows)))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_agent_connect_requires_agent() {
        // Without SSH_AUTH_SOCK, connect must fail with AgentNotAvailable
        if std::env::var("SSH_AUTH_SOCK").is_err() {
            match SshAgentClient::connect().await {
                Err(SshError::AgentNotAvailable(_)) => {}
                Ok(_) => panic!("connected without an agent socket"),
                Err(e) => panic!("unexpected error type: {:?}", e),
            }
        }
    }
}
