//! Authentication methods and handshake drivers
//!
//! One credential mechanism per [`Credentials`] variant; `authenticate`
//! drives the chosen mechanism against the transport exactly once.
//! `query_methods` asks the server which mechanisms it accepts for a user
//! without attempting any of them.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh::client::{AuthResult, Handle, KeyboardInteractiveAuthResponse};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::{MethodKind, MethodSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::agent::SshAgentClient;
use crate::error::SshError;
use crate::handler::ClientHandler;

/// A server-advertised authentication mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    Password,
    PublicKey,
    KeyboardInteractive,
    /// Advertised by some servers; no credential provider drives it here.
    HostBased,
}

/// Answers one keyboard-interactive prompt: `(prompt text, echo)` → response.
/// Called synchronously per prompt, in the order the server issues them.
pub type PromptResponder = Box<dyn FnMut(&str, bool) -> String + Send>;

/// Credentials for one authentication attempt. Constructed per attempt and
/// consumed by [`Session::authenticate`](crate::Session::authenticate).
pub enum Credentials {
    /// Password authentication
    Password { password: Zeroizing<String> },

    /// Public/private key pair authentication. The private key alone
    /// completes the handshake; a supplied public key path is validated
    /// for readability first. Absent passphrase means an unencrypted key.
    KeyPair {
        public_key: Option<PathBuf>,
        private_key: PathBuf,
        passphrase: Option<Zeroizing<String>>,
    },

    /// Delegate to the system SSH agent; key material never enters this
    /// process.
    Agent,

    /// Keyboard-interactive challenge-response
    KeyboardInteractive { responder: PromptResponder },
}

impl Credentials {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: Zeroizing::new(password.into()),
        }
    }

    pub fn key_pair(private_key: impl AsRef<Path>, passphrase: Option<&str>) -> Self {
        Self::KeyPair {
            public_key: None,
            private_key: private_key.as_ref().to_path_buf(),
            passphrase: passphrase.map(|p| Zeroizing::new(p.to_string())),
        }
    }

    pub fn key_pair_with_public_key(
        public_key: impl AsRef<Path>,
        private_key: impl AsRef<Path>,
        passphrase: Option<&str>,
    ) -> Self {
        Self::KeyPair {
            public_key: Some(public_key.as_ref().to_path_buf()),
            private_key: private_key.as_ref().to_path_buf(),
            passphrase: passphrase.map(|p| Zeroizing::new(p.to_string())),
        }
    }

    pub fn agent() -> Self {
        Self::Agent
    }

    pub fn interactive(responder: impl FnMut(&str, bool) -> String + Send + 'static) -> Self {
        Self::KeyboardInteractive {
            responder: Box::new(responder),
        }
    }

    pub(crate) fn method_name(&self) -> &'static str {
        match self {
            Credentials::Password { .. } => "password",
            Credentials::KeyPair { .. } => "key pair",
            Credentials::Agent => "agent",
            Credentials::KeyboardInteractive { .. } => "keyboard-interactive",
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Password { .. } => f.write_str("Credentials::Password { .. }"),
            Credentials::KeyPair {
                public_key,
                private_key,
                passphrase,
            } => f
                .debug_struct("Credentials::KeyPair")
                .field("public_key", public_key)
                .field("private_key", private_key)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
            Credentials::Agent => f.write_str("Credentials::Agent"),
            Credentials::KeyboardInteractive { .. } => {
                f.write_str("Credentials::KeyboardInteractive { .. }")
            }
        }
    }
}

/// Drive one authentication handshake for the given credentials.
pub(crate) async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    username: &str,
    credentials: Credentials,
) -> Result<(), SshError> {
    match credentials {
        Credentials::Password { password } => {
            let result = handle
                .authenticate_password(username, password.as_str())
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;
            if !result.success() {
                return Err(SshError::AuthenticationFailed(
                    "password rejected by server".to_string(),
                ));
            }
        }

        Credentials::KeyPair {
            public_key,
            private_key,
            passphrase,
        } => {
            if let Some(path) = &public_key {
                russh::keys::load_public_key(path).map_err(|e| {
                    SshError::KeyError(format!("cannot load public key {}: {}", path.display(), e))
                })?;
            }
            let key = russh::keys::load_secret_key(
                &private_key,
                passphrase.as_ref().map(|p| p.as_str()),
            )
            .map_err(|e| {
                SshError::KeyError(format!(
                    "cannot load private key {}: {}",
                    private_key.display(),
                    e
                ))
            })?;

            let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
            let result = handle
                .authenticate_publickey(username, key_with_hash)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;
            if !result.success() {
                return Err(SshError::AuthenticationFailed(
                    "key pair rejected by server".to_string(),
                ));
            }
        }

        Credentials::Agent => {
            let mut agent = SshAgentClient::connect().await?;
            agent.authenticate(handle, username).await?;
        }

        Credentials::KeyboardInteractive { mut responder } => {
            let mut exchange = HandleExchange(handle);
            drive_interactive(&mut exchange, username, &mut responder).await?;
        }
    }

    info!("Authentication succeeded for {}", username);
    Ok(())
}

/// Query which mechanisms the server accepts for `username` via a "none"
/// probe. Returns the advertised methods in server order, and whether the
/// server accepted the probe outright (which authorizes the session).
pub(crate) async fn query_methods(
    handle: &mut Handle<ClientHandler>,
    username: &str,
) -> Result<(Vec<AuthMethod>, bool), SshError> {
    let result = handle
        .authenticate_none(username)
        .await
        .map_err(|e| SshError::ProtocolError(e.to_string()))?;

    if let AuthResult::Failure {
        remaining_methods, ..
    } = result
    {
        return Ok((advertised_methods(&remaining_methods), false));
    }
    Ok((Vec::new(), true))
}

fn advertised_methods(set: &MethodSet) -> Vec<AuthMethod> {
    set.iter()
        .filter_map(|method| match method {
            MethodKind::Password => Some(AuthMethod::Password),
            MethodKind::PublicKey => Some(AuthMethod::PublicKey),
            MethodKind::KeyboardInteractive => Some(AuthMethod::KeyboardInteractive),
            MethodKind::HostBased => Some(AuthMethod::HostBased),
            MethodKind::None => None,
        })
        .collect()
}

/// One round of the keyboard-interactive exchange, decoupled from the
/// transport types so the prompt-ordering contract is testable.
enum ExchangeReply {
    Success,
    Rejected,
    /// `(prompt text, echo)` pairs, in server order
    Prompts(Vec<(String, bool)>),
}

trait InteractiveExchange {
    async fn start(&mut self, username: &str) -> Result<ExchangeReply, SshError>;
    async fn respond(&mut self, responses: Vec<String>) -> Result<ExchangeReply, SshError>;
}

struct HandleExchange<'a>(&'a mut Handle<ClientHandler>);

impl InteractiveExchange for HandleExchange<'_> {
    async fn start(&mut self, username: &str) -> Result<ExchangeReply, SshError> {
        let reply = self
            .0
            .authenticate_keyboard_interactive_start(username, None::<String>)
            .await
            .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;
        Ok(convert_reply(reply))
    }

    async fn respond(&mut self, responses: Vec<String>) -> Result<ExchangeReply, SshError> {
        let reply = self
            .0
            .authenticate_keyboard_interactive_respond(responses)
            .await
            .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;
        Ok(convert_reply(reply))
    }
}

fn convert_reply(reply: KeyboardInteractiveAuthResponse) -> ExchangeReply {
    match reply {
        KeyboardInteractiveAuthResponse::Success => ExchangeReply::Success,
        KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => ExchangeReply::Prompts(
            prompts
                .into_iter()
                .map(|p| (p.prompt, p.echo))
                .collect(),
        ),
        _ => ExchangeReply::Rejected,
    }
}

/// Answer server prompt rounds until the exchange settles. The responder
/// is invoked exactly once per prompt, in the order prompts arrive; a
/// round with no prompts is answered with an empty response list.
async fn drive_interactive<E: InteractiveExchange>(
    exchange: &mut E,
    username: &str,
    responder: &mut PromptResponder,
) -> Result<(), SshError> {
    let mut reply = exchange.start(username).await?;
    loop {
        let prompts = match reply {
            ExchangeReply::Success => {
                debug!("Keyboard-interactive exchange completed");
                return Ok(());
            }
            ExchangeReply::Rejected => {
                return Err(SshError::AuthenticationFailed(
                    "keyboard-interactive rejected by server".to_string(),
                ));
            }
            ExchangeReply::Prompts(prompts) => prompts,
        };

        let responses: Vec<String> = prompts
            .iter()
            .map(|(prompt, echo)| responder(prompt, *echo))
            .collect();
        reply = exchange.respond(responses).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Serves scripted prompt rounds and records the responses it gets.
    struct MockExchange {
        rounds: Vec<Vec<(String, bool)>>,
        received: Arc<Mutex<Vec<Vec<String>>>>,
    }

    impl MockExchange {
        fn new(rounds: Vec<Vec<(&str, bool)>>) -> Self {
            Self {
                rounds: rounds
                    .into_iter()
                    .map(|round| {
                        round
                            .into_iter()
                            .map(|(p, e)| (p.to_string(), e))
                            .collect()
                    })
                    .collect(),
                received: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn next_reply(&mut self) -> ExchangeReply {
            if self.rounds.is_empty() {
                ExchangeReply::Success
            } else {
                ExchangeReply::Prompts(self.rounds.remove(0))
            }
        }
    }

    impl InteractiveExchange for MockExchange {
        async fn start(&mut self, _username: &str) -> Result<ExchangeReply, SshError> {
            Ok(self.next_reply())
        }

        async fn respond(&mut self, responses: Vec<String>) -> Result<ExchangeReply, SshError> {
            self.received.lock().push(responses);
            Ok(self.next_reply())
        }
    }

    #[tokio::test]
    async fn test_responder_called_once_per_prompt_in_order() {
        let mut exchange = MockExchange::new(vec![vec![
            ("Password: ", false),
            ("Verification code: ", true),
            ("Realm: ", true),
        ]]);
        let received = exchange.received.clone();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_in_responder = seen.clone();
        let mut responder: PromptResponder = Box::new(move |prompt, _echo| {
            let mut seen = seen_in_responder.lock();
            seen.push(prompt.to_string());
            format!("answer-{}", seen.len())
        });

        drive_interactive(&mut exchange, "deploy", &mut responder)
            .await
            .unwrap();

        assert_eq!(
            *seen.lock(),
            vec!["Password: ", "Verification code: ", "Realm: "]
        );
        assert_eq!(
            *received.lock(),
            vec![vec!["answer-1", "answer-2", "answer-3"]]
        );
    }

    #[tokio::test]
    async fn test_multiple_rounds_answered_in_sequence() {
        let mut exchange = MockExchange::new(vec![
            vec![("Password: ", false), ("Token: ", true)],
            vec![("Confirm token: ", true)],
        ]);
        let received = exchange.received.clone();

        let count = Arc::new(Mutex::new(0usize));
        let count_in_responder = count.clone();
        let mut responder: PromptResponder = Box::new(move |_prompt, _echo| {
            let mut count = count_in_responder.lock();
            *count += 1;
            format!("r{count}")
        });

        drive_interactive(&mut exchange, "deploy", &mut responder)
            .await
            .unwrap();

        assert_eq!(*count.lock(), 3);
        assert_eq!(
            *received.lock(),
            vec![vec!["r1".to_string(), "r2".to_string()], vec!["r3".to_string()]]
        );
    }

    #[tokio::test]
    async fn test_empty_prompt_round_sends_empty_responses() {
        let mut exchange = MockExchange::new(vec![vec![]]);
        let received = exchange.received.clone();

        let mut responder: PromptResponder =
            Box::new(|_prompt, _echo| panic!("responder must not run for an empty round"));

        drive_interactive(&mut exchange, "deploy", &mut responder)
            .await
            .unwrap();

        assert_eq!(*received.lock(), vec![Vec::<String>::new()]);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let credentials = Credentials::password("hunter2");
        assert!(!format!("{:?}", credentials).contains("hunter2"));

        let credentials = Credentials::key_pair("/home/deploy/.ssh/id_ed25519", Some("hunter2"));
        let rendered = format!("{:?}", credentials);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("id_ed25519"));
    }

    #[test]
    fn test_method_names() {
        assert_eq!(Credentials::password("x").method_name(), "password");
        assert_eq!(Credentials::agent().method_name(), "agent");
        assert_eq!(
            Credentials::interactive(|_, _| String::new()).method_name(),
            "keyboard-interactive"
        );
    }
}
