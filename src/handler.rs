//! russh client handler
//!
//! Captures what the server presents during the handshake (its host key
//! and any authentication banner) into slots the session worker reads
//! afterwards. The handler itself accepts every host key: trust is decided
//! by the caller through the known-hosts API, not inside the handshake.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use russh::client;
use russh::keys::PublicKey;
use tracing::debug;

use crate::error::SshError;
use crate::known_hosts;

pub struct ClientHandler {
    host: String,
    port: u16,
    host_key: Arc<Mutex<Option<PublicKey>>>,
    remote_banner: Arc<RwLock<Option<String>>>,
}

impl ClientHandler {
    pub(crate) fn new(
        host: String,
        port: u16,
        host_key: Arc<Mutex<Option<PublicKey>>>,
        remote_banner: Arc<RwLock<Option<String>>>,
    ) -> Self {
        Self {
            host,
            port,
            host_key,
            remote_banner,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(
            "Server key for {}:{} is {} ({})",
            self.host,
            self.port,
            known_hosts::display_fingerprint(server_public_key),
            server_public_key.algorithm().as_str()
        );
        *self.host_key.lock() = Some(server_public_key.clone());
        Ok(true)
    }

    async fn auth_banner(
        &mut self,
        banner: &str,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!("Server banner for {}:{} received", self.host, self.port);
        *self.remote_banner.write() = Some(banner.to_string());
        Ok(())
    }
}
