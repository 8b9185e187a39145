//! Known hosts verification for SSH host keys
//!
//! Line-oriented store compatible with the OpenSSH known_hosts syntax,
//! including `[host]:port` entries and `|1|salt|hash|` hashed hostnames.
//! Verification scans candidate files in order and the first conclusive
//! answer wins; entries are only ever appended, never rewritten.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use russh::keys::{PublicKey, PublicKeyBase64};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::Sha256;
use tracing::{debug, info, warn};

use crate::error::SshError;

type HmacSha1 = Hmac<Sha1>;

/// Hash algorithm for host key fingerprints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintHash {
    #[default]
    Md5,
    Sha1,
}

impl FingerprintHash {
    /// Hash `blob` and format the digest as uppercase colon-separated hex
    /// pairs, e.g. `"16:27:AC:A5:76:28:2D:36:63:1B:56:4D:EB:DF:A6:48"`.
    pub(crate) fn digest_hex(&self, blob: &[u8]) -> String {
        let digest = match self {
            FingerprintHash::Md5 => Md5::digest(blob).to_vec(),
            FingerprintHash::Sha1 => Sha1::digest(blob).to_vec(),
        };
        digest
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":")
    }
}

/// Fingerprint of the server host key in the session's requested format.
pub(crate) fn session_fingerprint(key: &PublicKey, hash: FingerprintHash) -> String {
    hash.digest_hex(&key.public_key_bytes())
}

/// SHA256 display fingerprint (`SHA256:...`), the format used in log lines.
pub(crate) fn display_fingerprint(key: &PublicKey) -> String {
    sha256_fingerprint(&key.public_key_bytes())
}

fn sha256_fingerprint(blob: &[u8]) -> String {
    let hash = Sha256::digest(blob);
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

/// Result of checking the server's key against known-hosts files.
///
/// `Failure` means the store could not be searched (I/O error), which is
/// distinct from `NotFound` (searched, absent). A `Mismatch` signals a
/// possibly tampered host; it is reported, not enforced, and the trust
/// decision stays with the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum KnownHostStatus {
    /// Key found and identical
    Match,
    /// Hostname found but the stored key differs (possible MITM)
    Mismatch {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
    /// No entry for this host in any searched file
    NotFound,
    /// The store could not be searched
    Failure { reason: String },
}

impl KnownHostStatus {
    /// Escalate a non-`Match` status into the corresponding error, for
    /// callers that treat anything but a clean match as fatal.
    pub fn into_result(self, host: &str) -> Result<(), SshError> {
        match self {
            KnownHostStatus::Match => Ok(()),
            KnownHostStatus::Mismatch {
                expected_fingerprint,
                actual_fingerprint,
            } => Err(SshError::HostKeyMismatch {
                host: host.to_string(),
                expected: expected_fingerprint,
                actual: actual_fingerprint,
            }),
            KnownHostStatus::NotFound => Err(SshError::HostKeyNotFound(host.to_string())),
            KnownHostStatus::Failure { reason } => Err(SshError::HostKeyStore(reason)),
        }
    }
}

/// The user's own known_hosts file, the default target for new entries.
pub(crate) fn default_user_file() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".ssh").join("known_hosts"))
}

/// Platform-default candidate files, in scan order: the user file first,
/// then the system file. Sandboxed callers should pass explicit paths
/// instead, since neither default may be accessible.
pub(crate) fn default_files() -> Vec<PathBuf> {
    let mut files = Vec::new();
    if let Some(user_file) = default_user_file() {
        files.push(user_file);
    }
    files.push(PathBuf::from("/etc/ssh/ssh_known_hosts"));
    files
}

/// Name an entry is stored under: `host` for the default port,
/// `[host]:port` otherwise. Lowercased for lookup.
fn lookup_name(host: &str, port: u16) -> String {
    let host = host.to_lowercase();
    if port == 22 {
        host
    } else {
        format!("[{host}]:{port}")
    }
}

/// Check `key` for `host:port` against `files`, first conclusive result
/// wins. A file that cannot be read is remembered but scanning continues;
/// the failure surfaces only if no later file settles the question.
pub(crate) fn check_files(
    host: &str,
    port: u16,
    key: &PublicKey,
    files: &[PathBuf],
) -> KnownHostStatus {
    let lookup = lookup_name(host, port);
    let key_b64 = BASE64.encode(key.public_key_bytes());
    let actual_fingerprint = display_fingerprint(key);
    let mut failure: Option<String> = None;

    for file in files {
        match scan_file(file, &lookup, key, &key_b64, &actual_fingerprint) {
            Ok(Some(status)) => {
                debug!("{} settled by {:?}", lookup, file);
                return status;
            }
            Ok(None) => {}
            Err(reason) => {
                warn!("Could not search known hosts file {:?}: {}", file, reason);
                failure.get_or_insert(reason);
            }
        }
    }

    match failure {
        Some(reason) => KnownHostStatus::Failure { reason },
        None => {
            debug!("No known hosts entry for {}", lookup);
            KnownHostStatus::NotFound
        }
    }
}

/// Scan one file. `Ok(None)` means no entry for this host here; `Err` is
/// the human-readable reason the file could not be searched.
fn scan_file(
    path: &Path,
    lookup: &str,
    key: &PublicKey,
    key_b64: &str,
    actual_fingerprint: &str,
) -> Result<Option<KnownHostStatus>, String> {
    let content =
        fs::read_to_string(path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?;

    for line in content.lines() {
        let line = line.trim();
        // Comments, blank lines and @cert-authority/@revoked markers
        if line.is_empty() || line.starts_with('#') || line.starts_with('@') {
            continue;
        }

        let mut parts = line.split_whitespace();
        let (Some(patterns), Some(key_type), Some(stored_b64)) =
            (parts.next(), parts.next(), parts.next())
        else {
            debug!("Skipping malformed known hosts line in {:?}", path);
            continue;
        };

        if !patterns.split(',').any(|p| pattern_matches(p, lookup)) {
            continue;
        }
        // Host matched; only an entry of the same key type is decisive
        if key_type != key.algorithm().as_str() {
            continue;
        }

        if stored_b64 == key_b64 {
            debug!("Host key verified for {} via {:?}", lookup, path);
            return Ok(Some(KnownHostStatus::Match));
        }

        let expected_fingerprint = fingerprint_of_stored(stored_b64);
        warn!(
            "HOST KEY CHANGED for {}! Expected {}, got {}",
            lookup, expected_fingerprint, actual_fingerprint
        );
        return Ok(Some(KnownHostStatus::Mismatch {
            expected_fingerprint,
            actual_fingerprint: actual_fingerprint.to_string(),
        }));
    }

    Ok(None)
}

/// Match a single host pattern token against the lookup name. Supports
/// plaintext names and `|1|salt|digest|` hashed entries.
fn pattern_matches(token: &str, lookup: &str) -> bool {
    if let Some(rest) = token.strip_prefix("|1|") {
        let Some((salt_b64, digest_b64)) = rest.split_once('|') else {
            return false;
        };
        let Ok(salt) = BASE64.decode(salt_b64) else {
            return false;
        };
        let Ok(digest) = BASE64.decode(digest_b64.trim_end_matches('|')) else {
            return false;
        };
        return hashed_name_digest(&salt, lookup)
            .map(|computed| computed == digest)
            .unwrap_or(false);
    }
    if token.starts_with('!') {
        return false;
    }
    token.eq_ignore_ascii_case(lookup)
}

/// HMAC-SHA1 of a host name under `salt`, the digest hashed entries store.
fn hashed_name_digest(salt: &[u8], name: &str) -> Option<Vec<u8>> {
    let mut mac = HmacSha1::new_from_slice(salt).ok()?;
    mac.update(name.as_bytes());
    Some(mac.finalize().into_bytes().to_vec())
}

fn fingerprint_of_stored(stored_b64: &str) -> String {
    match BASE64.decode(stored_b64) {
        Ok(blob) => sha256_fingerprint(&blob),
        Err(_) => "unknown".to_string(),
    }
}

/// Append an entry for `key` to `path`, creating the file if absent.
///
/// With `salt`, `host_name` must already be the salted, SHA1-hashed and
/// base64-encoded form; the entry is written hashed (`|1|salt|name`).
/// Without it the name is written in plaintext, bracket-and-colon encoded
/// when `port` is non-default.
pub(crate) fn append_entry(
    host_name: &str,
    port: u16,
    key: &PublicKey,
    path: &Path,
    salt: Option<&str>,
) -> Result<(), SshError> {
    let name = match salt {
        Some(salt) => {
            if BASE64.decode(salt).is_err() {
                return Err(SshError::HostKeyStore(format!(
                    "malformed base64 salt: {salt}"
                )));
            }
            if BASE64.decode(host_name).is_err() {
                return Err(SshError::HostKeyStore(
                    "host name must be base64-encoded when a salt is given".to_string(),
                ));
            }
            format!("|1|{salt}|{host_name}")
        }
        None => lookup_name(host_name, port),
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| SshError::HostKeyStore(format!("cannot create {}: {}", parent.display(), e)))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| SshError::HostKeyStore(format!("cannot open {}: {}", path.display(), e)))?;

    writeln!(
        file,
        "{} {} {}",
        name,
        key.algorithm().as_str(),
        BASE64.encode(key.public_key_bytes())
    )
    .map_err(|e| SshError::HostKeyStore(format!("cannot write {}: {}", path.display(), e)))?;

    info!(
        "Added host key for {} (type: {}) to {:?}",
        name,
        key.algorithm().as_str(),
        path
    );
    Ok(())
}
