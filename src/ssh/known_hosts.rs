//! SSH `known_hosts` verification wrapper around russh's built-in support

use std::path::{Path, PathBuf};

use russh::keys::known_hosts::{check_known_hosts_path, learn_known_hosts_path};
use russh::keys::{Error as KeyError, HashAlg, PublicKey};
use tracing::{debug, warn};

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

use crate::config::HostKeyVerification;
use crate::error::{Result, SshError};

/// Result of looking a host key up in `known_hosts`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResult {
    Match,
    /// A different key is recorded for the host on `line`
    Mismatch { line: usize },
    Unknown,
}

/// `~/.ssh/known_hosts`
#[must_use]
pub fn default_known_hosts_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".ssh").join("known_hosts"))
}

/// Look `key` up for `hostname:port` in the file at `path`.
///
/// # Errors
///
/// Returns [`SshError::Config`] if the file cannot be read or parsed.
pub fn verify(hostname: &str, port: u16, key: &PublicKey, path: &Path) -> Result<VerifyResult> {
    match check_known_hosts_path(hostname, port, key, path) {
        Ok(true) => {
            debug!(hostname = %hostname, port, "Host key verified");
            Ok(VerifyResult::Match)
        }
        Ok(false) => {
            debug!(hostname = %hostname, port, "Host key not in known_hosts");
            Ok(VerifyResult::Unknown)
        }
        Err(KeyError::KeyChanged { line }) => {
            warn!(hostname = %hostname, port, line, "Host key mismatch detected");
            Ok(VerifyResult::Mismatch { line })
        }
        Err(e) => Err(SshError::Config(format!(
            "Failed to check known_hosts: {e}"
        ))),
    }
}

/// Append `key` for `hostname:port` to the file at `path`.
///
/// # Errors
///
/// Returns [`SshError::Config`] if the file cannot be written.
pub fn add_key(hostname: &str, port: u16, key: &PublicKey, path: &Path) -> Result<()> {
    learn_known_hosts_path(hostname, port, key, path)
        .map_err(|e| SshError::Config(format!("Failed to add host key to known_hosts: {e}")))?;

    debug!(hostname = %hostname, port, "Added host key to known_hosts");
    Ok(())
}

/// `SHA256:` fingerprint of a public key
#[must_use]
pub fn fingerprint(key: &PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}

/// Warn if the `known_hosts` file is writable or readable by others (Unix only).
#[cfg(unix)]
fn check_known_hosts_permissions(path: &Path) {
    if let Ok(metadata) = std::fs::metadata(path) {
        let mode = metadata.mode() & 0o777;
        if mode & 0o077 != 0 && mode != 0o644 {
            warn!(
                path = %path.display(),
                mode = format!("{mode:o}"),
                "known_hosts file has overly permissive permissions. \
                 Consider running: chmod 600 ~/.ssh/known_hosts"
            );
        }
    }
}

#[cfg(not(unix))]
fn check_known_hosts_permissions(_path: &Path) {}

/// Verify a host key against `~/.ssh/known_hosts` according to `mode`.
///
/// # Errors
///
/// Returns [`SshError::HostKey`] if the key is rejected and
/// [`SshError::Config`] if `known_hosts` cannot be used.
pub fn verify_host_key(
    hostname: &str,
    port: u16,
    key: &PublicKey,
    mode: HostKeyVerification,
) -> Result<()> {
    if mode == HostKeyVerification::Off {
        warn!(
            hostname = %hostname,
            "SECURITY WARNING: Host key verification is DISABLED for this host. \
             Use 'strict' or 'accept-new' in production."
        );
        return Ok(());
    }

    let path = default_known_hosts_path().ok_or_else(|| SshError::HostKey {
        host: hostname.to_string(),
        reason: "no home directory to find known_hosts in".to_string(),
    })?;
    verify_host_key_in(hostname, port, key, mode, &path)
}

/// [`verify_host_key`] against an explicit `known_hosts` file.
///
/// # Errors
///
/// See [`verify_host_key`].
pub fn verify_host_key_in(
    hostname: &str,
    port: u16,
    key: &PublicKey,
    mode: HostKeyVerification,
    path: &Path,
) -> Result<()> {
    check_known_hosts_permissions(path);

    let rejected = |reason: String| SshError::HostKey {
        host: hostname.to_string(),
        reason,
    };

    match (mode, verify(hostname, port, key, path)?) {
        (HostKeyVerification::Off, _) | (_, VerifyResult::Match) => Ok(()),
        (_, VerifyResult::Mismatch { line }) => Err(rejected(format!(
            "key {} does not match known_hosts line {line}",
            fingerprint(key)
        ))),
        (HostKeyVerification::Strict, VerifyResult::Unknown) => Err(rejected(format!(
            "unknown host key {}",
            fingerprint(key)
        ))),
        (HostKeyVerification::AcceptNew, VerifyResult::Unknown) => {
            warn!(hostname = %hostname, fingerprint = %fingerprint(key), "Adding new host key to known_hosts");
            add_key(hostname, port, key, path)
        }
    }
}
