use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Default SSH port
pub const PORT: u16 = 22;

/// Property store attached to sessions and channels.
pub type Properties = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub hosts: HashMap<String, HostProfile>,
}

/// A named remote host and the options used to reach it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostProfile {
    pub hostname: String,

    #[serde(default)]
    pub session: SessionOptions,

    /// Optional description for this host
    #[serde(default)]
    pub description: Option<String>,
}

/// Options recognized when creating a session.
///
/// Sensitive fields (`password`, `passphrase`) are wrapped in [`Zeroizing`]
/// so they are erased from memory when the options are dropped.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionOptions {
    #[serde(default = "default_port")]
    pub port: u16,

    /// User to log in as right after connecting
    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub password: Option<Zeroizing<String>>,

    /// Path of a private key; the public key is expected next to it with a
    /// `.pub` suffix. `~` is expanded.
    #[serde(default)]
    pub key: Option<String>,

    #[serde(default)]
    pub passphrase: Option<Zeroizing<String>>,

    /// Never fall back to interactive authentication
    #[serde(default)]
    pub non_interactive: bool,

    /// Initial session properties. Copied into the session, later changes
    /// to this map do not reach it.
    #[serde(default)]
    pub properties: Properties,

    /// Connect and login deadline in milliseconds (0 = none)
    #[serde(default)]
    pub timeout_ms: u64,

    /// Blocking transport mode (default: true)
    #[serde(default = "default_block")]
    pub block: bool,

    #[serde(default)]
    pub host_key_verification: HostKeyVerification,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            port: default_port(),
            user: None,
            password: None,
            key: None,
            passphrase: None,
            non_interactive: false,
            properties: Properties::new(),
            timeout_ms: 0,
            block: default_block(),
            host_key_verification: HostKeyVerification::default(),
        }
    }
}

impl SessionOptions {
    /// The configured deadline, `None` when unbounded.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        if self.timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.timeout_ms))
        }
    }

    /// Credentials to log in with, derived the same way for every entry
    /// point: a key wins over a password, a missing password either means
    /// an empty password (non-interactive) or agent authentication.
    #[must_use]
    pub fn credentials(&self) -> Credentials {
        if let Some(key) = &self.key {
            return Credentials::PublicKey {
                path: PathBuf::from(shellexpand::tilde(key).as_ref()),
                passphrase: self.passphrase.clone(),
            };
        }

        match (&self.password, self.non_interactive) {
            (Some(password), _) => Credentials::Password(password.clone()),
            (None, true) => Credentials::Password(Zeroizing::new(String::new())),
            (None, false) => Credentials::Agent,
        }
    }
}

const fn default_port() -> u16 {
    PORT
}

const fn default_block() -> bool {
    true
}

/// Host key verification mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyVerification {
    /// Reject unknown hosts and mismatched keys (default)
    #[default]
    Strict,
    /// Add unknown hosts to `known_hosts`, reject mismatched keys
    #[serde(alias = "accept_new")]
    AcceptNew,
    /// Accept all keys (insecure, for testing only)
    Off,
}

/// Credentials presented to the server at login.
#[derive(Clone)]
pub enum Credentials {
    Password(Zeroizing<String>),
    PublicKey {
        path: PathBuf,
        passphrase: Option<Zeroizing<String>>,
    },
    /// Keyboard-interactive login answering every prompt with `response`
    KeyboardInteractive { response: Zeroizing<String> },
    Agent,
}

impl Credentials {
    #[must_use]
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password(Zeroizing::new(password.into()))
    }

    /// Authentication method name as used on the wire.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::Password(_) => "password",
            Self::PublicKey { .. } | Self::Agent => "publickey",
            Self::KeyboardInteractive { .. } => "keyboard-interactive",
        }
    }
}

// Secrets stay out of logs and panic messages.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(***)"),
            Self::PublicKey { path, passphrase } => f
                .debug_struct("PublicKey")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "***"))
                .finish(),
            Self::KeyboardInteractive { .. } => f.write_str("KeyboardInteractive(***)"),
            Self::Agent => f.write_str("Agent"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_options_defaults() {
        let options = SessionOptions::default();
        assert_eq!(options.port, 22);
        assert!(options.user.is_none());
        assert!(options.block);
        assert!(!options.non_interactive);
        assert!(options.timeout().is_none());
        assert_eq!(options.host_key_verification, HostKeyVerification::Strict);
    }

    #[test]
    fn test_session_options_from_yaml() {
        let yaml = r"
port: 2222
user: demo
password: secret
timeout_ms: 1500
block: false
host_key_verification: accept-new
properties:
  role: build
";
        let options: SessionOptions = serde_saphyr::from_str(yaml).unwrap();
        assert_eq!(options.port, 2222);
        assert_eq!(options.user.as_deref(), Some("demo"));
        assert_eq!(options.password.as_deref().map(String::as_str), Some("secret"));
        assert_eq!(options.timeout(), Some(Duration::from_millis(1500)));
        assert!(!options.block);
        assert_eq!(options.host_key_verification, HostKeyVerification::AcceptNew);
        assert_eq!(options.properties["role"], "build");
    }

    #[test]
    fn test_credentials_prefers_key() {
        let options = SessionOptions {
            key: Some("/keys/id_ed25519".to_string()),
            password: Some(Zeroizing::new("ignored".to_string())),
            ..Default::default()
        };
        match options.credentials() {
            Credentials::PublicKey { path, passphrase } => {
                assert_eq!(path, PathBuf::from("/keys/id_ed25519"));
                assert!(passphrase.is_none());
            }
            other => panic!("Expected PublicKey, got: {other:?}"),
        }
    }

    #[test]
    fn test_credentials_password() {
        let options = SessionOptions {
            password: Some(Zeroizing::new("secret".to_string())),
            ..Default::default()
        };
        assert!(matches!(options.credentials(), Credentials::Password(p) if p.as_str() == "secret"));
    }

    #[test]
    fn test_credentials_non_interactive_without_password() {
        let options = SessionOptions {
            non_interactive: true,
            ..Default::default()
        };
        assert!(matches!(options.credentials(), Credentials::Password(p) if p.is_empty()));
    }

    #[test]
    fn test_credentials_interactive_without_password_uses_agent() {
        let options = SessionOptions::default();
        assert!(matches!(options.credentials(), Credentials::Agent));
    }

    #[test]
    fn test_credentials_debug_hides_secrets() {
        let creds = Credentials::password("hunter2");
        let debug = format!("{creds:?}");
        assert!(!debug.contains("hunter2"));

        let creds = Credentials::PublicKey {
            path: PathBuf::from("/k"),
            passphrase: Some(Zeroizing::new("phrase".to_string())),
        };
        let debug = format!("{creds:?}");
        assert!(!debug.contains("phrase\""));
        assert!(debug.contains("***"));
    }

    #[test]
    fn test_credentials_method_names() {
        assert_eq!(Credentials::password("x").method(), "password");
        assert_eq!(Credentials::Agent.method(), "publickey");
        assert_eq!(
            Credentials::KeyboardInteractive {
                response: Zeroizing::new(String::new())
            }
            .method(),
            "keyboard-interactive"
        );
    }

    #[test]
    fn test_host_key_verification_aliases() {
        let mode: HostKeyVerification = serde_json::from_str("\"accept_new\"").unwrap();
        assert_eq!(mode, HostKeyVerification::AcceptNew);
        let mode: HostKeyVerification = serde_json::from_str("\"off\"").unwrap();
        assert_eq!(mode, HostKeyVerification::Off);
    }
}
