use thiserror::Error;

/// Transport error codes.
///
/// The numbering follows libssh2 so that `last_errno` values stay meaningful
/// to callers that already know those codes.
pub mod errno {
    pub const NONE: i32 = 0;
    pub const SOCKET_NONE: i32 = -1;
    pub const KEX_FAILURE: i32 = -5;
    pub const SOCKET_SEND: i32 = -7;
    pub const TIMEOUT: i32 = -9;
    pub const HOSTKEY_INIT: i32 = -10;
    pub const HOSTKEY_SIGN: i32 = -11;
    pub const SOCKET_DISCONNECT: i32 = -13;
    pub const PROTO: i32 = -14;
    pub const FILE: i32 = -16;
    pub const AUTHENTICATION_FAILED: i32 = -18;
    pub const PUBLICKEY_UNVERIFIED: i32 = -19;
    pub const CHANNEL_FAILURE: i32 = -21;
    pub const CHANNEL_REQUEST_DENIED: i32 = -22;
    pub const CHANNEL_CLOSED: i32 = -26;
    pub const CHANNEL_EOF_SENT: i32 = -27;
    pub const SOCKET_TIMEOUT: i32 = -30;
    pub const EAGAIN: i32 = -37;
}

#[derive(Error, Debug)]
pub enum SshError {
    // Session state errors
    #[error("SSH session not connected")]
    NotConnected,

    #[error("SSH session not authenticated")]
    NotAuthenticated,

    #[error("SSH session already connected to {host}")]
    AlreadyConnected { host: String },

    // Transport errors
    #[error("SSH connection failed to {host}: {reason}")]
    Connect {
        host: String,
        reason: String,
        errno: i32,
    },

    #[error("{message}")]
    Timeout { message: String, errno: i32 },

    #[error("SSH session disconnected: {message}")]
    Disconnect { message: String, errno: i32 },

    #[error("SSH authentication failed for {user}: {message}")]
    AuthenticationFailed {
        user: String,
        message: String,
        errno: i32,
    },

    #[error("SSH host key rejected for {host}: {reason}")]
    HostKey { host: String, reason: String },

    #[error("SSH error ({errno}): {message}")]
    Ssh { message: String, errno: i32 },

    // Channel errors
    #[error("SSH channel request '{request}' failed: {message}")]
    ChannelRequestFailed {
        request: String,
        message: String,
        errno: i32,
    },

    #[error("SSH channel of type '{kind}' could not be opened: {reason}")]
    ChannelOpen {
        kind: String,
        reason: String,
        errno: i32,
    },

    #[error("SSH channel not opened")]
    ChannelClosed,

    #[error("SSH channel already open")]
    ChannelAlreadyOpen,

    // Stream errors
    #[error("end of file reached")]
    Eof,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    #[error("Invalid configuration: {field} - {reason}")]
    ConfigInvalid { field: String, reason: String },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // YAML errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_saphyr::Error),
}

pub type Result<T> = std::result::Result<T, SshError>;

impl SshError {
    /// Build an error from a transport error code and message.
    ///
    /// Codes without a dedicated kind end up as [`SshError::Ssh`].
    #[must_use]
    pub fn from_errno(code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            errno::TIMEOUT | errno::SOCKET_TIMEOUT => Self::Timeout {
                message,
                errno: code,
            },
            errno::SOCKET_DISCONNECT | errno::CHANNEL_CLOSED => Self::Disconnect {
                message,
                errno: code,
            },
            errno::AUTHENTICATION_FAILED | errno::PUBLICKEY_UNVERIFIED => {
                Self::AuthenticationFailed {
                    user: String::new(),
                    message,
                    errno: code,
                }
            }
            errno::CHANNEL_REQUEST_DENIED => Self::ChannelRequestFailed {
                request: String::new(),
                message,
                errno: code,
            },
            errno::HOSTKEY_INIT | errno::HOSTKEY_SIGN => Self::HostKey {
                host: String::new(),
                reason: message,
            },
            _ => Self::Ssh {
                message,
                errno: code,
            },
        }
    }

    /// The transport error code carried by this error, if any.
    #[must_use]
    pub const fn errno(&self) -> Option<i32> {
        match self {
            Self::Connect { errno, .. }
            | Self::Timeout { errno, .. }
            | Self::Disconnect { errno, .. }
            | Self::AuthenticationFailed { errno, .. }
            | Self::Ssh { errno, .. }
            | Self::ChannelRequestFailed { errno, .. }
            | Self::ChannelOpen { errno, .. } => Some(*errno),
            _ => None,
        }
    }

    /// True for errors where the remote end went away. A deadline expiry
    /// counts as a disconnect.
    #[must_use]
    pub const fn is_disconnect(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Disconnect { .. })
    }

    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// True for a request the remote side refused after the channel opened.
    #[must_use]
    pub const fn is_request_rejected(&self) -> bool {
        matches!(self, Self::ChannelRequestFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============== Display ==============

    #[test]
    fn test_not_connected_display() {
        assert_eq!(
            SshError::NotConnected.to_string(),
            "SSH session not connected"
        );
    }

    #[test]
    fn test_connect_display() {
        let err = SshError::Connect {
            host: "server1".to_string(),
            reason: "connection refused".to_string(),
            errno: errno::SOCKET_NONE,
        };
        let msg = err.to_string();
        assert!(msg.contains("server1"));
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn test_timeout_display_is_message() {
        let err = SshError::Timeout {
            message: "Timed out waiting on socket".to_string(),
            errno: errno::TIMEOUT,
        };
        assert_eq!(err.to_string(), "Timed out waiting on socket");
    }

    #[test]
    fn test_authentication_failed_display() {
        let err = SshError::AuthenticationFailed {
            user: "demo".to_string(),
            message: "Authentication failed (username/password)".to_string(),
            errno: errno::AUTHENTICATION_FAILED,
        };
        let msg = err.to_string();
        assert!(msg.contains("demo"));
        assert!(msg.contains("username/password"));
    }

    #[test]
    fn test_channel_request_failed_display() {
        let err = SshError::ChannelRequestFailed {
            request: "exec".to_string(),
            message: "Unable to complete request for channel-process-startup".to_string(),
            errno: errno::CHANNEL_REQUEST_DENIED,
        };
        assert!(err.to_string().contains("'exec'"));
    }

    #[test]
    fn test_io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: SshError = io_err.into();
        assert!(err.to_string().contains("file not found"));
        assert_eq!(err.errno(), None);
    }

    // ============== Classification ==============

    #[test]
    fn test_from_errno_timeout() {
        let err = SshError::from_errno(errno::TIMEOUT, "Timed out");
        assert!(err.is_timeout());
        assert!(err.is_disconnect());
        assert_eq!(err.errno(), Some(errno::TIMEOUT));
    }

    #[test]
    fn test_from_errno_disconnect() {
        let err = SshError::from_errno(errno::SOCKET_DISCONNECT, "gone");
        assert!(err.is_disconnect());
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_from_errno_auth() {
        let err = SshError::from_errno(errno::AUTHENTICATION_FAILED, "denied");
        assert!(matches!(err, SshError::AuthenticationFailed { .. }));
        let err = SshError::from_errno(errno::PUBLICKEY_UNVERIFIED, "denied");
        assert!(matches!(err, SshError::AuthenticationFailed { .. }));
    }

    #[test]
    fn test_from_errno_request_denied() {
        let err = SshError::from_errno(errno::CHANNEL_REQUEST_DENIED, "nope");
        assert!(err.is_request_rejected());
    }

    #[test]
    fn test_from_errno_host_key() {
        let err = SshError::from_errno(errno::HOSTKEY_SIGN, "bad signature");
        assert!(matches!(err, SshError::HostKey { .. }));
        assert_eq!(err.errno(), None);
    }

    #[test]
    fn test_from_errno_fallback() {
        let err = SshError::from_errno(errno::PROTO, "protocol error");
        match err {
            SshError::Ssh { message, errno: code } => {
                assert_eq!(message, "protocol error");
                assert_eq!(code, errno::PROTO);
            }
            e => panic!("Expected Ssh, got: {e:?}"),
        }
    }

    #[test]
    fn test_state_errors_have_no_errno() {
        for err in [
            SshError::NotConnected,
            SshError::NotAuthenticated,
            SshError::ChannelClosed,
            SshError::ChannelAlreadyOpen,
            SshError::Eof,
        ] {
            assert_eq!(err.errno(), None);
            assert!(!err.is_disconnect());
        }
    }

    #[test]
    fn test_result_type_alias() {
        let ok_result: Result<i32> = Ok(42);
        let err_result: Result<i32> = Err(SshError::Eof);

        assert!(ok_result.is_ok());
        assert!(err_result.is_err());
    }
}
