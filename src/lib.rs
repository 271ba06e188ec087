//! Multiplexed SSH sessions.
//!
//! A [`Session`] holds one authenticated connection; [`Channel`]s are
//! multiplexed over it and expose their stdout/stderr flows as line-oriented
//! [`Stream`]s.

#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod error;
pub mod ports;
pub mod runtime;
pub mod ssh;

pub use config::{Credentials, HostKeyVerification, PORT, SessionOptions};
pub use error::{Result, SshError, errno};
pub use ports::{ExtendedData, PtyOptions, StreamSelector};
pub use runtime::{is_ready, shutdown, startup};
pub use ssh::{
    Capture, Channel, ChannelParams, ConnectOptions, ExecOptions, GetsOptions, PACKET_DEFAULT,
    Popen, RemoteIo, RusshConnector, Separator, Session, Stream, WINDOW_DEFAULT,
};
