//! Transport Port
//!
//! This module defines the traits for the secure transport engine that
//! sessions and channels are built on: key exchange, encryption, packet
//! framing and raw byte delivery all live behind [`Transport`]. Keeping them
//! behind a trait lets the session layer run against an in-memory mock in
//! tests without requiring real SSH servers.

use async_trait::async_trait;

use crate::config::{Credentials, SessionOptions};
use crate::error::Result;

/// Transport-assigned channel identifier
pub type ChannelId = u32;

/// Which of a channel's two data flows an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum StreamSelector {
    /// Standard output / standard input
    #[default]
    Primary = 0,
    /// Extended data, conventionally standard error
    Extended = 1,
}

/// How a channel's extended data is treated once a command-like request
/// has been issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum ExtendedData {
    /// Keep stdout and stderr as two independent streams
    #[default]
    Normal = 0,
    /// Discard stderr
    Ignore = 1,
    /// Interleave stderr into stdout
    Merge = 2,
}

impl TryFrom<i32> for ExtendedData {
    type Error = crate::error::SshError;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Self::Normal),
            1 => Ok(Self::Ignore),
            2 => Ok(Self::Merge),
            other => Err(crate::error::SshError::InvalidArgument(format!(
                "unknown extended data mode {other}"
            ))),
        }
    }
}

/// Pseudo-terminal parameters for a `pty-req` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyOptions {
    pub term: String,
    /// Terminal modes as `(opcode, value)` pairs
    pub modes: Vec<(u8, u32)>,
    pub width: u32,
    pub height: u32,
    pub width_px: u32,
    pub height_px: u32,
}

impl Default for PtyOptions {
    fn default() -> Self {
        Self {
            term: "vanilla".to_string(),
            modes: Vec::new(),
            width: 80,
            height: 24,
            width_px: 0,
            height_px: 0,
        }
    }
}

/// A channel request, as sent to the remote side.
#[derive(Debug, Clone, Copy)]
pub enum ChannelRequest<'a> {
    Exec(&'a str),
    Shell,
    Subsystem(&'a str),
    Env { name: &'a str, value: &'a str },
    Pty(&'a PtyOptions),
}

impl ChannelRequest<'_> {
    /// Request type name as used on the wire.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Exec(_) => "exec",
            Self::Shell => "shell",
            Self::Subsystem(_) => "subsystem",
            Self::Env { .. } => "env",
            Self::Pty(_) => "pty-req",
        }
    }
}

/// Result of a single transport read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(Vec<u8>),
    /// The remote side will send nothing more on this selector
    Eof,
    /// Non-blocking mode only: nothing available right now
    WouldBlock,
}

/// Trait for establishing transport connections
///
/// Implementations perform the TCP connect, key exchange and host key
/// verification, and hand back an unauthenticated [`Transport`].
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        options: &SessionOptions,
    ) -> Result<Box<dyn Transport>>;
}

/// Trait for the primitive operations of an established connection
///
/// Errors carry the transport's error code; the same message and code are
/// reported by [`last_error`](Transport::last_error) and
/// [`last_errno`](Transport::last_errno) afterwards.
#[async_trait]
pub trait Transport: Send {
    /// Try to authenticate; `Ok(false)` means the server rejected the credentials.
    async fn authenticate(&mut self, user: &str, credentials: &Credentials) -> Result<bool>;

    /// Authentication methods the server offers for `user`, `None` when the
    /// question cannot be asked (e.g. already authenticated).
    async fn userauth_list(&mut self, user: &str) -> Result<Option<Vec<String>>>;

    fn is_authenticated(&self) -> bool;

    async fn open_channel(
        &mut self,
        kind: &str,
        window_size: u32,
        packet_size: u32,
        message: Option<&[u8]>,
    ) -> Result<ChannelId>;

    /// Set how extended data of `id` is delivered from now on.
    fn handle_extended_data(&mut self, id: ChannelId, mode: ExtendedData) -> Result<()>;

    /// Send a request; returns whether the remote side accepted it. Without
    /// `want_reply` the request is assumed accepted.
    async fn send_request(
        &mut self,
        id: ChannelId,
        request: ChannelRequest<'_>,
        want_reply: bool,
    ) -> Result<bool>;

    async fn read(
        &mut self,
        id: ChannelId,
        selector: StreamSelector,
        max_bytes: usize,
    ) -> Result<ReadOutcome>;

    async fn write(&mut self, id: ChannelId, selector: StreamSelector, data: &[u8])
    -> Result<usize>;

    async fn flush(&mut self, id: ChannelId, selector: StreamSelector) -> Result<()>;

    async fn send_eof(&mut self, id: ChannelId) -> Result<()>;

    /// Wait until the remote side has sent EOF on `id`.
    async fn wait_eof(&mut self, id: ChannelId) -> Result<()>;

    /// Whether the remote side has sent EOF on `id`.
    fn eof(&self, id: ChannelId) -> bool;

    /// Close a channel and return its exit status, if one is known. With
    /// `wait`, wait for the remote close acknowledgement first.
    async fn close_channel(&mut self, id: ChannelId, wait: bool) -> Result<Option<i32>>;

    fn set_blocking(&mut self, blocking: bool);

    fn is_blocking(&self) -> bool;

    /// Wait until the connection becomes readable again after a `WouldBlock`.
    async fn wait_socket(&mut self) -> Result<()>;

    /// Host key fingerprint (`SHA256:...`)
    fn fingerprint(&self) -> Option<String>;

    fn last_error(&self) -> Option<String>;

    fn last_errno(&self) -> i32;

    async fn disconnect(&mut self, description: &str) -> Result<()>;
}
