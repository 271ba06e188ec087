//! Channels multiplexed over a session
//!
//! A [`Channel`] starts out closed; [`Channel::open`] asks the transport for
//! a channel id and records the session's link generation next to it. When
//! the session closes or reconnects the generation moves on and the channel
//! reports itself closed, so stale handles fail instead of talking to a
//! different connection.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::debug;

use crate::config::Properties;
use crate::error::{Result, SshError, errno};
use crate::ports::{
    ChannelId, ChannelRequest, ExtendedData, PtyOptions, ReadOutcome, StreamSelector, Transport,
};
use crate::runtime;

use super::io::{GetsOptions, RemoteIo, Separator};
use super::session::{Link, TransportGuard};
use super::stream::Stream;

/// Default local maximum packet size
pub const PACKET_DEFAULT: u32 = 32_768;

/// Default local maximum window size
pub const WINDOW_DEFAULT: u32 = 2 * 1024 * 1024;

/// Type and flow-control parameters a channel is opened with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelParams {
    /// Channel type, usually `session`
    pub kind: String,
    pub packet_size: u32,
    pub window_size: u32,
}

impl Default for ChannelParams {
    fn default() -> Self {
        Self::new("session")
    }
}

impl ChannelParams {
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            packet_size: PACKET_DEFAULT,
            window_size: WINDOW_DEFAULT,
        }
    }

    #[must_use]
    pub const fn packet_size(mut self, packet_size: u32) -> Self {
        self.packet_size = packet_size;
        self
    }

    #[must_use]
    pub const fn window_size(mut self, window_size: u32) -> Self {
        self.window_size = window_size;
        self
    }
}

/// Options for reading a command's output in one go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecOptions {
    /// Read at most this many bytes
    pub limit: Option<usize>,
    /// Strip one trailing line terminator
    pub chomp: bool,
}

impl ExecOptions {
    #[must_use]
    pub const fn chomp() -> Self {
        Self {
            limit: None,
            chomp: true,
        }
    }

    fn separator(self) -> Separator {
        Separator::from(self.limit)
    }

    const fn gets(self) -> GetsOptions {
        GetsOptions { chomp: self.chomp }
    }
}

/// Live streams of a command started with one of the `popen` helpers.
#[derive(Debug)]
pub struct Popen {
    /// stdin/stdout of the command
    pub stdio: Stream,
    /// stderr, only with [`Channel::popen3`]
    pub stderr: Option<Stream>,
    /// Whether the remote side accepted the `exec` request
    pub accepted: bool,
}

/// Output of a command run with one of the `capture` helpers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Capture {
    pub stdout: Option<String>,
    /// Only filled by [`Channel::capture3`]
    pub stderr: Option<String>,
    /// Whether the remote side accepted the `exec` request
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Opened {
    id: ChannelId,
    generation: u64,
}

#[derive(Debug, Default)]
struct ChannelState {
    opened: Option<Opened>,
    exit_status: Option<i32>,
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// State shared by a channel and the streams reading from it.
pub(crate) struct ChannelInner {
    link: Arc<Link>,
    params: ChannelParams,
    state: Mutex<ChannelState>,
    properties: Mutex<Properties>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn closed_by_session() -> SshError {
    SshError::Disconnect {
        message: "SSH session closed".to_string(),
        errno: errno::SOCKET_DISCONNECT,
    }
}

impl ChannelInner {
    fn opened(&self) -> Option<Opened> {
        lock(&self.state).opened
    }

    fn is_open(&self) -> bool {
        runtime::is_ready()
            && self
                .opened()
                .is_some_and(|o| o.generation == self.link.generation())
    }

    /// Lock the transport for an operation on this channel.
    fn attach(
        &self,
    ) -> impl Future<Output = Result<(TransportGuard, ChannelId)>> + Send + use<> {
        let ready = runtime::is_ready();
        let opened = self.opened();
        let link = Arc::clone(&self.link);
        async move {
            if !ready {
                return Err(SshError::ChannelClosed);
            }
            let opened = opened.ok_or(SshError::ChannelClosed)?;
            if opened.generation != link.generation() {
                return Err(closed_by_session());
            }

            let transport = link.transport().await.map_err(|_| closed_by_session())?;
            // The session may have gone away while we waited for the lock
            if opened.generation != link.generation() {
                return Err(closed_by_session());
            }
            Ok((transport, opened.id))
        }
    }

    pub(crate) fn read(
        &self,
        selector: StreamSelector,
        max_bytes: usize,
    ) -> BoxFuture<'static, ReadOutcome> {
        let attach = self.attach();
        let link = Arc::clone(&self.link);
        Box::pin(async move {
            let (mut transport, id) = attach.await?;
            transport
                .read(id, selector, max_bytes)
                .await
                .inspect_err(|e| link.record(e))
        })
    }

    pub(crate) fn write<'a>(
        &self,
        selector: StreamSelector,
        data: &'a [u8],
    ) -> BoxFuture<'a, usize> {
        let attach = self.attach();
        let link = Arc::clone(&self.link);
        Box::pin(async move {
            let (mut transport, id) = attach.await?;
            transport
                .write(id, selector, data)
                .await
                .inspect_err(|e| link.record(e))
        })
    }

    pub(crate) fn flush(&self, selector: StreamSelector) -> BoxFuture<'static, ()> {
        let attach = self.attach();
        let link = Arc::clone(&self.link);
        Box::pin(async move {
            let (mut transport, id) = attach.await?;
            transport
                .flush(id, selector)
                .await
                .inspect_err(|e| link.record(e))
        })
    }

    pub(crate) fn wait_socket(&self) -> BoxFuture<'static, ()> {
        let attach = self.attach();
        Box::pin(async move {
            let (mut transport, _) = attach.await?;
            transport.wait_socket().await
        })
    }

    pub(crate) fn eof(&self) -> BoxFuture<'static, bool> {
        let attach = self.attach();
        Box::pin(async move {
            let (transport, id) = attach.await?;
            Ok(transport.eof(id))
        })
    }

    pub(crate) fn send_eof(&self, wait: bool) -> BoxFuture<'static, ()> {
        let attach = self.attach();
        let link = Arc::clone(&self.link);
        Box::pin(async move {
            let (mut transport, id) = attach.await?;
            transport
                .send_eof(id)
                .await
                .inspect_err(|e| link.record(e))?;
            if wait {
                transport
                    .wait_eof(id)
                    .await
                    .inspect_err(|e| link.record(e))?;
            }
            Ok(())
        })
    }
}

/// One logical channel within a [`Session`](super::Session).
///
/// Cloning a channel yields another handle to the same channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("kind", &self.inner.params.kind)
            .field("open", &self.is_open())
            .field("exit_status", &self.exit_status())
            .finish_non_exhaustive()
    }
}

impl Channel {
    pub(crate) fn new(link: Arc<Link>, params: ChannelParams) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                link,
                params,
                state: Mutex::new(ChannelState::default()),
                properties: Mutex::new(Properties::new()),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<ChannelInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Arc<ChannelInner>) -> Self {
        Self { inner }
    }

    /// Channel type, e.g. `session`
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.inner.params.kind
    }

    #[must_use]
    pub fn local_maximum_packet_size(&self) -> u32 {
        self.inner.params.packet_size
    }

    #[must_use]
    pub fn local_maximum_window_size(&self) -> u32 {
        self.inner.params.window_size
    }

    /// Exit status captured when the channel was last closed
    #[must_use]
    pub fn exit_status(&self) -> Option<i32> {
        lock(&self.inner.state).exit_status
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        lock(&self.inner.properties).get(key).cloned()
    }

    /// Set a property, returning the previous value.
    pub fn set(
        &self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Option<serde_json::Value> {
        lock(&self.inner.properties).insert(key.into(), value.into())
    }

    /// Snapshot of all properties
    #[must_use]
    pub fn properties(&self) -> Properties {
        lock(&self.inner.properties).clone()
    }

    /// Open the channel. `message` carries type-specific data, e.g. the
    /// forwarding target of a `direct-tcpip` channel.
    ///
    /// # Errors
    ///
    /// Fails with [`SshError::ChannelAlreadyOpen`] if the channel is open,
    /// [`SshError::NotConnected`] / [`SshError::NotAuthenticated`] if the
    /// session is not ready, or [`SshError::ChannelOpen`] if the transport
    /// refuses the channel.
    pub async fn open(&self, message: Option<&[u8]>) -> Result<()> {
        if self.is_open() {
            return Err(SshError::ChannelAlreadyOpen);
        }
        if !runtime::is_ready() {
            return Err(SshError::NotConnected);
        }

        let link = &self.inner.link;
        let params = &self.inner.params;
        let mut transport = link.transport().await?;
        if !transport.is_authenticated() {
            return Err(SshError::NotAuthenticated);
        }

        let id = transport
            .open_channel(&params.kind, params.window_size, params.packet_size, message)
            .await
            .inspect_err(|e| link.record(e))?;

        let mut state = lock(&self.inner.state);
        state.opened = Some(Opened {
            id,
            generation: link.generation(),
        });
        state.exit_status = None;
        drop(state);

        debug!(channel = id, kind = %params.kind, "Channel opened");
        Ok(())
    }

    /// Close the channel, then open it again with the same parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if closing or opening fails.
    pub async fn reopen(&self, message: Option<&[u8]>) -> Result<()> {
        self.close(true).await?;
        self.open(message).await
    }

    /// Close the channel and return its exit status.
    ///
    /// With `wait_for_remote`, waits for the remote side to acknowledge the
    /// close first. Closing a closed channel returns the last known status.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport fails while closing; the channel
    /// counts as closed either way.
    pub async fn close(&self, wait_for_remote: bool) -> Result<Option<i32>> {
        let opened = lock(&self.inner.state).opened.take();
        let Some(opened) = opened else {
            return Ok(self.exit_status());
        };

        let link = &self.inner.link;
        if opened.generation != link.generation() {
            return Ok(self.exit_status());
        }
        let Ok(mut transport) = link.transport().await else {
            return Ok(self.exit_status());
        };

        let status = transport
            .close_channel(opened.id, wait_for_remote)
            .await
            .inspect_err(|e| link.record(e))?;
        lock(&self.inner.state).exit_status = status;

        debug!(channel = opened.id, exit_status = ?status, "Channel closed");
        Ok(status)
    }

    /// Whether the remote side has sent EOF.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::ChannelClosed`] if the channel is not open.
    pub async fn eof(&self) -> Result<bool> {
        self.inner.eof().await
    }

    /// Tell the remote side no more data will be sent, optionally waiting
    /// for its own EOF.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::ChannelClosed`] if the channel is not open, or a
    /// transport error.
    pub async fn send_eof(&self, wait_for_eof: bool) -> Result<()> {
        self.inner.send_eof(wait_for_eof).await
    }

    /// Send a request and wait for the reply. A rejected request is
    /// `Ok(false)`.
    async fn send_request(
        &self,
        request: ChannelRequest<'_>,
        ext: Option<ExtendedData>,
    ) -> Result<bool> {
        let link = &self.inner.link;
        let (mut transport, id) = self.inner.attach().await?;

        if let Some(mode) = ext {
            transport
                .handle_extended_data(id, mode)
                .inspect_err(|e| link.record(e))?;
        }

        let accepted = transport
            .send_request(id, request, true)
            .await
            .inspect_err(|e| link.record(e))?;

        if !accepted {
            let err = rejection(&*transport, request);
            link.record(&err);
            debug!(channel = id, request = request.kind(), "Channel request rejected");
        }
        Ok(accepted)
    }

    /// Like `send_request`, but a rejection is an error.
    async fn require(&self, request: ChannelRequest<'_>) -> Result<()> {
        if self.send_request(request, None).await? {
            return Ok(());
        }
        let (transport, _) = self.inner.attach().await?;
        Err(rejection(&*transport, request))
    }

    /// Send a `kind` request (`exec`, `shell` or `subsystem`) after switching
    /// extended data handling to `ext`. Returns whether it was accepted.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::InvalidArgument`] for an unknown kind or a missing
    /// payload, [`SshError::ChannelClosed`] if the channel is not open.
    pub async fn request(
        &self,
        kind: &str,
        payload: Option<&str>,
        ext: ExtendedData,
    ) -> Result<bool> {
        let request = match (kind, payload) {
            ("exec", Some(command)) => ChannelRequest::Exec(command),
            ("subsystem", Some(name)) => ChannelRequest::Subsystem(name),
            ("shell", _) => ChannelRequest::Shell,
            ("exec" | "subsystem", None) => {
                return Err(SshError::InvalidArgument(format!(
                    "'{kind}' request needs a payload"
                )));
            }
            _ => {
                return Err(SshError::InvalidArgument(format!(
                    "unsupported channel request '{kind}'"
                )));
            }
        };
        self.send_request(request, Some(ext)).await
    }

    /// Run `command` and read its output, then close the channel. stderr is
    /// discarded. Returns `None` if the request was rejected or the command
    /// printed nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is not open or the transport fails.
    pub async fn exec(&self, command: &str, opts: ExecOptions) -> Result<Option<String>> {
        self.exec_and_close(command, opts, true).await
    }

    pub(crate) async fn exec_and_close(
        &self,
        command: &str,
        opts: ExecOptions,
        wait_closed: bool,
    ) -> Result<Option<String>> {
        let result = async {
            if !self
                .send_request(ChannelRequest::Exec(command), Some(ExtendedData::Ignore))
                .await?
            {
                return Ok::<_, SshError>(None);
            }
            let mut stdout = Stream::new(self, StreamSelector::Primary)?;
            stdout.gets(opts.separator(), opts.gets()).await
        }
        .await;

        let closed = self.close(wait_closed).await;
        let output = result?;
        closed?;
        Ok(output)
    }

    async fn popen(&self, command: &str, ext: ExtendedData) -> Result<Popen> {
        let accepted = self
            .send_request(ChannelRequest::Exec(command), Some(ext))
            .await?;
        let stdio = Stream::new(self, StreamSelector::Primary)?;
        let stderr = if ext == ExtendedData::Normal {
            Some(Stream::new(self, StreamSelector::Extended)?)
        } else {
            None
        };
        Ok(Popen {
            stdio,
            stderr,
            accepted,
        })
    }

    /// Start `command` and return its stdin/stdout stream; stderr is
    /// discarded. The caller drains and closes.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::ChannelClosed`] if the channel is not open.
    pub async fn popen2(&self, command: &str) -> Result<Popen> {
        self.popen(command, ExtendedData::Ignore).await
    }

    /// Start `command` with stderr merged into stdout.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::ChannelClosed`] if the channel is not open.
    pub async fn popen2e(&self, command: &str) -> Result<Popen> {
        self.popen(command, ExtendedData::Merge).await
    }

    /// Start `command` with separate stdout and stderr streams.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::ChannelClosed`] if the channel is not open.
    pub async fn popen3(&self, command: &str) -> Result<Popen> {
        self.popen(command, ExtendedData::Normal).await
    }

    async fn capture(&self, command: &str, opts: ExecOptions, ext: ExtendedData) -> Result<Capture> {
        let result = async {
            let popen = self.popen(command, ext).await?;
            if !popen.accepted {
                return Ok::<_, SshError>(Capture::default());
            }

            let mut stdio = popen.stdio;
            let stdout = stdio.gets(opts.separator(), opts.gets()).await?;
            let stderr = match popen.stderr {
                Some(mut stream) => stream.gets(opts.separator(), opts.gets()).await?,
                None => None,
            };
            Ok(Capture {
                stdout,
                stderr,
                success: true,
            })
        }
        .await;

        let closed = self.close(true).await;
        let capture = result?;
        closed?;
        Ok(capture)
    }

    /// Run `command`, collect stdout and close the channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is not open or the transport fails.
    pub async fn capture2(&self, command: &str, opts: ExecOptions) -> Result<Capture> {
        self.capture(command, opts, ExtendedData::Ignore).await
    }

    /// Run `command`, collect stdout and stderr interleaved, close the channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is not open or the transport fails.
    pub async fn capture2e(&self, command: &str, opts: ExecOptions) -> Result<Capture> {
        self.capture(command, opts, ExtendedData::Merge).await
    }

    /// Run `command`, collect stdout and stderr separately, close the channel.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is not open or the transport fails.
    pub async fn capture3(&self, command: &str, opts: ExecOptions) -> Result<Capture> {
        self.capture(command, opts, ExtendedData::Normal).await
    }

    /// Start a subsystem such as `sftp`. Returns whether it was accepted.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::ChannelClosed`] if the channel is not open.
    pub async fn subsystem(&self, name: &str, ext: ExtendedData) -> Result<bool> {
        self.send_request(ChannelRequest::Subsystem(name), Some(ext))
            .await
    }

    /// Start the user's login shell. Returns whether it was accepted.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::ChannelClosed`] if the channel is not open.
    pub async fn shell(&self) -> Result<bool> {
        self.send_request(ChannelRequest::Shell, Some(ExtendedData::Normal))
            .await
    }

    /// Request a pseudo terminal.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::ChannelRequestFailed`] if the server refuses.
    pub async fn request_pty(&self, pty: &PtyOptions) -> Result<()> {
        self.require(ChannelRequest::Pty(pty)).await
    }

    /// Set an environment variable for the command started next.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::ChannelRequestFailed`] if the server refuses
    /// (most servers only accept names listed in `AcceptEnv`).
    pub async fn setenv(&self, name: &str, value: &str) -> Result<()> {
        self.require(ChannelRequest::Env { name, value }).await
    }
}

fn rejection(transport: &dyn Transport, request: ChannelRequest<'_>) -> SshError {
    let code = match transport.last_errno() {
        errno::NONE => errno::CHANNEL_REQUEST_DENIED,
        code => code,
    };
    SshError::ChannelRequestFailed {
        request: request.kind().to_string(),
        message: transport
            .last_error()
            .unwrap_or_else(|| "Unable to complete request for channel-process-startup".to_string()),
        errno: code,
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        let opened = lock(&self.state).opened;
        if let Some(opened) = opened
            && opened.generation == self.link.generation()
        {
            debug!(channel = opened.id, "Channel dropped while open, closing on next use");
            self.link.discard(opened.id, opened.generation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use crate::ports::mock::{MockAuth, MockCommand, MockConnector};
    use crate::ssh::Session;

    async fn session(connector: MockConnector) -> Session {
        runtime::startup();
        let mut session = Session::with_connector(Arc::new(connector));
        session.connect("mock.example", 22).await.unwrap();
        session
            .login("demo", &Credentials::password("secret"))
            .await
            .unwrap();
        session
    }

    #[tokio::test]
    async fn test_fresh_channel_is_closed() {
        let session = session(MockConnector::new()).await;
        let channel = session.channel(ChannelParams::default());
        assert!(!channel.is_open());
        assert!(channel.exit_status().is_none());
        assert_eq!(channel.kind(), "session");
        assert_eq!(channel.local_maximum_packet_size(), PACKET_DEFAULT);
        assert_eq!(channel.local_maximum_window_size(), WINDOW_DEFAULT);

        channel.open(None).await.unwrap();
        assert!(channel.is_open());
    }

    #[tokio::test]
    async fn test_operations_on_closed_channel_fail() {
        let session = session(MockConnector::new()).await;
        let channel = session.channel(ChannelParams::default());

        assert!(matches!(
            channel.request("exec", Some("ls"), ExtendedData::Normal).await,
            Err(SshError::ChannelClosed)
        ));
        assert!(matches!(
            channel.exec("ls", ExecOptions::default()).await,
            Err(SshError::ChannelClosed)
        ));
        assert!(matches!(channel.eof().await, Err(SshError::ChannelClosed)));
        assert!(matches!(
            channel.send_eof(false).await,
            Err(SshError::ChannelClosed)
        ));
        assert!(matches!(
            Stream::new(&channel, StreamSelector::Primary),
            Err(SshError::ChannelClosed)
        ));
        // close is allowed
        assert_eq!(channel.close(true).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dropped_open_channel_is_released_on_next_use() {
        let connector = MockConnector::new();
        let session = session(connector.clone()).await;
        let dropped = session
            .open_channel(ChannelParams::default(), None)
            .await
            .unwrap();
        let closed = session
            .open_channel(ChannelParams::default(), None)
            .await
            .unwrap();
        closed.close(false).await.unwrap();

        drop(dropped);
        assert_eq!(connector.count("close 0"), 0);

        let next = session
            .open_channel(ChannelParams::default(), None)
            .await
            .unwrap();
        assert!(next.is_open());
        assert_eq!(connector.count("close 0 wait=false"), 1);
        assert_eq!(connector.count("close 1"), 1);

        // Released once only
        session.fingerprint().await.unwrap();
        assert_eq!(connector.count("close 0"), 1);
    }

    #[tokio::test]
    async fn test_channel_dropped_after_session_close_is_not_released() {
        let connector = MockConnector::new();
        let mut session = session(connector.clone()).await;
        let stale = session
            .open_channel(ChannelParams::default(), None)
            .await
            .unwrap();

        session.close().await;
        drop(stale);
        session.connect("mock.example", 22).await.unwrap();
        session
            .login("demo", &Credentials::password("secret"))
            .await
            .unwrap();
        session
            .open_channel(ChannelParams::default(), None)
            .await
            .unwrap();

        assert_eq!(connector.count("close "), 0);
    }

    #[tokio::test]
    async fn test_open_requires_authentication() {
        runtime::startup();
        let mut session = Session::with_connector(Arc::new(MockConnector::new()));
        let channel = session.channel(ChannelParams::default());
        assert!(matches!(
            channel.open(None).await,
            Err(SshError::NotConnected)
        ));

        session.connect("mock.example", 22).await.unwrap();
        assert!(matches!(
            channel.open(None).await,
            Err(SshError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn test_open_twice_fails() {
        let session = session(MockConnector::new()).await;
        let channel = session.open_channel(ChannelParams::default(), None).await.unwrap();
        assert!(matches!(
            channel.open(None).await,
            Err(SshError::ChannelAlreadyOpen)
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let connector = MockConnector::new().with_command("true", MockCommand::default());
        let session = session(connector.clone()).await;
        let channel = session.open_channel(ChannelParams::default(), None).await.unwrap();
        channel
            .request("exec", Some("true"), ExtendedData::Normal)
            .await
            .unwrap();

        assert_eq!(channel.close(true).await.unwrap(), Some(0));
        assert_eq!(channel.close(true).await.unwrap(), Some(0));
        assert!(!channel.is_open());
        assert_eq!(connector.count("close"), 1);
    }

    #[tokio::test]
    async fn test_reopen_preserves_parameters() {
        let connector = MockConnector::new();
        let session = session(connector.clone()).await;
        let params = ChannelParams::new("session")
            .packet_size(1024)
            .window_size(4096);
        let channel = session.open_channel(params, None).await.unwrap();

        channel.reopen(None).await.unwrap();
        assert!(channel.is_open());
        assert_eq!(channel.kind(), "session");
        assert_eq!(channel.local_maximum_packet_size(), 1024);
        assert_eq!(channel.local_maximum_window_size(), 4096);

        let opens: Vec<_> = connector
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("open"))
            .collect();
        assert_eq!(
            opens,
            vec![
                "open session window=4096 packet=1024 message=0",
                "open session window=4096 packet=1024 message=0",
            ]
        );
    }

    #[tokio::test]
    async fn test_exec_returns_output() {
        let connector = MockConnector::new().with_command("echo ETNA", MockCommand::stdout("ETNA\n"));
        let session = session(connector.clone()).await;

        let channel = session.open_channel(ChannelParams::default(), None).await.unwrap();
        let output = channel.exec("echo ETNA", ExecOptions::default()).await.unwrap();
        assert_eq!(output.as_deref(), Some("ETNA\n"));
        assert!(!channel.is_open());
        assert_eq!(channel.exit_status(), Some(0));

        let channel = session.open_channel(ChannelParams::default(), None).await.unwrap();
        let output = channel.exec("echo ETNA", ExecOptions::chomp()).await.unwrap();
        assert_eq!(output.as_deref(), Some("ETNA"));
    }

    #[tokio::test]
    async fn test_exec_with_limit_ignores_stderr() {
        let connector =
            MockConnector::new().with_command("noisy", MockCommand::new("abcdef", "warning\n", 0));
        let session = session(connector).await;
        let channel = session.open_channel(ChannelParams::default(), None).await.unwrap();

        let opts = ExecOptions {
            limit: Some(3),
            chomp: false,
        };
        assert_eq!(channel.exec("noisy", opts).await.unwrap().as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_exec_rejected_returns_none_and_closes() {
        let connector = MockConnector::new().rejecting("exec");
        let session = session(connector).await;
        let channel = session.open_channel(ChannelParams::default(), None).await.unwrap();

        let output = channel.exec("ls", ExecOptions::default()).await.unwrap();
        assert!(output.is_none());
        assert!(!channel.is_open());
        assert_eq!(session.last_errno(), errno::CHANNEL_REQUEST_DENIED);
    }

    #[tokio::test]
    async fn test_capture3_scenario() {
        let connector = MockConnector::new().with_command("echo 1", MockCommand::stdout("1"));
        let session = session(connector).await;
        let channel = session.open_channel(ChannelParams::default(), None).await.unwrap();

        let capture = channel.capture3("echo 1", ExecOptions::default()).await.unwrap();
        assert_eq!(capture.stdout.as_deref(), Some("1"));
        assert!(capture.stderr.as_deref().unwrap_or_default().is_empty());
        assert!(capture.success);
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn test_capture_policies() {
        let connector =
            MockConnector::new().with_command("both", MockCommand::new("out\n", "err\n", 1));
        let session = session(connector).await;

        let channel = session.open_channel(ChannelParams::default(), None).await.unwrap();
        let capture = channel.capture2("both", ExecOptions::default()).await.unwrap();
        assert_eq!(capture.stdout.as_deref(), Some("out\n"));
        assert!(capture.stderr.is_none());
        assert_eq!(channel.exit_status(), Some(1));

        channel.open(None).await.unwrap();
        let capture = channel.capture2e("both", ExecOptions::default()).await.unwrap();
        assert_eq!(capture.stdout.as_deref(), Some("out\nerr\n"));

        channel.open(None).await.unwrap();
        let capture = channel.capture3("both", ExecOptions::chomp()).await.unwrap();
        assert_eq!(capture.stdout.as_deref(), Some("out"));
        assert_eq!(capture.stderr.as_deref(), Some("err"));
    }

    #[tokio::test]
    async fn test_capture_rejected() {
        let session = session(MockConnector::new().rejecting("exec")).await;
        let channel = session.open_channel(ChannelParams::default(), None).await.unwrap();
        let capture = channel.capture3("ls", ExecOptions::default()).await.unwrap();
        assert!(!capture.success);
        assert!(capture.stdout.is_none());
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn test_popen_round_trip() {
        let session = session(MockConnector::new()).await;
        let channel = session.open_channel(ChannelParams::default(), None).await.unwrap();

        let Popen {
            mut stdio,
            stderr,
            accepted,
        } = channel.popen2("cat").await.unwrap();
        assert!(accepted);
        assert!(stderr.is_none());

        stdio.puts(&["hello", "world"]).await.unwrap();
        stdio.close().await.unwrap();
        assert_eq!(
            stdio.gets(Separator::Line, GetsOptions::default()).await.unwrap().as_deref(),
            Some("hello\n")
        );
        assert_eq!(stdio.read(None).await.unwrap(), b"world\n");
        assert!(channel.is_open());
        assert_eq!(channel.close(true).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_popen3_has_stderr_stream() {
        let connector = MockConnector::new().with_command("warn", MockCommand::new("", "oops\n", 2));
        let session = session(connector).await;
        let channel = session.open_channel(ChannelParams::default(), None).await.unwrap();

        let popen = channel.popen3("warn").await.unwrap();
        let mut stderr = popen.stderr.unwrap();
        assert_eq!(stderr.selector(), StreamSelector::Extended);
        assert_eq!(
            stderr.readline(Separator::Line, GetsOptions::CHOMP).await.unwrap(),
            "oops"
        );
        assert_eq!(channel.close(false).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_popen2e_merges() {
        let connector = MockConnector::new().with_command("both", MockCommand::new("a\n", "b\n", 0));
        let session = session(connector).await;
        let channel = session.open_channel(ChannelParams::default(), None).await.unwrap();

        let mut popen = channel.popen2e("both").await.unwrap();
        let lines = popen
            .stdio
            .readlines(Separator::Line, GetsOptions::CHOMP)
            .await
            .unwrap();
        assert_eq!(lines, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_request_rejected_is_false() {
        let session = session(MockConnector::new().rejecting("subsystem")).await;
        let channel = session.open_channel(ChannelParams::default(), None).await.unwrap();
        assert!(!channel.subsystem("sftp", ExtendedData::Normal).await.unwrap());
        assert!(channel.is_open());
    }

    #[tokio::test]
    async fn test_request_validates_kind() {
        let session = session(MockConnector::new()).await;
        let channel = session.open_channel(ChannelParams::default(), None).await.unwrap();
        assert!(matches!(
            channel.request("exec", None, ExtendedData::Normal).await,
            Err(SshError::InvalidArgument(_))
        ));
        assert!(matches!(
            channel.request("x11-req", None, ExtendedData::Normal).await,
            Err(SshError::InvalidArgument(_))
        ));
        assert!(channel.request("shell", None, ExtendedData::Merge).await.unwrap());
    }

    #[tokio::test]
    async fn test_setenv_and_pty_propagate_rejection() {
        let connector = MockConnector::new().rejecting("env");
        let session = session(connector.clone()).await;
        let channel = session.open_channel(ChannelParams::default(), None).await.unwrap();

        channel.request_pty(&PtyOptions::default()).await.unwrap();
        let err = channel.setenv("LANG", "C").await.unwrap_err();
        assert!(
            matches!(err, SshError::ChannelRequestFailed { ref request, errno: code, .. }
                if request == "env" && code == errno::CHANNEL_REQUEST_DENIED)
        );
        assert!(connector.calls().iter().any(|c| c.ends_with("pty-req vanilla 80x24")));
    }

    #[tokio::test]
    async fn test_session_close_invalidates_channels() {
        let mut session = session(MockConnector::new()).await;
        let channel = session.open_channel(ChannelParams::default(), None).await.unwrap();
        assert!(channel.is_open());

        session.close().await;
        assert!(!channel.is_open());
        assert!(matches!(
            channel.request("shell", None, ExtendedData::Normal).await,
            Err(SshError::Disconnect { .. })
        ));
        // Closing the stale handle does not touch the transport
        assert_eq!(channel.close(true).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_properties_independent_of_state() {
        let session = session(MockConnector::new()).await;
        let channel = session.channel(ChannelParams::default());
        assert!(channel.get("target").is_none());
        assert!(channel.set("target", "db:5432").is_none());
        channel.open(None).await.unwrap();
        channel.close(false).await.unwrap();
        assert_eq!(channel.get("target"), Some(serde_json::json!("db:5432")));
        assert_eq!(channel.properties().len(), 1);
    }

    #[tokio::test]
    async fn test_open_channel_with_closes_after_callback() {
        let session = session(MockConnector::new()).await;
        let mut seen = None;
        let result = session
            .open_channel_with(ChannelParams::default(), None, async |channel| {
                seen = Some(channel.clone());
                channel.shell().await
            })
            .await
            .unwrap();
        assert!(result.unwrap());
        assert!(!seen.unwrap().is_open());
    }

    #[tokio::test]
    async fn test_open_after_rejected_login_fails() {
        runtime::startup();
        let mut session =
            Session::with_connector(Arc::new(MockConnector::new().with_auth(MockAuth::Reject)));
        session.connect("mock.example", 22).await.unwrap();
        assert!(session.login("demo", &Credentials::Agent).await.is_err());
        let channel = session.channel(ChannelParams::default());
        assert!(matches!(
            channel.open(None).await,
            Err(SshError::NotAuthenticated)
        ));
    }
}
