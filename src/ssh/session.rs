//! SSH Session
//!
//! A [`Session`] owns one transport connection and drives the
//! connect → authenticate → open channels → close lifecycle. Channels share
//! the connection through a [`Link`]; closing the session invalidates every
//! channel opened on it.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{OwnedMappedMutexGuard, OwnedMutexGuard};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::config::{Credentials, PORT, Properties, SessionOptions};
use crate::error::{Result, SshError, errno};
use crate::ports::{ChannelId, Connector, Transport};
use crate::runtime;

use super::channel::{Channel, ChannelParams, ExecOptions};
use super::connector::RusshConnector;

type CloseFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type CloseCallback = Box<dyn FnOnce() -> CloseFuture + Send>;

/// Exclusive access to the session's transport.
pub(crate) type TransportGuard = OwnedMappedMutexGuard<Option<Box<dyn Transport>>, dyn Transport>;

type TransportSlot = Arc<tokio::sync::Mutex<Option<Box<dyn Transport>>>>;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The connection shared between a session and its channels.
///
/// `generation` moves on whenever a transport is installed or removed, so
/// channels can tell whether the connection they were opened on still exists.
pub(crate) struct Link {
    transport: TransportSlot,
    generation: Arc<AtomicU64>,
    last_error: Mutex<Option<(String, i32)>>,
    /// Channels dropped while open, with the generation they were opened under
    dropped: Arc<Mutex<Vec<(ChannelId, u64)>>>,
}

impl Link {
    fn new() -> Self {
        Self {
            transport: Arc::new(tokio::sync::Mutex::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
            last_error: Mutex::new(None),
            dropped: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Lock the transport, closing any channels dropped since the last access.
    ///
    /// The returned future owns everything it touches, so it can be awaited
    /// from any task.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::NotConnected`] if there is none.
    pub(crate) fn transport(
        &self,
    ) -> impl Future<Output = Result<TransportGuard>> + Send + use<> {
        let slot = Arc::clone(&self.transport);
        let generation = Arc::clone(&self.generation);
        let dropped = Arc::clone(&self.dropped);
        async move {
            let mut transport =
                OwnedMutexGuard::try_map(slot.lock_owned().await, |t| t.as_deref_mut())
                    .map_err(|_| SshError::NotConnected)?;

            // Generation only moves while the transport lock is held
            let current = generation.load(Ordering::SeqCst);
            let pending = std::mem::take(&mut *lock(&dropped));
            for (id, opened_under) in pending {
                if opened_under != current {
                    continue;
                }
                match transport.close_channel(id, false).await {
                    Ok(_) => debug!(channel = id, "Released dropped channel"),
                    Err(e) => debug!(channel = id, error = %e, "Failed to release dropped channel"),
                }
            }
            Ok(transport)
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Queue a channel that was dropped while open; it is closed on the next
    /// transport access.
    pub(crate) fn discard(&self, id: ChannelId, generation: u64) {
        lock(&self.dropped).push((id, generation));
    }

    async fn install(&self, transport: Box<dyn Transport>) {
        let mut slot = self.transport.lock().await;
        *slot = Some(transport);
        self.generation.fetch_add(1, Ordering::SeqCst);
        lock(&self.dropped).clear();
    }

    async fn remove(&self) -> Option<Box<dyn Transport>> {
        let mut slot = self.transport.lock().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        lock(&self.dropped).clear();
        slot.take()
    }

    /// Remember the message and code of a transport-level failure.
    pub(crate) fn record(&self, err: &SshError) {
        let Some(code) = err.errno() else {
            return;
        };
        let message = match err {
            SshError::Timeout { message, .. }
            | SshError::Disconnect { message, .. }
            | SshError::AuthenticationFailed { message, .. }
            | SshError::Ssh { message, .. }
            | SshError::ChannelRequestFailed { message, .. } => message.clone(),
            SshError::Connect { reason, .. } | SshError::ChannelOpen { reason, .. } => {
                reason.clone()
            }
            other => other.to_string(),
        };
        *lock(&self.last_error) = Some((message, code));
    }

    fn last_error(&self) -> Option<(String, i32)> {
        lock(&self.last_error).clone()
    }

    fn clear_error(&self) {
        *lock(&self.last_error) = None;
    }
}

/// Options for [`Session::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    pub port: u16,
    /// Deadline for the connection attempt; also becomes the session timeout
    pub timeout: Option<Duration>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            port: PORT,
            timeout: None,
        }
    }
}

impl From<u16> for ConnectOptions {
    fn from(port: u16) -> Self {
        Self {
            port,
            timeout: None,
        }
    }
}

/// An SSH connection to one remote host.
pub struct Session {
    connector: Arc<dyn Connector>,
    link: Arc<Link>,
    options: SessionOptions,
    host: Option<String>,
    port: u16,
    logged_in: bool,
    timeout: Option<Duration>,
    properties: Properties,
    close_callbacks: Vec<CloseCallback>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("logged_in", &self.logged_in)
            .field("timeout", &self.timeout)
            .field("close_callbacks", &self.close_callbacks.len())
            .finish_non_exhaustive()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// An unconnected session using the russh transport.
    #[must_use]
    pub fn new() -> Self {
        Self::with_connector(Arc::new(RusshConnector::new()))
    }

    /// An unconnected session using `connector` for its transport.
    #[must_use]
    pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            link: Arc::new(Link::new()),
            options: SessionOptions::default(),
            host: None,
            port: PORT,
            logged_in: false,
            timeout: None,
            properties: Properties::new(),
            close_callbacks: Vec::new(),
        }
    }

    /// Build a session from `options`, connecting to `host` if given and
    /// logging in if `options.user` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if connecting or logging in fails. A failed login
    /// closes the connection again.
    pub async fn from_options(
        connector: Arc<dyn Connector>,
        host: Option<&str>,
        options: SessionOptions,
    ) -> Result<Self> {
        let mut session = Self::with_connector(connector);
        session.properties = options.properties.clone();
        session.options = options;

        let Some(host) = host else {
            return Ok(session);
        };

        let connect = ConnectOptions {
            port: session.options.port,
            timeout: session.options.timeout(),
        };
        session.connect(host, connect).await?;

        if let Some(user) = session.options.user.clone() {
            let credentials = session.options.credentials();
            if let Err(e) = session.login(&user, &credentials).await {
                session.close().await;
                return Err(e);
            }
        }
        Ok(session)
    }

    /// Connect to `host` and log in as `user` (or `options.user`).
    ///
    /// # Errors
    ///
    /// Returns an error if connecting or logging in fails.
    pub async fn start(
        connector: Arc<dyn Connector>,
        host: &str,
        user: Option<&str>,
        mut options: SessionOptions,
    ) -> Result<Self> {
        if let Some(user) = user {
            options.user = Some(user.to_string());
        }
        Self::from_options(connector, Some(host), options).await
    }

    /// Like [`start`](Self::start), but hands the session to `f` and closes
    /// it once `f` is done.
    ///
    /// # Errors
    ///
    /// Returns an error if connecting or logging in fails; errors from `f`
    /// are part of its return value.
    pub async fn start_with<F, R>(
        connector: Arc<dyn Connector>,
        host: &str,
        user: Option<&str>,
        options: SessionOptions,
        f: F,
    ) -> Result<R>
    where
        F: AsyncFnOnce(&mut Self) -> R,
    {
        let mut session = Self::start(connector, host, user, options).await?;
        let result = f(&mut session).await;
        session.close().await;
        Ok(result)
    }

    /// Run `fut` under the session timeout. Expiry is recorded as the
    /// session's last error.
    async fn bounded<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let result = match self.timeout {
            None => fut.await,
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(host = ?self.host, timeout_ms = limit.as_millis(), "Timed out waiting for {what}");
                    Err(SshError::Timeout {
                        message: format!("Timed out waiting for {what}"),
                        errno: errno::TIMEOUT,
                    })
                }
            },
        };
        result.inspect_err(|e| self.link.record(e))
    }

    /// Open the connection.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::AlreadyConnected`] if a connection exists,
    /// [`SshError::Timeout`] if the deadline expires, or the connector's
    /// error (usually [`SshError::Connect`] or [`SshError::HostKey`]).
    pub async fn connect(&mut self, host: &str, opts: impl Into<ConnectOptions>) -> Result<()> {
        if let Some(current) = &self.host {
            return Err(SshError::AlreadyConnected {
                host: current.clone(),
            });
        }
        let opts = opts.into();
        // Zero means no deadline, as for `set_timeout`
        if let Some(timeout) = opts.timeout {
            self.timeout = Some(timeout).filter(|t| !t.is_zero());
        }

        runtime::startup();
        debug!(host = %host, port = opts.port, "Connecting");

        let mut transport = self
            .bounded(
                "connection",
                self.connector.connect(host, opts.port, &self.options),
            )
            .await?;
        transport.set_blocking(self.options.block);

        self.link.install(transport).await;
        self.link.clear_error();
        self.host = Some(host.to_string());
        self.port = opts.port;
        self.logged_in = false;

        info!(host = %host, port = opts.port, "SSH connection established");
        Ok(())
    }

    /// Authenticate as `user`. Logging in again once logged in is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::NotConnected`] without a connection,
    /// [`SshError::AuthenticationFailed`] if the server rejects the
    /// credentials or [`SshError::Timeout`] if the deadline expires.
    pub async fn login(&mut self, user: &str, credentials: &Credentials) -> Result<()> {
        if self.logged_in {
            return Ok(());
        }

        let link = &self.link;
        let accepted = self
            .bounded("authentication", async {
                let mut transport = link.transport().await?;
                transport.authenticate(user, credentials).await
            })
            .await?;

        if !accepted {
            let transport = self.link.transport().await?;
            let err = SshError::AuthenticationFailed {
                user: user.to_string(),
                message: transport
                    .last_error()
                    .unwrap_or_else(|| "Authentication failed".to_string()),
                errno: match transport.last_errno() {
                    errno::NONE => errno::AUTHENTICATION_FAILED,
                    code => code,
                },
            };
            drop(transport);
            self.link.record(&err);
            warn!(user = %user, method = credentials.method(), "SSH authentication failed");
            return Err(err);
        }

        self.logged_in = true;
        info!(user = %user, method = credentials.method(), "SSH authentication successful");
        Ok(())
    }

    /// Log in with a password.
    ///
    /// # Errors
    ///
    /// See [`login`](Self::login).
    pub async fn login_with_password(&mut self, user: &str, password: &str) -> Result<()> {
        self.login(user, &Credentials::password(password)).await
    }

    /// Log in with a private key; the public key is expected at `key` + `.pub`.
    ///
    /// # Errors
    ///
    /// See [`login`](Self::login).
    pub async fn login_with_public_key(
        &mut self,
        user: &str,
        key: impl AsRef<Path>,
        passphrase: Option<&str>,
    ) -> Result<()> {
        let credentials = Credentials::PublicKey {
            path: key.as_ref().to_path_buf(),
            passphrase: passphrase.map(|p| Zeroizing::new(p.to_string())),
        };
        self.login(user, &credentials).await
    }

    /// Log in without ever prompting; a missing password means an empty one.
    ///
    /// # Errors
    ///
    /// See [`login`](Self::login).
    pub async fn login_without_password_prompt(
        &mut self,
        user: &str,
        password: Option<&str>,
    ) -> Result<()> {
        self.login(user, &Credentials::password(password.unwrap_or_default()))
            .await
    }

    /// Authentication methods the server offers for `user`. Empty when the
    /// server will not say, e.g. because the session is already logged in.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::NotConnected`] without a connection.
    pub async fn userauth_methods(&mut self, user: &str) -> Result<Vec<String>> {
        let link = &self.link;
        let methods = self
            .bounded("authentication methods", async {
                let mut transport = link.transport().await?;
                transport.userauth_list(user).await
            })
            .await?;
        Ok(methods.unwrap_or_default())
    }

    /// # Errors
    ///
    /// Returns [`SshError::NotConnected`] without a connection.
    pub async fn userauth_method_supported(&mut self, user: &str, method: &str) -> Result<bool> {
        Ok(self
            .userauth_methods(user)
            .await?
            .iter()
            .any(|m| m == method))
    }

    /// Host key fingerprint of the connected server (`SHA256:...`).
    ///
    /// # Errors
    ///
    /// Returns [`SshError::NotConnected`] without a connection.
    pub async fn fingerprint(&self) -> Result<String> {
        let transport = self.link.transport().await?;
        transport.fingerprint().ok_or_else(|| SshError::HostKey {
            host: self.host.clone().unwrap_or_default(),
            reason: "no host key available".to_string(),
        })
    }

    /// Message of the last transport failure
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.link.last_error().map(|(message, _)| message)
    }

    /// Code of the last transport failure, 0 if there was none
    #[must_use]
    pub fn last_errno(&self) -> i32 {
        self.link.last_error().map_or(errno::NONE, |(_, code)| code)
    }

    /// Deadline for connect and login operations; zero means none.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or_default()
    }

    /// Set the deadline for connect and login operations; zero removes it.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::NotConnected`] without a connection.
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        if self.host.is_none() {
            return Err(SshError::NotConnected);
        }
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        Ok(())
    }

    #[must_use]
    pub const fn is_blocking(&self) -> bool {
        self.options.block
    }

    /// Switch the transport between blocking and non-blocking mode. Without
    /// a connection the mode applies to the next one.
    ///
    /// # Errors
    ///
    /// Currently infallible; reserved for transports that refuse the switch.
    pub async fn set_blocking(&mut self, blocking: bool) -> Result<()> {
        self.options.block = blocking;
        if let Ok(mut transport) = self.link.transport().await {
            transport.set_blocking(blocking);
        }
        Ok(())
    }

    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.host.is_some()
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        !self.is_connected()
    }

    #[must_use]
    pub const fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    /// Host given to [`connect`](Self::connect), while connected
    #[must_use]
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.properties.get(key)
    }

    /// Set a property, returning the previous value.
    pub fn set(
        &mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Option<serde_json::Value> {
        self.properties.insert(key.into(), value.into())
    }

    #[must_use]
    pub const fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Register a callback run by [`close`](Self::close), in registration order.
    pub fn on_close<F, Fut>(&mut self, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.close_callbacks
            .push(Box::new(move || Box::pin(callback()) as CloseFuture));
    }

    /// Run the close callbacks, then drop the connection.
    ///
    /// A failing or panicking callback is logged and skipped; the remaining
    /// callbacks and the disconnect still happen. Closing a closed session
    /// does nothing.
    pub async fn close(&mut self) {
        let callbacks = std::mem::take(&mut self.close_callbacks);
        for (index, callback) in callbacks.into_iter().enumerate() {
            match tokio::spawn(async move { callback().await }).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(callback = index, error = %e, "Close callback failed"),
                Err(e) => warn!(callback = index, error = %e, "Close callback panicked"),
            }
        }

        if let Some(mut transport) = self.link.remove().await {
            if let Err(e) = transport.disconnect("Normal Shutdown").await {
                debug!(host = ?self.host, error = %e, "Disconnect failed");
            }
            info!(host = ?self.host, "SSH session closed");
        }

        self.host = None;
        self.logged_in = false;
        self.properties.clear();
    }

    /// A closed channel of this session.
    #[must_use]
    pub fn channel(&self, params: ChannelParams) -> Channel {
        Channel::new(Arc::clone(&self.link), params)
    }

    /// Open a channel.
    ///
    /// # Errors
    ///
    /// See [`Channel::open`].
    pub async fn open_channel(
        &self,
        params: ChannelParams,
        message: Option<&[u8]>,
    ) -> Result<Channel> {
        let channel = self.channel(params);
        channel.open(message).await?;
        Ok(channel)
    }

    /// Open a channel, hand it to `f` and close it once `f` is done.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel cannot be opened or closed; errors
    /// from `f` are part of its return value.
    pub async fn open_channel_with<F, R>(
        &self,
        params: ChannelParams,
        message: Option<&[u8]>,
        f: F,
    ) -> Result<R>
    where
        F: AsyncFnOnce(&Channel) -> R,
    {
        let channel = self.open_channel(params, message).await?;
        let result = f(&channel).await;
        channel.close(false).await?;
        Ok(result)
    }

    /// Run `command` on a fresh `session` channel and return its stdout.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel cannot be opened or the transport fails.
    pub async fn exec(&self, command: &str, opts: ExecOptions) -> Result<Option<String>> {
        let channel = self.open_channel(ChannelParams::default(), None).await?;
        channel.exec_and_close(command, opts, false).await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(host) = &self.host {
            debug!(host = %host, "Session dropped without close");
        }
    }
}
