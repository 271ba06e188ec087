use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Config, Handle, Handler, KeyboardInteractiveAuthResponse};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PublicKey, load_secret_key};
use russh::{ChannelMsg, MethodKind, Pty};
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::config::{Credentials, HostKeyVerification, SessionOptions};
use crate::error::{Result, SshError, errno};
use crate::ports::{ChannelId, ChannelRequest, ExtendedData, ReadOutcome, StreamSelector, Transport};
use crate::ssh::known_hosts;

use super::channel::{PACKET_DEFAULT, WINDOW_DEFAULT};

/// Extended data type code for stderr
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// How long a non-blocking caller waits before polling again
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Keep transport error text short enough to log and hand back to callers.
fn sanitize_ssh_error(error: &impl std::fmt::Display) -> String {
    let msg = error.to_string();
    match msg.char_indices().nth(500) {
        Some((cut, _)) => format!("{}... (truncated)", &msg[..cut]),
        None => msg,
    }
}

/// Build the `direct-tcpip` open message: where to connect and who asks.
#[must_use]
pub fn direct_tcpip_message(
    host: &str,
    port: u32,
    originator: &str,
    originator_port: u32,
) -> Vec<u8> {
    let mut message = Vec::with_capacity(host.len() + originator.len() + 16);
    for (text, number) in [(host, port), (originator, originator_port)] {
        let len = u32::try_from(text.len()).unwrap_or(u32::MAX);
        message.extend_from_slice(&len.to_be_bytes());
        message.extend_from_slice(text.as_bytes());
        message.extend_from_slice(&number.to_be_bytes());
    }
    message
}

fn decode_direct_tcpip(message: &[u8]) -> Result<(String, u32, String, u32)> {
    fn take<'a>(input: &mut &'a [u8], n: usize) -> Option<&'a [u8]> {
        if input.len() < n {
            return None;
        }
        let (head, tail) = input.split_at(n);
        *input = tail;
        Some(head)
    }

    fn take_u32(input: &mut &[u8]) -> Option<u32> {
        take(input, 4)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_be_bytes)
    }

    fn take_string(input: &mut &[u8]) -> Option<String> {
        let len = usize::try_from(take_u32(input)?).ok()?;
        take(input, len).map(|b| String::from_utf8_lossy(b).into_owned())
    }

    let mut input = message;
    let decoded = (|| {
        let host = take_string(&mut input)?;
        let port = take_u32(&mut input)?;
        let originator = take_string(&mut input)?;
        let originator_port = take_u32(&mut input)?;
        Some((host, port, originator, originator_port))
    })();

    decoded.ok_or_else(|| {
        SshError::InvalidArgument("malformed direct-tcpip open message".to_string())
    })
}

fn method_name(kind: &MethodKind) -> &'static str {
    match kind {
        MethodKind::None => "none",
        MethodKind::Password => "password",
        MethodKind::PublicKey => "publickey",
        MethodKind::HostBased => "hostbased",
        MethodKind::KeyboardInteractive => "keyboard-interactive",
    }
}

/// What the host key check saw during the handshake
#[derive(Default)]
struct HostKeyState {
    fingerprint: Option<String>,
    rejection: Option<SshError>,
}

/// SSH client handler for russh with host key verification
struct ClientHandler {
    hostname: String,
    port: u16,
    verification_mode: HostKeyVerification,
    host_key: Arc<Mutex<HostKeyState>>,
}

impl Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let verdict = known_hosts::verify_host_key(
            &self.hostname,
            self.port,
            server_public_key,
            self.verification_mode,
        );

        let mut state = self.host_key.lock().unwrap_or_else(PoisonError::into_inner);
        state.fingerprint = Some(known_hosts::fingerprint(server_public_key));
        match verdict {
            Ok(()) => Ok(true),
            Err(e) => {
                error!(host = %self.hostname, error = %e, "Host key verification failed");
                state.rejection = Some(e);
                Ok(false)
            }
        }
    }
}

enum Reply {
    Success,
    Failure,
}

/// Data and state received for one channel, waiting to be read.
#[derive(Debug, Default)]
struct Inbox {
    stdout: VecDeque<u8>,
    stderr: VecDeque<u8>,
    ext: ExtendedData,
    remote_eof: bool,
    closed: bool,
    exit_status: Option<i32>,
}

impl Inbox {
    fn absorb(&mut self, msg: ChannelMsg) -> Option<Reply> {
        match msg {
            ChannelMsg::Data { data } => self.stdout.extend(&data[..]),
            ChannelMsg::ExtendedData { data, ext } if ext == SSH_EXTENDED_DATA_STDERR => {
                match self.ext {
                    ExtendedData::Normal => self.stderr.extend(&data[..]),
                    ExtendedData::Merge => self.stdout.extend(&data[..]),
                    ExtendedData::Ignore => {}
                }
            }
            ChannelMsg::Eof => self.remote_eof = true,
            ChannelMsg::Close => self.hangup(),
            ChannelMsg::ExitStatus { exit_status } => {
                self.exit_status = Some(i32::try_from(exit_status).unwrap_or(i32::MAX));
            }
            ChannelMsg::Success => return Some(Reply::Success),
            ChannelMsg::Failure => return Some(Reply::Failure),
            _ => {}
        }
        None
    }

    fn hangup(&mut self) {
        self.remote_eof = true;
        self.closed = true;
    }

    fn buffer(&mut self, selector: StreamSelector) -> &mut VecDeque<u8> {
        match selector {
            StreamSelector::Primary => &mut self.stdout,
            StreamSelector::Extended => &mut self.stderr,
        }
    }

    fn drained(&self) -> bool {
        self.remote_eof && self.stdout.is_empty() && self.stderr.is_empty()
    }
}

struct Slot {
    channel: russh::Channel<client::Msg>,
    inbox: Inbox,
}

impl Slot {
    /// Receive one message. `None` if nothing arrived in non-blocking mode.
    async fn pump(&mut self, blocking: bool) -> Option<Option<Reply>> {
        let msg = if blocking {
            self.channel.wait().await
        } else {
            timeout(Duration::ZERO, self.channel.wait()).await.ok()?
        };
        Some(match msg {
            Some(msg) => self.inbox.absorb(msg),
            None => {
                self.inbox.hangup();
                None
            }
        })
    }

    async fn await_reply(&mut self) -> Option<Reply> {
        while !self.inbox.closed {
            if let Some(Some(reply)) = self.pump(true).await {
                return Some(reply);
            }
        }
        None
    }
}

/// russh-backed [`Transport`]
pub struct RusshTransport {
    handle: Handle<ClientHandler>,
    host: String,
    authenticated: bool,
    channels: HashMap<ChannelId, Slot>,
    next_id: ChannelId,
    blocking: bool,
    host_key: Arc<Mutex<HostKeyState>>,
    last_error: Option<(String, i32)>,
}

impl RusshTransport {
    /// Connect and run the key exchange; authentication is left to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::HostKey`] if the host key is rejected and
    /// [`SshError::Connect`] for any other connection failure.
    pub async fn connect(host: &str, port: u16, options: &SessionOptions) -> Result<Self> {
        let config = Arc::new(Config {
            window_size: WINDOW_DEFAULT,
            maximum_packet_size: PACKET_DEFAULT,
            ..Default::default()
        });

        let host_key = Arc::new(Mutex::new(HostKeyState::default()));
        let handler = ClientHandler {
            hostname: host.to_string(),
            port,
            verification_mode: options.host_key_verification,
            host_key: Arc::clone(&host_key),
        };

        let handle = client::connect(config, (host, port), handler)
            .await
            .map_err(|e| {
                let rejected = host_key
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .rejection
                    .take();
                if let Some(rejected) = rejected {
                    return rejected;
                }
                error!(host = %host, port, error = %sanitize_ssh_error(&e), "SSH connection failed");
                SshError::Connect {
                    host: host.to_string(),
                    reason: sanitize_ssh_error(&e),
                    errno: match e {
                        russh::Error::IO(_) => errno::SOCKET_DISCONNECT,
                        _ => errno::KEX_FAILURE,
                    },
                }
            })?;

        Ok(Self {
            handle,
            host: host.to_string(),
            authenticated: false,
            channels: HashMap::new(),
            next_id: 0,
            blocking: options.block,
            host_key,
            last_error: None,
        })
    }

    fn fail(&mut self, code: i32, error: &impl std::fmt::Display) -> SshError {
        let message = sanitize_ssh_error(error);
        self.last_error = Some((message.clone(), code));
        SshError::from_errno(code, message)
    }

    fn slot(&mut self, id: ChannelId) -> Result<&mut Slot> {
        if !self.channels.contains_key(&id) {
            return Err(self.fail(errno::CHANNEL_CLOSED, &"channel is closed"));
        }
        self.channels.get_mut(&id).ok_or(SshError::ChannelClosed)
    }

    async fn auth_with_key(
        &mut self,
        user: &str,
        path: &std::path::Path,
        passphrase: Option<&str>,
    ) -> Result<bool> {
        let key_pair = load_secret_key(path, passphrase).map_err(|e| {
            self.fail(
                errno::FILE,
                &format!("Unable to load private key {}: {e}", path.display()),
            )
        })?;

        let hash_alg = self
            .handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();

        let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg);
        let result = self
            .handle
            .authenticate_publickey(user, key_with_hash)
            .await
            .map_err(|e| self.fail(errno::PUBLICKEY_UNVERIFIED, &e))?;
        Ok(result.success())
    }

    async fn auth_with_keyboard(&mut self, user: &str, response: &str) -> Result<bool> {
        let mut reply = self
            .handle
            .authenticate_keyboard_interactive_start(user, None::<String>)
            .await
            .map_err(|e| self.fail(errno::AUTHENTICATION_FAILED, &e))?;

        loop {
            match reply {
                KeyboardInteractiveAuthResponse::Success => return Ok(true),
                KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                    let answers = prompts.iter().map(|_| response.to_string()).collect();
                    reply = self
                        .handle
                        .authenticate_keyboard_interactive_respond(answers)
                        .await
                        .map_err(|e| self.fail(errno::AUTHENTICATION_FAILED, &e))?;
                }
                _ => return Ok(false),
            }
        }
    }

    #[cfg(unix)]
    async fn auth_with_agent(&mut self, user: &str) -> Result<bool> {
        use russh::keys::agent::client::AgentClient;

        let mut agent = AgentClient::connect_env().await.map_err(|e| {
            self.fail(
                errno::AUTHENTICATION_FAILED,
                &format!("SSH agent connection failed: {e}"),
            )
        })?;

        let identities = agent.request_identities().await.map_err(|e| {
            self.fail(
                errno::AUTHENTICATION_FAILED,
                &format!("Failed to get agent identities: {e}"),
            )
        })?;

        for public_key in &identities {
            let hash_alg = self
                .handle
                .best_supported_rsa_hash()
                .await
                .ok()
                .flatten()
                .flatten();

            match self
                .handle
                .authenticate_publickey_with(user, public_key.clone(), hash_alg, &mut agent)
                .await
            {
                Ok(result) if result.success() => return Ok(true),
                Ok(_) => debug!(user = %user, "Agent identity rejected by server"),
                Err(e) => debug!(user = %user, error = %sanitize_ssh_error(&e), "Agent identity failed"),
            }
        }

        warn!(host = %self.host, user = %user, identity_count = identities.len(), "No agent identity accepted");
        Ok(false)
    }

    #[cfg(not(unix))]
    async fn auth_with_agent(&mut self, _user: &str) -> Result<bool> {
        Err(self.fail(
            errno::AUTHENTICATION_FAILED,
            &"SSH agent not supported on this platform",
        ))
    }
}

#[async_trait]
impl Transport for RusshTransport {
    async fn authenticate(&mut self, user: &str, credentials: &Credentials) -> Result<bool> {
        let accepted = match credentials {
            Credentials::Password(password) => {
                let result = self
                    .handle
                    .authenticate_password(user, password.as_str())
                    .await
                    .map_err(|e| self.fail(errno::AUTHENTICATION_FAILED, &e))?;
                result.success()
            }
            Credentials::PublicKey { path, passphrase } => {
                self.auth_with_key(user, path, passphrase.as_ref().map(|p| p.as_str()))
                    .await?
            }
            Credentials::KeyboardInteractive { response } => {
                self.auth_with_keyboard(user, response).await?
            }
            Credentials::Agent => self.auth_with_agent(user).await?,
        };

        if accepted {
            self.authenticated = true;
        } else {
            self.last_error = Some((
                format!("Authentication failed ({})", credentials.method()),
                errno::AUTHENTICATION_FAILED,
            ));
        }
        Ok(accepted)
    }

    async fn userauth_list(&mut self, user: &str) -> Result<Option<Vec<String>>> {
        if self.authenticated {
            return Ok(None);
        }
        let result = self
            .handle
            .authenticate_none(user)
            .await
            .map_err(|e| self.fail(errno::PROTO, &e))?;

        match result {
            client::AuthResult::Success => {
                self.authenticated = true;
                Ok(None)
            }
            client::AuthResult::Failure {
                remaining_methods, ..
            } => Ok(Some(
                remaining_methods
                    .iter()
                    .map(|m| method_name(m).to_string())
                    .collect(),
            )),
        }
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    async fn open_channel(
        &mut self,
        kind: &str,
        window_size: u32,
        packet_size: u32,
        message: Option<&[u8]>,
    ) -> Result<ChannelId> {
        if window_size != WINDOW_DEFAULT || packet_size != PACKET_DEFAULT {
            debug!(
                channel_kind = kind,
                window_size, packet_size, "Per-channel window and packet sizes follow the connection defaults"
            );
        }

        let opened = match kind {
            "session" => self.handle.channel_open_session().await,
            "direct-tcpip" => {
                let (host, port, originator, originator_port) =
                    decode_direct_tcpip(message.unwrap_or_default())?;
                self.handle
                    .channel_open_direct_tcpip(host, port, originator, originator_port)
                    .await
            }
            other => {
                return Err(SshError::ChannelOpen {
                    kind: other.to_string(),
                    reason: "unsupported channel type".to_string(),
                    errno: errno::CHANNEL_FAILURE,
                });
            }
        };

        let channel = opened.map_err(|e| {
            let reason = sanitize_ssh_error(&e);
            self.last_error = Some((reason.clone(), errno::CHANNEL_FAILURE));
            SshError::ChannelOpen {
                kind: kind.to_string(),
                reason,
                errno: errno::CHANNEL_FAILURE,
            }
        })?;

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.channels.insert(
            id,
            Slot {
                channel,
                inbox: Inbox::default(),
            },
        );
        Ok(id)
    }

    fn handle_extended_data(&mut self, id: ChannelId, mode: ExtendedData) -> Result<()> {
        self.slot(id)?.inbox.ext = mode;
        Ok(())
    }

    async fn send_request(
        &mut self,
        id: ChannelId,
        request: ChannelRequest<'_>,
        want_reply: bool,
    ) -> Result<bool> {
        let slot = self.slot(id)?;
        let sent = match request {
            ChannelRequest::Exec(command) => slot.channel.exec(want_reply, command).await,
            ChannelRequest::Shell => slot.channel.request_shell(want_reply).await,
            ChannelRequest::Subsystem(name) => {
                slot.channel.request_subsystem(want_reply, name).await
            }
            ChannelRequest::Env { name, value } => {
                slot.channel.set_env(want_reply, name, value).await
            }
            ChannelRequest::Pty(pty) => {
                let modes: Vec<(Pty, u32)> = pty
                    .modes
                    .iter()
                    .filter_map(|&(opcode, value)| Pty::from_u8(opcode).map(|p| (p, value)))
                    .collect();
                slot.channel
                    .request_pty(
                        want_reply,
                        &pty.term,
                        pty.width,
                        pty.height,
                        pty.width_px,
                        pty.height_px,
                        &modes,
                    )
                    .await
            }
        };
        sent.map_err(|e| self.fail(errno::SOCKET_SEND, &e))?;

        if !want_reply {
            return Ok(true);
        }

        match self.slot(id)?.await_reply().await {
            Some(Reply::Success) => Ok(true),
            Some(Reply::Failure) => {
                self.last_error = Some((
                    format!("Unable to complete request for {}", request.kind()),
                    errno::CHANNEL_REQUEST_DENIED,
                ));
                Ok(false)
            }
            None => Err(self.fail(
                errno::SOCKET_DISCONNECT,
                &"channel closed before the request was answered",
            )),
        }
    }

    async fn read(
        &mut self,
        id: ChannelId,
        selector: StreamSelector,
        max_bytes: usize,
    ) -> Result<ReadOutcome> {
        let blocking = self.blocking;
        let slot = self.slot(id)?;
        loop {
            let buffer = slot.inbox.buffer(selector);
            if !buffer.is_empty() {
                let n = max_bytes.min(buffer.len());
                return Ok(ReadOutcome::Data(buffer.drain(..n).collect()));
            }
            if slot.inbox.remote_eof {
                return Ok(ReadOutcome::Eof);
            }
            if slot.pump(blocking).await.is_none() {
                return Ok(ReadOutcome::WouldBlock);
            }
        }
    }

    async fn write(
        &mut self,
        id: ChannelId,
        selector: StreamSelector,
        data: &[u8],
    ) -> Result<usize> {
        let slot = self.slot(id)?;
        let written = match selector {
            StreamSelector::Primary => slot.channel.data(data).await,
            StreamSelector::Extended => {
                slot.channel
                    .extended_data(SSH_EXTENDED_DATA_STDERR, data)
                    .await
            }
        };
        written.map_err(|e| self.fail(errno::SOCKET_SEND, &e))?;
        Ok(data.len())
    }

    // russh hands data to the session task on write; nothing is held back here.
    async fn flush(&mut self, id: ChannelId, _selector: StreamSelector) -> Result<()> {
        self.slot(id).map(|_| ())
    }

    async fn send_eof(&mut self, id: ChannelId) -> Result<()> {
        let sent = self.slot(id)?.channel.eof().await;
        sent.map_err(|e| self.fail(errno::SOCKET_SEND, &e))
    }

    async fn wait_eof(&mut self, id: ChannelId) -> Result<()> {
        let slot = self.slot(id)?;
        while !slot.inbox.remote_eof {
            slot.pump(true).await;
        }
        Ok(())
    }

    fn eof(&self, id: ChannelId) -> bool {
        self.channels.get(&id).is_some_and(|slot| slot.inbox.drained())
    }

    async fn close_channel(&mut self, id: ChannelId, wait: bool) -> Result<Option<i32>> {
        let Some(mut slot) = self.channels.remove(&id) else {
            return Ok(None);
        };

        if !slot.inbox.closed
            && let Err(e) = slot.channel.close().await
        {
            debug!(host = %self.host, channel = id, error = %sanitize_ssh_error(&e), "Channel close failed");
        }

        // Pick up an exit status that is already on its way.
        while !slot.inbox.closed {
            if slot.pump(wait).await.is_none() {
                break;
            }
        }
        Ok(slot.inbox.exit_status)
    }

    fn set_blocking(&mut self, blocking: bool) {
        self.blocking = blocking;
    }

    fn is_blocking(&self) -> bool {
        self.blocking
    }

    async fn wait_socket(&mut self) -> Result<()> {
        tokio::time::sleep(POLL_INTERVAL).await;
        Ok(())
    }

    fn fingerprint(&self) -> Option<String> {
        self.host_key
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fingerprint
            .clone()
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.as_ref().map(|(message, _)| message.clone())
    }

    fn last_errno(&self) -> i32 {
        self.last_error.as_ref().map_or(errno::NONE, |(_, code)| *code)
    }

    async fn disconnect(&mut self, description: &str) -> Result<()> {
        self.channels.clear();
        match timeout(
            Duration::from_secs(5),
            self.handle
                .disconnect(russh::Disconnect::ByApplication, description, "en"),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.fail(errno::SOCKET_DISCONNECT, &e)),
            Err(_) => {
                warn!(host = %self.host, "Timeout closing SSH connection, forcing drop");
                Ok(())
            }
        }
    }
}
