mod channel;
mod client;
mod connector;
mod io;
pub mod known_hosts;
mod retry;
mod session;
mod stream;

pub use channel::{
    Capture, Channel, ChannelParams, ExecOptions, PACKET_DEFAULT, Popen, WINDOW_DEFAULT,
};
pub use client::{RusshTransport, direct_tcpip_message};
pub use connector::RusshConnector;
pub use io::{GetsOptions, RemoteIo, Separator};
pub use known_hosts::{VerifyResult, verify_host_key};
pub use retry::{RetryConfig, is_retryable_error, with_retry_if};
pub use session::{ConnectOptions, Session};
pub use stream::Stream;
