//! Streams over a channel's data flows
//!
//! A [`Stream`] reads and writes one selector of a channel (stdout or
//! stderr) and gets the line-oriented helpers of [`RemoteIo`] on top.

use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::error::{Result, SshError};
use crate::ports::{ReadOutcome, StreamSelector};

use super::channel::{Channel, ChannelInner};
use super::io::{GetsOptions, RemoteIo, Separator, chomp, take_record};

/// Bytes asked for per transport read when no limit applies
const READ_CHUNK: usize = 16 * 1024;

/// Read/write view over one data flow of a [`Channel`].
///
/// A stream does not keep its channel alive. Once the channel is dropped,
/// every operation fails with [`SshError::ChannelClosed`]; bytes already
/// read ahead stay readable after the remote side sent EOF.
#[derive(Debug)]
pub struct Stream {
    channel: Weak<ChannelInner>,
    selector: StreamSelector,
    buf: Vec<u8>,
}

impl Stream {
    /// Bind a stream to `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::ChannelClosed`] if the channel is not open.
    pub fn new(channel: &Channel, selector: StreamSelector) -> Result<Self> {
        if !channel.is_open() {
            return Err(SshError::ChannelClosed);
        }
        Ok(Self {
            channel: channel.downgrade(),
            selector,
            buf: Vec::new(),
        })
    }

    #[must_use]
    pub const fn selector(&self) -> StreamSelector {
        self.selector
    }

    /// The channel this stream reads from, if it still exists
    #[must_use]
    pub fn channel(&self) -> Option<Channel> {
        self.channel.upgrade().map(Channel::from_inner)
    }

    fn inner(&self) -> Result<Arc<ChannelInner>> {
        self.channel.upgrade().ok_or(SshError::ChannelClosed)
    }

    /// Whether the remote side has sent EOF and nothing is left to read.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::ChannelClosed`] if the channel is gone or closed.
    pub async fn eof(&self) -> Result<bool> {
        Ok(self.buf.is_empty() && self.inner()?.eof().await?)
    }

    /// Send EOF on the channel; with `wait_for_eof`, wait for the remote EOF too.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::ChannelClosed`] if the channel is gone or closed.
    pub async fn send_eof(&mut self, wait_for_eof: bool) -> Result<()> {
        self.inner()?.send_eof(wait_for_eof).await
    }

    /// Flush transport buffers for this stream and drop anything read ahead.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::ChannelClosed`] if the channel is gone or closed.
    pub async fn flush(&mut self) -> Result<()> {
        self.inner()?.flush(self.selector).await?;
        self.buf.clear();
        Ok(())
    }
}

#[async_trait]
impl RemoteIo for Stream {
    async fn gets_bytes(&mut self, sep: Separator, opts: GetsOptions) -> Result<Option<Vec<u8>>> {
        sep.validate()?;

        let mut eof = false;
        let record = loop {
            if let Some(record) = take_record(&mut self.buf, &sep, eof) {
                break Some(record);
            }
            if eof {
                break None;
            }

            let inner = self.inner()?;
            match inner.read(self.selector, sep.wanted(self.buf.len(), READ_CHUNK)).await? {
                ReadOutcome::Data(data) => self.buf.extend(data),
                ReadOutcome::Eof => eof = true,
                ReadOutcome::WouldBlock => inner.wait_socket().await?,
            }
        };

        let Some(mut record) = record.filter(|r| !r.is_empty()) else {
            return Ok(None);
        };
        if opts.chomp {
            chomp(&mut record, &sep);
        }
        Ok(Some(record))
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let inner = self.inner()?;
        inner.write(self.selector, data).await
    }

    /// Sends EOF and waits for the remote EOF.
    async fn close(&mut self) -> Result<()> {
        self.send_eof(true).await
    }
}
