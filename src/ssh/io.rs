//! Line- and byte-oriented I/O shared by every stream-like type.
//!
//! Implementors provide three primitives ([`RemoteIo::gets_bytes`],
//! [`RemoteIo::write`] and [`RemoteIo::close`]); everything else is built
//! on top of them.

use std::ops::ControlFlow;

use async_trait::async_trait;

use crate::error::{Result, SshError};

/// Where a read stops.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Separator {
    /// Up to and including the next `\n`
    #[default]
    Line,
    /// Up to and including the next occurrence of the delimiter
    Delimiter(Vec<u8>),
    /// Exactly this many bytes, fewer only at end of stream
    Limit(usize),
    /// Everything up to end of stream
    All,
}

impl From<usize> for Separator {
    fn from(limit: usize) -> Self {
        Self::Limit(limit)
    }
}

impl From<&str> for Separator {
    fn from(delimiter: &str) -> Self {
        if delimiter == "\n" {
            Self::Line
        } else {
            Self::Delimiter(delimiter.as_bytes().to_vec())
        }
    }
}

impl From<Option<usize>> for Separator {
    fn from(limit: Option<usize>) -> Self {
        limit.map_or(Self::All, Self::Limit)
    }
}

impl Separator {
    /// Reject separators no read could ever terminate on.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::InvalidArgument`] for an empty delimiter.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Delimiter(d) if d.is_empty() => Err(SshError::InvalidArgument(
                "separator must not be empty".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// How many more bytes to ask the transport for, given what is buffered.
    pub(crate) const fn wanted(&self, buffered: usize, chunk: usize) -> usize {
        match self {
            Self::Limit(n) if *n > buffered => *n - buffered,
            _ => chunk,
        }
    }
}

/// Options understood by every `gets`-style read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GetsOptions {
    /// Strip one trailing separator from each record
    pub chomp: bool,
}

impl GetsOptions {
    pub const CHOMP: Self = Self { chomp: true };
}

/// Split the next complete record off the front of `buf`.
///
/// With `eof` set, whatever remains counts as the final record. Returns
/// `None` when more data is needed, or at end of stream when `buf` is empty.
pub(crate) fn take_record(buf: &mut Vec<u8>, sep: &Separator, eof: bool) -> Option<Vec<u8>> {
    let end = match sep {
        Separator::Line => buf.iter().position(|&b| b == b'\n').map(|pos| pos + 1),
        Separator::Delimiter(delim) => buf
            .windows(delim.len())
            .position(|window| window == delim.as_slice())
            .map(|pos| pos + delim.len()),
        Separator::Limit(n) => (buf.len() >= *n).then_some(*n),
        Separator::All => None,
    };

    match end {
        Some(end) => Some(buf.drain(..end).collect()),
        None if eof && !buf.is_empty() => Some(std::mem::take(buf)),
        None => None,
    }
}

/// Remove exactly one trailing separator from `record`.
///
/// Custom delimiters strip the delimiter; every other mode strips one line
/// terminator (`\r\n`, `\n` or `\r`).
pub(crate) fn chomp(record: &mut Vec<u8>, sep: &Separator) {
    if let Separator::Delimiter(delim) = sep {
        if record.ends_with(delim) {
            record.truncate(record.len() - delim.len());
        }
        return;
    }

    if record.ends_with(b"\r\n") {
        record.truncate(record.len() - 2);
    } else if record.ends_with(b"\n") || record.ends_with(b"\r") {
        record.truncate(record.len() - 1);
    }
}

/// Width of a UTF-8 sequence from its leading byte; invalid leads count as 1.
const fn utf8_width(lead: u8) -> usize {
    match lead {
        0xC2..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF4 => 4,
        _ => 1,
    }
}

/// Line- and byte-oriented operations over a remote data stream.
#[async_trait]
pub trait RemoteIo: Send {
    /// Read the next record; `None` at end of stream.
    async fn gets_bytes(&mut self, sep: Separator, opts: GetsOptions) -> Result<Option<Vec<u8>>>;

    /// Write `data`, returning the number of bytes written.
    async fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Release the underlying resource.
    async fn close(&mut self) -> Result<()>;

    /// [`gets_bytes`](Self::gets_bytes) decoded as (lossy) UTF-8.
    async fn gets(&mut self, sep: Separator, opts: GetsOptions) -> Result<Option<String>> {
        Ok(self
            .gets_bytes(sep, opts)
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Feed each line to `f` until the stream ends or `f` breaks, then close
    /// the stream. The stream is closed on every path, including errors.
    async fn each_line<F>(&mut self, sep: Separator, opts: GetsOptions, mut f: F) -> Result<()>
    where
        F: FnMut(String) -> ControlFlow<()> + Send,
    {
        let result = async {
            sep.validate()?;
            while let Some(line) = self.gets(sep.clone(), opts).await? {
                if f(line).is_break() {
                    break;
                }
            }
            Ok::<(), SshError>(())
        }
        .await;

        let closed = self.close().await;
        result.and(closed)
    }

    /// Read one character, `None` at end of stream.
    async fn getc(&mut self) -> Result<Option<String>> {
        let Some(mut bytes) = self.gets_bytes(Separator::Limit(1), GetsOptions::default()).await?
        else {
            return Ok(None);
        };

        let width = bytes.first().copied().map_or(1, utf8_width);
        if width > 1
            && let Some(rest) = self
                .gets_bytes(Separator::Limit(width - 1), GetsOptions::default())
                .await?
        {
            bytes.extend(rest);
        }
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Read `limit` bytes, or everything up to end of stream without a limit.
    /// Returns fewer bytes than asked for only at end of stream.
    async fn read(&mut self, limit: Option<usize>) -> Result<Vec<u8>> {
        if limit == Some(0) {
            return Ok(Vec::new());
        }
        Ok(self
            .gets_bytes(Separator::from(limit), GetsOptions::default())
            .await?
            .unwrap_or_default())
    }

    /// Like [`gets`](Self::gets) but end of stream is an error.
    ///
    /// # Errors
    ///
    /// Returns [`SshError::Eof`] if the stream is already exhausted.
    async fn readline(&mut self, sep: Separator, opts: GetsOptions) -> Result<String> {
        self.gets(sep, opts).await?.ok_or(SshError::Eof)
    }

    async fn readlines(&mut self, sep: Separator, opts: GetsOptions) -> Result<Vec<String>> {
        sep.validate()?;
        let mut lines = Vec::new();
        while let Some(line) = self.gets(sep.clone(), opts).await? {
            lines.push(line);
        }
        Ok(lines)
    }

    /// Write each item with no separator in between.
    async fn print<S>(&mut self, items: &[S]) -> Result<()>
    where
        S: AsRef<str> + Sync,
    {
        for item in items {
            self.write(item.as_ref().as_bytes()).await?;
        }
        Ok(())
    }

    /// Write each item followed by a newline, unless it already ends with
    /// one. No items writes nothing.
    async fn puts<S>(&mut self, items: &[S]) -> Result<()>
    where
        S: AsRef<str> + Sync,
    {
        for item in items {
            let item = item.as_ref();
            if item.ends_with('\n') {
                self.write(item.as_bytes()).await?;
            } else {
                self.write(format!("{item}\n").as_bytes()).await?;
            }
        }
        Ok(())
    }

    /// Write `data` and hand the stream back for chaining.
    async fn push<D>(&mut self, data: D) -> Result<&mut Self>
    where
        D: AsRef<[u8]> + Send,
    {
        self.write(data.as_ref()).await?;
        Ok(self)
    }
}
