//! Ports module - Trait definitions for the transport boundary
//!
//! The session layer only talks to the transport through these traits;
//! `ssh::client` provides the russh adapter.

mod transport;

pub use transport::{
    ChannelId, ChannelRequest, Connector, ExtendedData, PtyOptions, ReadOutcome, StreamSelector,
    Transport,
};

#[cfg(test)]
pub use transport::mock;
