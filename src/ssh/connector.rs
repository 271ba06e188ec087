//! SSH Connector Adapter
//!
//! Concrete implementation of the [`Connector`] port using the russh SSH
//! client.

use async_trait::async_trait;

use crate::config::SessionOptions;
use crate::error::Result;
use crate::ports::{Connector, Transport};

use super::client::RusshTransport;

/// Connector opening real SSH connections with russh
#[derive(Debug, Default, Clone, Copy)]
pub struct RusshConnector;

impl RusshConnector {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for RusshConnector {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        options: &SessionOptions,
    ) -> Result<Box<dyn Transport>> {
        let transport = RusshTransport::connect(host, port, options).await?;
        Ok(Box::new(transport))
    }
}
