//! Channel capability consumed by the scp core.
//!
//! A [`Session`] opens one [`Channel`] per remote command invocation. The
//! scp core never authenticates or multiplexes; it only needs a duplex byte
//! stream with a receive timeout.

pub mod process;

pub use process::{ProcessChannel, ProcessSession, SshTarget};

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Duplex byte stream bound to a single remote command.
#[async_trait]
pub trait Channel: Send {
    /// Start the remote command. Called once, before any I/O.
    async fn exec(&mut self, command: &str) -> Result<()>;

    /// Write all bytes. Fails with `ScpError::Io` on write failure.
    async fn send_all(&mut self, data: &[u8]) -> Result<()>;

    /// Receive up to `max` bytes.
    ///
    /// Returns empty bytes on clean remote close and `ScpError::Timeout`
    /// when the receive deadline passes.
    async fn recv(&mut self, max: usize) -> Result<Bytes>;

    fn set_timeout(&mut self, timeout: Option<Duration>);

    /// Idempotent.
    async fn close(&mut self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

#[async_trait]
impl<C: Channel + ?Sized> Channel for Box<C> {
    async fn exec(&mut self, command: &str) -> Result<()> {
        (**self).exec(command).await
    }

    async fn send_all(&mut self, data: &[u8]) -> Result<()> {
        (**self).send_all(data).await
    }

    async fn recv(&mut self, max: usize) -> Result<Bytes> {
        (**self).recv(max).await
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) {
        (**self).set_timeout(timeout)
    }

    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }
}

/// Source of fresh channels, e.g. an authenticated SSH connection.
#[async_trait]
pub trait Session: Send + Sync {
    type Channel: Channel;

    async fn open_channel(&self, timeout: Option<Duration>) -> Result<Self::Channel>;
}
