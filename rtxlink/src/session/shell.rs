//! Shell and connector seams over the SSH transport.
//!
//! `Shell` is the minimal surface a session needs from an interactive
//! channel, and `Connector` is the factory the pool calls to open one.
//! Both are trait objects so the pool and executor can be exercised
//! against scripted in-memory shells.

use async_trait::async_trait;
use bytes::Bytes;
use log::trace;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};

use crate::error::{Result, TransportError};
use crate::transport::{SshTransport, TargetConfig, fetch_file};

/// An open interactive shell on a router.
#[async_trait]
pub trait Shell: Send {
    /// Write raw bytes to the shell.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive the next chunk of output. `Ok(None)` means the channel
    /// closed.
    async fn recv(&mut self) -> Result<Option<Bytes>>;

    /// Close the channel and the underlying connection.
    async fn close(&mut self) -> Result<()>;
}

/// Factory for shells and bulk reads against one target.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Dial the target and open an interactive shell.
    async fn open_shell(&self, config: &TargetConfig) -> Result<Box<dyn Shell>>;

    /// Fetch a remote file over the bulk channel.
    async fn fetch_file(&self, config: &TargetConfig, path: &str) -> Result<Vec<u8>>;
}

/// Production connector: one SSH connection per shell.
///
/// RTX counts each SSH connection against its login ceiling, so
/// sessions do not share a transport.
pub struct SshConnector;

#[async_trait]
impl Connector for SshConnector {
    async fn open_shell(&self, config: &TargetConfig) -> Result<Box<dyn Shell>> {
        let transport = SshTransport::connect(config).await?;
        let channel = transport.open_shell_channel().await?;
        Ok(Box::new(ShellChannel {
            transport: Some(transport),
            channel,
        }))
    }

    async fn fetch_file(&self, config: &TargetConfig, path: &str) -> Result<Vec<u8>> {
        let transport = SshTransport::connect(config).await?;
        let contents = fetch_file(&transport, path).await;
        transport.close().await.ok();
        contents
    }
}

/// A live PTY channel plus the connection that carries it.
struct ShellChannel {
    /// Kept so the connection outlives the channel; taken on close.
    transport: Option<SshTransport>,
    channel: Channel<Msg>,
}

#[async_trait]
impl Shell for ShellChannel {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.channel.data(data).await.map_err(|_| {
            crate::error::Error::Transport(TransportError::Disconnected)
        })?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Bytes>> {
        // Skip non-data messages (window adjust, exit status) until a
        // data chunk or channel teardown arrives.
        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    return Ok(Some(Bytes::copy_from_slice(&data)));
                }
                Some(ChannelMsg::ExtendedData { data, .. }) => {
                    return Ok(Some(Bytes::copy_from_slice(&data)));
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => return Ok(None),
                Some(other) => trace!("ignoring channel message: {other:?}"),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.channel.eof().await.ok();
        self.channel.close().await.ok();
        if let Some(transport) = self.transport.take() {
            transport.close().await?;
        }
        Ok(())
    }
}
