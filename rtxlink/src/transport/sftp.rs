//! Bulk file fetch over the SFTP subsystem.

use log::debug;
use russh_sftp::client::SftpSession;
use tokio::io::AsyncReadExt;

use super::ssh::SshTransport;
use crate::error::{Error, Result};

/// Fetch a remote file in one bulk read.
///
/// Opens a fresh SFTP channel on the given transport, reads the file
/// to completion and closes the channel. RTX stores configuration as
/// small text files, so no streaming or range reads are needed.
pub async fn fetch_file(transport: &SshTransport, path: &str) -> Result<Vec<u8>> {
    let channel = transport.open_sftp_channel().await?;

    let sftp = SftpSession::new(channel.into_stream())
        .await
        .map_err(|e| Error::BulkTransfer(format!("sftp handshake: {e}")))?;

    let mut file = sftp
        .open(path)
        .await
        .map_err(|e| Error::BulkTransfer(format!("open {path}: {e}")))?;

    let mut contents = Vec::new();
    file.read_to_end(&mut contents)
        .await
        .map_err(|e| Error::BulkTransfer(format!("read {path}: {e}")))?;

    debug!("fetched {} bytes from {}", contents.len(), path);

    sftp.close().await.ok();
    Ok(contents)
}
