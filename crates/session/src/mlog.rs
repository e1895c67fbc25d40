//! Optional append-only log of session messages.
//!
//! Records are envelopes in wire format, one per message, so a
//! log replays with the ordinary decoder. Not required for
//! correctness.
use std::path::Path;
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
};
use veil_protocol::{decode_all, Envelope};

use crate::Result;

/// Append-only message history in wire format.
pub struct MessageLog {
    file: File,
}

impl MessageLog {
    /// Open a log file for appending, creating it if necessary.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .await?;
        Ok(Self { file })
    }

    /// Append one message record.
    pub async fn append(
        &mut self,
        envelope: &Envelope,
    ) -> Result<()> {
        let buffer = envelope.to_bytes().await?;
        self.file.write_all(&buffer).await?;
        self.file.flush().await?;
        Ok(())
    }

    /// Read every record of a log file.
    pub async fn read(
        path: impl AsRef<Path>,
    ) -> Result<Vec<Envelope>> {
        let buffer = tokio::fs::read(path.as_ref()).await?;
        Ok(decode_all(&buffer).await?)
    }
}
