//! Write sink for incoming installers: temp file first, promoted only once verified.

use std::io;
use std::path::PathBuf;

use peer_upgrade_core::{short_hash, InstallerDescriptor, PackageInfo};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;

use super::{remove_if_exists, InstallerStore};
use crate::error::{Error, Result};

/// What the caller expects to receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub hash: String,
    /// Metadata advertised by the sender, handed to the validator.
    pub declared: Option<PackageInfo>,
}

impl WriteRequest {
    pub fn new(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            declared: None,
        }
    }

    pub fn with_declared(mut self, info: PackageInfo) -> Self {
        self.declared = Some(info);
        self
    }
}

impl From<&InstallerDescriptor> for WriteRequest {
    fn from(installer: &InstallerDescriptor) -> Self {
        Self::new(installer.hash.clone()).with_declared(installer.package_info())
    }
}

/// Returned by [`InstallerStore::create_write_stream`]. Bytes land in the temp
/// area; `finish` verifies and promotes them. Dropping an unfinished writer
/// deletes its temp file.
pub struct InstallerWriter {
    store: InstallerStore,
    request: WriteRequest,
    tmp_path: PathBuf,
    file: Option<BufWriter<File>>,
    written: u64,
    settled: bool,
}

impl InstallerWriter {
    pub(super) fn new(
        store: InstallerStore,
        request: WriteRequest,
        tmp_path: PathBuf,
        file: File,
    ) -> Self {
        Self {
            store,
            request,
            tmp_path,
            file: Some(BufWriter::new(file)),
            written: 0,
            settled: false,
        }
    }

    pub fn hash(&self) -> &str {
        &self.request.hash
    }

    /// Bytes accepted so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Append a chunk. A write that would take the installer past its
    /// declared size fails and discards everything received so far.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let incoming = self.written + chunk.len() as u64;
        if let Some(declared) = &self.request.declared {
            if incoming > declared.size {
                let limit = declared.size;
                self.discard().await;
                return Err(Error::InvalidInstaller(format!(
                    "sender exceeded the declared {limit} bytes"
                )));
            }
        }
        let Some(file) = self.file.as_mut() else {
            return Err(closed());
        };
        if let Err(e) = file.write_all(chunk).await {
            self.discard().await;
            return Err(e.into());
        }
        self.written = incoming;
        Ok(())
    }

    /// Verify the received bytes against the declared hash, validate the
    /// package, and promote it. On any failure the temp file is gone.
    pub async fn finish(mut self) -> Result<InstallerDescriptor> {
        let result = self.complete().await;
        match &result {
            Ok(installer) => {
                debug!(installer = %installer, bytes = self.written, "write complete");
                self.settled = true;
            }
            Err(e) => {
                debug!(hash = short_hash(&self.request.hash), error = %e, "write rejected");
                self.discard().await;
            }
        }
        result
    }

    async fn complete(&mut self) -> Result<InstallerDescriptor> {
        let mut file = self.file.take().ok_or_else(closed)?;
        file.flush().await?;
        file.get_mut().sync_all().await?;
        drop(file);
        let info = self
            .store
            .verify_file(
                self.tmp_path.clone(),
                self.request.hash.clone(),
                self.request.declared.clone(),
            )
            .await?;
        self.store
            .promote(&self.request.hash, info, &self.tmp_path)
            .await
    }

    async fn discard(&mut self) {
        self.file = None;
        self.settled = true;
        if let Err(e) = remove_if_exists(&self.tmp_path).await {
            debug!(path = %self.tmp_path.display(), error = %e, "failed to remove temp file");
        }
    }
}

impl Drop for InstallerWriter {
    fn drop(&mut self) {
        if !self.settled {
            self.file = None;
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}

fn closed() -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::BrokenPipe,
        "installer writer already closed",
    ))
}
