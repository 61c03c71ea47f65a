use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

use crate::doc::CanvasDoc;
use crate::error::SyncError;

const FRAME_HEADER: usize = 4;

/// On-disk replica of a canvas document: an append-only log of CRDT updates.
///
/// Each record is a little-endian `u32` length followed by one v1 update. A torn final
/// record (crash mid-append) is ignored on load.
#[derive(Debug)]
pub struct LocalReplica {
    path: PathBuf,
    synced: watch::Sender<bool>,
}

impl LocalReplica {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            path: path.into(),
            synced,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replay the log into `doc` and mark the replica synced. Returns the records applied.
    pub async fn load_into(&self, doc: &CanvasDoc) -> Result<usize, SyncError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut applied = 0;
        for record in records(&bytes) {
            match doc.apply_update(record) {
                Ok(()) => applied += 1,
                Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "skipping unreadable replica record"),
            }
        }

        tracing::debug!(path = %self.path.display(), records = applied, "local replica loaded");
        self.synced.send_replace(true);
        Ok(applied)
    }

    pub async fn append(&self, update: &[u8]) -> Result<(), SyncError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&frame(update)).await?;
        file.flush().await?;
        Ok(())
    }

    /// Rewrite the log as a single record holding the full document state
    pub async fn compact(&self, doc: &CanvasDoc) -> Result<(), SyncError> {
        let tmp = self.path.with_extension("compact");
        fs::write(&tmp, frame(&doc.encode_state())).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Whether the replica has been loaded; history checkouts wait for this
    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.synced.subscribe()
    }

    pub async fn wait_synced(&self) {
        let mut rx = self.synced.subscribe();
        let _ = rx.wait_for(|synced| *synced).await;
    }
}

fn frame(update: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER + update.len());
    out.extend_from_slice(&(update.len() as u32).to_le_bytes());
    out.extend_from_slice(update);
    out
}

fn records(bytes: &[u8]) -> Vec<&[u8]> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset + FRAME_HEADER <= bytes.len() {
        let mut header = [0u8; FRAME_HEADER];
        header.copy_from_slice(&bytes[offset..offset + FRAME_HEADER]);
        let len = u32::from_le_bytes(header) as usize;
        let start = offset + FRAME_HEADER;
        if start + len > bytes.len() {
            tracing::warn!(offset, len, "torn record at end of replica log");
            break;
        }
        out.push(&bytes[start..start + len]);
        offset = start + len;
    }
    out
}
