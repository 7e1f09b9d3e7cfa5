//! Session-level receivers.
//!
//! Unlike the writers, readers hold no channel between calls: every receive
//! opens a fresh channel, runs `scp [-r] -p -f <path>` on it and closes it
//! when the transfer ends.

use crate::config::ScpConfig;
use crate::error::{Result, ScpError};
use crate::scp::materialize::{set_mode, set_times, Materializer, ReceiveStats};
use crate::scp::protocol::{join_remote, source_command};
use crate::scp::receiver::{ReceiveLoop, TransferEvent};
use crate::scp::sender::remote_name_of;
use crate::scp::{ProgressFn, TransferOptions};
use crate::transport::Session;
use bytes::Bytes;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

async fn open_loop<S: Session>(
    session: &S,
    remote_path: &str,
    recursive: bool,
    config: &ScpConfig,
) -> Result<ReceiveLoop<S::Channel>> {
    config.validate()?;
    let command = source_command(&config.remote_command, remote_path, recursive);
    let channel = session.open_channel(config.timeout()).await?;
    ReceiveLoop::start(channel, &command, config).await
}

/// Receives single files from one remote directory.
pub struct ScpReader<S: Session> {
    session: S,
    remote_path: String,
    config: ScpConfig,
}

impl<S: Session> ScpReader<S> {
    pub fn new(session: S, remote_path: impl Into<String>, config: ScpConfig) -> Self {
        Self {
            session,
            remote_path: remote_path.into(),
            config,
        }
    }

    /// Start a flat receive and hand back the raw event loop.
    pub async fn events(&self, remote_filename: &str) -> Result<ReceiveLoop<S::Channel>> {
        let path = join_remote(&self.remote_path, remote_filename);
        open_loop(&self.session, &path, false, &self.config).await
    }

    /// Receive one file to `local`. The remote name defaults to its base name.
    pub async fn receive_file(
        &self,
        local: &Path,
        remote_filename: Option<&str>,
        options: &TransferOptions,
        mut progress: Option<&mut ProgressFn<'_>>,
    ) -> Result<u64> {
        let name = match remote_filename {
            Some(name) => name.to_string(),
            None => remote_name_of(local)?,
        };
        let mut rx = self.events(&name).await?;

        let result = async {
            let (file, written) = match rx.next_event().await? {
                Some(TransferEvent::FileAvailable { file, mut body }) => {
                    let label = file.path.to_string_lossy().into_owned();
                    let mut out = tokio::fs::File::create(local).await?;
                    let written = body
                        .copy_to(&mut out, |n| {
                            if let Some(cb) = progress.as_mut() {
                                cb(&label, file.size, n);
                            }
                        })
                        .await?;
                    out.flush().await?;
                    (file, written)
                }
                Some(other) => {
                    return Err(ScpError::Internal(format!(
                        "expected a file from a flat receive, got {:?}",
                        other
                    )))
                }
                None => return Err(ScpError::protocol("remote closed without sending a file")),
            };

            set_mode(local, options.override_mode.unwrap_or(file.mode)).await?;
            if options.preserve_times {
                if let Some(times) = file.times {
                    set_times(local, times).await?;
                }
            }
            Ok(written)
        }
        .await;

        finish(&mut rx, result).await
    }

    /// Receive one file into memory.
    pub async fn receive(
        &self,
        remote_filename: &str,
        mut progress: Option<&mut ProgressFn<'_>>,
    ) -> Result<Bytes> {
        let mut rx = self.events(remote_filename).await?;

        let result = async {
            match rx.next_event().await? {
                Some(TransferEvent::FileAvailable { file, mut body }) => {
                    let label = file.path.to_string_lossy().into_owned();
                    let mut out = Vec::with_capacity(file.size.min(1 << 20) as usize);
                    body.copy_to(&mut out, |n| {
                        if let Some(cb) = progress.as_mut() {
                            cb(&label, file.size, n);
                        }
                    })
                    .await?;
                    Ok(Bytes::from(out))
                }
                Some(other) => Err(ScpError::Internal(format!(
                    "expected a file from a flat receive, got {:?}",
                    other
                ))),
                None => Err(ScpError::protocol("remote closed without sending a file")),
            }
        }
        .await;

        finish(&mut rx, result).await
    }
}

/// Wind down a flat receive. Only the first file is taken.
async fn finish<C, T>(rx: &mut ReceiveLoop<C>, result: Result<T>) -> Result<T>
where
    C: crate::transport::Channel,
{
    if result.is_err() {
        if let Err(e) = rx.close().await {
            warn!("Failed to close channel: {}", e);
        }
        return result;
    }

    // Acknowledge the body so the remote can exit cleanly
    match rx.next_event().await {
        Ok(None) => {}
        Ok(Some(event)) => {
            warn!("Ignoring extra {:?} after flat receive", event);
            drop(event);
            rx.close().await?;
        }
        Err(e) => return Err(e),
    }
    result
}

/// Receives whole trees from one remote directory.
pub struct ScpDirReader<S: Session> {
    session: S,
    remote_path: String,
    config: ScpConfig,
}

impl<S: Session> ScpDirReader<S> {
    pub fn new(session: S, remote_path: impl Into<String>, config: ScpConfig) -> Self {
        Self {
            session,
            remote_path: remote_path.into(),
            config,
        }
    }

    pub async fn events(&self, remote_dirname: &str) -> Result<ReceiveLoop<S::Channel>> {
        let path = join_remote(&self.remote_path, remote_dirname);
        open_loop(&self.session, &path, true, &self.config).await
    }

    /// Receive `remote_dirname` (relative to the reader's path) under
    /// `local_dir`, which must already exist.
    pub async fn receive_dir(
        &self,
        local_dir: &Path,
        remote_dirname: &str,
        options: &TransferOptions,
        progress: Option<&mut ProgressFn<'_>>,
    ) -> Result<ReceiveStats> {
        let mut materializer = Materializer::new(local_dir, *options).await?;
        let mut rx = self.events(remote_dirname).await?;
        let stats = materializer.run(&mut rx, progress).await?;
        info!(
            "Received {} files ({} bytes) into {}",
            stats.files,
            stats.bytes,
            local_dir.display()
        );
        Ok(stats)
    }
}
