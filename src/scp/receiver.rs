//! Inbound transfers.
//!
//! [`ReceiveLoop`] is a pull-driven state machine bound to one channel.
//! Each call to [`ReceiveLoop::next_event`] sends a readiness byte, reads one
//! control record and turns it into a [`TransferEvent`]. File bodies are
//! exposed lazily through [`FileBody`], which borrows the loop: the body
//! shares the channel with control records, so it must be drained before
//! the next record can be requested.

use crate::config::ScpConfig;
use crate::error::{Result, ScpError};
use crate::scp::ack::recv;
use crate::scp::protocol::{ControlRecord, FileTimes, ACK, TAG_ACK};
use crate::transport::Channel;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// An open remote directory.
///
/// Times are the ones announced before the `D` record; they are reported
/// again when the directory is popped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirFrame {
    pub path: PathBuf,
    pub mode: u32,
    pub times: Option<FileTimes>,
}

/// Metadata of a file announced by a `C` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingFile {
    /// Relative path, joined with the enclosing directories
    pub path: PathBuf,
    pub mode: u32,
    pub size: u64,
    pub times: Option<FileTimes>,
}

pub enum TransferEvent<'a, C: Channel> {
    FileAvailable {
        file: IncomingFile,
        body: FileBody<'a, C>,
    },
    DirEntered {
        path: PathBuf,
        mode: u32,
    },
    /// Carries the frame captured when the directory was entered
    DirExited(DirFrame),
}

impl<C: Channel> std::fmt::Debug for TransferEvent<'_, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferEvent::FileAvailable { file, .. } => {
                f.debug_struct("FileAvailable").field("file", file).finish()
            }
            TransferEvent::DirEntered { path, mode } => f
                .debug_struct("DirEntered")
                .field("path", path)
                .field("mode", &format_args!("{:o}", mode))
                .finish(),
            TransferEvent::DirExited(frame) => f.debug_tuple("DirExited").field(frame).finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyState {
    Idle,
    /// Body bytes still on the wire
    Streaming { remaining: u64 },
    /// All body bytes read, end marker pending
    AwaitingEnd,
}

pub struct ReceiveLoop<C: Channel> {
    channel: C,
    buffer_size: usize,
    record_buffer_size: usize,
    pending_times: Option<FileTimes>,
    dir_stack: Vec<DirFrame>,
    body: BodyState,
    finished: bool,
}

impl<C: Channel> ReceiveLoop<C> {
    /// Start `command` on `channel` and bind a loop to it.
    pub async fn start(mut channel: C, command: &str, config: &ScpConfig) -> Result<Self> {
        info!("Starting scp source: {}", command);
        if let Err(e) = channel.exec(command).await {
            close_quietly(&mut channel).await;
            return Err(e);
        }
        Ok(Self::from_started(channel, config))
    }

    /// Bind to a channel whose remote command is already running.
    pub fn from_started(channel: C, config: &ScpConfig) -> Self {
        Self {
            channel,
            buffer_size: config.buffer_size.max(1),
            record_buffer_size: config.record_buffer_size.max(1),
            pending_times: None,
            dir_stack: Vec::new(),
            body: BodyState::Idle,
            finished: false,
        }
    }

    /// Currently open directories, outermost first.
    pub fn dir_stack(&self) -> &[DirFrame] {
        &self.dir_stack
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Next event, or `None` once the remote has closed the channel.
    ///
    /// Any error closes the channel before it is returned; the loop is
    /// finished afterwards.
    pub async fn next_event(&mut self) -> Result<Option<TransferEvent<'_, C>>> {
        if self.finished {
            return Ok(None);
        }

        if self.body != BodyState::Idle {
            let err = ScpError::Internal(
                "next record requested before the file body was drained".to_string(),
            );
            return Err(self.fail(err).await);
        }

        match self.step().await {
            Ok(Some(Step::File(file))) => Ok(Some(TransferEvent::FileAvailable {
                file,
                body: FileBody { rx: self },
            })),
            Ok(Some(Step::DirEntered { path, mode })) => {
                Ok(Some(TransferEvent::DirEntered { path, mode }))
            }
            Ok(Some(Step::DirExited(frame))) => Ok(Some(TransferEvent::DirExited(frame))),
            Ok(None) => {
                self.finish().await;
                Ok(None)
            }
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn step(&mut self) -> Result<Option<Step>> {
        loop {
            self.channel.send_all(ACK).await?;

            let msg = recv(&mut self.channel, self.record_buffer_size, "scp record").await?;
            if msg.is_empty() {
                if !self.dir_stack.is_empty() {
                    return Err(ScpError::protocol(format!(
                        "remote closed with {} directories still open",
                        self.dir_stack.len()
                    )));
                }
                return Ok(None);
            }

            let record = ControlRecord::decode(&msg)?;
            debug!("scp << {:?}", record);

            match record {
                ControlRecord::Time(times) => {
                    self.pending_times = Some(times);
                }
                ControlRecord::FileHeader { mode, size, name } => {
                    check_entry_name(&name)?;
                    let file = IncomingFile {
                        path: self.resolve(&name),
                        mode,
                        size,
                        times: self.pending_times.take(),
                    };

                    // Tell the remote to start streaming the body
                    self.channel.send_all(ACK).await?;
                    self.body = if size == 0 {
                        BodyState::AwaitingEnd
                    } else {
                        BodyState::Streaming { remaining: size }
                    };
                    return Ok(Some(Step::File(file)));
                }
                ControlRecord::DirPush { mode, name } => {
                    check_entry_name(&name)?;
                    let path = self.resolve(&name);
                    self.dir_stack.push(DirFrame {
                        path: path.clone(),
                        mode,
                        times: self.pending_times.take(),
                    });
                    return Ok(Some(Step::DirEntered { path, mode }));
                }
                ControlRecord::DirPop => {
                    let frame = self.dir_stack.pop().ok_or_else(|| {
                        ScpError::protocol("directory pop with no open directory")
                    })?;
                    return Ok(Some(Step::DirExited(frame)));
                }
                ControlRecord::Err(message) => return Err(ScpError::Remote(message)),
                ControlRecord::Ack => {
                    return Err(ScpError::protocol_raw("unknown reply", &msg));
                }
            }
        }
    }

    fn resolve(&self, name: &str) -> PathBuf {
        match self.dir_stack.last() {
            Some(top) => top.path.join(name),
            None => PathBuf::from(name),
        }
    }

    async fn read_body_chunk(&mut self) -> Result<Option<Bytes>> {
        match self.body {
            BodyState::Idle => Ok(None),
            BodyState::Streaming { remaining } => {
                let want = remaining.min(self.buffer_size as u64) as usize;
                let chunk = recv(&mut self.channel, want, "file data").await?;
                if chunk.is_empty() {
                    return Err(ScpError::protocol(format!(
                        "channel closed with {} body bytes outstanding",
                        remaining
                    )));
                }
                // Never ask for more than remaining, so this cannot underflow
                let remaining = remaining - chunk.len() as u64;
                self.body = if remaining == 0 {
                    BodyState::AwaitingEnd
                } else {
                    BodyState::Streaming { remaining }
                };
                Ok(Some(chunk))
            }
            BodyState::AwaitingEnd => {
                let msg = recv(&mut self.channel, self.record_buffer_size, "end of file").await?;
                if msg.first() != Some(&TAG_ACK) {
                    return Err(ScpError::protocol_raw("error at end of read", &msg));
                }
                self.body = BodyState::Idle;
                Ok(None)
            }
        }
    }

    async fn fail(&mut self, err: ScpError) -> ScpError {
        warn!("scp receive failed: {}", err);
        self.finished = true;
        self.body = BodyState::Idle;
        close_quietly(&mut self.channel).await;
        err
    }

    async fn finish(&mut self) {
        self.finished = true;
        close_quietly(&mut self.channel).await;
    }

    /// Stop pulling and close the channel.
    pub async fn close(&mut self) -> Result<()> {
        self.finished = true;
        self.body = BodyState::Idle;
        self.channel.close().await
    }

    /// Return the channel, e.g. to inspect a test double.
    pub fn into_channel(self) -> C {
        self.channel
    }
}

enum Step {
    File(IncomingFile),
    DirEntered { path: PathBuf, mode: u32 },
    DirExited(DirFrame),
}

async fn close_quietly<C: Channel + ?Sized>(channel: &mut C) {
    if let Err(e) = channel.close().await {
        warn!("Failed to close channel: {}", e);
    }
}

// =============================================================================
// FileBody
// =============================================================================

/// Lazy, single-pass body of an announced file.
///
/// Yields at most `size` bytes in chunks no larger than the configured
/// buffer, then verifies the remote's end marker.
pub struct FileBody<'a, C: Channel> {
    rx: &'a mut ReceiveLoop<C>,
}

impl<C: Channel> FileBody<'_, C> {
    /// Next chunk, or `None` after the end marker was verified.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        match self.rx.read_body_chunk().await {
            Ok(chunk) => Ok(chunk),
            Err(e) => Err(self.rx.fail(e).await),
        }
    }

    pub fn is_drained(&self) -> bool {
        self.rx.body == BodyState::Idle
    }

    /// Drain into a writer; returns the byte count.
    pub async fn copy_to<W, F>(&mut self, writer: &mut W, mut on_chunk: F) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
        F: FnMut(u64),
    {
        let mut total = 0u64;
        while let Some(chunk) = self.chunk().await? {
            if let Err(e) = writer.write_all(&chunk).await {
                return Err(self.rx.fail(e.into()).await);
            }
            total += chunk.len() as u64;
            on_chunk(total);
        }
        Ok(total)
    }

    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Give up on this body. Closes the channel; the loop is finished.
    pub async fn abandon(self, reason: ScpError) -> ScpError {
        self.rx.fail(reason).await
    }
}

/// `C` and `D` names must be a single path component.
fn check_entry_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(ScpError::Security(format!("unexpected filename: {}", name)));
    }
    Ok(())
}

/// Whether a received path names something strictly below the destination
/// root.
pub fn is_safe_relative(path: &Path) -> bool {
    use std::path::Component;
    !path.is_absolute()
        && path.components().next().is_some()
        && path.components().all(|c| matches!(c, Component::Normal(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_safe_relative() {
        assert!(is_safe_relative(Path::new("a/b/c.txt")));
        assert!(is_safe_relative(Path::new("a..b")));
        assert!(!is_safe_relative(Path::new(".")));
        assert!(!is_safe_relative(Path::new("")));
        assert!(!is_safe_relative(Path::new("../escape")));
        assert!(!is_safe_relative(Path::new("a/../../escape")));
        assert!(!is_safe_relative(Path::new("/etc/passwd")));
    }

    #[test]
    fn test_check_entry_name() {
        assert!(check_entry_name("report.txt").is_ok());
        assert!(check_entry_name("sub dir").is_ok());
        assert!(check_entry_name("..hidden").is_ok());
        for bad in ["", ".", "..", "a/b", "/etc/passwd", "../escape"] {
            assert!(
                matches!(check_entry_name(bad), Err(ScpError::Security(_))),
                "{:?}",
                bad
            );
        }
    }
}
