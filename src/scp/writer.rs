//! Session-level senders.
//!
//! [`ScpWriter`] runs `scp -t <path>` and sends individual files;
//! [`ScpDirWriter`] runs `scp -r -t <path>` and sends whole trees. Each owns
//! its channel and closes it on the first error.

use crate::config::ScpConfig;
use crate::error::{Result, ScpError};
use crate::scp::ack::read_ack;
use crate::scp::protocol::{sink_command, FileStat, FileTimes};
use crate::scp::sender::{remote_name_of, send_file, send_path, DirSender, OutgoingFile};
use crate::scp::{ProgressFn, TransferOptions};
use crate::transport::{Channel, Session};
use std::path::Path;
use tokio::io::AsyncRead;
use tracing::{info, warn};

struct SinkChannel<C: Channel> {
    channel: C,
    config: ScpConfig,
    poisoned: bool,
}

impl<C: Channel> SinkChannel<C> {
    async fn start(mut channel: C, remote_path: &str, recursive: bool, config: ScpConfig) -> Result<Self> {
        config.validate()?;
        let command = sink_command(&config.remote_command, remote_path, recursive);
        info!("Starting scp sink: {}", command);

        let started = async {
            channel.exec(&command).await?;
            // The sink announces readiness before the first record
            read_ack(&mut channel, config.record_buffer_size).await
        }
        .await;

        if let Err(e) = started {
            if let Err(close_err) = channel.close().await {
                warn!("Failed to close channel: {}", close_err);
            }
            return Err(e);
        }

        Ok(Self {
            channel,
            config,
            poisoned: false,
        })
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.poisoned || self.channel.is_closed() {
            return Err(ScpError::Internal(
                "writer used after an error or close".to_string(),
            ));
        }
        Ok(())
    }

    async fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.poisoned = true;
            if let Err(e) = self.channel.close().await {
                warn!("Failed to close channel: {}", e);
            }
        }
        result
    }

    async fn close(&mut self) -> Result<()> {
        self.poisoned = true;
        self.channel.close().await
    }
}

/// Sends individual files to one remote path.
pub struct ScpWriter<C: Channel> {
    sink: SinkChannel<C>,
}

impl<C: Channel> ScpWriter<C> {
    pub async fn open<S>(session: &S, remote_path: &str, config: ScpConfig) -> Result<Self>
    where
        S: Session<Channel = C>,
    {
        let channel = session.open_channel(config.timeout()).await?;
        Self::with_channel(channel, remote_path, config).await
    }

    /// Run the sink on an already opened channel.
    pub async fn with_channel(channel: C, remote_path: &str, config: ScpConfig) -> Result<Self> {
        let sink = SinkChannel::start(channel, remote_path, false, config).await?;
        Ok(Self { sink })
    }

    /// Send a local file. The remote name defaults to its base name.
    pub async fn send_file(
        &mut self,
        local: &Path,
        remote_filename: Option<&str>,
        options: &TransferOptions,
        progress: Option<&mut ProgressFn<'_>>,
    ) -> Result<u64> {
        self.sink.ensure_usable()?;
        let result = async {
            let name = match remote_filename {
                Some(name) => name.to_string(),
                None => remote_name_of(local)?,
            };
            send_path(
                &mut self.sink.channel,
                local,
                &name,
                options,
                &self.sink.config,
                progress,
            )
            .await
        }
        .await;
        self.sink.guard(result).await
    }

    /// Send `stat.size` bytes from any reader.
    ///
    /// The size is a hard contract: a reader that ends early fails the
    /// transfer with a protocol error.
    pub async fn send<R>(
        &mut self,
        source: &mut R,
        remote_filename: &str,
        stat: &FileStat,
        times: Option<FileTimes>,
        progress: Option<&mut ProgressFn<'_>>,
    ) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        self.sink.ensure_usable()?;
        let file = OutgoingFile {
            name: remote_filename,
            mode: stat.mode,
            size: stat.size,
            times,
        };
        let result = send_file(
            &mut self.sink.channel,
            &file,
            source,
            &self.sink.config,
            progress,
        )
        .await;
        self.sink.guard(result).await
    }

    pub async fn close(mut self) -> Result<()> {
        self.sink.close().await
    }

    pub fn into_channel(self) -> C {
        self.sink.channel
    }
}

/// Sends directory trees to one remote path.
pub struct ScpDirWriter<C: Channel> {
    sink: SinkChannel<C>,
    dirs: DirSender,
}

impl<C: Channel> ScpDirWriter<C> {
    pub async fn open<S>(session: &S, remote_path: &str, config: ScpConfig) -> Result<Self>
    where
        S: Session<Channel = C>,
    {
        let channel = session.open_channel(config.timeout()).await?;
        Self::with_channel(channel, remote_path, config).await
    }

    pub async fn with_channel(channel: C, remote_path: &str, config: ScpConfig) -> Result<Self> {
        let sink = SinkChannel::start(channel, remote_path, true, config).await?;
        Ok(Self {
            sink,
            dirs: DirSender::new(),
        })
    }

    /// Send `local_dir` and everything below it.
    pub async fn send_dir(
        &mut self,
        local_dir: &Path,
        options: &TransferOptions,
        progress: Option<&mut ProgressFn<'_>>,
    ) -> Result<()> {
        self.sink.ensure_usable()?;
        let result = self
            .dirs
            .send_tree(
                &mut self.sink.channel,
                local_dir,
                options,
                &self.sink.config,
                progress,
            )
            .await;
        self.sink.guard(result).await
    }

    /// Close the channel. Fails if directories are still pushed.
    pub async fn close(mut self) -> Result<()> {
        let depth = self.dirs.depth();
        self.sink.close().await?;
        if depth != 0 {
            return Err(ScpError::Internal(format!(
                "closed with {} directories still pushed",
                depth
            )));
        }
        Ok(())
    }

    pub fn into_channel(self) -> C {
        self.sink.channel
    }
}
