//! Outbound transfers.
//!
//! The file sender announces a size up front and then streams exactly that
//! many bytes; the directory sender replays a depth-first walk as a sequence
//! of `D` / `C` / `E` records so the remote's implicit directory stack
//! matches the walk.

use crate::config::ScpConfig;
use crate::error::{Result, ScpError};
use crate::scp::ack::{exchange, read_ack};
use crate::scp::protocol::{ControlRecord, FileStat, FileTimes, ACK};
use crate::scp::{ProgressFn, TransferOptions};
use crate::transport::Channel;
use ignore::WalkBuilder;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info};

/// Header fields for one outbound file
#[derive(Debug, Clone)]
pub struct OutgoingFile<'a> {
    /// Base name announced to the remote
    pub name: &'a str,
    pub mode: u32,
    pub size: u64,
    /// Sent as a `T` record first when present
    pub times: Option<FileTimes>,
}

/// Send one file: optional `T`, `C`, body, end marker, each acknowledged.
///
/// Returns the number of body bytes written, which always equals
/// `file.size` on success.
pub async fn send_file<C, R>(
    channel: &mut C,
    file: &OutgoingFile<'_>,
    source: &mut R,
    config: &ScpConfig,
    mut progress: Option<&mut ProgressFn<'_>>,
) -> Result<u64>
where
    C: Channel + ?Sized,
    R: AsyncRead + Unpin + Send + ?Sized,
{
    let record_max = config.record_buffer_size;

    if let Some(times) = file.times {
        exchange(channel, &ControlRecord::Time(times), record_max).await?;
    }

    let header = ControlRecord::FileHeader {
        mode: file.mode,
        size: file.size,
        name: file.name.to_string(),
    };
    exchange(channel, &header, record_max).await?;

    let mut buf = vec![0u8; config.buffer_size.min(file.size as usize).max(1)];
    let mut sent = 0u64;

    while sent < file.size {
        let want = (file.size - sent).min(buf.len() as u64) as usize;
        let n = source.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(ScpError::protocol(format!(
                "short read: source ended after {} of {} bytes",
                sent, file.size
            )));
        }

        channel.send_all(&buf[..n]).await?;
        sent += n as u64;

        if let Some(cb) = progress.as_mut() {
            cb(file.name, file.size, sent);
        }
    }

    channel.send_all(ACK).await?;
    read_ack(channel, record_max).await?;

    debug!("Sent {} ({} bytes)", file.name, sent);
    Ok(sent)
}

/// Send a local file by path, announcing it as `remote_name`.
pub async fn send_path<C>(
    channel: &mut C,
    local: &Path,
    remote_name: &str,
    options: &TransferOptions,
    config: &ScpConfig,
    progress: Option<&mut ProgressFn<'_>>,
) -> Result<u64>
where
    C: Channel + ?Sized,
{
    let mut source = File::open(local).await?;
    let stat = FileStat::from_metadata(&source.metadata().await?);

    let file = OutgoingFile {
        name: remote_name,
        mode: options.override_mode.unwrap_or(stat.mode),
        size: stat.size,
        times: options.preserve_times.then(|| stat.times()),
    };
    send_file(channel, &file, &mut source, config, progress).await
}

// =============================================================================
// Directory sender
// =============================================================================

/// One directory in walk order and the regular files directly inside it.
#[derive(Debug, Clone)]
pub struct DirPlan {
    pub path: PathBuf,
    pub stat: FileStat,
    pub files: Vec<PathBuf>,
}

/// Depth-first, name-ordered walk of `root`. Directories come before their
/// children; symlinks are not followed.
pub fn plan_tree(root: &Path) -> Result<Vec<DirPlan>> {
    let meta = std::fs::metadata(root)?;
    if !meta.is_dir() {
        return Err(ScpError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} is not a directory", root.display()),
        )));
    }

    let walker = WalkBuilder::new(root)
        .standard_filters(false)
        .follow_links(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build();

    let mut plans: Vec<DirPlan> = Vec::new();
    let mut index: HashMap<PathBuf, usize> = HashMap::new();

    for entry in walker {
        let entry = entry.map_err(|e| {
            let msg = e.to_string();
            ScpError::Io(
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, msg)),
            )
        })?;
        let file_type = match entry.file_type() {
            Some(t) => t,
            None => continue,
        };

        if file_type.is_dir() {
            let stat = FileStat::from_metadata(&std::fs::metadata(entry.path())?);
            index.insert(entry.path().to_path_buf(), plans.len());
            plans.push(DirPlan {
                path: entry.into_path(),
                stat,
                files: Vec::new(),
            });
        } else if file_type.is_file() {
            let parent = entry.path().parent().and_then(|p| index.get(p)).copied();
            match parent {
                Some(i) => plans[i].files.push(entry.into_path()),
                None => {
                    return Err(ScpError::Internal(format!(
                        "walk yielded {} before its directory",
                        entry.path().display()
                    )))
                }
            }
        } else {
            debug!("Skipping non-regular entry {}", entry.path().display());
        }
    }

    Ok(plans)
}

/// Base name announced for a local path.
pub fn remote_name_of(path: &Path) -> Result<String> {
    let name = match path.file_name() {
        Some(name) => name.to_os_string(),
        None => path
            .canonicalize()?
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| {
                ScpError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("{} has no file name", path.display()),
                ))
            })?,
    };
    Ok(name.to_string_lossy().into_owned())
}

/// Replays local walks onto the remote's implicit directory stack.
#[derive(Debug, Default)]
pub struct DirSender {
    /// Local directories currently pushed on the remote
    stack: Vec<PathBuf>,
}

impl DirSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directories pushed but not yet popped.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub async fn send_tree<C>(
        &mut self,
        channel: &mut C,
        root: &Path,
        options: &TransferOptions,
        config: &ScpConfig,
        mut progress: Option<&mut ProgressFn<'_>>,
    ) -> Result<()>
    where
        C: Channel + ?Sized,
    {
        let root_buf = root.to_path_buf();
        let plans = tokio::task::spawn_blocking(move || plan_tree(&root_buf))
            .await
            .map_err(|e| ScpError::Internal(format!("walk task failed: {}", e)))??;

        info!("Sending tree {} ({} directories)", root.display(), plans.len());

        for plan in &plans {
            // Pop until the top of the stack is an ancestor of this directory
            while let Some(top) = self.stack.last() {
                if plan.path.starts_with(top) {
                    break;
                }
                self.pop(channel, config).await?;
            }

            self.push(channel, plan, options, config).await?;

            for file in &plan.files {
                let name = remote_name_of(file)?;
                send_path(
                    channel,
                    file,
                    &name,
                    options,
                    config,
                    progress.as_mut().map(|p| &mut **p),
                )
                .await?;
            }
        }

        while !self.stack.is_empty() {
            self.pop(channel, config).await?;
        }
        Ok(())
    }

    async fn push<C: Channel + ?Sized>(
        &mut self,
        channel: &mut C,
        plan: &DirPlan,
        options: &TransferOptions,
        config: &ScpConfig,
    ) -> Result<()> {
        if options.preserve_times {
            exchange(
                channel,
                &ControlRecord::Time(plan.stat.times()),
                config.record_buffer_size,
            )
            .await?;
        }

        let record = ControlRecord::DirPush {
            mode: plan.stat.mode,
            name: remote_name_of(&plan.path)?,
        };
        exchange(channel, &record, config.record_buffer_size).await?;
        self.stack.push(plan.path.clone());
        Ok(())
    }

    async fn pop<C: Channel + ?Sized>(&mut self, channel: &mut C, config: &ScpConfig) -> Result<()> {
        exchange(channel, &ControlRecord::DirPop, config.record_buffer_size).await?;
        self.stack.pop();
        Ok(())
    }
}
