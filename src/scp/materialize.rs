//! Applies receive events to the local filesystem.

use crate::error::{Result, ScpError};
use crate::scp::protocol::FileTimes;
use crate::scp::receiver::{is_safe_relative, DirFrame, ReceiveLoop, TransferEvent};
use crate::scp::{ProgressFn, TransferOptions};
use crate::transport::Channel;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Counters for one recursive receive
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReceiveStats {
    pub files: u64,
    pub bytes: u64,
    pub dirs_created: u64,
}

/// Writes a recursive receive under `root`.
pub struct Materializer {
    root: PathBuf,
    options: TransferOptions,
    stats: ReceiveStats,
}

impl Materializer {
    /// `root` must already exist and be a directory.
    pub async fn new(root: impl Into<PathBuf>, options: TransferOptions) -> Result<Self> {
        let root = root.into();
        match fs::metadata(&root).await {
            Ok(meta) if meta.is_dir() => {}
            _ => {
                return Err(ScpError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("local directory {} does not exist", root.display()),
                )))
            }
        }
        Ok(Self {
            root,
            options,
            stats: ReceiveStats::default(),
        })
    }

    pub fn stats(&self) -> &ReceiveStats {
        &self.stats
    }

    /// Pull every event from `rx` and apply it. Closes the channel on error.
    pub async fn run<C: Channel>(
        &mut self,
        rx: &mut ReceiveLoop<C>,
        mut progress: Option<&mut ProgressFn<'_>>,
    ) -> Result<ReceiveStats> {
        info!("Receiving tree into {}", self.root.display());

        loop {
            let event = match rx.next_event().await? {
                Some(event) => event,
                None => break,
            };

            let result = self.apply(event, progress.as_mut().map(|p| &mut **p)).await;
            if let Err(e) = result {
                // The body may be undrained; nothing more can be read from this channel
                if let Err(close_err) = rx.close().await {
                    debug!("Close after failure also failed: {}", close_err);
                }
                return Err(e);
            }
        }

        Ok(self.stats.clone())
    }

    pub async fn apply<C: Channel>(
        &mut self,
        event: TransferEvent<'_, C>,
        mut progress: Option<&mut ProgressFn<'_>>,
    ) -> Result<()> {
        match event {
            TransferEvent::FileAvailable { file, mut body } => {
                let dest = self.checked_dest(&file.path)?;
                let label = file.path.to_string_lossy().into_owned();

                let mut out = fs::File::create(&dest).await?;
                let written = body
                    .copy_to(&mut out, |n| {
                        if let Some(cb) = progress.as_mut() {
                            cb(&label, file.size, n);
                        }
                    })
                    .await?;
                out.flush().await?;
                drop(out);

                set_mode(&dest, self.options.override_mode.unwrap_or(file.mode)).await?;
                if self.options.preserve_times {
                    if let Some(times) = file.times {
                        set_times(&dest, times).await?;
                    }
                }

                self.stats.files += 1;
                self.stats.bytes += written;
                debug!("Received {} ({} bytes)", dest.display(), written);
            }
            TransferEvent::DirEntered { path, mode } => {
                let dest = self.checked_dest(&path)?;

                match fs::metadata(&dest).await {
                    Ok(meta) if meta.is_dir() => {
                        set_mode(&dest, self.options.override_mode.unwrap_or(mode)).await?;
                    }
                    Ok(_) => {
                        return Err(ScpError::Io(std::io::Error::new(
                            std::io::ErrorKind::AlreadyExists,
                            format!("{} is not a directory", dest.display()),
                        )));
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        create_dir(&dest, mode).await?;
                        if let Some(mode) = self.options.override_mode {
                            set_mode(&dest, mode).await?;
                        }
                        self.stats.dirs_created += 1;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            TransferEvent::DirExited(DirFrame { path, times, .. }) => {
                // Mode is not re-applied on exit, only the times captured at entry
                if self.options.preserve_times {
                    if let Some(times) = times {
                        let dest = self.checked_dest(&path)?;
                        set_times(&dest, times).await?;
                    }
                }
            }
        }
        Ok(())
    }

    fn checked_dest(&self, relative: &Path) -> Result<PathBuf> {
        if relative.is_absolute() {
            return Err(ScpError::Security(format!(
                "{} is an absolute path",
                relative.display()
            )));
        }
        if !is_safe_relative(relative) {
            return Err(ScpError::Security(format!(
                "{} is not below the destination root",
                relative.display()
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[cfg(unix)]
pub(crate) async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

#[cfg(not(unix))]
pub(crate) async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    let mut perms = fs::metadata(path).await?.permissions();
    perms.set_readonly(mode & 0o222 == 0);
    fs::set_permissions(path, perms).await?;
    Ok(())
}

pub(crate) async fn set_times(path: &Path, times: FileTimes) -> Result<()> {
    let path = path.to_path_buf();
    let atime = filetime::FileTime::from_unix_time(times.atime, 0);
    let mtime = filetime::FileTime::from_unix_time(times.mtime, 0);
    tokio::task::spawn_blocking(move || filetime::set_file_times(&path, atime, mtime))
        .await
        .map_err(|e| ScpError::Internal(format!("set_file_times task failed: {}", e)))??;
    Ok(())
}

async fn create_dir(path: &Path, mode: u32) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    #[cfg(unix)]
    builder.mode(mode);
    #[cfg(not(unix))]
    let _ = mode;
    builder.create(path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_root_rejected() {
        let tmp = TempDir::new().unwrap();
        let err = Materializer::new(tmp.path().join("nope"), TransferOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ScpError::Io(ref e) if e.kind() == std::io::ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn test_checked_dest() {
        let tmp = TempDir::new().unwrap();
        let m = Materializer::new(tmp.path(), TransferOptions::default())
            .await
            .unwrap();

        assert_eq!(
            m.checked_dest(Path::new("a/b.txt")).unwrap(),
            tmp.path().join("a/b.txt")
        );
        assert!(matches!(
            m.checked_dest(Path::new("../escape")),
            Err(ScpError::Security(_))
        ));
        assert!(matches!(
            m.checked_dest(Path::new("/etc/passwd")),
            Err(ScpError::Security(_))
        ));
        assert!(matches!(
            m.checked_dest(Path::new(".")),
            Err(ScpError::Security(_))
        ));
    }

    #[tokio::test]
    async fn test_set_times() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("f");
        std::fs::write(&path, "x").unwrap();

        set_times(&path, FileTimes { mtime: 1_000_000_000, atime: 1_100_000_000 })
            .await
            .unwrap();

        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(
            filetime::FileTime::from_last_modification_time(&meta).unix_seconds(),
            1_000_000_000
        );
    }
}
