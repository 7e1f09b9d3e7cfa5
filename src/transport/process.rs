//! Subprocess-backed channels.
//!
//! Runs the remote scp command either through the system `ssh` client or
//! through a local shell (for testing against a local `scp` binary). The
//! child's stdin/stdout become the channel; stderr is inherited.

use super::{Channel, Session};
use crate::error::{Result, ScpError};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

/// Where `ssh` should connect
#[derive(Debug, Clone, Default)]
pub struct SshTarget {
    pub hostname: String,
    pub user: String,
    pub port: u16,
    pub identity_file: Vec<PathBuf>,
}

impl SshTarget {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            port: 22,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
enum Launcher {
    Ssh(SshTarget),
    Local,
}

/// Opens channels by spawning one process per remote command.
#[derive(Debug, Clone)]
pub struct ProcessSession {
    launcher: Launcher,
}

impl ProcessSession {
    /// Run commands on a remote host via the `ssh` binary
    pub fn ssh(target: SshTarget) -> Self {
        Self {
            launcher: Launcher::Ssh(target),
        }
    }

    /// Run commands locally through `sh -c` (for testing)
    pub fn local() -> Self {
        Self {
            launcher: Launcher::Local,
        }
    }
}

#[async_trait]
impl Session for ProcessSession {
    type Channel = ProcessChannel;

    async fn open_channel(&self, timeout: Option<Duration>) -> Result<ProcessChannel> {
        let mut channel = ProcessChannel::new(self.launcher.clone());
        channel.set_timeout(timeout);
        Ok(channel)
    }
}

/// Channel over a child process's stdin/stdout.
pub struct ProcessChannel {
    launcher: Launcher,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    timeout: Option<Duration>,
    closed: bool,
    buf: Vec<u8>,
}

impl ProcessChannel {
    fn new(launcher: Launcher) -> Self {
        Self {
            launcher,
            child: None,
            stdin: None,
            stdout: None,
            timeout: None,
            closed: false,
            buf: Vec::new(),
        }
    }

    fn build_command(&self, remote_command: &str) -> Command {
        match &self.launcher {
            Launcher::Ssh(target) => {
                let mut cmd = Command::new("ssh");
                cmd.arg(&target.hostname);

                if !target.user.is_empty() {
                    cmd.arg("-l").arg(&target.user);
                }

                if target.port != 22 && target.port != 0 {
                    cmd.arg("-p").arg(target.port.to_string());
                }

                for key in &target.identity_file {
                    cmd.arg("-i").arg(key);
                }

                // Batch mode: no password prompts on our stdin
                cmd.arg("-o").arg("BatchMode=yes");
                cmd.arg(remote_command);
                cmd
            }
            Launcher::Local => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(remote_command);
                cmd
            }
        }
    }

    fn not_running() -> ScpError {
        ScpError::Io(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "channel has no running command",
        ))
    }
}

#[async_trait]
impl Channel for ProcessChannel {
    async fn exec(&mut self, command: &str) -> Result<()> {
        if self.child.is_some() || self.closed {
            return Err(ScpError::Internal(
                "exec called twice on one channel".to_string(),
            ));
        }

        debug!("Spawning remote command: {}", command);

        let mut cmd = self.build_command(command);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn()?;
        self.stdin = child.stdin.take();
        self.stdout = child.stdout.take();
        if self.stdin.is_none() || self.stdout.is_none() {
            return Err(ScpError::Internal("child stdio not piped".to_string()));
        }
        self.child = Some(child);
        Ok(())
    }

    async fn send_all(&mut self, data: &[u8]) -> Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(Self::not_running)?;
        stdin.write_all(data).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn recv(&mut self, max: usize) -> Result<Bytes> {
        let stdout = self.stdout.as_mut().ok_or_else(Self::not_running)?;
        self.buf.resize(max, 0);

        let n = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, stdout.read(&mut self.buf))
                .await
                .map_err(|_| {
                    ScpError::Timeout(format!("no data from remote within {:?}", limit))
                })??,
            None => stdout.read(&mut self.buf).await?,
        };

        Ok(Bytes::copy_from_slice(&self.buf[..n]))
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        // Dropping stdin signals EOF to the remote
        self.stdin.take();
        self.stdout.take();

        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                Ok(Ok(status)) => debug!("Remote command exited: {}", status),
                Ok(Err(e)) => warn!("Failed to reap remote command: {}", e),
                Err(_) => {
                    warn!("Remote command did not exit, killing it");
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill remote command: {}", e);
                    }
                }
            }
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_command_line() {
        let mut target = SshTarget::new("example.com");
        target.user = "deploy".to_string();
        target.port = 2222;
        target.identity_file.push(PathBuf::from("/home/deploy/.ssh/id_ed25519"));

        let channel = ProcessChannel::new(Launcher::Ssh(target));
        let cmd = channel.build_command("scp -t /srv/upload");
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(cmd.as_std().get_program(), "ssh");
        assert_eq!(
            args,
            vec![
                "example.com",
                "-l",
                "deploy",
                "-p",
                "2222",
                "-i",
                "/home/deploy/.ssh/id_ed25519",
                "-o",
                "BatchMode=yes",
                "scp -t /srv/upload",
            ]
        );
    }

    #[tokio::test]
    async fn test_local_channel_echo() {
        let session = ProcessSession::local();
        let mut channel = session
            .open_channel(Some(Duration::from_secs(10)))
            .await
            .unwrap();

        channel.exec("cat").await.unwrap();
        channel.send_all(b"ping").await.unwrap();

        let mut got = Vec::new();
        while got.len() < 4 {
            let chunk = channel.recv(16).await.unwrap();
            assert!(!chunk.is_empty());
            got.extend_from_slice(&chunk);
        }
        assert_eq!(got, b"ping");

        channel.close().await.unwrap();
        assert!(channel.is_closed());
        // Second close is a no-op
        channel.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_local_channel_timeout() {
        let session = ProcessSession::local();
        let mut channel = session
            .open_channel(Some(Duration::from_secs(1)))
            .await
            .unwrap();

        channel.exec("sleep 5").await.unwrap();
        let err = channel.recv(16).await.unwrap_err();
        assert!(matches!(err, ScpError::Timeout(_)));
        channel.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_recv_before_exec_fails() {
        let mut channel = ProcessSession::local().open_channel(None).await.unwrap();
        assert!(matches!(channel.recv(8).await, Err(ScpError::Io(_))));
    }
}
