#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sy_scp::{Channel, Result, ScpError, Session};

/// One scripted answer to a `recv` call
#[derive(Debug, Clone)]
pub enum Reply {
    Data(Vec<u8>),
    Timeout,
}

/// Everything the code under test did to a channel
#[derive(Debug, Default)]
pub struct Transcript {
    pub commands: Vec<String>,
    pub writes: Vec<Vec<u8>>,
    pub closed: bool,
}

impl Transcript {
    pub fn sent(&self) -> Vec<u8> {
        self.writes.concat()
    }
}

/// Channel that replays canned replies and records writes.
///
/// Replies longer than the requested `max` are split; once the script is
/// exhausted `recv` reports a clean close.
pub struct ScriptedChannel {
    replies: VecDeque<Reply>,
    log: Arc<Mutex<Transcript>>,
    closed: bool,
}

impl ScriptedChannel {
    pub fn new() -> Self {
        Self {
            replies: VecDeque::new(),
            log: Arc::new(Mutex::new(Transcript::default())),
            closed: false,
        }
    }

    pub fn reply(mut self, data: impl AsRef<[u8]>) -> Self {
        self.replies.push_back(Reply::Data(data.as_ref().to_vec()));
        self
    }

    pub fn acks(mut self, count: usize) -> Self {
        for _ in 0..count {
            self.replies.push_back(Reply::Data(vec![0]));
        }
        self
    }

    pub fn timeout(mut self) -> Self {
        self.replies.push_back(Reply::Timeout);
        self
    }

    /// Replay each chunk another channel's peer wrote, in order.
    pub fn replay(mut self, writes: &[Vec<u8>]) -> Self {
        for w in writes {
            self.replies.push_back(Reply::Data(w.clone()));
        }
        self
    }

    pub fn transcript(&self) -> Arc<Mutex<Transcript>> {
        Arc::clone(&self.log)
    }
}

#[async_trait]
impl Channel for ScriptedChannel {
    async fn exec(&mut self, command: &str) -> Result<()> {
        self.log.lock().unwrap().commands.push(command.to_string());
        Ok(())
    }

    async fn send_all(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(ScpError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "scripted channel closed",
            )));
        }
        self.log.lock().unwrap().writes.push(data.to_vec());
        Ok(())
    }

    async fn recv(&mut self, max: usize) -> Result<Bytes> {
        if self.closed {
            return Ok(Bytes::new());
        }
        match self.replies.pop_front() {
            None => Ok(Bytes::new()),
            Some(Reply::Timeout) => Err(ScpError::Timeout("scripted".to_string())),
            Some(Reply::Data(mut data)) => {
                if data.len() > max {
                    let rest = data.split_off(max);
                    self.replies.push_front(Reply::Data(rest));
                }
                Ok(Bytes::from(data))
            }
        }
    }

    fn set_timeout(&mut self, _timeout: Option<Duration>) {}

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.log.lock().unwrap().closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Hands out prepared channels in order.
pub struct ScriptedSession {
    channels: Mutex<VecDeque<ScriptedChannel>>,
}

impl ScriptedSession {
    pub fn new(channels: Vec<ScriptedChannel>) -> Self {
        Self {
            channels: Mutex::new(channels.into()),
        }
    }
}

#[async_trait]
impl Session for ScriptedSession {
    type Channel = ScriptedChannel;

    async fn open_channel(&self, _timeout: Option<Duration>) -> Result<ScriptedChannel> {
        self.channels.lock().unwrap().pop_front().ok_or_else(|| {
            ScpError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no scripted channel left",
            ))
        })
    }
}

#[cfg(unix)]
pub fn set_mode(path: &std::path::Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).unwrap();
}

#[cfg(unix)]
pub fn mode_of(path: &std::path::Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).unwrap().permissions().mode() & 0o7777
}

pub fn mtime_of(path: &std::path::Path) -> i64 {
    let meta = std::fs::metadata(path).unwrap();
    filetime::FileTime::from_last_modification_time(&meta).unix_seconds()
}

/// Opt-in logs for debugging a failing test: `RUST_LOG=sy_scp=debug`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
