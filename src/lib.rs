//! Client side of the legacy scp protocol.
//!
//! Sends local files and directory trees to a remote `scp -t`, and receives
//! them from a remote `scp -f`, over any [`transport::Channel`]. The crate
//! performs no authentication; the caller supplies an already connected
//! [`transport::Session`] or uses [`transport::ProcessSession`] to shell out
//! to `ssh`.
//!
//! ```no_run
//! use sy_scp::{ProcessSession, ScpConfig, ScpWriter, SshTarget, TransferOptions};
//! use std::path::Path;
//!
//! # async fn run() -> sy_scp::Result<()> {
//! let session = ProcessSession::ssh(SshTarget::new("backup.example.com"));
//! let mut writer = ScpWriter::open(&session, "/srv/reports", ScpConfig::default()).await?;
//! writer
//!     .send_file(Path::new("report.txt"), None, &TransferOptions::preserve_times(), None)
//!     .await?;
//! writer.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod scp;
pub mod transport;

pub use config::ScpConfig;
pub use error::{Result, ScpError};
pub use scp::{
    ControlRecord, FileStat, FileTimes, Materializer, ReceiveLoop, ReceiveStats, ScpDirReader,
    ScpDirWriter, ScpReader, ScpWriter, TransferEvent, TransferOptions,
};
pub use transport::{Channel, ProcessSession, Session, SshTarget};
