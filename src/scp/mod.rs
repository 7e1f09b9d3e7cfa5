//! Legacy scp protocol over an exec channel.
//!
//! One remote `scp` invocation per transfer; the mode (send or receive,
//! flat or recursive) is fixed by its command line.
//!
//! # Architecture
//!
//! ```text
//! Send (local -> remote, `scp [-r] -t <path>`):
//! +--------------+     +--------------+     +--------------+
//! |  DirSender   | --> | send_file    | --> |   channel    |
//! | (local walk) |     | (T, C, body) |     | (1 ack/record)|
//! +--------------+     +--------------+     +--------------+
//!
//! Receive (remote -> local, `scp [-r] -p -f <path>`):
//! +--------------+     +--------------+     +--------------+
//! |   channel    | --> | ReceiveLoop  | --> | Materializer |
//! |              |     | (events)     |     | (local write)|
//! +--------------+     +--------------+     +--------------+
//! ```
//!
//! The protocol is lockstep: every record and every completed body is
//! acknowledged before anything else is sent, so a single channel never has
//! more than one request in flight.

pub mod ack;
pub mod materialize;
pub mod protocol;
pub mod reader;
pub mod receiver;
pub mod sender;
pub mod writer;

pub use materialize::{Materializer, ReceiveStats};
pub use protocol::{ControlRecord, FileStat, FileTimes};
pub use reader::{ScpDirReader, ScpReader};
pub use receiver::{DirFrame, FileBody, IncomingFile, ReceiveLoop, TransferEvent};
pub use sender::{DirSender, OutgoingFile};
pub use writer::{ScpDirWriter, ScpWriter};

/// Progress callback: `(name, total_size, bytes_so_far)`
pub type ProgressFn<'a> = dyn FnMut(&str, u64, u64) + Send + 'a;

/// Per-transfer options shared by senders and receivers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferOptions {
    /// Send `T` records / apply received times locally
    pub preserve_times: bool,
    /// Replaces the mode taken from the source
    pub override_mode: Option<u32>,
}

impl TransferOptions {
    pub fn preserve_times() -> Self {
        Self {
            preserve_times: true,
            override_mode: None,
        }
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.override_mode = Some(mode);
        self
    }
}
