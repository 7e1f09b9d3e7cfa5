//! Request/acknowledge handshake.
//!
//! Every control record and every completed file body is answered by the
//! other side with one response: `\0` for success or `\x01<message>` for
//! failure.

use crate::error::{Result, ScpError};
use crate::scp::protocol::{payload_text, ControlRecord, TAG_ACK, TAG_ERROR};
use crate::transport::Channel;
use bytes::Bytes;
use tracing::debug;

/// Write a record verbatim.
pub async fn send_record<C: Channel + ?Sized>(channel: &mut C, record: &ControlRecord) -> Result<()> {
    debug!("scp >> {:?}", record);
    channel.send_all(&record.encode()).await
}

/// Receive one chunk, mapping timeouts to a message naming what we waited for.
pub async fn recv<C: Channel + ?Sized>(channel: &mut C, max: usize, waiting_for: &str) -> Result<Bytes> {
    channel.recv(max).await.map_err(|e| match e {
        ScpError::Timeout(detail) => {
            ScpError::Timeout(format!("waiting for {}: {}", waiting_for, detail))
        }
        other => other,
    })
}

/// Read one response and translate its leading byte.
pub async fn read_ack<C: Channel + ?Sized>(channel: &mut C, max: usize) -> Result<()> {
    let msg = recv(channel, max, "scp response").await?;
    check_ack(&msg)
}

/// Translate a raw response into success or a typed error.
pub fn check_ack(msg: &[u8]) -> Result<()> {
    match msg.first() {
        None => Err(ScpError::protocol("empty response")),
        Some(&TAG_ACK) => Ok(()),
        Some(&TAG_ERROR) => {
            let message = payload_text(&msg[1..]);
            debug!("scp << error: {}", message);
            Err(ScpError::Remote(message))
        }
        Some(_) => Err(ScpError::protocol_raw("invalid response", msg)),
    }
}

/// Send a record, then require an ack for it.
pub async fn exchange<C: Channel + ?Sized>(
    channel: &mut C,
    record: &ControlRecord,
    max: usize,
) -> Result<()> {
    send_record(channel, record).await?;
    read_ack(channel, max).await
}
