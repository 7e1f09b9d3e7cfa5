//! scp control records.
//!
//! Records are a single tag byte followed by a newline-terminated text
//! payload. There are no length prefixes: a file body follows its `C`
//! record as exactly `size` raw bytes, outside the line framing.
//!
//! ```text
//! T<mtime> 0 <atime> 0\n
//! C<mode> <size> <name>\n
//! D<mode> 0 <name>\n
//! E\n
//! \x00                 ack / ready
//! \x01<message>        error
//! ```

use crate::error::{Result, ScpError};
use bytes::{BufMut, Bytes, BytesMut};
use std::fs::Metadata;

pub const TAG_TIME: u8 = b'T';
pub const TAG_FILE: u8 = b'C';
pub const TAG_DIR_PUSH: u8 = b'D';
pub const TAG_DIR_POP: u8 = b'E';
pub const TAG_ACK: u8 = 0x00;
pub const TAG_ERROR: u8 = 0x01;

/// Single ack / readiness / end-of-body byte
pub const ACK: &[u8] = &[TAG_ACK];

/// Only permission bits travel on the wire
pub const MODE_MASK: u32 = 0o7777;

// =============================================================================
// Metadata
// =============================================================================

/// Modification and access times, whole seconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileTimes {
    pub mtime: i64,
    pub atime: i64,
}

/// What scp cares about from a stat: mode, size, mtime, atime.
///
/// `size` is a hard contract once announced; the body must carry exactly
/// that many bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub mode: u32,
    pub size: u64,
    pub mtime: i64,
    pub atime: i64,
}

impl FileStat {
    pub fn from_metadata(meta: &Metadata) -> Self {
        let mtime = filetime::FileTime::from_last_modification_time(meta).unix_seconds();
        let atime = filetime::FileTime::from_last_access_time(meta).unix_seconds();

        Self {
            mode: permission_bits(meta),
            size: meta.len(),
            mtime,
            atime,
        }
    }

    pub fn times(&self) -> FileTimes {
        FileTimes {
            mtime: self.mtime,
            atime: self.atime,
        }
    }
}

#[cfg(unix)]
fn permission_bits(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & MODE_MASK
}

#[cfg(not(unix))]
fn permission_bits(meta: &Metadata) -> u32 {
    match (meta.is_dir(), meta.permissions().readonly()) {
        (true, _) => 0o755,
        (false, true) => 0o444,
        (false, false) => 0o644,
    }
}

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRecord {
    Time(FileTimes),
    FileHeader { mode: u32, size: u64, name: String },
    DirPush { mode: u32, name: String },
    DirPop,
    Ack,
    Err(String),
}

impl ControlRecord {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        match self {
            ControlRecord::Time(t) => {
                buf.put_slice(format!("T{} 0 {} 0\n", t.mtime, t.atime).as_bytes());
            }
            ControlRecord::FileHeader { mode, size, name } => {
                buf.put_slice(format!("C{:04o} {} {}\n", mode & MODE_MASK, size, name).as_bytes());
            }
            ControlRecord::DirPush { mode, name } => {
                buf.put_slice(format!("D{:04o} 0 {}\n", mode & MODE_MASK, name).as_bytes());
            }
            ControlRecord::DirPop => buf.put_slice(b"E\n"),
            ControlRecord::Ack => buf.put_u8(TAG_ACK),
            ControlRecord::Err(message) => {
                buf.put_u8(TAG_ERROR);
                buf.put_slice(message.as_bytes());
                buf.put_u8(b'\n');
            }
        }
        buf.freeze()
    }

    /// Decode one record as received in a single read.
    pub fn decode(msg: &[u8]) -> Result<Self> {
        let (&tag, payload) = msg
            .split_first()
            .ok_or_else(|| ScpError::protocol("empty record"))?;

        match tag {
            TAG_TIME => Ok(ControlRecord::Time(parse_times(payload)?)),
            TAG_FILE => {
                let (mode, size, name) = parse_entry(payload)?;
                Ok(ControlRecord::FileHeader { mode, size, name })
            }
            TAG_DIR_PUSH => {
                let (mode, _size, name) = parse_entry(payload)?;
                Ok(ControlRecord::DirPush { mode, name })
            }
            TAG_DIR_POP => Ok(ControlRecord::DirPop),
            TAG_ACK => Ok(ControlRecord::Ack),
            TAG_ERROR => Ok(ControlRecord::Err(payload_text(payload))),
            _ => Err(ScpError::protocol_raw("unknown reply", msg)),
        }
    }
}

/// Error payload text, trailing newline removed.
pub fn payload_text(payload: &[u8]) -> String {
    String::from_utf8_lossy(strip_newline(payload)).into_owned()
}

fn strip_newline(payload: &[u8]) -> &[u8] {
    let payload = payload.strip_suffix(b"\n").unwrap_or(payload);
    payload.strip_suffix(b"\r").unwrap_or(payload)
}

/// Parse `"<mtime> 0 <atime> 0"`. An atime of 0 falls back to mtime.
pub fn parse_times(payload: &[u8]) -> Result<FileTimes> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| ScpError::protocol_raw("invalid time header", payload))?;
    let parts: Vec<&str> = text.split_whitespace().collect();

    if parts.len() != 4 || parts[1] != "0" || parts[3] != "0" {
        return Err(ScpError::protocol_raw("invalid time header", payload));
    }

    let mtime: i64 = parts[0]
        .parse()
        .map_err(|_| ScpError::protocol_raw("invalid time header", payload))?;
    let atime: i64 = parts[2]
        .parse()
        .map_err(|_| ScpError::protocol_raw("invalid time header", payload))?;

    Ok(FileTimes {
        mtime,
        atime: if atime == 0 { mtime } else { atime },
    })
}

/// Parse `"<octal-mode> <decimal-size> <name>"`.
///
/// The name is everything after the second space, so names containing
/// spaces survive.
pub fn parse_entry(payload: &[u8]) -> Result<(u32, u64, String)> {
    let text = std::str::from_utf8(strip_newline(payload))
        .map_err(|_| ScpError::protocol_raw("invalid file receive header", payload))?;
    let mut parts = text.splitn(3, ' ');

    let (mode, size, name) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(s), Some(n)) if !n.is_empty() => (m, s, n),
        _ => return Err(ScpError::protocol_raw("invalid file receive header", payload)),
    };

    let mode = u32::from_str_radix(mode, 8)
        .ok()
        .filter(|m| *m <= MODE_MASK)
        .ok_or_else(|| ScpError::protocol_raw("bad file mode", mode.as_bytes()))?;
    let size: u64 = size
        .parse()
        .map_err(|_| ScpError::protocol_raw("bad file size", size.as_bytes()))?;

    Ok((mode, size, name.to_string()))
}

// =============================================================================
// Remote command lines
// =============================================================================

/// `<cmd> -t <path>` or `<cmd> -r -t <path>`
pub fn sink_command(remote_command: &str, remote_path: &str, recursive: bool) -> String {
    let recurse = if recursive { " -r" } else { "" };
    format!("{}{} -t {}", remote_command, recurse, remote_path)
}

/// `<cmd>[ -r] -p -f <path>`
pub fn source_command(remote_command: &str, remote_path: &str, recursive: bool) -> String {
    let recurse = if recursive { " -r" } else { "" };
    format!("{}{} -p -f {}", remote_command, recurse, remote_path)
}

/// POSIX-style join for remote paths.
///
/// An absolute `name` replaces `base`; an empty `name` leaves `base` with a
/// trailing slash.
pub fn join_remote(base: &str, name: &str) -> String {
    if name.starts_with('/') || base.is_empty() {
        return name.to_string();
    }
    if base.ends_with('/') {
        format!("{}{}", base, name)
    } else {
        format!("{}/{}", base, name)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_records() {
        let t = ControlRecord::Time(FileTimes {
            mtime: 1700000000,
            atime: 1700000100,
        });
        assert_eq!(t.encode().as_ref(), b"T1700000000 0 1700000100 0\n");

        let c = ControlRecord::FileHeader {
            mode: 0o100644,
            size: 5,
            name: "report.txt".to_string(),
        };
        assert_eq!(c.encode().as_ref(), b"C0644 5 report.txt\n");

        let d = ControlRecord::DirPush {
            mode: 0o755,
            name: "a".to_string(),
        };
        assert_eq!(d.encode().as_ref(), b"D0755 0 a\n");

        assert_eq!(ControlRecord::DirPop.encode().as_ref(), b"E\n");
        assert_eq!(ControlRecord::Ack.encode().as_ref(), b"\x00");
    }

    #[test]
    fn test_decode_file_header() {
        let rec = ControlRecord::decode(b"C0644 12 hello world.txt\n").unwrap();
        assert_eq!(
            rec,
            ControlRecord::FileHeader {
                mode: 0o644,
                size: 12,
                name: "hello world.txt".to_string(),
            }
        );
    }

    #[test]
    fn test_decode_dir_push_ignores_size() {
        let rec = ControlRecord::decode(b"D0700 0 private\n").unwrap();
        assert_eq!(
            rec,
            ControlRecord::DirPush {
                mode: 0o700,
                name: "private".to_string(),
            }
        );
    }

    #[test]
    fn test_decode_bad_mode_and_size() {
        let err = ControlRecord::decode(b"C0689 12 f\n").unwrap_err();
        assert!(matches!(err, ScpError::Protocol { ref message, .. } if message == "bad file mode"));

        let err = ControlRecord::decode(b"C0644 -1 f\n").unwrap_err();
        assert!(matches!(err, ScpError::Protocol { ref message, .. } if message == "bad file size"));

        let err = ControlRecord::decode(b"C0644 12\n").unwrap_err();
        assert!(matches!(err, ScpError::Protocol { .. }));
    }

    #[test]
    fn test_parse_times() {
        let t = parse_times(b"1234 0 5678 0\n").unwrap();
        assert_eq!(t, FileTimes { mtime: 1234, atime: 5678 });

        // atime 0 falls back to mtime
        let t = parse_times(b"1234 0 0 0\n").unwrap();
        assert_eq!(t.atime, 1234);
    }

    #[test]
    fn test_parse_times_rejects_nonzero_fields() {
        for bad in [&b"1234 1 5678 0\n"[..], b"1234 0 5678 7\n", b"1234 0 5678\n", b"x 0 1 0\n"] {
            let err = parse_times(bad).unwrap_err();
            assert!(
                matches!(err, ScpError::Protocol { ref message, .. } if message == "invalid time header"),
                "{:?}",
                bad
            );
        }
    }

    #[test]
    fn test_decode_error_and_unknown() {
        assert_eq!(
            ControlRecord::decode(b"\x01scp: /nope: No such file or directory\n").unwrap(),
            ControlRecord::Err("scp: /nope: No such file or directory".to_string())
        );

        let err = ControlRecord::decode(b"Zwhat\n").unwrap_err();
        assert!(matches!(err, ScpError::Protocol { ref message, .. } if message == "unknown reply"));

        assert!(ControlRecord::decode(b"").is_err());
    }

    #[test]
    fn test_command_lines() {
        assert_eq!(sink_command("scp", "/tmp/x", false), "scp -t /tmp/x");
        assert_eq!(sink_command("scp", "/tmp/x", true), "scp -r -t /tmp/x");
        assert_eq!(source_command("scp", "/tmp/x", false), "scp -p -f /tmp/x");
        assert_eq!(
            source_command("/opt/bin/scp", "/tmp/x", true),
            "/opt/bin/scp -r -p -f /tmp/x"
        );
    }

    #[test]
    fn test_join_remote() {
        assert_eq!(join_remote("/srv", "a.txt"), "/srv/a.txt");
        assert_eq!(join_remote("/srv/", "a.txt"), "/srv/a.txt");
        assert_eq!(join_remote("/srv", "/etc/hosts"), "/etc/hosts");
        assert_eq!(join_remote("/srv", ""), "/srv/");
        assert_eq!(join_remote("", "a.txt"), "a.txt");
    }
}
