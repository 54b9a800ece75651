// SPDX-License-Identifier: GPL-3.0-or-later

//! Length-prefix framing for messages over TCP.
//!
//! TCP is a stream protocol without message boundaries; every message is
//! delimited by a 4-byte big-endian length header:
//!
//! ```text
//! +----------------+-------------------+
//! | Length (4B BE) | Message payload   |
//! +----------------+-------------------+
//! ```

use std::io::{self, Read, Write};

/// Frame header size (4 bytes for length).
pub const FRAME_HEADER_SIZE: usize = 4;

/// Maximum accepted frame size (anti-OOM protection).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Write one frame.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds maximum", payload.len()),
        ));
    }
    let header = (payload.len() as u32).to_be_bytes();
    writer.write_all(&header)?;
    writer.write_all(payload)?;
    writer.flush()
}

/// How many consecutive read timeouts mid-frame before the peer is
/// considered dead. At a frame boundary a timeout is a normal poll result
/// and is propagated immediately.
const MAX_STALL_RETRIES: u32 = 20;

/// Read one frame.
///
/// Returns `Ok(None)` on a clean close at a frame boundary; a close in the
/// middle of a frame is an `UnexpectedEof` error. A read timeout before
/// the first byte surfaces as `WouldBlock`/`TimedOut` (the caller's poll
/// interval); a timeout after the first byte means the frame is still
/// trickling in and the read continues.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    let first = loop {
        match reader.read(&mut header) {
            Ok(n) => break n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    };
    if first == 0 {
        return Ok(None);
    }
    read_remaining(reader, &mut header, first)?;

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds maximum"),
        ));
    }
    let mut payload = vec![0u8; len];
    read_remaining(reader, &mut payload, 0)?;
    Ok(Some(payload))
}

/// Fill `buf[filled..]`, riding out interrupts and a bounded number of
/// poll timeouts (the frame has started, the rest is in flight).
fn read_remaining<R: Read>(reader: &mut R, buf: &mut [u8], mut filled: usize) -> io::Result<()> {
    let mut stalls = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-frame",
                ))
            }
            Ok(n) => {
                filled += n;
                stalls = 0;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                stalls += 1;
                if stalls > MAX_STALL_RETRIES {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "frame stalled mid-transfer",
                    ));
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").unwrap();
        write_frame(&mut buf, b"").unwrap();
        write_frame(&mut buf, b"world!").unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), b"hello");
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), b"");
        assert_eq!(read_frame(&mut cursor).unwrap().unwrap(), b"world!");
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_SIZE as u32 + 1).to_be_bytes());
        let mut cursor = Cursor::new(buf);
        assert!(read_frame(&mut cursor).is_err());
    }

    #[test]
    fn test_truncated_frame_is_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").unwrap();
        buf.truncate(buf.len() - 2);
        let mut cursor = Cursor::new(buf);
        assert!(read_frame(&mut cursor).is_err());
    }
}
