use std::io::{self, Read, Write};

use ferry_wire::Buffer;

/// The non-fatal result of a single read or write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    /// This many bytes moved. Zero is possible for writes and means "try again later".
    Transferred(usize),
    /// Nothing could move without blocking.
    WouldBlock,
    /// The transport can't make progress until it is readable (TLS renegotiation or handshake).
    WantRead,
    /// The transport can't make progress until it is writable (TLS handshake backpressure).
    WantWrite,
    /// The peer closed its side of the stream.
    Closed,
}

impl IoOutcome {
    /// Bytes moved by this attempt.
    pub fn transferred(&self) -> usize {
        match self {
            Self::Transferred(n) => *n,
            _ => 0,
        }
    }
}

/// Reads up to `at_most` bytes from `reader` straight into the tail of `buf`.
///
/// Each read targets the free space of a single chunk; a short read ends the attempt. A transfer
/// does not prove the socket is drained, so callers must retry until they see
/// [`IoOutcome::WouldBlock`] or [`IoOutcome::Closed`].
pub fn read_to_buffer<R: Read>(
    reader: &mut R,
    buf: &mut Buffer,
    at_most: usize,
) -> io::Result<IoOutcome> {
    let mut total = 0;

    while total < at_most {
        let want = at_most - total;
        let spare = buf.reserve_tail(want);
        let len = spare.len().min(want);

        match reader.read(&mut spare[..len]) {
            Ok(0) if total == 0 => return Ok(IoOutcome::Closed),
            // Report what we have; the caller's retry sees the EOF.
            Ok(0) => break,
            Ok(n) => {
                buf.commit_tail(n);
                total += n;
                if n < len {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if total == 0 {
                    return Ok(IoOutcome::WouldBlock);
                }
                break;
            }
            Err(e) => return Err(e),
        }
    }

    Ok(IoOutcome::Transferred(total))
}

/// Writes up to `at_most` bytes from the head of `buf` to `writer`, one chunk at a time,
/// draining what was written.
pub fn flush_from_buffer<W: Write>(
    writer: &mut W,
    buf: &mut Buffer,
    at_most: usize,
) -> io::Result<IoOutcome> {
    let mut total = 0;

    while total < at_most && !buf.is_empty() {
        let chunk = buf.first_chunk();
        let len = chunk.len().min(at_most - total);

        match writer.write(&chunk[..len]) {
            Ok(n) => {
                buf.drain(n);
                total += n;
                if n < len {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if total == 0 {
                    return Ok(IoOutcome::WouldBlock);
                }
                break;
            }
            Err(e) => return Err(e),
        }
    }

    Ok(IoOutcome::Transferred(total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Accepts a fixed number of bytes per call, then blocks.
    struct Trickle {
        written: Vec<u8>,
        per_call: usize,
        calls_left: usize,
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.calls_left == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.calls_left -= 1;
            let n = buf.len().min(self.per_call);
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn reads_respect_the_budget() {
        let mut reader = Cursor::new(vec![7u8; 10_000]);
        let mut buf = Buffer::new();

        assert_eq!(read_to_buffer(&mut reader, &mut buf, 3000).unwrap(), IoOutcome::Transferred(3000));
        assert_eq!(buf.len(), 3000);

        let outcome = read_to_buffer(&mut reader, &mut buf, usize::MAX).unwrap();
        assert_eq!(outcome.transferred(), 7000);
        assert_eq!(read_to_buffer(&mut reader, &mut buf, 100).unwrap(), IoOutcome::Closed);
        buf.assert_ok();
    }

    #[test]
    fn writes_stop_on_would_block() {
        let mut buf = Buffer::with_chunk_size(256);
        buf.append(&[1u8; 1000]);
        let mut writer = Trickle { written: Vec::new(), per_call: 100, calls_left: 2 };

        assert_eq!(flush_from_buffer(&mut writer, &mut buf, 1000).unwrap(), IoOutcome::Transferred(100));
        assert_eq!(buf.len(), 900);

        writer.per_call = 1000;
        assert_eq!(flush_from_buffer(&mut writer, &mut buf, 1000).unwrap(), IoOutcome::Transferred(900));
        assert!(buf.is_empty());

        buf.append(b"more");
        assert_eq!(flush_from_buffer(&mut writer, &mut buf, 1000).unwrap(), IoOutcome::WouldBlock);
        assert_eq!(writer.written.len(), 1000);
    }

    #[test]
    fn zero_length_write_is_not_terminal() {
        struct Stalled;
        impl Write for Stalled {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut buf = Buffer::new();
        buf.append(b"abc");
        assert_eq!(flush_from_buffer(&mut Stalled, &mut buf, 10).unwrap(), IoOutcome::Transferred(0));
        assert_eq!(buf.len(), 3);
    }
}
