//! The bounded in-memory pipe engine (spec §4.5).
//!
//! A pipe node holds a single 1 KiB ring buffer; `write_offset` is the
//! number of unread bytes currently buffered, not a true producer/consumer
//! cursor pair — a `read` always drains everything in one shot and resets
//! the offset to zero, matching the original's all-or-nothing behavior.
//!
//! Open Question 4 (buffer full/wrap) is resolved here: a write that would
//! overflow the buffer returns `Errno::EAGAIN` for one attempt; `fs.rs`
//! turns that into a blocking retry loop unless the writer fd carries
//! `O_NONBLOCK`, in which case `EAGAIN` is propagated to the caller. This
//! avoids the original's unchecked overflow while staying within the
//! spec'd fixed buffer size (no silent resize into an unbounded buffer).

use crate::error::{Errno, Result};
use crate::node::PipeState;

/// Attempt to append `buf` to the pipe. Returns `Ok(n)` for the number of
/// bytes written (`n <= buf.len()`, and `n` may be less than `buf.len()` if
/// only partial space remains), or `Err(EAGAIN)` if the buffer is entirely
/// full.
pub fn write(pipe: &mut PipeState, buf: &[u8]) -> Result<usize> {
    let capacity = pipe.buffer.len();
    if pipe.write_offset >= capacity {
        return Err(Errno::EAGAIN);
    }

    let available = capacity - pipe.write_offset;
    let n = buf.len().min(available);
    pipe.buffer[pipe.write_offset..pipe.write_offset + n].copy_from_slice(&buf[..n]);
    pipe.write_offset += n;
    Ok(n)
}

/// True while there is buffered, unread data.
pub fn has_data(pipe: &PipeState) -> bool {
    pipe.write_offset > 0
}

/// Drain the entire buffer into `out`, resetting the write offset to zero.
/// Returns the number of bytes copied (`min(out.len(), buffered bytes)`);
/// any bytes beyond `out.len()` are dropped, matching the original's
/// whole-buffer read semantics (the core does not support partial reads
/// that leave a remainder for the next call).
pub fn drain(pipe: &mut PipeState, out: &mut [u8]) -> usize {
    let n = pipe.write_offset.min(out.len());
    out[..n].copy_from_slice(&pipe.buffer[..n]);
    pipe.write_offset = 0;
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::PIPE_SIZE;

    fn new_pipe() -> PipeState {
        PipeState {
            buffer: Box::new([0u8; PIPE_SIZE]),
            write_offset: 0,
            reader: None,
            writer: None,
        }
    }

    #[test]
    fn fifo_round_trip() {
        let mut pipe = new_pipe();
        assert_eq!(write(&mut pipe, b"abc").unwrap(), 3);
        assert!(has_data(&pipe));

        let mut out = [0u8; 3];
        assert_eq!(drain(&mut pipe, &mut out), 3);
        assert_eq!(&out, b"abc");
        assert!(!has_data(&pipe));
    }

    #[test]
    fn write_past_capacity_truncates_then_eagains() {
        let mut pipe = new_pipe();
        let full = vec![1u8; PIPE_SIZE];
        assert_eq!(write(&mut pipe, &full).unwrap(), PIPE_SIZE);
        assert!(matches!(write(&mut pipe, b"x"), Err(e) if e.code() == libc::EAGAIN));
    }
}
