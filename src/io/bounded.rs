//! Byte caps on both sides of a capture: a writer that drops what exceeds
//! its cap and a reader that fails once its source yields too much.

use std::io::{self, Read, Write};

#[derive(Debug)]
pub struct BoundedWriter<W: Write> {
    inner: W,
    cap: u64,
    /// Bytes offered, including dropped ones.
    received: u64,
    forwarded: u64,
    overflowed: bool,
}

impl<W: Write> BoundedWriter<W> {
    #[must_use]
    pub fn new(inner: W, cap: u64) -> Self {
        Self {
            inner,
            cap,
            received: 0,
            forwarded: 0,
            overflowed: false,
        }
    }

    #[must_use]
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    #[must_use]
    pub fn received(&self) -> u64 {
        self.received
    }

    #[must_use]
    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for BoundedWriter<W> {
    /// Always reports the full buffer as written; excess bytes are dropped.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.received += buf.len() as u64;
        let room = self.cap.saturating_sub(self.forwarded);
        let take = buf.len().min(usize::try_from(room).unwrap_or(usize::MAX));
        if take < buf.len() {
            self.overflowed = true;
        }
        if take > 0 {
            self.inner.write_all(&buf[..take])?;
            self.forwarded += take as u64;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reader that errors with `InvalidData` once `inner` yields more than
/// `limit` bytes.
#[derive(Debug)]
pub struct BoundedReader<R: Read> {
    inner: R,
    remaining: u64,
    limit: u64,
}

impl<R: Read> BoundedReader<R> {
    #[must_use]
    pub fn new(inner: R, limit: u64) -> Self {
        Self {
            inner,
            remaining: limit,
            limit,
        }
    }
}

impl<R: Read> Read for BoundedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.remaining == 0 {
            // read one more byte to tell a clean end from an overrun
            let mut extra = [0u8; 1];
            return match self.inner.read(&mut extra)? {
                0 => Ok(0),
                _ => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("decoded body exceeds {} bytes", self.limit),
                )),
            };
        }
        let room = usize::try_from(self.remaining).unwrap_or(usize::MAX).min(buf.len());
        let n = self.inner.read(&mut buf[..room])?;
        self.remaining -= n as u64;
        Ok(n)
    }
}
