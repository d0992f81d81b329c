//! Length-prefixed frames inside append-only container files.
//!
//! Layout of one frame:
//!
//! ```text
//! <decimal length>\r\n<padding spaces>\r\n<payload bytes>\r\n\r\n
//! ```
//!
//! The header (length line + padding line) occupies a fixed width reserved
//! before the payload is written, so a writer that does not know the final
//! size can stream the payload and back-patch the length on `complete`.
//! Readers accept any whitespace-only padding line, including an empty one.

use std::cmp::min;
use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::constants::{FRAME_END_MARKER, FRAME_HEADER_WIDTH, FRAME_MAX_LINE};
use crate::error::{Result, TrawlError};

// "0\r\n" + "\r\n"
const MIN_HEADER_WIDTH: usize = 5;
const MAX_PADDING_LINE: usize = 4096;

fn encode_header(length: u64, width: usize) -> Result<Vec<u8>> {
    let digits = length.to_string();
    if digits.len() + 4 > width {
        return Err(TrawlError::FrameTooLarge { length, width });
    }
    let mut header = Vec::with_capacity(width);
    header.extend_from_slice(digits.as_bytes());
    header.extend_from_slice(b"\r\n");
    header.resize(width - 2, b' ');
    header.extend_from_slice(b"\r\n");
    Ok(header)
}

/// Streams one frame payload, back-patching its length on [`complete`](Self::complete).
#[derive(Debug)]
pub struct FrameWriter<W: Write + Seek> {
    inner: W,
    header_offset: u64,
    header_width: usize,
    written: u64,
}

impl<W: Write + Seek> FrameWriter<W> {
    /// Reserves a header at the current position of `inner`.
    pub fn new(inner: W) -> Result<Self> {
        Self::with_header_width(inner, FRAME_HEADER_WIDTH)
    }

    pub fn with_header_width(mut inner: W, header_width: usize) -> Result<Self> {
        if header_width < MIN_HEADER_WIDTH {
            return Err(TrawlError::FrameTooLarge {
                length: 0,
                width: header_width,
            });
        }
        let header_offset = inner.stream_position()?;
        inner.write_all(&encode_header(0, header_width)?)?;
        Ok(Self {
            inner,
            header_offset,
            header_width,
            written: 0,
        })
    }

    /// Payload bytes written so far.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Writes the end marker, patches the header, and hands back the
    /// underlying writer positioned after the frame.
    pub fn complete(mut self) -> Result<W> {
        let header = encode_header(self.written, self.header_width)?;
        self.inner.write_all(FRAME_END_MARKER)?;
        let end = self.inner.stream_position()?;
        self.inner.seek(SeekFrom::Start(self.header_offset))?;
        self.inner.write_all(&header)?;
        self.inner.seek(SeekFrom::Start(end))?;
        tracing::trace!(
            frame.offset = self.header_offset,
            frame.length = self.written,
            "frame completed"
        );
        Ok(self.inner)
    }
}

impl<W: Write + Seek> Write for FrameWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reads one frame payload as a bounded, seekable stream.
///
/// The next frame in the same container can only be located after
/// [`complete`](Self::complete) has verified this frame's end marker.
#[derive(Debug)]
pub struct FrameReader<R: Read + Seek> {
    inner: R,
    start: u64,
    len: u64,
    pos: u64,
}

impl<R: Read + Seek> FrameReader<R> {
    /// Parses a frame header at the current position of `inner`.
    pub fn new(mut inner: R) -> Result<Self> {
        let header_offset = inner.stream_position()?;

        let length_line = read_raw_line(&mut inner, FRAME_MAX_LINE, header_offset)?;
        let length_text = String::from_utf8_lossy(&length_line);
        let length_text = length_text.trim();
        if length_text.is_empty() || !length_text.bytes().all(|b| b.is_ascii_digit()) {
            return Err(TrawlError::malformed(
                header_offset,
                format!("invalid length line {length_text:?}"),
            ));
        }
        let len: u64 = length_text.parse().map_err(|_| {
            TrawlError::malformed(header_offset, format!("length out of range {length_text:?}"))
        })?;

        let padding = read_raw_line(&mut inner, MAX_PADDING_LINE, header_offset)?;
        if !padding.iter().all(u8::is_ascii_whitespace) {
            return Err(TrawlError::malformed(
                header_offset,
                "padding line is not blank",
            ));
        }

        let start = inner.stream_position()?;
        Ok(Self {
            inner,
            start,
            len,
            pos: 0,
        })
    }

    /// Declared payload length.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.len - self.pos
    }

    /// Reads up to and including the next `\n`, never past the payload end.
    pub fn read_line(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        let mut count = 0;
        let mut byte = [0u8; 1];
        while self.read(&mut byte)? == 1 {
            buf.push(byte[0]);
            count += 1;
            if byte[0] == b'\n' {
                break;
            }
        }
        Ok(count)
    }

    /// Skips unread payload, verifies the end marker, and returns the
    /// underlying reader positioned at the next frame.
    pub fn complete(mut self) -> Result<R> {
        let end = self.start + self.len;
        self.inner.seek(SeekFrom::Start(end))?;
        let mut marker = [0u8; 4];
        match self.inner.read_exact(&mut marker) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(TrawlError::malformed(end, "missing end marker"));
            }
            Err(err) => return Err(err.into()),
        }
        if &marker != FRAME_END_MARKER {
            return Err(TrawlError::malformed(end, "end marker mismatch"));
        }
        Ok(self.inner)
    }
}

impl<R: Read + Seek> Read for FrameReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.remaining();
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let max = min(buf.len() as u64, remaining) as usize;
        let n = self.inner.read(&mut buf[..max])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for FrameReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => i128::from(self.pos) + i128::from(delta),
            SeekFrom::End(delta) => i128::from(self.len) + i128::from(delta),
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of frame",
            ));
        }
        let target = min(target as u64, self.len);
        self.inner.seek(SeekFrom::Start(self.start + target))?;
        self.pos = target;
        Ok(target)
    }
}

/// Reads one `\n`-terminated line, stripping `\r\n`.
fn read_raw_line<R: Read>(inner: &mut R, limit: usize, offset: u64) -> Result<Vec<u8>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match inner.read(&mut byte) {
            Ok(0) => return Err(TrawlError::malformed(offset, "truncated frame header")),
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
        if byte[0] == b'\n' {
            break;
        }
        if line.len() >= limit {
            return Err(TrawlError::malformed(offset, "frame header line too long"));
        }
        line.push(byte[0]);
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(line)
}

/// Writes `payload` as one complete frame.
pub fn write_frame<W: Write + Seek>(inner: W, payload: &[u8]) -> Result<W> {
    let mut writer = FrameWriter::new(inner)?;
    writer.write_all(payload)?;
    writer.complete()
}

/// Reads every frame of a container into memory.
pub fn read_frames<R: Read + Seek>(mut inner: R) -> Result<Vec<Vec<u8>>> {
    let total = inner.seek(SeekFrom::End(0))?;
    inner.seek(SeekFrom::Start(0))?;
    let mut frames = Vec::new();
    while inner.stream_position()? < total {
        let mut reader = FrameReader::new(inner)?;
        let mut payload = Vec::with_capacity(min(reader.len(), 1 << 20) as usize);
        reader.read_to_end(&mut payload)?;
        if payload.len() as u64 != reader.len() {
            return Err(TrawlError::malformed(
                reader.start,
                "payload shorter than declared length",
            ));
        }
        inner = reader.complete()?;
        frames.push(payload);
    }
    Ok(frames)
}
