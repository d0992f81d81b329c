//! Decoding of captured response bodies according to their transfer and
//! content encodings.

use std::io::{self, BufRead, BufReader, Read};

use flate2::read::{GzDecoder, ZlibDecoder};

use crate::error::{Result, TrawlError};

/// Wraps `body` so reads yield the decoded payload.
///
/// Transfer codings are removed first, then content codings, each list from
/// the last applied coding to the first. Unknown codings are rejected.
pub fn decode_body<'a, R: Read + 'a>(
    body: R,
    transfer_encoding: Option<&str>,
    content_encoding: Option<&str>,
) -> Result<Box<dyn Read + 'a>> {
    let mut reader: Box<dyn Read + 'a> = Box::new(body);
    for coding in codings(transfer_encoding).into_iter().rev() {
        reader = match coding.as_str() {
            "chunked" => Box::new(ChunkedDecoder::new(BufReader::new(reader))),
            _ => apply_content_coding(reader, &coding)?,
        };
    }
    for coding in codings(content_encoding).into_iter().rev() {
        reader = apply_content_coding(reader, &coding)?;
    }
    Ok(reader)
}

fn codings(header: Option<&str>) -> Vec<String> {
    header
        .unwrap_or_default()
        .split(',')
        .map(|coding| coding.trim().to_ascii_lowercase())
        .filter(|coding| !coding.is_empty())
        .collect()
}

fn apply_content_coding<'a>(reader: Box<dyn Read + 'a>, coding: &str) -> Result<Box<dyn Read + 'a>> {
    Ok(match coding {
        "identity" => reader,
        "gzip" | "x-gzip" => Box::new(GzDecoder::new(reader)),
        "deflate" => Box::new(ZlibDecoder::new(reader)),
        other => {
            return Err(TrawlError::UnsupportedEncoding {
                encoding: other.to_string(),
            });
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    Done,
}

/// Decodes `Transfer-Encoding: chunked`. A body cut off mid-stream ends
/// quietly at the last complete byte.
#[derive(Debug)]
pub struct ChunkedDecoder<R: BufRead> {
    inner: R,
    state: ChunkState,
}

impl<R: BufRead> ChunkedDecoder<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            state: ChunkState::Size,
        }
    }

    fn read_size(&mut self) -> io::Result<Option<u64>> {
        let mut line = String::new();
        if self.inner.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let digits = line.split(';').next().unwrap_or_default().trim();
        if digits.is_empty() {
            // blank line left over from the previous chunk
            return self.read_size();
        }
        u64::from_str_radix(digits, 16)
            .map(Some)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, format!("bad chunk size {digits:?}")))
    }

    fn skip_trailers(&mut self) -> io::Result<()> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.inner.read_line(&mut line)? == 0 || line.trim().is_empty() {
                return Ok(());
            }
        }
    }
}

impl<R: BufRead> Read for ChunkedDecoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.state {
                ChunkState::Done => return Ok(0),
                ChunkState::Size => match self.read_size()? {
                    None => self.state = ChunkState::Done,
                    Some(0) => {
                        self.skip_trailers()?;
                        self.state = ChunkState::Done;
                    }
                    Some(size) => self.state = ChunkState::Data(size),
                },
                ChunkState::Data(remaining) => {
                    if buf.is_empty() {
                        return Ok(0);
                    }
                    let max = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
                    let n = self.inner.read(&mut buf[..max])?;
                    if n == 0 {
                        self.state = ChunkState::Done;
                        return Ok(0);
                    }
                    let left = remaining - n as u64;
                    self.state = if left == 0 {
                        ChunkState::Size
                    } else {
                        ChunkState::Data(left)
                    };
                    return Ok(n);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn decode_all(body: &[u8], te: Option<&str>, ce: Option<&str>) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        decode_body(body, te, ce)?.read_to_end(&mut out)?;
        Ok(out)
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn identity_passes_through() {
        assert_eq!(decode_all(b"plain", None, None).unwrap(), b"plain");
        assert_eq!(decode_all(b"plain", None, Some("identity")).unwrap(), b"plain");
    }

    #[test]
    fn chunked_with_extensions_and_trailers() {
        let body = b"5;name=x\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: y\r\n\r\n";
        assert_eq!(
            decode_all(body, Some("chunked"), None).unwrap(),
            b"hello world"
        );
    }

    #[test]
    fn truncated_chunked_body_ends_quietly() {
        let body = b"a\r\nhello";
        assert_eq!(decode_all(body, Some("Chunked"), None).unwrap(), b"hello");
    }

    #[test]
    fn gzip_inside_chunked() {
        let compressed = gzip(b"<html>compressed</html>");
        let mut body = format!("{:x}\r\n", compressed.len()).into_bytes();
        body.extend_from_slice(&compressed);
        body.extend_from_slice(b"\r\n0\r\n\r\n");
        assert_eq!(
            decode_all(&body, Some("chunked"), Some("gzip")).unwrap(),
            b"<html>compressed</html>"
        );
    }

    #[test]
    fn unsupported_encoding_is_an_error() {
        let err = decode_all(b"x", None, Some("br")).expect_err("br unsupported");
        assert!(matches!(
            err,
            TrawlError::UnsupportedEncoding { ref encoding } if encoding == "br"
        ));
    }
}
