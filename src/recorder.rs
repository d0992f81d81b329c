//! Records one proxied exchange into a three-frame log and decides whether
//! it is worth keeping.
//!
//! Frames are written strictly in order: request, response header, response
//! body. The first response byte closes the request frame; the first
//! `\r\n\r\n` in the response stream closes the header frame.

use std::io::Write;
use std::sync::Arc;

use memchr::memmem;
use tempfile::NamedTempFile;

use crate::constants::MAX_REQUEST_HEAD;
use crate::error::Result;
use crate::io::{BoundedWriter, FrameWriter};
use crate::queue::{QueueKind, SequenceCounter};
use crate::types::{ExchangeMetadata, RequestHead, ResponseHead, SequenceId};

const HEADER_BOUNDARY: &[u8] = b"\r\n\r\n";

/// Capture limits and switches applied to every exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSettings {
    /// Request bytes logged before the exchange counts as overflowed.
    pub max_request_bytes: u64,
    /// Response body bytes logged before the exchange counts as overflowed.
    pub max_body_bytes: u64,
    /// Also persist every exchange, kept or not, as an `.mlog` copy.
    pub debug_mlog: bool,
}

/// Finds the end of a header block across successive reads.
#[derive(Debug, Default)]
pub(crate) struct BoundaryScanner {
    carry: Vec<u8>,
}

impl BoundaryScanner {
    /// Offset in `chunk` just past the boundary, if it ends inside `chunk`.
    pub(crate) fn scan(&mut self, chunk: &[u8]) -> Option<usize> {
        let lead = &chunk[..chunk.len().min(HEADER_BOUNDARY.len() - 1)];
        let mut seam = self.carry.clone();
        seam.extend_from_slice(lead);
        if let Some(at) = memmem::find(&seam, HEADER_BOUNDARY) {
            return Some(at + HEADER_BOUNDARY.len() - self.carry.len());
        }
        if let Some(at) = memmem::find(chunk, HEADER_BOUNDARY) {
            return Some(at + HEADER_BOUNDARY.len());
        }
        let keep = HEADER_BOUNDARY.len() - 1;
        self.carry.extend_from_slice(chunk);
        if self.carry.len() > keep {
            self.carry.drain(..self.carry.len() - keep);
        }
        None
    }
}

type LogFile = NamedTempFile;

enum Stage {
    Request(BoundedWriter<FrameWriter<LogFile>>),
    ResponseHeader(FrameWriter<LogFile>),
    ResponseBody(BoundedWriter<FrameWriter<LogFile>>),
    Complete(LogFile),
    Failed,
}

/// Outcome of finishing an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disposition {
    pub metadata: ExchangeMetadata,
    /// Id consumed by this exchange, if anything was persisted.
    pub id: Option<SequenceId>,
}

pub struct ExchangeRecorder {
    counter: Arc<SequenceCounter>,
    settings: CaptureSettings,
    request: RequestHead,
    stage: Stage,
    scanner: BoundaryScanner,
    response_head: Vec<u8>,
    overflowed: bool,
    bytes_received: u64,
}

impl ExchangeRecorder {
    /// Opens a temporary exchange log in the queue directory.
    pub fn begin(
        counter: Arc<SequenceCounter>,
        settings: CaptureSettings,
        request: RequestHead,
    ) -> Result<Self> {
        let file = counter.queue().temp_file()?;
        let frame = FrameWriter::new(file)?;
        Ok(Self {
            counter,
            settings,
            request,
            stage: Stage::Request(BoundedWriter::new(frame, settings.max_request_bytes)),
            scanner: BoundaryScanner::default(),
            response_head: Vec::new(),
            overflowed: false,
            bytes_received: 0,
        })
    }

    #[must_use]
    pub fn request(&self) -> &RequestHead {
        &self.request
    }

    /// Tees request bytes into the request frame. Bytes arriving after the
    /// response started are not logged.
    pub fn record_request(&mut self, bytes: &[u8]) {
        if let Stage::Request(writer) = &mut self.stage {
            if let Err(err) = writer.write_all(bytes) {
                self.fail("request frame", &err);
            }
        }
    }

    /// Tees response bytes into the header frame, then the body frame.
    pub fn record_response(&mut self, mut bytes: &[u8]) {
        if matches!(self.stage, Stage::Request(_)) {
            self.advance();
        }
        while !bytes.is_empty() {
            match &mut self.stage {
                Stage::ResponseHeader(writer) => {
                    let split = self.scanner.scan(bytes);
                    let (head, rest) = bytes.split_at(split.unwrap_or(bytes.len()));
                    if let Err(err) = writer.write_all(head) {
                        self.fail("response header frame", &err);
                        return;
                    }
                    self.response_head.extend_from_slice(head);
                    if split.is_none() && self.response_head.len() > MAX_REQUEST_HEAD {
                        tracing::debug!(uri = %self.request.uri(), "response header block too large");
                        self.overflowed = true;
                        self.advance();
                    }
                    if split.is_some() {
                        self.advance();
                    }
                    bytes = rest;
                }
                Stage::ResponseBody(writer) => {
                    if let Err(err) = writer.write_all(bytes) {
                        self.fail("response body frame", &err);
                    }
                    return;
                }
                Stage::Request(_) | Stage::Complete(_) | Stage::Failed => return,
            }
        }
    }

    /// Closes the current frame and opens the next one.
    fn advance(&mut self) {
        let stage = std::mem::replace(&mut self.stage, Stage::Failed);
        let next = match stage {
            Stage::Request(writer) => {
                self.overflowed |= writer.overflowed();
                writer
                    .into_inner()
                    .complete()
                    .and_then(FrameWriter::new)
                    .map(Stage::ResponseHeader)
            }
            Stage::ResponseHeader(writer) => writer.complete().and_then(FrameWriter::new).map(
                |frame| Stage::ResponseBody(BoundedWriter::new(frame, self.settings.max_body_bytes)),
            ),
            Stage::ResponseBody(writer) => {
                self.overflowed |= writer.overflowed();
                self.bytes_received = writer.received();
                writer.into_inner().complete().map(Stage::Complete)
            }
            done @ (Stage::Complete(_) | Stage::Failed) => Ok(done),
        };
        self.stage = match next {
            Ok(stage) => stage,
            Err(err) => {
                tracing::warn!(uri = %self.request.uri(), error = %err, "exchange log write failed");
                Stage::Failed
            }
        };
    }

    fn fail(&mut self, what: &str, err: &std::io::Error) {
        tracing::warn!(uri = %self.request.uri(), error = %err, "{what} write failed");
        self.stage = Stage::Failed;
    }

    /// Metadata for this exchange given the response head and body size.
    #[must_use]
    pub fn parse_response(&self, header: &[u8], bytes_received: u64) -> ExchangeMetadata {
        let response = ResponseHead::parse(header).ok();
        ExchangeMetadata::derive(
            &self.request,
            response.as_ref(),
            bytes_received,
            self.overflowed,
        )
    }

    /// Completes any open frames and disposes of the exchange.
    pub fn finish(mut self) -> Result<Disposition> {
        while matches!(
            self.stage,
            Stage::Request(_) | Stage::ResponseHeader(_) | Stage::ResponseBody(_)
        ) {
            self.advance();
        }
        let mut metadata = self.parse_response(&self.response_head, self.bytes_received);
        let file = match std::mem::replace(&mut self.stage, Stage::Failed) {
            Stage::Complete(file) => Some(file),
            _ => {
                metadata.discard = true;
                None
            }
        };
        let id = self.dispose(&metadata, file)?;
        Ok(Disposition { metadata, id })
    }

    /// Persists a kept exchange as `.qlog` and, when debugging, a copy as
    /// `.mlog`. Consumes a sequence id only when something is written.
    fn dispose(&self, metadata: &ExchangeMetadata, file: Option<LogFile>) -> Result<Option<SequenceId>> {
        let Some(file) = file else {
            tracing::debug!(exchange = %metadata.summary(), "exchange log incomplete; dropped");
            return Ok(None);
        };
        let keep = !metadata.discard;
        if !keep && !self.settings.debug_mlog {
            tracing::debug!(exchange = %metadata.summary(), "exchange discarded");
            return Ok(None);
        }

        let id = self.counter.issue()?;
        let queue = self.counter.queue();
        if self.settings.debug_mlog {
            fs_err::copy(file.path(), queue.path_for(id, QueueKind::Debug))?;
        }
        if keep {
            file.persist(queue.path_for(id, QueueKind::Captured))
                .map_err(|err| err.error)?;
        }
        tracing::info!(exchange.id = %id, kept = keep, "{}", metadata.summary());
        Ok(Some(id))
    }
}
