//! Incremental MSRP frame decoder.
//!
//! [`MessageBuffer`] turns a TCP byte stream into frames without requiring a
//! whole frame to fit in memory: the caller appends socket bytes into
//! [`writable`](MessageBuffer::writable), declares them with
//! [`read`](MessageBuffer::read), and watches the state advance through
//! `Status → Headers → Content → Complete`. While a SEND body is still in
//! flight, [`contents`](MessageBuffer::contents) exposes the publishable
//! prefix and [`erase`](MessageBuffer::erase) frees it, so bodies larger
//! than the buffer stream through.
//!
//! A frame ends with `"-------" transaction-id [+$#]`. The decoder searches
//! for the delimiter backwards from the buffer tail and withholds a safety
//! margin of `7 + tid.len() + 1` bytes from the publishable range so a
//! partially received delimiter can never be mistaken for body bytes.

use std::ops::Range;

use bytes::Bytes;
use num_enum::TryFromPrimitive;

use crate::error::{Error, ParseError, Result};
use crate::message::{Message, Method, MsgStatus};

/// Default per-connection parse buffer size.
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// End-delimiter terminator byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Terminator {
    Continued = b'+',
    Complete = b'$',
    Interrupted = b'#',
}

impl From<Terminator> for MsgStatus {
    fn from(terminator: Terminator) -> MsgStatus {
        match terminator {
            Terminator::Continued => MsgStatus::Continued,
            Terminator::Complete => MsgStatus::Complete,
            Terminator::Interrupted => MsgStatus::Interrupted,
        }
    }
}

/// Decoder progress for the frame currently at the buffer head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Status,
    Headers,
    Content,
    Complete,
}

/// What to do with body bytes when materializing a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    CopyContents,
    NoContents,
}

#[derive(Debug)]
pub struct MessageBuffer {
    buf: Box<[u8]>,
    stored: usize,
    state: BufferState,
    tid: String,
    method: Method,
    status: MsgStatus,
    status_range: Range<usize>,
    header_range: Range<usize>,
    content_range: Range<usize>,
    token_range: Range<usize>,
}

impl Default for MessageBuffer {
    fn default() -> MessageBuffer {
        MessageBuffer::new(DEFAULT_BUFFER_SIZE)
    }
}

impl MessageBuffer {
    pub fn new(capacity: usize) -> MessageBuffer {
        MessageBuffer {
            buf: vec![0; capacity].into_boxed_slice(),
            stored: 0,
            state: BufferState::Status,
            tid: String::new(),
            method: Method::Send,
            status: MsgStatus::Complete,
            status_range: 0..0,
            header_range: 0..0,
            content_range: 0..0,
            token_range: 0..0,
        }
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    /// Method of the frame being decoded; meaningful from `Headers` onward.
    pub fn method(&self) -> Method {
        self.method
    }

    /// Continuation status: `Streaming` until the end delimiter is seen,
    /// then whatever the terminator byte said.
    pub fn status(&self) -> MsgStatus {
        self.status
    }

    pub fn transaction(&self) -> &str {
        &self.tid
    }

    /// Free space for the next socket read. Fetch this only after the
    /// previous `read`/`erase`/`reset` cycle has run.
    pub fn writable(&mut self) -> &mut [u8] {
        &mut self.buf[self.stored..]
    }

    /// Declare `n` freshly written bytes and advance the decoder.
    ///
    /// Fails with [`Error::BufferExhausted`] when the buffer is full and the
    /// current frame still has not produced progress; for a SEND body the
    /// caller frees space with [`erase`](MessageBuffer::erase) instead.
    pub fn read(&mut self, n: usize) -> Result<()> {
        debug_assert!(self.stored + n <= self.buf.len());

        let mut pos = 0;

        if self.state == BufferState::Complete {
            self.stored += n;
            self.reset();
        } else {
            if self.stored == self.buf.len() {
                return Err(Error::BufferExhausted);
            }

            if self.state != BufferState::Status {
                // Rescan far enough back that a delimiter split across two
                // reads is still found.
                pos = self.stored.saturating_sub(16 + self.tid.len());
            }

            self.stored += n;
        }

        if self.state == BufferState::Status {
            match self.scan_status()? {
                Some(next) => {
                    self.state = BufferState::Headers;
                    pos = next;
                }
                None => return Ok(()),
            }
        }

        if self.state == BufferState::Headers {
            if let Some(next) = self.scan_headers(pos) {
                self.state = BufferState::Content;
                pos = next;
            }
        }

        // A zero-body frame may follow its headers with the end delimiter
        // directly, so the token scan also runs while still in Headers.
        if matches!(self.state, BufferState::Headers | BufferState::Content) {
            if self.scan_end_token(pos) {
                self.state = BufferState::Complete;
            } else {
                self.set_content_range();
            }
        }

        Ok(())
    }

    /// Materialize the captured status line and headers as a [`Message`].
    pub fn parse(&self, mode: ParseMode) -> Result<Message> {
        if !matches!(self.state, BufferState::Content | BufferState::Complete)
            || self.status_range.is_empty()
            || self.header_range.is_empty()
        {
            return Err(Error::InvalidState("no parsed frame available"));
        }

        let head = &self.buf[self.status_range.start..self.header_range.end];
        let mut message = Message::parse(head).map_err(Error::Parse)?;

        message.set_status(self.status);

        if mode == ParseMode::CopyContents && !self.content_range.is_empty() {
            message.set_body(Bytes::copy_from_slice(self.contents()));
        }

        Ok(message)
    }

    /// The publishable body range: everything past the headers except the
    /// safety margin (empty until enough bytes are in).
    pub fn contents(&self) -> &[u8] {
        &self.buf[self.content_range.clone()]
    }

    /// Discard the parsed header region and any body bytes already handed
    /// out through [`contents`](MessageBuffer::contents), keeping the
    /// undelivered tail. Only makes progress; delivered bytes are never
    /// re-delivered.
    pub fn erase(&mut self) {
        if self.state == BufferState::Content {
            let consumed = if !self.content_range.is_empty() {
                self.content_range.end
            } else if !self.header_range.is_empty() {
                self.header_range.end
            } else {
                0
            };

            if consumed > 0 {
                self.buf.copy_within(consumed..self.stored, 0);
                self.stored -= consumed;
            }

            self.clear_ranges();
            return;
        }

        self.stored = 0;
        self.clear_ranges();
    }

    /// Rewind for the next frame. Trailing bytes past the end delimiter
    /// belong to the next frame and are shifted to the buffer head.
    pub fn reset(&mut self) {
        if self.state == BufferState::Complete {
            let mut next = self.token_range.end;
            while next < self.stored && self.buf[next].is_ascii_whitespace() {
                next += 1;
            }

            self.buf.copy_within(next..self.stored, 0);
            self.stored -= next;
        } else {
            self.stored = 0;
        }

        self.tid.clear();
        self.state = BufferState::Status;
        self.status = MsgStatus::Complete;
        self.method = Method::Send;
        self.clear_ranges();
    }

    fn clear_ranges(&mut self) {
        self.status_range = 0..0;
        self.header_range = 0..0;
        self.content_range = 0..0;
        self.token_range = 0..0;
    }

    fn safety(&self) -> usize {
        7 + self.tid.len() + 1
    }

    /// Match the status line at the buffer head:
    /// `MSRP <tid> <METHOD | code phrase>\r\n`. Returns the scan position
    /// past the line once the whole line is in.
    fn scan_status(&mut self) -> Result<Option<usize>> {
        let data = &self.buf[..self.stored];

        if data.len() < 5 {
            return Ok(None);
        }
        if &data[..4] != b"MSRP" {
            return Err(Error::Parse(ParseError::Frame(
                "stream does not begin with MSRP".to_string(),
            )));
        }

        let mut i = 4;
        while i < data.len() && (data[i] == b' ' || data[i] == b'\t') {
            i += 1;
        }
        if i == 4 {
            return Err(Error::Parse(ParseError::Frame("missing blank after MSRP".to_string())));
        }

        let tid_start = i;
        while i < data.len()
            && (data[i].is_ascii_alphanumeric() || matches!(data[i], b'.' | b'-' | b'+' | b'%' | b'='))
        {
            i += 1;
        }
        if i == tid_start {
            if i < data.len() {
                return Err(Error::Parse(ParseError::Frame("missing transaction id".to_string())));
            }
            return Ok(None);
        }

        let Some(eol) = find(&data[i..], b"\r\n") else {
            return Ok(None);
        };
        let eol = i + eol;

        // One blank, then the method or a response status.
        if i == eol || !(data[i] == b' ' || data[i] == b'\t') {
            return Err(Error::Parse(ParseError::Frame(
                "missing method in status line".to_string(),
            )));
        }

        self.method = match &data[i + 1..eol] {
            b"AUTH" => Method::Auth,
            b"SEND" => Method::Send,
            b"REPORT" => Method::Report,
            _ => Method::Response,
        };

        self.tid = String::from_utf8_lossy(&data[tid_start..i]).into_owned();
        self.status_range = 0..eol + 2;

        Ok(Some(eol + 2))
    }

    /// Find the blank line separating headers from content.
    fn scan_headers(&mut self, from: usize) -> Option<usize> {
        let data = &self.buf[..self.stored];

        find(&data[from..], b"\r\n\r\n").map(|i| {
            let end = from + i + 4;
            let start = if self.status_range.is_empty() {
                from
            } else {
                self.status_range.end
            };
            self.header_range = start..end;
            end
        })
    }

    /// Search backwards from the tail for `"-------" tid [+$#]`.
    fn scan_end_token(&mut self, from: usize) -> bool {
        let data = &self.buf[..self.stored];

        let mut marker = Vec::with_capacity(7 + self.tid.len());
        marker.extend_from_slice(b"-------");
        marker.extend_from_slice(self.tid.as_bytes());

        let Some(at) = rfind(&data[from..], &marker) else {
            return false;
        };
        let at = from + at;

        let term_at = at + marker.len();
        if term_at >= self.stored {
            // Delimiter present but the terminator byte has not arrived.
            return false;
        }

        let Ok(terminator) = Terminator::try_from(data[term_at]) else {
            return false;
        };

        self.token_range = at..term_at + 1;

        if self.header_range.is_empty() {
            if !self.status_range.is_empty() {
                // No blank line was seen: the frame has no body and the
                // delimiter directly follows the headers.
                self.header_range = self.status_range.start..at;
            } else {
                // The buffer was erased mid-body; everything up to the
                // delimiter is content.
                self.content_range = 0..at;
            }
        } else {
            self.content_range = self.header_range.end..at;
        }

        self.status = terminator.into();

        true
    }

    /// While mid-body, expose everything received past the headers except
    /// the safety margin that could still turn out to be the delimiter.
    fn set_content_range(&mut self) {
        self.content_range = 0..0;

        if self.state == BufferState::Content {
            if self.status_range.is_empty() && self.header_range.is_empty() {
                let end = self.stored.saturating_sub(self.safety());
                if end > 0 {
                    self.content_range = 0..end;
                }
            } else if !self.header_range.is_empty() {
                let available = self.stored - self.header_range.end;
                if available > self.safety() {
                    self.content_range = self.header_range.end..self.stored - self.safety();
                }
            }
        }

        self.status = MsgStatus::Streaming;
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }

    (0..=haystack.len() - needle.len()).rev().find(|&i| &haystack[i..i + needle.len()] == needle)
}
