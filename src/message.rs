//! One MSRP frame: request or response, headers and body.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;

use crate::error::{Error, ParseError, Result};
use crate::headers::{self, ByteRange, ContentType, FailureReport, StatusHeader};
use crate::uri::Path;

/// MSRP request methods, plus the marker for responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Auth,
    Send,
    Report,
    Response,
}

/// Continuation state of a frame, derived from the end-delimiter terminator
/// (`+`, `$`, `#`) — or `Streaming` while the delimiter has not been seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgStatus {
    Continued,
    Complete,
    Interrupted,
    Streaming,
}

impl MsgStatus {
    pub(crate) fn terminator(self) -> Option<u8> {
        match self {
            MsgStatus::Continued => Some(b'+'),
            MsgStatus::Complete => Some(b'$'),
            MsgStatus::Interrupted => Some(b'#'),
            MsgStatus::Streaming => None,
        }
    }
}

/// Order-preserving header map.
///
/// MSRP header names are case-sensitive, and the relative order of unknown
/// extension headers must survive a parse/encode round trip, so this is a
/// plain vector of pairs rather than a hash map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();

        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(n, _)| n != name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|(n, _)| n == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// A parsed or application-built MSRP frame.
#[derive(Debug, Clone)]
pub struct Message {
    transaction: String,
    method: Method,
    status_code: u16,
    status_phrase: String,
    status: MsgStatus,
    headers: Headers,
    body: Bytes,
}

impl Message {
    pub fn new(method: Method) -> Message {
        Message {
            transaction: String::new(),
            method,
            status_code: 0,
            status_phrase: String::new(),
            status: MsgStatus::Complete,
            headers: Headers::default(),
            body: Bytes::new(),
        }
    }

    pub fn transaction(&self) -> &str {
        &self.transaction
    }

    pub fn set_transaction(&mut self, tid: impl Into<String>) {
        self.transaction = tid.into();
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn status_phrase(&self) -> &str {
        &self.status_phrase
    }

    pub fn status(&self) -> MsgStatus {
        self.status
    }

    pub fn set_status(&mut self, status: MsgStatus) {
        self.status = status;
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Raw extension-header access.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.set(name, value);
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.remove(name);
    }

    // Typed header views. Mandatory path headers report absence as an error;
    // optional headers return `Ok(None)` when missing.

    pub fn to_path(&self) -> std::result::Result<Path, ParseError> {
        self.path(headers::TO_PATH)
    }

    pub fn from_path(&self) -> std::result::Result<Path, ParseError> {
        self.path(headers::FROM_PATH)
    }

    pub fn use_path(&self) -> std::result::Result<Path, ParseError> {
        self.path(headers::USE_PATH)
    }

    fn path(&self, name: &'static str) -> std::result::Result<Path, ParseError> {
        self.headers
            .get(name)
            .ok_or(ParseError::MissingHeader(name))?
            .parse()
    }

    pub fn set_to_path(&mut self, path: &Path) {
        self.headers.set(headers::TO_PATH, path.to_string());
    }

    pub fn set_from_path(&mut self, path: &Path) {
        self.headers.set(headers::FROM_PATH, path.to_string());
    }

    pub fn message_id(&self) -> Option<&str> {
        self.headers.get(headers::MESSAGE_ID)
    }

    pub fn set_message_id(&mut self, id: impl Into<String>) {
        self.headers.set(headers::MESSAGE_ID, id.into());
    }

    pub fn byte_range(&self) -> std::result::Result<Option<ByteRange>, ParseError> {
        self.headers.get(headers::BYTE_RANGE).map(str::parse).transpose()
    }

    pub fn set_byte_range(&mut self, range: &ByteRange) {
        self.headers.set(headers::BYTE_RANGE, range.to_string());
    }

    pub fn content_length(&self) -> std::result::Result<Option<u64>, ParseError> {
        self.headers
            .get(headers::CONTENT_LENGTH)
            .map(|v| headers::parse_number(headers::CONTENT_LENGTH, v))
            .transpose()
    }

    pub fn content_type(&self) -> std::result::Result<Option<ContentType>, ParseError> {
        self.headers.get(headers::CONTENT_TYPE).map(str::parse).transpose()
    }

    pub fn set_content_type(&mut self, value: impl Into<String>) {
        self.headers.set(headers::CONTENT_TYPE, value.into());
    }

    pub fn expires(&self) -> std::result::Result<Option<u32>, ParseError> {
        self.headers
            .get(headers::EXPIRES)
            .map(|v| headers::parse_number(headers::EXPIRES, v))
            .transpose()
    }

    pub fn min_expires(&self) -> std::result::Result<Option<u32>, ParseError> {
        self.headers
            .get(headers::MIN_EXPIRES)
            .map(|v| headers::parse_number(headers::MIN_EXPIRES, v))
            .transpose()
    }

    pub fn status_header(&self) -> std::result::Result<Option<StatusHeader>, ParseError> {
        self.headers.get(headers::STATUS).map(str::parse).transpose()
    }

    pub fn set_status_header(&mut self, status: &StatusHeader) {
        self.headers.set(headers::STATUS, status.to_string());
    }

    pub fn success_report(&self) -> std::result::Result<Option<bool>, ParseError> {
        self.headers
            .get(headers::SUCCESS_REPORT)
            .map(|v| headers::parse_bool(headers::SUCCESS_REPORT, v))
            .transpose()
    }

    pub fn set_success_report(&mut self, wanted: bool) {
        self.headers
            .set(headers::SUCCESS_REPORT, if wanted { "yes" } else { "no" });
    }

    pub fn failure_report(&self) -> std::result::Result<Option<FailureReport>, ParseError> {
        self.headers.get(headers::FAILURE_REPORT).map(str::parse).transpose()
    }

    pub fn set_failure_report(&mut self, mode: FailureReport) {
        self.headers.set(headers::FAILURE_REPORT, mode.to_string());
    }

    /// Parse the status line and header block of a frame. The input is the
    /// byte range the frame decoder captured: status line, headers, and at
    /// most one trailing blank line.
    pub fn parse(src: &[u8]) -> std::result::Result<Message, ParseError> {
        let text = std::str::from_utf8(src)
            .map_err(|_| ParseError::Frame("header block is not valid ASCII".to_string()))?;

        let mut lines = text.split("\r\n");

        let status_line = lines.next().unwrap_or("");
        let mut message = Message::status_line(status_line)?;

        for line in lines {
            if line.is_empty() {
                break;
            }

            let (name, value) = line
                .split_once(": ")
                .ok_or_else(|| ParseError::Frame(format!("bad header line {line:?}")))?;

            let name_ok = name
                .as_bytes()
                .first()
                .is_some_and(|b| b.is_ascii_alphabetic())
                && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-');
            if !name_ok {
                return Err(ParseError::Frame(format!("bad header name {name:?}")));
            }

            message.headers.0.push((name.to_string(), value.to_string()));
        }

        Ok(message)
    }

    fn status_line(line: &str) -> std::result::Result<Message, ParseError> {
        let bad = |reason: &str| ParseError::Frame(format!("{reason} in status line {line:?}"));

        let rest = line.strip_prefix("MSRP").ok_or_else(|| bad("missing MSRP keyword"))?;

        let rest = rest.trim_start_matches([' ', '\t']);
        if rest.len() == line.len() - 4 {
            return Err(bad("missing blank after MSRP"));
        }

        let tid_len = rest
            .bytes()
            .take_while(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'+' | b'%' | b'='))
            .count();
        if tid_len == 0 {
            return Err(bad("missing transaction id"));
        }

        let tid = &rest[..tid_len];
        let rest = rest[tid_len..].trim_start_matches([' ', '\t']);
        if rest.is_empty() {
            return Err(bad("missing method"));
        }

        let mut message = Message::new(Method::Send);
        message.transaction = tid.to_string();

        match rest {
            "AUTH" => message.method = Method::Auth,
            "SEND" => message.method = Method::Send,
            "REPORT" => message.method = Method::Report,
            other => {
                message.method = Method::Response;

                let digits = other.bytes().take_while(u8::is_ascii_digit).count();
                if digits > 0 {
                    message.status_code =
                        headers::parse_number(headers::STATUS, &other[..digits]).map_err(|_| bad("bad status code"))?;
                    message.status_phrase = other[digits..].trim_start_matches([' ', '\t']).to_string();
                } else {
                    message.status_phrase = other.to_string();
                }
            }
        }

        Ok(message)
    }

    /// Encode the status line and header block, each line CRLF-terminated.
    /// To-Path and From-Path lead, everything else follows in insertion
    /// order.
    pub fn encode_header(&self, buf: &mut BytesMut) -> Result<()> {
        if self.transaction.is_empty() {
            return Err(Error::InvalidState("message has no transaction id"));
        }
        if !self.headers.contains(headers::TO_PATH) || !self.headers.contains(headers::FROM_PATH) {
            return Err(Error::InvalidState("message is missing a path header"));
        }

        buf.put_slice(b"MSRP ");
        buf.put_slice(self.transaction.as_bytes());
        buf.put_u8(b' ');

        match self.method {
            Method::Auth => buf.put_slice(b"AUTH"),
            Method::Send => buf.put_slice(b"SEND"),
            Method::Report => buf.put_slice(b"REPORT"),
            Method::Response => {
                buf.put_slice(format!("{:03}", self.status_code).as_bytes());
                if !self.status_phrase.is_empty() {
                    buf.put_u8(b' ');
                    buf.put_slice(self.status_phrase.as_bytes());
                }
            }
        }
        buf.put_slice(b"\r\n");

        for name in [headers::TO_PATH, headers::FROM_PATH] {
            if let Some(value) = self.headers.get(name) {
                buf.put_slice(name.as_bytes());
                buf.put_slice(b": ");
                buf.put_slice(value.as_bytes());
                buf.put_slice(b"\r\n");
            }
        }

        for (name, value) in self.headers.iter() {
            if name == headers::TO_PATH || name == headers::FROM_PATH {
                continue;
            }
            buf.put_slice(name.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }

        Ok(())
    }

    /// Encode the body (preceded by its blank-line separator when present)
    /// and, unless the frame is mid-stream, the end delimiter.
    pub fn encode_contents(&self, buf: &mut BytesMut) {
        if !self.body.is_empty() {
            buf.put_slice(b"\r\n");
            buf.put_slice(&self.body);
        }

        if let Some(terminator) = self.status.terminator() {
            buf.put_slice(b"-------");
            buf.put_slice(self.transaction.as_bytes());
            buf.put_u8(terminator);
        }
    }

    /// Encode the whole frame.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode_header(&mut buf)?;
        self.encode_contents(&mut buf);
        Ok(buf.freeze())
    }

    /// Build a response template for this request.
    ///
    /// Responses to a SEND travel one hop (To-Path is the rightmost URI of
    /// the request's From-Path); responses to anything else carry the full
    /// reversed From-Path.
    pub fn response(&self, code: u16, phrase: &str) -> Result<Message> {
        if self.transaction.is_empty() {
            return Err(Error::InvalidState("request has no transaction id"));
        }

        let from = self.from_path().map_err(Error::Parse)?;
        let to = self.to_path().map_err(Error::Parse)?;
        let (Some(from_last), Some(to_first)) = (from.last(), to.first()) else {
            return Err(Error::InvalidState("request path headers are empty"));
        };

        let mut response = Message::new(Method::Response);
        response.status_code = code;
        response.status_phrase = phrase.to_string();
        response.status = MsgStatus::Complete;
        response.transaction = self.transaction.clone();

        if let Some(id) = self.message_id() {
            response.set_message_id(id);
        }

        if self.method == Method::Send {
            response.set_to_path(&Path::from(from_last.clone()));
        } else {
            response.set_to_path(&from.reversed());
        }

        response.set_from_path(&Path::from(to_first.clone()));

        Ok(response)
    }

    /// Prepare for transmission: generate a transaction id and a Message-ID
    /// when they are not already set. Returns `true` when anything changed.
    pub fn prepare(&mut self) -> bool {
        let mut modified = false;

        if self.message_id().is_none_or(str::is_empty) {
            self.set_message_id(random_id());
            modified = true;
        }

        if self.transaction.is_empty() {
            self.transaction = random_id();
            modified = true;
        }

        modified
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_bytes() {
            Ok(bytes) => f.write_str(&String::from_utf8_lossy(&bytes)),
            Err(_) => f.write_str("<incomplete message>"),
        }
    }
}

/// Random hex identifier of 14 to 28 digits.
fn random_id() -> String {
    let mut rng = rand::thread_rng();
    let couples = 7 + rng.gen_range(0..8);

    (0..couples * 2)
        .map(|_| char::from_digit(rng.gen_range(0..16), 16).unwrap_or('0'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(lines: &[&str]) -> Vec<u8> {
        lines.join("\r\n").into_bytes()
    }

    #[test]
    fn parse_request_header_block() {
        let src = frame(&[
            "MSRP 49fh AUTH",
            "To-Path: msrps://alice@intra.example.com;tcp",
            "From-Path: msrps://alice.example.com:9892/98cjs;tcp",
            "",
        ]);

        let m = Message::parse(&src).unwrap();
        assert_eq!(m.method(), Method::Auth);
        assert_eq!(m.transaction(), "49fh");

        let to = m.to_path().unwrap();
        assert_eq!(to[0].host(), "intra.example.com");

        let from = m.from_path().unwrap();
        assert_eq!(from[0].session(), Some("98cjs"));
        assert_eq!(from[0].port(), Some(9892));
    }

    #[test]
    fn parse_response_status_line() {
        let src = frame(&["MSRP d93kswow 200 OK", "To-Path: msrp:a.example.com", "From-Path: msrp:b.example.com", ""]);

        let m = Message::parse(&src).unwrap();
        assert_eq!(m.method(), Method::Response);
        assert_eq!(m.status_code(), 200);
        assert_eq!(m.status_phrase(), "OK");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Message::parse(b"FOO x SEND\r\n").is_err());
        assert!(Message::parse(b"MSRP \r\n").is_err());
        assert!(Message::parse(b"MSRP x SEND\r\nBad header\r\n").is_err());
        assert!(Message::parse(b"MSRP x SEND\r\n1-Bad: value\r\n").is_err());
    }

    #[test]
    fn typed_views() {
        let src = frame(&[
            "MSRP x SEND",
            "To-Path: msrp:127.0.0.1",
            "From-Path: msrps://relay.example.com/sessionId msrp:192.168.0.1",
            "Content-Type: text/plain;boundary=outer",
            "Byte-Range: 0-65535/*",
            "Content-Length: 65535",
            "Success-Report: yes",
            "Failure-Report: partial",
            "Status: 000 404 OK BYE",
            "Extension-Header: beer",
            "",
        ]);

        let m = Message::parse(&src).unwrap();

        assert_eq!(m.to_path().unwrap().len(), 1);
        let from = m.from_path().unwrap();
        assert_eq!(from.len(), 2);
        assert_eq!(from[0].scheme(), "msrps");
        assert_eq!(from[0].host(), "relay.example.com");
        assert_eq!(from[0].session(), Some("sessionId"));
        assert_eq!(from[1].host(), "192.168.0.1");

        let ct = m.content_type().unwrap().unwrap();
        assert_eq!((ct.kind.as_str(), ct.subtype.as_str()), ("text", "plain"));

        let br = m.byte_range().unwrap().unwrap();
        assert_eq!((br.start, br.end, br.total), (0, Some(65535), None));

        assert_eq!(m.content_length().unwrap(), Some(65535));
        assert_eq!(m.success_report().unwrap(), Some(true));
        assert_eq!(m.failure_report().unwrap(), Some(FailureReport::Partial));
        assert_eq!(m.status_header().unwrap().unwrap().code, 404);
        assert_eq!(m.header("Extension-Header"), Some("beer"));
    }

    #[test]
    fn encode_round_trip_preserves_extension_order() {
        let src = frame(&[
            "MSRP tid99 SEND",
            "To-Path: msrp:bob.example.com:8888/9di4ea;tcp",
            "From-Path: msrp:alicepc.example.com:7777/iau39;tcp",
            "X-First: 1",
            "Message-ID: 12339sdqwer",
            "X-Second: 2",
            "",
        ]);

        let m = Message::parse(&src).unwrap();
        let mut buf = BytesMut::new();
        m.encode_header(&mut buf).unwrap();

        let text = String::from_utf8(buf.to_vec()).unwrap();
        let first = text.find("X-First").unwrap();
        let second = text.find("X-Second").unwrap();
        assert!(first < second);

        let reparsed = Message::parse(&buf).unwrap();
        assert_eq!(reparsed.headers(), m.headers());
        assert_eq!(reparsed.transaction(), "tid99");
    }

    #[test]
    fn encode_full_frame() {
        let mut m = Message::new(Method::Send);
        m.set_transaction("d93kswow");
        m.set_to_path(&"msrp:bob.example.com:8888/9di4ea;tcp".parse::<Path>().unwrap());
        m.set_from_path(&"msrp:alicepc.example.com:7777/iau39;tcp".parse::<Path>().unwrap());
        m.set_content_type("text/plain");
        m.set_message_id("12339sdqwer");
        m.set_body(Bytes::from_static(b"Hi, I'm Alice!\r\n"));
        m.set_status(MsgStatus::Complete);

        let bytes = m.to_bytes().unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();

        assert!(text.starts_with("MSRP d93kswow SEND\r\nTo-Path: "));
        assert!(text.contains("\r\n\r\nHi, I'm Alice!\r\n-------d93kswow$"));
    }

    #[test]
    fn encode_zero_body_has_no_blank_line() {
        let mut m = Message::new(Method::Auth);
        m.set_transaction("49fh");
        m.set_to_path(&"msrps://alice@intra.example.com;tcp".parse::<Path>().unwrap());
        m.set_from_path(&"msrps://alice.example.com:9892/98cjs;tcp".parse::<Path>().unwrap());

        let text = String::from_utf8(m.to_bytes().unwrap().to_vec()).unwrap();
        assert!(text.ends_with("98cjs;tcp\r\n-------49fh$"));
    }

    #[test]
    fn encode_requires_paths() {
        let mut m = Message::new(Method::Send);
        m.set_transaction("x");
        assert!(m.to_bytes().is_err());
    }

    #[test]
    fn response_to_send_uses_rightmost_from_path() {
        let src = frame(&[
            "MSRP tr1 SEND",
            "To-Path: msrp:a.example.com",
            "From-Path: msrp:b.example.com msrp:c.example.com",
            "Message-ID: m1",
            "",
        ]);

        let request = Message::parse(&src).unwrap();
        let response = request.response(200, "OK").unwrap();

        assert_eq!(response.method(), Method::Response);
        assert_eq!(response.transaction(), "tr1");
        assert_eq!(response.message_id(), Some("m1"));

        let to = response.to_path().unwrap();
        assert_eq!(to.len(), 1);
        assert_eq!(to[0].host(), "c.example.com");

        let from = response.from_path().unwrap();
        assert_eq!(from.len(), 1);
        assert_eq!(from[0].host(), "a.example.com");
    }

    #[test]
    fn response_to_other_methods_reverses_path() {
        let src = frame(&[
            "MSRP tr2 REPORT",
            "To-Path: msrp:a.example.com",
            "From-Path: msrp:b.example.com msrp:c.example.com",
            "",
        ]);

        let request = Message::parse(&src).unwrap();
        let response = request.response(481, "No session").unwrap();

        let to = response.to_path().unwrap();
        assert_eq!(to.len(), 2);
        assert_eq!(to[0].host(), "c.example.com");
        assert_eq!(to[1].host(), "b.example.com");
    }

    #[test]
    fn response_status_code_is_zero_padded() {
        let src = frame(&["MSRP t SEND", "To-Path: msrp:a.example.com", "From-Path: msrp:b.example.com", ""]);
        let mut response = Message::parse(&src).unwrap().response(13, "Odd").unwrap();
        response.set_status(MsgStatus::Complete);

        let text = String::from_utf8(response.to_bytes().unwrap().to_vec()).unwrap();
        assert!(text.starts_with("MSRP t 013 Odd\r\n"));
    }

    #[test]
    fn prepare_fills_identifiers() {
        let mut m = Message::new(Method::Send);
        assert!(m.prepare());
        assert!(!m.transaction().is_empty());
        assert!(m.transaction().len() >= 14 && m.transaction().len() <= 30);
        assert!(m.message_id().is_some());

        // Already prepared: nothing to do.
        assert!(!m.prepare());
    }
}
