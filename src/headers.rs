//! Typed views over MSRP header values.
//!
//! Header values are stored raw inside [`Message`](crate::message::Message)
//! and parsed on access through the types here. Parsing is explicit and
//! failures are reported as [`ParseError`]s rather than used for control
//! flow.

use std::fmt;
use std::str::FromStr;

use crate::error::ParseError;

pub const TO_PATH: &str = "To-Path";
pub const FROM_PATH: &str = "From-Path";
pub const USE_PATH: &str = "Use-Path";
pub const MESSAGE_ID: &str = "Message-ID";
pub const CONTENT_LENGTH: &str = "Content-Length";
pub const CONTENT_TYPE: &str = "Content-Type";
pub const BYTE_RANGE: &str = "Byte-Range";
pub const EXPIRES: &str = "Expires";
pub const MIN_EXPIRES: &str = "Min-Expires";
pub const STATUS: &str = "Status";
pub const SUCCESS_REPORT: &str = "Success-Report";
pub const FAILURE_REPORT: &str = "Failure-Report";

/// `Byte-Range: start-end/total`, where `end` and `total` may be `*` for
/// "not yet known". Positions are 1-based on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
    pub total: Option<u64>,
}

impl ByteRange {
    fn part(s: &str) -> Result<Option<u64>, ParseError> {
        if s == "*" {
            return Ok(None);
        }

        s.parse::<u64>().map(Some).map_err(|_| ParseError::Header {
            name: BYTE_RANGE,
            reason: format!("bad number {s:?}"),
        })
    }
}

impl FromStr for ByteRange {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<ByteRange, ParseError> {
        let bad = || ParseError::Header {
            name: BYTE_RANGE,
            reason: format!("expected start-end/total, got {s:?}"),
        };

        let (range, total) = s.split_once('/').ok_or_else(bad)?;
        let (start, end) = range.split_once('-').ok_or_else(bad)?;

        Ok(ByteRange {
            start: start.parse().map_err(|_| bad())?,
            end: ByteRange::part(end)?,
            total: ByteRange::part(total)?,
        })
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-", self.start)?;
        match self.end {
            Some(end) => write!(f, "{end}")?,
            None => write!(f, "*")?,
        }
        match self.total {
            Some(total) => write!(f, "/{total}"),
            None => write!(f, "/*"),
        }
    }
}

/// `Status: 000 200 OK` — namespace, code, optional phrase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusHeader {
    pub namespace: u16,
    pub code: u16,
    pub phrase: Option<String>,
}

impl StatusHeader {
    pub fn ok() -> StatusHeader {
        StatusHeader {
            namespace: 0,
            code: 200,
            phrase: Some("OK".to_string()),
        }
    }
}

impl FromStr for StatusHeader {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<StatusHeader, ParseError> {
        let bad = |what: &str| ParseError::Header {
            name: STATUS,
            reason: format!("{what} in {s:?}"),
        };

        let mut parts = s.split_ascii_whitespace();

        let namespace = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| bad("missing namespace"))?;
        let code = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| bad("missing code"))?;

        let phrase = parts.collect::<Vec<_>>().join(" ");

        Ok(StatusHeader {
            namespace,
            code,
            phrase: if phrase.is_empty() { None } else { Some(phrase) },
        })
    }
}

impl fmt::Display for StatusHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03} {}", self.namespace, self.code)?;
        if let Some(phrase) = &self.phrase {
            write!(f, " {phrase}")?;
        }
        Ok(())
    }
}

/// `Failure-Report` values, also used as the connection-wide default mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureReport {
    #[default]
    Yes,
    No,
    Partial,
}

impl FromStr for FailureReport {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<FailureReport, ParseError> {
        match s {
            "yes" => Ok(FailureReport::Yes),
            "no" => Ok(FailureReport::No),
            "partial" => Ok(FailureReport::Partial),
            other => Err(ParseError::Header {
                name: FAILURE_REPORT,
                reason: format!("expected yes/no/partial, got {other:?}"),
            }),
        }
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureReport::Yes => "yes",
            FailureReport::No => "no",
            FailureReport::Partial => "partial",
        })
    }
}

/// `Content-Type: type/subtype[;params]`. Bodies are passed through opaque;
/// only the type split is offered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    pub kind: String,
    pub subtype: String,
    pub params: Option<String>,
}

impl FromStr for ContentType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<ContentType, ParseError> {
        let bad = || ParseError::Header {
            name: CONTENT_TYPE,
            reason: format!("expected type/subtype, got {s:?}"),
        };

        let (media, params) = match s.split_once(';') {
            Some((media, params)) => (media, Some(params.to_string())),
            None => (s, None),
        };

        let (kind, subtype) = media.split_once('/').ok_or_else(bad)?;
        if kind.is_empty() || subtype.is_empty() {
            return Err(bad());
        }

        Ok(ContentType {
            kind: kind.to_string(),
            subtype: subtype.to_string(),
            params,
        })
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.subtype)?;
        if let Some(params) = &self.params {
            write!(f, ";{params}")?;
        }
        Ok(())
    }
}

pub(crate) fn parse_bool(name: &'static str, s: &str) -> Result<bool, ParseError> {
    match s {
        "yes" => Ok(true),
        "no" => Ok(false),
        other => Err(ParseError::Header {
            name,
            reason: format!("expected yes/no, got {other:?}"),
        }),
    }
}

pub(crate) fn parse_number<T: FromStr>(name: &'static str, s: &str) -> Result<T, ParseError> {
    s.trim().parse().map_err(|_| ParseError::Header {
        name,
        reason: format!("bad number {s:?}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_range() {
        let br: ByteRange = "0-65535/*".parse().unwrap();
        assert_eq!(br.start, 0);
        assert_eq!(br.end, Some(65535));
        assert_eq!(br.total, None);

        let br: ByteRange = "1-*/2048".parse().unwrap();
        assert_eq!(br.end, None);
        assert_eq!(br.total, Some(2048));
        assert_eq!(br.to_string(), "1-*/2048");

        assert!("1-2".parse::<ByteRange>().is_err());
        assert!("x-2/3".parse::<ByteRange>().is_err());
    }

    #[test]
    fn status() {
        let st: StatusHeader = "000 404 OK BYE".parse().unwrap();
        assert_eq!(st.namespace, 0);
        assert_eq!(st.code, 404);
        assert_eq!(st.phrase.as_deref(), Some("OK BYE"));

        let st: StatusHeader = "000 200".parse().unwrap();
        assert_eq!(st.phrase, None);
        assert_eq!(st.to_string(), "000 200");

        assert!("200".parse::<StatusHeader>().is_err());
    }

    #[test]
    fn failure_report() {
        assert_eq!("partial".parse::<FailureReport>().unwrap(), FailureReport::Partial);
        assert!("maybe".parse::<FailureReport>().is_err());
        assert_eq!(FailureReport::No.to_string(), "no");
    }

    #[test]
    fn content_type() {
        let ct: ContentType = "text/plain;boundary=outer".parse().unwrap();
        assert_eq!(ct.kind, "text");
        assert_eq!(ct.subtype, "plain");
        assert_eq!(ct.params.as_deref(), Some("boundary=outer"));
        assert_eq!(ct.to_string(), "text/plain;boundary=outer");

        assert!("textplain".parse::<ContentType>().is_err());
    }
}
