//! MSRP URIs and paths.
//!
//! Grammar (RFC 4975 §9, trimmed to what this endpoint supports):
//!
//! ```text
//! ("msrp" | "msrps") ":" ["//"] [userinfo "@"] host [":" port] ["/" session] [";tcp"]
//! ```
//!
//! The host is a dotted domain name, an IPv4 literal, or a bracketed IPv6
//! literal. Scheme and host compare case-insensitively; the userinfo part is
//! ignored for comparison purposes entirely, as the RFC requires.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::ParseError;

/// Default port for MSRP over TCP when a URI does not carry one.
pub const DEFAULT_PORT: u16 = 2855;

/// A single `msrp:` / `msrps:` URI.
#[derive(Debug, Clone, Default)]
pub struct Uri {
    scheme: String,
    user: Option<String>,
    host: String,
    port: Option<u16>,
    session: Option<String>,
    transport: Option<String>,
    delimiter: bool,
}

impl Uri {
    /// Derive a URI from a socket address, the way a session names itself
    /// when the caller does not supply an explicit path entry.
    pub fn from_endpoint(addr: SocketAddr, tls: bool) -> Uri {
        let host = match addr.ip() {
            IpAddr::V4(ip) => ip.to_string(),
            IpAddr::V6(ip) => format!("[{ip}]"),
        };

        Uri {
            scheme: if tls { "msrps" } else { "msrp" }.to_string(),
            user: None,
            host,
            port: Some(addr.port()),
            session: None,
            transport: None,
            delimiter: true,
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    pub fn transport(&self) -> Option<&str> {
        self.transport.as_deref()
    }

    pub fn set_session(&mut self, session: impl Into<String>) {
        self.session = Some(session.into());
    }

    /// `true` for the `msrps` scheme.
    pub fn tls(&self) -> bool {
        self.scheme.eq_ignore_ascii_case("msrps")
    }

    /// Resolve to a socket address when the host is an IP literal.
    ///
    /// Hostnames require a resolver, which lives outside this crate; for
    /// those this returns `None`.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let host = self.host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(&self.host);

        host.parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port.unwrap_or(DEFAULT_PORT)))
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if self.delimiter {
            write!(f, "//")?;
        }
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        write!(f, "{}", self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        if let Some(session) = &self.session {
            write!(f, "/{session}")?;
        }
        if self.transport.is_some() {
            write!(f, ";tcp")?;
        }
        Ok(())
    }
}

// Scheme and host are case-insensitive; userinfo and the "//" are display
// artifacts that play no part in routing (RFC 4975 §6.1).
impl PartialEq for Uri {
    fn eq(&self, other: &Uri) -> bool {
        self.scheme.eq_ignore_ascii_case(&other.scheme)
            && self.host.eq_ignore_ascii_case(&other.host)
            && self.port == other.port
            && self.session == other.session
            && self.transport == other.transport
    }
}

impl Eq for Uri {}

impl Hash for Uri {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.scheme.bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
        for b in self.host.bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
        self.port.hash(state);
        self.session.hash(state);
        self.transport.hash(state);
    }
}

impl FromStr for Uri {
    type Err = ParseError;

    fn from_str(input: &str) -> Result<Uri, ParseError> {
        Parser::new(input).parse()
    }
}

impl TryFrom<&str> for Uri {
    type Error = ParseError;

    fn try_from(input: &str) -> Result<Uri, ParseError> {
        input.parse()
    }
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'!' | b'~' | b'*' | b'\'' | b'(' | b')')
}

fn is_userinfo(b: u8) -> bool {
    is_unreserved(b) || matches!(b, b'%' | b'&' | b'=' | b'+' | b'$' | b',' | b';' | b'?' | b'|')
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Parser<'a> {
        Parser { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn fail(&self, reason: &str) -> ParseError {
        ParseError::Uri(format!("\"{}\": {reason}", self.input))
    }

    fn parse(mut self) -> Result<Uri, ParseError> {
        let mut uri = Uri::default();

        self.scheme(&mut uri)?;

        if self.rest().starts_with("//") {
            uri.delimiter = true;
            self.pos += 2;
        }

        self.userinfo(&mut uri)?;
        self.host(&mut uri)?;

        if self.rest().starts_with(':') {
            self.pos += 1;
            self.port(&mut uri)?;
        }

        if self.rest().starts_with('/') {
            self.pos += 1;
            let rest = self.rest().as_bytes();
            let len = rest.iter().take_while(|&&b| is_unreserved(b)).count();
            uri.session = Some(self.rest()[..len].to_string());
            self.pos += len;
        }

        let rest = self.rest().as_bytes();
        if rest.len() >= 4 && rest[..4].eq_ignore_ascii_case(b";tcp") {
            uri.transport = Some("tcp".to_string());
            self.pos += 4;
        }

        if !self.rest().is_empty() {
            return Err(self.fail("trailing characters"));
        }

        Ok(uri)
    }

    fn scheme(&mut self, uri: &mut Uri) -> Result<(), ParseError> {
        let rest = self.rest();
        let bytes = rest.as_bytes();

        let len = if bytes.len() >= 6 && bytes[..5].eq_ignore_ascii_case(b"msrps") && bytes[5] == b':' {
            5
        } else if bytes.len() >= 5 && bytes[..4].eq_ignore_ascii_case(b"msrp") && bytes[4] == b':' {
            4
        } else {
            return Err(self.fail("expected msrp: or msrps: scheme"));
        };

        uri.scheme = rest[..len].to_string();
        self.pos += len + 1;

        Ok(())
    }

    fn userinfo(&mut self, uri: &mut Uri) -> Result<(), ParseError> {
        let rest = self.rest().as_bytes();

        let mut i = 0;
        while i < rest.len() && is_userinfo(rest[i]) {
            if rest[i] == b'%' {
                if i + 2 >= rest.len() || !rest[i + 1].is_ascii_hexdigit() || !rest[i + 2].is_ascii_hexdigit() {
                    return Err(self.fail("bad escape in userinfo"));
                }
                i += 3;
            } else {
                i += 1;
            }
        }

        if i > 0 && i < rest.len() && rest[i] == b'@' {
            uri.user = Some(self.rest()[..i].to_string());
            self.pos += i + 1;
        }

        Ok(())
    }

    fn host(&mut self, uri: &mut Uri) -> Result<(), ParseError> {
        let rest = self.rest();

        if rest.starts_with('[') {
            let Some(close) = rest.find(']') else {
                return Err(self.fail("unterminated IPv6 literal"));
            };

            check_ipv6(&rest[1..close]).map_err(|r| self.fail(r))?;

            uri.host = rest[..=close].to_string();
            self.pos += close + 1;

            return Ok(());
        }

        let len = rest
            .bytes()
            .take_while(|b| b.is_ascii_alphanumeric() || *b == b'.' || *b == b'-')
            .count();
        if len == 0 {
            return Err(self.fail("missing host"));
        }

        let candidate = &rest[..len];
        if !is_domain(candidate) && !is_ipv4(candidate) {
            return Err(self.fail("invalid host"));
        }

        uri.host = candidate.to_string();
        self.pos += len;

        Ok(())
    }

    fn port(&mut self, uri: &mut Uri) -> Result<(), ParseError> {
        let rest = self.rest();
        let len = rest.bytes().take_while(u8::is_ascii_digit).count();

        if len == 0 || len > 5 {
            return Err(self.fail("invalid port"));
        }

        match rest[..len].parse::<u16>() {
            Ok(port) => {
                uri.port = Some(port);
                self.pos += len;
                Ok(())
            }
            Err(_) => Err(self.fail("port out of range")),
        }
    }
}

/// Dotted domain name: at least one label, a dot, and an alphabetic-led top
/// label, with one optional trailing dot.
fn is_domain(s: &str) -> bool {
    let s = s.strip_suffix('.').unwrap_or(s);

    let labels: Vec<&str> = s.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|l| l.is_empty()) {
        return false;
    }

    let top = labels[labels.len() - 1];
    labels[..labels.len() - 1].iter().all(|l| is_label(l)) && is_toplabel(top)
}

fn is_label(s: &str) -> bool {
    let b = s.as_bytes();

    !b.is_empty()
        && b.iter().all(|c| c.is_ascii_alphanumeric() || *c == b'-')
        && b[0] != b'-'
        && b[b.len() - 1] != b'-'
}

fn is_toplabel(s: &str) -> bool {
    let b = s.as_bytes();

    !b.is_empty()
        && b[0].is_ascii_alphabetic()
        && b[b.len() - 1].is_ascii_alphanumeric()
        && b.iter().all(|c| c.is_ascii_alphanumeric() || *c == b'-')
}

fn is_ipv4(s: &str) -> bool {
    let segments: Vec<&str> = s.split('.').collect();

    segments.len() == 4
        && segments
            .iter()
            .all(|seg| !seg.is_empty() && seg.len() <= 3 && seg.bytes().all(|b| b.is_ascii_digit()))
}

/// Bracket contents of an IPv6 literal: hex groups around exactly one `::`.
fn check_ipv6(s: &str) -> Result<(), &'static str> {
    let Some((left, right)) = s.split_once("::") else {
        return Err("IPv6 literal requires ::");
    };

    let group = |g: &str| !g.is_empty() && g.len() <= 4 && g.bytes().all(|b| b.is_ascii_hexdigit());

    if right.is_empty() || !right.split(':').all(group) {
        return Err("invalid IPv6 group");
    }

    if !left.is_empty() && !left.split(':').all(group) {
        return Err("invalid IPv6 group");
    }

    Ok(())
}

/// An ordered list of URIs: the relay chain back to the message origin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Path(Vec<Uri>);

impl Path {
    pub fn new() -> Path {
        Path(Vec::new())
    }

    pub fn push(&mut self, uri: Uri) {
        self.0.push(uri);
    }

    /// Same URIs in reverse order; responses and REPORTs travel the path
    /// backwards.
    pub fn reversed(&self) -> Path {
        let mut uris = self.0.clone();
        uris.reverse();
        Path(uris)
    }
}

impl std::ops::Deref for Path {
    type Target = [Uri];

    fn deref(&self) -> &[Uri] {
        &self.0
    }
}

impl From<Uri> for Path {
    fn from(uri: Uri) -> Path {
        Path(vec![uri])
    }
}

impl FromIterator<Uri> for Path {
    fn from_iter<T: IntoIterator<Item = Uri>>(iter: T) -> Path {
        Path(iter.into_iter().collect())
    }
}

impl IntoIterator for Path {
    type Item = Uri;
    type IntoIter = std::vec::IntoIter<Uri>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, uri) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{uri}")?;
        }
        Ok(())
    }
}

impl FromStr for Path {
    type Err = ParseError;

    fn from_str(input: &str) -> Result<Path, ParseError> {
        input.split_ascii_whitespace().map(|u| u.parse()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accept(input: &str) -> Uri {
        let uri: Uri = input.parse().unwrap_or_else(|e| panic!("rejected {input:?}: {e}"));

        // parse(format(parse(u))) == parse(u)
        let reparsed: Uri = uri.to_string().parse().unwrap_or_else(|e| panic!("round-trip of {input:?}: {e}"));
        assert_eq!(uri, reparsed, "round-trip inequality for {input:?}");

        uri
    }

    fn reject(input: &str) {
        assert!(input.parse::<Uri>().is_err(), "accepted {input:?}");
    }

    #[test]
    fn acceptance_set() {
        accept("msrp:127.0.0.1");
        accept("MSRP:validdomain.com");
        accept("msrp:foobar.ORG");
        accept("msrp://0valid.com");
        accept("msrp:foo@bar.com");
        accept("msrp:chris@b0nd.net");
        accept("msrp:127.0.0.1/a67e68");
        accept("msrp:bizzle@a6987.14387.isp.ca:9392");
        accept("msrp:a@yvr.co.nz:65535/eefijf001");
        accept("msrp:foo.bar.com");
        accept("msrps:192.168.0.128");
        accept("msrps:255.255.255.255:10/foo");
        accept("msrp:foo.bar.com;tcp");
        accept("msrps://10.0.0.1;tcp");
        accept("msrp:[fe80::2e0:18ff:feb7:202a]");
        accept("msrp://user@[a1b0::159:3cff:0a11:0cea]:956/sessionid");
    }

    #[test]
    fn rejection_set() {
        reject("sip:127.0.0.1");
        reject("mrsp:foo.bar.com");
        reject("msrp://user@[ffff::fff:ffff:fff:ffg]");
        reject("msrp:foo-bar-com");
        reject("127.0.0.1");
        reject("msrp:foo.");
        reject("msrp:.com");
    }

    #[test]
    fn fields() {
        let uri = accept("msrp://user@[a1b0::159:3cff:0a11:0cea]:956/sessionid");
        assert_eq!(uri.scheme(), "msrp");
        assert_eq!(uri.user(), Some("user"));
        assert_eq!(uri.host(), "[a1b0::159:3cff:0a11:0cea]");
        assert_eq!(uri.port(), Some(956));
        assert_eq!(uri.session(), Some("sessionid"));

        let uri = accept("msrps://alice.example.com:9892/98cjs;tcp");
        assert!(uri.tls());
        assert_eq!(uri.session(), Some("98cjs"));
        assert_eq!(uri.transport(), Some("tcp"));
    }

    #[test]
    fn comparison_ignores_case_and_userinfo() {
        let a: Uri = "MSRP:EXAMPLE.com/x".parse().unwrap();
        let b: Uri = "msrp:example.COM/x".parse().unwrap();
        assert_eq!(a, b);

        let a: Uri = "msrp:alice@example.com".parse().unwrap();
        let b: Uri = "msrp:bob@example.com".parse().unwrap();
        assert_eq!(a, b);

        let a: Uri = "msrp:example.com/x".parse().unwrap();
        let b: Uri = "msrp:example.com/y".parse().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn endpoint_round_trip() {
        let addr: SocketAddr = "192.168.0.7:2855".parse().unwrap();
        let uri = Uri::from_endpoint(addr, false);
        assert_eq!(uri.to_string(), "msrp://192.168.0.7:2855");
        assert_eq!(uri.socket_addr(), Some(addr));

        let addr: SocketAddr = "[fe80::1]:9892".parse().unwrap();
        let uri = Uri::from_endpoint(addr, true);
        assert!(uri.tls());
        assert_eq!(uri.socket_addr(), Some(addr));
    }

    #[test]
    fn path_parse_and_display() {
        let path: Path = "msrps://relay.example.com/sessionId msrp:192.168.0.1"
            .parse()
            .unwrap();

        assert_eq!(path.len(), 2);
        assert_eq!(path[0].scheme(), "msrps");
        assert_eq!(path[0].session(), Some("sessionId"));
        assert_eq!(path[1].host(), "192.168.0.1");

        assert_eq!(path.to_string(), "msrps://relay.example.com/sessionId msrp:192.168.0.1");

        let rev = path.reversed();
        assert_eq!(rev[0].host(), "192.168.0.1");
    }
}
