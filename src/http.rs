//! HTTP/1.1 request reader and response writer.
//!
//! Only the single request message that drives the WebSocket opening
//! handshake is supported: a request line, a header block, no body. Grammar
//! terminals follow [RFC 2616 §2.2]; each byte is classified once through a
//! 256-entry table so the header loop is a pair of table-driven scans.
//!
//! [RFC 2616 §2.2]: https://datatracker.ietf.org/doc/html/rfc2616#section-2.2

use bytes::BytesMut;

use crate::errors::GatewayError;
use crate::lexer::Lexer;

const CTYPE_TEXT: u8 = 1 << 0;
const CTYPE_CHAR: u8 = 1 << 1;
const CTYPE_CTL: u8 = 1 << 2;
const CTYPE_SEPARATOR: u8 = 1 << 3;
const CTYPE_TOKEN: u8 = 1 << 4;

const fn is_separator(c: u8) -> bool {
    matches!(
        c,
        b'(' | b')'
            | b'<'
            | b'>'
            | b'@'
            | b','
            | b';'
            | b':'
            | b'\\'
            | b'"'
            | b'/'
            | b'['
            | b']'
            | b'?'
            | b'='
            | b'{'
            | b'}'
            | b' '
            | b'\t'
    )
}

const fn build_ctypes() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0usize;
    while i < 256 {
        let c = i as u8;
        let mut bits = 0u8;
        if c <= 127 {
            bits |= CTYPE_CHAR;
        }
        let ctl = c < 32 || c == 127;
        if ctl {
            bits |= CTYPE_CTL;
        }
        // TEXT is any octet except CTLs, but SP and HT stay in via LWS.
        if !ctl || c == b' ' || c == b'\t' {
            bits |= CTYPE_TEXT;
        }
        if is_separator(c) {
            bits |= CTYPE_SEPARATOR;
        }
        if c <= 127 && !ctl && !is_separator(c) {
            bits |= CTYPE_TOKEN;
        }
        table[i] = bits;
        i += 1;
    }
    table
}

static CTYPES: [u8; 256] = build_ctypes();

#[inline]
fn has_ctype(c: u8, mask: u8) -> bool {
    CTYPES[c as usize] & mask != 0
}

/// The request methods of RFC 2616 §5.1.1. Extension methods are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Options,
    Get,
    Head,
    Post,
    Put,
    Delete,
    Trace,
    Connect,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Options => "OPTIONS",
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
        }
    }

    fn consume(lex: &mut Lexer<'_>) -> Option<Method> {
        const METHODS: [(&[u8], Method); 8] = [
            (b"OPTIONS", Method::Options),
            (b"GET", Method::Get),
            (b"HEAD", Method::Head),
            (b"POST", Method::Post),
            (b"PUT", Method::Put),
            (b"DELETE", Method::Delete),
            (b"TRACE", Method::Trace),
            (b"CONNECT", Method::Connect),
        ];
        for (literal, method) in METHODS {
            if lex.consume_literal(literal) {
                return Some(method);
            }
        }
        None
    }
}

/// One `name: value` pair. Names are stored verbatim for display; lookup is
/// case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

fn find_in<'a>(headers: &'a [Header], name: &str) -> Option<&'a Header> {
    headers.iter().find(|h| h.name.eq_ignore_ascii_case(name))
}

fn add_to(headers: &mut Vec<Header>, name: &str, value: &str) {
    // Duplicate names replace the prior value, keeping its position.
    if let Some(h) = headers.iter_mut().find(|h| h.name.eq_ignore_ascii_case(name)) {
        h.value = value.to_owned();
        return;
    }
    headers.push(Header {
        name: name.to_owned(),
        value: value.to_owned(),
    });
}

/// A parsed request message.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub version_major: u32,
    pub version_minor: u32,
    /// `true` for the asterisk request form (`OPTIONS * HTTP/1.1`).
    pub asterisk_form: bool,
    /// Absent only in the asterisk form.
    pub uri: Option<http::Uri>,
    /// Resolved from the URI authority and the `Host` header (§5.2).
    pub host: String,
    headers: Vec<Header>,
}

impl Request {
    /// Parse a complete request head (request line + headers + blank line).
    ///
    /// Fails with [`GatewayError::BadRequest`] on any grammar violation, an
    /// unknown method, or an unresolvable host.
    pub fn parse(buf: &[u8]) -> Result<Request, GatewayError> {
        let mut lex = Lexer::new(buf);
        let req = Self::parse_inner(&mut lex)?;
        Ok(req)
    }

    fn parse_inner(lex: &mut Lexer<'_>) -> Result<Request, GatewayError> {
        // Request-Line = Method SP Request-URI SP HTTP-Version CRLF
        let method = Method::consume(lex).ok_or(GatewayError::BadRequest)?;
        if !lex.consume_literal(b" ") {
            return Err(GatewayError::BadRequest);
        }

        let uri_bytes = lex.consume_while(|b| b != b' ');
        if uri_bytes.is_empty() {
            return Err(GatewayError::BadRequest);
        }
        let (asterisk_form, uri) = if uri_bytes == b"*" {
            (true, None)
        } else {
            let text = std::str::from_utf8(uri_bytes).map_err(|_| GatewayError::BadRequest)?;
            let uri = text.parse::<http::Uri>().map_err(|_| GatewayError::BadRequest)?;
            (false, Some(uri))
        };
        if !lex.consume_literal(b" ") {
            return Err(GatewayError::BadRequest);
        }

        // HTTP-Version = "HTTP" "/" 1*DIGIT "." 1*DIGIT
        if !lex.consume_literal(b"HTTP/") {
            return Err(GatewayError::BadRequest);
        }
        let version_major = lex.consume_u32().ok_or(GatewayError::BadRequest)?;
        if !lex.consume_literal(b".") {
            return Err(GatewayError::BadRequest);
        }
        let version_minor = lex.consume_u32().ok_or(GatewayError::BadRequest)?;
        if !lex.consume_literal(b"\r\n") {
            return Err(GatewayError::BadRequest);
        }

        // *(message-header CRLF) CRLF
        let mut headers = Vec::new();
        loop {
            if lex.consume_literal(b"\r\n") {
                break;
            }
            let name = lex.consume_while(|b| has_ctype(b, CTYPE_TOKEN));
            if name.is_empty() {
                return Err(GatewayError::BadRequest);
            }
            let name = std::str::from_utf8(name).map_err(|_| GatewayError::BadRequest)?;
            if !lex.consume_literal(b":") {
                return Err(GatewayError::BadRequest);
            }
            if !lex.consume_lws() {
                return Err(GatewayError::BadRequest);
            }
            let value = lex.consume_while(|b| has_ctype(b, CTYPE_TEXT));
            let value = std::str::from_utf8(value).map_err(|_| GatewayError::BadRequest)?;
            if !lex.consume_literal(b"\r\n") {
                return Err(GatewayError::BadRequest);
            }
            add_to(&mut headers, name, value);
        }

        let host = resolve_host(
            uri.as_ref().and_then(|u| u.authority().map(|a| a.as_str())),
            find_in(&headers, "Host").map(|h| h.value.as_str()),
        )?;

        Ok(Request {
            method,
            version_major,
            version_minor,
            asterisk_form,
            uri,
            host,
            headers,
        })
    }

    /// First header whose name matches case-insensitively.
    pub fn find_header(&self, name: &str) -> Option<&Header> {
        find_in(&self.headers, name)
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }
}

/// The request host is the URI authority; a `Host` header, if also present,
/// must agree with it. A request carrying neither is rejected.
fn resolve_host(authority: Option<&str>, host_header: Option<&str>) -> Result<String, GatewayError> {
    match (authority, host_header) {
        (Some(a), Some(h)) if a != h => Err(GatewayError::BadRequest),
        (Some(a), _) => Ok(a.to_owned()),
        (None, Some(h)) => Ok(h.to_owned()),
        (None, None) => Err(GatewayError::BadRequest),
    }
}

/// Reason phrases for the status codes the gateway can emit or relay.
/// Unknown codes get an empty phrase.
pub fn reason_phrase(status_code: u16) -> &'static str {
    match status_code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        305 => "Use Proxy",
        307 => "Temporary Redirect",
        400 => "Bad Request",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        417 => "Expectation Failed",
        426 => "Upgrade Required",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "",
    }
}

/// A response message, serialized onto a caller-supplied buffer.
#[derive(Debug)]
pub struct Response {
    pub version_major: u32,
    pub version_minor: u32,
    pub status_code: u16,
    headers: Vec<Header>,
    pub body: Option<String>,
}

impl Response {
    pub fn new(status_code: u16) -> Self {
        Self {
            version_major: 1,
            version_minor: 1,
            status_code,
            headers: Vec::new(),
            body: None,
        }
    }

    /// Add a header, replacing any prior value under the same name.
    pub fn add_header(&mut self, name: &str, value: &str) -> &mut Self {
        add_to(&mut self.headers, name, value);
        self
    }

    pub fn find_header(&self, name: &str) -> Option<&Header> {
        find_in(&self.headers, name)
    }

    /// Append `status line + headers + blank line + optional body`.
    pub fn write(&self, out: &mut BytesMut) {
        use std::fmt::Write;

        let mut head = String::with_capacity(64);
        let _ = write!(
            head,
            "HTTP/{}.{} {} {}\r\n",
            self.version_major,
            self.version_minor,
            self.status_code,
            reason_phrase(self.status_code)
        );
        for h in &self.headers {
            let _ = write!(head, "{}: {}\r\n", h.name, h.value);
        }
        head.push_str("\r\n");
        out.extend_from_slice(head.as_bytes());
        if let Some(body) = &self.body {
            out.extend_from_slice(body.as_bytes());
        }
    }
}
