//! Line-oriented request parser and HTTP-style response framing
//!
//! One request per `\n`-terminated line:
//! ```text
//! GET /key/<key>[ HTTP/1.x]
//! PUT /key/<key>/<value>
//! POST /memsize/<bytes>
//! ```
//! Responses are `HTTP/1.1 <code> <reason>` with a `Content-Length` header and
//! an optional JSON body.

use bytes::BytesMut;
use nom::{
    bytes::complete::{tag, take_till1},
    bytes::streaming::take_until,
    character::complete::{alpha1, char, digit1, space1},
    combinator::{all_consuming, opt},
    sequence::{preceded, separated_pair, terminated},
    IResult,
};
use std::fmt;

/// Longest request line accepted before the buffer is discarded
pub const MAX_LINE_SIZE: usize = 1024 * 1024;

/// Errors for request lines that cannot be routed; all map to 400
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// No terminator within `MAX_LINE_SIZE` bytes
    LineTooLong(usize),
    /// Not `METHOD /path[ HTTP/1.x]`
    Malformed(String),
    /// Well-formed line with an unknown method/path combination
    UnknownRoute(String),
    /// `POST /memsize/<n>` where `n` is not a decimal integer
    InvalidNumber(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::LineTooLong(len) => write!(
                f,
                "request line too long: {} bytes (max: {} bytes)",
                len, MAX_LINE_SIZE
            ),
            ProtocolError::Malformed(line) => write!(f, "malformed request line: {:?}", line),
            ProtocolError::UnknownRoute(route) => write!(f, "no such route: {}", route),
            ProtocolError::InvalidNumber(text) => write!(f, "not a decimal integer: {:?}", text),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Parsed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `GET /key/<k>`
    Get(Vec<u8>),
    /// `HEAD /key/<k>`
    Head(Vec<u8>),
    /// `PUT /key/<k>/<v>`
    Put(Vec<u8>, Vec<u8>),
    /// `DELETE /key/<k>`
    Delete(Vec<u8>),
    /// `GET /memsize`
    MemSize,
    /// `POST /memsize/<n>`; values beyond `u64` saturate
    SetMemSize(u64),
    /// `GET /stats`
    Stats,
    /// `POST /shutdown`
    Shutdown,
}

impl Request {
    /// Parse one request from the front of `buf`
    ///
    /// Returns `Ok(None)` until a full line is buffered. The line is consumed
    /// whether or not it parses, so a bad request never stalls the ones after
    /// it. An over-long line discards the whole buffer.
    pub fn parse(buf: &mut BytesMut) -> Result<Option<Request>, ProtocolError> {
        let consumed = match next_line(&buf[..]) {
            Ok((rest, _)) => buf.len() - rest.len(),
            Err(nom::Err::Incomplete(_)) => {
                if buf.len() > MAX_LINE_SIZE {
                    let len = buf.len();
                    buf.clear();
                    return Err(ProtocolError::LineTooLong(len));
                }
                return Ok(None);
            }
            Err(_) => {
                buf.clear();
                return Err(ProtocolError::Malformed(String::new()));
            }
        };
        let line = buf.split_to(consumed);
        let line = &line[..consumed - 1];

        if line.len() > MAX_LINE_SIZE {
            return Err(ProtocolError::LineTooLong(line.len()));
        }
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        Self::from_line(line).map(Some)
    }

    /// Route a single request line (terminator already stripped)
    pub fn from_line(line: &[u8]) -> Result<Request, ProtocolError> {
        let (method, path) = match all_consuming(request_line)(line) {
            Ok((_, parts)) => parts,
            Err(_) => {
                return Err(ProtocolError::Malformed(
                    String::from_utf8_lossy(line).into_owned(),
                ))
            }
        };
        let unknown = || {
            ProtocolError::UnknownRoute(format!(
                "{} {}",
                String::from_utf8_lossy(method),
                String::from_utf8_lossy(path)
            ))
        };

        let Some(path) = path.strip_prefix(b"/") else {
            return Err(unknown());
        };
        let segments: Vec<&[u8]> = path.split(|&b| b == b'/').collect();

        match (method, segments.as_slice()) {
            (b"GET", [b"key", key]) if !key.is_empty() => Ok(Request::Get(key.to_vec())),
            (b"HEAD", [b"key", key]) if !key.is_empty() => Ok(Request::Head(key.to_vec())),
            (b"DELETE", [b"key", key]) if !key.is_empty() => Ok(Request::Delete(key.to_vec())),
            (b"PUT", [b"key", key, value]) if !key.is_empty() && !value.is_empty() => {
                Ok(Request::Put(key.to_vec(), value.to_vec()))
            }
            (b"GET", [b"memsize"]) => Ok(Request::MemSize),
            (b"POST", [b"memsize", amount]) => parse_amount(amount).map(Request::SetMemSize),
            (b"GET", [b"stats"]) => Ok(Request::Stats),
            (b"POST", [b"shutdown"]) => Ok(Request::Shutdown),
            _ => Err(unknown()),
        }
    }
}

/// Split off one `\n`-terminated line, asking for more input if there is none
fn next_line(input: &[u8]) -> IResult<&[u8], &[u8]> {
    terminated(take_until("\n"), char('\n'))(input)
}

/// `METHOD SP path [SP HTTP/1.x]`
fn request_line(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8])> {
    terminated(
        separated_pair(alpha1, space1, take_till1(|b: u8| b == b' ')),
        opt(preceded(space1, preceded(tag("HTTP/1."), digit1))),
    )(input)
}

fn parse_amount(text: &[u8]) -> Result<u64, ProtocolError> {
    let invalid = || ProtocolError::InvalidNumber(String::from_utf8_lossy(text).into_owned());
    let (_, digits) = all_consuming(digit1::<_, nom::error::Error<&[u8]>>)(text)
        .map_err(|_| invalid())?;
    // digit1 guarantees ASCII, so only overflow can fail here
    let digits = std::str::from_utf8(digits).map_err(|_| invalid())?;
    Ok(digits.parse::<u64>().unwrap_or(u64::MAX))
}

/// Response status codes used by the daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// 200
    Ok,
    /// 201
    Created,
    /// 400
    BadRequest,
    /// 404
    NotFound,
    /// 405
    NotAllowed,
    /// 413
    TooLarge,
}

impl Status {
    /// Numeric status code
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::Created => 201,
            Status::BadRequest => 400,
            Status::NotFound => 404,
            Status::NotAllowed => 405,
            Status::TooLarge => 413,
        }
    }

    /// Reason phrase
    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Created => "Created",
            Status::BadRequest => "Bad Request",
            Status::NotFound => "Not Found",
            Status::NotAllowed => "Method Not Allowed",
            Status::TooLarge => "Payload Too Large",
        }
    }
}

/// Status plus optional body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Status line
    pub status: Status,
    /// Body bytes (JSON or empty)
    pub body: Vec<u8>,
}

impl Response {
    /// Response with no body
    pub fn empty(status: Status) -> Self {
        Self {
            status,
            body: Vec::new(),
        }
    }

    /// 200 with a JSON body
    pub fn json(body: Vec<u8>) -> Self {
        Self {
            status: Status::Ok,
            body,
        }
    }

    /// Serialize to wire format
    pub fn serialize(&self) -> Vec<u8> {
        let mut result = format!(
            "HTTP/1.1 {} {}\r\nContent-Length: {}\r\n\r\n",
            self.status.code(),
            self.status.reason(),
            self.body.len()
        )
        .into_bytes();
        result.extend_from_slice(&self.body);
        result
    }
}

impl From<&ProtocolError> for Response {
    fn from(_: &ProtocolError) -> Self {
        Response::empty(Status::BadRequest)
    }
}
