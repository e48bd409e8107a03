//! Incremental HTTP/1.x stream parsing for the proxy core.
//!
//! Both parsers are push-based and restartable: each `execute` call consumes
//! from the front of the supplied slice and reports `(consumed, event)`. An
//! event yields control back to the driver at a defined offset, which is what
//! the connection machine relies on for its transitions; the caller re-enters
//! with the unconsumed remainder once it has acted on the event.

use crate::support::{ErrorType, NetworkError};
use std::cmp::min;
use std::fmt;
use std::str;

const MAX_HEADERS: usize = 64;

pub const DEFAULT_HTTP_PORT: u16 = 80;

#[derive(Debug, Eq, PartialEq)]
pub enum HttpError {
    /// Malformed request or status line / header section.
    BadHead,
    /// Malformed chunked transfer encoding.
    BadChunk,
    /// The request target carries no host.
    MissingHost,
    /// The request target authority could not be parsed.
    BadTarget,
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HttpError::BadHead => write!(f, "malformed message head"),
            HttpError::BadChunk => write!(f, "malformed chunked encoding"),
            HttpError::MissingHost => write!(f, "request target has no host"),
            HttpError::BadTarget => write!(f, "malformed request target"),
        }
    }
}

impl From<HttpError> for NetworkError {
    #[inline]
    fn from(_: HttpError) -> Self {
        NetworkError::Fatal(ErrorType::Parse)
    }
}

/// The authority a request resolves to. The host is copied out of the parse
/// buffer; buffered request bytes are never mutated or aliased.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

/// How the remainder of a message body is delimited.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Framing {
    None,
    Length(u64),
    Chunked,
    Eof,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ChunkStage {
    /// Awaiting a chunk-size line.
    Size,
    /// Inside chunk data, n bytes left.
    Data(u64),
    /// Awaiting the CRLF that closes a chunk.
    DataEnd,
    /// Awaiting trailer lines, terminated by an empty line.
    Trailer,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum BodyProgress {
    Fixed(u64),
    Chunked(ChunkStage),
    Eof,
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|pair| pair == b"\r\n")
}

/// Advances body parsing, returning bytes consumed and whether the body is
/// complete. Consuming less than the input without completing means more
/// bytes are required.
fn advance_body(progress: &mut BodyProgress, input: &[u8]) -> Result<(usize, bool), HttpError> {
    match progress {
        BodyProgress::Fixed(left) => {
            let take = min(*left, input.len() as u64) as usize;
            *left -= take as u64;
            Ok((take, *left == 0))
        }
        BodyProgress::Eof => Ok((input.len(), false)),
        BodyProgress::Chunked(stage) => {
            let mut consumed = 0;
            loop {
                let rest = &input[consumed..];
                match *stage {
                    ChunkStage::Size => match httparse::parse_chunk_size(rest) {
                        Ok(httparse::Status::Complete((used, size))) => {
                            consumed += used;
                            *stage = match size {
                                0 => ChunkStage::Trailer,
                                n => ChunkStage::Data(n),
                            };
                        }
                        Ok(httparse::Status::Partial) => return Ok((consumed, false)),
                        Err(_) => return Err(HttpError::BadChunk),
                    },
                    ChunkStage::Data(left) => {
                        let take = min(left, rest.len() as u64) as usize;
                        consumed += take;
                        if (take as u64) < left {
                            *stage = ChunkStage::Data(left - take as u64);
                            return Ok((consumed, false));
                        }
                        *stage = ChunkStage::DataEnd;
                    }
                    ChunkStage::DataEnd => {
                        if rest.len() < 2 {
                            return Ok((consumed, false));
                        }
                        if &rest[..2] != b"\r\n" {
                            return Err(HttpError::BadChunk);
                        }
                        consumed += 2;
                        *stage = ChunkStage::Size;
                    }
                    ChunkStage::Trailer => match find_crlf(rest) {
                        Some(0) => {
                            consumed += 2;
                            return Ok((consumed, true));
                        }
                        Some(end) => {
                            consumed += end + 2;
                        }
                        None => return Ok((consumed, false)),
                    },
                }
            }
        }
    }
}

fn header_framing(headers: &[httparse::Header], bodyless: bool) -> Result<Option<Framing>, HttpError> {
    if bodyless {
        return Ok(Some(Framing::None));
    }

    let mut framing = None;
    for header in headers {
        if header.name.eq_ignore_ascii_case("transfer-encoding") {
            let value = str::from_utf8(header.value).map_err(|_| HttpError::BadHead)?;
            if value.to_ascii_lowercase().contains("chunked") {
                return Ok(Some(Framing::Chunked));
            }
        } else if header.name.eq_ignore_ascii_case("content-length") && framing.is_none() {
            let value = str::from_utf8(header.value).map_err(|_| HttpError::BadHead)?;
            let length = value.trim().parse::<u64>().map_err(|_| HttpError::BadHead)?;
            framing = Some(Framing::Length(length));
        }
    }

    Ok(framing)
}

/// Extracts host and port from a request target: the authority itself for
/// `CONNECT`, the authority component of an absolute-form URI otherwise. A
/// target without a host is a hard parse error.
fn parse_target(path: &str, connect: bool) -> Result<ConnectTarget, HttpError> {
    let mut authority = if connect {
        path
    } else {
        let scheme_end = path.find("://").ok_or(HttpError::MissingHost)?;
        let rest = &path[scheme_end + 3..];
        match rest.find(|chr| chr == '/' || chr == '?') {
            Some(end) => &rest[..end],
            None => rest,
        }
    };

    // Userinfo is not forwarded anywhere; skip past it.
    if let Some(at) = authority.rfind('@') {
        authority = &authority[at + 1..];
    }

    let (host, port) = if authority.starts_with('[') {
        let close = authority.find(']').ok_or(HttpError::BadTarget)?;
        let host = &authority[1..close];
        match &authority[close + 1..] {
            "" => (host, None),
            rest if rest.starts_with(':') => (host, Some(&rest[1..])),
            _ => return Err(HttpError::BadTarget),
        }
    } else {
        match authority.rfind(':') {
            Some(colon) => (&authority[..colon], Some(&authority[colon + 1..])),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(HttpError::MissingHost);
    }

    let port = match port {
        Some(digits) => digits.parse::<u16>().map_err(|_| HttpError::BadTarget)?,
        None => DEFAULT_HTTP_PORT,
    };

    Ok(ConnectTarget {
        host: host.to_string(),
        port,
    })
}

#[derive(Debug, Eq, PartialEq)]
pub enum RequestEvent {
    /// The request head has parsed; the connect target is known.
    Target {
        target: ConnectTarget,
        connect: bool,
    },
    /// The request message is complete.
    Complete,
}

#[derive(Debug)]
enum RequestState {
    Head,
    /// Head parsed and target reported; body framing decided but not entered.
    Armed(Framing),
    Body(BodyProgress),
    Done,
}

/// Incremental request-stream parser.
pub struct RequestParser {
    state: RequestState,
}

impl RequestParser {
    #[inline]
    pub fn new() -> RequestParser {
        RequestParser {
            state: RequestState::Head,
        }
    }

    #[inline]
    pub fn reset(&mut self) {
        self.state = RequestState::Head;
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        matches!(self.state, RequestState::Done)
    }

    /// Consumes from the front of `input`. At most one event is reported per
    /// call; the bytes it fired at are included in the consumed count.
    pub fn execute(&mut self, input: &[u8]) -> Result<(usize, Option<RequestEvent>), HttpError> {
        let mut consumed = 0;

        loop {
            match self.state {
                RequestState::Head => {
                    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
                    let mut request = httparse::Request::new(&mut headers);
                    let head_len = match request.parse(input).map_err(|_| HttpError::BadHead)? {
                        httparse::Status::Complete(len) => len,
                        httparse::Status::Partial => return Ok((0, None)),
                    };

                    let method = request.method.ok_or(HttpError::BadHead)?;
                    let connect = method.eq_ignore_ascii_case("CONNECT");
                    let path = request.path.ok_or(HttpError::BadHead)?;
                    let target = parse_target(path, connect)?;
                    let framing = header_framing(request.headers, connect)?
                        .unwrap_or(Framing::None);

                    self.state = RequestState::Armed(framing);
                    return Ok((head_len, Some(RequestEvent::Target { target, connect })));
                }
                RequestState::Armed(framing) => {
                    match framing {
                        Framing::None | Framing::Length(0) => {
                            self.state = RequestState::Done;
                            return Ok((consumed, Some(RequestEvent::Complete)));
                        }
                        Framing::Length(length) => {
                            self.state = RequestState::Body(BodyProgress::Fixed(length));
                        }
                        Framing::Chunked => {
                            self.state = RequestState::Body(BodyProgress::Chunked(ChunkStage::Size));
                        }
                        // Requests are never EOF-delimited.
                        Framing::Eof => return Err(HttpError::BadHead),
                    }
                }
                RequestState::Body(ref mut progress) => {
                    let (used, done) = advance_body(progress, &input[consumed..])?;
                    consumed += used;
                    if done {
                        self.state = RequestState::Done;
                        return Ok((consumed, Some(RequestEvent::Complete)));
                    }
                    return Ok((consumed, None));
                }
                RequestState::Done => return Ok((consumed, None)),
            }
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum ResponseEvent {
    /// The response message is complete.
    Complete,
}

#[derive(Debug)]
enum ResponseState {
    Head,
    Armed(Framing),
    Body(BodyProgress),
    Done,
}

/// Incremental response-stream parser. Restarts with `reset` so interim
/// responses can be followed by further frames on the same stream.
pub struct ResponseParser {
    state: ResponseState,
}

impl ResponseParser {
    #[inline]
    pub fn new() -> ResponseParser {
        ResponseParser {
            state: ResponseState::Head,
        }
    }

    #[inline]
    pub fn reset(&mut self) {
        self.state = ResponseState::Head;
    }

    /// Notifies the parser of stream EOF. True when EOF legitimately
    /// terminates the message: an EOF-delimited body, or a message that had
    /// already completed.
    pub fn finish(&mut self) -> bool {
        match self.state {
            ResponseState::Body(BodyProgress::Eof) | ResponseState::Done => {
                self.state = ResponseState::Done;
                true
            }
            _ => false,
        }
    }

    pub fn execute(&mut self, input: &[u8]) -> Result<(usize, Option<ResponseEvent>), HttpError> {
        let mut consumed = 0;

        loop {
            match self.state {
                ResponseState::Head => {
                    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
                    let mut response = httparse::Response::new(&mut headers);
                    let head_len = match response
                        .parse(input)
                        .map_err(|_| HttpError::BadHead)?
                    {
                        httparse::Status::Complete(len) => len,
                        httparse::Status::Partial => return Ok((0, None)),
                    };

                    let code = response.code.ok_or(HttpError::BadHead)?;
                    let bodyless = (100..200).contains(&code) || code == 204 || code == 304;
                    let framing = header_framing(response.headers, bodyless)?
                        .unwrap_or(Framing::Eof);

                    consumed += head_len;
                    self.state = ResponseState::Armed(framing);
                }
                ResponseState::Armed(framing) => {
                    match framing {
                        Framing::None | Framing::Length(0) => {
                            self.state = ResponseState::Done;
                            return Ok((consumed, Some(ResponseEvent::Complete)));
                        }
                        Framing::Length(length) => {
                            self.state = ResponseState::Body(BodyProgress::Fixed(length));
                        }
                        Framing::Chunked => {
                            self.state =
                                ResponseState::Body(BodyProgress::Chunked(ChunkStage::Size));
                        }
                        Framing::Eof => {
                            self.state = ResponseState::Body(BodyProgress::Eof);
                        }
                    }
                }
                ResponseState::Body(ref mut progress) => {
                    let (used, done) = advance_body(progress, &input[consumed..])?;
                    consumed += used;
                    if done {
                        self.state = ResponseState::Done;
                        return Ok((consumed, Some(ResponseEvent::Complete)));
                    }
                    return Ok((consumed, None));
                }
                ResponseState::Done => return Ok((consumed, None)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(host: &str, port: u16) -> ConnectTarget {
        ConnectTarget {
            host: host.to_string(),
            port,
        }
    }

    #[test]
    fn test_request_absolute_uri() {
        let mut parser = RequestParser::new();
        let head = b"GET http://example.com:8080/index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";

        let (consumed, event) = parser.execute(head).unwrap();
        assert_eq!(consumed, head.len());
        assert_eq!(
            event,
            Some(RequestEvent::Target {
                target: target("example.com", 8080),
                connect: false,
            })
        );

        let (consumed, event) = parser.execute(&[]).unwrap();
        assert_eq!(consumed, 0);
        assert_eq!(event, Some(RequestEvent::Complete));
        assert!(parser.is_done());
    }

    #[test]
    fn test_request_default_port() {
        let mut parser = RequestParser::new();
        let head = b"GET http://example.com/ HTTP/1.1\r\n\r\n";

        let (_, event) = parser.execute(head).unwrap();
        assert_eq!(
            event,
            Some(RequestEvent::Target {
                target: target("example.com", DEFAULT_HTTP_PORT),
                connect: false,
            })
        );
    }

    #[test]
    fn test_request_head_across_feeds() {
        let mut parser = RequestParser::new();
        let head = b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n";

        let (consumed, event) = parser.execute(&head[..20]).unwrap();
        assert_eq!((consumed, event), (0, None));

        let (consumed, event) = parser.execute(head).unwrap();
        assert_eq!(consumed, head.len());
        assert!(event.is_some());
    }

    #[test]
    fn test_request_body_content_length() {
        let mut parser = RequestParser::new();
        let head = b"PUT http://example.com/ HTTP/1.1\r\nContent-Length: 4\r\n\r\n";

        let (consumed, _) = parser.execute(head).unwrap();
        assert_eq!(consumed, head.len());

        let (consumed, event) = parser.execute(b"zo").unwrap();
        assert_eq!((consumed, event), (2, None));

        let (consumed, event) = parser.execute(b"mg").unwrap();
        assert_eq!(consumed, 2);
        assert_eq!(event, Some(RequestEvent::Complete));
    }

    #[test]
    fn test_request_chunked_body() {
        let mut parser = RequestParser::new();
        let head = b"POST http://example.com/ HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n";
        parser.execute(head).unwrap();

        let body = b"4\r\nwiki\r\n0\r\n\r\n";
        let (consumed, event) = parser.execute(body).unwrap();
        assert_eq!(consumed, body.len());
        assert_eq!(event, Some(RequestEvent::Complete));
    }

    #[test]
    fn test_request_chunked_body_split() {
        let mut parser = RequestParser::new();
        let head = b"POST http://example.com/ HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n";
        parser.execute(head).unwrap();

        let (consumed, event) = parser.execute(b"4\r\nwi").unwrap();
        assert_eq!((consumed, event), (5, None));

        let (consumed, event) = parser.execute(b"ki\r\n0\r\n\r\n").unwrap();
        assert_eq!(consumed, 9);
        assert_eq!(event, Some(RequestEvent::Complete));
    }

    #[test]
    fn test_connect_target_and_completion() {
        let mut parser = RequestParser::new();
        let head = b"CONNECT 127.0.0.1:8443 HTTP/1.1\r\nHost: 127.0.0.1:8443\r\n\r\n";

        let (consumed, event) = parser.execute(head).unwrap();
        assert_eq!(consumed, head.len());
        assert_eq!(
            event,
            Some(RequestEvent::Target {
                target: target("127.0.0.1", 8443),
                connect: true,
            })
        );

        // CONNECT carries no body: completion fires on re-entry without
        // consuming tunnel payload.
        let (consumed, event) = parser.execute(b"tunnel payload").unwrap();
        assert_eq!(consumed, 0);
        assert_eq!(event, Some(RequestEvent::Complete));
    }

    #[test]
    fn test_connect_ipv6_target() {
        let mut parser = RequestParser::new();
        let head = b"CONNECT [::1]:8443 HTTP/1.1\r\n\r\n";

        let (_, event) = parser.execute(head).unwrap();
        assert_eq!(
            event,
            Some(RequestEvent::Target {
                target: target("::1", 8443),
                connect: true,
            })
        );
    }

    #[test]
    fn test_origin_form_is_a_hard_error() {
        let mut parser = RequestParser::new();
        let head = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert_eq!(parser.execute(head), Err(HttpError::MissingHost));
    }

    #[test]
    fn test_bad_head_is_a_hard_error() {
        let mut parser = RequestParser::new();
        assert_eq!(
            parser.execute(b"\x00\x01garbage\r\n\r\n"),
            Err(HttpError::BadHead)
        );
    }

    #[test]
    fn test_response_content_length() {
        let mut parser = ResponseParser::new();
        let message = b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nGET";

        let (consumed, event) = parser.execute(message).unwrap();
        assert_eq!(consumed, message.len());
        assert_eq!(event, Some(ResponseEvent::Complete));
    }

    #[test]
    fn test_response_eof_framing() {
        let mut parser = ResponseParser::new();
        let message = b"HTTP/1.1 200 OK\r\n\r\nstreaming";

        let (consumed, event) = parser.execute(message).unwrap();
        assert_eq!(consumed, message.len());
        assert_eq!(event, None);

        assert!(parser.finish());
    }

    #[test]
    fn test_response_eof_before_body_end_is_incomplete() {
        let mut parser = ResponseParser::new();
        let message = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nshort";

        parser.execute(message).unwrap();
        assert!(!parser.finish());
    }

    #[test]
    fn test_response_no_body_statuses() {
        for head in [
            &b"HTTP/1.1 204 No Content\r\n\r\n"[..],
            &b"HTTP/1.1 304 Not Modified\r\n\r\n"[..],
        ]
        .iter()
        {
            let mut parser = ResponseParser::new();
            let (consumed, event) = parser.execute(head).unwrap();
            assert_eq!(consumed, head.len());
            assert_eq!(event, Some(ResponseEvent::Complete));
        }
    }

    #[test]
    fn test_response_interim_then_final() {
        let mut parser = ResponseParser::new();

        let interim = b"HTTP/1.1 100 Continue\r\n\r\n";
        let (consumed, event) = parser.execute(interim).unwrap();
        assert_eq!(consumed, interim.len());
        assert_eq!(event, Some(ResponseEvent::Complete));

        parser.reset();

        let final_message = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
        let (consumed, event) = parser.execute(final_message).unwrap();
        assert_eq!(consumed, final_message.len());
        assert_eq!(event, Some(ResponseEvent::Complete));
    }

    #[test]
    fn test_response_chunked() {
        let mut parser = ResponseParser::new();
        let message =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";

        let (consumed, event) = parser.execute(message).unwrap();
        assert_eq!(consumed, message.len());
        assert_eq!(event, Some(ResponseEvent::Complete));
    }

    #[test]
    fn test_target_userinfo_skipped() {
        let result = parse_target("http://user:pw@example.com:81/x", false).unwrap();
        assert_eq!(result, target("example.com", 81));
    }

    #[test]
    fn test_target_bad_port() {
        assert_eq!(
            parse_target("example.com:notaport", true),
            Err(HttpError::BadTarget)
        );
    }
}
