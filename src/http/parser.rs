//! Incremental HTTP/1.1 request parser.
//!
//! The same [`ByteStreamParser`] is fed repeatedly as bytes trickle in from
//! the socket. Every call appends to an internal buffer and resumes from the
//! current state, so the result never depends on how the input was split.

use std::collections::hash_map::Entry;

use crate::http::request::{BodyFraming, Method, Request, Version};
use crate::http::response::StatusCode;

pub const MAX_METHOD_LENGTH: usize = 10;
pub const MAX_URI_LENGTH: usize = 2000;
pub const MAX_LINE_LENGTH: usize = 8100;
pub const MAX_HEADER_SECTION: usize = 64 * 1024;
pub const DEFAULT_MAX_BODY_SIZE: usize = 1000 * 1024;

/// Terminal parse failures, each mapping onto one response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    BadRequest,
    NotImplemented,
    UriTooLong,
    VersionNotSupported,
    ContentTooLarge,
    HeaderFieldsTooLarge,
}

impl ParseError {
    pub fn status(&self) -> StatusCode {
        match self {
            ParseError::BadRequest => StatusCode::BadRequest,
            ParseError::NotImplemented => StatusCode::NotImplemented,
            ParseError::UriTooLong => StatusCode::UriTooLong,
            ParseError::VersionNotSupported => StatusCode::VersionNotSupported,
            ParseError::ContentTooLarge => StatusCode::ContentTooLarge,
            ParseError::HeaderFieldsTooLarge => StatusCode::RequestHeaderFieldsTooLarge,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    Continue,
    Finished,
    Error(ParseError),
}

impl ParseStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ParseStatus::Continue)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    RequestLine,
    Headers,
    Body,
    Done(ParseStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    ReadingSize,
    ReadingExtension,
    ReadingData,
    ReadingTrailingCrlf,
    ReadingTrailer,
}

#[derive(Debug)]
struct ChunkedDecoder {
    state: ChunkState,
    size: usize,
    digits: usize,
    remaining: usize,
    line_len: usize,
}

pub struct ByteStreamParser {
    buffer: Vec<u8>,
    state: State,
    request: Request,
    chunked: ChunkedDecoder,
    header_bytes: usize,
    max_body_size: usize,
}

impl Default for ByteStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteStreamParser {
    pub fn new() -> Self {
        Self::with_max_body_size(DEFAULT_MAX_BODY_SIZE)
    }

    pub fn with_max_body_size(max_body_size: usize) -> Self {
        ByteStreamParser {
            buffer: Vec::with_capacity(4096),
            state: State::RequestLine,
            request: Request::default(),
            chunked: ChunkedDecoder::new(),
            header_bytes: 0,
            max_body_size,
        }
    }

    /// Appends `bytes` and makes as much progress as possible. Once a
    /// terminal status has been returned, later calls return it again.
    pub fn feed(&mut self, bytes: &[u8]) -> ParseStatus {
        if let State::Done(status) = self.state {
            return status;
        }
        self.buffer.extend_from_slice(bytes);

        let status = match self.advance() {
            Ok(true) => ParseStatus::Finished,
            Ok(false) => ParseStatus::Continue,
            Err(e) => ParseStatus::Error(e),
        };
        if status.is_terminal() {
            self.state = State::Done(status);
            // Anything past the message is dropped: no pipelining.
            self.buffer = Vec::new();
        }
        status
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn take_request(&mut self) -> Request {
        std::mem::take(&mut self.request)
    }

    fn advance(&mut self) -> Result<bool, ParseError> {
        if self.state == State::RequestLine {
            let pos = match find_crlf(&self.buffer) {
                Some(pos) => pos,
                None if self.buffer.len() > MAX_LINE_LENGTH + 1 => {
                    return Err(ParseError::ContentTooLarge)
                }
                None => return Ok(false),
            };
            if pos > MAX_LINE_LENGTH {
                return Err(ParseError::ContentTooLarge);
            }
            let line: Vec<u8> = self.buffer.drain(..pos + 2).take(pos).collect();
            self.parse_request_line(&line)?;
            self.state = State::Headers;
        }

        if self.state == State::Headers {
            loop {
                let pos = match find_crlf(&self.buffer) {
                    Some(pos) => pos,
                    None if self.buffer.len() > MAX_LINE_LENGTH + 1 => {
                        return Err(ParseError::HeaderFieldsTooLarge)
                    }
                    None => return Ok(false),
                };
                if pos == 0 {
                    self.buffer.drain(..2);
                    break;
                }
                if pos > MAX_LINE_LENGTH {
                    return Err(ParseError::HeaderFieldsTooLarge);
                }
                // The byte after CRLF decides whether this line is folded.
                let Some(&next) = self.buffer.get(pos + 2) else {
                    return Ok(false);
                };
                if next == b' ' || next == b'\t' {
                    return Err(ParseError::BadRequest);
                }
                self.header_bytes += pos + 2;
                if self.header_bytes > MAX_HEADER_SECTION {
                    return Err(ParseError::HeaderFieldsTooLarge);
                }
                let line: Vec<u8> = self.buffer.drain(..pos + 2).take(pos).collect();
                self.parse_field_line(&line)?;
            }

            if !self.determine_next_action()? {
                return Ok(true);
            }
            self.state = State::Body;
        }

        if self.state == State::Body {
            return match self.request.framing {
                BodyFraming::ContentLength(length) => Ok(self.parse_content_length_body(length)),
                BodyFraming::Chunked => self.chunked.decode(
                    &mut self.buffer,
                    &mut self.request.body,
                    self.max_body_size,
                ),
                BodyFraming::None => Ok(true),
            };
        }
        Ok(false)
    }

    fn parse_request_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let line = std::str::from_utf8(line).map_err(|_| ParseError::BadRequest)?;
        let tokens: Vec<&str> = line.split(' ').collect();
        if tokens.len() != 3 {
            return Err(ParseError::BadRequest);
        }
        self.parse_method(tokens[0])?;
        self.parse_target(tokens[1])?;
        self.parse_version(tokens[2])
    }

    fn parse_method(&mut self, method: &str) -> Result<(), ParseError> {
        if method.len() > MAX_METHOD_LENGTH {
            return Err(ParseError::NotImplemented);
        }
        if method.is_empty() || method.contains(' ') {
            return Err(ParseError::BadRequest);
        }
        match Method::from_token(method) {
            Method::Unknown => Err(ParseError::NotImplemented),
            known => {
                self.request.method = known;
                Ok(())
            }
        }
    }

    fn parse_target(&mut self, target: &str) -> Result<(), ParseError> {
        if target.len() > MAX_URI_LENGTH {
            return Err(ParseError::UriTooLong);
        }
        if !target.starts_with('/') || target.chars().any(|c| c == ' ' || c.is_control()) {
            return Err(ParseError::BadRequest);
        }
        self.request.set_target(target);
        Ok(())
    }

    fn parse_version(&mut self, version: &str) -> Result<(), ParseError> {
        self.request.version = match version {
            "HTTP/1.0" => Version::Http10,
            "HTTP/1.1" => Version::Http11,
            "HTTP/2.0" | "HTTP/3.0" => return Err(ParseError::VersionNotSupported),
            _ => return Err(ParseError::BadRequest),
        };
        Ok(())
    }

    fn parse_field_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        // NUL can never be passed on to a CGI environment.
        if line.contains(&0) {
            return Err(ParseError::BadRequest);
        }
        // Header values are kept as text: obs-text bytes that are not valid
        // UTF-8 are replaced with U+FFFD.
        let line = String::from_utf8_lossy(line);
        let (name, value) = line.split_once(':').ok_or(ParseError::BadRequest)?;
        if name.is_empty() || name.chars().any(|c| c.is_ascii_whitespace()) {
            return Err(ParseError::BadRequest);
        }
        let value = value.trim_matches(|c| c == ' ' || c == '\t');
        if value.contains(['\r', '\n']) {
            return Err(ParseError::BadRequest);
        }

        match self.request.headers.entry(name.to_ascii_lowercase()) {
            Entry::Vacant(slot) => {
                slot.insert(value.to_string());
            }
            Entry::Occupied(mut slot) => {
                // Repeating these is an error even when the values agree.
                if slot.key() == "host" || slot.key() == "content-length" {
                    return Err(ParseError::BadRequest);
                }
                let merged = slot.get_mut();
                merged.push_str(", ");
                merged.push_str(value);
            }
        }
        Ok(())
    }

    /// Chooses the body framing once the header section is complete.
    /// Returns `false` when the request has no body.
    fn determine_next_action(&mut self) -> Result<bool, ParseError> {
        let headers = &self.request.headers;
        if !headers.contains_key("host") {
            return Err(ParseError::BadRequest);
        }
        let transfer_encoding = headers.get("transfer-encoding");
        let content_length = headers.get("content-length");

        match (transfer_encoding, content_length) {
            (Some(_), Some(_)) => Err(ParseError::BadRequest),
            (Some(codings), None) => {
                if self.request.version != Version::Http11 {
                    return Err(ParseError::BadRequest);
                }
                parse_transfer_encodings(codings)?;
                self.request.framing = BodyFraming::Chunked;
                Ok(true)
            }
            (None, Some(value)) => {
                let length = parse_content_length(value, self.max_body_size)?;
                self.request.framing = BodyFraming::ContentLength(length);
                Ok(length > 0)
            }
            (None, None) => Ok(false),
        }
    }

    fn parse_content_length_body(&mut self, length: usize) -> bool {
        let needed = length - self.request.body.len();
        let take = needed.min(self.buffer.len());
        self.request.body.extend(self.buffer.drain(..take));
        // Surplus bytes are dropped silently once the body is complete.
        self.request.body.len() == length
    }
}

fn parse_transfer_encodings(value: &str) -> Result<(), ParseError> {
    let codings: Vec<String> = value
        .split(',')
        .map(|c| c.trim_matches(|ch| ch == ' ' || ch == '\t').to_ascii_lowercase())
        .collect();
    if value.trim().is_empty() {
        return Err(ParseError::BadRequest);
    }
    if codings.last().map(String::as_str) != Some("chunked") {
        return Err(ParseError::NotImplemented);
    }
    if codings.iter().any(|c| c != "chunked") {
        return Err(ParseError::NotImplemented);
    }
    if codings.len() > 1 {
        // chunked applied twice
        return Err(ParseError::BadRequest);
    }
    Ok(())
}

fn parse_content_length(value: &str, max_body_size: usize) -> Result<usize, ParseError> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::BadRequest);
    }
    let length: usize = value.parse().map_err(|_| ParseError::ContentTooLarge)?;
    if length > max_body_size {
        return Err(ParseError::ContentTooLarge);
    }
    Ok(length)
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn hex_value(byte: u8) -> Option<usize> {
    (byte as char).to_digit(16).map(|d| d as usize)
}

impl ChunkedDecoder {
    fn new() -> Self {
        ChunkedDecoder {
            state: ChunkState::ReadingSize,
            size: 0,
            digits: 0,
            remaining: 0,
            line_len: 0,
        }
    }

    /// Consumes what it can from `input`, leaving any incomplete tail for
    /// the next call. Returns `true` once the last-chunk and trailer section
    /// have been read.
    fn decode(
        &mut self,
        input: &mut Vec<u8>,
        body: &mut Vec<u8>,
        max_body_size: usize,
    ) -> Result<bool, ParseError> {
        let mut pos = 0;
        let finished = self.run(input, &mut pos, body, max_body_size)?;
        input.drain(..pos);
        if !finished && input.len() > max_body_size {
            return Err(ParseError::ContentTooLarge);
        }
        Ok(finished)
    }

    fn run(
        &mut self,
        input: &[u8],
        pos: &mut usize,
        body: &mut Vec<u8>,
        max_body_size: usize,
    ) -> Result<bool, ParseError> {
        loop {
            match self.state {
                ChunkState::ReadingSize => {
                    let Some(&byte) = input.get(*pos) else {
                        return Ok(false);
                    };
                    if let Some(digit) = hex_value(byte) {
                        self.size = self
                            .size
                            .checked_mul(16)
                            .and_then(|s| s.checked_add(digit))
                            .ok_or(ParseError::ContentTooLarge)?;
                        self.digits += 1;
                        if self.digits > MAX_LINE_LENGTH {
                            return Err(ParseError::ContentTooLarge);
                        }
                        *pos += 1;
                        continue;
                    }
                    if self.digits == 0 {
                        return Err(ParseError::BadRequest);
                    }
                    match byte {
                        b';' | b' ' | b'\t' => {
                            self.state = ChunkState::ReadingExtension;
                            self.line_len = self.digits + 1;
                            *pos += 1;
                        }
                        b'\r' => {
                            let Some(&next) = input.get(*pos + 1) else {
                                return Ok(false);
                            };
                            if next != b'\n' {
                                return Err(ParseError::BadRequest);
                            }
                            *pos += 2;
                            self.end_size_line(body.len(), max_body_size)?;
                        }
                        _ => return Err(ParseError::BadRequest),
                    }
                }
                ChunkState::ReadingExtension => {
                    let rest = &input[*pos..];
                    match find_crlf(rest) {
                        Some(idx) => {
                            self.line_len += idx;
                            if self.line_len > MAX_LINE_LENGTH {
                                return Err(ParseError::ContentTooLarge);
                            }
                            *pos += idx + 2;
                            self.end_size_line(body.len(), max_body_size)?;
                        }
                        None => {
                            // A trailing CR may be the first half of the CRLF.
                            let consumable = match rest.last() {
                                Some(b'\r') => rest.len() - 1,
                                _ => rest.len(),
                            };
                            self.line_len += consumable;
                            if self.line_len > MAX_LINE_LENGTH {
                                return Err(ParseError::ContentTooLarge);
                            }
                            *pos += consumable;
                            return Ok(false);
                        }
                    }
                }
                ChunkState::ReadingData => {
                    let available = input.len() - *pos;
                    if available == 0 {
                        return Ok(false);
                    }
                    let take = available.min(self.remaining);
                    body.extend_from_slice(&input[*pos..*pos + take]);
                    *pos += take;
                    self.remaining -= take;
                    if self.remaining == 0 {
                        self.state = ChunkState::ReadingTrailingCrlf;
                    }
                }
                ChunkState::ReadingTrailingCrlf => {
                    let rest = &input[*pos..];
                    if rest.len() < 2 {
                        if rest.first().is_some_and(|&b| b != b'\r') {
                            return Err(ParseError::BadRequest);
                        }
                        return Ok(false);
                    }
                    if &rest[..2] != b"\r\n" {
                        return Err(ParseError::BadRequest);
                    }
                    *pos += 2;
                    self.state = ChunkState::ReadingSize;
                }
                ChunkState::ReadingTrailer => {
                    let rest = &input[*pos..];
                    match find_crlf(rest) {
                        Some(0) => {
                            *pos += 2;
                            return Ok(true);
                        }
                        Some(idx) if idx > MAX_LINE_LENGTH => {
                            return Err(ParseError::HeaderFieldsTooLarge)
                        }
                        // Trailer fields are discarded.
                        Some(idx) => *pos += idx + 2,
                        None if rest.len() > MAX_LINE_LENGTH + 1 => {
                            return Err(ParseError::HeaderFieldsTooLarge)
                        }
                        None => return Ok(false),
                    }
                }
            }
        }
    }

    fn end_size_line(&mut self, decoded: usize, max_body_size: usize) -> Result<(), ParseError> {
        let size = std::mem::take(&mut self.size);
        self.digits = 0;
        self.line_len = 0;
        if size == 0 {
            self.state = ChunkState::ReadingTrailer;
            return Ok(());
        }
        match decoded.checked_add(size) {
            Some(total) if total <= max_body_size => {
                self.remaining = size;
                self.state = ChunkState::ReadingData;
                Ok(())
            }
            _ => Err(ParseError::ContentTooLarge),
        }
    }
}
