use std::fmt;

use tracing::warn;

use crate::http::response::{HttpResponse, StatusCode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MalformedOutput {
    NoHeaderTerminator,
    BadHeaderLine(String),
    BadStatus(String),
    MissingContentType,
}

impl fmt::Display for MalformedOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MalformedOutput::NoHeaderTerminator => write!(f, "no blank line after CGI headers"),
            MalformedOutput::BadHeaderLine(line) => write!(f, "bad CGI header line {:?}", line),
            MalformedOutput::BadStatus(value) => write!(f, "bad CGI Status {:?}", value),
            MalformedOutput::MissingContentType => {
                write!(f, "CGI output has neither Content-Type nor Location")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgiResponse {
    /// Code and reason, e.g. `"302 Found"`.
    pub status: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CgiResponse {
    fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {}\r\n", self.status);
        for (name, value) in &self.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        if !self.has_header("content-length") && !self.has_header("transfer-encoding") {
            head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        if !self.has_header("connection") {
            head.push_str("Connection: close\r\n");
        }
        head.push_str("\r\n");

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

/// Final response bytes for a script's stdout; malformed output becomes 502.
pub fn translate_cgi_output(output: &[u8]) -> Vec<u8> {
    match parse_cgi_output(output) {
        Ok(response) => response.to_bytes(),
        Err(e) => {
            warn!("{}", e);
            HttpResponse::error(StatusCode::BadGateway).to_bytes()
        }
    }
}

pub fn parse_cgi_output(output: &[u8]) -> Result<CgiResponse, MalformedOutput> {
    let (head, body) = split_head(output).ok_or(MalformedOutput::NoHeaderTerminator)?;
    let head = String::from_utf8_lossy(head);

    let mut status = None;
    let mut headers = Vec::new();
    for line in head.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| MalformedOutput::BadHeaderLine(line.to_string()))?;
        if name.is_empty() || name.chars().any(|c| c.is_ascii_whitespace()) {
            return Err(MalformedOutput::BadHeaderLine(line.to_string()));
        }
        let value = value.trim();
        if name.eq_ignore_ascii_case("status") {
            status = Some(parse_status(value)?);
        } else {
            headers.push((capitalize(name), value.to_string()));
        }
    }

    let has = |wanted: &str| headers.iter().any(|(k, _): &(String, String)| k.eq_ignore_ascii_case(wanted));
    let has_location = has("location");
    if !has("content-type") && !has_location {
        return Err(MalformedOutput::MissingContentType);
    }
    let status = status.unwrap_or_else(|| {
        if has_location { "302 Found" } else { "200 OK" }.to_string()
    });

    Ok(CgiResponse {
        status,
        headers,
        body: body.to_vec(),
    })
}

/// Splits at the first blank line, accepting CRLF or bare LF endings.
fn split_head(output: &[u8]) -> Option<(&[u8], &[u8])> {
    let crlf = find(output, b"\r\n\r\n").map(|pos| (pos, 4));
    let lf = find(output, b"\n\n").map(|pos| (pos, 2));
    let (pos, len) = match (crlf, lf) {
        (Some(a), Some(b)) => {
            if a.0 <= b.0 {
                a
            } else {
                b
            }
        }
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => return None,
    };
    Some((&output[..pos], &output[pos + len..]))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_status(value: &str) -> Result<String, MalformedOutput> {
    let bad = || MalformedOutput::BadStatus(value.to_string());
    let (code, reason) = match value.split_once(' ') {
        Some((code, reason)) => (code, reason.trim()),
        None => (value, ""),
    };
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }
    let number: u16 = code.parse().map_err(|_| bad())?;
    if !(100..600).contains(&number) {
        return Err(bad());
    }
    let reason = if reason.is_empty() {
        StatusCode::from_u16(number)
            .map(|s| s.reason_phrase())
            .unwrap_or("")
    } else {
        reason
    };
    Ok(format!("{} {}", code, reason).trim_end().to_string())
}

/// `content-type` -> `Content-Type`.
fn capitalize(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => {
                    first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}
