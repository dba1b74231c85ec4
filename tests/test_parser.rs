use webserv::http::{BodyFraming, ByteStreamParser, Method, ParseError, ParseStatus, Request, Version};

fn parse_all(raw: &[u8]) -> (ParseStatus, Request) {
    let mut parser = ByteStreamParser::new();
    let status = parser.feed(raw);
    (status, parser.take_request())
}

fn parse_bytewise(raw: &[u8]) -> (ParseStatus, Request) {
    let mut parser = ByteStreamParser::new();
    let mut status = ParseStatus::Continue;
    for byte in raw {
        status = parser.feed(std::slice::from_ref(byte));
        if status.is_terminal() {
            break;
        }
    }
    (status, parser.take_request())
}

const SAMPLES: &[&[u8]] = &[
    b"GET / HTTP/1.1\r\nHost: x\r\n\r\n",
    b"GET /search?q=rust&page=2 HTTP/1.0\r\nHost: example.com:8080\r\nAccept: */*\r\nAccept: text/html\r\n\r\n",
    b"POST /cgi-bin/form.py HTTP/1.1\r\nHost: x\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 11\r\n\r\nname=webser",
    b"POST /upload HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5;ext=1\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: yes\r\n\r\n",
    b"POST /x HTTP/1.1\r\nHost: x\r\nContent-Length: 2\r\n\r\nhello",
    b"GET / HTTP/1.1\r\nHost: x\r\nHost: y\r\n\r\n",
    b"GET / HTTP/1.1\r\nHost: x\r\nX-Long: a\r\n b\r\n\r\n",
    b"BREW /pot HTTP/1.1\r\nHost: x\r\n\r\n",
    b"GET / HTTP/2.0\r\nHost: x\r\n\r\n",
    b"GET / HTTP/1.1\r\n\r\n",
    b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhelloXX0\r\n\r\n",
    b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: gzip, chunked\r\n\r\n",
];

#[test]
fn chunk_boundaries_do_not_change_the_result() {
    for raw in SAMPLES {
        let (whole_status, whole) = parse_all(raw);
        let (split_status, split) = parse_bytewise(raw);
        let shown = String::from_utf8_lossy(raw);
        assert_eq!(whole_status, split_status, "status differs for {:?}", shown);
        if whole_status == ParseStatus::Finished {
            assert_eq!(whole, split, "request differs for {:?}", shown);
        }
    }
}

#[test]
fn simple_get() {
    let (status, req) = parse_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(status, ParseStatus::Finished);
    assert_eq!(req.method, Method::Get);
    assert_eq!(req.target, "/");
    assert_eq!(req.version, Version::Http11);
    assert!(req.body.is_empty());
    assert_eq!(req.framing, BodyFraming::None);
}

#[test]
fn query_string_is_split_from_path() {
    let (status, req) = parse_all(b"GET /a/b?x=1&y=2 HTTP/1.0\r\nHost: x\r\n\r\n");
    assert_eq!(status, ParseStatus::Finished);
    assert_eq!(req.path, "/a/b");
    assert_eq!(req.query, "x=1&y=2");
    assert_eq!(req.version, Version::Http10);
}

#[test]
fn transfer_encoding_with_content_length_is_bad_request() {
    let (status, _) = parse_all(
        b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\nContent-Length: 5\r\n\r\nhello",
    );
    assert_eq!(status, ParseStatus::Error(ParseError::BadRequest));
}

#[test]
fn chunked_body_is_decoded() {
    let (status, req) = parse_all(
        b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n5\r\nhello\r\n0\r\n\r\n",
    );
    assert_eq!(status, ParseStatus::Finished);
    assert_eq!(req.body, b"hellohello");
    assert!(req.is_chunked());
}

#[test]
fn chunk_extensions_and_trailers_are_discarded() {
    let (status, req) = parse_all(
        b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5;ext=1\r\nhello\r\n5;a=b;c\r\nhello\r\n0;last\r\nExpires: never\r\nX-Sum: 10\r\n\r\n",
    );
    assert_eq!(status, ParseStatus::Finished);
    assert_eq!(req.body, b"hellohello");
    assert!(req.header("expires").is_none());
}

// Surplus bytes after a Content-Length body are dropped rather than
// rejected; requests are never pipelined.
#[test]
fn content_length_surplus_is_truncated() {
    let (status, req) = parse_all(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 2\r\n\r\nhello");
    assert_eq!(status, ParseStatus::Finished);
    assert_eq!(req.body, b"he");
}

#[test]
fn repeated_host_or_content_length_is_bad_request() {
    let cases: &[&[u8]] = &[
        b"GET / HTTP/1.1\r\nHost: x\r\nHost: x\r\n\r\n",
        b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 1\r\nContent-Length: 1\r\n\r\na",
        b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\nab",
    ];
    for raw in cases {
        assert_eq!(parse_all(raw).0, ParseStatus::Error(ParseError::BadRequest));
    }
}

// Set-Cookie gets no special treatment: like every other repeatable field
// it is comma-merged.
#[test]
fn repeated_fields_are_comma_merged() {
    let (status, req) = parse_all(
        b"GET / HTTP/1.1\r\nHost: x\r\nAccept: text/html\r\nACCEPT: */*\r\nSet-Cookie: a=1\r\nset-cookie: b=2\r\n\r\n",
    );
    assert_eq!(status, ParseStatus::Finished);
    assert_eq!(req.header("accept"), Some("text/html, */*"));
    assert_eq!(req.header("set-cookie"), Some("a=1, b=2"));
}

#[test]
fn request_line_errors_map_to_status_codes() {
    let long_target = format!("GET /{} HTTP/1.1\r\nHost: x\r\n\r\n", "a".repeat(2100));
    let cases: Vec<(Vec<u8>, ParseError)> = vec![
        (b"PATCH / HTTP/1.1\r\nHost: x\r\n\r\n".to_vec(), ParseError::NotImplemented),
        (b"GET  / HTTP/1.1\r\nHost: x\r\n\r\n".to_vec(), ParseError::BadRequest),
        (b"GET noslash HTTP/1.1\r\nHost: x\r\n\r\n".to_vec(), ParseError::BadRequest),
        (long_target.into_bytes(), ParseError::UriTooLong),
        (b"GET / HTTP/3.0\r\nHost: x\r\n\r\n".to_vec(), ParseError::VersionNotSupported),
        (b"GET / HTTP/1.2\r\nHost: x\r\n\r\n".to_vec(), ParseError::BadRequest),
        (b"GET / http/1.1\r\nHost: x\r\n\r\n".to_vec(), ParseError::BadRequest),
    ];
    for (raw, expected) in cases {
        assert_eq!(
            parse_all(&raw).0,
            ParseStatus::Error(expected),
            "{:?}",
            String::from_utf8_lossy(&raw)
        );
    }
}

#[test]
fn overlong_request_line_is_rejected_before_tokenizing() {
    let raw = format!("GET /{} HTTP/1.1", "a".repeat(9000));
    assert_eq!(
        parse_all(raw.as_bytes()).0,
        ParseStatus::Error(ParseError::ContentTooLarge)
    );
}

#[test]
fn header_field_syntax() {
    let cases: &[&[u8]] = &[
        b"GET / HTTP/1.1\r\nHost: x\r\nNoColon\r\n\r\n",
        b"GET / HTTP/1.1\r\nHost: x\r\n: empty-name\r\n\r\n",
        b"GET / HTTP/1.1\r\nHost: x\r\nBad Name: v\r\n\r\n",
        b"GET / HTTP/1.1\r\nHost: x\r\nX-Folded: a\r\n\tb\r\n\r\n",
    ];
    for raw in cases {
        assert_eq!(parse_all(raw).0, ParseStatus::Error(ParseError::BadRequest));
    }

    let (status, req) = parse_all(b"GET / HTTP/1.1\r\nHost: x\r\nX-Pad: \t padded \t\r\n\r\n");
    assert_eq!(status, ParseStatus::Finished);
    assert_eq!(req.header("x-pad"), Some("padded"));
}

#[test]
fn content_length_must_be_numeric_and_bounded() {
    let (status, _) = parse_all(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: -1\r\n\r\n");
    assert_eq!(status, ParseStatus::Error(ParseError::BadRequest));

    let mut parser = ByteStreamParser::with_max_body_size(10);
    assert_eq!(
        parser.feed(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 11\r\n\r\n"),
        ParseStatus::Error(ParseError::ContentTooLarge)
    );

    let (status, req) = parse_all(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n");
    assert_eq!(status, ParseStatus::Finished);
    assert_eq!(req.framing, BodyFraming::ContentLength(0));
}

#[test]
fn transfer_encoding_requires_http11_and_chunked_last() {
    let cases: &[(&[u8], ParseError)] = &[
        (
            b"POST / HTTP/1.0\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n",
            ParseError::BadRequest,
        ),
        (
            b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked, gzip\r\n\r\n",
            ParseError::NotImplemented,
        ),
        (
            b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: gzip, chunked\r\n\r\n",
            ParseError::NotImplemented,
        ),
    ];
    for (raw, expected) in cases {
        assert_eq!(parse_all(raw).0, ParseStatus::Error(*expected));
    }

    let (status, _) = parse_all(b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: Chunked\r\n\r\n0\r\n\r\n");
    assert_eq!(status, ParseStatus::Finished);
}

#[test]
fn parse_errors_carry_http_status() {
    let codes: Vec<u16> = [
        ParseError::BadRequest,
        ParseError::NotImplemented,
        ParseError::UriTooLong,
        ParseError::VersionNotSupported,
        ParseError::ContentTooLarge,
        ParseError::HeaderFieldsTooLarge,
    ]
    .iter()
    .map(|e| e.status().as_u16())
    .collect();
    assert_eq!(codes, vec![400, 501, 414, 505, 413, 431]);
}
