use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use webserv::cgi::process::describe_failure;
use webserv::cgi::{parse_cgi_output, spawn, translate_cgi_output, GatewayInfo, SpawnError, SpawnedCgi};
use webserv::http::{ByteStreamParser, ParseStatus, Request};

fn request(raw: &[u8]) -> Request {
    let mut parser = ByteStreamParser::new();
    assert_eq!(parser.feed(raw), ParseStatus::Finished);
    parser.take_request()
}

fn info() -> GatewayInfo {
    GatewayInfo {
        server_name: "localhost".into(),
        server_addr: "127.0.0.1:8080".parse().unwrap(),
        remote_addr: "127.0.0.1:40000".parse().unwrap(),
    }
}

/// Drives the pipes to completion the slow way: the ends are non-blocking.
fn run_to_completion(mut cgi: SpawnedCgi, body: &[u8]) -> (Vec<u8>, std::process::ExitStatus) {
    let mut written = 0;
    while written < body.len() {
        match cgi.stdin.write(&body[written..]) {
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(Duration::from_millis(5)),
            Err(_) => break,
        }
    }
    drop(cgi.stdin);

    let started = Instant::now();
    let mut output = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        assert!(started.elapsed() < Duration::from_secs(10), "script did not finish");
        match cgi.stdout.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => output.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(Duration::from_millis(5)),
            Err(e) => panic!("read failed: {}", e),
        }
    }
    let status = loop {
        if let Some(status) = cgi.process.try_reap().unwrap() {
            break status;
        }
        thread::sleep(Duration::from_millis(5));
    };
    (output, status)
}

fn write_script(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn translates_redirects_and_rejects_malformed_output() {
    let out = String::from_utf8(translate_cgi_output(b"Location: /x\r\n\r\n")).unwrap();
    assert!(out.starts_with("HTTP/1.1 302 Found\r\n"));
    assert!(out.contains("Location: /x\r\n"));

    let out = String::from_utf8(translate_cgi_output(b"X-Only: 1\r\n\r\nbody")).unwrap();
    assert!(out.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));

    let out = String::from_utf8(translate_cgi_output(b"Content-Type: text/plain")).unwrap();
    assert!(out.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
}

#[test]
fn runs_shebang_script_with_meta_variables() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "env.cgi",
        "#!/bin/sh\n\
         printf 'Content-Type: text/plain\\r\\n\\r\\n'\n\
         printf 'method=%s query=%s len=%s host=%s\\n' \"$REQUEST_METHOD\" \"$QUERY_STRING\" \"$CONTENT_LENGTH\" \"$HTTP_HOST\"\n\
         printf 'cwd=%s\\n' \"$(pwd -P)\"\n\
         cat\n",
    );
    let req = request(b"POST /cgi-bin/env.cgi?a=1 HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\n\r\nhello");

    let cgi = spawn(&script, &req, &info()).unwrap();
    let (output, status) = run_to_completion(cgi, &req.body);
    assert!(status.success());

    let response = parse_cgi_output(&output).unwrap();
    assert_eq!(response.status, "200 OK");
    let body = String::from_utf8(response.body).unwrap();
    assert!(body.contains("method=POST query=a=1 len=5 host=localhost\n"), "{}", body);
    let cwd = dir.path().canonicalize().unwrap();
    assert!(body.contains(&format!("cwd={}\n", cwd.display())), "{}", body);
    assert!(body.ends_with("hello"), "{}", body);
}

#[test]
fn script_ignoring_stdin_still_completes() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "quiet.sh",
        "printf 'Status: 201\\nContent-Type: text/plain\\n\\ndone'\n",
    );
    let req = request(b"POST /quiet.sh HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\n\r\nabc");

    let cgi = spawn(&script, &req, &info()).unwrap();
    let (output, status) = run_to_completion(cgi, &req.body);
    assert!(status.success());
    let response = parse_cgi_output(&output).unwrap();
    assert_eq!(response.status, "201 Created");
    assert_eq!(response.body, b"done");
}

#[test]
fn abnormal_exit_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "fail.sh", "exit 3\n");
    let req = request(b"GET /fail.sh HTTP/1.1\r\nHost: x\r\n\r\n");

    let cgi = spawn(&script, &req, &info()).unwrap();
    let (output, status) = run_to_completion(cgi, b"");
    assert!(output.is_empty());
    assert_eq!(describe_failure(status).as_deref(), Some("exited with status 3"));
}

#[test]
fn spawn_errors() {
    let dir = tempfile::tempdir().unwrap();
    let req = request(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");

    let missing = dir.path().join("missing.py");
    assert!(matches!(spawn(&missing, &req, &info()), Err(SpawnError::NotFound(_))));

    let unknown = write_script(dir.path(), "data.xyz", "plain text\n");
    assert!(matches!(spawn(&unknown, &req, &info()), Err(SpawnError::NoInterpreter(_))));
}
