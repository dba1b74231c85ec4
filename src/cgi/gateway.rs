//! Starting CGI/1.1 scripts.
//!
//! The parent only builds pipes and forks here; no bytes are moved until the
//! reactor drives the returned pipe ends through `CgiInput`/`CgiOutput`.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read};
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::{ChildStdin, ChildStdout, Command, Stdio};

use tracing::info;

use crate::cgi::process::CgiProcess;
use crate::http::request::{BodyFraming, Request};
use crate::server::poller::set_nonblocking;

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const MAX_SHEBANG: u64 = 256;

const EXTENSION_INTERPRETERS: &[(&str, &str)] = &[
    ("py", "python3"),
    ("rb", "ruby"),
    ("pl", "perl"),
    ("sh", "sh"),
];

/// Request headers that never become `HTTP_*` variables.
const HIDDEN_HEADERS: &[&str] = &["content-type", "content-length", "transfer-encoding", "proxy"];

#[derive(Debug)]
pub enum SpawnError {
    NotFound(PathBuf),
    NoInterpreter(PathBuf),
    Io(io::Error),
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::NotFound(path) => write!(f, "script {} not found", path.display()),
            SpawnError::NoInterpreter(path) => {
                write!(f, "no interpreter for {}", path.display())
            }
            SpawnError::Io(e) => write!(f, "failed to start CGI: {}", e),
        }
    }
}

impl std::error::Error for SpawnError {}

impl From<io::Error> for SpawnError {
    fn from(err: io::Error) -> SpawnError {
        SpawnError::Io(err)
    }
}

/// How the script gets executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interpreter {
    /// The script is itself executable.
    Direct,
    Program { program: String, args: Vec<String> },
}

/// Connection-level facts the meta-variables need.
#[derive(Debug, Clone)]
pub struct GatewayInfo {
    pub server_name: String,
    pub server_addr: SocketAddr,
    pub remote_addr: SocketAddr,
}

pub struct SpawnedCgi {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub process: CgiProcess,
}

pub fn spawn(script: &Path, request: &Request, info: &GatewayInfo) -> Result<SpawnedCgi, SpawnError> {
    let script = script.canonicalize().map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => SpawnError::NotFound(script.to_path_buf()),
        _ => SpawnError::Io(e),
    })?;
    let interpreter = resolve_interpreter(&script)?;
    let dir = script.parent().unwrap_or_else(|| Path::new("/"));

    let mut command = match &interpreter {
        Interpreter::Direct => Command::new(&script),
        Interpreter::Program { program, args } => {
            let mut command = Command::new(program);
            command.args(args).arg(&script);
            command
        }
    };
    command
        .current_dir(dir)
        .env_clear()
        .envs(meta_variables(&script, request, info))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    let mut child = command.spawn()?;
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let process = CgiProcess::new(child);
    let (Some(stdin), Some(stdout)) = (stdin, stdout) else {
        return Err(SpawnError::Io(io::Error::new(
            io::ErrorKind::Other,
            "child pipes were not created",
        )));
    };
    set_nonblocking(stdin.as_raw_fd())?;
    set_nonblocking(stdout.as_raw_fd())?;

    info!(pid = process.pid(), script = %script.display(), ?interpreter, "CGI started");
    Ok(SpawnedCgi {
        stdin,
        stdout,
        process,
    })
}

/// Executable file first, then a `#!` line, then the extension table.
pub fn resolve_interpreter(script: &Path) -> Result<Interpreter, SpawnError> {
    let meta = fs::metadata(script).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => SpawnError::NotFound(script.to_path_buf()),
        _ => SpawnError::Io(e),
    })?;
    if !meta.is_file() {
        return Err(SpawnError::NotFound(script.to_path_buf()));
    }
    if meta.permissions().mode() & 0o111 != 0 {
        return Ok(Interpreter::Direct);
    }
    if let Some(interpreter) = read_shebang(script)? {
        return Ok(interpreter);
    }
    let ext = script.extension().and_then(|e| e.to_str()).unwrap_or("");
    EXTENSION_INTERPRETERS
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(ext))
        .map(|(_, program)| Interpreter::Program {
            program: program.to_string(),
            args: Vec::new(),
        })
        .ok_or_else(|| SpawnError::NoInterpreter(script.to_path_buf()))
}

fn read_shebang(script: &Path) -> io::Result<Option<Interpreter>> {
    let mut head = Vec::new();
    File::open(script)?.take(MAX_SHEBANG).read_to_end(&mut head)?;
    let Some(rest) = head.strip_prefix(b"#!") else {
        return Ok(None);
    };
    let line_end = rest.iter().position(|&b| b == b'\n').unwrap_or(rest.len());
    let line = String::from_utf8_lossy(&rest[..line_end]);
    let line = line.trim();
    // Like the kernel: everything after the program is a single argument.
    let (program, arg) = match line.split_once([' ', '\t']) {
        Some((program, arg)) => (program, arg.trim()),
        None => (line, ""),
    };
    if program.is_empty() {
        return Ok(None);
    }
    let args = if arg.is_empty() { Vec::new() } else { vec![arg.to_string()] };
    Ok(Some(Interpreter::Program {
        program: program.to_string(),
        args,
    }))
}

/// The CGI/1.1 environment for one execution.
pub fn meta_variables(script: &Path, request: &Request, info: &GatewayInfo) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    let mut set = |key: &str, value: String| {
        env.insert(key.to_string(), value);
    };

    set("GATEWAY_INTERFACE", "CGI/1.1".into());
    set("SERVER_SOFTWARE", concat!("webserv/", env!("CARGO_PKG_VERSION")).into());
    set("SERVER_PROTOCOL", request.version.as_str().into());
    set("SERVER_NAME", info.server_name.clone());
    set("SERVER_PORT", info.server_addr.port().to_string());
    set("REMOTE_ADDR", info.remote_addr.ip().to_string());
    set("REMOTE_PORT", info.remote_addr.port().to_string());
    set("REQUEST_METHOD", request.method.as_str().into());
    set("SCRIPT_NAME", request.path.clone());
    set("PATH_INFO", request.path.clone());
    set("QUERY_STRING", request.query.clone());
    set("SCRIPT_FILENAME", script.display().to_string());
    set("REDIRECT_STATUS", "200".into());
    set(
        "PATH",
        std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string()),
    );

    if let Some(content_type) = request.header("content-type") {
        set("CONTENT_TYPE", content_type.to_string());
    }
    if !request.body.is_empty() || request.framing != BodyFraming::None {
        set("CONTENT_LENGTH", request.body.len().to_string());
    }

    for (name, value) in &request.headers {
        if name.is_empty() || HIDDEN_HEADERS.contains(&name.as_str()) {
            continue;
        }
        let key = format!("HTTP_{}", name.to_ascii_uppercase().replace('-', "_"));
        set(&key, value.clone());
    }
    env
}
