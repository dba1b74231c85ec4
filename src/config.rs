use serde_derive::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ServerError;
use crate::http::request::Method;
use crate::http::response::StatusCode;

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(rename = "server", default)]
    pub servers: Vec<ServerContext>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    pub max_connections: usize,
    pub max_events: usize,
    pub client_timeout_ms: u64,
    pub cgi_input_timeout_ms: u64,
    pub cgi_output_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            max_connections: 256,
            max_events: 64,
            client_timeout_ms: 60_000,
            cgi_input_timeout_ms: 10_000,
            cgi_output_timeout_ms: 30_000,
        }
    }
}

impl RuntimeConfig {
    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }

    pub fn cgi_input_timeout(&self) -> Duration {
        Duration::from_millis(self.cgi_input_timeout_ms)
    }

    pub fn cgi_output_timeout(&self) -> Duration {
        Duration::from_millis(self.cgi_output_timeout_ms)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

/// One virtual server.
#[derive(Deserialize, Debug, Clone)]
pub struct ServerContext {
    pub listen: Vec<String>,
    #[serde(default)]
    pub server_name: Vec<String>,
    #[serde(default = "default_client_max_body_size")]
    pub client_max_body_size: usize,
    /// Status code (as a string key) to page file.
    #[serde(default)]
    pub error_pages: HashMap<String, PathBuf>,
    #[serde(rename = "location", default)]
    pub locations: Vec<LocationContext>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct LocationContext {
    pub path: String,
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default)]
    pub index: Vec<String>,
    #[serde(default = "default_allow_methods")]
    pub allow_methods: Vec<String>,
    #[serde(default)]
    pub autoindex: bool,
    #[serde(default)]
    pub upload_store: Option<PathBuf>,
    /// File extensions (with the dot) executed as CGI scripts.
    #[serde(default)]
    pub cgi_extensions: Vec<String>,
    #[serde(rename = "return", default)]
    pub redirect: Option<Redirect>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Redirect {
    pub code: u16,
    pub url: String,
}

fn default_client_max_body_size() -> usize {
    1024 * 1024
}

fn default_root() -> PathBuf {
    PathBuf::from("www")
}

fn default_allow_methods() -> Vec<String> {
    vec!["GET".to_string(), "POST".to_string(), "DELETE".to_string()]
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ServerError> {
        let content = fs::read_to_string(path)?;
        Config::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Config, ServerError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.runtime.max_connections == 0 {
            return Err(ServerError::InvalidConfig("max_connections cannot be 0".into()));
        }
        if self.runtime.max_events == 0 {
            return Err(ServerError::InvalidConfig("max_events cannot be 0".into()));
        }
        if self.servers.is_empty() {
            return Err(ServerError::InvalidConfig("at least one [[server]] is required".into()));
        }
        for server in &self.servers {
            server.validate()?;
        }
        Ok(())
    }

    /// Picks the virtual server for a request that arrived on a listener
    /// shared by `candidates`, matching `server_name` against the Host.
    pub fn select_server(&self, candidates: &[usize], host: Option<&str>) -> &ServerContext {
        let by_name = host.and_then(|host| {
            candidates.iter().copied().find(|&idx| {
                self.servers[idx]
                    .server_name
                    .iter()
                    .any(|name| name.eq_ignore_ascii_case(host))
            })
        });
        let idx = by_name.or_else(|| candidates.first().copied()).unwrap_or(0);
        &self.servers[idx]
    }
}

impl ServerContext {
    fn validate(&self) -> Result<(), ServerError> {
        if self.listen.is_empty() {
            return Err(ServerError::InvalidConfig("server has no listen entries".into()));
        }
        for addr in self.listen_addrs()? {
            // Ephemeral ports only make sense for loopback test servers.
            if addr.port() == 0 && addr.ip() != IpAddr::V4(Ipv4Addr::LOCALHOST) {
                return Err(ServerError::InvalidConfig(format!("port cannot be 0 on {}", addr.ip())));
            }
        }
        for key in self.error_pages.keys() {
            if key.parse::<u16>().is_err() {
                return Err(ServerError::InvalidConfig(format!(
                    "error page key {:?} is not a status code",
                    key
                )));
            }
        }
        for location in &self.locations {
            location.validate()?;
        }
        Ok(())
    }

    pub fn listen_addrs(&self) -> Result<Vec<SocketAddr>, ServerError> {
        self.listen.iter().map(|entry| parse_listen(entry)).collect()
    }

    /// Longest prefix match, on a path-segment boundary.
    pub fn match_location(&self, path: &str) -> Option<&LocationContext> {
        self.locations
            .iter()
            .filter(|loc| loc.matches(path))
            .max_by_key(|loc| loc.path.len())
    }

    pub fn error_page(&self, status: StatusCode) -> Option<&Path> {
        self.error_pages
            .get(&status.as_u16().to_string())
            .map(PathBuf::as_path)
    }
}

impl LocationContext {
    fn validate(&self) -> Result<(), ServerError> {
        if !self.path.starts_with('/') {
            return Err(ServerError::InvalidConfig(format!(
                "location path {:?} must start with '/'",
                self.path
            )));
        }
        for method in &self.allow_methods {
            if Method::from_token(&method.to_ascii_uppercase()) == Method::Unknown {
                return Err(ServerError::InvalidConfig(format!(
                    "invalid method {} in allow_methods",
                    method
                )));
            }
        }
        if let Some(redirect) = &self.redirect {
            if !matches!(redirect.code, 301 | 302 | 303 | 307 | 308) {
                return Err(ServerError::InvalidConfig(format!(
                    "unsupported redirect status {}",
                    redirect.code
                )));
            }
            if redirect.url.is_empty() {
                return Err(ServerError::InvalidConfig("redirect needs a url".into()));
            }
        }
        Ok(())
    }

    fn matches(&self, path: &str) -> bool {
        if path == self.path || self.path == "/" {
            return true;
        }
        match path.strip_prefix(self.path.as_str()) {
            Some(rest) => self.path.ends_with('/') || rest.starts_with('/'),
            None => false,
        }
    }

    pub fn allows(&self, method: Method) -> bool {
        self.allow_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method.as_str()))
    }

    pub fn is_cgi_script(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        self.cgi_extensions
            .iter()
            .any(|c| c.trim_start_matches('.').eq_ignore_ascii_case(ext))
    }
}

/// Accepts `ip:port`, `localhost:port` or a bare port (all interfaces).
pub fn parse_listen(entry: &str) -> Result<SocketAddr, ServerError> {
    let invalid = || ServerError::InvalidConfig(format!("invalid listen entry {:?}", entry));
    let (host, port) = match entry.rsplit_once(':') {
        Some((host, port)) => (host, port),
        None => ("0.0.0.0", entry),
    };
    let ip: IpAddr = match host {
        "localhost" => IpAddr::V4(Ipv4Addr::LOCALHOST),
        other => other.parse().map_err(|_| invalid())?,
    };
    let port: u16 = port.parse().map_err(|_| invalid())?;
    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[runtime]
max_connections = 8
cgi_output_timeout_ms = 500

[[server]]
listen = ["127.0.0.1:8080", "8081", "localhost:8082"]
server_name = ["example.com"]
[server.error_pages]
"404" = "errors/404.html"

[[server.location]]
path = "/"
root = "www"
index = ["index.html"]
allow_methods = ["GET"]

[[server.location]]
path = "/cgi-bin"
root = "."
allow_methods = ["GET", "post"]
cgi_extensions = [".py", "sh"]

[[server.location]]
path = "/old"
return = { code = 301, url = "/new" }

[[server]]
listen = ["127.0.0.1:8080"]
server_name = ["other.org"]
"#;

    #[test]
    fn loads_sample_config() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.runtime.max_connections, 8);
        assert_eq!(config.runtime.max_events, 64);
        assert_eq!(config.runtime.cgi_output_timeout(), Duration::from_millis(500));
        assert_eq!(config.logging.level, "info");
        let addrs = config.servers[0].listen_addrs().unwrap();
        assert_eq!(addrs[0], "127.0.0.1:8080".parse().unwrap());
        assert_eq!(addrs[1], "0.0.0.0:8081".parse().unwrap());
        assert_eq!(addrs[2], "127.0.0.1:8082".parse().unwrap());
        assert_eq!(
            config.servers[0].error_page(StatusCode::NotFound),
            Some(Path::new("errors/404.html"))
        );
    }

    #[test]
    fn longest_prefix_location_wins() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        let server = &config.servers[0];
        assert_eq!(server.match_location("/cgi-bin/a.py").unwrap().path, "/cgi-bin");
        assert_eq!(server.match_location("/cgi-bin").unwrap().path, "/cgi-bin");
        assert_eq!(server.match_location("/cgi-binary").unwrap().path, "/");
        assert_eq!(server.match_location("/old/x").unwrap().path, "/old");
    }

    #[test]
    fn location_helpers() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        let cgi = config.servers[0].match_location("/cgi-bin/x").unwrap();
        assert!(cgi.allows(Method::Post));
        assert!(!cgi.allows(Method::Delete));
        assert!(cgi.is_cgi_script(Path::new("cgi-bin/run.sh")));
        assert!(!cgi.is_cgi_script(Path::new("cgi-bin/readme.txt")));
    }

    #[test]
    fn selects_virtual_server_by_host() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        let shared = [0, 1];
        assert_eq!(config.select_server(&shared, Some("OTHER.org")).server_name[0], "other.org");
        assert_eq!(config.select_server(&shared, Some("unknown")).server_name[0], "example.com");
        assert_eq!(config.select_server(&shared, None).server_name[0], "example.com");
    }

    #[test]
    fn rejects_invalid_configs() {
        let cases = [
            "",
            "[[server]]\nlisten = []\n",
            "[[server]]\nlisten = [\"nowhere:80\"]\n",
            "[[server]]\nlisten = [\"80\"]\n[[server.location]]\npath = \"x\"\n",
            "[[server]]\nlisten = [\"80\"]\n[[server.location]]\npath = \"/\"\nallow_methods = [\"PUT\"]\n",
            "[[server]]\nlisten = [\"80\"]\n[[server.location]]\npath = \"/\"\nreturn = { code = 200, url = \"/\" }\n",
            "[runtime]\nmax_connections = 0\n[[server]]\nlisten = [\"80\"]\n",
            "[[server]]\nlisten = [\"0\"]\n",
            "[[server]]\nlisten = [\"0.0.0.0:0\"]\n",
        ];
        for case in cases {
            assert!(
                matches!(Config::from_toml_str(case), Err(ServerError::InvalidConfig(_))),
                "accepted: {:?}",
                case
            );
        }
    }

    #[test]
    fn ephemeral_port_only_on_loopback() {
        let config = Config::from_toml_str("[[server]]\nlisten = [\"127.0.0.1:0\"]\n").unwrap();
        assert_eq!(config.servers[0].listen_addrs().unwrap()[0].port(), 0);
    }
}
