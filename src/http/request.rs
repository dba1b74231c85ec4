use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    Get,
    Post,
    Delete,
    #[default]
    Unknown,
}

impl Method {
    pub fn from_token(token: &str) -> Method {
        match token {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "DELETE" => Method::Delete,
            _ => Method::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
            Method::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Version {
    Http10,
    #[default]
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

/// How the end of the request body is found. Chunked and Content-Length
/// framing are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyFraming {
    #[default]
    None,
    ContentLength(usize),
    Chunked,
}

/// A request as accumulated by the parser. Header names are stored
/// lower-cased; repeated headers are joined with ", ".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    /// Raw request-target as received, query included.
    pub target: String,
    pub path: String,
    pub query: String,
    pub version: Version,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub framing: BodyFraming,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|v| v.as_str())
    }

    /// The Host header without any port suffix.
    pub fn host(&self) -> Option<&str> {
        self.header("host").map(|host| match host.rsplit_once(':') {
            Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
            _ => host,
        })
    }

    pub fn is_chunked(&self) -> bool {
        self.framing == BodyFraming::Chunked
    }

    pub(crate) fn set_target(&mut self, target: &str) {
        self.target = target.to_string();
        match target.split_once('?') {
            Some((path, query)) => {
                self.path = path.to_string();
                self.query = query.to_string();
            }
            None => {
                self.path = target.to_string();
                self.query.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_is_split_into_path_and_query() {
        let mut req = Request::default();
        req.set_target("/cgi-bin/form.py?name=a&x=1");
        assert_eq!(req.path, "/cgi-bin/form.py");
        assert_eq!(req.query, "name=a&x=1");
        assert_eq!(req.target, "/cgi-bin/form.py?name=a&x=1");
    }

    #[test]
    fn host_strips_port() {
        let mut req = Request::default();
        req.headers.insert("host".into(), "example.com:8080".into());
        assert_eq!(req.host(), Some("example.com"));
        assert_eq!(req.header("HOST"), Some("example.com:8080"));
    }
}
