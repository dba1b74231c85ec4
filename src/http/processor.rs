use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::config::{LocationContext, ServerContext};
use crate::http::parser::ParseStatus;
use crate::http::request::{Method, Request};
use crate::http::response::{HttpResponse, StatusCode};

#[derive(Debug)]
pub enum Outcome {
    Respond(HttpResponse),
    ExecuteCgi { script_path: PathBuf },
}

pub struct RequestProcessor<'a> {
    server: &'a ServerContext,
}

impl<'a> RequestProcessor<'a> {
    pub fn new(server: &'a ServerContext) -> Self {
        RequestProcessor { server }
    }

    pub fn process(&self, status: ParseStatus, request: &Request) -> Outcome {
        match status {
            ParseStatus::Finished => {}
            ParseStatus::Error(e) => return Outcome::Respond(self.error_response(e.status())),
            ParseStatus::Continue => {
                return Outcome::Respond(self.error_response(StatusCode::InternalServerError))
            }
        }
        match self.route(request) {
            Ok(outcome) => outcome,
            Err(status) => Outcome::Respond(self.error_response(status)),
        }
    }

    /// The configured error page for `status`, or the built-in one.
    pub fn error_response(&self, status: StatusCode) -> HttpResponse {
        if let Some(page) = self.server.error_page(status) {
            match fs::read(page) {
                Ok(body) => return HttpResponse::new(status, "text/html", body),
                Err(e) => debug!("error page {} unreadable: {}", page.display(), e),
            }
        }
        HttpResponse::error(status)
    }

    fn route(&self, request: &Request) -> Result<Outcome, StatusCode> {
        let location = self
            .server
            .match_location(&request.path)
            .ok_or(StatusCode::NotFound)?;

        if !location.allows(request.method) {
            let allow = location
                .allow_methods
                .iter()
                .map(|m| m.to_ascii_uppercase())
                .collect::<Vec<_>>()
                .join(", ");
            let response = self
                .error_response(StatusCode::MethodNotAllowed)
                .with_header("Allow", &allow);
            return Ok(Outcome::Respond(response));
        }
        if request.body.len() > self.server.client_max_body_size {
            return Err(StatusCode::ContentTooLarge);
        }
        if let Some(redirect) = &location.redirect {
            let status = StatusCode::from_u16(redirect.code).unwrap_or(StatusCode::Found);
            return Ok(Outcome::Respond(HttpResponse::redirect(status, &redirect.url)));
        }

        let fs_path = resolve_path(&location.root, &request.path)?;
        if location.is_cgi_script(&fs_path) {
            if !fs_path.is_file() {
                return Err(StatusCode::NotFound);
            }
            debug!("{} routed to CGI {}", request.path, fs_path.display());
            return Ok(Outcome::ExecuteCgi { script_path: fs_path });
        }

        let response = match request.method {
            Method::Get => serve_get(location, &request.path, &fs_path)?,
            Method::Post => store_upload(location, request)?,
            Method::Delete => delete_file(&fs_path)?,
            Method::Unknown => return Err(StatusCode::NotImplemented),
        };
        Ok(Outcome::Respond(response))
    }
}

fn resolve_path(root: &Path, url_path: &str) -> Result<PathBuf, StatusCode> {
    let decoded = urlencoding::decode(url_path).map_err(|_| StatusCode::BadRequest)?;
    if decoded.contains('\0') {
        return Err(StatusCode::BadRequest);
    }
    if decoded.split('/').any(|segment| segment == "..") {
        return Err(StatusCode::Forbidden);
    }
    Ok(root.join(decoded.trim_start_matches('/')))
}

fn io_status(err: io::Error) -> StatusCode {
    match err.kind() {
        io::ErrorKind::NotFound => StatusCode::NotFound,
        io::ErrorKind::PermissionDenied => StatusCode::Forbidden,
        _ => StatusCode::InternalServerError,
    }
}

fn serve_get(location: &LocationContext, url_path: &str, fs_path: &Path) -> Result<HttpResponse, StatusCode> {
    let meta = fs::metadata(fs_path).map_err(io_status)?;
    if !meta.is_dir() {
        return read_file(fs_path);
    }
    if !url_path.ends_with('/') {
        let target = format!("{}/", url_path);
        return Ok(HttpResponse::redirect(StatusCode::MovedPermanently, &target));
    }
    for index in &location.index {
        let candidate = fs_path.join(index);
        if candidate.is_file() {
            return read_file(&candidate);
        }
    }
    if location.autoindex {
        return autoindex(fs_path, url_path);
    }
    Err(StatusCode::Forbidden)
}

fn read_file(path: &Path) -> Result<HttpResponse, StatusCode> {
    let body = fs::read(path).map_err(io_status)?;
    Ok(HttpResponse::new(StatusCode::Ok, mime_type(path), body))
}

fn autoindex(dir: &Path, url_path: &str) -> Result<HttpResponse, StatusCode> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .map_err(io_status)?
        .filter_map(|entry| entry.ok())
        .map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            match entry.file_type() {
                Ok(t) if t.is_dir() => format!("{}/", name),
                _ => name,
            }
        })
        .collect();
    names.sort();

    let title = html_escape(url_path);
    let mut body = format!(
        "<!DOCTYPE html>\n<html>\n<head><title>Index of {0}</title></head>\n<body>\n<h1>Index of {0}</h1>\n<ul>\n",
        title
    );
    for name in &names {
        let escaped = html_escape(name);
        body.push_str(&format!("<li><a href=\"{0}\">{0}</a></li>\n", escaped));
    }
    body.push_str("</ul>\n</body>\n</html>\n");
    Ok(HttpResponse::new(StatusCode::Ok, "text/html", body))
}

fn store_upload(location: &LocationContext, request: &Request) -> Result<HttpResponse, StatusCode> {
    let Some(store) = &location.upload_store else {
        return Err(StatusCode::Forbidden);
    };
    let name = upload_file_name(&request.path, &location.path);
    fs::create_dir_all(store).map_err(io_status)?;
    fs::write(store.join(&name), &request.body).map_err(io_status)?;

    let created = format!("{}/{}", location.path.trim_end_matches('/'), name);
    Ok(HttpResponse::new(
        StatusCode::Created,
        "text/plain",
        format!("stored {} bytes as {}\n", request.body.len(), name),
    )
    .with_header("Location", &created))
}

/// Last path segment below the location, or a generated name.
fn upload_file_name(url_path: &str, location_path: &str) -> String {
    let below = url_path.strip_prefix(location_path).unwrap_or("");
    let candidate = below.rsplit('/').next().unwrap_or("");
    let decoded = urlencoding::decode(candidate).map(|c| c.into_owned()).unwrap_or_default();
    if decoded.is_empty() || decoded.starts_with('.') || decoded.contains(['/', '\\', '\0']) {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        return format!("upload-{}", nanos);
    }
    decoded
}

fn delete_file(fs_path: &Path) -> Result<HttpResponse, StatusCode> {
    let meta = fs::metadata(fs_path).map_err(io_status)?;
    if meta.is_dir() {
        return Err(StatusCode::Forbidden);
    }
    fs::remove_file(fs_path).map_err(io_status)?;
    Ok(HttpResponse::empty(StatusCode::NoContent))
}

pub fn mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
