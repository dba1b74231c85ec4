//! A single-threaded, epoll-driven HTTP/1.1 server with CGI/1.1 support.

pub mod cgi;
pub mod config;
pub mod error;
pub mod http;
pub mod server;

pub use config::Config;
pub use error::ServerError;
pub use server::{Server, ShutdownToken};
