//! HTTP/1.1 request parsing, response building and request routing.
//!
//! - **`parser`**: incremental request parser, including chunked bodies
//! - **`request`**: the parsed request representation
//! - **`response`**: status codes and server-generated responses
//! - **`processor`**: decides between a ready response and a CGI run

pub mod parser;
pub mod processor;
pub mod request;
pub mod response;

pub use parser::{ByteStreamParser, ParseError, ParseStatus};
pub use processor::{Outcome, RequestProcessor};
pub use request::{BodyFraming, Method, Request, Version};
pub use response::{HttpResponse, StatusCode};
