//! CGI/1.1 execution: spawning scripts, feeding and draining their pipes
//! under reactor control, and turning their output into HTTP responses.

pub mod gateway;
pub mod io;
pub mod process;
pub mod translate;

pub use gateway::{spawn, GatewayInfo, SpawnError, SpawnedCgi};
pub use io::{CgiInput, CgiOutput, CgiReply};
pub use process::CgiProcess;
pub use translate::{parse_cgi_output, translate_cgi_output};
