pub mod file_tailer;
pub mod parser;
pub mod syslog_listener;

pub use file_tailer::{AsyncFileTailer, FileTailer};
pub use parser::{LineParser, ParseError};
pub use syslog_listener::AsyncSyslogListener;
