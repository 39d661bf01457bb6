//! Pipeline driver and inputs for logtap.
//!
//! [`pipeline::run`] binds an input reader, the streaming parser and the
//! sandbox: chunks are read, parsed into records, and each record is handed
//! to the script's `on_log` hook. [`watch::DirReader`] is the endless input
//! used for `--dir` mode: it tails every regular file under the watched
//! directories behind a plain [`std::io::Read`] interface.

pub mod error;
pub mod pipeline;
pub mod watch;

pub use error::EngineError;
pub use watch::DirReader;
