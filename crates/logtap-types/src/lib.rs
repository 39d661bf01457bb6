//! Record model and incremental streaming parser for logtap.
//!
//! A [`Record`] is one parsed log line: dedicated header slots (`date`,
//! `time`, `level`, `thread`, `class`, message) plus an ordered list of
//! arbitrary key/value properties. The [`Parser`] turns arbitrarily-chunked
//! byte input into a sequence of records, carrying any unterminated trailing
//! line over to the next chunk.

pub mod parser;
pub mod record;

pub use parser::{parse, Parser};
pub use record::{InvalidTimestamp, Property, Record};
