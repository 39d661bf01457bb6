//! The pipeline driver: input reader → parser → per-record hook dispatch.

use std::io::Read;

use tracing::debug;

use logtap_runtime::{RecordHandle, Sandbox};
use logtap_types::{Parser, Record};

use crate::error::EngineError;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Drive the pipeline until the reader is exhausted: read a chunk, parse it
/// into records, and invoke the sandbox's `on_log` hook for each record in
/// parser order (through the protected path when the sandbox is configured
/// for it). Returns the number of records processed.
///
/// Blocks the calling thread on reads and hook dispatch; run it on a
/// blocking thread, not an async task.
///
/// # Errors
///
/// Fails on a reader error or on a hook error the sandbox did not recover
/// from. Malformed input never fails: the parser degrades instead.
pub fn run(sandbox: &Sandbox, reader: &mut dyn Read) -> Result<u64, EngineError> {
    let mut parser = Parser::new();
    let mut records: Vec<Record> = Vec::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut processed: u64 = 0;

    let protected = sandbox.protected_mode();
    debug!(protected, "pipeline starting");

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => {
                debug!(processed, "input exhausted");
                return Ok(processed);
            }
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(EngineError::Reader(e)),
        };

        parser.parse(&buf[..n], &mut records);
        for record in records.drain(..) {
            let handle = RecordHandle::new(record);
            if protected {
                sandbox.protected_call_on_log(&handle)?;
            } else {
                sandbox.call_on_log(&handle)?;
            }
            processed += 1;
        }
    }
}
