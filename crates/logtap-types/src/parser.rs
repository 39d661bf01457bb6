//! Incremental streaming log parser.
//!
//! The parser is a byte-level finite state machine over an accumulator of
//! unconsumed input. [`Parser::parse`] appends every newline-terminated
//! record found in `previous tail ++ chunk` to the caller's vector and keeps
//! the suffix after the final newline for the next call, so input may be
//! split at any byte boundary without changing the parsed output.
//!
//! Expected line grammar:
//!
//! ```text
//! DATE WS TIME WS LEVEL WS "[" THREAD "]" WS CLASS
//!     ( WS KEY ":" WS VALUE ( "," WS KEY ":" WS VALUE )* )? ( MESSAGE )?
//! ```
//!
//! The first token after the class is provisionally committed as a
//! `callType` property when terminated by `:`; a second `key:` sequence
//! confirms it, while a `,` first reinterprets the provisional value as the
//! key itself. Inside a value a `:` only splits off a new key when followed
//! by a space, so URLs and trace ids with embedded colons survive intact.
//! Trailing text before the newline becomes the pending value when the last
//! key was never value-terminated, and the record message otherwise.

use bytes::{Buf, BytesMut};

use crate::record::{Property, Record};

/// Key under which the provisional first token after the class is stored.
const CALL_TYPE_KEY: &str = "callType";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Date,
    Time,
    TransitionLevel,
    Level,
    TransitionThread,
    Thread,
    TransitionClass,
    Class,
    TransitionCallType,
    CallType,
    VerifyCallType,
    Key,
    MultiKey,
    Value,
    // no transition enters this state yet; a malformed header would
    // degrade here and consume until the newline reset
    #[allow(dead_code)]
    Error,
}

#[derive(Debug, Clone, Copy)]
enum HeaderSlot {
    Date,
    Time,
    Level,
    Class,
}

/// Incremental parser state: the accumulator of unconsumed input, absolute
/// start/end indices of the token being scanned, the FSM state, and the
/// partially built record.
#[derive(Debug)]
pub struct Parser {
    state: State,
    start: usize,
    end: usize,
    raw: BytesMut,
    current: Record,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    /// Create a parser in its initial state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: State::Date,
            start: 0,
            end: 0,
            raw: BytesMut::new(),
            current: Record::new(),
        }
    }

    /// Discard any buffered input and partial record and return to the
    /// initial state.
    pub fn reset(&mut self) {
        self.state = State::Date;
        self.start = 0;
        self.end = 0;
        self.raw.clear();
        self.current = Record::new();
    }

    /// Number of buffered, not-yet-consumed bytes. Bounded by the longest
    /// in-flight line.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.raw.len()
    }

    /// Parse `chunk`, appending every newline-terminated record to `out`.
    /// The unterminated suffix is retained for the next call; each input
    /// byte is scanned exactly once, so any chunking of the same input
    /// yields the same records.
    pub fn parse(&mut self, chunk: &[u8], out: &mut Vec<Record>) {
        let scan_from = self.raw.len();
        self.raw.extend_from_slice(chunk);

        let mut i = scan_from;
        while i < self.raw.len() {
            let b = self.raw[i];
            if b == b'\n' {
                self.consume_record();
                self.start = i + 1;
                self.end = self.start;
                self.state = State::Date;
                out.push(std::mem::take(&mut self.current));
            } else {
                self.next(b);
            }
            i += 1;
        }

        // Drop the committed prefix; only the in-flight token survives.
        let consumed = self.start.min(self.raw.len());
        self.raw.advance(consumed);
        self.start -= consumed;
        self.end = self.end.saturating_sub(consumed);
    }

    // Malformed lines can leave start ahead of end (a `]` opening the
    // thread field); clamping keeps those degraded tokens empty instead of
    // panicking.
    fn token(&self, start: usize, end: usize) -> String {
        let end = end.min(self.raw.len());
        let start = start.min(end);
        String::from_utf8_lossy(&self.raw[start..end]).into_owned()
    }

    fn next(&mut self, b: u8) {
        match self.state {
            State::Date => self.next_header(b, HeaderSlot::Date, State::Time),
            State::Time => self.next_header(b, HeaderSlot::Time, State::TransitionLevel),
            State::Level => self.next_header(b, HeaderSlot::Level, State::TransitionThread),
            State::Thread => self.next_thread(b),
            State::Class => self.next_header(b, HeaderSlot::Class, State::TransitionCallType),
            State::CallType => self.next_call_type(b),
            State::VerifyCallType => self.verify_call_type(b),
            State::Key => self.next_key(b),
            State::Value => self.next_value(b),
            State::MultiKey => self.next_multi_key(b),
            State::Error => {
                // consume until the newline resets the state
            }
            State::TransitionLevel => self.transition(b, State::Level),
            State::TransitionThread => self.transition(b, State::Thread),
            State::TransitionClass => self.transition(b, State::Class),
            State::TransitionCallType => self.transition(b, State::CallType),
        }
    }

    fn transition(&mut self, b: u8, next: State) {
        match b {
            b'\t' | b' ' => {
                self.start += 1;
                self.end += 1;
            }
            _ => {
                self.state = next;
                self.next(b);
            }
        }
    }

    fn next_header(&mut self, b: u8, slot: HeaderSlot, next: State) {
        match b {
            b'\t' | b' ' => {
                let token = self.token(self.start, self.end);
                let record = &mut self.current;
                match slot {
                    HeaderSlot::Date => record.date = token,
                    HeaderSlot::Time => record.time = token,
                    HeaderSlot::Level => record.level = token,
                    HeaderSlot::Class => record.class = token,
                }
                self.end += 1;
                self.start = self.end;
                self.state = next;
            }
            _ => self.end += 1,
        }
    }

    fn next_thread(&mut self, b: u8) {
        match b {
            b']' => {
                // skip the opening bracket; brackets are not part of the value
                self.start += 1;
                self.current.thread = self.token(self.start, self.end);
                self.end += 1;
                self.start = self.end;
                self.state = State::TransitionClass;
            }
            _ => self.end += 1,
        }
    }

    fn next_call_type(&mut self, b: u8) {
        match b {
            b':' => {
                let value = self.token(self.start, self.end);
                self.current.props.push(Property {
                    key: CALL_TYPE_KEY.to_owned(),
                    value,
                });
                self.end += 1;
                self.start = self.end;
                self.state = State::VerifyCallType;
            }
            _ => self.end += 1,
        }
    }

    // The callType property only stands if two keys appear in sequence:
    // "callType: key: value". A comma first means the provisional value was
    // itself the key.
    fn verify_call_type(&mut self, b: u8) {
        match b {
            b',' => {
                if let Some(first) = self.current.props.first_mut() {
                    first.key = std::mem::take(&mut first.value);
                }
                self.next_value(b);
            }
            _ => self.next_key(b),
        }
    }

    fn next_key(&mut self, b: u8) {
        match b {
            b' ' => {
                // trim left spaces
                if self.start == self.end {
                    self.start += 1;
                    self.end += 1;
                }
            }
            b':' => {
                let key = self.token(self.start, self.end);
                self.current.props.push(Property {
                    key,
                    value: String::new(),
                });
                self.state = State::Value;
                self.end += 1;
                self.start = self.end;
            }
            _ => self.end += 1,
        }
    }

    fn next_value(&mut self, b: u8) {
        match b {
            b',' => {
                self.consume_current();
                self.state = State::Key;
                self.end += 1;
                self.start = self.end;
            }
            // ":" followed by a space re-keys the pending property
            b':' => {
                self.state = State::MultiKey;
                self.end += 1;
            }
            b' ' => {
                // trim left spaces
                if self.start == self.end {
                    self.start += 1;
                }
                self.end += 1;
            }
            _ => self.end += 1,
        }
    }

    fn next_multi_key(&mut self, b: u8) {
        match b {
            b',' => {
                // value separator, exactly as in the Value state
                self.consume_current();
                self.state = State::Key;
                self.end += 1;
                self.start = self.end;
            }
            b' ' => {
                // the preceding token was a key after all; the provisional
                // property is re-keyed and its spurious value dropped
                let key = self.token(self.start, self.end - 1);
                if let Some(last) = self.current.props.last_mut() {
                    *last = Property {
                        key,
                        value: String::new(),
                    };
                }
                self.end += 1;
                self.start = self.end;
                self.state = State::Value;
            }
            _ => {
                // char:char is legitimate value content
                self.state = State::Value;
                self.end += 1;
            }
        }
    }

    fn consume_current(&mut self) {
        let value = self.token(self.start, self.end);
        if let Some(last) = self.current.props.last_mut() {
            last.value = value;
        }
    }

    // Newline: the residual slice becomes the pending value when the last
    // key was never value-terminated, and the message otherwise.
    fn consume_record(&mut self) {
        let token = self.token(self.start, self.end);
        match self.current.props.last_mut() {
            Some(last) if last.value.is_empty() => last.value = token,
            _ => self.current.message = token,
        }
    }
}

/// Parse a complete input in one call. Only newline-terminated lines
/// produce records.
#[must_use]
pub fn parse(input: &str) -> Vec<Record> {
    let mut parser = Parser::new();
    let mut out = Vec::new();
    parser.parse(input.as_bytes(), &mut out);
    out
}
