//! Structured log records.
//!
//! A record keeps its well-known header fields in dedicated slots and
//! everything else in an ordered property list with unique keys. The named
//! keys (`timestamp`, `date`, `time`, `level`, `thread`, `class`, `msg`)
//! always resolve against the header slots; any other key goes through the
//! property list. Property order is user-visible and preserved by every
//! operation.

use std::fmt;

/// Log level value for informational records.
pub const LEVEL_INFO: &str = "INFO";
/// Log level value for debug records.
pub const LEVEL_DEBUG: &str = "DEBUG";
/// Log level value for trace records.
pub const LEVEL_TRACE: &str = "TRACE";
/// Log level value for error records.
pub const LEVEL_ERROR: &str = "ERROR";
/// Log level value for warning records.
pub const LEVEL_WARN: &str = "WARN";

/// Named key for the thread header slot.
pub const KEY_THREAD: &str = "thread";
/// Named key for the class header slot.
pub const KEY_CLASS: &str = "class";
/// Named key for the level header slot.
pub const KEY_LEVEL: &str = "level";
/// Named key for the time header slot.
pub const KEY_TIME: &str = "time";
/// Named key for the date header slot.
pub const KEY_DATE: &str = "date";
/// Named key for the composite `date time` header value.
pub const KEY_TIMESTAMP: &str = "timestamp";
/// Named key for the free-form message slot.
pub const KEY_MESSAGE: &str = "msg";

/// Error returned by [`Record::checked_set`] for a malformed composite
/// timestamp (anything other than `date SP time` with a single space).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid timestamp format: {0}")]
pub struct InvalidTimestamp(pub String);

/// An arbitrary key/value pair attached to a [`Record`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Property {
    pub(crate) key: String,
    pub(crate) value: String,
}

impl Property {
    /// Property key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Property value.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }
}

/// A structured log record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    /* header */
    pub(crate) date: String,
    pub(crate) time: String,
    pub(crate) level: String,
    pub(crate) thread: String,
    pub(crate) class: String,

    /* other properties */
    pub(crate) message: String,
    pub(crate) props: Vec<Property>,
}

impl Record {
    /// Create an empty record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset all fields to their empty values. The property list is
    /// truncated in place so its capacity is retained for reuse.
    pub fn reset(&mut self) {
        self.date.clear();
        self.time.clear();
        self.level.clear();
        self.thread.clear();
        self.class.clear();
        self.message.clear();
        self.props.clear();
    }

    /// The composite `date SP time` timestamp.
    #[must_use]
    pub fn timestamp(&self) -> String {
        format!("{} {}", self.date, self.time)
    }

    /// Date header slot.
    #[must_use]
    pub fn date(&self) -> &str {
        &self.date
    }

    /// Time header slot.
    #[must_use]
    pub fn time(&self) -> &str {
        &self.time
    }

    /// Level header slot.
    #[must_use]
    pub fn level(&self) -> &str {
        &self.level
    }

    /// Thread header slot.
    #[must_use]
    pub fn thread(&self) -> &str {
        &self.thread
    }

    /// Class header slot.
    #[must_use]
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Free-form message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The arbitrary key/value properties, in insertion order. Named keys
    /// never appear here.
    #[must_use]
    pub fn props(&self) -> &[Property] {
        &self.props
    }

    /// Look up a key. Named keys resolve against the header slots (a slot is
    /// present when non-empty; the composite `timestamp` is present when
    /// either date or time is non-empty); anything else scans the property
    /// list.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        let slot = match key {
            KEY_TIMESTAMP => {
                if self.date.is_empty() && self.time.is_empty() {
                    return None;
                }
                return Some(self.timestamp());
            }
            KEY_THREAD => &self.thread,
            KEY_MESSAGE => &self.message,
            KEY_LEVEL => &self.level,
            KEY_CLASS => &self.class,
            KEY_TIME => &self.time,
            KEY_DATE => &self.date,
            _ => {
                return self
                    .props
                    .iter()
                    .find(|p| p.key == key)
                    .map(|p| p.value.clone());
            }
        };
        if slot.is_empty() {
            None
        } else {
            Some(slot.clone())
        }
    }

    /// Upsert a key. Returns `true` when the key already carried a value
    /// (header slot non-empty, or property key present). Setting `timestamp`
    /// splits the value on its single space into date and time; an empty
    /// value clears both slots.
    ///
    /// # Panics
    ///
    /// Panics when a non-empty `timestamp` value does not contain exactly
    /// one space. Use [`Record::checked_set`] to validate instead.
    pub fn set(&mut self, key: &str, value: &str) -> bool {
        match self.checked_set(key, value) {
            Ok(upsert) => upsert,
            Err(e) => panic!("{e}"),
        }
    }

    /// Non-panicking variant of [`Record::set`].
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTimestamp`] when `key` is `timestamp` and the value
    /// is non-empty but not of the form `date SP time`.
    pub fn checked_set(&mut self, key: &str, value: &str) -> Result<bool, InvalidTimestamp> {
        let upsert = match key {
            KEY_TIMESTAMP => {
                let upsert = !self.date.is_empty() || !self.time.is_empty();
                if value.is_empty() {
                    self.date.clear();
                    self.time.clear();
                    return Ok(upsert);
                }
                let (date, time) = split_timestamp(value)?;
                self.date = date.to_owned();
                self.time = time.to_owned();
                upsert
            }
            KEY_LEVEL => replace_slot(&mut self.level, value),
            KEY_MESSAGE => replace_slot(&mut self.message, value),
            KEY_THREAD => replace_slot(&mut self.thread, value),
            KEY_CLASS => replace_slot(&mut self.class, value),
            KEY_TIME => replace_slot(&mut self.time, value),
            KEY_DATE => replace_slot(&mut self.date, value),
            _ => {
                if let Some(p) = self.props.iter_mut().find(|p| p.key == key) {
                    p.value = value.to_owned();
                    return Ok(true);
                }
                self.props.push(Property {
                    key: key.to_owned(),
                    value: value.to_owned(),
                });
                false
            }
        };
        Ok(upsert)
    }

    /// Remove a key. Named keys are cleared through [`Record::set`] with an
    /// empty value; plain property keys are deleted, compacting the list
    /// while preserving the relative order of the survivors. Returns whether
    /// the key was present.
    pub fn remove(&mut self, key: &str) -> bool {
        match key {
            KEY_THREAD | KEY_LEVEL | KEY_CLASS | KEY_TIME | KEY_DATE | KEY_TIMESTAMP
            | KEY_MESSAGE => self.set(key, ""),
            _ => match self.props.iter().position(|p| p.key == key) {
                Some(i) => {
                    self.props.remove(i);
                    true
                }
                None => false,
            },
        }
    }

    /// Serialize in the human-readable tab/comma-delimited layout into
    /// `buf`. Empty thread and class render as `-`; the message, when set,
    /// is appended last as a `msg` property.
    pub fn to_text(&self, buf: &mut String) {
        buf.push_str(&self.date);
        buf.push(' ');
        buf.push_str(&self.time);
        buf.push('\t');
        buf.push_str(&self.level);
        buf.push('\t');
        buf.push('[');
        if self.thread.is_empty() {
            buf.push('-');
        } else {
            buf.push_str(&self.thread);
        }
        buf.push(']');
        buf.push('\t');
        if self.class.is_empty() {
            buf.push('-');
        } else {
            buf.push_str(&self.class);
        }
        self.serialize(buf, "\t", ", ", ": ");
    }

    /// Serialize as a compact JSON object into `buf`: `timestamp`, `level`,
    /// `thread` and `class` first, then the properties in order, then `msg`
    /// when the message is set.
    pub fn to_json(&self, buf: &mut String) {
        buf.push_str("{\"timestamp\":\"");
        buf.push_str(&self.date);
        buf.push(' ');
        buf.push_str(&self.time);
        buf.push_str("\",\"level\":\"");
        buf.push_str(&self.level);
        buf.push_str("\",\"thread\":\"");
        buf.push_str(&self.thread);
        buf.push_str("\",\"class\":\"");
        buf.push_str(&self.class);
        self.serialize(buf, "\",\"", "\",\"", "\":\"");
        buf.push_str("\"}");
    }

    /// Human-readable serialization as a fresh string.
    #[must_use]
    pub fn to_text_string(&self) -> String {
        let mut buf = String::new();
        self.to_text(&mut buf);
        buf
    }

    /// JSON serialization as a fresh string.
    #[must_use]
    pub fn to_json_string(&self) -> String {
        let mut buf = String::new();
        self.to_json(&mut buf);
        buf
    }

    fn serialize(&self, buf: &mut String, header_sep: &str, key_sep: &str, value_sep: &str) {
        let mut key_sep = key_sep;
        match self.props.split_first() {
            None => key_sep = header_sep,
            Some((first, rest)) => {
                append_prop(buf, header_sep, value_sep, &first.key, &first.value);
                for p in rest {
                    append_prop(buf, key_sep, value_sep, &p.key, &p.value);
                }
            }
        }

        if !self.message.is_empty() {
            append_prop(buf, key_sep, value_sep, KEY_MESSAGE, &self.message);
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text_string())
    }
}

/// Split a composite timestamp on its single space.
pub(crate) fn split_timestamp(value: &str) -> Result<(&str, &str), InvalidTimestamp> {
    let mut parts = value.split(' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(date), Some(time), None) => Ok((date, time)),
        _ => Err(InvalidTimestamp(value.to_owned())),
    }
}

fn replace_slot(slot: &mut String, value: &str) -> bool {
    let upsert = !slot.is_empty();
    slot.clear();
    slot.push_str(value);
    upsert
}

fn append_prop(buf: &mut String, key_sep: &str, value_sep: &str, key: &str, value: &str) {
    buf.push_str(key_sep);
    escape_into(buf, key);
    buf.push_str(value_sep);
    escape_into(buf, value);
}

fn escape_into(buf: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            '\u{8}' => buf.push_str("\\b"),
            '\u{c}' => buf.push_str("\\f"),
            '\n' => buf.push_str("\\n"),
            '\r' => buf.push_str("\\r"),
            '\t' => buf.push_str("\\t"),
            '"' => buf.push_str("\\\""),
            '\\' => buf.push_str("\\\\"),
            _ => buf.push(c),
        }
    }
}
