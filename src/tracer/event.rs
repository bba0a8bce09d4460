use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

/// Maximum process name length carried in a sample (TASK_COMM_LEN).
pub const COMM_LEN: usize = 16;

/// Maximum number of u64 fields a single event may carry.
pub const MAX_FIELDS: usize = 16;

/// Numeric trace event type as carried in the sample header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EventTypeId(pub u16);

impl fmt::Display for EventTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inline, fixed-size process name.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Comm {
    bytes: [u8; COMM_LEN],
    len: u8,
}

impl Comm {
    /// Build a comm from raw bytes, truncating at the first NUL or COMM_LEN.
    pub fn new(raw: &[u8]) -> Self {
        let mut bytes = [0u8; COMM_LEN];
        let mut len = 0usize;
        for (slot, &b) in bytes.iter_mut().zip(raw.iter()) {
            if b == 0 {
                break;
            }
            *slot = b;
            len += 1;
        }
        Self {
            bytes,
            len: len as u8,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Returns the name, or "?" when it is not valid UTF-8.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(self.as_bytes()).unwrap_or("?")
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for Comm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Comm({:?})", self.as_str())
    }
}

impl fmt::Display for Comm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Where the correlation/grouping key of an event comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    Pid,
    Tid,
    Cpu,
    Field(usize),
}

/// Declared shape of one trace event type, as written in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct EventDef {
    /// Event name (e.g. "sys_enter", "kmalloc").
    pub name: String,
    /// Numeric id carried in the sample header.
    pub id: u16,
    /// Names of the u64 payload fields, in wire order.
    #[serde(default)]
    pub fields: Vec<String>,
    /// Key field for this event. Overrides the global `key_field`.
    #[serde(default)]
    pub key: Option<String>,
}

/// Resolved schema for one event type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSchema {
    pub id: EventTypeId,
    pub name: String,
    pub fields: Vec<String>,
    pub key: KeySource,
    /// Name the key was resolved from ("common_tid" when defaulted).
    pub key_name: String,
}

impl EventSchema {
    /// Index of a payload field by name.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f == name)
    }
}

/// Fixed header shared by every sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleHeader {
    pub time_ns: u64,
    pub pid: u32,
    pub tid: u32,
    pub cpu: u16,
    pub event_type: EventTypeId,
    pub comm: Comm,
}

/// Payload values of one sample, addressable by index or by name.
#[derive(Clone)]
pub struct FieldView {
    values: [u64; MAX_FIELDS],
    len: u8,
    schema: Arc<EventSchema>,
}

impl FieldView {
    pub fn new(schema: Arc<EventSchema>, values: [u64; MAX_FIELDS], len: usize) -> Self {
        Self {
            values,
            len: len.min(MAX_FIELDS) as u8,
            schema,
        }
    }

    pub fn values(&self) -> &[u64] {
        &self.values[..self.len as usize]
    }

    pub fn value(&self, idx: usize) -> Option<u64> {
        self.values().get(idx).copied()
    }

    pub fn get(&self, name: &str) -> Option<u64> {
        self.schema.field_index(name).and_then(|i| self.value(i))
    }

    pub fn schema(&self) -> &EventSchema {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for FieldView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (name, v) in self.schema.fields.iter().zip(self.values()) {
            map.entry(name, v);
        }
        map.finish()
    }
}

/// A decoded trace sample.
#[derive(Debug, Clone)]
pub struct Sample {
    pub header: SampleHeader,
    pub key: u64,
    pub fields: FieldView,
}

impl Sample {
    pub fn event_type(&self) -> EventTypeId {
        self.header.event_type
    }

    pub fn time_ns(&self) -> u64 {
        self.header.time_ns
    }

    pub fn event_name(&self) -> &str {
        &self.fields.schema().name
    }
}

/// One trace line: `comm pid/tid [cpu] secs.usecs: event: field=value ...`.
impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = &self.header;
        write!(
            f,
            "{:>16} {:>6}/{:<6} [{:03}] {}.{:06}: {}:",
            h.comm,
            h.pid,
            h.tid,
            h.cpu,
            h.time_ns / 1_000_000_000,
            (h.time_ns % 1_000_000_000) / 1_000,
            self.event_name(),
        )?;
        for (name, v) in self.fields.schema().fields.iter().zip(self.fields.values()) {
            write!(f, " {name}={v}")?;
        }
        Ok(())
    }
}
