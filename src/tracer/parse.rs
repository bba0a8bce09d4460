//! Sample decoding for framed trace records.
//!
//! A record is a fixed 40-byte little-endian header followed by
//! `nr_fields` u64 payload values. The [`SchemaDecoder`] validates the
//! record against the configured [`EventSchema`] for its event type and
//! resolves the grouping key. Decoding never allocates.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use super::event::{
    Comm, EventDef, EventSchema, EventTypeId, FieldView, KeySource, Sample, SampleHeader,
    COMM_LEN, MAX_FIELDS,
};

/// Record header size in bytes.
pub const HEADER_SIZE: usize = 40;

/// Key name used when neither the event nor the config names one.
pub const DEFAULT_KEY: &str = "common_tid";

/// Errors that can occur while decoding a single record.
///
/// These are steady-state errors: the sample is dropped and counted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record too short: {size} bytes")]
    Truncated { size: usize },

    #[error("unknown event type: {raw}")]
    UnknownEventType { raw: u16 },

    #[error("event type {raw}: expected {expected} fields, record carries {got}")]
    FieldCount {
        raw: u16,
        expected: usize,
        got: usize,
    },

    #[error("event type {raw}: payload truncated at {size} bytes")]
    PayloadTruncated { raw: u16, size: usize },
}

impl DecodeError {
    /// Short label suitable for a metric dimension.
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Truncated { .. } => "truncated",
            Self::UnknownEventType { .. } => "unknown_event_type",
            Self::FieldCount { .. } => "field_count",
            Self::PayloadTruncated { .. } => "payload_truncated",
        }
    }
}

/// Errors detected while building schemas. Always fatal at setup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("key field {field:?} is not present on event {event:?}")]
    KeyFieldMismatch { event: String, field: String },

    #[error("event id {id} declared more than once")]
    DuplicateEventId { id: u16 },

    #[error("event name {name:?} declared more than once")]
    DuplicateEventName { name: String },

    #[error("event {event:?} declares {count} fields, at most {max} are supported", max = MAX_FIELDS)]
    TooManyFields { event: String, count: usize },

    #[error("unknown event {name:?}")]
    UnknownEvent { name: String },

    #[error("field {field:?} is not present on event {event:?}")]
    UnknownField { event: String, field: String },
}

/// Turns raw record bytes into a [`Sample`].
pub trait Decoder {
    fn decode(&self, raw: &[u8]) -> Result<Sample, DecodeError>;
}

/// Decoder driven by the configured event schemas.
#[derive(Debug, Clone, Default)]
pub struct SchemaDecoder {
    by_id: HashMap<EventTypeId, Arc<EventSchema>>,
    by_name: HashMap<String, Arc<EventSchema>>,
}

impl SchemaDecoder {
    /// Build a decoder from event definitions. `default_key` applies to
    /// every event that does not name its own key.
    pub fn new(events: &[EventDef], default_key: Option<&str>) -> Result<Self, SchemaError> {
        let mut decoder = Self::default();

        for def in events {
            if def.fields.len() > MAX_FIELDS {
                return Err(SchemaError::TooManyFields {
                    event: def.name.clone(),
                    count: def.fields.len(),
                });
            }

            let key_name = def
                .key
                .as_deref()
                .or(default_key)
                .unwrap_or(DEFAULT_KEY)
                .to_string();
            let key = resolve_key(&def.fields, &key_name).ok_or_else(|| {
                SchemaError::KeyFieldMismatch {
                    event: def.name.clone(),
                    field: key_name.clone(),
                }
            })?;

            let schema = Arc::new(EventSchema {
                id: EventTypeId(def.id),
                name: def.name.clone(),
                fields: def.fields.clone(),
                key,
                key_name,
            });

            if decoder.by_id.contains_key(&schema.id) {
                return Err(SchemaError::DuplicateEventId { id: def.id });
            }
            if decoder.by_name.contains_key(&schema.name) {
                return Err(SchemaError::DuplicateEventName {
                    name: def.name.clone(),
                });
            }

            decoder.by_id.insert(schema.id, Arc::clone(&schema));
            decoder.by_name.insert(schema.name.clone(), schema);
        }

        Ok(decoder)
    }

    pub fn schema(&self, id: EventTypeId) -> Option<&Arc<EventSchema>> {
        self.by_id.get(&id)
    }

    /// Look up an event schema by name.
    pub fn lookup(&self, name: &str) -> Result<&Arc<EventSchema>, SchemaError> {
        self.by_name.get(name).ok_or_else(|| SchemaError::UnknownEvent {
            name: name.to_string(),
        })
    }

    /// All schemas ordered by event id.
    pub fn schemas(&self) -> Vec<&Arc<EventSchema>> {
        let mut all: Vec<_> = self.by_id.values().collect();
        all.sort_by_key(|s| s.id);
        all
    }

    /// Resolve a payload field index on a named event.
    pub fn field_index(&self, event: &str, field: &str) -> Result<usize, SchemaError> {
        self.lookup(event)?
            .field_index(field)
            .ok_or_else(|| SchemaError::UnknownField {
                event: event.to_string(),
                field: field.to_string(),
            })
    }

    /// Best-effort check that two correlated events extract the same key.
    pub fn check_pair_keys(
        &self,
        first: &str,
        second: &str,
    ) -> Result<(EventTypeId, EventTypeId), SchemaError> {
        let a = self.lookup(first)?;
        let b = self.lookup(second)?;
        if a.key_name != b.key_name {
            return Err(SchemaError::KeyFieldMismatch {
                event: b.name.clone(),
                field: a.key_name.clone(),
            });
        }
        Ok((a.id, b.id))
    }
}

impl Decoder for SchemaDecoder {
    fn decode(&self, data: &[u8]) -> Result<Sample, DecodeError> {
        if data.len() < HEADER_SIZE {
            return Err(DecodeError::Truncated { size: data.len() });
        }

        let raw_type = read_u16_le(data, 16);
        let schema = self
            .by_id
            .get(&EventTypeId(raw_type))
            .ok_or(DecodeError::UnknownEventType { raw: raw_type })?;

        let nr_fields = data[20] as usize;
        if nr_fields != schema.fields.len() {
            return Err(DecodeError::FieldCount {
                raw: raw_type,
                expected: schema.fields.len(),
                got: nr_fields,
            });
        }

        let needed = HEADER_SIZE + nr_fields * 8;
        if data.len() < needed {
            return Err(DecodeError::PayloadTruncated {
                raw: raw_type,
                size: data.len(),
            });
        }

        let mut values = [0u64; MAX_FIELDS];
        for (i, slot) in values.iter_mut().take(nr_fields).enumerate() {
            *slot = read_u64_le(data, HEADER_SIZE + i * 8);
        }

        let comm_len = (data[21] as usize).min(COMM_LEN);
        let header = SampleHeader {
            time_ns: read_u64_le(data, 0),
            pid: read_u32_le(data, 8),
            tid: read_u32_le(data, 12),
            event_type: EventTypeId(raw_type),
            cpu: read_u16_le(data, 18),
            comm: Comm::new(&data[24..24 + comm_len]),
        };

        let key = match schema.key {
            KeySource::Pid => u64::from(header.pid),
            KeySource::Tid => u64::from(header.tid),
            KeySource::Cpu => u64::from(header.cpu),
            KeySource::Field(i) => values[i],
        };

        Ok(Sample {
            header,
            key,
            fields: FieldView::new(Arc::clone(schema), values, nr_fields),
        })
    }
}

/// Payload fields shadow the header pseudo-fields of the same name.
fn resolve_key(fields: &[String], name: &str) -> Option<KeySource> {
    if let Some(i) = fields.iter().position(|f| f == name) {
        return Some(KeySource::Field(i));
    }
    match name {
        "common_pid" | "pid" => Some(KeySource::Pid),
        "common_tid" | "tid" => Some(KeySource::Tid),
        "common_cpu" | "cpu" => Some(KeySource::Cpu),
        _ => None,
    }
}

/// Append one record in wire format to `out`.
#[allow(clippy::too_many_arguments)]
pub fn encode_record(
    out: &mut Vec<u8>,
    time_ns: u64,
    pid: u32,
    tid: u32,
    cpu: u16,
    event_type: u16,
    comm: &[u8],
    values: &[u64],
) {
    let comm_len = comm.len().min(COMM_LEN);
    out.extend_from_slice(&time_ns.to_le_bytes());
    out.extend_from_slice(&pid.to_le_bytes());
    out.extend_from_slice(&tid.to_le_bytes());
    out.extend_from_slice(&event_type.to_le_bytes());
    out.extend_from_slice(&cpu.to_le_bytes());
    out.push(values.len() as u8);
    out.push(comm_len as u8);
    out.extend_from_slice(&[0u8; 2]);
    let mut raw_comm = [0u8; COMM_LEN];
    raw_comm[..comm_len].copy_from_slice(&comm[..comm_len]);
    out.extend_from_slice(&raw_comm);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
}

// ---------------------------------------------------------------------------
// Byte-reading helpers. Callers check lengths before reading fixed offsets.
// ---------------------------------------------------------------------------

#[inline(always)]
fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(read_fixed::<2>(data, offset))
}

#[inline(always)]
fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(read_fixed::<4>(data, offset))
}

#[inline(always)]
fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(read_fixed::<8>(data, offset))
}

#[inline(always)]
fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    let mut buf = [0u8; N];
    buf.copy_from_slice(&data[offset..offset + N]);
    buf
}
