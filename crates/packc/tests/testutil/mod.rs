//! Shared helpers for the integration tests: a schema-from-JSON shortcut,
//! an LSB-first bit buffer, and a reference encoder/decoder that walks the
//! expanded item list directly. Roundtripping through it validates the
//! layout semantics the generated procedures rely on.

#![allow(dead_code)]

use serde_json::Value;

use packc::config::GenerationConfig;
use packc::items::{Condition, PathSegment, SerializationItem};
use packc::options::ShapeKind;
use packc::schema::SchemaDoc;

pub fn schema_from_json(v: Value) -> SchemaDoc {
    let mut v = v;
    if v.get("schema_version").is_none() {
        v["schema_version"] = Value::from(packc_contracts::PACKC_SCHEMA_VERSION);
    }
    SchemaDoc::from_json_value(&v).expect("test schema must be valid")
}

/// LSB-first bit buffer matching the generated bitstream primitives.
pub struct BitBuf {
    bytes: Vec<u8>,
}

impl BitBuf {
    pub fn new(byte_len: usize) -> Self {
        BitBuf {
            bytes: vec![0; byte_len],
        }
    }

    pub fn write_bits(&mut self, offset: u64, bits: u32, value: u64) {
        for i in 0..u64::from(bits) {
            let bit = (value >> i) & 1;
            let pos = offset + i;
            let byte = (pos / 8) as usize;
            let shift = (pos % 8) as u32;
            assert!(byte < self.bytes.len(), "write past buffer end");
            if bit == 1 {
                self.bytes[byte] |= 1 << shift;
            } else {
                self.bytes[byte] &= !(1 << shift);
            }
        }
    }

    pub fn read_bits(&self, offset: u64, bits: u32) -> u64 {
        let mut out = 0u64;
        for i in 0..u64::from(bits) {
            let pos = offset + i;
            let byte = (pos / 8) as usize;
            let shift = (pos % 8) as u32;
            assert!(byte < self.bytes.len(), "read past buffer end");
            if self.bytes[byte] >> shift & 1 == 1 {
                out |= 1 << i;
            }
        }
        out
    }
}

fn lookup<'a>(value: &'a Value, segments: &[PathSegment]) -> Option<&'a Value> {
    let mut cur = value;
    for seg in segments {
        cur = match seg {
            PathSegment::Member { name, .. } => cur.get(name)?,
            PathSegment::Slice { start, .. } => cur.get(*start as usize)?,
        };
    }
    Some(cur)
}

fn lookup_i64(value: &Value, segments: &[PathSegment]) -> i64 {
    lookup(value, segments)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integral value at {:?}", path_of(segments)))
}

fn path_of(segments: &[PathSegment]) -> String {
    let item = SerializationItem {
        segments: segments.to_vec(),
        conditions: Vec::new(),
        omitted: false,
        defaulted: false,
    };
    item.path_string()
}

fn set_path(value: &mut Value, segments: &[PathSegment], leaf: Value) {
    let mut cur = value;
    for seg in segments {
        match seg {
            PathSegment::Member { name, .. } => {
                if !cur.is_object() {
                    *cur = Value::Object(Default::default());
                }
                cur = cur
                    .as_object_mut()
                    .expect("object")
                    .entry(name.clone())
                    .or_insert(Value::Null);
            }
            PathSegment::Slice { start, .. } => {
                if !cur.is_array() {
                    *cur = Value::Array(Vec::new());
                }
                let arr = cur.as_array_mut().expect("array");
                while arr.len() <= *start as usize {
                    arr.push(Value::Null);
                }
                cur = &mut arr[*start as usize];
            }
        }
    }
    *cur = leaf;
}

fn conditions_hold(value: &Value, conditions: &[Condition]) -> bool {
    conditions.iter().all(|c| lookup_i64(value, &c.lhs) == c.rhs)
}

/// Encode `value` over one sector's expanded items and layout entries.
pub fn encode_items(
    config: &GenerationConfig,
    items: &[SerializationItem],
    entries: &[(u64, u64)],
    value: &Value,
    buf: &mut BitBuf,
) {
    for (item, (offset, _size)) in items.iter().zip(entries) {
        if item.omitted || !conditions_hold(value, &item.conditions) {
            continue;
        }
        let opts = item.leaf_options().expect("leaf options");
        if opts.pad_bits.is_some() {
            continue;
        }
        let shape = match &opts.shape {
            ShapeKind::Transformed { options, .. } => &options.shape,
            other => other,
        };
        match shape {
            ShapeKind::Boolean => {
                let v = lookup(value, &item.segments)
                    .and_then(Value::as_bool)
                    .expect("bool value");
                buf.write_bits(*offset, 1, u64::from(v));
            }
            ShapeKind::Integral {
                bits, min, signed, ..
            } => {
                let v = lookup_i64(value, &item.segments);
                let raw = if *signed {
                    (v as u64) & ((1u64 << bits) - 1)
                } else {
                    (v - min) as u64
                };
                buf.write_bits(*offset, *bits, raw);
            }
            ShapeKind::Pointer => {
                let v = lookup_i64(value, &item.segments);
                buf.write_bits(*offset, config.pointer_bits, v as u64);
            }
            ShapeKind::Buffer { bytes } => {
                let arr = lookup(value, &item.segments)
                    .and_then(Value::as_array)
                    .expect("buffer value");
                for i in 0..*bytes {
                    let b = arr
                        .get(i as usize)
                        .and_then(Value::as_u64)
                        .unwrap_or(0);
                    buf.write_bits(offset + u64::from(i) * 8, 8, b);
                }
            }
            ShapeKind::Text { len, .. } => {
                let s = lookup(value, &item.segments)
                    .and_then(Value::as_str)
                    .expect("text value");
                let bytes = s.as_bytes();
                for i in 0..*len {
                    let b = bytes.get(i as usize).copied().unwrap_or(0);
                    buf.write_bits(offset + u64::from(i) * 8, 8, u64::from(b));
                }
            }
            other => panic!("unexpanded shape {other:?} in item list"),
        }
    }
}

/// Decode one sector's expanded items into `out`. Items run in order, so
/// union tags are already decoded when their arms consult them.
pub fn decode_items(
    config: &GenerationConfig,
    items: &[SerializationItem],
    entries: &[(u64, u64)],
    buf: &BitBuf,
    out: &mut Value,
) {
    for (item, (offset, _size)) in items.iter().zip(entries) {
        if !conditions_hold(out, &item.conditions) {
            continue;
        }
        let opts = item.leaf_options().expect("leaf options");
        if item.omitted {
            if let Some(default) = opts.default_value {
                set_path(out, &item.segments, Value::from(default));
            }
            continue;
        }
        if opts.pad_bits.is_some() {
            continue;
        }
        let shape = match &opts.shape {
            ShapeKind::Transformed { options, .. } => &options.shape,
            other => other,
        };
        match shape {
            ShapeKind::Boolean => {
                let raw = buf.read_bits(*offset, 1);
                set_path(out, &item.segments, Value::from(raw == 1));
            }
            ShapeKind::Integral {
                bits, min, signed, ..
            } => {
                let raw = buf.read_bits(*offset, *bits);
                let v = if *signed {
                    let shift = 64 - bits;
                    ((raw << shift) as i64) >> shift
                } else {
                    raw as i64 + min
                };
                set_path(out, &item.segments, Value::from(v));
            }
            ShapeKind::Pointer => {
                let raw = buf.read_bits(*offset, config.pointer_bits);
                set_path(out, &item.segments, Value::from(raw));
            }
            ShapeKind::Buffer { bytes } => {
                let mut arr = Vec::with_capacity(*bytes as usize);
                for i in 0..*bytes {
                    arr.push(Value::from(buf.read_bits(offset + u64::from(i) * 8, 8)));
                }
                set_path(out, &item.segments, Value::Array(arr));
            }
            ShapeKind::Text { len, .. } => {
                let mut bytes = Vec::new();
                for i in 0..*len {
                    let b = buf.read_bits(offset + u64::from(i) * 8, 8) as u8;
                    if b == 0 {
                        break;
                    }
                    bytes.push(b);
                }
                let s = String::from_utf8_lossy(&bytes).into_owned();
                set_path(out, &item.segments, Value::from(s));
            }
            other => panic!("unexpanded shape {other:?} in item list"),
        }
    }
}
