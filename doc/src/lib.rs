//! Self-describing binary document writer/reader.
//!
//! Every record is a 1-byte type tag followed by a NUL-terminated key and a
//! typed payload. A document or array is itself a record whose payload is
//! `i32 total_length | elements... | 0x00`, where `total_length` counts
//! itself (matches the well-known BSON length convention, chosen so the
//! round-trip testable property has an unambiguous reference encoding).
//!
//! [`Writer`] models the container nesting as an explicit stack of staging
//! buffers (spec §9, "Document back-patching"): a container's length
//! prefix is only known once every element inside it has been written, so
//! each open container accumulates its body in its own `Vec<u8>` and only
//! learns its length when it is closed and folded into its parent.

use diskscribe_err::{Error, FsError};
use std::io::{self, Write};

pub const TAG_DOUBLE: u8 = 0x01;
pub const TAG_STRING: u8 = 0x02;
pub const TAG_DOCUMENT: u8 = 0x03;
pub const TAG_ARRAY: u8 = 0x04;
pub const TAG_BINARY: u8 = 0x05;
pub const TAG_BOOL: u8 = 0x08;
pub const TAG_I32: u8 = 0x10;
pub const TAG_I64: u8 = 0x12;
const TAG_END: u8 = 0x00;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    I32(i32),
    I64(i64),
    Str(String),
    Binary(u8, Vec<u8>),
    Array(Vec<Value>),
    Document(Vec<(String, Value)>),
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}
impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}
impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}
impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::I64(v as i64)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

struct Frame {
    /// The key this container will be attached under in its parent, or
    /// `None` for the outermost document, which has no parent to attach to.
    key: Option<String>,
    is_array: bool,
    next_index: u32,
    body: Vec<u8>,
}

impl Frame {
    fn new(key: Option<String>, is_array: bool) -> Self {
        Self {
            key,
            is_array,
            next_index: 0,
            body: Vec::new(),
        }
    }
}

/// Builds a document incrementally, writing into an internal staging
/// buffer so container lengths can be back-patched before anything reaches
/// the sink passed to [`Writer::flush_to`].
pub struct Writer {
    stack: Vec<Frame>,
    root: Option<Vec<u8>>,
}

impl Default for Writer {
    fn default() -> Self {
        Self::new()
    }
}

impl Writer {
    pub fn new() -> Self {
        Self {
            stack: Vec::new(),
            root: None,
        }
    }

    /// Opens the top-level document. Must be the first call made.
    pub fn begin_doc(&mut self) {
        self.stack.push(Frame::new(None, false));
    }

    /// Opens an embedded document under `key` in the currently open
    /// container.
    pub fn begin_doc_at(&mut self, key: &str) {
        self.stack.push(Frame::new(Some(self.resolve_key(key)), false));
    }

    /// Opens an array under `key` in the currently open container.
    pub fn begin_array(&mut self, key: &str) {
        self.stack.push(Frame::new(Some(self.resolve_key(key)), true));
    }

    /// Writes a scalar key/value record into the currently open container.
    ///
    /// Inside an array, `key` is ignored in favor of the stringified
    /// element index, matching standard array-as-document encoding.
    pub fn emit(&mut self, key: &str, value: impl Into<Value>) {
        let key = self.resolve_key(key);
        let value = value.into();
        let frame = self.stack.last_mut().expect("emit with no open container");
        write_element(&mut frame.body, &key, &value);
    }

    /// Returns the key that will actually be used for the next write into
    /// the top container (an auto index inside an array, `key` otherwise).
    fn resolve_key(&mut self, key: &str) -> String {
        let frame = self.stack.last_mut().expect("no open container");
        if frame.is_array {
            let index = frame.next_index;
            frame.next_index += 1;
            index.to_string()
        } else {
            key.to_owned()
        }
    }

    pub fn end_array(&mut self) {
        self.end_container(true);
    }

    pub fn end_doc(&mut self) {
        self.end_container(false);
    }

    fn end_container(&mut self, expect_array: bool) {
        let frame = self.stack.pop().expect("close with no open container");
        assert_eq!(
            frame.is_array, expect_array,
            "container kind mismatch on close"
        );
        let encoded = encode_container(&frame.body);
        match (frame.key, self.stack.last_mut()) {
            (Some(key), Some(parent)) => {
                let tag = if frame.is_array {
                    TAG_ARRAY
                } else {
                    TAG_DOCUMENT
                };
                write_tag_key(&mut parent.body, tag, &key);
                parent.body.extend_from_slice(&encoded);
            }
            _ => {
                self.root = Some(encoded);
            }
        }
    }

    /// Writes the finished root document to `sink`. Must be called after
    /// the matching `end_doc()` for the `begin_doc()` that opened the root.
    pub fn flush_to<W: Write>(&mut self, mut sink: W) -> io::Result<()> {
        let root = self
            .root
            .as_ref()
            .expect("flush_to called before the root document was closed");
        sink.write_all(root)
    }
}

fn write_tag_key(out: &mut Vec<u8>, tag: u8, key: &str) {
    out.push(tag);
    out.extend_from_slice(key.as_bytes());
    out.push(0);
}

fn write_element(out: &mut Vec<u8>, key: &str, value: &Value) {
    match value {
        Value::Bool(b) => {
            write_tag_key(out, TAG_BOOL, key);
            out.push(if *b { 1 } else { 0 });
        }
        Value::I32(v) => {
            write_tag_key(out, TAG_I32, key);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Value::I64(v) => {
            write_tag_key(out, TAG_I64, key);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Value::Str(s) => {
            write_tag_key(out, TAG_STRING, key);
            let bytes = s.as_bytes();
            out.extend_from_slice(&((bytes.len() + 1) as i32).to_le_bytes());
            out.extend_from_slice(bytes);
            out.push(0);
        }
        Value::Binary(subtype, bytes) => {
            write_tag_key(out, TAG_BINARY, key);
            out.extend_from_slice(&(bytes.len() as i32).to_le_bytes());
            out.push(*subtype);
            out.extend_from_slice(bytes);
        }
        Value::Array(items) => {
            write_tag_key(out, TAG_ARRAY, key);
            let mut body = Vec::new();
            for (i, item) in items.iter().enumerate() {
                write_element(&mut body, &i.to_string(), item);
            }
            out.extend_from_slice(&encode_container(&body));
        }
        Value::Document(fields) => {
            write_tag_key(out, TAG_DOCUMENT, key);
            let mut body = Vec::new();
            for (k, v) in fields {
                write_element(&mut body, k, v);
            }
            out.extend_from_slice(&encode_container(&body));
        }
    }
}

fn encode_container(body: &[u8]) -> Vec<u8> {
    let total_len = 4 + body.len() + 1;
    let mut encoded = Vec::with_capacity(total_len);
    encoded.extend_from_slice(&(total_len as i32).to_le_bytes());
    encoded.extend_from_slice(body);
    encoded.push(TAG_END);
    encoded
}

/// Parses a document produced by [`Writer`] back into a [`Value`] tree,
/// verifying that every back-patched length matches the bytes actually
/// consumed.
pub fn parse_document(bytes: &[u8]) -> diskscribe_err::Result<Value> {
    let (value, consumed) = parse_container(bytes, false)?;
    if consumed != bytes.len() {
        return Err(Error::Fs(FsError::Invariant {
            component: diskscribe_err::Component::Doc,
            offset: consumed as u64,
            detail: format!(
                "trailing bytes after document: {} of {}",
                consumed,
                bytes.len()
            ),
        }));
    }
    Ok(value)
}

fn parse_container(bytes: &[u8], is_array: bool) -> diskscribe_err::Result<(Value, usize)> {
    let invariant = |offset: usize, detail: String| {
        Error::Fs(FsError::Invariant {
            component: diskscribe_err::Component::Doc,
            offset: offset as u64,
            detail,
        })
    };
    if bytes.len() < 5 {
        return Err(invariant(0, "container shorter than header".into()));
    }
    let total_len = i32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    if total_len > bytes.len() {
        return Err(invariant(
            0,
            format!("declared length {total_len} exceeds available {}", bytes.len()),
        ));
    }
    let mut cursor = 4usize;
    let mut array_items = Vec::new();
    let mut doc_fields = Vec::new();
    loop {
        if cursor >= total_len {
            return Err(invariant(cursor, "missing terminator".into()));
        }
        let tag = bytes[cursor];
        cursor += 1;
        if tag == TAG_END {
            break;
        }
        let key_start = cursor;
        let key_end = bytes[key_start..total_len]
            .iter()
            .position(|&b| b == 0)
            .map(|p| key_start + p)
            .ok_or_else(|| invariant(key_start, "unterminated key".into()))?;
        let key = String::from_utf8_lossy(&bytes[key_start..key_end]).into_owned();
        cursor = key_end + 1;

        let (value, value_len) = parse_value(tag, &bytes[cursor..total_len], cursor)?;
        cursor += value_len;

        if is_array {
            array_items.push(value);
        } else {
            doc_fields.push((key, value));
        }
    }
    let value = if is_array {
        Value::Array(array_items)
    } else {
        Value::Document(doc_fields)
    };
    Ok((value, total_len))
}

fn parse_value(tag: u8, bytes: &[u8], offset: usize) -> diskscribe_err::Result<(Value, usize)> {
    let invariant = |detail: String| {
        Error::Fs(FsError::Invariant {
            component: diskscribe_err::Component::Doc,
            offset: offset as u64,
            detail,
        })
    };
    match tag {
        TAG_BOOL => {
            let b = *bytes.first().ok_or_else(|| invariant("truncated bool".into()))?;
            Ok((Value::Bool(b != 0), 1))
        }
        TAG_I32 => {
            let buf: [u8; 4] = bytes
                .get(0..4)
                .ok_or_else(|| invariant("truncated i32".into()))?
                .try_into()
                .unwrap();
            Ok((Value::I32(i32::from_le_bytes(buf)), 4))
        }
        TAG_I64 => {
            let buf: [u8; 8] = bytes
                .get(0..8)
                .ok_or_else(|| invariant("truncated i64".into()))?
                .try_into()
                .unwrap();
            Ok((Value::I64(i64::from_le_bytes(buf)), 8))
        }
        TAG_STRING => {
            let len_buf: [u8; 4] = bytes
                .get(0..4)
                .ok_or_else(|| invariant("truncated string length".into()))?
                .try_into()
                .unwrap();
            let len = i32::from_le_bytes(len_buf) as usize;
            let str_bytes = bytes
                .get(4..4 + len - 1)
                .ok_or_else(|| invariant("truncated string body".into()))?;
            let s = String::from_utf8_lossy(str_bytes).into_owned();
            Ok((Value::Str(s), 4 + len))
        }
        TAG_BINARY => {
            let len_buf: [u8; 4] = bytes
                .get(0..4)
                .ok_or_else(|| invariant("truncated binary length".into()))?
                .try_into()
                .unwrap();
            let len = i32::from_le_bytes(len_buf) as usize;
            let subtype = *bytes.get(4).ok_or_else(|| invariant("missing subtype".into()))?;
            let data = bytes
                .get(5..5 + len)
                .ok_or_else(|| invariant("truncated binary body".into()))?
                .to_vec();
            Ok((Value::Binary(subtype, data), 5 + len))
        }
        TAG_DOCUMENT => {
            let (value, len) = parse_container(bytes, false)?;
            Ok((value, len))
        }
        TAG_ARRAY => {
            let (value, len) = parse_container(bytes, true)?;
            Ok((value, len))
        }
        other => Err(invariant(format!("unknown type tag {other:#04x}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_scalars_and_nesting() {
        let mut writer = Writer::new();
        writer.begin_doc();
        writer.emit("magic", 0xEF53i32);
        writer.emit("clean", true);
        writer.begin_array("sectors");
        writer.emit("_", 2048i64);
        writer.emit("_", 2056i64);
        writer.end_array();
        writer.begin_doc_at("fs");
        writer.emit("kind", "ext2");
        writer.end_doc();
        writer.end_doc();

        let mut out = Vec::new();
        writer.flush_to(&mut out).unwrap();

        let value = parse_document(&out).unwrap();
        let Value::Document(fields) = value else {
            panic!("expected document");
        };
        assert_eq!(fields[0], ("magic".to_string(), Value::I32(0xEF53)));
        assert_eq!(fields[1], ("clean".to_string(), Value::Bool(true)));
        let Value::Array(sectors) = &fields[2].1 else {
            panic!("expected array");
        };
        assert_eq!(sectors, &vec![Value::I64(2048), Value::I64(2056)]);
        let Value::Document(fs_fields) = &fields[3].1 else {
            panic!("expected embedded document");
        };
        assert_eq!(
            fs_fields[0],
            ("kind".to_string(), Value::Str("ext2".to_string()))
        );
    }

    #[test]
    fn empty_document_round_trips() {
        let mut writer = Writer::new();
        writer.begin_doc();
        writer.end_doc();
        let mut out = Vec::new();
        writer.flush_to(&mut out).unwrap();
        assert_eq!(out.len(), 5); // 4-byte length + terminator
        assert_eq!(parse_document(&out).unwrap(), Value::Document(vec![]));
    }

    #[test]
    fn rejects_declared_length_past_buffer() {
        let mut bytes = vec![0xffu8, 0xff, 0xff, 0x7f];
        bytes.push(0x00);
        assert!(parse_document(&bytes).is_err());
    }
}
