//! Tuple codec — order-preserving packing of typed tuples.
//!
//! `Tuple::pack` produces bytes such that for any two tuples `a, b`,
//! `pack(a) < pack(b)` (as byte strings) iff `a < b` under the ordering
//! declared here: `Null < Bool < Int < Float < Double < Bytes < String <
//! Uuid < Tuple (nested) < Versionstamp`. Strings sort as their UTF-8 byte
//! sequence; null sorts before everything.
//!
//! Nested tuples and variable-length elements (bytes, strings) are encoded
//! with a `\x00`-escape + terminator scheme (embedded `0x00` becomes
//! `0x00 0xFF`, and the element ends at an unescaped `0x00`). This is what
//! makes a prefix of a tuple pack as a prefix of its bytes: appending more
//! elements after a variable-length one never rewrites bytes already
//! written for it.

pub mod subspace;

pub use subspace::Subspace;

use crate::error::{RecordLayerError, RlResult};
use smallvec::SmallVec;
use uuid::Uuid;

mod codes {
    pub const NULL: u8 = 0x00;
    pub const FALSE: u8 = 0x01;
    pub const TRUE: u8 = 0x02;
    pub const INT_ZERO: u8 = 0x14; // 20
    pub const FLOAT: u8 = 0x30;
    pub const DOUBLE: u8 = 0x31;
    pub const BYTES: u8 = 0x40;
    pub const STRING: u8 = 0x41;
    pub const UUID: u8 = 0x50;
    pub const NESTED_START: u8 = 0x60;
    pub const NESTED_END: u8 = 0x61;
    pub const VERSIONSTAMP: u8 = 0x70;
}

/// A version-stamp tuple element: either a 12-byte value the caller already
/// knows (a `Complete`, e.g. read back from storage), or a placeholder the
/// KV client must patch in at commit time (`Incomplete`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Versionstamp {
    Incomplete,
    Complete([u8; 12]),
}

impl PartialOrd for Versionstamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Versionstamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_sortable_bytes().cmp(&other.as_sortable_bytes())
    }
}

impl Versionstamp {
    fn as_sortable_bytes(&self) -> [u8; 12] {
        match self {
            Versionstamp::Incomplete => [0xff; 12],
            Versionstamp::Complete(bytes) => *bytes,
        }
    }
}

/// One element of a [`Tuple`].
#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    Null,
    Bool(bool),
    Int(i64),
    Float(f32),
    Double(f64),
    Bytes(Vec<u8>),
    String(String),
    Uuid(Uuid),
    Tuple(Tuple),
    Versionstamp(Versionstamp),
}

impl PartialOrd for Element {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(type_rank(self).cmp(&type_rank(other)).then_with(|| match (self, other) {
            (Element::Null, Element::Null) => std::cmp::Ordering::Equal,
            (Element::Bool(a), Element::Bool(b)) => a.cmp(b),
            (Element::Int(a), Element::Int(b)) => a.cmp(b),
            (Element::Float(a), Element::Float(b)) => a.total_cmp(b),
            (Element::Double(a), Element::Double(b)) => a.total_cmp(b),
            (Element::Bytes(a), Element::Bytes(b)) => a.cmp(b),
            (Element::String(a), Element::String(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Element::Uuid(a), Element::Uuid(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Element::Tuple(a), Element::Tuple(b)) => a.elements.iter().partial_cmp(b.elements.iter()).unwrap_or(std::cmp::Ordering::Equal),
            (Element::Versionstamp(a), Element::Versionstamp(b)) => a.cmp(b),
            _ => std::cmp::Ordering::Equal,
        }))
    }
}

fn type_rank(e: &Element) -> u8 {
    match e {
        Element::Null => 0,
        Element::Bool(_) => 1,
        Element::Int(_) => 2,
        Element::Float(_) => 3,
        Element::Double(_) => 4,
        Element::Bytes(_) => 5,
        Element::String(_) => 6,
        Element::Uuid(_) => 7,
        Element::Tuple(_) => 8,
        Element::Versionstamp(_) => 9,
    }
}

/// An ordered sequence of typed [`Element`]s.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tuple {
    pub elements: SmallVec<[Element; 4]>,
}

impl PartialOrd for Tuple {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.elements.iter().partial_cmp(other.elements.iter())
    }
}

/// Result of [`Tuple::pack`]: the bytes, plus the offset of an incomplete
/// version-stamp placeholder if one was present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedTuple {
    pub bytes: Vec<u8>,
    pub incomplete_versionstamp_offset: Option<usize>,
}

impl Tuple {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_elements(elements: impl IntoIterator<Item = Element>) -> Self {
        Self {
            elements: elements.into_iter().collect(),
        }
    }

    pub fn push(mut self, e: Element) -> Self {
        self.elements.push(e);
        self
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Concatenate two tuples (used to form `expression(record) ++ primaryKey`).
    pub fn concat(mut self, other: Tuple) -> Tuple {
        self.elements.extend(other.elements);
        self
    }

    /// Pack this tuple to bytes. If an `Element::Versionstamp(Versionstamp::Incomplete)`
    /// is present, its byte offset within the output is returned alongside the bytes.
    pub fn pack(&self) -> RlResult<PackedTuple> {
        let mut out = Vec::new();
        let mut incomplete_offset = None;
        for el in &self.elements {
            pack_element(el, &mut out, &mut incomplete_offset)?;
        }
        Ok(PackedTuple {
            bytes: out,
            incomplete_versionstamp_offset: incomplete_offset,
        })
    }

    /// Pack assuming no incomplete version-stamp is present (the common case).
    pub fn pack_bytes(&self) -> RlResult<Vec<u8>> {
        let packed = self.pack()?;
        if packed.incomplete_versionstamp_offset.is_some() {
            return Err(RecordLayerError::UnsupportedElement(
                "pack_bytes called on a tuple with an incomplete versionstamp".into(),
            ));
        }
        Ok(packed.bytes)
    }

    /// Unpack bytes produced by [`Tuple::pack`] (or a prefix-aligned slice of them).
    pub fn unpack(bytes: &[u8]) -> RlResult<Tuple> {
        let mut cursor = 0usize;
        let elements = unpack_elements(bytes, &mut cursor)?;
        if cursor != bytes.len() {
            return Err(RecordLayerError::MalformedTuple(format!(
                "trailing bytes after tuple: {} of {} consumed",
                cursor,
                bytes.len()
            )));
        }
        Ok(Tuple::from_elements(elements))
    }
}

fn pack_element(
    el: &Element,
    out: &mut Vec<u8>,
    incomplete_offset: &mut Option<usize>,
) -> RlResult<()> {
    match el {
        Element::Null => out.push(codes::NULL),
        Element::Bool(false) => out.push(codes::FALSE),
        Element::Bool(true) => out.push(codes::TRUE),
        Element::Int(v) => pack_int(*v, out),
        Element::Float(v) => {
            out.push(codes::FLOAT);
            out.extend_from_slice(&float_sortable_bits(*v).to_be_bytes());
        }
        Element::Double(v) => {
            out.push(codes::DOUBLE);
            out.extend_from_slice(&double_sortable_bits(*v).to_be_bytes());
        }
        Element::Bytes(b) => {
            out.push(codes::BYTES);
            pack_escaped(b, out);
        }
        Element::String(s) => {
            out.push(codes::STRING);
            pack_escaped(s.as_bytes(), out);
        }
        Element::Uuid(u) => {
            out.push(codes::UUID);
            out.extend_from_slice(u.as_bytes());
        }
        Element::Tuple(t) => {
            out.push(codes::NESTED_START);
            for child in &t.elements {
                pack_element(child, out, incomplete_offset)?;
            }
            out.push(codes::NESTED_END);
        }
        Element::Versionstamp(vs) => {
            out.push(codes::VERSIONSTAMP);
            match vs {
                Versionstamp::Complete(bytes) => out.extend_from_slice(bytes),
                Versionstamp::Incomplete => {
                    if incomplete_offset.is_some() {
                        return Err(RecordLayerError::UnsupportedElement(
                            "at most one incomplete versionstamp is supported per tuple".into(),
                        ));
                    }
                    *incomplete_offset = Some(out.len());
                    out.extend_from_slice(&[0u8; 12]);
                }
            }
        }
    }
    Ok(())
}

/// Escape `0x00` as `0x00 0xFF` and terminate with a bare `0x00`.
fn pack_escaped(bytes: &[u8], out: &mut Vec<u8>) {
    for &b in bytes {
        if b == 0x00 {
            out.push(0x00);
            out.push(0xff);
        } else {
            out.push(b);
        }
    }
    out.push(0x00);
}

fn unescape(bytes: &[u8], cursor: &mut usize) -> RlResult<Vec<u8>> {
    let mut result = Vec::new();
    loop {
        if *cursor >= bytes.len() {
            return Err(RecordLayerError::MalformedTuple(
                "unterminated variable-length element".into(),
            ));
        }
        let b = bytes[*cursor];
        if b == 0x00 {
            if *cursor + 1 < bytes.len() && bytes[*cursor + 1] == 0xff {
                result.push(0x00);
                *cursor += 2;
            } else {
                *cursor += 1;
                return Ok(result);
            }
        } else {
            result.push(b);
            *cursor += 1;
        }
    }
}

fn min_be_bytes(mut v: u64) -> SmallVec<[u8; 8]> {
    let mut bytes = SmallVec::<[u8; 8]>::new();
    if v == 0 {
        return bytes;
    }
    while v > 0 {
        bytes.push((v & 0xff) as u8);
        v >>= 8;
    }
    bytes.reverse();
    bytes
}

fn pack_int(v: i64, out: &mut Vec<u8>) {
    if v == 0 {
        out.push(codes::INT_ZERO);
        return;
    }
    if v > 0 {
        let bytes = min_be_bytes(v as u64);
        out.push(codes::INT_ZERO + bytes.len() as u8);
        out.extend_from_slice(&bytes);
    } else {
        // magnitude as u64 without overflow even for i64::MIN
        let magnitude = (v as i128).unsigned_abs() as u64;
        let n_bytes = min_be_bytes(magnitude).len().max(1);
        let max_for_n = if n_bytes == 8 {
            u64::MAX
        } else {
            (1u64 << (8 * n_bytes)) - 1
        };
        let offset = max_for_n - (magnitude - 1);
        let mut bytes = offset.to_be_bytes().to_vec();
        bytes.drain(0..(8 - n_bytes));
        out.push(codes::INT_ZERO - n_bytes as u8);
        out.extend_from_slice(&bytes);
    }
}

fn unpack_int(code: u8, bytes: &[u8], cursor: &mut usize) -> RlResult<i64> {
    if code == codes::INT_ZERO {
        return Ok(0);
    }
    if code > codes::INT_ZERO {
        let n = (code - codes::INT_ZERO) as usize;
        let slice = read_n(bytes, cursor, n)?;
        let mut buf = [0u8; 8];
        buf[8 - n..].copy_from_slice(slice);
        Ok(u64::from_be_bytes(buf) as i64)
    } else {
        let n = (codes::INT_ZERO - code) as usize;
        let slice = read_n(bytes, cursor, n)?;
        let mut buf = [0u8; 8];
        buf[8 - n..].copy_from_slice(slice);
        let offset = u64::from_be_bytes(buf);
        let max_for_n = if n == 8 { u64::MAX } else { (1u64 << (8 * n)) - 1 };
        let magnitude = max_for_n - offset + 1;
        Ok(-(magnitude as i128) as i64)
    }
}

fn read_n<'a>(bytes: &'a [u8], cursor: &mut usize, n: usize) -> RlResult<&'a [u8]> {
    if *cursor + n > bytes.len() {
        return Err(RecordLayerError::MalformedTuple(format!(
            "expected {} more bytes at offset {}, found {}",
            n,
            cursor,
            bytes.len() - *cursor
        )));
    }
    let slice = &bytes[*cursor..*cursor + n];
    *cursor += n;
    Ok(slice)
}

fn float_sortable_bits(v: f32) -> u32 {
    let bits = v.to_bits();
    if bits & (1 << 31) != 0 {
        !bits
    } else {
        bits | (1 << 31)
    }
}

fn float_from_sortable_bits(bits: u32) -> f32 {
    let bits = if bits & (1 << 31) != 0 {
        bits & !(1 << 31)
    } else {
        !bits
    };
    f32::from_bits(bits)
}

fn double_sortable_bits(v: f64) -> u64 {
    let bits = v.to_bits();
    if bits & (1 << 63) != 0 {
        !bits
    } else {
        bits | (1 << 63)
    }
}

fn double_from_sortable_bits(bits: u64) -> f64 {
    let bits = if bits & (1 << 63) != 0 {
        bits & !(1 << 63)
    } else {
        !bits
    };
    f64::from_bits(bits)
}

fn unpack_elements(bytes: &[u8], cursor: &mut usize) -> RlResult<Vec<Element>> {
    let mut elements = Vec::new();
    while *cursor < bytes.len() {
        let code = bytes[*cursor];
        if code == codes::NESTED_END {
            break;
        }
        *cursor += 1;
        let element = match code {
            codes::NULL => Element::Null,
            codes::FALSE => Element::Bool(false),
            codes::TRUE => Element::Bool(true),
            codes::FLOAT => {
                let slice = read_n(bytes, cursor, 4)?;
                let mut buf = [0u8; 4];
                buf.copy_from_slice(slice);
                Element::Float(float_from_sortable_bits(u32::from_be_bytes(buf)))
            }
            codes::DOUBLE => {
                let slice = read_n(bytes, cursor, 8)?;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(slice);
                Element::Double(double_from_sortable_bits(u64::from_be_bytes(buf)))
            }
            codes::BYTES => Element::Bytes(unescape(bytes, cursor)?),
            codes::STRING => {
                let raw = unescape(bytes, cursor)?;
                Element::String(String::from_utf8(raw).map_err(|e| {
                    RecordLayerError::MalformedTuple(format!("invalid utf8 string: {e}"))
                })?)
            }
            codes::UUID => {
                let slice = read_n(bytes, cursor, 16)?;
                let mut buf = [0u8; 16];
                buf.copy_from_slice(slice);
                Element::Uuid(Uuid::from_bytes(buf))
            }
            codes::NESTED_START => {
                let children = unpack_elements(bytes, cursor)?;
                if *cursor >= bytes.len() || bytes[*cursor] != codes::NESTED_END {
                    return Err(RecordLayerError::MalformedTuple(
                        "unterminated nested tuple".into(),
                    ));
                }
                *cursor += 1;
                Element::Tuple(Tuple::from_elements(children))
            }
            codes::VERSIONSTAMP => {
                let slice = read_n(bytes, cursor, 12)?;
                let mut buf = [0u8; 12];
                buf.copy_from_slice(slice);
                Element::Versionstamp(Versionstamp::Complete(buf))
            }
            other if other >= codes::INT_ZERO.saturating_sub(8) && other <= codes::INT_ZERO + 8 => {
                Element::Int(unpack_int(other, bytes, cursor)?)
            }
            other => {
                return Err(RecordLayerError::MalformedTuple(format!(
                    "unknown tuple type code: 0x{other:02x}"
                )));
            }
        };
        elements.push(element);
    }
    Ok(elements)
}
