//! A subset of the FoundationDB tuple layer.
//!
//! Every key the runtime persists is produced by packing a sequence of
//! [`TupleElement`]s under a [`Subspace`](crate::Subspace) prefix. The
//! encoding is order-preserving: comparing two packed tuples byte-wise gives
//! the same result as comparing them element-wise, which is what makes range
//! scans over records and index entries meaningful.
//!
//! Only the element kinds the runtime needs are implemented: null, byte
//! strings, unicode strings, signed integers, booleans, UUIDs and
//! versionstamps. The type codes and escaping rules follow the tuple layer
//! specification so keys written here interoperate with any other tuple-layer
//! implementation bound to the same cluster.

use byteorder::{ByteOrder, LittleEndian, BE};
use uuid::Uuid;

use crate::{Error, Result};

const NULL_CODE: u8 = 0x00;
const BYTES_CODE: u8 = 0x01;
const STRING_CODE: u8 = 0x02;
const INT_ZERO_CODE: u8 = 0x14;
const FALSE_CODE: u8 = 0x26;
const TRUE_CODE: u8 = 0x27;
const UUID_CODE: u8 = 0x30;
const VERSIONSTAMP_CODE: u8 = 0x33;

/// A 96-bit versionstamp: an 80-bit transaction version assigned by the
/// cluster at commit time plus a 16-bit user version.
///
/// An *incomplete* stamp carries `0xFF` in all transaction-version bytes and
/// is filled in by the `SetVersionstampedKey` /` SetVersionstampedValue`
/// atomic operations at commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Versionstamp {
    bytes: [u8; 12],
}

impl Versionstamp {
    /// Creates an incomplete stamp to be filled in at commit time.
    pub fn incomplete(user_version: u16) -> Self {
        let mut bytes = [0xFF; 12];
        BE::write_u16(&mut bytes[10..], user_version);
        Self { bytes }
    }

    /// Creates a complete stamp from an 80-bit transaction version.
    pub fn complete(transaction_version: [u8; 10], user_version: u16) -> Self {
        let mut bytes = [0; 12];
        bytes[..10].copy_from_slice(&transaction_version);
        BE::write_u16(&mut bytes[10..], user_version);
        Self { bytes }
    }

    /// Restores a stamp from its 12-byte wire form.
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self { bytes }
    }

    /// Returns `true` if the transaction version has not been assigned yet.
    pub fn is_incomplete(&self) -> bool {
        self.bytes[..10] == [0xFF; 10]
    }

    /// The full 12-byte wire form.
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.bytes
    }

    /// The 80-bit transaction version part.
    pub fn transaction_version(&self) -> &[u8] {
        &self.bytes[..10]
    }
}

/// One element of a [`Tuple`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum TupleElement {
    /// Absent value; sorts before everything else.
    Null,
    /// Raw byte string.
    Bytes(Vec<u8>),
    /// Unicode string.
    String(String),
    /// Signed integer.
    Int(i64),
    /// Boolean.
    Bool(bool),
    /// UUID (16 bytes, compared byte-wise).
    Uuid(Uuid),
    /// Commit versionstamp.
    Versionstamp(Versionstamp),
}

impl From<i64> for TupleElement {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for TupleElement {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for TupleElement {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<u8>> for TupleElement {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<&[u8]> for TupleElement {
    fn from(value: &[u8]) -> Self {
        Self::Bytes(value.to_vec())
    }
}

impl From<bool> for TupleElement {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Uuid> for TupleElement {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

impl From<Versionstamp> for TupleElement {
    fn from(value: Versionstamp) -> Self {
        Self::Versionstamp(value)
    }
}

/// An ordered sequence of [`TupleElement`]s with an order-preserving binary
/// encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Tuple {
    elements: Vec<TupleElement>,
}

impl Tuple {
    /// Creates an empty tuple.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a list of elements.
    pub fn from_elements(elements: Vec<TupleElement>) -> Self {
        Self { elements }
    }

    /// Creates a single-element tuple.
    pub fn from_element(element: impl Into<TupleElement>) -> Self {
        Self {
            elements: vec![element.into()],
        }
    }

    /// Appends an element.
    pub fn push(&mut self, element: impl Into<TupleElement>) {
        self.elements.push(element.into());
    }

    /// The elements in order.
    pub fn elements(&self) -> &[TupleElement] {
        &self.elements
    }

    /// Consumes the tuple, returning its elements.
    pub fn into_elements(self) -> Vec<TupleElement> {
        self.elements
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// `true` when the tuple has no elements.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Serializes the tuple into its order-preserving binary form.
    pub fn pack(&self) -> Vec<u8> {
        pack_slice(&self.elements)
    }

    /// Serializes the tuple, requiring exactly one incomplete
    /// [`Versionstamp`] element, and appends the 4-byte little-endian offset
    /// of the stamp that the `SetVersionstampedKey` atomic operation expects.
    pub fn pack_with_versionstamp(&self, prefix: &[u8]) -> Result<Vec<u8>> {
        let mut out = prefix.to_vec();
        let mut stamp_offset = None;
        for element in &self.elements {
            if let TupleElement::Versionstamp(stamp) = element {
                if stamp.is_incomplete() {
                    if stamp_offset.is_some() {
                        return Err(Error::InvalidArgument(
                            "tuple contains more than one incomplete versionstamp".into(),
                        ));
                    }
                    // Offset of the stamp bytes, past the type code.
                    stamp_offset = Some(out.len() + 1);
                }
            }
            pack_element_into(element, &mut out);
        }
        let offset = stamp_offset.ok_or_else(|| {
            Error::InvalidArgument("tuple contains no incomplete versionstamp".into())
        })?;
        let offset = u32::try_from(offset)
            .map_err(|_| Error::InvalidArgument("versionstamp offset exceeds u32".into()))?;
        let mut suffix = [0; 4];
        LittleEndian::write_u32(&mut suffix, offset);
        out.extend_from_slice(&suffix);
        Ok(out)
    }

    /// Deserializes a packed tuple.
    ///
    /// Fails with [`Error::Internal`] on malformed input: packed tuples only
    /// ever come from keys this runtime (or a compatible tuple layer) wrote.
    pub fn unpack(bytes: &[u8]) -> Result<Self> {
        let mut elements = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let (element, next) = unpack_element(bytes, pos)?;
            elements.push(element);
            pos = next;
        }
        Ok(Self { elements })
    }
}

impl<E: Into<TupleElement>> FromIterator<E> for Tuple {
    fn from_iter<I: IntoIterator<Item = E>>(iter: I) -> Self {
        Self {
            elements: iter.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<Vec<TupleElement>> for Tuple {
    fn from(elements: Vec<TupleElement>) -> Self {
        Self { elements }
    }
}

/// Packs a slice of elements without constructing a [`Tuple`].
pub fn pack_slice(elements: &[TupleElement]) -> Vec<u8> {
    let mut out = Vec::with_capacity(elements.len() * 8);
    for element in elements {
        pack_element_into(element, &mut out);
    }
    out
}

fn pack_element_into(element: &TupleElement, out: &mut Vec<u8>) {
    match element {
        TupleElement::Null => out.push(NULL_CODE),
        TupleElement::Bytes(bytes) => {
            out.push(BYTES_CODE);
            escape_into(bytes, out);
        }
        TupleElement::String(s) => {
            out.push(STRING_CODE);
            escape_into(s.as_bytes(), out);
        }
        TupleElement::Int(value) => pack_int_into(*value, out),
        TupleElement::Bool(false) => out.push(FALSE_CODE),
        TupleElement::Bool(true) => out.push(TRUE_CODE),
        TupleElement::Uuid(uuid) => {
            out.push(UUID_CODE);
            out.extend_from_slice(uuid.as_bytes());
        }
        TupleElement::Versionstamp(stamp) => {
            out.push(VERSIONSTAMP_CODE);
            out.extend_from_slice(stamp.as_bytes());
        }
    }
}

// NUL bytes inside byte strings are escaped as 00 FF; the unescaped NUL
// terminates the element.
fn escape_into(data: &[u8], out: &mut Vec<u8>) {
    for &byte in data {
        out.push(byte);
        if byte == 0x00 {
            out.push(0xFF);
        }
    }
    out.push(0x00);
}

fn pack_int_into(value: i64, out: &mut Vec<u8>) {
    if value == 0 {
        out.push(INT_ZERO_CODE);
    } else if value > 0 {
        let magnitude = value as u64;
        let n = significant_bytes(magnitude);
        out.push(INT_ZERO_CODE + n as u8);
        let mut scratch = [0; 8];
        BE::write_u64(&mut scratch, magnitude);
        out.extend_from_slice(&scratch[8 - n..]);
    } else {
        let magnitude = value.unsigned_abs();
        let n = significant_bytes(magnitude);
        // Negative integers store `value + 2^(8n) - 1` so that byte-wise
        // comparison preserves numeric order.
        let offset = (i128::from(value) + ((1_i128 << (8 * n)) - 1)) as u64;
        out.push(INT_ZERO_CODE - n as u8);
        let mut scratch = [0; 8];
        BE::write_u64(&mut scratch, offset);
        out.extend_from_slice(&scratch[8 - n..]);
    }
}

fn significant_bytes(magnitude: u64) -> usize {
    ((64 - magnitude.leading_zeros() as usize) + 7) / 8
}

fn unpack_element(bytes: &[u8], pos: usize) -> Result<(TupleElement, usize)> {
    let malformed = |what: &str| Error::Internal(format!("malformed tuple: {what} at {pos}"));
    let code = bytes[pos];
    match code {
        NULL_CODE => Ok((TupleElement::Null, pos + 1)),
        BYTES_CODE => {
            let (data, next) = unescape(bytes, pos + 1)?;
            Ok((TupleElement::Bytes(data), next))
        }
        STRING_CODE => {
            let (data, next) = unescape(bytes, pos + 1)?;
            let s = String::from_utf8(data)
                .map_err(|_| malformed("invalid utf-8 in string element"))?;
            Ok((TupleElement::String(s), next))
        }
        code if (INT_ZERO_CODE - 8..=INT_ZERO_CODE + 8).contains(&code) => {
            let (value, next) = unpack_int(bytes, pos, code)?;
            Ok((TupleElement::Int(value), next))
        }
        FALSE_CODE => Ok((TupleElement::Bool(false), pos + 1)),
        TRUE_CODE => Ok((TupleElement::Bool(true), pos + 1)),
        UUID_CODE => {
            let end = pos + 1 + 16;
            let slice = bytes
                .get(pos + 1..end)
                .ok_or_else(|| malformed("truncated uuid element"))?;
            let mut raw = [0; 16];
            raw.copy_from_slice(slice);
            Ok((TupleElement::Uuid(Uuid::from_bytes(raw)), end))
        }
        VERSIONSTAMP_CODE => {
            let end = pos + 1 + 12;
            let slice = bytes
                .get(pos + 1..end)
                .ok_or_else(|| malformed("truncated versionstamp element"))?;
            let mut raw = [0; 12];
            raw.copy_from_slice(slice);
            Ok((TupleElement::Versionstamp(Versionstamp::from_bytes(raw)), end))
        }
        other => Err(Error::Internal(format!(
            "malformed tuple: unsupported type code {other:#04x} at {pos}"
        ))),
    }
}

fn unescape(bytes: &[u8], mut pos: usize) -> Result<(Vec<u8>, usize)> {
    let mut out = Vec::new();
    loop {
        match bytes.get(pos) {
            Some(0x00) if bytes.get(pos + 1) == Some(&0xFF) => {
                out.push(0x00);
                pos += 2;
            }
            Some(0x00) => return Ok((out, pos + 1)),
            Some(&byte) => {
                out.push(byte);
                pos += 1;
            }
            None => {
                return Err(Error::Internal(
                    "malformed tuple: unterminated byte string".into(),
                ))
            }
        }
    }
}

fn unpack_int(bytes: &[u8], pos: usize, code: u8) -> Result<(i64, usize)> {
    if code == INT_ZERO_CODE {
        return Ok((0, pos + 1));
    }
    let positive = code > INT_ZERO_CODE;
    let n = if positive {
        (code - INT_ZERO_CODE) as usize
    } else {
        (INT_ZERO_CODE - code) as usize
    };
    let end = pos + 1 + n;
    let slice = bytes
        .get(pos + 1..end)
        .ok_or_else(|| Error::Internal(format!("malformed tuple: truncated integer at {pos}")))?;
    let mut scratch = [0; 8];
    scratch[8 - n..].copy_from_slice(slice);
    let raw = BE::read_u64(&scratch);
    let value = if positive {
        i64::try_from(raw)
            .map_err(|_| Error::Internal("malformed tuple: integer out of range".into()))?
    } else {
        let wide = i128::from(raw) - ((1_i128 << (8 * n)) - 1);
        i64::try_from(wide)
            .map_err(|_| Error::Internal("malformed tuple: integer out of range".into()))?
    };
    Ok((value, end))
}
