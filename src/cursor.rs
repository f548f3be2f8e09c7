//! Little-endian primitive reader/writer shared by every codec layer.
//!
//! Strings follow the engine's length-prefixed layout: a signed 32-bit count,
//! positive for single-byte text and negative for UTF-16 code units, both
//! including a trailing null. A zero count is an empty string with no
//! terminator at all, which is distinct from a one-byte `"\0"` string.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::io::{self, Cursor};
use uuid::Uuid;

use crate::error::{Result, SavError};

// ── Strings ──────────────────────────────────────────────

/// On-disk flavour a string was (or will be) written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrEncoding {
    /// Zero length prefix, no terminator.
    Empty,
    /// One byte per character plus a null byte.
    Narrow,
    /// UTF-16LE code units plus a null unit.
    Wide,
}

impl StrEncoding {
    /// The flavour the engine picks for `text` when nothing forces it.
    pub fn natural(text: &str) -> Self {
        if text.is_empty() {
            StrEncoding::Empty
        } else if text.is_ascii() {
            StrEncoding::Narrow
        } else {
            StrEncoding::Wide
        }
    }
}

/// A string read from (or destined for) a save, remembering its encoding so
/// unedited values are written back bit-for-bit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "SavStringRepr", into = "SavStringRepr")]
pub struct SavString {
    text: String,
    encoding: StrEncoding,
}

impl SavString {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let encoding = StrEncoding::natural(&text);
        Self { text, encoding }
    }

    /// Force UTF-16 output regardless of content.
    pub fn wide(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            encoding: StrEncoding::Wide,
        }
    }

    pub fn with_encoding(text: impl Into<String>, encoding: StrEncoding) -> Self {
        Self {
            text: text.into(),
            encoding,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn encoding(&self) -> StrEncoding {
        self.encoding
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Replace the text, re-deriving the encoding unless UTF-16 was forced.
    pub fn set(&mut self, text: impl Into<String>) {
        self.text = text.into();
        if self.encoding != StrEncoding::Wide {
            self.encoding = StrEncoding::natural(&self.text);
        }
    }

    /// Encoding actually used on write. A stored flavour that can no longer
    /// represent the text falls back to the natural one.
    fn effective_encoding(&self) -> StrEncoding {
        match self.encoding {
            StrEncoding::Empty if !self.text.is_empty() => StrEncoding::natural(&self.text),
            StrEncoding::Narrow if self.text.chars().any(|c| (c as u32) > 0xFF) => StrEncoding::Wide,
            other => other,
        }
    }
}

impl Default for SavString {
    fn default() -> Self {
        SavString::new("")
    }
}

impl From<&str> for SavString {
    fn from(text: &str) -> Self {
        SavString::new(text)
    }
}

impl From<String> for SavString {
    fn from(text: String) -> Self {
        SavString::new(text)
    }
}

impl PartialEq<str> for SavString {
    fn eq(&self, other: &str) -> bool {
        self.text == other
    }
}

impl PartialEq<&str> for SavString {
    fn eq(&self, other: &&str) -> bool {
        self.text == *other
    }
}

impl fmt::Display for SavString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Interchange form: a bare string when the encoding is the natural one.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum SavStringRepr {
    Plain(String),
    Tagged { text: String, encoding: StrEncoding },
}

impl From<SavStringRepr> for SavString {
    fn from(repr: SavStringRepr) -> Self {
        match repr {
            SavStringRepr::Plain(text) => SavString::new(text),
            SavStringRepr::Tagged { text, encoding } => SavString::with_encoding(text, encoding),
        }
    }
}

impl From<SavString> for SavStringRepr {
    fn from(s: SavString) -> Self {
        if s.encoding == StrEncoding::natural(&s.text) {
            SavStringRepr::Plain(s.text)
        } else {
            SavStringRepr::Tagged {
                text: s.text,
                encoding: s.encoding,
            }
        }
    }
}

// ── Opaque blobs ─────────────────────────────────────────

/// Bytes kept verbatim because their layout is unknown (or didn't match the
/// layout we expected). Interchange form is `{ "len": N, "base64": "..." }`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpaqueBytes(pub Vec<u8>);

impl OpaqueBytes {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for OpaqueBytes {
    fn from(bytes: &[u8]) -> Self {
        OpaqueBytes(bytes.to_vec())
    }
}

#[derive(Serialize, Deserialize)]
struct OpaqueRepr {
    len: usize,
    base64: String,
}

impl Serialize for OpaqueBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        OpaqueRepr {
            len: self.0.len(),
            base64: base64_encode(&self.0),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for OpaqueBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let repr = OpaqueRepr::deserialize(deserializer)?;
        let bytes = base64_decode(&repr.base64).map_err(serde::de::Error::custom)?;
        if bytes.len() != repr.len {
            return Err(serde::de::Error::custom(format!(
                "opaque blob declares {} bytes but decodes to {}",
                repr.len,
                bytes.len()
            )));
        }
        Ok(OpaqueBytes(bytes))
    }
}

const BASE64_ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

fn base64_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().div_ceil(3) * 4);
    for group in data.chunks(3) {
        let n = group.len();
        let triple = (group[0] as u32) << 16
            | (group.get(1).copied().unwrap_or(0) as u32) << 8
            | group.get(2).copied().unwrap_or(0) as u32;
        for i in 0..4 {
            if i <= n {
                let sextet = (triple >> (18 - 6 * i)) & 0x3F;
                out.push(BASE64_ALPHABET[sextet as usize] as char);
            } else {
                out.push('=');
            }
        }
    }
    out
}

fn base64_decode(s: &str) -> std::result::Result<Vec<u8>, String> {
    let mut out = Vec::with_capacity(s.len() / 4 * 3);
    let mut acc = 0u32;
    let mut bits = 0u32;
    for (pos, byte) in s.bytes().enumerate() {
        if byte == b'=' || byte.is_ascii_whitespace() {
            continue;
        }
        let value = BASE64_ALPHABET
            .iter()
            .position(|&c| c == byte)
            .ok_or_else(|| format!("invalid base64 character at position {pos}"))?;
        acc = (acc << 6) | value as u32;
        bits += 6;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
            acc &= (1 << bits) - 1;
        }
    }
    Ok(out)
}

// ── GUIDs ────────────────────────────────────────────────

/// The engine stores a GUID as four little-endian u32 words; reversing each
/// word gives the canonical textual byte order.
fn swizzle_guid(raw: [u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for (word, chunk) in raw.chunks_exact(4).enumerate() {
        for (i, b) in chunk.iter().rev().enumerate() {
            out[word * 4 + i] = *b;
        }
    }
    out
}

// ── Reader ───────────────────────────────────────────────

/// Forward-only reader over a byte slice. `base` is added to every reported
/// offset so nested readers report positions in their parent buffer.
pub struct ByteReader<'a> {
    cur: Cursor<&'a [u8]>,
    base: u64,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self::with_base(data, 0)
    }

    pub fn with_base(data: &'a [u8], base: u64) -> Self {
        Self {
            cur: Cursor::new(data),
            base,
        }
    }

    pub fn offset(&self) -> u64 {
        self.base + self.cur.position()
    }

    pub fn remaining(&self) -> usize {
        self.cur.get_ref().len().saturating_sub(self.cur.position() as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn need(&self, needed: usize) -> Result<()> {
        let available = self.remaining();
        if available < needed {
            return Err(SavError::TruncatedData {
                offset: self.offset(),
                needed,
                available,
            });
        }
        Ok(())
    }

    fn read_with<T>(
        &mut self,
        width: usize,
        f: impl FnOnce(&mut Cursor<&'a [u8]>) -> io::Result<T>,
    ) -> Result<T> {
        self.need(width)?;
        let offset = self.offset();
        let available = self.remaining();
        f(&mut self.cur).map_err(|_| SavError::TruncatedData {
            offset,
            needed: width,
            available,
        })
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        self.read_with(1, |c| c.read_u8())
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        self.read_with(1, |c| c.read_i8())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.read_with(4, |c| c.read_u32::<LittleEndian>())
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.read_with(4, |c| c.read_i32::<LittleEndian>())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        self.read_with(8, |c| c.read_u64::<LittleEndian>())
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.read_with(8, |c| c.read_i64::<LittleEndian>())
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        self.read_with(4, |c| c.read_f32::<LittleEndian>())
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.read_with(8, |c| c.read_f64::<LittleEndian>())
    }

    /// Borrow the next `len` bytes without copying.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.need(len)?;
        let start = self.cur.position() as usize;
        let data: &'a [u8] = *self.cur.get_ref();
        self.cur.set_position((start + len) as u64);
        Ok(&data[start..start + len])
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    /// Split off a reader over the next `len` bytes and skip past them.
    pub fn sub_reader(&mut self, len: usize) -> Result<ByteReader<'a>> {
        let base = self.offset();
        let bytes = self.read_bytes(len)?;
        Ok(ByteReader::with_base(bytes, base))
    }

    /// Everything not yet consumed, leaving the reader at the end.
    pub fn read_rest(&mut self) -> Result<&'a [u8]> {
        let len = self.remaining();
        self.read_bytes(len)
    }

    /// Boolean stored as a u8 that must be 0 or 1.
    pub fn read_bool8(&mut self) -> Result<bool> {
        let offset = self.offset();
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(SavError::malformed(offset, format!("boolean byte {other}"))),
        }
    }

    /// Boolean stored as a u32 that must be 0 or 1.
    pub fn read_bool32(&mut self) -> Result<bool> {
        let offset = self.offset();
        match self.read_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(SavError::malformed(offset, format!("boolean word {other}"))),
        }
    }

    /// Consume a u32 that must hold `expected`.
    pub fn expect_u32(&mut self, expected: u32, what: &str) -> Result<()> {
        let offset = self.offset();
        let found = self.read_u32()?;
        if found != expected {
            return Err(SavError::malformed(
                offset,
                format!("{what}: expected {expected}, found {found}"),
            ));
        }
        Ok(())
    }

    pub fn read_string(&mut self) -> Result<SavString> {
        let offset = self.offset();
        let len = self.read_i32()?;
        if len == 0 {
            return Ok(SavString::with_encoding("", StrEncoding::Empty));
        }
        if len > 0 {
            let bytes = self.read_bytes(len as usize)?;
            let (text, terminator) = bytes.split_at(bytes.len() - 1);
            if terminator[0] != 0 {
                return Err(SavError::malformed(offset, "string without null terminator"));
            }
            // One byte per character, so arbitrary bytes survive the round trip.
            let text: String = text.iter().map(|&b| b as char).collect();
            return Ok(SavString::with_encoding(text, StrEncoding::Narrow));
        }
        let units = (-(len as i64)) as usize;
        let bytes = self.read_bytes(units * 2)?;
        let mut code_units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        if code_units.pop() != Some(0) {
            return Err(SavError::malformed(offset, "UTF-16 string without null terminator"));
        }
        let text = String::from_utf16(&code_units)
            .map_err(|e| SavError::malformed(offset, format!("invalid UTF-16 string: {e}")))?;
        Ok(SavString::with_encoding(text, StrEncoding::Wide))
    }

    /// 16-byte engine GUID.
    pub fn read_guid(&mut self) -> Result<Uuid> {
        Ok(Uuid::from_bytes(swizzle_guid(self.read_array::<16>()?)))
    }

    /// A u8 presence flag followed by a GUID when set.
    pub fn read_optional_guid(&mut self) -> Result<Option<Uuid>> {
        if self.read_u8()? != 0 {
            Ok(Some(self.read_guid()?))
        } else {
            Ok(None)
        }
    }

    /// Fail with `TrailingData` unless every byte was consumed.
    pub fn finish(&self) -> Result<()> {
        if !self.is_empty() {
            return Err(SavError::TrailingData {
                offset: self.offset(),
                remaining: self.remaining() as u64,
            });
        }
        Ok(())
    }
}

// ── Writer ───────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        Ok(self.buf.write_u8(v)?)
    }

    pub fn write_i8(&mut self, v: i8) -> Result<()> {
        Ok(self.buf.write_i8(v)?)
    }

    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        Ok(self.buf.write_u32::<LittleEndian>(v)?)
    }

    pub fn write_i32(&mut self, v: i32) -> Result<()> {
        Ok(self.buf.write_i32::<LittleEndian>(v)?)
    }

    pub fn write_u64(&mut self, v: u64) -> Result<()> {
        Ok(self.buf.write_u64::<LittleEndian>(v)?)
    }

    pub fn write_i64(&mut self, v: i64) -> Result<()> {
        Ok(self.buf.write_i64::<LittleEndian>(v)?)
    }

    pub fn write_f32(&mut self, v: f32) -> Result<()> {
        Ok(self.buf.write_f32::<LittleEndian>(v)?)
    }

    pub fn write_f64(&mut self, v: f64) -> Result<()> {
        Ok(self.buf.write_f64::<LittleEndian>(v)?)
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    pub fn write_bool8(&mut self, v: bool) -> Result<()> {
        self.write_u8(v as u8)
    }

    pub fn write_bool32(&mut self, v: bool) -> Result<()> {
        self.write_u32(v as u32)
    }

    /// Length of a nested block as the u32 the format stores.
    pub fn len_u32(&self, what: &'static str) -> Result<u32> {
        u32::try_from(self.buf.len()).map_err(|_| SavError::LengthMismatch {
            offset: 0,
            what,
            declared: u32::MAX as u64,
            actual: self.buf.len() as u64,
        })
    }

    pub fn write_string(&mut self, s: &SavString) -> Result<()> {
        match s.effective_encoding() {
            StrEncoding::Empty => self.write_i32(0),
            StrEncoding::Narrow => {
                let len = string_len_prefix(s.text.chars().count() + 1)?;
                self.write_i32(len)?;
                for c in s.text.chars() {
                    self.write_u8(c as u32 as u8)?;
                }
                self.write_u8(0)
            }
            StrEncoding::Wide => {
                let units: Vec<u16> = s.text.encode_utf16().collect();
                let len = string_len_prefix(units.len() + 1)?;
                self.write_i32(-len)?;
                for unit in units {
                    self.buf.write_u16::<LittleEndian>(unit)?;
                }
                self.buf.write_u16::<LittleEndian>(0)?;
                Ok(())
            }
        }
    }

    pub fn write_str(&mut self, s: &str) -> Result<()> {
        self.write_string(&SavString::new(s))
    }

    pub fn write_guid(&mut self, guid: &Uuid) -> Result<()> {
        self.write_bytes(&swizzle_guid(*guid.as_bytes()))
    }

    pub fn write_optional_guid(&mut self, guid: Option<&Uuid>) -> Result<()> {
        match guid {
            Some(guid) => {
                self.write_u8(1)?;
                self.write_guid(guid)
            }
            None => self.write_u8(0),
        }
    }
}

fn string_len_prefix(units: usize) -> Result<i32> {
    i32::try_from(units).map_err(|_| SavError::LengthMismatch {
        offset: 0,
        what: "string",
        declared: i32::MAX as u64,
        actual: units as u64,
    })
}
