//! Typed attribute values and their canonical encodings.
//!
//! Two encodings are defined here:
//!
//! - **Canonical bytes** (`[type:2][body]`) are exact and reversible. They are
//!   the AEAD plaintext for encrypted attributes and the signed form of
//!   sign-only attributes.
//! - **Canonical strings** are used in the encryption context and as beacon
//!   input. They are type-prefixed so values of different types never collide,
//!   and numbers are normalized so `1`, `1.0` and `10e-1` compare equal.

use crate::error::Error;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::collections::BTreeMap;

/// A record: attribute name to typed value. Names are unique by construction.
pub type Record = BTreeMap<String, AttributeValue>;

const TYPE_NULL: u16 = 0x0000;
const TYPE_STRING: u16 = 0x0001;
const TYPE_NUMBER: u16 = 0x0002;
const TYPE_BOOLEAN: u16 = 0x0004;
const TYPE_LIST: u16 = 0x0200;
const TYPE_MAP: u16 = 0x0201;
const TYPE_BINARY: u16 = 0xFFFF;

/// Deepest list/map nesting accepted in either direction.
pub const MAX_NESTING_DEPTH: usize = 32;

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    /// UTF-8 string
    S(String),
    /// Decimal number kept as its original text
    N(String),
    /// Raw bytes
    B(Vec<u8>),
    /// Boolean
    Bool(bool),
    /// Null
    Null,
    /// Ordered list
    L(Vec<AttributeValue>),
    /// Nested map
    M(BTreeMap<String, AttributeValue>),
}

impl AttributeValue {
    /// Convenience constructor for string values.
    #[must_use]
    pub fn string(value: impl Into<String>) -> Self {
        Self::S(value.into())
    }

    /// Convenience constructor for number values.
    #[must_use]
    pub fn number(value: impl ToString) -> Self {
        Self::N(value.to_string())
    }

    const fn type_id(&self) -> u16 {
        match self {
            Self::Null => TYPE_NULL,
            Self::S(_) => TYPE_STRING,
            Self::N(_) => TYPE_NUMBER,
            Self::Bool(_) => TYPE_BOOLEAN,
            Self::L(_) => TYPE_LIST,
            Self::M(_) => TYPE_MAP,
            Self::B(_) => TYPE_BINARY,
        }
    }

    /// Serializes the value to its canonical `[type:2][body]` form.
    ///
    /// # Errors
    ///
    /// Returns `Error::MalformedValue` if a nested element exceeds the 32-bit
    /// length fields, and `Error::UnsupportedValue` if lists and maps nest
    /// deeper than [`MAX_NESTING_DEPTH`].
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.type_id().to_be_bytes());
        self.write_body(&mut out, 0)?;
        Ok(out)
    }

    /// Parses a value previously produced by [`Self::to_canonical_bytes`].
    ///
    /// # Errors
    ///
    /// Returns `Error::MalformedValue` on truncated or trailing bytes, and
    /// `Error::UnsupportedValue` on an unknown type id or nesting deeper than
    /// [`MAX_NESTING_DEPTH`].
    pub fn from_canonical_bytes(data: &[u8]) -> Result<Self, Error> {
        if data.len() < 2 {
            return Err(Error::MalformedValue("missing type id".to_string()));
        }
        let type_id = u16::from_be_bytes([data[0], data[1]]);
        Self::read_body(type_id, &data[2..], 0)
    }

    fn write_body(&self, out: &mut Vec<u8>, depth: usize) -> Result<(), Error> {
        if matches!(self, Self::L(_) | Self::M(_)) {
            check_depth(depth)?;
        }
        match self {
            Self::Null => {}
            Self::S(s) | Self::N(s) => out.extend_from_slice(s.as_bytes()),
            Self::B(b) => out.extend_from_slice(b),
            Self::Bool(b) => out.push(u8::from(*b)),
            Self::L(items) => {
                write_u32(out, items.len())?;
                for item in items {
                    out.extend_from_slice(&item.type_id().to_be_bytes());
                    let mut body = Vec::new();
                    item.write_body(&mut body, depth + 1)?;
                    write_u32(out, body.len())?;
                    out.extend_from_slice(&body);
                }
            }
            Self::M(entries) => {
                write_u32(out, entries.len())?;
                for (key, item) in entries {
                    write_u32(out, key.len())?;
                    out.extend_from_slice(key.as_bytes());
                    out.extend_from_slice(&item.type_id().to_be_bytes());
                    let mut body = Vec::new();
                    item.write_body(&mut body, depth + 1)?;
                    write_u32(out, body.len())?;
                    out.extend_from_slice(&body);
                }
            }
        }
        Ok(())
    }

    fn read_body(type_id: u16, body: &[u8], depth: usize) -> Result<Self, Error> {
        if matches!(type_id, TYPE_LIST | TYPE_MAP) {
            check_depth(depth)?;
        }
        match type_id {
            TYPE_NULL => {
                if body.is_empty() {
                    Ok(Self::Null)
                } else {
                    Err(Error::MalformedValue("null with a body".to_string()))
                }
            }
            TYPE_STRING => Ok(Self::S(utf8(body)?)),
            TYPE_NUMBER => Ok(Self::N(utf8(body)?)),
            TYPE_BINARY => Ok(Self::B(body.to_vec())),
            TYPE_BOOLEAN => match body {
                [0] => Ok(Self::Bool(false)),
                [1] => Ok(Self::Bool(true)),
                _ => Err(Error::MalformedValue("invalid boolean body".to_string())),
            },
            TYPE_LIST => {
                let mut reader = Reader::new(body);
                let count = reader.u32()?;
                let mut items = Vec::new();
                for _ in 0..count {
                    let item_type = reader.u16()?;
                    let len = reader.u32()?;
                    items.push(Self::read_body(item_type, reader.take(len)?, depth + 1)?);
                }
                reader.finish()?;
                Ok(Self::L(items))
            }
            TYPE_MAP => {
                let mut reader = Reader::new(body);
                let count = reader.u32()?;
                let mut entries = BTreeMap::new();
                for _ in 0..count {
                    let key_len = reader.u32()?;
                    let key = utf8(reader.take(key_len)?)?;
                    let item_type = reader.u16()?;
                    let len = reader.u32()?;
                    let item = Self::read_body(item_type, reader.take(len)?, depth + 1)?;
                    if entries.insert(key.clone(), item).is_some() {
                        return Err(Error::MalformedValue(format!("duplicate map key: {key}")));
                    }
                }
                reader.finish()?;
                Ok(Self::M(entries))
            }
            other => Err(Error::UnsupportedValue(format!("attribute type id {other:#06x}"))),
        }
    }

    /// Returns the canonical, type-prefixed string form of the value.
    ///
    /// | type | form |
    /// |------|------|
    /// | string | `S:<text>` |
    /// | number | `N:<normalized>` (see [`canonical_number`]) |
    /// | binary | `B:<base64>` |
    /// | boolean | `BOOL:true` / `BOOL:false` |
    /// | null | `NULL` |
    /// | list / map | `L:` / `M:` + base64 of the canonical bytes |
    ///
    /// # Errors
    ///
    /// Returns `Error::UnsupportedValue` if a number is not valid decimal text.
    pub fn canonical_string(&self) -> Result<String, Error> {
        Ok(match self {
            Self::S(s) => format!("S:{s}"),
            Self::N(n) => format!("N:{}", canonical_number(n)?),
            Self::B(b) => format!("B:{}", STANDARD.encode(b)),
            Self::Bool(b) => format!("BOOL:{b}"),
            Self::Null => "NULL".to_string(),
            Self::L(_) => format!("L:{}", STANDARD.encode(self.to_canonical_bytes()?)),
            Self::M(_) => format!("M:{}", STANDARD.encode(self.to_canonical_bytes()?)),
        })
    }
}

/// Normalizes decimal number text to `[-]d[.ddd]E<exp>`.
///
/// Leading and trailing zeros of the mantissa are removed, so every numeric
/// value has exactly one rendering. Any zero renders as `0`.
///
/// # Errors
///
/// Returns `Error::UnsupportedValue` unless the input matches
/// `[+-]digits[.digits][(e|E)[+-]digits]` with at least one mantissa digit.
pub fn canonical_number(raw: &str) -> Result<String, Error> {
    let invalid = || Error::UnsupportedValue(format!("invalid number: {raw:?}"));

    let (negative, unsigned) = match raw.as_bytes().first() {
        Some(b'-') => (true, &raw[1..]),
        Some(b'+') => (false, &raw[1..]),
        _ => (false, raw),
    };

    let (mantissa, exponent) = match unsigned.find(|c: char| c == 'e' || c == 'E') {
        Some(pos) => {
            let exp_text = &unsigned[pos + 1..];
            let digits = exp_text.strip_prefix(|c: char| c == '+' || c == '-').unwrap_or(exp_text);
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            (&unsigned[..pos], exp_text.parse::<i64>().map_err(|_| invalid())?)
        }
        None => (unsigned, 0),
    };

    let (int_part, frac_part) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(invalid());
    }
    if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }

    // value = 0.<digits> * 10^point
    let digits: String = int_part.chars().chain(frac_part.chars()).collect();
    let leading = digits.len() - digits.trim_start_matches('0').len();
    let significant = digits.trim_start_matches('0').trim_end_matches('0');
    if significant.is_empty() {
        return Ok("0".to_string());
    }

    let int_len = i64::try_from(int_part.len()).map_err(|_| invalid())?;
    let leading = i64::try_from(leading).map_err(|_| invalid())?;
    let point = exponent
        .checked_add(int_len)
        .and_then(|p| p.checked_sub(leading))
        .and_then(|p| p.checked_sub(1))
        .ok_or_else(invalid)?;

    let sign = if negative { "-" } else { "" };
    let (first, rest) = significant.split_at(1);
    if rest.is_empty() {
        Ok(format!("{sign}{first}E{point}"))
    } else {
        Ok(format!("{sign}{first}.{rest}E{point}"))
    }
}

fn check_depth(depth: usize) -> Result<(), Error> {
    if depth >= MAX_NESTING_DEPTH {
        return Err(Error::UnsupportedValue(format!(
            "nesting deeper than {MAX_NESTING_DEPTH} levels"
        )));
    }
    Ok(())
}

fn utf8(bytes: &[u8]) -> Result<String, Error> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| Error::MalformedValue(format!("invalid UTF-8: {e}")))
}

fn write_u32(out: &mut Vec<u8>, len: usize) -> Result<(), Error> {
    let len = u32::try_from(len)
        .map_err(|_| Error::MalformedValue(format!("length {len} exceeds u32")))?;
    out.extend_from_slice(&len.to_be_bytes());
    Ok(())
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], Error> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| Error::MalformedValue("value truncated".to_string()))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, Error> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<usize, Error> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize)
    }

    fn finish(&self) -> Result<(), Error> {
        if self.pos == self.data.len() {
            Ok(())
        } else {
            Err(Error::MalformedValue("trailing bytes after value".to_string()))
        }
    }
}
