//! Byte-slice decoders and the named library the scheduler resolves them from.
//!
//! Built-in codecs:
//!
//! - `int`: accumulates `byte[i] << i` over at most 4 bytes. The shift is by byte
//!   *index*, not by `8 * index`; grammars written against existing tooling depend on
//!   this exact arithmetic, so it is kept as is.
//! - `cstring`: up to 4096 bytes of UTF-8 text, cut at the first NUL.
//! - fixed-width integers: `u8`, `i8`, `u16le`, `u16be`, `i16le`, `i16be`, `u32le`,
//!   `u32be`, `i32le`, `i32be`, `i64le`, `i64be`.
//!
//! Grammars may add [`CustomCodec`]s (an expression over the field bytes) and hosts
//! may register native functions through [`FnCodec`].

use crate::expr::{ExprError, Expression};
use crate::value::Value;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::collections::HashMap;

const INT_MAX_BYTES: usize = 4;
const CSTRING_MAX_BYTES: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("value too large")]
    TooLarge,
    #[error("expected {expected} bytes, got {actual}")]
    Width { expected: usize, actual: usize },
    #[error("Duplicate codec name: {0}")]
    Duplicate(String),
    #[error("Unknown codec: {0}")]
    Unknown(String),
    #[error("Expression: {0}")]
    Expression(#[from] ExprError),
    #[error("{0}")]
    Custom(String),
}

/// Decodes the bytes covered by a fixed field.
pub trait Codec: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError>;
}

/// The `int` codec (shift-by-index accumulation).
#[derive(Debug, Default)]
pub struct IntCodec;

impl Codec for IntCodec {
    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        if bytes.len() > INT_MAX_BYTES {
            return Err(CodecError::TooLarge);
        }
        let acc = bytes
            .iter()
            .enumerate()
            .fold(0i64, |acc, (i, b)| acc + ((*b as i64) << i));
        Ok(Value::Int(acc))
    }
}

#[derive(Debug, Default)]
pub struct CStringCodec;

impl Codec for CStringCodec {
    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        if bytes.len() > CSTRING_MAX_BYTES {
            return Err(CodecError::TooLarge);
        }
        let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        Ok(Value::Text(String::from_utf8_lossy(&bytes[..end]).into_owned()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Endianness {
    Big,
    Little,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum IntKind {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    I64,
}

impl IntKind {
    fn width(self) -> usize {
        match self {
            IntKind::U8 | IntKind::I8 => 1,
            IntKind::U16 | IntKind::I16 => 2,
            IntKind::U32 | IntKind::I32 => 4,
            IntKind::I64 => 8,
        }
    }
}

/// Standard fixed-width integers in a given byte order.
#[derive(Debug, Clone, Copy)]
pub struct FixedIntCodec {
    kind: IntKind,
    endianness: Endianness,
}

impl FixedIntCodec {
    fn read<B: ByteOrder>(&self, bytes: &[u8]) -> i64 {
        match self.kind {
            IntKind::U8 => bytes[0] as i64,
            IntKind::I8 => bytes[0] as i8 as i64,
            IntKind::U16 => B::read_u16(bytes) as i64,
            IntKind::I16 => B::read_i16(bytes) as i64,
            IntKind::U32 => B::read_u32(bytes) as i64,
            IntKind::I32 => B::read_i32(bytes) as i64,
            IntKind::I64 => B::read_i64(bytes),
        }
    }
}

impl Codec for FixedIntCodec {
    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        let expected = self.kind.width();
        if bytes.len() != expected {
            return Err(CodecError::Width {
                expected,
                actual: bytes.len(),
            });
        }
        let v = match self.endianness {
            Endianness::Big => self.read::<BigEndian>(bytes),
            Endianness::Little => self.read::<LittleEndian>(bytes),
        };
        Ok(Value::Int(v))
    }
}

/// A decoder defined by an expression over the field bytes.
///
/// Bindings: `value` (bytes as a big-endian unsigned integer, at most 8 bytes),
/// `len` (byte count), and `b0`, `b1`, ... for each byte.
#[derive(Debug, Clone)]
pub struct CustomCodec {
    expression: Expression,
}

impl CustomCodec {
    pub fn compile(source: &str) -> Result<Self, CodecError> {
        Ok(CustomCodec {
            expression: Expression::parse(source)?,
        })
    }

    pub fn expression(&self) -> &Expression {
        &self.expression
    }
}

impl Codec for CustomCodec {
    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        let mut bindings = HashMap::new();
        bindings.insert("len".to_string(), bytes.len() as i64);
        if bytes.len() <= 8 {
            let value = bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64);
            bindings.insert("value".to_string(), value as i64);
        }
        for (i, b) in bytes.iter().enumerate() {
            bindings.insert(format!("b{}", i), *b as i64);
        }
        Ok(Value::Int(self.expression.compute(&bindings)?))
    }
}

/// A host-supplied native decoder.
pub struct FnCodec<F>(pub F);

impl<F> Codec for FnCodec<F>
where
    F: Fn(&[u8]) -> Result<Value, CodecError> + Send + Sync,
{
    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        (self.0)(bytes)
    }
}

/// Named codecs available to a grammar.
pub struct CodecLibrary {
    codecs: HashMap<String, Box<dyn Codec>>,
}

impl CodecLibrary {
    /// A library with no codecs at all.
    pub fn empty() -> Self {
        CodecLibrary {
            codecs: HashMap::new(),
        }
    }

    /// A library preloaded with the built-in codecs.
    pub fn new() -> Self {
        let mut lib = CodecLibrary::empty();
        lib.codecs.insert("int".to_string(), Box::new(IntCodec));
        lib.codecs.insert("cstring".to_string(), Box::new(CStringCodec));
        let fixed = [
            ("u8", IntKind::U8, Endianness::Little),
            ("i8", IntKind::I8, Endianness::Little),
            ("u16le", IntKind::U16, Endianness::Little),
            ("u16be", IntKind::U16, Endianness::Big),
            ("i16le", IntKind::I16, Endianness::Little),
            ("i16be", IntKind::I16, Endianness::Big),
            ("u32le", IntKind::U32, Endianness::Little),
            ("u32be", IntKind::U32, Endianness::Big),
            ("i32le", IntKind::I32, Endianness::Little),
            ("i32be", IntKind::I32, Endianness::Big),
            ("i64le", IntKind::I64, Endianness::Little),
            ("i64be", IntKind::I64, Endianness::Big),
        ];
        for (name, kind, endianness) in fixed {
            lib.codecs
                .insert(name.to_string(), Box::new(FixedIntCodec { kind, endianness }));
        }
        lib
    }

    pub fn register_codec(&mut self, name: &str, codec: Box<dyn Codec>) -> Result<(), CodecError> {
        if self.codecs.contains_key(name) {
            return Err(CodecError::Duplicate(name.to_string()));
        }
        self.codecs.insert(name.to_string(), codec);
        Ok(())
    }

    /// `Ok(None)` when no codec is requested (size-only field).
    pub fn resolve(&self, key: Option<&str>) -> Result<Option<&dyn Codec>, CodecError> {
        match key {
            None => Ok(None),
            Some(name) => self
                .codecs
                .get(name)
                .map(|c| Some(c.as_ref()))
                .ok_or_else(|| CodecError::Unknown(name.to_string())),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.codecs.contains_key(name)
    }

    /// Registered codec names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.codecs.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for CodecLibrary {
    fn default() -> Self {
        CodecLibrary::new()
    }
}
