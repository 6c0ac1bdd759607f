//! Compiled unit codec.
//!
//! A compiled unit declares one symbol and carries a tag-based constant
//! table. The reader validates every structural marker and reports the
//! first malformation instead of panicking; the writer produces the same
//! layout.
//!
//! Layout (big-endian):
//!
//! ```text
//! magic u32 | major u16 | minor u16 | constant_count u16
//! constants[1..constant_count] (tag u8 + payload)
//! this_symbol u16 | super_symbol u16
//! ```

use std::fmt;

/// Unit magic number.
pub const UNIT_MAGIC: u32 = 0xA0D0_C0DE;

/// Supported major format version.
pub const UNIT_FORMAT_MAJOR: u16 = 1;

const TAG_UTF8: u8 = 1;
const TAG_INTEGER: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_LONG: u8 = 5;
const TAG_SYMBOL_REF: u8 = 7;
const TAG_STRING_CONST: u8 = 8;
const TAG_MEMBER_REF: u8 = 9;

/// One constant table entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// UTF-8 text.
    Utf8(String),
    /// 32-bit integer.
    Integer(i32),
    /// 32-bit float bits.
    Float(u32),
    /// 64-bit integer.
    Long(i64),
    /// Reference to a symbol name (index of a `Utf8`).
    SymbolRef(u16),
    /// String literal (index of a `Utf8`).
    StringConst(u16),
    /// Member of a symbol (`SymbolRef` index, `Utf8` name index).
    MemberRef(u16, u16),
}

/// Why a unit could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitFormatError {
    /// Input ended before the structure was complete.
    Truncated {
        /// Offset where more bytes were needed.
        offset: usize,
    },
    /// Wrong magic number.
    BadMagic(u32),
    /// Unsupported major format version.
    UnsupportedVersion(u16),
    /// The constant count is zero.
    EmptyConstantTable,
    /// Unknown constant tag.
    UnknownTag {
        /// Constant index.
        index: u16,
        /// Tag byte read.
        tag: u8,
    },
    /// A `Utf8` entry holds invalid UTF-8.
    InvalidUtf8 {
        /// Constant index.
        index: u16,
    },
    /// A cross-reference points outside the table or at the wrong tag.
    BadReference {
        /// Entry holding the reference (0 for the trailer).
        from: u16,
        /// Referenced index.
        to: u16,
    },
    /// Bytes remain after the trailer.
    TrailingBytes(usize),
}

impl fmt::Display for UnitFormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { offset } => write!(f, "truncated at offset {}", offset),
            Self::BadMagic(m) => write!(f, "bad magic 0x{:08X}", m),
            Self::UnsupportedVersion(v) => write!(f, "unsupported format version {}", v),
            Self::EmptyConstantTable => write!(f, "constant count is zero"),
            Self::UnknownTag { index, tag } => write!(f, "unknown tag {} at constant {}", tag, index),
            Self::InvalidUtf8 { index } => write!(f, "invalid UTF-8 at constant {}", index),
            Self::BadReference { from, to } => {
                write!(f, "constant {} references invalid index {}", from, to)
            }
            Self::TrailingBytes(n) => write!(f, "{} trailing bytes", n),
        }
    }
}

impl std::error::Error for UnitFormatError {}

/// A parsed compiled unit.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledUnit {
    /// Minor format version.
    pub minor: u16,
    /// Constant table; index 0 is unused and holds `None`.
    pub constants: Vec<Option<Constant>>,
    /// Index of the declared symbol's `SymbolRef`.
    pub this_symbol: u16,
    /// Index of the parent symbol's `SymbolRef`, or 0.
    pub super_symbol: u16,
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], UnitFormatError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(UnitFormatError::Truncated { offset: self.pos })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, UnitFormatError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, UnitFormatError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, UnitFormatError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64, UnitFormatError> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(i64::from_be_bytes(buf))
    }
}

impl CompiledUnit {
    /// Parses a unit, validating every marker and reference.
    pub fn parse(bytes: &[u8]) -> Result<Self, UnitFormatError> {
        let mut cur = Cursor { bytes, pos: 0 };

        let magic = cur.u32()?;
        if magic != UNIT_MAGIC {
            return Err(UnitFormatError::BadMagic(magic));
        }
        let major = cur.u16()?;
        if major != UNIT_FORMAT_MAJOR {
            return Err(UnitFormatError::UnsupportedVersion(major));
        }
        let minor = cur.u16()?;
        let count = cur.u16()?;
        if count == 0 {
            return Err(UnitFormatError::EmptyConstantTable);
        }

        let mut constants = Vec::with_capacity(usize::from(count));
        constants.push(None);
        for index in 1..count {
            let tag = cur.u8()?;
            let constant = match tag {
                TAG_UTF8 => {
                    let len = cur.u16()?;
                    let raw = cur.take(usize::from(len))?;
                    let text = std::str::from_utf8(raw)
                        .map_err(|_| UnitFormatError::InvalidUtf8 { index })?;
                    Constant::Utf8(text.to_string())
                }
                TAG_INTEGER => Constant::Integer(cur.u32()? as i32),
                TAG_FLOAT => Constant::Float(cur.u32()?),
                TAG_LONG => Constant::Long(cur.i64()?),
                TAG_SYMBOL_REF => Constant::SymbolRef(cur.u16()?),
                TAG_STRING_CONST => Constant::StringConst(cur.u16()?),
                TAG_MEMBER_REF => Constant::MemberRef(cur.u16()?, cur.u16()?),
                other => return Err(UnitFormatError::UnknownTag { index, tag: other }),
            };
            constants.push(Some(constant));
        }

        let this_symbol = cur.u16()?;
        let super_symbol = cur.u16()?;
        if cur.pos != bytes.len() {
            return Err(UnitFormatError::TrailingBytes(bytes.len() - cur.pos));
        }

        let unit = Self {
            minor,
            constants,
            this_symbol,
            super_symbol,
        };
        unit.validate_references()?;
        Ok(unit)
    }

    fn validate_references(&self) -> Result<(), UnitFormatError> {
        for (index, constant) in self.constants.iter().enumerate() {
            let from = index as u16;
            match constant {
                Some(Constant::SymbolRef(to)) | Some(Constant::StringConst(to)) => {
                    self.expect_utf8(from, *to)?;
                }
                Some(Constant::MemberRef(owner, name)) => {
                    self.expect_symbol(from, *owner)?;
                    self.expect_utf8(from, *name)?;
                }
                _ => {}
            }
        }
        self.expect_symbol(0, self.this_symbol)?;
        if self.super_symbol != 0 {
            self.expect_symbol(0, self.super_symbol)?;
        }
        Ok(())
    }

    fn get(&self, index: u16) -> Option<&Constant> {
        self.constants.get(usize::from(index)).and_then(Option::as_ref)
    }

    fn expect_utf8(&self, from: u16, to: u16) -> Result<(), UnitFormatError> {
        match self.get(to) {
            Some(Constant::Utf8(_)) => Ok(()),
            _ => Err(UnitFormatError::BadReference { from, to }),
        }
    }

    fn expect_symbol(&self, from: u16, to: u16) -> Result<(), UnitFormatError> {
        match self.get(to) {
            Some(Constant::SymbolRef(_)) => Ok(()),
            _ => Err(UnitFormatError::BadReference { from, to }),
        }
    }

    fn utf8(&self, index: u16) -> &str {
        match self.get(index) {
            Some(Constant::Utf8(s)) => s,
            _ => "",
        }
    }

    fn symbol_name(&self, index: u16) -> &str {
        match self.get(index) {
            Some(Constant::SymbolRef(name)) => self.utf8(*name),
            _ => "",
        }
    }

    /// The symbol this unit declares.
    #[must_use]
    pub fn declared_symbol(&self) -> &str {
        self.symbol_name(self.this_symbol)
    }

    /// The parent symbol, if any.
    #[must_use]
    pub fn super_symbol(&self) -> Option<&str> {
        (self.super_symbol != 0).then(|| self.symbol_name(self.super_symbol))
    }

    /// All string-literal constants.
    pub fn string_constants(&self) -> impl Iterator<Item = &str> {
        self.constants.iter().filter_map(move |c| match c {
            Some(Constant::StringConst(idx)) => Some(self.utf8(*idx)),
            _ => None,
        })
    }

    /// All referenced symbol names.
    pub fn referenced_symbols(&self) -> impl Iterator<Item = &str> {
        self.constants.iter().filter_map(move |c| match c {
            Some(Constant::SymbolRef(idx)) => Some(self.utf8(*idx)),
            _ => None,
        })
    }
}

/// Builds unit bytes.
#[derive(Debug, Clone, Default)]
pub struct UnitWriter {
    constants: Vec<Constant>,
    this_symbol: u16,
    super_symbol: u16,
}

impl UnitWriter {
    /// Starts a unit declaring `symbol`.
    #[must_use]
    pub fn new(symbol: &str) -> Self {
        let mut writer = Self::default();
        writer.this_symbol = writer.symbol(symbol);
        writer
    }

    fn push(&mut self, constant: Constant) -> u16 {
        assert!(self.constants.len() < usize::from(u16::MAX) - 1, "constant table full");
        self.constants.push(constant);
        self.constants.len() as u16
    }

    fn utf8(&mut self, text: &str) -> u16 {
        assert!(text.len() <= usize::from(u16::MAX), "Utf8 constant too long");
        if let Some(pos) = self
            .constants
            .iter()
            .position(|c| matches!(c, Constant::Utf8(s) if s == text))
        {
            return pos as u16 + 1;
        }
        self.push(Constant::Utf8(text.to_string()))
    }

    fn symbol(&mut self, name: &str) -> u16 {
        let idx = self.utf8(name);
        self.push(Constant::SymbolRef(idx))
    }

    /// Sets the parent symbol.
    #[must_use]
    pub fn extends(mut self, symbol: &str) -> Self {
        self.super_symbol = self.symbol(symbol);
        self
    }

    /// Adds a string literal.
    #[must_use]
    pub fn string(mut self, text: &str) -> Self {
        let idx = self.utf8(text);
        self.push(Constant::StringConst(idx));
        self
    }

    /// Adds a symbol reference.
    #[must_use]
    pub fn reference(mut self, symbol: &str) -> Self {
        self.symbol(symbol);
        self
    }

    /// Adds an integer constant.
    #[must_use]
    pub fn integer(mut self, value: i32) -> Self {
        self.push(Constant::Integer(value));
        self
    }

    /// Encodes the unit.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&UNIT_MAGIC.to_be_bytes());
        out.extend_from_slice(&UNIT_FORMAT_MAJOR.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&(self.constants.len() as u16 + 1).to_be_bytes());
        for constant in &self.constants {
            match constant {
                Constant::Utf8(s) => {
                    out.push(TAG_UTF8);
                    out.extend_from_slice(&(s.len() as u16).to_be_bytes());
                    out.extend_from_slice(s.as_bytes());
                }
                Constant::Integer(v) => {
                    out.push(TAG_INTEGER);
                    out.extend_from_slice(&v.to_be_bytes());
                }
                Constant::Float(bits) => {
                    out.push(TAG_FLOAT);
                    out.extend_from_slice(&bits.to_be_bytes());
                }
                Constant::Long(v) => {
                    out.push(TAG_LONG);
                    out.extend_from_slice(&v.to_be_bytes());
                }
                Constant::SymbolRef(idx) => {
                    out.push(TAG_SYMBOL_REF);
                    out.extend_from_slice(&idx.to_be_bytes());
                }
                Constant::StringConst(idx) => {
                    out.push(TAG_STRING_CONST);
                    out.extend_from_slice(&idx.to_be_bytes());
                }
                Constant::MemberRef(owner, name) => {
                    out.push(TAG_MEMBER_REF);
                    out.extend_from_slice(&owner.to_be_bytes());
                    out.extend_from_slice(&name.to_be_bytes());
                }
            }
        }
        out.extend_from_slice(&self.this_symbol.to_be_bytes());
        out.extend_from_slice(&self.super_symbol.to_be_bytes());
        out
    }
}
