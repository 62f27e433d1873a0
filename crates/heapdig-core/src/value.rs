//! # Typed values
//!
//! Bytes from the [`SegmentMap`] interpreted through a [`TypeDescriptor`].
//!
//! A [`TypedValue`] is a type plus a byte window, either read from the dump
//! or carried inline (register roots). Sub-values share the window, so
//! walking into fields and elements never goes back to the dump.

use std::fmt;

use gimli::Endianity;

use crate::dump::SegmentMap;
use crate::error::{HeapdigError, Result};
use crate::symbols::{ScalarKind, SymbolCatalog, TypeDescriptor, TypeId, TypeKind};
use crate::types::Address;

/// Upper bound on the bytes of a string that [`ValueReader::string_contents`] reads
pub const MAX_STRING_PREVIEW: u64 = 256;

/// A decoded leaf value
#[derive(Debug, Clone, PartialEq)]
pub enum Value
{
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Complex(f64, f64),
    Pointer(Address),
    String
    {
        data: Address,
        len: u64,
    },
    Slice
    {
        data: Address,
        len: u64,
        cap: u64,
    },
    Interface
    {
        type_word: Address,
        data: Address,
    },
    Map(Address),
    Channel(Address),
    Function(Address),
    /// Aggregates and types without a structural description
    Opaque
    {
        size: u64
    },
}

impl fmt::Display for Value
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Value::Bool(value) => write!(f, "{value}"),
            Value::Int(value) => write!(f, "{value}"),
            Value::Uint(value) => write!(f, "{value}"),
            Value::Float(value) => write!(f, "{value}"),
            Value::Complex(re, im) => write!(f, "({re}{im:+}i)"),
            Value::Pointer(address) | Value::Map(address) | Value::Channel(address) | Value::Function(address) => {
                write!(f, "{address:#x}")
            }
            Value::String { data, len } => write!(f, "string{{{data:#x}, len {len}}}"),
            Value::Slice { data, len, cap } => write!(f, "slice{{{data:#x}, len {len}, cap {cap}}}"),
            Value::Interface { type_word, data } => write!(f, "iface{{{type_word:#x}, {data:#x}}}"),
            Value::Opaque { size } => write!(f, "<{size} bytes>"),
        }
    }
}

/// A type together with the bytes that hold a value of it
#[derive(Debug, Clone)]
pub struct TypedValue<'c>
{
    catalog: &'c SymbolCatalog,
    ty: TypeId,
    /// Where the value lives in the dump; `None` for inline values
    address: Option<Address>,
    bytes: Vec<u8>,
    /// Byte order and width come from the map that produced the bytes
    little_endian: bool,
}

impl<'c> TypedValue<'c>
{
    /// Wrap bytes that did not come from a dump read, such as a register
    pub fn inline(catalog: &'c SymbolCatalog, segments: &SegmentMap, ty: TypeId, bytes: Vec<u8>) -> Self
    {
        Self {
            catalog,
            ty,
            address: None,
            bytes,
            little_endian: segments.endian().is_little_endian(),
        }
    }

    pub fn descriptor(&self) -> &'c TypeDescriptor
    {
        self.catalog.descriptor(self.ty)
    }

    pub fn type_id(&self) -> TypeId
    {
        self.ty
    }

    pub fn address(&self) -> Option<Address>
    {
        self.address
    }

    pub fn bytes(&self) -> &[u8]
    {
        &self.bytes
    }

    fn pointer_size(&self) -> u64
    {
        self.catalog.pointer_size()
    }

    /// Unsigned integer of `size` bytes at `offset`, in the dump's byte order
    pub fn uint_at(&self, offset: u64, size: u64) -> Option<u64>
    {
        let start = usize::try_from(offset).ok()?;
        let width = usize::try_from(size).ok().filter(|width| matches!(width, 1 | 2 | 4 | 8))?;
        let bytes = self.bytes.get(start..start.checked_add(width)?)?;
        let mut buf = [0u8; 8];
        if self.little_endian {
            buf[..width].copy_from_slice(bytes);
            Some(u64::from_le_bytes(buf))
        } else {
            buf[8 - width..].copy_from_slice(bytes);
            Some(u64::from_be_bytes(buf))
        }
    }

    /// Pointer-sized word at `offset`
    pub fn word_at(&self, offset: u64) -> Option<Address>
    {
        self.uint_at(offset, self.pointer_size()).map(Address::new)
    }

    /// The sub-value of type `ty` at `offset` within this one
    pub fn slice(&self, offset: u64, ty: TypeId) -> Result<TypedValue<'c>>
    {
        let size = self.catalog.descriptor(ty).size;
        let out_of_bounds = || HeapdigError::OutOfBounds {
            address: self.address.unwrap_or_default().saturating_add(offset),
            length: size,
        };
        let start = usize::try_from(offset).map_err(|_| out_of_bounds())?;
        let end = usize::try_from(offset.checked_add(size).ok_or_else(out_of_bounds)?).map_err(|_| out_of_bounds())?;
        let bytes = self.bytes.get(start..end).ok_or_else(out_of_bounds)?.to_vec();
        Ok(TypedValue {
            catalog: self.catalog,
            ty,
            address: self.address.map(|address| address.saturating_add(offset)),
            bytes,
            little_endian: self.little_endian,
        })
    }

    /// Named struct field
    pub fn field(&self, name: &str) -> Result<TypedValue<'c>>
    {
        let descriptor = self.descriptor();
        let field = descriptor
            .field(name)
            .ok_or_else(|| HeapdigError::InvalidArgument(format!("{} has no field {name}", descriptor.name)))?;
        self.slice(field.offset, field.ty)
    }

    /// Element `index` of an array value
    pub fn element(&self, index: u64) -> Result<TypedValue<'c>>
    {
        let descriptor = self.descriptor();
        let TypeKind::Array { elem, count } = descriptor.kind else {
            return Err(HeapdigError::InvalidArgument(format!("{} is not an array", descriptor.name)));
        };
        if index >= count {
            return Err(HeapdigError::InvalidArgument(format!(
                "index {index} out of range for {}",
                descriptor.name
            )));
        }
        let stride = self.catalog.descriptor(elem).size;
        self.slice(index.saturating_mul(stride), elem)
    }

    /// Decode this value as a leaf
    pub fn decode(&self) -> Value
    {
        let descriptor = self.descriptor();
        let size = descriptor.size;
        let ptr = self.pointer_size();
        let word = |index: u64| self.word_at(index * ptr).unwrap_or_default();
        let opaque = Value::Opaque { size };

        match &descriptor.kind {
            TypeKind::Scalar(kind) => self.decode_scalar(*kind, size).unwrap_or(opaque),
            TypeKind::Pointer { .. } => Value::Pointer(word(0)),
            TypeKind::Map { .. } => Value::Map(word(0)),
            TypeKind::Channel { .. } => Value::Channel(word(0)),
            TypeKind::Function => Value::Function(word(0)),
            TypeKind::String => Value::String {
                data: word(0),
                len: word(1).value(),
            },
            TypeKind::Slice { .. } => Value::Slice {
                data: word(0),
                len: word(1).value(),
                cap: word(2).value(),
            },
            TypeKind::Interface { .. } => Value::Interface {
                type_word: word(0),
                data: word(1),
            },
            TypeKind::Array { .. } | TypeKind::Struct { .. } | TypeKind::Unknown => opaque,
        }
    }

    fn decode_scalar(&self, kind: ScalarKind, size: u64) -> Option<Value>
    {
        Some(match kind {
            ScalarKind::Bool => Value::Bool(self.uint_at(0, 1)? != 0),
            ScalarKind::Uint => Value::Uint(self.uint_at(0, size)?),
            ScalarKind::Int => {
                let raw = self.uint_at(0, size)?;
                let shift = 64 - size * 8;
                // Sign-extend from the declared width.
                Value::Int(((raw << shift) as i64) >> shift)
            }
            ScalarKind::Float => match size {
                4 => Value::Float(f64::from(f32::from_bits(u32::try_from(self.uint_at(0, 4)?).ok()?))),
                8 => Value::Float(f64::from_bits(self.uint_at(0, 8)?)),
                _ => return None,
            },
            ScalarKind::Complex => match size {
                8 => Value::Complex(
                    f64::from(f32::from_bits(u32::try_from(self.uint_at(0, 4)?).ok()?)),
                    f64::from(f32::from_bits(u32::try_from(self.uint_at(4, 4)?).ok()?)),
                ),
                16 => Value::Complex(
                    f64::from_bits(self.uint_at(0, 8)?),
                    f64::from_bits(self.uint_at(8, 8)?),
                ),
                _ => return None,
            },
        })
    }

    /// Every leaf beneath this value, as `(field path, value)` pairs
    ///
    /// Arrays longer than `max_elements` are cut short.
    pub fn leaves(&self, max_elements: u64) -> Vec<(String, Value)>
    {
        let mut out = Vec::new();
        let mut stack = vec![(String::new(), self.clone())];
        while let Some((path, value)) = stack.pop() {
            let descriptor = value.descriptor();
            match &descriptor.kind {
                TypeKind::Struct { fields } => {
                    for field in fields.iter().rev() {
                        if let Ok(child) = value.slice(field.offset, field.ty) {
                            stack.push((join(&path, &field.name), child));
                        }
                    }
                }
                TypeKind::Array { count, .. } => {
                    for index in (0..(*count).min(max_elements)).rev() {
                        if let Ok(child) = value.element(index) {
                            stack.push((format!("{path}[{index}]"), child));
                        }
                    }
                }
                _ => out.push((path, value.decode())),
            }
        }
        out
    }
}

fn join(path: &str, name: &str) -> String
{
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}.{name}")
    }
}

/// Reads typed values out of the dump
#[derive(Debug, Clone, Copy)]
pub struct ValueReader<'a>
{
    segments: &'a SegmentMap,
    catalog: &'a SymbolCatalog,
}

impl<'a> ValueReader<'a>
{
    pub fn new(segments: &'a SegmentMap, catalog: &'a SymbolCatalog) -> Self
    {
        Self { segments, catalog }
    }

    pub fn segments(&self) -> &'a SegmentMap
    {
        self.segments
    }

    pub fn catalog(&self) -> &'a SymbolCatalog
    {
        self.catalog
    }

    /// Read a value of type `ty` stored at `address`
    ///
    /// Fails with `OutOfBounds` unless one segment holds all of its bytes.
    pub fn read(&self, address: Address, ty: TypeId) -> Result<TypedValue<'a>>
    {
        let size = self.catalog.descriptor(ty).size;
        let bytes = self.segments.read(address, size)?;
        Ok(TypedValue {
            catalog: self.catalog,
            ty,
            address: Some(address),
            bytes,
            little_endian: self.segments.endian().is_little_endian(),
        })
    }

    /// Read `count` consecutive values of type `ty` with a single dump read
    pub fn read_many(&self, address: Address, ty: TypeId, count: u64) -> Result<Vec<TypedValue<'a>>>
    {
        let size = self.catalog.descriptor(ty).size;
        let total = size
            .checked_mul(count)
            .ok_or(HeapdigError::OutOfBounds { address, length: u64::MAX })?;
        let bytes = self.segments.read(address, total)?;
        let little_endian = self.segments.endian().is_little_endian();
        let Ok(stride) = usize::try_from(size) else {
            return Err(HeapdigError::OutOfBounds { address, length: total });
        };
        if stride == 0 {
            return Ok(Vec::new());
        }
        Ok(bytes
            .chunks_exact(stride)
            .zip(0u64..)
            .map(|(chunk, index)| TypedValue {
                catalog: self.catalog,
                ty,
                address: Some(address.saturating_add(index * size)),
                bytes: chunk.to_vec(),
                little_endian,
            })
            .collect())
    }

    /// Wrap inline bytes as a value of type `ty`
    pub fn inline(&self, ty: TypeId, bytes: Vec<u8>) -> TypedValue<'a>
    {
        TypedValue::inline(self.catalog, self.segments, ty, bytes)
    }

    /// Leading bytes of a string value, lossily decoded as UTF-8
    pub fn string_contents(&self, value: &Value) -> Result<String>
    {
        let Value::String { data, len } = value else {
            return Err(HeapdigError::InvalidArgument(format!("{value} is not a string")));
        };
        if *len == 0 {
            return Ok(String::new());
        }
        let bytes = self.segments.read(*data, (*len).min(MAX_STRING_PREVIEW))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
