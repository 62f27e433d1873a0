//! # Interface resolution
//!
//! An interface value is two words: a type word and a data word. Which of two
//! physical layouts the data word uses is never stored in the dump; it follows
//! from the shape of the concrete type alone.
//!
//! - **Direct**: the concrete value is exactly one pointer-shaped word, and
//!   the data word *is* that value.
//! - **Indirect**: anything else. The data word points at a separately
//!   allocated copy of the value.
//!
//! ```rust
//! use heapdig_core::iface::{encoding_of, Encoding};
//! use heapdig_core::symbols::{CatalogBuilder, Field, ScalarKind};
//!
//! let mut builder = CatalogBuilder::new(8);
//! let int = builder.scalar("int", ScalarKind::Int, 8);
//! let ptr = builder.pointer_to(int);
//! let wrapper = builder.structure("main.wrapper", 8, vec![Field::new("p", 0, ptr)]);
//! let pair = builder.structure("main.pair", 16, vec![Field::new("a", 0, int), Field::new("b", 8, int)]);
//! let catalog = builder.finish();
//!
//! assert_eq!(encoding_of(&catalog, wrapper), Encoding::Direct);
//! assert_eq!(encoding_of(&catalog, pair), Encoding::Indirect);
//! assert_eq!(encoding_of(&catalog, int), Encoding::Indirect);
//! ```

use std::fmt;

use crate::dump::SegmentMap;
use crate::error::{HeapdigError, Result};
use crate::symbols::{SymbolCatalog, TypeId, TypeKind};
use crate::types::Address;
use crate::value::TypedValue;

/// Nesting limit when looking through single-field wrappers
const MAX_WRAPPER_DEPTH: usize = 32;

/// Physical layout of an interface's data word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding
{
    /// The data word holds the concrete value itself
    Direct,
    /// The data word points to a boxed copy of the concrete value
    Indirect,
}

impl fmt::Display for Encoding
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Encoding::Direct => write!(f, "direct"),
            Encoding::Indirect => write!(f, "indirect"),
        }
    }
}

/// Layout used when a value of type `ty` is stored in an interface
pub fn encoding_of(catalog: &SymbolCatalog, ty: TypeId) -> Encoding
{
    if is_direct(catalog, ty, 0) {
        Encoding::Direct
    } else {
        Encoding::Indirect
    }
}

fn is_direct(catalog: &SymbolCatalog, ty: TypeId, depth: usize) -> bool
{
    if depth > MAX_WRAPPER_DEPTH {
        return false;
    }
    let descriptor = catalog.descriptor(ty);
    if descriptor.size != catalog.pointer_size() {
        return false;
    }
    match &descriptor.kind {
        TypeKind::Pointer { .. } | TypeKind::Map { .. } | TypeKind::Channel { .. } | TypeKind::Function => true,
        TypeKind::Struct { fields } => match fields.as_slice() {
            [only] => only.offset == 0 && is_direct(catalog, only.ty, depth + 1),
            _ => false,
        },
        TypeKind::Array { elem, count: 1 } => is_direct(catalog, *elem, depth + 1),
        _ => false,
    }
}

/// An interface value with its concrete type resolved
///
/// Computed whenever an interface is visited, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolymorphicValue
{
    /// Static interface type of the slot
    pub interface: TypeId,
    pub encoding: Encoding,
    pub concrete: TypeId,
    /// Runtime type descriptor the type word resolved to
    pub descriptor: Address,
    pub data: Address,
}

impl PolymorphicValue
{
    /// Address of the boxed copy, for indirect values
    pub fn boxed_address(&self) -> Option<Address>
    {
        match self.encoding {
            Encoding::Indirect if !self.data.is_null() => Some(self.data),
            _ => None,
        }
    }
}

/// Resolves interface values against the catalog
#[derive(Debug, Clone, Copy)]
pub struct InterfaceResolver<'a>
{
    segments: &'a SegmentMap,
    catalog: &'a SymbolCatalog,
}

impl<'a> InterfaceResolver<'a>
{
    pub fn new(segments: &'a SegmentMap, catalog: &'a SymbolCatalog) -> Self
    {
        Self { segments, catalog }
    }

    /// Runtime type descriptor named by an interface's type word
    ///
    /// Empty interfaces store the descriptor directly. Non-empty interfaces
    /// store an itab, which holds the descriptor at a fixed offset. `None`
    /// means the interface is nil.
    pub fn descriptor_address(&self, empty: bool, type_word: Address) -> Result<Option<Address>>
    {
        if type_word.is_null() {
            return Ok(None);
        }
        if empty {
            return Ok(Some(type_word));
        }
        let slot = type_word
            .checked_add(self.catalog.itab_type_offset())
            .ok_or(HeapdigError::OutOfBounds {
                address: type_word,
                length: self.catalog.pointer_size(),
            })?;
        let descriptor = self.segments.read_ptr(slot)?;
        Ok((!descriptor.is_null()).then_some(descriptor))
    }

    /// Resolve an interface-kind value
    ///
    /// Returns `Ok(None)` for a nil interface.
    ///
    /// ## Errors
    ///
    /// - `UnknownConcreteType` when the descriptor is not in the catalog
    /// - `OutOfBounds` when an itab cannot be read
    /// - `InvalidArgument` when `value` is not an interface
    pub fn resolve(&self, value: &TypedValue<'_>) -> Result<Option<PolymorphicValue>>
    {
        let descriptor = value.descriptor();
        let TypeKind::Interface { empty } = descriptor.kind else {
            return Err(HeapdigError::InvalidArgument(format!("{} is not an interface", descriptor.name)));
        };
        let ptr = self.catalog.pointer_size();
        let (Some(type_word), Some(data)) = (value.word_at(0), value.word_at(ptr)) else {
            return Err(HeapdigError::OutOfBounds {
                address: value.address().unwrap_or_default(),
                length: 2 * ptr,
            });
        };

        let Some(descriptor_address) = self.descriptor_address(empty, type_word)? else {
            return Ok(None);
        };
        let concrete = self.catalog.type_at(descriptor_address)?;

        Ok(Some(PolymorphicValue {
            interface: value.type_id(),
            encoding: encoding_of(self.catalog, concrete.id),
            concrete: concrete.id,
            descriptor: descriptor_address,
            data,
        }))
    }
}

#[cfg(test)]
mod tests
{
    use gimli::RunTimeEndian;

    use super::*;
    use crate::dump::{Permissions, Segment};
    use crate::symbols::{CatalogBuilder, Field, ScalarKind};
    use crate::types::Architecture;
    use crate::value::ValueReader;

    const DATA: u64 = 0x5_0000;
    const PAIR_TYPE: u64 = 0x4_1000;
    const PTR_TYPE: u64 = 0x4_2000;
    const ITAB: u64 = 0x4_3000;

    struct Fixture
    {
        segments: SegmentMap,
        catalog: SymbolCatalog,
        eface: TypeId,
        iface: TypeId,
        pair: TypeId,
        ptr: TypeId,
    }

    fn fixture(words: &[(u64, u64)]) -> Fixture
    {
        let mut builder = CatalogBuilder::new(8);
        let int = builder.scalar("int", ScalarKind::Int, 8);
        let ptr = builder.pointer_to(int);
        let pair = builder.structure("main.pair", 16, vec![Field::new("a", 0, int), Field::new("b", 8, int)]);
        let eface = builder.interface("interface {}", true);
        let iface = builder.interface("main.Shape", false);
        builder.runtime_type(Address::new(PAIR_TYPE), pair);
        builder.runtime_type(Address::new(PTR_TYPE), ptr);
        let catalog = builder.finish();

        let mut rodata = vec![0u8; 0x4000];
        rodata[0x3008..0x3010].copy_from_slice(&PAIR_TYPE.to_le_bytes());
        let mut data = vec![0u8; 0x100];
        for (offset, word) in words {
            let at = *offset as usize;
            data[at..at + 8].copy_from_slice(&word.to_le_bytes());
        }
        let segments = SegmentMap::new(
            Architecture::X86_64,
            RunTimeEndian::Little,
            vec![
                Segment::from_bytes(Address::new(0x4_0000), rodata, Permissions::READ_ONLY),
                Segment::from_bytes(Address::new(DATA), data, Permissions::READ_WRITE),
            ],
        )
        .unwrap();
        Fixture {
            segments,
            catalog,
            eface,
            iface,
            pair,
            ptr,
        }
    }

    #[test]
    fn test_encoding_shapes()
    {
        let mut builder = CatalogBuilder::new(8);
        let int = builder.scalar("int", ScalarKind::Int, 8);
        let uintptr = builder.scalar("uintptr", ScalarKind::Uint, 8);
        let ptr = builder.pointer_to(int);
        let unsafe_ptr = builder.unsafe_pointer();
        let map = builder.map("map[int]int", None);
        let chan = builder.channel("chan int", None);
        let func = builder.func("func()");
        let nested = builder.structure("main.outer", 8, vec![Field::new("inner", 0, ptr)]);
        let wrapped = builder.structure("main.wrapped", 8, vec![Field::new("w", 0, nested)]);
        let scalar_box = builder.structure("main.id", 8, vec![Field::new("n", 0, uintptr)]);
        let one = builder.array_of(ptr, 1);
        let two = builder.array_of(ptr, 2);
        let string = builder.string();
        let catalog = builder.finish();

        for direct in [ptr, unsafe_ptr, map, chan, func, nested, wrapped, one] {
            assert_eq!(encoding_of(&catalog, direct), Encoding::Direct, "{}", catalog.descriptor(direct).name);
        }
        for indirect in [int, uintptr, scalar_box, two, string] {
            assert_eq!(
                encoding_of(&catalog, indirect),
                Encoding::Indirect,
                "{}",
                catalog.descriptor(indirect).name
            );
        }
    }

    #[test]
    fn test_resolve_direct_eface()
    {
        let f = fixture(&[(0, PTR_TYPE), (8, 0xc000_1000)]);
        let reader = ValueReader::new(&f.segments, &f.catalog);
        let value = reader.read(Address::new(DATA), f.eface).unwrap();
        let resolved = InterfaceResolver::new(&f.segments, &f.catalog)
            .resolve(&value)
            .unwrap()
            .unwrap();

        assert_eq!(resolved.encoding, Encoding::Direct);
        assert_eq!(resolved.concrete, f.ptr);
        assert_eq!(resolved.data, Address::new(0xc000_1000));
        assert_eq!(resolved.boxed_address(), None);
    }

    #[test]
    fn test_resolve_indirect_through_itab()
    {
        let f = fixture(&[(0, ITAB), (8, 0xc000_2000)]);
        let reader = ValueReader::new(&f.segments, &f.catalog);
        let value = reader.read(Address::new(DATA), f.iface).unwrap();
        let resolved = InterfaceResolver::new(&f.segments, &f.catalog)
            .resolve(&value)
            .unwrap()
            .unwrap();

        assert_eq!(resolved.encoding, Encoding::Indirect);
        assert_eq!(resolved.concrete, f.pair);
        assert_eq!(resolved.descriptor, Address::new(PAIR_TYPE));
        assert_eq!(resolved.boxed_address(), Some(Address::new(0xc000_2000)));
    }

    #[test]
    fn test_nil_and_unknown()
    {
        let f = fixture(&[(0, 0), (8, 0), (16, 0x4_0ff0), (24, 0xc000_3000)]);
        let reader = ValueReader::new(&f.segments, &f.catalog);
        let resolver = InterfaceResolver::new(&f.segments, &f.catalog);

        let nil = reader.read(Address::new(DATA), f.eface).unwrap();
        assert_eq!(resolver.resolve(&nil).unwrap(), None);

        let unknown = reader.read(Address::new(DATA + 16), f.eface).unwrap();
        let err = resolver.resolve(&unknown).unwrap_err();
        assert!(matches!(err, HeapdigError::UnknownConcreteType { descriptor } if descriptor == Address::new(0x4_0ff0)));
    }
}
