//! # Symbol Catalog
//!
//! Immutable lookups over the decoded metadata of one executable.
//!
//! The catalog answers three questions for the rest of the engine:
//!
//! - which type lives behind a runtime type-descriptor address ([`SymbolCatalog::type_at`])
//! - which globals exist and where ([`SymbolCatalog::globals_list`])
//! - which stack slots of a function may hold pointers ([`SymbolCatalog::frame_layout_for`])
//!
//! ## Usage
//!
//! ```rust
//! use heapdig_core::symbols::{CatalogBuilder, Field};
//! use heapdig_core::types::Address;
//!
//! let mut builder = CatalogBuilder::new(8);
//! let int = builder.scalar("int", heapdig_core::symbols::ScalarKind::Int, 8);
//! let node = builder.declare("main.node", Some(16));
//! let next = builder.pointer_to(node);
//! builder.define(
//!     node,
//!     heapdig_core::symbols::TypeKind::Struct {
//!         fields: vec![Field::new("next", 0, next), Field::new("value", 8, int)],
//!     },
//! );
//! builder.runtime_type(Address::new(0x4a_0000), node);
//!
//! let catalog = builder.finish();
//! let ty = catalog.type_at(Address::new(0x4a_0000)).unwrap();
//! assert_eq!(ty.name, "main.node");
//! assert_eq!(catalog.field_path(ty.id, 8).as_deref(), Some("value"));
//! ```

use std::collections::HashMap;

use regex::Regex;

use super::types::{TypeDescriptor, TypeId, TypeKind};
use crate::diagnostics::Diagnostic;
use crate::error::{HeapdigError, Result};
use crate::types::Address;

const MAX_FIELD_PATH_DEPTH: usize = 32;

/// A package-level variable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Global
{
    pub name: String,
    pub address: Address,
    pub ty: TypeId,
}

/// Where a frame slot lives relative to the canonical frame address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotLocation
{
    /// Fixed offset for the whole function
    Cfa(i64),
    /// Offsets that only hold within the listed PC ranges
    Ranged(Vec<RangedOffset>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangedOffset
{
    pub start: Address,
    pub end: Address,
    pub cfa_offset: i64,
}

impl SlotLocation
{
    /// CFA offset of the slot while executing at `pc`
    pub fn cfa_offset_at(&self, pc: Address) -> Option<i64>
    {
        match self {
            SlotLocation::Cfa(offset) => Some(*offset),
            SlotLocation::Ranged(ranges) => ranges
                .iter()
                .find(|range| range.start <= pc && pc < range.end)
                .map(|range| range.cfa_offset),
        }
    }
}

/// One local variable or parameter with a stack home
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSlot
{
    pub name: String,
    pub ty: TypeId,
    pub location: SlotLocation,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameLayout
{
    pub slots: Vec<FrameSlot>,
}

/// A function's code range and frame layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInfo
{
    pub name: String,
    pub entry: Address,
    /// One past the last instruction
    pub end: Address,
    pub frame: FrameLayout,
}

impl FunctionInfo
{
    pub fn contains(&self, pc: Address) -> bool
    {
        self.entry <= pc && pc < self.end
    }
}

/// Types the graph builder needs even when the metadata never names them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WellKnownTypes
{
    pub uint8: TypeId,
    pub uintptr: TypeId,
    pub unsafe_pointer: TypeId,
    pub funcval: TypeId,
}

/// Decoded type, global and frame metadata
///
/// Built once by [`CatalogBuilder::finish`](super::CatalogBuilder::finish) and
/// never mutated afterwards, so it can be shared by reference across graph
/// workers.
#[derive(Debug)]
pub struct SymbolCatalog
{
    pub(super) pointer_size: u64,
    pub(super) types: Vec<TypeDescriptor>,
    pub(super) by_name: HashMap<String, TypeId>,
    pub(super) runtime_types: HashMap<Address, TypeId>,
    pub(super) globals: Vec<Global>,
    pub(super) functions: Vec<FunctionInfo>,
    pub(super) itab_type_offset: u64,
    pub(super) well_known: WellKnownTypes,
    pub(super) diagnostics: Vec<Diagnostic>,
}

impl SymbolCatalog
{
    pub fn pointer_size(&self) -> u64
    {
        self.pointer_size
    }

    /// Descriptor for an id handed out by this catalog.
    ///
    /// ## Panics
    ///
    /// Panics if `id` came from a different catalog.
    pub fn descriptor(&self, id: TypeId) -> &TypeDescriptor
    {
        &self.types[id.index()]
    }

    pub fn types(&self) -> &[TypeDescriptor]
    {
        &self.types
    }

    /// Resolve a runtime type-descriptor address
    ///
    /// ## Errors
    ///
    /// `UnknownConcreteType` if no type was registered at `descriptor`.
    pub fn type_at(&self, descriptor: Address) -> Result<&TypeDescriptor>
    {
        self.runtime_types
            .get(&descriptor)
            .map(|id| self.descriptor(*id))
            .ok_or(HeapdigError::UnknownConcreteType { descriptor })
    }

    pub fn runtime_type_count(&self) -> usize
    {
        self.runtime_types.len()
    }

    /// Every global as `(name, address, type)`, ordered by address
    pub fn globals_list(&self) -> impl Iterator<Item = (&str, Address, &TypeDescriptor)>
    {
        self.globals
            .iter()
            .map(|global| (global.name.as_str(), global.address, self.descriptor(global.ty)))
    }

    pub fn globals(&self) -> &[Global]
    {
        &self.globals
    }

    /// Frame layout of the function whose first instruction is `entry`
    pub fn frame_layout_for(&self, entry: Address) -> Option<&FrameLayout>
    {
        self.functions
            .binary_search_by_key(&entry, |function| function.entry)
            .ok()
            .map(|index| &self.functions[index].frame)
    }

    pub fn function_containing(&self, pc: Address) -> Option<&FunctionInfo>
    {
        let index = self.functions.partition_point(|function| function.entry <= pc);
        index
            .checked_sub(1)
            .map(|index| &self.functions[index])
            .filter(|function| function.contains(pc))
    }

    pub fn functions(&self) -> &[FunctionInfo]
    {
        &self.functions
    }

    pub fn type_by_name(&self, name: &str) -> Option<&TypeDescriptor>
    {
        self.by_name.get(name).map(|id| self.descriptor(*id))
    }

    pub fn types_matching<'a>(&'a self, pattern: &'a Regex) -> impl Iterator<Item = &'a TypeDescriptor> + 'a
    {
        self.types.iter().filter(move |ty| pattern.is_match(&ty.name))
    }

    /// Offset of the concrete type word inside an itab
    pub fn itab_type_offset(&self) -> u64
    {
        self.itab_type_offset
    }

    pub fn well_known(&self) -> WellKnownTypes
    {
        self.well_known
    }

    /// Problems found while decoding the metadata
    pub fn diagnostics(&self) -> &[Diagnostic]
    {
        &self.diagnostics
    }

    /// Name the field that covers byte `offset` of a value of type `ty`
    ///
    /// Nested members are joined with `.` and array elements use `[i]`, for
    /// example `items[3].name`. Returns `None` when `offset` does not fall in a
    /// named member.
    pub fn field_path(&self, ty: TypeId, offset: u64) -> Option<String>
    {
        let mut path = String::new();
        let mut current = self.descriptor(ty);
        let mut remaining = offset;
        let word = self.pointer_size;

        for _ in 0..MAX_FIELD_PATH_DEPTH {
            let (segment, next, inner) = match &current.kind {
                TypeKind::Struct { fields } => {
                    let Some(field) = fields.iter().find(|field| {
                        let size = self.descriptor(field.ty).size;
                        remaining >= field.offset && remaining - field.offset < size.max(1)
                    }) else {
                        break;
                    };
                    (field.name.clone(), Some(field.ty), remaining - field.offset)
                }
                TypeKind::Array { elem, count } => {
                    let elem_size = self.descriptor(*elem).size;
                    if elem_size == 0 || remaining / elem_size >= *count {
                        break;
                    }
                    (format!("[{}]", remaining / elem_size), Some(*elem), remaining % elem_size)
                }
                TypeKind::String => (word_name(remaining, word, &["str", "len"]), None, 0),
                TypeKind::Slice { .. } => (word_name(remaining, word, &["array", "len", "cap"]), None, 0),
                TypeKind::Interface { empty } => {
                    let names: &[&str] = if *empty { &["_type", "data"] } else { &["tab", "data"] };
                    (word_name(remaining, word, names), None, 0)
                }
                _ => break,
            };

            if segment.is_empty() {
                break;
            }
            if !path.is_empty() && !segment.starts_with('[') {
                path.push('.');
            }
            path.push_str(&segment);

            match next {
                Some(next) => {
                    current = self.descriptor(next);
                    remaining = inner;
                }
                None => break,
            }
        }

        (!path.is_empty()).then_some(path)
    }
}

fn word_name(offset: u64, word: u64, names: &[&str]) -> String
{
    usize::try_from(offset / word.max(1))
        .ok()
        .and_then(|index| names.get(index))
        .map(|name| (*name).to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::symbols::{CatalogBuilder, Field, ScalarKind};

    fn sample() -> (SymbolCatalog, TypeId, TypeId)
    {
        let mut builder = CatalogBuilder::new(8);
        let int = builder.scalar("int", ScalarKind::Int, 8);
        let string = builder.string();
        let item = builder.structure(
            "main.item",
            24,
            vec![Field::new("name", 0, string), Field::new("count", 16, int)],
        );
        let items = builder.array_of(item, 4);
        let bag = builder.structure("main.bag", 96, vec![Field::new("items", 0, items)]);
        builder.runtime_type(Address::new(0x1000), bag);
        builder.runtime_type(Address::new(0x1000), item);
        builder.add_function(FunctionInfo {
            name: "main.main".to_string(),
            entry: Address::new(0x40_0000),
            end: Address::new(0x40_0100),
            frame: FrameLayout::default(),
        });
        builder.add_function(FunctionInfo {
            name: "main.helper".to_string(),
            entry: Address::new(0x40_0200),
            end: Address::new(0x40_0280),
            frame: FrameLayout::default(),
        });
        (builder.finish(), bag, item)
    }

    #[test]
    fn test_type_at_first_registration_wins()
    {
        let (catalog, bag, _) = sample();
        assert_eq!(catalog.type_at(Address::new(0x1000)).unwrap().id, bag);
        assert!(matches!(
            catalog.type_at(Address::new(0x2000)),
            Err(HeapdigError::UnknownConcreteType { .. })
        ));
    }

    #[test]
    fn test_field_path_nested()
    {
        let (catalog, bag, item) = sample();
        assert_eq!(catalog.field_path(bag, 24 * 3 + 16).as_deref(), Some("items[3].count"));
        assert_eq!(catalog.field_path(bag, 24 + 8).as_deref(), Some("items[1].name.len"));
        assert_eq!(catalog.field_path(item, 0).as_deref(), Some("name.str"));
    }

    #[test]
    fn test_function_lookup()
    {
        let (catalog, _, _) = sample();
        assert_eq!(
            catalog.function_containing(Address::new(0x40_0210)).map(|f| f.name.as_str()),
            Some("main.helper")
        );
        assert!(catalog.function_containing(Address::new(0x40_0150)).is_none());
        assert!(catalog.frame_layout_for(Address::new(0x40_0000)).is_some());
        assert!(catalog.frame_layout_for(Address::new(0x40_0001)).is_none());
    }

    #[test]
    fn test_types_matching()
    {
        let (catalog, _, _) = sample();
        let pattern = Regex::new(r"^main\.").unwrap();
        let names: Vec<_> = catalog.types_matching(&pattern).map(|ty| ty.name.as_str()).collect();
        assert_eq!(names, vec!["main.item", "main.bag"]);
    }
}
