//! # Symbols
//!
//! The type, global and frame catalogs decoded from the metadata file.
//!
//! [`MetadataImage`] owns the raw sections. [`SymbolCatalog`] is the
//! immutable result of decoding them, shared by reference with every later
//! stage. Tests and tools that have no DWARF at hand can assemble a catalog
//! directly with [`CatalogBuilder`].

mod builder;
mod catalog;
mod extractor;
mod image;
mod types;

use gimli::{Dwarf, EndianArcSlice, RunTimeEndian};

pub use builder::CatalogBuilder;
pub use catalog::{FrameLayout, FrameSlot, FunctionInfo, Global, RangedOffset, SlotLocation, SymbolCatalog, WellKnownTypes};
pub use image::{LineTable, MetadataImage, NoSourceLocations, SourceLocator};
pub use types::{Field, PointerLayout, ScalarKind, TypeDescriptor, TypeId, TypeKind};

pub(crate) type OwnedReader = EndianArcSlice<RunTimeEndian>;
pub(crate) type OwnedDwarf = Dwarf<OwnedReader>;
