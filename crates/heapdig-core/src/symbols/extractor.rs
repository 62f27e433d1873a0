//! Go DWARF decoding into a [`CatalogBuilder`].
//!
//! Type DIEs are registered with an id the first time anything refers to
//! them and defined later from a worklist, so self-referential types never
//! recurse. A DIE that cannot be decoded degrades to an unknown type and the
//! walk carries on.

use std::collections::HashMap;

use gimli::{
    constants, AttributeValue, DebuggingInformationEntry, DwAt, DwTag, Encoding, Expression, Operation, Unit,
    UnitOffset, UnitSectionOffset,
};
use tracing::{debug, trace};

use super::builder::CatalogBuilder;
use super::catalog::{FrameLayout, FrameSlot, FunctionInfo, RangedOffset, SlotLocation};
use super::types::{Field, ScalarKind, TypeId, TypeKind};
use super::{OwnedDwarf, OwnedReader};
use crate::diagnostics::Diagnostic;
use crate::error::{map_dwarf_error, Result};
use crate::types::Address;

const MAX_TYPE_REF_DEPTH: usize = 32;

/// Compiler vendor attribute carrying the runtime kind of a type.
const DW_AT_GO_KIND: DwAt = DwAt(0x2900);
/// Compiler vendor attribute carrying the address of the runtime type descriptor.
const DW_AT_GO_RUNTIME_TYPE: DwAt = DwAt(0x2904);

const GO_KIND_CHAN: u64 = 18;
const GO_KIND_FUNC: u64 = 19;
const GO_KIND_MAP: u64 = 21;
const GO_KIND_SLICE: u64 = 23;
const GO_KIND_STRING: u64 = 24;

const GO_PRODUCER: &str = "Go cmd/compile";

type Die<'abbrev, 'unit> = DebuggingInformationEntry<'abbrev, 'unit, OwnedReader>;

struct UnitEntry
{
    unit: Unit<OwnedReader>,
    /// Offset of the unit header in `.debug_info`
    start: usize,
    go: bool,
}

impl UnitEntry
{
    fn global(&self, offset: UnitOffset<usize>) -> usize
    {
        self.start + offset.0
    }

    fn encoding(&self) -> Encoding
    {
        self.unit.header.encoding()
    }
}

/// Types declared so far and the DIEs still waiting to be defined
struct TypeTable
{
    builder: CatalogBuilder,
    ids: HashMap<usize, TypeId>,
    pending: Vec<usize>,
}

enum Decoded
{
    Kind(TypeKind),
    Alias(TypeId),
    Malformed(String),
}

struct OpenFunction
{
    depth: isize,
    info: FunctionInfo,
    skipped: usize,
}

pub(crate) struct CatalogExtractor<'a>
{
    dwarf: &'a OwnedDwarf,
    units: Vec<UnitEntry>,
}

impl<'a> CatalogExtractor<'a>
{
    pub(crate) fn new(dwarf: &'a OwnedDwarf) -> Result<Self>
    {
        let mut units = Vec::new();
        let mut headers = dwarf.units();
        while let Some(header) = headers
            .next()
            .map_err(|err| map_dwarf_error("reading .debug_info unit header", err))?
        {
            let start = match header.offset() {
                UnitSectionOffset::DebugInfoOffset(offset) => offset.0,
                UnitSectionOffset::DebugTypesOffset(_) => continue,
            };
            let unit = dwarf
                .unit(header)
                .map_err(|err| map_dwarf_error("parsing compilation unit", err))?;
            let go = is_go_unit(dwarf, &unit)?;
            units.push(UnitEntry { unit, start, go });
        }
        units.sort_by_key(|entry| entry.start);

        Ok(Self { dwarf, units })
    }

    /// Decode every Go compilation unit into a catalog builder
    pub(crate) fn extract(&self, pointer_size: u64) -> Result<CatalogBuilder>
    {
        let mut table = TypeTable {
            builder: CatalogBuilder::new(pointer_size),
            ids: HashMap::new(),
            pending: Vec::new(),
        };

        let mut skipped_units = 0usize;
        for entry in &self.units {
            if entry.go {
                self.scan_unit(entry, &mut table)?;
            } else {
                skipped_units += 1;
            }
        }

        while let Some(offset) = table.pending.pop() {
            let Some(id) = table.ids.get(&offset).copied() else {
                continue;
            };
            match self.define_type(offset, &mut table) {
                Ok(Decoded::Kind(kind)) => table.builder.define(id, kind),
                Ok(Decoded::Alias(target)) => table.builder.alias(id, target),
                Ok(Decoded::Malformed(reason)) => {
                    let name = table.builder.name_of(id).to_string();
                    table
                        .builder
                        .report(Diagnostic::metadata(format!("type {name} at DIE {offset:#x}: {reason}")));
                    table.builder.define(id, TypeKind::Unknown);
                }
                Err(err) => {
                    table
                        .builder
                        .report(Diagnostic::metadata(format!("type DIE {offset:#x}: {err}")));
                    table.builder.define(id, TypeKind::Unknown);
                }
            }
        }

        detect_itab_type_offset(&mut table.builder);

        debug!(
            units = self.units.len(),
            skipped_units,
            types = table.ids.len(),
            "decoded Go DWARF"
        );
        Ok(table.builder)
    }

    fn scan_unit(&self, entry: &UnitEntry, table: &mut TypeTable) -> Result<()>
    {
        let mut depth: isize = 0;
        let mut open: Option<OpenFunction> = None;
        let mut cursor = entry.unit.entries();

        while let Some((delta, die)) = cursor
            .next_dfs()
            .map_err(|err| map_dwarf_error("traversing DIE tree", err))?
        {
            depth += delta;
            if open.as_ref().is_some_and(|function| depth <= function.depth) {
                close_function(open.take(), table);
            }

            match die.tag() {
                constants::DW_TAG_base_type
                | constants::DW_TAG_pointer_type
                | constants::DW_TAG_structure_type
                | constants::DW_TAG_array_type
                | constants::DW_TAG_typedef
                | constants::DW_TAG_subroutine_type => {
                    self.id_for(entry.global(die.offset()), table)?;
                }
                constants::DW_TAG_subprogram => {
                    open = self.open_function(entry, die, depth)?;
                }
                constants::DW_TAG_variable | constants::DW_TAG_formal_parameter => match open.as_mut() {
                    Some(function) => self.frame_slot(entry, die, function, table)?,
                    None if die.tag() == constants::DW_TAG_variable => self.global(entry, die, table)?,
                    None => {}
                },
                _ => {}
            }
        }
        close_function(open, table);
        Ok(())
    }

    fn open_function(&self, entry: &UnitEntry, die: &Die<'_, '_>, depth: isize) -> Result<Option<OpenFunction>>
    {
        let Some(low) = die
            .attr_value(constants::DW_AT_low_pc)
            .map_err(|err| map_dwarf_error("reading DW_AT_low_pc", err))?
        else {
            return Ok(None);
        };
        let Some(low) = self
            .dwarf
            .attr_address(&entry.unit, low)
            .map_err(|err| map_dwarf_error("resolving DW_AT_low_pc", err))?
        else {
            return Ok(None);
        };
        let high = match die
            .attr(constants::DW_AT_high_pc)
            .map_err(|err| map_dwarf_error("reading DW_AT_high_pc", err))?
        {
            Some(attr) => match attr.value() {
                AttributeValue::Addr(address) => Some(address),
                _ => attr.udata_value().map(|length| low.saturating_add(length)),
            },
            None => None,
        };
        let Some(high) = high else {
            return Ok(None);
        };

        let name = self.entry_name(entry, die)?.unwrap_or_default();
        trace!(%name, low, high, "function");
        Ok(Some(OpenFunction {
            depth,
            info: FunctionInfo {
                name,
                entry: Address::new(low),
                end: Address::new(high),
                frame: FrameLayout::default(),
            },
            skipped: 0,
        }))
    }

    fn frame_slot(&self, entry: &UnitEntry, die: &Die<'_, '_>, function: &mut OpenFunction, table: &mut TypeTable) -> Result<()>
    {
        let Some(ty) = self.type_ref(entry, die)? else {
            return Ok(());
        };
        let location = match die
            .attr_value(constants::DW_AT_location)
            .map_err(|err| map_dwarf_error("reading DW_AT_location", err))?
        {
            Some(AttributeValue::Exprloc(expr)) => cfa_offset(expr, entry.encoding()).map(SlotLocation::Cfa),
            Some(
                value @ (AttributeValue::LocationListsRef(_)
                | AttributeValue::SecOffset(_)
                | AttributeValue::DebugLocListsIndex(_)),
            ) => self.ranged_location(entry, value)?,
            // Optimized out.
            _ => return Ok(()),
        };
        let Some(location) = location else {
            function.skipped += 1;
            return Ok(());
        };

        let name = self.entry_name(entry, die)?.unwrap_or_default();
        let ty = self.id_for(ty, table)?;
        function.info.frame.slots.push(FrameSlot { name, ty, location });
        Ok(())
    }

    fn ranged_location(&self, entry: &UnitEntry, value: AttributeValue<OwnedReader>) -> Result<Option<SlotLocation>>
    {
        let Some(mut locations) = self
            .dwarf
            .attr_locations(&entry.unit, value)
            .map_err(|err| map_dwarf_error("resolving location list", err))?
        else {
            return Ok(None);
        };

        let mut ranges = Vec::new();
        while let Some(location) = locations
            .next()
            .map_err(|err| map_dwarf_error("reading location list entry", err))?
        {
            if let Some(cfa_offset) = cfa_offset(location.data, entry.encoding()) {
                ranges.push(RangedOffset {
                    start: Address::new(location.range.begin),
                    end: Address::new(location.range.end),
                    cfa_offset,
                });
            }
        }
        Ok((!ranges.is_empty()).then_some(SlotLocation::Ranged(ranges)))
    }

    fn global(&self, entry: &UnitEntry, die: &Die<'_, '_>, table: &mut TypeTable) -> Result<()>
    {
        let Some(AttributeValue::Exprloc(expr)) = die
            .attr_value(constants::DW_AT_location)
            .map_err(|err| map_dwarf_error("reading DW_AT_location", err))?
        else {
            return Ok(());
        };
        let mut operations = expr.operations(entry.encoding());
        let Ok(Some(Operation::Address { address })) = operations.next() else {
            return Ok(());
        };
        let Some(ty) = self.type_ref(entry, die)? else {
            return Ok(());
        };
        // Linker markers such as runtime.data and runtime.edata.
        if self.tag_at(ty)? == Some(constants::DW_TAG_unspecified_type) {
            return Ok(());
        }
        let Some(name) = self.entry_name(entry, die)? else {
            return Ok(());
        };

        let ty = self.id_for(ty, table)?;
        table.builder.global(name, Address::new(address), ty);
        Ok(())
    }

    /// Id for the type DIE at `offset`, declaring it on first sight
    fn id_for(&self, offset: usize, table: &mut TypeTable) -> Result<TypeId>
    {
        if let Some(id) = table.ids.get(&offset) {
            return Ok(*id);
        }

        let Some((entry, local)) = self.locate(offset) else {
            let id = table.builder.declare(format!("<type@{offset:#x}>"), None);
            table.ids.insert(offset, id);
            return Ok(id);
        };
        let die = entry
            .unit
            .entry(local)
            .map_err(|err| map_dwarf_error("resolving type reference", err))?;

        let name = match self.entry_name(entry, &die)? {
            Some(name) => name,
            None if die.tag() == constants::DW_TAG_pointer_type && self.type_ref(entry, &die)?.is_none() => {
                "unsafe.Pointer".to_string()
            }
            None => format!("<type@{offset:#x}>"),
        };
        let size = die
            .attr(constants::DW_AT_byte_size)
            .map_err(|err| map_dwarf_error("reading DW_AT_byte_size", err))?
            .and_then(|attr| attr.udata_value());
        let runtime_type = match die
            .attr(DW_AT_GO_RUNTIME_TYPE)
            .map_err(|err| map_dwarf_error("reading DW_AT_go_runtime_type", err))?
        {
            Some(attr) => match attr.value() {
                AttributeValue::Addr(address) => Some(address),
                _ => attr.udata_value(),
            },
            None => None,
        };

        let id = table.builder.declare(name, size);
        table.ids.insert(offset, id);
        table.pending.push(offset);
        if let Some(address) = runtime_type.filter(|address| *address != 0) {
            table.builder.runtime_type(Address::new(address), id);
        }
        Ok(id)
    }

    fn define_type(&self, offset: usize, table: &mut TypeTable) -> Result<Decoded>
    {
        let Some((entry, local)) = self.locate(offset) else {
            return Ok(Decoded::Malformed("offset outside .debug_info".to_string()));
        };
        let die = entry
            .unit
            .entry(local)
            .map_err(|err| map_dwarf_error("reading type DIE", err))?;
        let go_kind = die
            .attr(DW_AT_GO_KIND)
            .map_err(|err| map_dwarf_error("reading DW_AT_go_kind", err))?
            .and_then(|attr| attr.udata_value());

        match die.tag() {
            constants::DW_TAG_base_type => Ok(self.base_type(&die)?),
            constants::DW_TAG_pointer_type => {
                let Some(target) = self.type_ref(entry, &die)? else {
                    return Ok(Decoded::Kind(TypeKind::Pointer { elem: None }));
                };
                // Func values are pointers to a subroutine type.
                if self.resolve_tag(target)? == Some(constants::DW_TAG_subroutine_type) {
                    return Ok(Decoded::Kind(TypeKind::Function));
                }
                Ok(Decoded::Kind(TypeKind::Pointer {
                    elem: Some(self.id_for(target, table)?),
                }))
            }
            constants::DW_TAG_subroutine_type => Ok(Decoded::Kind(TypeKind::Function)),
            constants::DW_TAG_array_type => self.array_type(entry, local, &die, table),
            constants::DW_TAG_structure_type => self.struct_type(entry, local, &die, go_kind, table),
            constants::DW_TAG_typedef => {
                let target = self.type_ref(entry, &die)?;
                match go_kind {
                    Some(GO_KIND_MAP) => {
                        let header = self.pointee_id(target, table)?;
                        Ok(Decoded::Kind(TypeKind::Map { header }))
                    }
                    Some(GO_KIND_CHAN) => {
                        let header = self.pointee_id(target, table)?;
                        Ok(Decoded::Kind(TypeKind::Channel { header }))
                    }
                    Some(GO_KIND_FUNC) => Ok(Decoded::Kind(TypeKind::Function)),
                    _ => match target {
                        Some(target) => Ok(Decoded::Alias(self.id_for(target, table)?)),
                        None => Ok(Decoded::Malformed("typedef without a target type".to_string())),
                    },
                }
            }
            tag => Ok(Decoded::Malformed(format!("unsupported tag {tag}"))),
        }
    }

    fn base_type(&self, die: &Die<'_, '_>) -> Result<Decoded>
    {
        let encoding = die
            .attr_value(constants::DW_AT_encoding)
            .map_err(|err| map_dwarf_error("reading DW_AT_encoding", err))?;
        let scalar = match encoding {
            Some(AttributeValue::Encoding(constants::DW_ATE_boolean)) => ScalarKind::Bool,
            Some(AttributeValue::Encoding(constants::DW_ATE_signed | constants::DW_ATE_signed_char)) => ScalarKind::Int,
            Some(AttributeValue::Encoding(constants::DW_ATE_unsigned | constants::DW_ATE_unsigned_char)) => {
                ScalarKind::Uint
            }
            Some(AttributeValue::Encoding(constants::DW_ATE_float)) => ScalarKind::Float,
            Some(AttributeValue::Encoding(constants::DW_ATE_complex_float)) => ScalarKind::Complex,
            other => return Ok(Decoded::Malformed(format!("unsupported base encoding {other:?}"))),
        };
        Ok(Decoded::Kind(TypeKind::Scalar(scalar)))
    }

    fn array_type(
        &self,
        entry: &UnitEntry,
        local: UnitOffset<usize>,
        die: &Die<'_, '_>,
        table: &mut TypeTable,
    ) -> Result<Decoded>
    {
        let Some(elem) = self.type_ref(entry, die)? else {
            return Ok(Decoded::Malformed("array without an element type".to_string()));
        };

        let mut count = None;
        let mut tree = entry
            .unit
            .entries_tree(Some(local))
            .map_err(|err| map_dwarf_error("building array tree", err))?;
        let root = tree.root().map_err(|err| map_dwarf_error("navigating array root", err))?;
        let mut children = root.children();
        while let Some(child) = children
            .next()
            .map_err(|err| map_dwarf_error("iterating array children", err))?
        {
            let child = child.entry();
            if child.tag() != constants::DW_TAG_subrange_type {
                continue;
            }
            if let Some(attr) = child
                .attr(constants::DW_AT_count)
                .map_err(|err| map_dwarf_error("reading DW_AT_count", err))?
            {
                count = attr.udata_value();
            } else if let Some(attr) = child
                .attr(constants::DW_AT_upper_bound)
                .map_err(|err| map_dwarf_error("reading DW_AT_upper_bound", err))?
            {
                count = match attr.sdata_value() {
                    Some(bound) if bound < 0 => Some(0),
                    _ => attr.udata_value().map(|bound| bound + 1),
                };
            }
        }

        match count {
            Some(count) => Ok(Decoded::Kind(TypeKind::Array {
                elem: self.id_for(elem, table)?,
                count,
            })),
            None => Ok(Decoded::Malformed("array without a length".to_string())),
        }
    }

    fn struct_type(
        &self,
        entry: &UnitEntry,
        local: UnitOffset<usize>,
        die: &Die<'_, '_>,
        go_kind: Option<u64>,
        table: &mut TypeTable,
    ) -> Result<Decoded>
    {
        let name = self.entry_name(entry, die)?.unwrap_or_default();
        match name.as_str() {
            "runtime.eface" => return Ok(Decoded::Kind(TypeKind::Interface { empty: true })),
            "runtime.iface" => return Ok(Decoded::Kind(TypeKind::Interface { empty: false })),
            "string" => return Ok(Decoded::Kind(TypeKind::String)),
            _ if go_kind == Some(GO_KIND_STRING) => return Ok(Decoded::Kind(TypeKind::String)),
            _ => {}
        }

        let mut members = Vec::new();
        let mut tree = entry
            .unit
            .entries_tree(Some(local))
            .map_err(|err| map_dwarf_error("building struct tree", err))?;
        let root = tree.root().map_err(|err| map_dwarf_error("navigating struct root", err))?;
        let mut children = root.children();
        while let Some(child) = children
            .next()
            .map_err(|err| map_dwarf_error("iterating struct children", err))?
        {
            let child = child.entry();
            if child.tag() != constants::DW_TAG_member {
                continue;
            }
            let member_name = self.entry_name(entry, child)?.unwrap_or_default();
            let offset = child
                .attr(constants::DW_AT_data_member_location)
                .map_err(|err| map_dwarf_error("reading DW_AT_data_member_location", err))?
                .and_then(|attr| attr.udata_value());
            let ty = self.type_ref(entry, child)?;
            members.push((member_name, offset, ty));
        }

        if name.starts_with("[]") || go_kind == Some(GO_KIND_SLICE) {
            let array = members
                .iter()
                .find(|(member, _, _)| member == "array")
                .and_then(|(_, _, ty)| *ty);
            return match self.pointee_id(array, table)? {
                Some(elem) => Ok(Decoded::Kind(TypeKind::Slice { elem })),
                None => Ok(Decoded::Malformed("slice without an element type".to_string())),
            };
        }

        let mut fields = Vec::with_capacity(members.len());
        for (member, offset, ty) in members {
            let (Some(offset), Some(ty)) = (offset, ty) else {
                return Ok(Decoded::Malformed(format!("member {member} lacks an offset or type")));
            };
            fields.push(Field::new(member, offset, self.id_for(ty, table)?));
        }
        Ok(Decoded::Kind(TypeKind::Struct { fields }))
    }

    /// Id of the type a pointer DIE (possibly behind typedefs) points to
    fn pointee_id(&self, pointer: Option<usize>, table: &mut TypeTable) -> Result<Option<TypeId>>
    {
        let Some(mut offset) = pointer else {
            return Ok(None);
        };
        for _ in 0..MAX_TYPE_REF_DEPTH {
            let Some((entry, local)) = self.locate(offset) else {
                return Ok(None);
            };
            let die = entry
                .unit
                .entry(local)
                .map_err(|err| map_dwarf_error("following pointer type", err))?;
            let Some(next) = self.type_ref(entry, &die)? else {
                return Ok(None);
            };
            match die.tag() {
                constants::DW_TAG_typedef => offset = next,
                constants::DW_TAG_pointer_type => return Ok(Some(self.id_for(next, table)?)),
                _ => return Ok(None),
            }
        }
        Ok(None)
    }

    /// Tag of the DIE at `offset` after following typedefs
    fn resolve_tag(&self, mut offset: usize) -> Result<Option<DwTag>>
    {
        for _ in 0..MAX_TYPE_REF_DEPTH {
            let Some((entry, local)) = self.locate(offset) else {
                return Ok(None);
            };
            let die = entry
                .unit
                .entry(local)
                .map_err(|err| map_dwarf_error("resolving typedef chain", err))?;
            if die.tag() != constants::DW_TAG_typedef {
                return Ok(Some(die.tag()));
            }
            match self.type_ref(entry, &die)? {
                Some(next) => offset = next,
                None => return Ok(None),
            }
        }
        Ok(None)
    }

    fn tag_at(&self, offset: usize) -> Result<Option<DwTag>>
    {
        let Some((entry, local)) = self.locate(offset) else {
            return Ok(None);
        };
        let die = entry
            .unit
            .entry(local)
            .map_err(|err| map_dwarf_error("reading DIE tag", err))?;
        Ok(Some(die.tag()))
    }

    /// `.debug_info` offset of the DIE named by `DW_AT_type`
    fn type_ref(&self, entry: &UnitEntry, die: &Die<'_, '_>) -> Result<Option<usize>>
    {
        let value = die
            .attr_value(constants::DW_AT_type)
            .map_err(|err| map_dwarf_error("reading DW_AT_type", err))?;
        Ok(match value {
            Some(AttributeValue::UnitRef(offset)) => Some(entry.global(offset)),
            Some(AttributeValue::DebugInfoRef(offset)) => Some(offset.0),
            _ => None,
        })
    }

    fn locate(&self, offset: usize) -> Option<(&UnitEntry, UnitOffset<usize>)>
    {
        let index = self.units.partition_point(|entry| entry.start <= offset).checked_sub(1)?;
        let entry = &self.units[index];
        Some((entry, UnitOffset(offset - entry.start)))
    }

    fn entry_name(&self, entry: &UnitEntry, die: &Die<'_, '_>) -> Result<Option<String>>
    {
        match die
            .attr_value(constants::DW_AT_name)
            .map_err(|err| map_dwarf_error("reading DW_AT_name", err))?
        {
            Some(value) => Ok(Some(attr_to_string(self.dwarf, &entry.unit, value)?)),
            None => Ok(None),
        }
    }
}

fn is_go_unit(dwarf: &OwnedDwarf, unit: &Unit<OwnedReader>) -> Result<bool>
{
    let mut cursor = unit.entries();
    let Some((_, root)) = cursor
        .next_dfs()
        .map_err(|err| map_dwarf_error("reading unit root", err))?
    else {
        return Ok(false);
    };
    match root
        .attr_value(constants::DW_AT_producer)
        .map_err(|err| map_dwarf_error("reading DW_AT_producer", err))?
    {
        Some(value) => Ok(attr_to_string(dwarf, unit, value)?.contains(GO_PRODUCER)),
        None => Ok(false),
    }
}

fn attr_to_string(dwarf: &OwnedDwarf, unit: &Unit<OwnedReader>, value: AttributeValue<OwnedReader>) -> Result<String>
{
    use gimli::Reader;

    let reader = dwarf
        .attr_string(unit, value)
        .map_err(|err| map_dwarf_error("resolving DWARF string", err))?;
    let owned = match reader.to_string() {
        Ok(cow) => cow.into_owned(),
        Err(_) => reader
            .to_string_lossy()
            .map_err(|err| map_dwarf_error("decoding DWARF string", err))?
            .into_owned(),
    };
    Ok(owned)
}

fn close_function(open: Option<OpenFunction>, table: &mut TypeTable)
{
    let Some(function) = open else {
        return;
    };
    if function.skipped > 0 {
        table.builder.report(Diagnostic::metadata(format!(
            "{}: {} variables kept in registers or pieces have no stack slot",
            function.info.name, function.skipped
        )));
    }
    table.builder.add_function(function.info);
}

/// Offset from the CFA for `DW_OP_call_frame_cfa [c DW_OP_plus]` or `DW_OP_fbreg c`
///
/// Go functions use the CFA as their frame base, so both forms name the same
/// slot. Anything else (registers, pieces, computed addresses) is `None`.
fn cfa_offset(expr: Expression<OwnedReader>, encoding: Encoding) -> Option<i64>
{
    let mut operations = expr.operations(encoding);
    let offset = match operations.next().ok()?? {
        Operation::CallFrameCFA => {
            let mut offset = 0i64;
            let mut operand = None;
            while let Some(operation) = operations.next().ok()? {
                match operation {
                    Operation::SignedConstant { value } => operand = Some(value),
                    Operation::UnsignedConstant { value } => operand = Some(i64::try_from(value).ok()?),
                    Operation::Plus => offset = offset.checked_add(operand.take()?)?,
                    Operation::PlusConstant { value } => offset = offset.checked_add(i64::try_from(value).ok()?)?,
                    _ => return None,
                }
            }
            if operand.is_some() {
                return None;
            }
            offset
        }
        Operation::FrameOffset { offset } => offset,
        _ => return None,
    };
    match operations.next() {
        Ok(None) => Some(offset),
        _ => None,
    }
}

fn detect_itab_type_offset(builder: &mut CatalogBuilder)
{
    for (name, field) in [("runtime.itab", "_type"), ("internal/abi.ITab", "Type")] {
        let offset = builder
            .find(name)
            .and_then(|id| builder.kind_of(id))
            .and_then(|kind| match kind {
                TypeKind::Struct { fields } => fields.iter().find(|f| f.name == field).map(|f| f.offset),
                _ => None,
            });
        if let Some(offset) = offset {
            builder.set_itab_type_offset(offset);
            return;
        }
    }
}
