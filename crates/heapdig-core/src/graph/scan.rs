//! Pointer discovery inside typed values.

use dashmap::DashSet;
use smallvec::{smallvec, SmallVec};

use super::EdgeFault;
use crate::diagnostics::{Diagnostic, DiagnosticKind};
use crate::dump::SegmentMap;
use crate::error::HeapdigError;
use crate::iface::{Encoding, InterfaceResolver};
use crate::roots::{Root, RootId, RootStorage};
use crate::symbols::{SymbolCatalog, TypeId, TypeKind};
use crate::types::Address;
use crate::value::{TypedValue, ValueReader};

/// Bytes read from the dump per chunk when scanning long runs
const SCAN_CHUNK_BYTES: u64 = 64 * 1024;
/// Map headers with more buckets than this are not expanded
const MAX_BUCKET_SHIFT: u64 = 40;

/// Sub-values of the value being scanned that still need a visit
type Pending = SmallVec<[(u64, TypeId); 16]>;

/// An address together with the typing it was discovered under
///
/// The registry dedups whole claims, not addresses. A backing array reached
/// through subslices of different lengths is therefore scanned once per
/// distinct length; finalize keeps only the widest claim as the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Claim
{
    pub address: Address,
    pub ty: TypeId,
    /// Number of consecutive values of `ty` to scan
    pub repeat: u64,
    /// Bytes covered, at least `repeat * size(ty)`
    pub extent: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum RawSource
{
    Root(RootId),
    Claim(Address),
}

/// An edge before objects are final
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct RawEdge
{
    pub source: RawSource,
    pub offset: u64,
    pub target: Address,
    pub fault: Option<EdgeFault>,
}

#[derive(Debug, Default)]
pub(crate) struct ScanOutput
{
    pub edges: Vec<RawEdge>,
    pub claims: Vec<Claim>,
    pub diagnostics: Vec<Diagnostic>,
}

impl ScanOutput
{
    pub fn merge(&mut self, other: ScanOutput)
    {
        self.edges.extend(other.edges);
        self.claims.extend(other.claims);
        self.diagnostics.extend(other.diagnostics);
    }
}

/// Where the value being scanned sits inside its edge source
#[derive(Debug, Clone, Copy)]
struct Origin
{
    source: RawSource,
    base: u64,
}

pub(crate) struct Scanner<'a>
{
    segments: &'a SegmentMap,
    catalog: &'a SymbolCatalog,
    reader: ValueReader<'a>,
    resolver: InterfaceResolver<'a>,
    registry: &'a DashSet<Claim>,
    /// Type used for `sync.entry.p`, which points at an `interface{}`
    eface: Option<TypeId>,
}

impl<'a> Scanner<'a>
{
    pub fn new(segments: &'a SegmentMap, catalog: &'a SymbolCatalog, registry: &'a DashSet<Claim>) -> Self
    {
        let eface = catalog
            .type_by_name("interface {}")
            .or_else(|| {
                catalog
                    .types()
                    .iter()
                    .find(|ty| ty.kind == TypeKind::Interface { empty: true })
            })
            .map(|ty| ty.id);
        Self {
            segments,
            catalog,
            reader: ValueReader::new(segments, catalog),
            resolver: InterfaceResolver::new(segments, catalog),
            registry,
            eface,
        }
    }

    pub fn scan_root(&self, root: &Root) -> ScanOutput
    {
        let mut out = ScanOutput::default();
        if !self.catalog.descriptor(root.ty).has_pointers() {
            return out;
        }
        let value = match &root.storage {
            RootStorage::Memory(address) => match self.reader.read(*address, root.ty) {
                Ok(value) => value,
                Err(err) => {
                    out.diagnostics.push(Diagnostic::new(
                        DiagnosticKind::OutOfBounds,
                        Some(*address),
                        format!("root {}: {err}", root.name),
                    ));
                    return out;
                }
            },
            RootStorage::Inline(bytes) => self.reader.inline(root.ty, bytes.clone()),
        };
        let origin = Origin {
            source: RawSource::Root(root.id),
            base: 0,
        };
        self.scan_value(&value, origin, &mut out);
        out
    }

    pub fn scan_claim(&self, claim: &Claim) -> ScanOutput
    {
        let mut out = ScanOutput::default();
        let descriptor = self.catalog.descriptor(claim.ty);
        if !descriptor.has_pointers() || descriptor.size == 0 {
            return out;
        }

        let per_chunk = (SCAN_CHUNK_BYTES / descriptor.size).max(1);
        let mut index = 0;
        while index < claim.repeat {
            let count = per_chunk.min(claim.repeat - index);
            let offset = index * descriptor.size;
            let start = claim.address.saturating_add(offset);
            match self.reader.read_many(start, claim.ty, count) {
                Ok(values) => {
                    for (value, element) in values.iter().zip(0u64..) {
                        let origin = Origin {
                            source: RawSource::Claim(claim.address),
                            base: offset + element * descriptor.size,
                        };
                        self.scan_value(value, origin, &mut out);
                    }
                }
                Err(err) => {
                    out.diagnostics.push(Diagnostic::new(
                        DiagnosticKind::OutOfBounds,
                        Some(start),
                        format!("{} at {}: {err}", descriptor.name, claim.address),
                    ));
                    break;
                }
            }
            index += count;
        }
        out
    }

    fn scan_value(&self, value: &TypedValue<'a>, origin: Origin, out: &mut ScanOutput)
    {
        let ptr = self.catalog.pointer_size();
        let mut pending: Pending = smallvec![(0u64, value.type_id())];

        while let Some((offset, ty)) = pending.pop() {
            let descriptor = self.catalog.descriptor(ty);
            if !descriptor.has_pointers() {
                continue;
            }
            let at = origin.base + offset;
            let word = |index: u64| value.word_at(offset + index * ptr).unwrap_or_default();

            match &descriptor.kind {
                TypeKind::Pointer { elem } => self.follow(origin.source, at, word(0), *elem, out),
                TypeKind::Map { header } | TypeKind::Channel { header } => {
                    self.follow(origin.source, at, word(0), *header, out);
                }
                TypeKind::Function => {
                    let funcval = self.catalog.well_known().funcval;
                    self.follow(origin.source, at, word(0), Some(funcval), out);
                }
                TypeKind::String => {
                    let (data, len) = (word(0), word(1).value());
                    if len > 0 {
                        let uint8 = self.catalog.well_known().uint8;
                        self.claim(origin.source, at, data, uint8, len, len, out);
                    }
                }
                TypeKind::Slice { elem } => {
                    let (data, len, cap) = (word(0), word(1).value(), word(2).value());
                    self.slice(origin.source, at, data, *elem, len, cap, out);
                }
                TypeKind::Interface { .. } => {
                    if let Ok(iface) = value.slice(offset, ty) {
                        self.interface(&iface, origin.source, at, offset, &mut pending, out);
                    }
                }
                TypeKind::Array { elem, count } => {
                    let stride = self.catalog.descriptor(*elem).size;
                    for index in (0..*count).rev() {
                        pending.push((offset + index * stride, *elem));
                    }
                }
                TypeKind::Struct { fields } => {
                    let special = self.runtime_struct(value, ty, offset, origin, out);
                    for field in fields.iter().rev() {
                        if !special.contains(&field.name.as_str()) {
                            pending.push((offset + field.offset, field.ty));
                        }
                    }
                }
                TypeKind::Scalar(_) | TypeKind::Unknown => {}
            }
        }
    }

    /// Expand runtime structures whose pointers type more than one value
    ///
    /// Returns the fields already handled here.
    fn runtime_struct(
        &self,
        value: &TypedValue<'a>,
        ty: TypeId,
        offset: u64,
        origin: Origin,
        out: &mut ScanOutput,
    ) -> Vec<&'static str>
    {
        let name = self.catalog.descriptor(ty).name.as_str();
        let special = name.starts_with("hash<") || name.starts_with("hchan<") || name == "sync.entry";
        if !special {
            return Vec::new();
        }
        let Ok(header) = value.slice(offset, ty) else {
            return Vec::new();
        };
        let field_offset = |field: &str| header.descriptor().field(field).map(|f| origin.base + offset + f.offset);

        if name.starts_with("hash<") {
            let Some(shift) = header.field("B").ok().and_then(|b| b.uint_at(0, 1)) else {
                return Vec::new();
            };
            if shift > MAX_BUCKET_SHIFT {
                return Vec::new();
            }
            for (field, count) in [("buckets", 1u64 << shift), ("oldbuckets", (1u64 << shift) >> 1)] {
                let Ok(pointer) = header.field(field) else {
                    continue;
                };
                let TypeKind::Pointer { elem: Some(bucket) } = pointer.descriptor().kind else {
                    continue;
                };
                let target = pointer.word_at(0).unwrap_or_default();
                let size = self.catalog.descriptor(bucket).size;
                if count > 0 {
                    if let (Some(at), Some(extent)) = (field_offset(field), size.checked_mul(count)) {
                        self.claim(origin.source, at, target, bucket, count, extent, out);
                    }
                }
            }
            return vec!["buckets", "oldbuckets"];
        }

        if name.starts_with("hchan<") {
            let (Ok(buf), Ok(elemtype), Ok(dataqsiz)) =
                (header.field("buf"), header.field("elemtype"), header.field("dataqsiz"))
            else {
                return Vec::new();
            };
            let target = buf.word_at(0).unwrap_or_default();
            let count = dataqsiz.word_at(0).unwrap_or_default().value();
            let Some(at) = field_offset("buf") else {
                return Vec::new();
            };
            let descriptor = elemtype.word_at(0).unwrap_or_default();
            match self.catalog.type_at(descriptor) {
                Ok(elem) if count > 0 && elem.size > 0 => {
                    if let Some(extent) = elem.size.checked_mul(count) {
                        self.claim(origin.source, at, target, elem.id, count, extent, out);
                    }
                }
                Ok(_) => {}
                Err(_) if target.is_null() || descriptor.is_null() => {}
                Err(err) => out.diagnostics.push(Diagnostic::new(
                    DiagnosticKind::UnknownConcreteType,
                    Some(target),
                    format!("{name}.buf: {err}"),
                )),
            }
            return vec!["buf"];
        }

        if name == "sync.entry" {
            if let (Some(eface), Ok(p), Some(at)) = (self.eface, header.field("p"), field_offset("p")) {
                if matches!(p.descriptor().kind, TypeKind::Pointer { elem: None }) {
                    let size = self.catalog.descriptor(eface).size;
                    self.claim(origin.source, at, p.word_at(0).unwrap_or_default(), eface, 1, size, out);
                    return vec!["p"];
                }
            }
        }
        Vec::new()
    }

    #[allow(clippy::too_many_arguments)]
    fn slice(
        &self,
        source: RawSource,
        at: u64,
        data: Address,
        elem: TypeId,
        len: u64,
        cap: u64,
        out: &mut ScanOutput,
    )
    {
        if data.is_null() || cap == 0 {
            return;
        }
        if len > cap {
            out.edges.push(RawEdge {
                source,
                offset: at,
                target: data,
                fault: Some(EdgeFault::OutOfBounds),
            });
            out.diagnostics.push(Diagnostic::new(
                DiagnosticKind::OutOfBounds,
                Some(data),
                format!("slice length {len} exceeds capacity {cap}"),
            ));
            return;
        }
        let size = self.catalog.descriptor(elem).size;
        match size.checked_mul(cap) {
            Some(extent) => self.claim(source, at, data, elem, len, extent, out),
            None => out.edges.push(RawEdge {
                source,
                offset: at,
                target: data,
                fault: Some(EdgeFault::OutOfBounds),
            }),
        }
    }

    fn interface(
        &self,
        iface: &TypedValue<'a>,
        source: RawSource,
        at: u64,
        offset: u64,
        pending: &mut Pending,
        out: &mut ScanOutput,
    )
    {
        let ptr = self.catalog.pointer_size();
        let data_at = at + ptr;
        match self.resolver.resolve(iface) {
            Ok(None) => {}
            Ok(Some(resolved)) => match resolved.encoding {
                // The data word is the value; scan it in place.
                Encoding::Direct => pending.push((offset + ptr, resolved.concrete)),
                Encoding::Indirect => {
                    if let Some(boxed) = resolved.boxed_address() {
                        let size = self.catalog.descriptor(resolved.concrete).size;
                        self.claim(source, data_at, boxed, resolved.concrete, 1, size, out);
                    }
                }
            },
            Err(HeapdigError::UnknownConcreteType { descriptor }) => {
                let data = iface.word_at(ptr).unwrap_or_default();
                out.edges.push(RawEdge {
                    source,
                    offset: data_at,
                    target: data,
                    fault: Some(EdgeFault::UnknownConcreteType),
                });
                out.diagnostics.push(Diagnostic::new(
                    DiagnosticKind::UnknownConcreteType,
                    Some(data),
                    format!("interface type word resolves to unknown descriptor {descriptor}"),
                ));
            }
            Err(err) => {
                let type_word = iface.word_at(0).unwrap_or_default();
                out.edges.push(RawEdge {
                    source,
                    offset: at,
                    target: type_word,
                    fault: Some(EdgeFault::OutOfBounds),
                });
                out.diagnostics.push(Diagnostic::new(
                    DiagnosticKind::OutOfBounds,
                    Some(type_word),
                    format!("interface type word: {err}"),
                ));
            }
        }
    }

    /// Record a one-word reference to a value of type `elem`
    fn follow(&self, source: RawSource, at: u64, target: Address, elem: Option<TypeId>, out: &mut ScanOutput)
    {
        if target.is_null() {
            return;
        }
        match elem {
            Some(elem) if self.catalog.descriptor(elem).size > 0 => {
                let size = self.catalog.descriptor(elem).size;
                self.claim(source, at, target, elem, 1, size, out);
            }
            // Untyped or zero-sized: an edge, but no claim.
            _ => {
                let fault = (!self.segments.is_mapped(target)).then_some(EdgeFault::DanglingPointer);
                if fault.is_some() {
                    out.diagnostics.push(dangling(target));
                }
                out.edges.push(RawEdge {
                    source,
                    offset: at,
                    target,
                    fault,
                });
            }
        }
    }

    /// Claim `repeat` values of `ty` at `target`, spanning `extent` bytes
    #[allow(clippy::too_many_arguments)]
    fn claim(
        &self,
        source: RawSource,
        at: u64,
        target: Address,
        ty: TypeId,
        repeat: u64,
        extent: u64,
        out: &mut ScanOutput,
    )
    {
        if target.is_null() {
            return;
        }
        let mut edge = RawEdge {
            source,
            offset: at,
            target,
            fault: None,
        };
        match self.segments.segment_containing(target) {
            None => {
                edge.fault = Some(EdgeFault::DanglingPointer);
                out.diagnostics.push(dangling(target));
            }
            Some(segment) if !segment.covers(target, extent.max(1)) => {
                edge.fault = Some(EdgeFault::OutOfBounds);
                out.diagnostics.push(Diagnostic::new(
                    DiagnosticKind::OutOfBounds,
                    Some(target),
                    format!(
                        "{} bytes of {} overrun segment ending at {}",
                        extent,
                        self.catalog.descriptor(ty).name,
                        segment.end()
                    ),
                ));
            }
            Some(_) if extent == 0 => {}
            Some(_) => {
                let claim = Claim {
                    address: target,
                    ty,
                    repeat,
                    extent,
                };
                if self.registry.insert(claim) {
                    out.claims.push(claim);
                }
            }
        }
        out.edges.push(edge);
    }
}

fn dangling(target: Address) -> Diagnostic
{
    Diagnostic::new(
        DiagnosticKind::DanglingPointer,
        Some(target),
        "pointer targets unmapped memory",
    )
}
