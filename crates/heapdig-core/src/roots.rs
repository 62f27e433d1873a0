//! # Roots
//!
//! Traversal origins: globals, live stack slots and registers.
//!
//! Roots are never merged with heap objects. A global's storage is part of
//! the executable's data segment and a frame slot is part of a stack, so the
//! graph treats them as labelled edge sources only.

use std::fmt;

use tracing::{debug, warn};

use crate::diagnostics::{Diagnostic, DiagnosticKind};
use crate::dump::{Segment, SegmentMap};
use crate::symbols::{SourceLocator, SymbolCatalog, TypeId};
use crate::types::{Address, ExecutionContext, SourceLocation, ThreadId};
use crate::unwind::FrameWalker;

/// Index of a root after sorting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RootId(pub u32);

impl fmt::Display for RootId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "root#{}", self.0)
    }
}

/// Where a root came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootKind
{
    Global,
    Frame
    {
        thread: ThreadId,
        depth: u32,
        function: String,
        location: Option<SourceLocation>,
    },
    Register
    {
        thread: ThreadId,
        register: String,
    },
}

impl RootKind
{
    pub fn label(&self) -> &'static str
    {
        match self {
            RootKind::Global => "global",
            RootKind::Frame { .. } => "frame",
            RootKind::Register { .. } => "register",
        }
    }
}

/// Bytes of a root
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RootStorage
{
    /// Stored in the dump at this address
    Memory(Address),
    /// Captured outside addressable memory, such as a register value
    Inline(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Root
{
    pub id: RootId,
    pub name: String,
    pub kind: RootKind,
    /// Static type of the slot
    pub ty: TypeId,
    pub storage: RootStorage,
}

impl Root
{
    pub fn address(&self) -> Option<Address>
    {
        match self.storage {
            RootStorage::Memory(address) => Some(address),
            RootStorage::Inline(_) => None,
        }
    }
}

/// Knobs for root enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootOptions
{
    /// Frames walked per execution context
    pub max_frames: usize,
    /// Whether register values pointing into writable memory become roots
    pub register_roots: bool,
}

impl Default for RootOptions
{
    fn default() -> Self
    {
        Self {
            max_frames: 1024,
            register_roots: true,
        }
    }
}

/// Enumerated roots plus the problems met along the way
#[derive(Debug, Clone, Default)]
pub struct RootSet
{
    pub roots: Vec<Root>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Enumerate every root of the dump
///
/// Globals outside writable memory are skipped since they cannot reference
/// the heap. Frame slots come from the catalog's frame layouts and only
/// pointer-bearing slots are kept.
pub fn build_roots(
    segments: &SegmentMap,
    catalog: &SymbolCatalog,
    contexts: &[ExecutionContext],
    locator: &dyn SourceLocator,
    options: RootOptions,
) -> RootSet
{
    let mut roots = Vec::new();
    let mut diagnostics = Vec::new();

    let mut read_only = 0usize;
    for (name, address, ty) in catalog.globals_list() {
        if !segments.is_mapped(address) {
            diagnostics.push(Diagnostic::new(
                DiagnosticKind::OutOfBounds,
                Some(address),
                format!("global {name} is not mapped"),
            ));
            continue;
        }
        if !segments.is_writable(address) {
            read_only += 1;
            continue;
        }
        roots.push(unnumbered(name.to_string(), RootKind::Global, ty.id, RootStorage::Memory(address)));
    }

    let walker = FrameWalker::new(segments, options.max_frames);
    for context in contexts {
        let stack = context.stack.and_then(|start| segments.segment_containing(start));
        match stack {
            Some(stack) => frame_roots(segments, catalog, &walker, context, stack, locator, &mut roots, &mut diagnostics),
            None => {
                warn!(thread = %context.thread, "execution context has no stack segment");
                diagnostics.push(Diagnostic::new(
                    DiagnosticKind::MissingData,
                    Some(context.registers.sp),
                    format!("thread {} has no mapped stack", context.thread),
                ));
            }
        }

        if options.register_roots {
            let unsafe_pointer = catalog.well_known().unsafe_pointer;
            for (index, value) in context.registers.value_registers() {
                let value = Address::new(value);
                // Frame and stack pointers are not heap references.
                if !segments.is_writable(value) || stack.is_some_and(|stack| stack.contains(value)) {
                    continue;
                }
                let register = context.registers.name(index);
                roots.push(unnumbered(
                    format!("thread {} {register}", context.thread),
                    RootKind::Register {
                        thread: context.thread,
                        register,
                    },
                    unsafe_pointer,
                    RootStorage::Inline(segments.encode_ptr(value.value())),
                ));
            }
        }
    }

    // Inline roots have no address; they sort after everything in memory.
    roots.sort_by(|a, b| {
        let key = |root: &Root| (root.address().map_or(u64::MAX, Address::value), root.name.clone());
        key(a).cmp(&key(b))
    });
    for (index, root) in roots.iter_mut().enumerate() {
        root.id = RootId(u32::try_from(index).unwrap_or(u32::MAX));
    }

    debug!(
        roots = roots.len(),
        read_only_globals = read_only,
        contexts = contexts.len(),
        "enumerated roots"
    );
    RootSet { roots, diagnostics }
}

#[allow(clippy::too_many_arguments)]
fn frame_roots(
    segments: &SegmentMap,
    catalog: &SymbolCatalog,
    walker: &FrameWalker<'_, SegmentMap>,
    context: &ExecutionContext,
    stack: &Segment,
    locator: &dyn SourceLocator,
    roots: &mut Vec<Root>,
    diagnostics: &mut Vec<Diagnostic>,
)
{
    let ptr = segments.pointer_size();
    for frame in walker.walk(context, (stack.start(), stack.end())) {
        // Return addresses point after the call; step back into it.
        let lookup = if frame.depth == 0 {
            frame.pc
        } else {
            frame.pc.checked_sub(1).unwrap_or(frame.pc)
        };
        let Some(function) = catalog.function_containing(lookup) else {
            continue;
        };
        let location = locator.locate(lookup);

        for slot in &function.frame.slots {
            let descriptor = catalog.descriptor(slot.ty);
            if !descriptor.has_pointers() {
                continue;
            }
            let Some(offset) = slot.location.cfa_offset_at(lookup) else {
                continue;
            };
            let size = descriptor.size.max(ptr);
            let Some(address) = frame.cfa.checked_offset(offset) else {
                continue;
            };
            if !stack.covers(address, size) {
                diagnostics.push(Diagnostic::new(
                    DiagnosticKind::OutOfBounds,
                    Some(address),
                    format!(
                        "{}.{} lies outside the stack of thread {}",
                        function.name, slot.name, context.thread
                    ),
                ));
                continue;
            }
            roots.push(unnumbered(
                format!("{}.{}", function.name, slot.name),
                RootKind::Frame {
                    thread: context.thread,
                    depth: frame.depth,
                    function: function.name.clone(),
                    location: location.clone(),
                },
                slot.ty,
                RootStorage::Memory(address),
            ));
        }
    }
}

fn unnumbered(name: String, kind: RootKind, ty: TypeId, storage: RootStorage) -> Root
{
    Root {
        id: RootId(0),
        name,
        kind,
        ty,
        storage,
    }
}
