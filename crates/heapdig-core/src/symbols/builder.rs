//! Incremental construction of a [`SymbolCatalog`].
//!
//! Types are declared first and defined later, so the DWARF extractor can hand
//! out an id for a type before walking its members, and tests can assemble
//! small catalogs by hand.

use std::collections::HashMap;

use tracing::{debug, warn};

use super::catalog::{FunctionInfo, Global, SymbolCatalog, WellKnownTypes};
use super::types::{Field, PointerLayout, ScalarKind, TypeDescriptor, TypeId, TypeKind, MAX_LAYOUT_WORDS};
use crate::diagnostics::Diagnostic;
use crate::types::Address;

const MAX_ALIAS_DEPTH: usize = 32;

#[derive(Debug, Clone)]
struct PendingType
{
    name: String,
    size: Option<u64>,
    kind: Option<TypeKind>,
    alias: Option<TypeId>,
}

/// Mutable staging area for types, globals and functions
#[derive(Debug)]
pub struct CatalogBuilder
{
    pointer_size: u64,
    types: Vec<PendingType>,
    names: HashMap<String, TypeId>,
    runtime_types: Vec<(Address, TypeId)>,
    globals: Vec<Global>,
    functions: Vec<FunctionInfo>,
    diagnostics: Vec<Diagnostic>,
    itab_type_offset: Option<u64>,
}

impl CatalogBuilder
{
    pub fn new(pointer_size: u64) -> Self
    {
        Self {
            pointer_size,
            types: Vec::new(),
            names: HashMap::new(),
            runtime_types: Vec::new(),
            globals: Vec::new(),
            functions: Vec::new(),
            diagnostics: Vec::new(),
            itab_type_offset: None,
        }
    }

    pub fn pointer_size(&self) -> u64
    {
        self.pointer_size
    }

    /// Reserve an id for a type whose shape is not known yet.
    pub fn declare(&mut self, name: impl Into<String>, size: Option<u64>) -> TypeId
    {
        let id = TypeId(u32::try_from(self.types.len()).unwrap_or(u32::MAX));
        let name = name.into();
        self.names.entry(name.clone()).or_insert(id);
        self.types.push(PendingType {
            name,
            size,
            kind: None,
            alias: None,
        });
        id
    }

    pub fn define(&mut self, id: TypeId, kind: TypeKind)
    {
        if let Some(pending) = self.types.get_mut(id.index()) {
            pending.kind = Some(kind);
        }
    }

    /// Give `id` the shape and size of `target` while keeping its own name.
    pub fn alias(&mut self, id: TypeId, target: TypeId)
    {
        if let Some(pending) = self.types.get_mut(id.index()) {
            pending.alias = Some(target);
        }
    }

    pub fn set_size(&mut self, id: TypeId, size: u64)
    {
        if let Some(pending) = self.types.get_mut(id.index()) {
            pending.size = Some(size);
        }
    }

    pub fn name_of(&self, id: TypeId) -> &str
    {
        self.types.get(id.index()).map_or("", |pending| pending.name.as_str())
    }

    pub fn kind_of(&self, id: TypeId) -> Option<&TypeKind>
    {
        self.types.get(id.index()).and_then(|pending| pending.kind.as_ref())
    }

    /// First type declared under `name`
    pub fn find(&self, name: &str) -> Option<TypeId>
    {
        self.names.get(name).copied()
    }

    fn add(&mut self, name: impl Into<String>, size: Option<u64>, kind: TypeKind) -> TypeId
    {
        let id = self.declare(name, size);
        self.define(id, kind);
        id
    }

    pub fn scalar(&mut self, name: impl Into<String>, kind: ScalarKind, size: u64) -> TypeId
    {
        self.add(name, Some(size), TypeKind::Scalar(kind))
    }

    pub fn pointer_to(&mut self, elem: TypeId) -> TypeId
    {
        let name = format!("*{}", self.name_of(elem));
        self.add(name, Some(self.pointer_size), TypeKind::Pointer { elem: Some(elem) })
    }

    /// The untyped pointer, created on first use
    pub fn unsafe_pointer(&mut self) -> TypeId
    {
        match self.find("unsafe.Pointer") {
            Some(id) => id,
            None => self.add("unsafe.Pointer", Some(self.pointer_size), TypeKind::Pointer { elem: None }),
        }
    }

    pub fn structure(&mut self, name: impl Into<String>, size: u64, fields: Vec<Field>) -> TypeId
    {
        self.add(name, Some(size), TypeKind::Struct { fields })
    }

    pub fn array_of(&mut self, elem: TypeId, count: u64) -> TypeId
    {
        let name = format!("[{count}]{}", self.name_of(elem));
        self.add(name, None, TypeKind::Array { elem, count })
    }

    pub fn string(&mut self) -> TypeId
    {
        match self.find("string") {
            Some(id) => id,
            None => self.add("string", Some(2 * self.pointer_size), TypeKind::String),
        }
    }

    pub fn slice_of(&mut self, elem: TypeId) -> TypeId
    {
        let name = format!("[]{}", self.name_of(elem));
        self.add(name, Some(3 * self.pointer_size), TypeKind::Slice { elem })
    }

    pub fn interface(&mut self, name: impl Into<String>, empty: bool) -> TypeId
    {
        self.add(name, Some(2 * self.pointer_size), TypeKind::Interface { empty })
    }

    pub fn map(&mut self, name: impl Into<String>, header: Option<TypeId>) -> TypeId
    {
        self.add(name, Some(self.pointer_size), TypeKind::Map { header })
    }

    pub fn channel(&mut self, name: impl Into<String>, header: Option<TypeId>) -> TypeId
    {
        self.add(name, Some(self.pointer_size), TypeKind::Channel { header })
    }

    pub fn func(&mut self, name: impl Into<String>) -> TypeId
    {
        self.add(name, Some(self.pointer_size), TypeKind::Function)
    }

    /// Bind a runtime type-descriptor address to `ty`; the first binding of an address wins.
    pub fn runtime_type(&mut self, address: Address, ty: TypeId)
    {
        self.runtime_types.push((address, ty));
    }

    pub fn global(&mut self, name: impl Into<String>, address: Address, ty: TypeId)
    {
        self.globals.push(Global {
            name: name.into(),
            address,
            ty,
        });
    }

    pub fn add_function(&mut self, function: FunctionInfo)
    {
        self.functions.push(function);
    }

    pub fn set_itab_type_offset(&mut self, offset: u64)
    {
        self.itab_type_offset = Some(offset);
    }

    pub fn report(&mut self, diagnostic: Diagnostic)
    {
        self.diagnostics.push(diagnostic);
    }

    fn ensure_scalar(&mut self, name: &str, kind: ScalarKind, size: u64) -> TypeId
    {
        match self.find(name) {
            Some(id) => id,
            None => self.scalar(name, kind, size),
        }
    }

    /// Resolve sizes, validate layouts and freeze everything into a catalog
    ///
    /// Types that were never defined, whose size cannot be determined, or
    /// whose members do not fit inside their declared size are degraded to
    /// [`TypeKind::Unknown`] and reported as metadata diagnostics.
    pub fn finish(mut self) -> SymbolCatalog
    {
        let word = self.pointer_size;
        let uint8 = self.ensure_scalar("uint8", ScalarKind::Uint, 1);
        let uintptr = self.ensure_scalar("uintptr", ScalarKind::Uint, word);
        let unsafe_pointer = self.unsafe_pointer();
        let funcval = match self.find("runtime.funcval") {
            Some(id) => id,
            None => self.structure("runtime.funcval", word, vec![Field::new("fn", 0, uintptr)]),
        };

        self.resolve_aliases();
        for pending in &mut self.types {
            if pending.kind.is_none() {
                self.diagnostics
                    .push(Diagnostic::metadata(format!("type {} has no definition", pending.name)));
                pending.kind = Some(TypeKind::Unknown);
            }
        }

        let count = self.types.len();
        let mut sizes = vec![None; count];
        let mut visiting = vec![false; count];
        for index in 0..count {
            self.resolve_size(index, &mut sizes, &mut visiting);
        }

        let mut kinds: Vec<TypeKind> = Vec::with_capacity(count);
        let mut final_sizes: Vec<u64> = Vec::with_capacity(count);
        for (index, pending) in self.types.iter().enumerate() {
            let kind = pending.kind.clone().unwrap_or(TypeKind::Unknown);
            match sizes[index] {
                Some(size) => {
                    let problem = self.layout_problem(&kind, size, &sizes);
                    if let Some(problem) = problem {
                        warn!(name = %pending.name, %problem, "degrading malformed type");
                        self.diagnostics
                            .push(Diagnostic::metadata(format!("type {}: {problem}", pending.name)));
                        kinds.push(TypeKind::Unknown);
                    } else {
                        kinds.push(kind);
                    }
                    final_sizes.push(size);
                }
                None => {
                    if kind != TypeKind::Unknown {
                        self.diagnostics
                            .push(Diagnostic::metadata(format!("size of type {} is unknown", pending.name)));
                    }
                    kinds.push(TypeKind::Unknown);
                    final_sizes.push(0);
                }
            }
        }

        let mut has_pointers = vec![None; count];
        let mut visiting = vec![false; count];
        for index in 0..count {
            pointer_bearing(index, &kinds, &mut has_pointers, &mut visiting);
        }
        let mut layouts: Vec<Option<PointerLayout>> = vec![None; count];
        for index in 0..count {
            build_layout(index, word, &kinds, &final_sizes, &has_pointers, &mut layouts);
        }

        let types: Vec<TypeDescriptor> = self
            .types
            .into_iter()
            .zip(kinds)
            .zip(final_sizes)
            .zip(layouts)
            .enumerate()
            .map(|(index, (((pending, kind), size), layout))| TypeDescriptor {
                id: TypeId(u32::try_from(index).unwrap_or(u32::MAX)),
                name: pending.name,
                size,
                kind,
                layout: layout.unwrap_or_default(),
            })
            .collect();

        let mut runtime_types = HashMap::new();
        for (address, id) in self.runtime_types {
            runtime_types.entry(address).or_insert(id);
        }

        let mut globals = self.globals;
        globals.sort_by(|a, b| a.address.cmp(&b.address).then_with(|| a.name.cmp(&b.name)));

        let mut functions = self.functions;
        functions.sort_by_key(|function| function.entry);
        functions.dedup_by_key(|function| function.entry);

        debug!(
            types = types.len(),
            runtime_types = runtime_types.len(),
            globals = globals.len(),
            functions = functions.len(),
            diagnostics = self.diagnostics.len(),
            "symbol catalog built"
        );

        SymbolCatalog {
            pointer_size: word,
            types,
            by_name: self.names,
            runtime_types,
            globals,
            functions,
            itab_type_offset: self.itab_type_offset.unwrap_or(word),
            well_known: WellKnownTypes {
                uint8,
                uintptr,
                unsafe_pointer,
                funcval,
            },
            diagnostics: self.diagnostics,
        }
    }

    fn resolve_aliases(&mut self)
    {
        for index in 0..self.types.len() {
            if self.types[index].alias.is_none() {
                continue;
            }
            let mut target = index;
            let mut hops = 0;
            while let Some(next) = self.types[target].alias {
                target = next.index().min(self.types.len() - 1);
                hops += 1;
                if hops > MAX_ALIAS_DEPTH || target == index {
                    break;
                }
            }

            let resolved = &self.types[target];
            if resolved.alias.is_some() || resolved.kind.is_none() {
                let name = self.types[index].name.clone();
                self.diagnostics
                    .push(Diagnostic::metadata(format!("typedef {name} does not resolve to a type")));
                self.types[index].kind = Some(TypeKind::Unknown);
            } else {
                let (kind, size) = (resolved.kind.clone(), resolved.size);
                let pending = &mut self.types[index];
                pending.kind = kind;
                pending.size = pending.size.or(size);
            }
        }
        for pending in &mut self.types {
            pending.alias = None;
        }
    }

    fn resolve_size(&self, index: usize, sizes: &mut [Option<u64>], visiting: &mut [bool]) -> Option<u64>
    {
        if let Some(size) = sizes[index] {
            return Some(size);
        }
        let pending = &self.types[index];
        if let Some(size) = pending.size {
            sizes[index] = Some(size);
            return Some(size);
        }
        if visiting[index] {
            return None;
        }
        visiting[index] = true;

        let word = self.pointer_size;
        let size = match pending.kind.as_ref() {
            Some(TypeKind::Pointer { .. } | TypeKind::Map { .. } | TypeKind::Channel { .. } | TypeKind::Function) => {
                Some(word)
            }
            Some(TypeKind::Interface { .. } | TypeKind::String) => Some(2 * word),
            Some(TypeKind::Slice { .. }) => Some(3 * word),
            Some(TypeKind::Array { elem, count }) => self
                .resolve_size(elem.index(), sizes, visiting)
                .and_then(|size| size.checked_mul(*count)),
            Some(TypeKind::Struct { fields }) => fields.iter().try_fold(0u64, |end, field| {
                let size = self.resolve_size(field.ty.index(), sizes, visiting)?;
                Some(end.max(field.offset.checked_add(size)?))
            }),
            Some(TypeKind::Scalar(_) | TypeKind::Unknown) | None => None,
        };

        visiting[index] = false;
        sizes[index] = size;
        size
    }

    fn layout_problem(&self, kind: &TypeKind, size: u64, sizes: &[Option<u64>]) -> Option<String>
    {
        let word = self.pointer_size;
        let size_of = |id: &TypeId| sizes.get(id.index()).copied().flatten();
        match kind {
            TypeKind::Struct { fields } => fields.iter().find_map(|field| match size_of(&field.ty) {
                Some(field_size) if field.offset.checked_add(field_size).is_some_and(|end| end <= size) => None,
                Some(_) => Some(format!("field {} lies outside its {size} bytes", field.name)),
                None => Some(format!("field {} has no size", field.name)),
            }),
            TypeKind::Array { elem, count } => match size_of(elem).and_then(|elem| elem.checked_mul(*count)) {
                Some(total) if total == size => None,
                _ => Some(format!("{count} elements do not fill {size} bytes")),
            },
            TypeKind::Pointer { .. } | TypeKind::Map { .. } | TypeKind::Channel { .. } | TypeKind::Function
                if size != word =>
            {
                Some(format!("expected one word, found {size} bytes"))
            }
            TypeKind::Interface { .. } | TypeKind::String if size != 2 * word => {
                Some(format!("expected two words, found {size} bytes"))
            }
            TypeKind::Slice { .. } if size != 3 * word => Some(format!("expected three words, found {size} bytes")),
            _ => None,
        }
    }
}

fn pointer_bearing(index: usize, kinds: &[TypeKind], memo: &mut [Option<bool>], visiting: &mut [bool]) -> bool
{
    if let Some(known) = memo[index] {
        return known;
    }
    if visiting[index] {
        return false;
    }
    visiting[index] = true;
    let result = match &kinds[index] {
        TypeKind::Pointer { .. }
        | TypeKind::Map { .. }
        | TypeKind::Channel { .. }
        | TypeKind::Function
        | TypeKind::String
        | TypeKind::Slice { .. }
        | TypeKind::Interface { .. } => true,
        TypeKind::Array { elem, count } => *count > 0 && pointer_bearing(elem.index(), kinds, memo, visiting),
        TypeKind::Struct { fields } => fields
            .iter()
            .any(|field| pointer_bearing(field.ty.index(), kinds, memo, visiting)),
        TypeKind::Scalar(_) | TypeKind::Unknown => false,
    };
    visiting[index] = false;
    memo[index] = Some(result);
    result
}

fn build_layout(
    index: usize,
    word: u64,
    kinds: &[TypeKind],
    sizes: &[u64],
    has_pointers: &[Option<bool>],
    layouts: &mut [Option<PointerLayout>],
) -> PointerLayout
{
    if let Some(layout) = &layouts[index] {
        return layout.clone();
    }

    let words = sizes[index].div_ceil(word.max(1));
    let any = has_pointers[index].unwrap_or(false);
    let layout = if !any {
        PointerLayout::empty(words)
    } else if words > MAX_LAYOUT_WORDS {
        PointerLayout::elided(words, true)
    } else {
        let mut layout = PointerLayout::empty(words);
        match &kinds[index] {
            TypeKind::Interface { .. } => {
                layout.set(0);
                layout.set(1);
            }
            TypeKind::Array { elem, count } => {
                let elem_layout = build_layout(elem.index(), word, kinds, sizes, has_pointers, layouts);
                let stride = sizes[elem.index()] / word.max(1);
                for element in 0..*count {
                    layout.merge_at(&elem_layout, element * stride);
                }
            }
            TypeKind::Struct { fields } => {
                for field in fields {
                    if field.offset % word.max(1) != 0 || !has_pointers[field.ty.index()].unwrap_or(false) {
                        continue;
                    }
                    let field_layout = build_layout(field.ty.index(), word, kinds, sizes, has_pointers, layouts);
                    layout.merge_at(&field_layout, field.offset / word.max(1));
                }
            }
            _ => layout.set(0),
        }
        layout
    };

    layouts[index] = Some(layout.clone());
    layout
}
