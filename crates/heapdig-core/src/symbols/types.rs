//! Structural type descriptors.

use std::fmt;

/// Index of a descriptor inside its [`SymbolCatalog`](super::SymbolCatalog)
///
/// Ids are assigned when a type is first declared, before its children are
/// resolved, so a structure that points to itself simply refers to its own id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TypeId(pub(crate) u32);

impl TypeId
{
    pub fn index(self) -> usize
    {
        self.0 as usize
    }
}

impl fmt::Display for TypeId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind
{
    Bool,
    Int,
    Uint,
    Float,
    Complex,
}

/// Named member of a structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field
{
    pub name: String,
    /// Byte offset from the start of the structure
    pub offset: u64,
    pub ty: TypeId,
}

impl Field
{
    pub fn new(name: impl Into<String>, offset: u64, ty: TypeId) -> Self
    {
        Self {
            name: name.into(),
            offset,
            ty,
        }
    }
}

/// Shape of a type, as far as the object graph cares
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind
{
    Scalar(ScalarKind),
    /// `elem` is `None` for `unsafe.Pointer` and other untyped pointers
    Pointer
    {
        elem: Option<TypeId>
    },
    Array
    {
        elem: TypeId,
        count: u64,
    },
    Struct
    {
        fields: Vec<Field>
    },
    /// Two words: type (or itab) word, then data word
    Interface
    {
        empty: bool
    },
    /// One word pointing at the runtime's map header
    Map
    {
        header: Option<TypeId>
    },
    /// One word pointing at the runtime's channel header
    Channel
    {
        header: Option<TypeId>
    },
    /// One word pointing at a `runtime.funcval`
    Function,
    /// Data pointer and length
    String,
    /// Data pointer, length and capacity
    Slice
    {
        elem: TypeId
    },
    /// Size is known, structure is not
    Unknown,
}

impl TypeKind
{
    pub fn label(&self) -> &'static str
    {
        match self {
            TypeKind::Scalar(_) => "scalar",
            TypeKind::Pointer { .. } => "pointer",
            TypeKind::Array { .. } => "array",
            TypeKind::Struct { .. } => "struct",
            TypeKind::Interface { .. } => "interface",
            TypeKind::Map { .. } => "map",
            TypeKind::Channel { .. } => "chan",
            TypeKind::Function => "func",
            TypeKind::String => "string",
            TypeKind::Slice { .. } => "slice",
            TypeKind::Unknown => "unknown",
        }
    }
}

/// Largest layout stored bit-for-bit; bigger ones only remember that they hold pointers.
pub(crate) const MAX_LAYOUT_WORDS: u64 = 1 << 20;

/// Which pointer-sized words of a type may hold a pointer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PointerLayout
{
    bits: Vec<u64>,
    words: u64,
    any: bool,
    elided: bool,
}

impl PointerLayout
{
    pub(crate) fn empty(words: u64) -> Self
    {
        Self {
            bits: Vec::new(),
            words,
            any: false,
            elided: false,
        }
    }

    pub(crate) fn elided(words: u64, any: bool) -> Self
    {
        Self {
            bits: Vec::new(),
            words,
            any,
            elided: true,
        }
    }

    pub(crate) fn set(&mut self, word: u64)
    {
        if self.elided || word >= self.words {
            return;
        }
        let slot = (word / 64) as usize;
        if self.bits.len() <= slot {
            self.bits.resize(slot + 1, 0);
        }
        self.bits[slot] |= 1 << (word % 64);
        self.any = true;
    }

    /// OR `other` into this layout starting at word `at`.
    pub(crate) fn merge_at(&mut self, other: &PointerLayout, at: u64)
    {
        if !other.any {
            return;
        }
        if other.elided || self.elided {
            self.any = true;
            self.elided = true;
            self.bits.clear();
            return;
        }
        for word in other.pointer_words() {
            self.set(at + word);
        }
    }

    pub fn has_pointers(&self) -> bool
    {
        self.any
    }

    /// True when the layout was too large to record word by word.
    pub fn is_elided(&self) -> bool
    {
        self.elided
    }

    /// Length of the layout in pointer-sized words
    pub fn words(&self) -> u64
    {
        self.words
    }

    pub fn pointer_words(&self) -> impl Iterator<Item = u64> + '_
    {
        self.bits.iter().enumerate().flat_map(|(slot, bits)| {
            (0..64u64)
                .filter(move |bit| bits & (1 << bit) != 0)
                .map(move |bit| slot as u64 * 64 + bit)
        })
    }
}

/// A resolved type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor
{
    pub id: TypeId,
    pub name: String,
    pub size: u64,
    pub kind: TypeKind,
    pub(crate) layout: PointerLayout,
}

impl TypeDescriptor
{
    pub fn layout(&self) -> &PointerLayout
    {
        &self.layout
    }

    pub fn has_pointers(&self) -> bool
    {
        self.layout.has_pointers()
    }

    pub fn fields(&self) -> &[Field]
    {
        match &self.kind {
            TypeKind::Struct { fields } => fields,
            _ => &[],
        }
    }

    pub fn field(&self, name: &str) -> Option<&Field>
    {
        self.fields().iter().find(|field| field.name == name)
    }

    pub fn is_unknown(&self) -> bool
    {
        self.kind == TypeKind::Unknown
    }
}

impl fmt::Display for TypeDescriptor
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{} ({}, {} bytes)", self.name, self.kind.label(), self.size)
    }
}
