//! # Diagnostics
//!
//! Local, non-fatal problems found while building the catalog, the segment
//! map, or the object graph.
//!
//! A dump that is mostly intact should still produce a graph. Whenever an
//! entity is degraded or skipped, a [`Diagnostic`] records what happened and
//! where, so callers can enumerate everything that was not fully understood.

use std::fmt;

use crate::types::Address;

/// Classification of a local problem
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiagnosticKind
{
    /// A type, symbol or frame layout could not be decoded and was degraded
    MissingOrMalformedMetadata,
    /// A value or allocation extends past the end of its segment
    OutOfBounds,
    /// A pointer targets memory outside every segment
    DanglingPointer,
    /// An interface's type word does not resolve to a known type
    UnknownConcreteType,
    /// A mapped range had no bytes in the dump and was zero-filled
    MissingData,
}

impl fmt::Display for DiagnosticKind
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let label = match self {
            DiagnosticKind::MissingOrMalformedMetadata => "metadata",
            DiagnosticKind::OutOfBounds => "out-of-bounds",
            DiagnosticKind::DanglingPointer => "dangling",
            DiagnosticKind::UnknownConcreteType => "unknown-type",
            DiagnosticKind::MissingData => "missing-data",
        };
        f.write_str(label)
    }
}

/// One recorded problem
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Diagnostic
{
    pub kind: DiagnosticKind,
    /// Address the problem is attached to, when there is one
    pub address: Option<Address>,
    pub message: String,
}

impl Diagnostic
{
    pub fn new(kind: DiagnosticKind, address: Option<Address>, message: impl Into<String>) -> Self
    {
        Self {
            kind,
            address,
            message: message.into(),
        }
    }

    pub fn metadata(message: impl Into<String>) -> Self
    {
        Self::new(DiagnosticKind::MissingOrMalformedMetadata, None, message)
    }
}

impl fmt::Display for Diagnostic
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self.address {
            Some(address) => write!(f, "[{}] {address}: {}", self.kind, self.message),
            None => write!(f, "[{}] {}", self.kind, self.message),
        }
    }
}

/// Sorted, deduplicated collection of diagnostics
///
/// Entries may be pushed in any order (graph workers report concurrently);
/// [`DiagnosticsReport::finish`] puts them in a canonical order so two runs
/// over the same input compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiagnosticsReport
{
    entries: Vec<Diagnostic>,
}

impl DiagnosticsReport
{
    pub fn new() -> Self
    {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic)
    {
        self.entries.push(diagnostic);
    }

    pub fn extend<I: IntoIterator<Item = Diagnostic>>(&mut self, diagnostics: I)
    {
        self.entries.extend(diagnostics);
    }

    /// Sort by kind, address and message, then drop exact duplicates.
    pub fn finish(mut self) -> Self
    {
        self.entries.sort();
        self.entries.dedup();
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic>
    {
        self.entries.iter()
    }

    pub fn of_kind(&self, kind: DiagnosticKind) -> impl Iterator<Item = &Diagnostic>
    {
        self.entries.iter().filter(move |diag| diag.kind == kind)
    }

    pub fn count(&self, kind: DiagnosticKind) -> usize
    {
        self.of_kind(kind).count()
    }

    pub fn len(&self) -> usize
    {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.entries.is_empty()
    }
}

impl IntoIterator for DiagnosticsReport
{
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter
    {
        self.entries.into_iter()
    }
}
