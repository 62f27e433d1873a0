//! Common module for library exports

pub use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticsReport};
pub use crate::error::{HeapdigError, Result};
pub use crate::graph::{Edge, EdgeFault, EdgeSource, Object, ObjectGraph, ObjectId};
pub use crate::options::AnalysisOptions;
pub use crate::query::{CensusEntry, QueryEngine, Retained};
pub use crate::roots::{Root, RootId, RootKind};
pub use crate::session::Session;
pub use crate::symbols::{SymbolCatalog, TypeDescriptor, TypeId, TypeKind};
pub use crate::types::address::Address;
pub use crate::types::process::{Architecture, ExecutionContext, ProcessId, ThreadId};
pub use crate::value::{TypedValue, Value};
