//! # heapdig-core
//!
//! Heap reconstruction for crashed Go processes.
//!
//! Given an ELF core dump and the executable that produced it, this crate
//! rebuilds the graph of live objects and answers questions about it:
//! - Address space assembly from the core's segments layered over the
//!   executable's loadable data
//! - Type, global and frame-layout catalogs decoded from DWARF
//! - Root enumeration from globals, stack frames and registers
//! - Parallel, deduplicating traversal into an object graph
//! - Type census, reference listing, root paths and retained sizes
//!
//! ## Degraded input
//!
//! Dumps of crashing processes are rarely pristine. Only a container or
//! metadata file that cannot be parsed at all is fatal; every local problem
//! is recorded in a [`DiagnosticsReport`] and the rest of the graph is still
//! built.
//!
//! ## Entry point
//!
//! [`Session::open`] runs the whole pipeline and [`Session::query`] returns a
//! [`QueryEngine`] over the result.

pub mod diagnostics;
pub mod dump;
pub mod error;
pub mod graph;
pub mod iface;
pub mod options;
pub mod prelude;
pub mod query;
pub mod roots;
pub mod session;
pub mod symbols;
pub mod types;
pub mod unwind;
pub mod value;

pub use diagnostics::{Diagnostic, DiagnosticKind, DiagnosticsReport};
// Re-export commonly used types
pub use error::{HeapdigError, Result};
pub use options::AnalysisOptions;
pub use query::QueryEngine;
pub use session::Session;
pub use types::Address;
