//! # Types
//!
//! Plain value types shared by every stage of the analysis.
//!
//! These types describe the dumped process (its threads, registers and
//! addresses) independently of how the dump container encodes them.

pub mod address;
pub mod process;
pub mod registers;
pub mod stack;
pub mod symbols;

// Re-export all public types
pub use address::Address;
pub use process::{Architecture, ExecutionContext, ProcessId, ProcessInfo, ThreadId};
pub use registers::Registers;
pub use stack::{FrameStatus, StackFrame};
pub use symbols::SourceLocation;
