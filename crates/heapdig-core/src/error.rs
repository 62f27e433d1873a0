//! # Error Types
//!
//! Fatal error handling for heap analysis.
//!
//! We use `thiserror` to automatically generate `Error` trait implementations
//! and nice error messages.
//!
//! Only structural failures of the two input files abort a session. Everything
//! else (a bad type reference, a pointer into nowhere, an interface whose type
//! word we cannot resolve) degrades locally and is collected in a
//! [`DiagnosticsReport`](crate::diagnostics::DiagnosticsReport) instead.

use thiserror::Error;

use crate::types::Address;

/// Main error type for analysis operations
///
/// ## Error Categories
///
/// 1. **Input errors**: MalformedContainer, MalformedMetadata (fatal)
/// 2. **Address-space errors**: OutOfBounds (local, reported per edge)
/// 3. **Type errors**: UnknownConcreteType (local, reported per edge)
/// 4. **Control errors**: InvalidArgument, Aborted
/// 5. **I/O errors**: Io (for file operations, etc.)
#[derive(Error, Debug)]
pub enum HeapdigError
{
    /// The dump container failed structural validation
    ///
    /// This happens when:
    /// - The file is not a 64-bit ELF core file
    /// - The machine type is not x86-64 or AArch64
    /// - The program header table is truncated
    /// - Two loadable core segments overlap
    ///
    /// Analysis cannot start.
    #[error("Malformed dump container: {0}")]
    MalformedContainer(String),

    /// The metadata file could not be parsed at all
    ///
    /// Individual malformed type or symbol entries do not produce this error;
    /// they degrade to `Unknown` and are reported as diagnostics. This variant
    /// is reserved for a metadata file whose object container or DWARF unit
    /// headers cannot be read.
    #[error("Malformed metadata: {0}")]
    MalformedMetadata(String),

    /// A read was not fully covered by a single segment
    #[error("Read of {length} bytes at {address} is out of bounds")]
    OutOfBounds
    {
        /// First byte of the requested range
        address: Address,
        /// Number of bytes requested
        length: u64,
    },

    /// An interface's type word does not name any known type descriptor
    ///
    /// The edge carrying the interface is recorded, but its target cannot be
    /// expanded because the concrete type is unknown.
    #[error("Unknown concrete type for descriptor {descriptor}")]
    UnknownConcreteType
    {
        /// Address stored in the interface's type word (after itab indirection)
        descriptor: Address,
    },

    /// Invalid argument passed to an analysis function
    ///
    /// Examples:
    /// - Malformed address string on the command line
    /// - Invalid regular expression for a type filter
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Graph construction was stopped by the cooperative abort flag
    #[error("Analysis aborted")]
    Aborted,

    /// I/O error (for file operations, etc.)
    ///
    /// Used for errors when opening or reading the dump and metadata files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for `Result<T, HeapdigError>`
///
/// ```rust
/// use heapdig_core::error::Result;
/// fn foo() -> Result<()>
/// {
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, HeapdigError>;

/// Map a gimli DWARF error to a `HeapdigError` with context.
///
/// The `context` describes what was being decoded when the error occurred
/// (e.g., "reading .debug_info unit header").
pub(crate) fn map_dwarf_error(context: &str, err: gimli::Error) -> HeapdigError
{
    HeapdigError::MalformedMetadata(format!("{context}: {err}"))
}

/// Map an `object` parse error on the dump to a `MalformedContainer` error.
pub(crate) fn map_container_error(context: &str, err: object::read::Error) -> HeapdigError
{
    HeapdigError::MalformedContainer(format!("{context}: {err}"))
}
