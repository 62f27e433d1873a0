//! Process, thread, and execution-context types recovered from a dump.

use std::fmt;

use super::{Address, Registers};

/// Process identifier (PID) of the dumped process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId
{
    fn from(pid: u32) -> Self
    {
        ProcessId(pid)
    }
}

impl From<ProcessId> for u32
{
    fn from(pid: ProcessId) -> Self
    {
        pid.0
    }
}

/// Thread identifier
///
/// On Linux this is the kernel TID written into each `NT_PRSTATUS` note
/// (`pr_pid`). The main thread's TID equals the process ID.
///
/// ```rust
/// use heapdig_core::types::ThreadId;
///
/// let thread = ThreadId::from(12345);
/// assert_eq!(thread.raw(), 12345);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

impl ThreadId
{
    /// Get the raw `u64` representation of the thread identifier
    pub fn raw(&self) -> u64
    {
        self.0
    }
}

impl From<u64> for ThreadId
{
    fn from(value: u64) -> Self
    {
        Self(value)
    }
}

impl fmt::Display for ThreadId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// CPU architecture of the dumped process
///
/// ## Supported Architectures
///
/// - **X86_64**: 64-bit x86 (Intel/AMD processors)
/// - **Arm64**: 64-bit ARM
///
/// Anything else is rejected while parsing the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture
{
    /// 64-bit x86 (Intel/AMD)
    X86_64,
    /// 64-bit ARM
    Arm64,
}

impl Architecture
{
    /// Pointer width in bytes
    pub const fn pointer_size_bytes(self) -> u8
    {
        match self {
            Architecture::X86_64 | Architecture::Arm64 => 8,
        }
    }

    /// Map an ELF `e_machine` value to an architecture
    pub fn from_elf_machine(machine: u16) -> Option<Self>
    {
        match machine {
            object::elf::EM_X86_64 => Some(Architecture::X86_64),
            object::elf::EM_AARCH64 => Some(Architecture::Arm64),
            _ => None,
        }
    }
}

impl fmt::Display for Architecture
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Architecture::X86_64 => write!(f, "x86_64"),
            Architecture::Arm64 => write!(f, "arm64"),
        }
    }
}

/// Process-level facts taken from the `NT_PRPSINFO` note
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessInfo
{
    pub pid: ProcessId,
    /// Executable name (`pr_fname`, at most 16 bytes)
    pub command: String,
    /// Leading part of the command line (`pr_psargs`, at most 80 bytes)
    pub args: String,
}

/// One thread of execution that was live at capture time
///
/// `stack` is the start of the segment that contains the stack pointer. A
/// context whose stack pointer is unmapped has no stack segment and therefore
/// contributes only register roots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext
{
    pub thread: ThreadId,
    pub registers: Registers,
    pub stack: Option<Address>,
}

impl ExecutionContext
{
    pub fn new(thread: ThreadId, registers: Registers) -> Self
    {
        Self {
            thread,
            registers,
            stack: None,
        }
    }
}
