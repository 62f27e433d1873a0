//! Stack frame types.

use std::fmt;

use super::{Address, ThreadId};

/// How a frame's registers were obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus
{
    /// Innermost frame, taken straight from the captured registers
    Registers,
    /// Recovered by following the saved frame-pointer chain
    FramePointer,
}

/// One physical frame of a walked stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame
{
    /// Owning thread
    pub thread: ThreadId,
    /// Distance from the innermost frame (0 = innermost)
    pub depth: u32,
    /// Program counter of this frame
    pub pc: Address,
    /// Stack pointer snapshot
    pub sp: Address,
    /// Frame pointer of this frame
    pub fp: Address,
    /// Canonical frame address, the base for frame slot offsets
    pub cfa: Address,
    pub status: FrameStatus,
}

impl fmt::Display for StackFrame
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "#{} pc={} cfa={}", self.depth, self.pc, self.cfa)
    }
}
