//! # Stack walking
//!
//! Frame-pointer unwinding over the dumped stack.
//!
//! The runtime keeps frame pointers enabled, so each frame stores the caller's
//! frame pointer at `[fp]` and the return address at `[fp + ptr]`. The
//! canonical frame address sits two words above the frame pointer.

use tracing::trace;

use crate::dump::SegmentMap;
use crate::error::Result;
use crate::types::{Address, ExecutionContext, FrameStatus, StackFrame};

/// Minimal memory accessor required for stack unwinding
pub trait MemoryAccess
{
    /// Read one pointer-sized word
    fn read_word(&self, address: Address) -> Result<Address>;

    fn word_size(&self) -> u64;
}

impl MemoryAccess for SegmentMap
{
    fn read_word(&self, address: Address) -> Result<Address>
    {
        self.read_ptr(address)
    }

    fn word_size(&self) -> u64
    {
        self.pointer_size()
    }
}

/// Walks the frame-pointer chain of one execution context
pub struct FrameWalker<'a, M>
{
    memory: &'a M,
    max_frames: usize,
}

impl<'a, M: MemoryAccess> FrameWalker<'a, M>
{
    pub fn new(memory: &'a M, max_frames: usize) -> Self
    {
        Self { memory, max_frames }
    }

    /// Frames of `context`, innermost first
    ///
    /// `stack` is the `[start, end)` range of the context's stack segment.
    /// The walk stops at a null frame pointer, one that leaves the stack or
    /// fails to move towards its base, an unreadable frame record, or after
    /// `max_frames` frames.
    pub fn walk(&self, context: &ExecutionContext, stack: (Address, Address)) -> Vec<StackFrame>
    {
        let ptr = self.memory.word_size();
        let (low, high) = stack;
        let registers = &context.registers;

        let mut frames = Vec::new();
        let mut pc = registers.pc;
        let mut sp = registers.sp;
        let mut fp = registers.fp;
        let mut status = FrameStatus::Registers;

        while frames.len() < self.max_frames {
            if fp.is_null() || fp < low || fp >= high {
                break;
            }
            let Some(cfa) = fp.checked_add(2 * ptr) else {
                break;
            };
            frames.push(StackFrame {
                thread: context.thread,
                depth: u32::try_from(frames.len()).unwrap_or(u32::MAX),
                pc,
                sp,
                fp,
                cfa,
                status,
            });

            let (Ok(saved_fp), Ok(return_pc)) = (self.memory.read_word(fp), self.memory.read_word(fp.saturating_add(ptr)))
            else {
                break;
            };
            if saved_fp <= fp || return_pc.is_null() {
                break;
            }

            pc = return_pc;
            sp = cfa;
            fp = saved_fp;
            status = FrameStatus::FramePointer;
        }

        trace!(thread = %context.thread, frames = frames.len(), "walked stack");
        frames
    }
}
