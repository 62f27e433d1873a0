//! CPU register snapshots recovered from a core file.

use super::{Address, Architecture};

/// Register names in `user_regs_struct` order, as stored in x86-64 `NT_PRSTATUS` notes.
const X86_64_PRSTATUS_NAMES: [&str; 27] = [
    "r15", "r14", "r13", "r12", "rbp", "rbx", "r11", "r10", "r9", "r8", "rax", "rcx", "rdx", "rsi", "rdi", "orig_rax",
    "rip", "cs", "eflags", "rsp", "ss", "fs_base", "gs_base", "ds", "es", "fs", "gs",
];

/// Slots of the x86-64 prstatus register block that hold program values.
///
/// Segment selectors, flags and `orig_rax` never contain heap pointers.
const X86_64_VALUE_SLOTS: [usize; 17] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 21, 22];

const X86_64_RBP: usize = 4;
const X86_64_RIP: usize = 16;
const X86_64_EFLAGS: usize = 18;
const X86_64_RSP: usize = 19;

/// `x0..x30, sp, pc, pstate` in AArch64 `NT_PRSTATUS` notes.
const ARM64_REGISTER_COUNT: usize = 34;
const ARM64_FP: usize = 29;
const ARM64_SP: usize = 31;
const ARM64_PC: usize = 32;
const ARM64_PSTATE: usize = 33;

/// Register state of one execution context at capture time
///
/// `general` keeps the raw register block in the order the kernel wrote it, so
/// that register roots can be named after the slot they came from. The
/// commonly needed values (PC, SP, FP) are decoded into dedicated fields.
///
/// ## Example
///
/// ```rust
/// use heapdig_core::types::{Address, Architecture, Registers};
///
/// let mut block = vec![0u64; 34];
/// block[29] = 0x7fff_0010; // x29 / frame pointer
/// block[31] = 0x7fff_0000; // sp
/// block[32] = 0x40_1000; // pc
/// let regs = Registers::from_prstatus(Architecture::Arm64, &block);
/// assert_eq!(regs.pc, Address::new(0x40_1000));
/// assert_eq!(regs.fp, Address::new(0x7fff_0010));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registers
{
    /// Program Counter (RIP / PC)
    pub pc: Address,
    /// Stack Pointer (RSP / SP)
    pub sp: Address,
    /// Frame Pointer (RBP / X29)
    pub fp: Address,
    /// Raw register block in note order
    pub general: Vec<u64>,
    /// Status/Flags register (RFLAGS / PSTATE)
    pub status: u64,
    architecture: Architecture,
}

impl Registers
{
    /// Create an empty register set for the given architecture
    pub fn new(architecture: Architecture) -> Self
    {
        Self {
            pc: Address::ZERO,
            sp: Address::ZERO,
            fp: Address::ZERO,
            general: Vec::new(),
            status: 0,
            architecture,
        }
    }

    /// Decode the `pr_reg` block of an `NT_PRSTATUS` note
    ///
    /// Missing trailing registers read as zero, so a truncated block still
    /// yields a usable (if incomplete) register set.
    pub fn from_prstatus(architecture: Architecture, block: &[u64]) -> Self
    {
        let at = |index: usize| block.get(index).copied().unwrap_or(0);
        let (pc, sp, fp, status) = match architecture {
            Architecture::X86_64 => (at(X86_64_RIP), at(X86_64_RSP), at(X86_64_RBP), at(X86_64_EFLAGS)),
            Architecture::Arm64 => (at(ARM64_PC), at(ARM64_SP), at(ARM64_FP), at(ARM64_PSTATE)),
        };

        Self {
            pc: Address::from(pc),
            sp: Address::from(sp),
            fp: Address::from(fp),
            general: block.to_vec(),
            status,
            architecture,
        }
    }

    /// Number of 64-bit words in the `pr_reg` block for `architecture`
    pub const fn prstatus_len(architecture: Architecture) -> usize
    {
        match architecture {
            Architecture::X86_64 => X86_64_PRSTATUS_NAMES.len(),
            Architecture::Arm64 => ARM64_REGISTER_COUNT,
        }
    }

    pub fn architecture(&self) -> Architecture
    {
        self.architecture
    }

    /// Human-readable name of the register at `index` in `general`
    pub fn name(&self, index: usize) -> String
    {
        match self.architecture {
            Architecture::X86_64 => X86_64_PRSTATUS_NAMES
                .get(index)
                .map_or_else(|| format!("r?{index}"), |name| (*name).to_string()),
            Architecture::Arm64 => match index {
                ARM64_FP => "fp".to_string(),
                30 => "lr".to_string(),
                ARM64_SP => "sp".to_string(),
                ARM64_PC => "pc".to_string(),
                ARM64_PSTATE => "pstate".to_string(),
                _ => format!("x{index}"),
            },
        }
    }

    /// Registers that may hold program values, as `(index, value)` pairs
    ///
    /// Control registers (flags, selectors, the program counter) are left out.
    pub fn value_registers(&self) -> Vec<(usize, u64)>
    {
        let indices: Vec<usize> = match self.architecture {
            Architecture::X86_64 => X86_64_VALUE_SLOTS.to_vec(),
            Architecture::Arm64 => (0..=ARM64_SP).collect(),
        };
        indices
            .into_iter()
            .filter_map(|index| self.general.get(index).map(|value| (index, *value)))
            .collect()
    }
}
