//! Kernel-provided operations consumed by the live-patch core.
//!
//! The core never touches kernel text or task stacks directly. Instruction
//! reads/writes, page protection and scanner pausing go through [`TextOps`];
//! task enumeration, the frame-pointer unwind step and register save area
//! reads go through [`StackOps`].

use core::ops::ControlFlow;

use crate::insn;
use crate::Errno;

/// Kernel text access: the instruction codec plus memory protection.
pub trait TextOps: Sync {
    /// Read the 32-bit instruction word at `addr`.
    fn read_insn(&self, addr: usize) -> Result<u32, Errno>;

    /// Write one instruction word at `addr` without stopping other CPUs.
    ///
    /// Each write must be single-copy atomic and followed by the cache
    /// maintenance that makes it visible to instruction fetch. Nothing is
    /// promised about a sequence of writes as a whole.
    fn patch_text_nosync(&self, addr: usize, insn: u32) -> Result<(), Errno>;

    /// Encode `B target` placed at `pc`, or `None` if it cannot be encoded.
    fn encode_branch(&self, pc: usize, target: usize) -> Option<u32> {
        insn::gen_branch_imm(pc, target)
    }

    /// Temporarily make `[addr, addr + len)` writable.
    ///
    /// Implementations must only accept kernel or module text pages.
    fn make_text_writable(&self, addr: usize, len: usize) -> Result<(), Errno>;

    /// Restore read-only protection after [`TextOps::make_text_writable`].
    fn make_text_readonly(&self, addr: usize, len: usize);

    /// Pause background text scanners (integrity checkers) that would flag
    /// the bytes about to change.
    fn pause_text_scanner(&self) {}

    /// Undo [`TextOps::pause_text_scanner`].
    fn resume_text_scanner(&self) {}
}

/// Frame-pointer unwind state for one task.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StackFrame {
    pub fp: usize,
    pub sp: usize,
    pub pc: usize,
}

impl StackFrame {
    pub const fn new(fp: usize, sp: usize, pc: usize) -> Self {
        Self { fp, sp, pc }
    }
}

/// Register save area pushed by the exception entry code.
///
/// Matches the leading part of the arm64 `pt_regs` layout.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PtRegs {
    /// x0..x30; x29 is the frame pointer, x30 the link register.
    pub regs: [usize; 31],
    pub sp: usize,
    pub pc: usize,
    pub pstate: usize,
}

impl PtRegs {
    pub const FP: usize = 29;
    pub const LR: usize = 30;

    pub const fn zeroed() -> Self {
        Self {
            regs: [0; 31],
            sp: 0,
            pc: 0,
            pstate: 0,
        }
    }

    #[inline]
    pub fn fp(&self) -> usize {
        self.regs[Self::FP]
    }

    #[inline]
    pub fn lr(&self) -> usize {
        self.regs[Self::LR]
    }
}

/// Snapshot of one task as seen by the activeness check.
#[derive(Clone, Copy, Debug)]
pub struct TaskInfo<'a> {
    pub pid: u32,
    pub comm: &'a str,
    /// Saved fp/sp/pc of the task (`thread_saved_*`).
    pub frame: StackFrame,
    /// Lowest address of the task's kernel stack.
    pub stack_base: usize,
    pub stack_size: usize,
}

impl TaskInfo<'_> {
    /// One past the highest stack address.
    #[inline]
    pub fn stack_end(&self) -> usize {
        self.stack_base.saturating_add(self.stack_size)
    }
}

/// Task and stack access for the activeness check.
pub trait StackOps: Sync {
    /// Call `f` for every thread in the system until it returns `Break`.
    fn for_each_task(&self, f: &mut dyn FnMut(&TaskInfo<'_>) -> ControlFlow<()>);

    /// One frame-pointer unwind step, updating `frame` in place.
    fn unwind_frame(&self, frame: &mut StackFrame) -> Result<(), Errno>;

    /// Returns `true` if `pc` lies in the exception entry text.
    fn in_entry_text(&self, pc: usize) -> bool;

    /// Read the register save area stored at `addr`.
    fn read_pt_regs(&self, addr: usize) -> Option<PtRegs>;

    /// Dump the stack of `task` to the kernel log.
    fn show_stack(&self, _task: &TaskInfo<'_>) {}
}
