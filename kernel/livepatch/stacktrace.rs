//! Frame-pointer stack walker that sees through exception entry.
//!
//! A plain frame-pointer unwind stops making sense at an exception: the
//! entry code saves the interrupted context in a [`PtRegs`] area on the
//! stack instead of building a frame record. When a frame's pc lies in entry
//! text, the walker reads that area, reports the interrupted pc as an extra
//! frame and resumes from the saved `x29`/`sp`/`x30`.

use core::mem::size_of;
use core::ops::ControlFlow;

use crate::ops::{PtRegs, StackFrame, StackOps, TaskInfo};

/// Frames visited per task before giving up on a corrupt or cyclic chain.
pub const MAX_STACK_DEPTH: usize = 1024;

/// Space the saved `sp` must leave below the stack top.
const SP_TO_PC_SIZE: usize = 0x18;

/// Walk `task`'s stack starting at `frame`, calling `visit` for each frame.
///
/// Stops when `visit` breaks, when `fp` or `sp` becomes zero, when the
/// unwind step fails, when a register save area fails its bounds check, or
/// after [`MAX_STACK_DEPTH`] iterations. `frame` holds the last state
/// reached.
pub fn walk_stackframe<F>(
    ops: &dyn StackOps,
    task: &TaskInfo<'_>,
    frame: &mut StackFrame,
    mut visit: F,
) where
    F: FnMut(&StackFrame) -> ControlFlow<()>,
{
    let low = task.stack_base;
    let high = task.stack_end();

    for _ in 0..MAX_STACK_DEPTH {
        if visit(frame).is_break() {
            return;
        }

        if ops.in_entry_text(frame.pc) {
            let Some(regs) = trap_regs(ops, frame.sp, low, high) else {
                return;
            };
            let interrupted = StackFrame::new(regs.fp(), regs.sp, regs.pc);
            if visit(&interrupted).is_break() {
                return;
            }
            *frame = StackFrame::new(regs.fp(), regs.sp, regs.lr());
            continue;
        }

        if frame.fp == 0 || frame.sp == 0 {
            return;
        }
        if ops.unwind_frame(frame).is_err() {
            return;
        }
    }

    klog::klog!(
        Warn,
        "livepatch: pid {} stack deeper than {} frames, walk truncated",
        task.pid,
        MAX_STACK_DEPTH
    );
}

/// Read the save area at `addr` if it and its saved `sp` lie on the stack.
fn trap_regs(ops: &dyn StackOps, addr: usize, low: usize, high: usize) -> Option<PtRegs> {
    let end = addr.checked_add(size_of::<PtRegs>())?;
    if addr < low || end > high {
        return None;
    }
    let regs = ops.read_pt_regs(addr)?;
    if regs.sp < low || regs.sp > high.saturating_sub(SP_TO_PC_SIZE) {
        return None;
    }
    Some(regs)
}
