//! Activeness check: refuse a transition while affected code is on a stack.

use alloc::string::String;
use core::ops::ControlFlow;

use crate::ops::StackOps;
use crate::patch::{KlpFunc, KlpPatch};
use crate::stacktrace::walk_stackframe;
use crate::KlpError;

/// First function of `patch` whose guarded range contains `pc`.
fn busy_func(patch: &KlpPatch, enable: bool, pc: usize) -> Option<&KlpFunc> {
    patch.funcs().find(|func| {
        func.busy_range(enable)
            .is_some_and(|range| range.contains(&pc))
    })
}

/// Walk every task's stack and veto the transition on the first hit.
///
/// Enabling guards each non-forced original body, disabling guards every
/// replacement body. A task can still enter a guarded function after it has
/// been walked; the check does not stop other CPUs.
pub fn check_calltrace(
    ops: &dyn StackOps,
    patch: &KlpPatch,
    enable: bool,
) -> Result<(), KlpError> {
    let mut result = Ok(());

    ops.for_each_task(&mut |task| {
        let mut frame = task.frame;
        let mut hit: Option<&KlpFunc> = None;
        walk_stackframe(ops, task, &mut frame, |f| match busy_func(patch, enable, f.pc) {
            Some(func) => {
                hit = Some(func);
                ControlFlow::Break(())
            }
            None => ControlFlow::Continue(()),
        });

        let Some(func) = hit else {
            return ControlFlow::Continue(());
        };
        klog::klog!(Error, "func {} is in use!", func.old_name);
        klog::klog!(Info, "PID: {} Comm: {:.20}", task.pid, task.comm);
        ops.show_stack(task);
        result = Err(KlpError::Busy {
            func: String::from(func.old_name.as_str()),
            pid: task.pid,
        });
        ControlFlow::Break(())
    });

    result
}
