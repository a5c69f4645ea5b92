//! Whole-patch transitions.
//!
//! A patch goes live or away as a unit: the activeness check covers every
//! function before any site is touched, and a failed enable takes back the
//! functions it already redirected.

use alloc::vec::Vec;

use crate::patch::{KlpFunc, KlpPatch};
use crate::{KlpError, Livepatch};

impl Livepatch<'_> {
    /// Redirect every function of `patch`.
    pub fn enable_patch(&self, patch: &KlpPatch) -> Result<(), KlpError> {
        let _klp = self.klp_mutex.lock();
        let _modify = self.code_modify_scope();

        self.check_activeness(patch, true)?;

        let mut applied: Vec<&KlpFunc> = Vec::new();
        for func in patch.funcs() {
            if let Err(e) = self.enable_func(func) {
                klog::klog!(
                    Error,
                    "livepatch: {}: enabling {} failed, reverting {} functions",
                    patch.name,
                    func.old_name,
                    applied.len()
                );
                for done in applied.into_iter().rev() {
                    self.disable_func(done);
                }
                return Err(e);
            }
            applied.push(func);
        }

        klog::klog!(Info, "livepatch: {} enabled", patch.name);
        Ok(())
    }

    /// Remove every function of `patch`, last one first.
    pub fn disable_patch(&self, patch: &KlpPatch) -> Result<(), KlpError> {
        let _klp = self.klp_mutex.lock();
        let _modify = self.code_modify_scope();

        self.check_activeness(patch, false)?;

        for func in patch.funcs().rev() {
            self.disable_func(func);
        }

        klog::klog!(Info, "livepatch: {} disabled", patch.name);
        Ok(())
    }
}
