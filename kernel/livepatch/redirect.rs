//! Choice between a direct branch and an absolute-jump trampoline.

use crate::config::ArchConfig;
use crate::insn::{self, AARCH64_INSN_SIZE, KLP_MAX_INSNS};
use crate::ops::TextOps;
use crate::KlpError;

/// Instruction words that send a patch site to its replacement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Redirect {
    /// `b target`
    Branch(u32),
    /// `movn/movk/movk x16; br x16`
    Trampoline([u32; KLP_MAX_INSNS]),
}

impl Redirect {
    /// Encode a jump from `pc` to `target` under `cfg`.
    pub fn build(
        cfg: &ArchConfig,
        text: &dyn TextOps,
        pc: usize,
        target: usize,
    ) -> Result<Self, KlpError> {
        let direct = match cfg.max_branch_range {
            Some(range) => insn::offset_in_range(pc, target, range),
            None => true,
        };

        if direct {
            if let Some(branch) = text.encode_branch(pc, target) {
                return Ok(Self::Branch(branch));
            }
            // A configured window wider than `B` reach still needs a
            // trampoline for what the encoder rejects.
            if !cfg.uses_trampolines() {
                return Err(KlpError::OutOfRange { pc, target });
            }
        }

        if !insn::trampoline_reaches(target) {
            return Err(KlpError::OutOfRange { pc, target });
        }
        klog::klog!(
            Debug,
            "livepatch: {:#x} -> {:#x} out of branch range, using trampoline",
            pc,
            target
        );
        Ok(Self::Trampoline(insn::gen_trampoline(target)))
    }

    pub fn words(&self) -> &[u32] {
        match self {
            Self::Branch(insn) => core::slice::from_ref(insn),
            Self::Trampoline(insns) => insns,
        }
    }

    pub fn is_trampoline(&self) -> bool {
        matches!(self, Self::Trampoline(_))
    }
}

/// Write `insns` at consecutive words from `pc`, one atomic write at a time.
///
/// Stops at the first refused write; earlier words stay written.
pub fn write_insns(text: &dyn TextOps, pc: usize, insns: &[u32]) -> Result<(), KlpError> {
    for (i, insn) in insns.iter().enumerate() {
        let addr = pc + i * AARCH64_INSN_SIZE;
        text.patch_text_nosync(addr, *insn)
            .map_err(|_| KlpError::WriteDenied { addr })?;
    }
    Ok(())
}
