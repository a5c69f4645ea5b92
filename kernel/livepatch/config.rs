//! Patch-site capability configuration.

use crate::insn::SZ_128M;

/// How far a patch site may redirect with a single branch.
///
/// `max_branch_range == None` means every replacement is assumed to be within
/// direct-branch reach, only one word is saved per site, and an unencodable
/// branch is an error. `Some(range)` saves [`crate::insn::KLP_MAX_INSNS`] words
/// per site and falls back to the absolute-jump trampoline beyond `range`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArchConfig {
    pub max_branch_range: Option<usize>,
}

impl ArchConfig {
    /// Replacements always live next to the kernel image.
    pub const DIRECT: Self = Self {
        max_branch_range: None,
    };

    /// Replacements may live in module space beyond `B` reach.
    pub const MODULE_PLTS: Self = Self {
        max_branch_range: Some(SZ_128M),
    };

    /// Returns `true` if out-of-range targets use a trampoline.
    #[inline]
    pub const fn uses_trampolines(&self) -> bool {
        self.max_branch_range.is_some()
    }
}

impl Default for ArchConfig {
    fn default() -> Self {
        if cfg!(feature = "module-plts") {
            Self::MODULE_PLTS
        } else {
            Self::DIRECT
        }
    }
}
