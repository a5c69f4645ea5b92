//! arm64 Kernel Live Patching core (no_std)
//!
//! Redirects calls from an original kernel function to a replacement while
//! the original may be running on other CPUs, and restores the original
//! instruction words exactly when the last replacement goes away.
//!
//! - Redirect: one `B` at the function entry, or a 4-word
//!   `movn/movk/movk/br x16` trampoline when the replacement is beyond
//!   ±128 MiB and [`ArchConfig`] allows it
//! - Stacking: each patch site keeps its replacements newest first; the
//!   site always points at the newest one
//! - Activeness check: every task's stack is walked (through exception
//!   entry frames) before a transition, and a hit vetoes it
//! - Registry: lock-free lookups, removals reclaimed after a grace period
//!
//! # Patch site layout
//!
//! ```text
//!            unpatched            branch              trampoline
//! A + 0x0    insn0                b     R             movn  x16, #~R[15:0]
//! A + 0x4    insn1                insn1               movk  x16, #R[31:16], lsl #16
//! A + 0x8    insn2                insn2               movk  x16, #R[47:32], lsl #32
//! A + 0xc    insn3                insn3               br    x16
//! ```
//!
//! # Locking
//!
//! `klp_mutex` (whole-patch transitions) is taken before `text_mutex`
//! (per-function enable/disable), which is taken before the registry's list
//! update locks. Registry readers take no lock.
//!
//! # SMP safety
//!
//! - Every instruction write is a single 32-bit store through
//!   [`TextOps::patch_text_nosync`]. A trampoline is four such stores and a
//!   CPU fetching the site in between can see a mix of old and new words.
//! - The activeness check is best effort: a task can enter a function after
//!   its stack was walked and before the site is rewritten.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod calltrace;
pub mod config;
pub mod insn;
pub mod ops;
pub mod patch;
pub mod rcu;
pub mod rculist;
pub mod redirect;
pub mod registry;
pub mod reloc;
pub mod stacktrace;
pub mod transition;

#[cfg(test)]
mod testing;

use alloc::string::String;
use core::fmt;
use klog::Kptr;
use spin::Mutex;

pub use config::ArchConfig;
pub use ops::{PtRegs, StackFrame, StackOps, TaskInfo, TextOps};
pub use patch::{KlpFunc, KlpObject, KlpPatch};
pub use registry::Registry;
pub use reloc::ModuleOps;

use redirect::Redirect;
use registry::{PatchEntry, SavedOriginal};

// ============================================================================
// Error model
// ============================================================================

#[repr(i64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Errno {
    EPERM = -1,
    ENOENT = -2,
    ENOMEM = -12,
    EFAULT = -14,
    EBUSY = -16,
    EINVAL = -22,
    ERANGE = -34,
}

impl Errno {
    #[inline]
    pub const fn as_i64(self) -> i64 {
        self as i64
    }
}

/// Why a live-patch operation was refused.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KlpError {
    /// `func` is on the stack of task `pid`.
    Busy { func: String, pid: u32 },
    NoMemory,
    /// The instruction write at `addr` was refused.
    WriteDenied { addr: usize },
    /// The original instruction at `addr` could not be read.
    Fault { addr: usize },
    /// No encodable jump from `pc` reaches `target`.
    OutOfRange { pc: usize, target: usize },
    /// The module loader failed to apply a relocation.
    Reloc { errno: Errno },
}

impl KlpError {
    pub fn errno(&self) -> Errno {
        match self {
            Self::Busy { .. } => Errno::EBUSY,
            Self::NoMemory => Errno::ENOMEM,
            Self::WriteDenied { .. } => Errno::EPERM,
            Self::Fault { .. } => Errno::EFAULT,
            Self::OutOfRange { .. } => Errno::ERANGE,
            Self::Reloc { errno } => *errno,
        }
    }
}

impl From<KlpError> for Errno {
    fn from(err: KlpError) -> Self {
        err.errno()
    }
}

impl fmt::Display for KlpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy { func, pid } => write!(f, "{} is in use by pid {}", func, pid),
            Self::NoMemory => f.write_str("out of memory"),
            Self::WriteDenied { addr } => write!(f, "text write at {} denied", Kptr(*addr)),
            Self::Fault { addr } => write!(f, "cannot read text at {}", Kptr(*addr)),
            Self::OutOfRange { pc, target } => {
                write!(f, "no jump from {} reaches {}", Kptr(*pc), Kptr(*target))
            }
            Self::Reloc { errno } => write!(f, "relocation failed ({:?})", errno),
        }
    }
}

// ============================================================================
// Live-patch core
// ============================================================================

/// What a site goes back to once an entry is popped.
enum Restore {
    Redirect(usize),
    Original(SavedOriginal),
}

/// One live-patch core bound to the kernel's text and stack services.
pub struct Livepatch<'a> {
    text: &'a dyn TextOps,
    stack: &'a dyn StackOps,
    cfg: ArchConfig,
    registry: Registry,
    /// Serializes whole-patch transitions.
    klp_mutex: Mutex<()>,
    /// Serializes registry updates together with the text they describe.
    text_mutex: Mutex<()>,
}

impl<'a> Livepatch<'a> {
    pub fn new(text: &'a dyn TextOps, stack: &'a dyn StackOps, cfg: ArchConfig) -> Self {
        Self {
            text,
            stack,
            cfg,
            registry: Registry::new(),
            klp_mutex: Mutex::new(()),
            text_mutex: Mutex::new(()),
        }
    }

    #[inline]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[inline]
    pub fn config(&self) -> &ArchConfig {
        &self.cfg
    }

    /// Per-function setup when a patch is registered. Nothing to do; the
    /// patch site is captured on first enable.
    pub fn init_func(&self, _obj: &KlpObject, _func: &KlpFunc) -> Result<(), KlpError> {
        Ok(())
    }

    /// Undo [`Livepatch::init_func`] for the functions of `obj` up to `limit`.
    pub fn free_func(&self, _obj: &KlpObject, _limit: &KlpFunc) {}

    /// Veto a transition while affected code is on any task's stack.
    pub fn check_activeness(&self, patch: &KlpPatch, enable: bool) -> Result<(), KlpError> {
        calltrace::check_calltrace(self.stack, patch, enable)
    }

    /// Called before a batch of text modifications.
    pub fn code_modify_prepare(&self) {
        self.text.pause_text_scanner();
    }

    /// Called after a batch of text modifications.
    pub fn code_modify_post_process(&self) {
        self.text.resume_text_scanner();
    }

    /// [`Livepatch::code_modify_prepare`] now, post-processing on drop.
    pub fn code_modify_scope(&self) -> CodeModifyGuard<'_, 'a> {
        self.code_modify_prepare();
        CodeModifyGuard { lp: self }
    }

    /// Redirect `func.old_addr` to `func.new_func`.
    ///
    /// The first replacement for a site captures its original words and
    /// creates its node. On failure the site is left as it was before the
    /// call, as far as the text allows writes.
    pub fn enable_func(&self, func: &KlpFunc) -> Result<(), KlpError> {
        let _text = self.text_mutex.lock();

        let pc = func.old_addr;
        let entry = PatchEntry::from(func);
        let pushed = {
            let guard = self.registry.read_lock();
            self.registry
                .find(&guard, pc)
                .map(|node| self.registry.push(node, entry))
        };
        match pushed {
            Some(res) => res?,
            None => {
                let saved = SavedOriginal::capture(self.text, &self.cfg, pc)?;
                self.registry.create(pc, saved, entry)?;
            }
        }

        if let Err(e) = self.redirect(pc, func.new_func) {
            klog::klog!(Error, "livepatch: failed to patch {}: {}", func.old_name, e);
            self.disable_locked(func);
            return Err(e);
        }
        Ok(())
    }

    /// Remove `func`'s replacement from its site.
    ///
    /// # Panics
    ///
    /// If `func` was never enabled.
    pub fn disable_func(&self, func: &KlpFunc) {
        let _text = self.text_mutex.lock();
        self.disable_locked(func);
    }

    /// Apply a relocation inside `module` for a patch that references it.
    pub fn write_module_reloc(
        &self,
        module: &dyn ModuleOps,
        r_type: u32,
        loc: usize,
        value: usize,
    ) -> Result<(), KlpError> {
        reloc::write_module_reloc(self.text, &self.cfg, module, r_type, loc, value)
    }

    fn redirect(&self, pc: usize, target: usize) -> Result<(), KlpError> {
        let redirect = Redirect::build(&self.cfg, self.text, pc, target)?;
        redirect::write_insns(self.text, pc, redirect.words())
    }

    /// Caller holds `text_mutex`.
    fn disable_locked(&self, func: &KlpFunc) {
        let pc = func.old_addr;
        let restore = {
            let guard = self.registry.read_lock();
            let Some(node) = self.registry.find(&guard, pc) else {
                klog::klog_force!("livepatch: disabling {}: no patch node", func.old_name);
                panic!("livepatch: {} at {} is not patched", func.old_name, Kptr(pc));
            };
            if !self.registry.pop(node, func.new_func) {
                klog::klog_force!(
                    "livepatch: disabling {}: replacement not among {} entries",
                    func.old_name,
                    node.depth(&guard)
                );
                panic!(
                    "livepatch: {} at {} has no replacement {}",
                    func.old_name,
                    Kptr(pc),
                    Kptr(func.new_func)
                );
            }
            match node.top(&guard) {
                Some(top) => Restore::Redirect(top.new_func),
                None => Restore::Original(*node.saved()),
            }
        };

        match restore {
            Restore::Redirect(target) => {
                if let Err(e) = self.redirect(pc, target) {
                    klog::klog!(Error, "livepatch: failed to unpatch {}: {}", func.old_name, e);
                }
            }
            Restore::Original(saved) => {
                if let Err(e) = redirect::write_insns(self.text, pc, saved.words()) {
                    klog::klog!(Error, "livepatch: failed to restore {}: {}", func.old_name, e);
                }
                self.registry.remove(pc);
            }
        }
        self.registry.poll();
    }
}

/// Scope of a batch of text modifications.
pub struct CodeModifyGuard<'l, 'a> {
    lp: &'l Livepatch<'a>,
}

impl Drop for CodeModifyGuard<'_, '_> {
    fn drop(&mut self) {
        self.lp.code_modify_post_process();
    }
}
