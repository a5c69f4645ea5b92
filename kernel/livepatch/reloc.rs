//! Relocation writes into a loaded module on behalf of a patch.

use core::ops::Range;

use crate::config::ArchConfig;
use crate::insn;
use crate::ops::TextOps;
use crate::{Errno, KlpError};

pub const PAGE_SIZE: usize = 4096;

/// `B imm26`
pub const R_AARCH64_JUMP26: u32 = 282;
/// `BL imm26`
pub const R_AARCH64_CALL26: u32 = 283;

/// Module loader services needed to apply one relocation.
pub trait ModuleOps {
    fn name(&self) -> &str;

    /// Read-only part of the module core, if it is mapped read-only.
    fn core_ro_range(&self) -> Option<Range<usize>>;

    /// Allocate a PLT veneer jumping to `value` and return its address.
    fn emit_plt_entry(&self, value: usize) -> Result<usize, Errno>;

    /// Apply relocation `r_type` at `loc` with resolved `value`.
    fn static_relocate(&self, r_type: u32, loc: usize, value: usize) -> Result<(), Errno>;
}

#[inline]
fn page_of(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

fn is_branch26(r_type: u32) -> bool {
    r_type == R_AARCH64_JUMP26 || r_type == R_AARCH64_CALL26
}

/// Write relocation `r_type` at `loc` in `module`.
///
/// A location in the module's read-only core is made writable for the
/// duration of the write and made read-only again whatever the outcome.
pub fn write_module_reloc(
    text: &dyn TextOps,
    cfg: &ArchConfig,
    module: &dyn ModuleOps,
    r_type: u32,
    loc: usize,
    value: usize,
) -> Result<(), KlpError> {
    let readonly = module
        .core_ro_range()
        .is_some_and(|ro| ro.contains(&loc));

    if readonly {
        text.make_text_writable(page_of(loc), PAGE_SIZE)
            .map_err(|_| KlpError::WriteDenied { addr: loc })?;
    }

    let ret = relocate(cfg, module, r_type, loc, value);

    if readonly {
        text.make_text_readonly(page_of(loc), PAGE_SIZE);
    }
    if let Err(ref e) = ret {
        klog::klog!(
            Error,
            "livepatch: {}: relocation {} at {} failed: {}",
            module.name(),
            r_type,
            klog::Kptr(loc),
            e
        );
    }
    ret
}

fn relocate(
    cfg: &ArchConfig,
    module: &dyn ModuleOps,
    r_type: u32,
    loc: usize,
    mut value: usize,
) -> Result<(), KlpError> {
    if let Some(range) = cfg.max_branch_range {
        if is_branch26(r_type) && !insn::offset_in_range(value, loc, range) {
            let plt = module
                .emit_plt_entry(value)
                .map_err(|errno| KlpError::Reloc { errno })?;
            klog::klog!(
                Debug,
                "livepatch: {}: {:#x} -> {:#x} via plt {:#x}",
                module.name(),
                loc,
                value,
                plt
            );
            value = plt;
        }
    }
    module
        .static_relocate(r_type, loc, value)
        .map_err(|errno| KlpError::Reloc { errno })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::SZ_128M;
    use crate::testing::FakeText;
    use core::sync::atomic::Ordering;
    use spin::Mutex;
    use std::vec::Vec;

    const CORE: usize = 0xffff_0000_0800_0000;
    const PLT: usize = CORE + 0x3000;

    struct FakeModule {
        fail: Option<Errno>,
        applied: Mutex<Vec<(u32, usize, usize)>>,
        plts: Mutex<Vec<usize>>,
        /// Writable state of the location right after each call.
        writable_seen: Mutex<Vec<bool>>,
    }

    impl FakeModule {
        fn new(fail: Option<Errno>) -> Self {
            Self {
                fail,
                applied: Mutex::new(Vec::new()),
                plts: Mutex::new(Vec::new()),
                writable_seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl ModuleOps for FakeModule {
        fn name(&self) -> &str {
            "ext4"
        }

        fn core_ro_range(&self) -> Option<Range<usize>> {
            Some(CORE..CORE + 0x2000)
        }

        fn emit_plt_entry(&self, value: usize) -> Result<usize, Errno> {
            self.plts.lock().push(value);
            Ok(PLT)
        }

        fn static_relocate(&self, r_type: u32, loc: usize, value: usize) -> Result<(), Errno> {
            if let Some(errno) = self.fail {
                return Err(errno);
            }
            self.applied.lock().push((r_type, loc, value));
            Ok(())
        }
    }

    fn reloc(
        text: &FakeText,
        cfg: &ArchConfig,
        module: &FakeModule,
        r_type: u32,
        loc: usize,
        value: usize,
    ) -> Result<(), KlpError> {
        let res = write_module_reloc(text, cfg, module, r_type, loc, value);
        module.writable_seen.lock().push(text.is_writable(loc));
        res
    }

    #[test]
    fn test_readonly_core_is_bracketed() {
        let text = FakeText::new();
        let module = FakeModule::new(None);
        let loc = CORE + 0x1234;
        reloc(&text, &ArchConfig::DIRECT, &module, 257, loc, 0x42).unwrap();
        assert_eq!(text.protection_changes.load(Ordering::SeqCst), 2);
        assert_eq!(*module.writable_seen.lock(), [false]);
        assert_eq!(*module.applied.lock(), [(257, loc, 0x42)]);

        // Outside the read-only core nothing is toggled.
        reloc(&text, &ArchConfig::DIRECT, &module, 257, CORE + 0x2000, 0x42).unwrap();
        assert_eq!(text.protection_changes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failure_still_restores_readonly() {
        let text = FakeText::new();
        let module = FakeModule::new(Some(Errno::ENOENT));
        let err = reloc(&text, &ArchConfig::DIRECT, &module, 257, CORE + 8, 0).unwrap_err();
        assert_eq!(err, KlpError::Reloc { errno: Errno::ENOENT });
        assert_eq!(text.protection_changes.load(Ordering::SeqCst), 2);
        assert!(!text.is_writable(CORE + 8));
    }

    #[test]
    fn test_far_call_goes_through_plt() {
        let text = FakeText::new();
        let module = FakeModule::new(None);
        let loc = CORE + 0x2100;
        let far = loc + SZ_128M + 4;

        reloc(&text, &ArchConfig::MODULE_PLTS, &module, R_AARCH64_CALL26, loc, far).unwrap();
        assert_eq!(*module.plts.lock(), [far]);
        assert_eq!(module.applied.lock()[0], (R_AARCH64_CALL26, loc, PLT));

        // Near targets and other relocation types are applied as is.
        let near = loc + 0x100;
        reloc(&text, &ArchConfig::MODULE_PLTS, &module, R_AARCH64_JUMP26, loc, near).unwrap();
        reloc(&text, &ArchConfig::MODULE_PLTS, &module, 257, loc, far).unwrap();
        assert_eq!(module.plts.lock().len(), 1);

        // Without trampolines there is no PLT either.
        reloc(&text, &ArchConfig::DIRECT, &module, R_AARCH64_JUMP26, loc, far).unwrap();
        assert_eq!(module.plts.lock().len(), 1);
        assert_eq!(module.applied.lock()[3], (R_AARCH64_JUMP26, loc, far));
    }
}
