//! Function patch node registry.
//!
//! One [`FuncNode`] exists per patched entry address. It remembers the
//! instruction words that were at the site before the first patch and a stack
//! of [`PatchEntry`] values, newest on top. Lookups are lock-free under an
//! [`RcuReadGuard`]; unlinked nodes and entries are reclaimed after a grace
//! period of the registry's own [`RcuDomain`].

use crate::config::ArchConfig;
use crate::insn::{AARCH64_INSN_SIZE, KLP_MAX_INSNS};
use crate::ops::TextOps;
use crate::patch::KlpFunc;
use crate::rcu::{RcuDomain, RcuReadGuard};
use crate::rculist::{Iter, RcuList};
use crate::KlpError;

/// Instruction words saved from a patch site before it was first modified.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SavedOriginal {
    /// Direct-branch-only sites: the one word the branch overwrites.
    Single(u32),
    /// Sites that may receive a trampoline: every word it could overwrite.
    Sequence([u32; KLP_MAX_INSNS]),
}

impl SavedOriginal {
    /// Read the words at `pc`, as many as `cfg` may ever overwrite.
    pub fn capture(text: &dyn TextOps, cfg: &ArchConfig, pc: usize) -> Result<Self, KlpError> {
        let read = |addr: usize| text.read_insn(addr).map_err(|_| KlpError::Fault { addr });
        if cfg.uses_trampolines() {
            let mut insns = [0u32; KLP_MAX_INSNS];
            for (i, insn) in insns.iter_mut().enumerate() {
                *insn = read(pc + i * AARCH64_INSN_SIZE)?;
            }
            Ok(Self::Sequence(insns))
        } else {
            Ok(Self::Single(read(pc)?))
        }
    }

    pub fn words(&self) -> &[u32] {
        match self {
            Self::Single(insn) => core::slice::from_ref(insn),
            Self::Sequence(insns) => insns,
        }
    }
}

/// One applied replacement for a patch site.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PatchEntry {
    pub new_func: usize,
    pub new_size: usize,
    pub force: bool,
}

impl From<&KlpFunc> for PatchEntry {
    fn from(func: &KlpFunc) -> Self {
        Self {
            new_func: func.new_func,
            new_size: func.new_size,
            force: func.force,
        }
    }
}

/// Patch state of one original function.
pub struct FuncNode {
    old_addr: usize,
    old_insns: SavedOriginal,
    func_stack: RcuList<PatchEntry>,
}

impl FuncNode {
    #[inline]
    pub fn old_addr(&self) -> usize {
        self.old_addr
    }

    #[inline]
    pub fn saved(&self) -> &SavedOriginal {
        &self.old_insns
    }

    /// The entry whose replacement the site currently points at.
    pub fn top<'g>(&'g self, guard: &'g RcuReadGuard<'_>) -> Option<&'g PatchEntry> {
        self.func_stack.first(guard)
    }

    /// Entries from newest to oldest.
    pub fn entries<'g>(&'g self, guard: &'g RcuReadGuard<'_>) -> Iter<'g, PatchEntry> {
        self.func_stack.iter(guard)
    }

    pub fn depth(&self, guard: &RcuReadGuard<'_>) -> usize {
        self.func_stack.iter(guard).count()
    }
}

/// All patched sites of one live-patch core.
pub struct Registry {
    nodes: RcuList<FuncNode>,
    rcu: RcuDomain,
}

impl Registry {
    pub const fn new() -> Self {
        Self {
            nodes: RcuList::new(),
            rcu: RcuDomain::new(),
        }
    }

    /// Enter a read-side critical section for lookups.
    #[inline]
    pub fn read_lock(&self) -> RcuReadGuard<'_> {
        self.rcu.read_lock()
    }

    /// Find the node for `old_addr`.
    pub fn find<'g>(
        &'g self,
        guard: &'g RcuReadGuard<'_>,
        old_addr: usize,
    ) -> Option<&'g FuncNode> {
        debug_assert!(guard.is_from(&self.rcu));
        self.nodes.iter(guard).find(|node| node.old_addr == old_addr)
    }

    /// Publish a node for `old_addr` whose stack already holds `first`.
    ///
    /// The caller holds the text mutex and has checked that no node exists.
    pub(crate) fn create(
        &self,
        old_addr: usize,
        old_insns: SavedOriginal,
        first: PatchEntry,
    ) -> Result<(), KlpError> {
        let func_stack = RcuList::new();
        func_stack.push_front(first).map_err(|_| KlpError::NoMemory)?;
        let node = FuncNode {
            old_addr,
            old_insns,
            func_stack,
        };
        self.nodes.push_front(node).map_err(|_| KlpError::NoMemory)?;
        klog::klog!(Debug, "livepatch: node created at {:#x}", old_addr);
        Ok(())
    }

    /// Push `entry` on top of `node`'s stack.
    pub(crate) fn push(&self, node: &FuncNode, entry: PatchEntry) -> Result<(), KlpError> {
        node.func_stack
            .push_front(entry)
            .map_err(|_| KlpError::NoMemory)
    }

    /// Remove the newest entry of `node` that redirects to `new_func`.
    pub(crate) fn pop(&self, node: &FuncNode, new_func: usize) -> bool {
        node.func_stack
            .remove_first(&self.rcu, |entry| entry.new_func == new_func)
    }

    /// Unpublish the node for `old_addr`; it is freed after a grace period.
    pub(crate) fn remove(&self, old_addr: usize) -> bool {
        let removed = self
            .nodes
            .remove_first(&self.rcu, |node| node.old_addr == old_addr);
        if removed {
            klog::klog!(Debug, "livepatch: node removed at {:#x}", old_addr);
        }
        removed
    }

    // ------------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------------

    /// Number of patched sites.
    pub fn len(&self) -> usize {
        let guard = self.read_lock();
        self.nodes.iter(&guard).count()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns `true` if a node exists for `old_addr`.
    pub fn contains(&self, old_addr: usize) -> bool {
        let guard = self.read_lock();
        self.find(&guard, old_addr).is_some()
    }

    /// Replacement the site at `old_addr` currently redirects to.
    pub fn current_target(&self, old_addr: usize) -> Option<usize> {
        let guard = self.read_lock();
        let node = self.find(&guard, old_addr)?;
        node.top(&guard).map(|entry| entry.new_func)
    }

    /// Number of stacked replacements at `old_addr` (0 when unpatched).
    pub fn depth(&self, old_addr: usize) -> usize {
        let guard = self.read_lock();
        self.find(&guard, old_addr)
            .map_or(0, |node| node.depth(&guard))
    }

    /// Visit every node inside one read-side critical section.
    pub fn for_each_node(&self, mut f: impl FnMut(&FuncNode, &RcuReadGuard<'_>)) {
        let guard = self.read_lock();
        for node in self.nodes.iter(&guard) {
            f(node, &guard);
        }
    }

    // ------------------------------------------------------------------------
    // Reclamation
    // ------------------------------------------------------------------------

    /// Wait for a grace period and free everything unlinked before it.
    ///
    /// Must not be called while holding a guard from [`Registry::read_lock`].
    pub fn synchronize(&self) {
        self.rcu.synchronize();
    }

    /// Non-blocking reclamation step.
    pub fn poll(&self) -> usize {
        self.rcu.poll()
    }

    /// Unlinked nodes and entries not yet freed.
    pub fn pending_reclaims(&self) -> usize {
        self.rcu.pending_callbacks()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeText;

    const SITE: usize = 0xffff_8000_0010_0000;

    fn entry(new_func: usize) -> PatchEntry {
        PatchEntry {
            new_func,
            new_size: 0x10,
            force: false,
        }
    }

    #[test]
    fn test_capture_sizes() {
        let text = FakeText::new();
        text.fill(SITE, &[0xd503_201f, 0xa9bf_7bfd, 0x9100_03fd, 0xd65f_03c0]);

        let single = SavedOriginal::capture(&text, &ArchConfig::DIRECT, SITE).unwrap();
        assert_eq!(single, SavedOriginal::Single(0xd503_201f));
        assert_eq!(single.words().len(), 1);

        let seq = SavedOriginal::capture(&text, &ArchConfig::MODULE_PLTS, SITE).unwrap();
        assert_eq!(seq.words(), &[0xd503_201f, 0xa9bf_7bfd, 0x9100_03fd, 0xd65f_03c0]);
    }

    #[test]
    fn test_capture_fault() {
        let text = FakeText::new();
        text.fill(SITE, &[0xd503_201f]);
        let err = SavedOriginal::capture(&text, &ArchConfig::MODULE_PLTS, SITE).unwrap_err();
        assert_eq!(err, KlpError::Fault { addr: SITE + 4 });
    }

    #[test]
    fn test_node_lifecycle() {
        let registry = Registry::new();
        assert!(registry.is_empty());

        registry
            .create(SITE, SavedOriginal::Single(0xd503_201f), entry(0x1000))
            .unwrap();
        assert!(registry.contains(SITE));
        assert_eq!(registry.current_target(SITE), Some(0x1000));

        {
            let guard = registry.read_lock();
            let node = registry.find(&guard, SITE).unwrap();
            registry.push(node, entry(0x2000)).unwrap();
            let stack: Vec<usize> = node.entries(&guard).map(|e| e.new_func).collect();
            assert_eq!(stack, [0x2000, 0x1000]);
        }
        assert_eq!(registry.depth(SITE), 2);

        {
            let guard = registry.read_lock();
            let node = registry.find(&guard, SITE).unwrap();
            assert!(registry.pop(node, 0x2000));
            assert!(!registry.pop(node, 0x3000));
        }
        assert_eq!(registry.current_target(SITE), Some(0x1000));

        assert!(registry.remove(SITE));
        assert!(!registry.remove(SITE));
        assert!(!registry.contains(SITE));
        assert_eq!(registry.depth(SITE), 0);
        assert!(registry.pending_reclaims() > 0);
        registry.synchronize();
        assert_eq!(registry.pending_reclaims(), 0);
    }

    #[test]
    fn test_create_out_of_memory() {
        let registry = Registry::new();
        let saved = SavedOriginal::Single(0xd503_201f);

        // First stack entry.
        crate::rculist::fail_alloc_after(0);
        assert_eq!(registry.create(SITE, saved, entry(0x1000)), Err(KlpError::NoMemory));
        // Node link, after the stack entry succeeded.
        crate::rculist::fail_alloc_after(1);
        assert_eq!(registry.create(SITE, saved, entry(0x1000)), Err(KlpError::NoMemory));
        assert!(registry.is_empty());

        registry.create(SITE, saved, entry(0x1000)).unwrap();
        let guard = registry.read_lock();
        let node = registry.find(&guard, SITE).unwrap();
        crate::rculist::fail_alloc_after(0);
        assert_eq!(registry.push(node, entry(0x2000)), Err(KlpError::NoMemory));
        assert_eq!(node.depth(&guard), 1);
    }

    #[test]
    fn test_for_each_node() {
        let registry = Registry::new();
        for i in 0..3 {
            registry
                .create(SITE + i * 0x100, SavedOriginal::Single(0), entry(0x1000))
                .unwrap();
        }
        let mut sites = Vec::new();
        registry.for_each_node(|node, guard| {
            assert_eq!(node.depth(guard), 1);
            sites.push(node.old_addr());
        });
        sites.sort_unstable();
        assert_eq!(sites, [SITE, SITE + 0x100, SITE + 0x200]);
        assert_eq!(registry.len(), 3);
    }
}
