//! Description of a live patch as handed over by the patch-management layer.

use alloc::string::String;
use alloc::vec::Vec;
use core::ops::Range;

/// One function replacement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KlpFunc {
    /// Symbol name of the function being replaced.
    pub old_name: String,
    /// Entry address of the original function (the patch site).
    pub old_addr: usize,
    pub old_size: usize,
    /// Entry address of the replacement.
    pub new_func: usize,
    pub new_size: usize,
    /// Skip the activeness check for the original on enable.
    pub force: bool,
}

impl KlpFunc {
    pub fn new(
        old_name: &str,
        old_addr: usize,
        old_size: usize,
        new_func: usize,
        new_size: usize,
    ) -> Self {
        Self {
            old_name: String::from(old_name),
            old_addr,
            old_size,
            new_func,
            new_size,
            force: false,
        }
    }

    /// Same function with the `force` flag set.
    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    /// Code that must not be on any stack for this transition.
    ///
    /// Enabling guards the original body unless `force` is set; disabling
    /// always guards the replacement body.
    pub fn busy_range(&self, enable: bool) -> Option<Range<usize>> {
        if enable {
            if self.force {
                return None;
            }
            Some(self.old_addr..self.old_addr.saturating_add(self.old_size))
        } else {
            Some(self.new_func..self.new_func.saturating_add(self.new_size))
        }
    }
}

/// Functions patched in one object (vmlinux or a module).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KlpObject {
    /// Module name, `None` for vmlinux.
    pub name: Option<String>,
    pub funcs: Vec<KlpFunc>,
}

impl KlpObject {
    pub fn vmlinux(funcs: Vec<KlpFunc>) -> Self {
        Self { name: None, funcs }
    }

    pub fn module(name: &str, funcs: Vec<KlpFunc>) -> Self {
        Self {
            name: Some(String::from(name)),
            funcs,
        }
    }
}

/// A whole patch: the unit the activeness check accepts or rejects.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KlpPatch {
    pub name: String,
    pub objs: Vec<KlpObject>,
}

impl KlpPatch {
    pub fn new(name: &str, objs: Vec<KlpObject>) -> Self {
        Self {
            name: String::from(name),
            objs,
        }
    }

    /// Every function of every object, in declaration order.
    pub fn funcs(&self) -> impl DoubleEndedIterator<Item = &KlpFunc> + '_ {
        self.objs.iter().flat_map(|obj| obj.funcs.iter())
    }
}
