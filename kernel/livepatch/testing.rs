//! In-memory kernel used by the unit tests.

use std::collections::BTreeMap;
use std::ops::{ControlFlow, Range};
use std::string::String;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::vec::Vec;

use spin::Mutex;

use crate::ops::{PtRegs, StackFrame, StackOps, TaskInfo, TextOps};
use crate::Errno;

/// Kernel text backed by a word map.
pub struct FakeText {
    words: Mutex<BTreeMap<usize, u32>>,
    /// Writes to these addresses fail with EPERM.
    deny: Mutex<Vec<usize>>,
    /// Currently writable `(addr, len)` windows.
    writable: Mutex<Vec<(usize, usize)>>,
    pub writes: AtomicUsize,
    pub scanner_pauses: AtomicUsize,
    pub scanner_resumes: AtomicUsize,
    pub protection_changes: AtomicUsize,
}

impl FakeText {
    pub fn new() -> Self {
        Self {
            words: Mutex::new(BTreeMap::new()),
            deny: Mutex::new(Vec::new()),
            writable: Mutex::new(Vec::new()),
            writes: AtomicUsize::new(0),
            scanner_pauses: AtomicUsize::new(0),
            scanner_resumes: AtomicUsize::new(0),
            protection_changes: AtomicUsize::new(0),
        }
    }

    /// Store `insns` at consecutive words from `addr`.
    pub fn fill(&self, addr: usize, insns: &[u32]) {
        let mut words = self.words.lock();
        for (i, insn) in insns.iter().enumerate() {
            words.insert(addr + i * 4, *insn);
        }
    }

    /// Words starting at `addr`; missing words read as 0.
    pub fn dump(&self, addr: usize, count: usize) -> Vec<u32> {
        let words = self.words.lock();
        (0..count)
            .map(|i| words.get(&(addr + i * 4)).copied().unwrap_or(0))
            .collect()
    }

    pub fn deny_write(&self, addr: usize) {
        self.deny.lock().push(addr);
    }

    pub fn allow_all(&self) {
        self.deny.lock().clear();
    }

    pub fn is_writable(&self, addr: usize) -> bool {
        self.writable
            .lock()
            .iter()
            .any(|&(start, len)| addr >= start && addr < start + len)
    }
}

impl TextOps for FakeText {
    fn read_insn(&self, addr: usize) -> Result<u32, Errno> {
        self.words.lock().get(&addr).copied().ok_or(Errno::EFAULT)
    }

    fn patch_text_nosync(&self, addr: usize, insn: u32) -> Result<(), Errno> {
        if self.deny.lock().contains(&addr) {
            return Err(Errno::EPERM);
        }
        self.words.lock().insert(addr, insn);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn make_text_writable(&self, addr: usize, len: usize) -> Result<(), Errno> {
        self.protection_changes.fetch_add(1, Ordering::SeqCst);
        self.writable.lock().push((addr, len));
        Ok(())
    }

    fn make_text_readonly(&self, addr: usize, len: usize) {
        self.protection_changes.fetch_add(1, Ordering::SeqCst);
        self.writable.lock().retain(|&w| w != (addr, len));
    }

    fn pause_text_scanner(&self) {
        self.scanner_pauses.fetch_add(1, Ordering::SeqCst);
    }

    fn resume_text_scanner(&self) {
        self.scanner_resumes.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeTask {
    pub pid: u32,
    pub comm: String,
    pub frame: StackFrame,
    pub stack_base: usize,
    pub stack_size: usize,
}

/// Tasks plus a word-addressed view of their stacks.
///
/// Frame records follow the AAPCS64 layout: `[fp] = caller fp`,
/// `[fp + 8] = return address`.
pub struct FakeStacks {
    pub tasks: Vec<FakeTask>,
    pub stack: BTreeMap<usize, usize>,
    pub regs: BTreeMap<usize, PtRegs>,
    pub entry_text: Range<usize>,
    pub shown: AtomicUsize,
}

impl FakeStacks {
    pub fn new(entry_text: Range<usize>) -> Self {
        Self {
            tasks: Vec::new(),
            stack: BTreeMap::new(),
            regs: BTreeMap::new(),
            entry_text,
            shown: AtomicUsize::new(0),
        }
    }

    pub const STACK_SIZE: usize = 0x4000;

    /// Lowest address of the kernel stack given to `pid`.
    pub fn stack_base(pid: u32) -> usize {
        0xffff_0000_4000_0000 + (pid as usize) * Self::STACK_SIZE
    }

    /// Add a task that is switched out at `frame`.
    pub fn add_task(&mut self, pid: u32, comm: &str, frame: StackFrame) {
        self.tasks.push(FakeTask {
            pid,
            comm: String::from(comm),
            frame,
            stack_base: Self::stack_base(pid),
            stack_size: Self::STACK_SIZE,
        });
    }

    /// Add a task whose saved pc is `pc` and which has no caller frames.
    pub fn add_leaf_task(&mut self, pid: u32, comm: &str, pc: usize) {
        let sp = Self::stack_base(pid) + 0x3f00;
        self.add_task(pid, comm, StackFrame::new(0, sp, pc));
    }

    pub fn info(&self, idx: usize) -> TaskInfo<'_> {
        let task = &self.tasks[idx];
        TaskInfo {
            pid: task.pid,
            comm: &task.comm,
            frame: task.frame,
            stack_base: task.stack_base,
            stack_size: task.stack_size,
        }
    }

    /// Write a frame record at `fp`.
    pub fn frame_record(&mut self, fp: usize, caller_fp: usize, lr: usize) {
        self.stack.insert(fp, caller_fp);
        self.stack.insert(fp + 8, lr);
    }
}

impl StackOps for FakeStacks {
    fn for_each_task(&self, f: &mut dyn FnMut(&TaskInfo<'_>) -> ControlFlow<()>) {
        for idx in 0..self.tasks.len() {
            if f(&self.info(idx)).is_break() {
                return;
            }
        }
    }

    fn unwind_frame(&self, frame: &mut StackFrame) -> Result<(), Errno> {
        let fp = frame.fp;
        let caller_fp = *self.stack.get(&fp).ok_or(Errno::EINVAL)?;
        let lr = *self.stack.get(&(fp + 8)).ok_or(Errno::EINVAL)?;
        frame.sp = fp + 16;
        frame.fp = caller_fp;
        frame.pc = lr;
        Ok(())
    }

    fn in_entry_text(&self, pc: usize) -> bool {
        self.entry_text.contains(&pc)
    }

    fn read_pt_regs(&self, addr: usize) -> Option<PtRegs> {
        self.regs.get(&addr).copied()
    }

    fn show_stack(&self, _task: &TaskInfo<'_>) {
        self.shown.fetch_add(1, Ordering::SeqCst);
    }
}
