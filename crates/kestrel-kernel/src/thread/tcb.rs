use crate::spl::Ipl;
use crate::types::{ThreadHandle, WaitChannel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    Sleeping(WaitChannel),
}

/// Processor state that belongs to whichever thread is running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuFlags {
    pub ipl: Ipl,
    pub in_interrupt: bool,
}

pub struct ThreadControlBlock {
    pub handle: ThreadHandle,
    pub name: String,
    pub state: ThreadState,
    pub context: SavedContext,
}

impl ThreadControlBlock {
    pub fn new(handle: ThreadHandle, name: &str) -> Self {
        Self {
            handle,
            name: name.to_owned(),
            state: ThreadState::Ready,
            context: SavedContext::default(),
        }
    }
}

/// What a thread takes with it when it is switched out.
///
/// A thread never switches from inside an interrupt handler, so only the
/// interrupt level needs saving.
#[derive(Debug, Clone, Copy, Default)]
pub struct SavedContext {
    pub ipl: Ipl,
}

impl SavedContext {
    pub fn save_from(&mut self, cpu: &CpuFlags) {
        self.ipl = cpu.ipl;
    }

    pub fn restore_to(&self, cpu: &mut CpuFlags) {
        cpu.ipl = self.ipl;
        cpu.in_interrupt = false;
    }
}
