use crate::types::{ThreadHandle, WaitChannel};
use core::num::NonZeroU32;
use std::collections::VecDeque;

struct Slot {
    generation: NonZeroU32,
    live: bool,
    sleepers: VecDeque<ThreadHandle>,
}

/// Arena of wait channels.
///
/// Every lookup checks the generation, so operations on a retired channel
/// fail instead of touching whatever channel now occupies the slot.
#[derive(Default)]
pub struct ChannelTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self) -> WaitChannel {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.live = true;
            return WaitChannel::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: NonZeroU32::MIN,
            live: true,
            sleepers: VecDeque::new(),
        });
        WaitChannel::new(index, NonZeroU32::MIN)
    }

    fn slot(&self, chan: WaitChannel) -> Option<&Slot> {
        self.slots
            .get(chan.slot())
            .filter(|s| s.live && s.generation == chan.generation())
    }

    fn slot_mut(&mut self, chan: WaitChannel) -> Option<&mut Slot> {
        self.slots
            .get_mut(chan.slot())
            .filter(|s| s.live && s.generation == chan.generation())
    }

    pub fn is_live(&self, chan: WaitChannel) -> bool {
        self.slot(chan).is_some()
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.live).count()
    }

    /// Retire `chan`. Returns `None` if it was already stale.
    pub fn retire(&mut self, chan: WaitChannel) -> Option<()> {
        let slot = self.slot_mut(chan)?;
        slot.live = false;
        slot.sleepers.clear();
        // A slot whose generation would wrap is never reissued.
        if let Some(next) = slot.generation.checked_add(1) {
            slot.generation = next;
            self.free.push(chan.slot() as u32);
        }
        Some(())
    }

    pub fn push_sleeper(&mut self, chan: WaitChannel, thread: ThreadHandle) -> Option<()> {
        self.slot_mut(chan)?.sleepers.push_back(thread);
        Some(())
    }

    pub fn pop_sleeper(&mut self, chan: WaitChannel) -> Option<Option<ThreadHandle>> {
        Some(self.slot_mut(chan)?.sleepers.pop_front())
    }

    pub fn take_sleepers(&mut self, chan: WaitChannel) -> Option<VecDeque<ThreadHandle>> {
        Some(std::mem::take(&mut self.slot_mut(chan)?.sleepers))
    }

    pub fn sleeper_count(&self, chan: WaitChannel) -> Option<usize> {
        Some(self.slot(chan)?.sleepers.len())
    }
}
