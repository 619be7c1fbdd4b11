use core::fmt;
use core::num::NonZeroU32;

/// Thread identifier
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ThreadHandle(NonZeroU32);

impl ThreadHandle {
    pub fn new(id: u32) -> Option<Self> {
        NonZeroU32::new(id).map(Self)
    }

    pub fn val(&self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Key that sleeping threads wait on and wakers signal.
///
/// A channel is a slot in the channel table plus the generation the slot had
/// when the channel was issued. Retiring a channel bumps the generation, so a
/// stale handle never matches a channel reissued from the same slot.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct WaitChannel {
    slot: u32,
    generation: NonZeroU32,
}

impl WaitChannel {
    pub(crate) fn new(slot: u32, generation: NonZeroU32) -> Self {
        Self { slot, generation }
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot as usize
    }

    pub(crate) fn generation(&self) -> NonZeroU32 {
        self.generation
    }
}

impl fmt::Display for WaitChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chan{}.{}", self.slot, self.generation)
    }
}
