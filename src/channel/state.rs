//! Channel state, delta, and event bitmaps.
//!
//! Three words describe a channel: `state` is the engine's truth, `delta`
//! carries user-initiated qualifications not yet merged, and `events` holds
//! what the current cycle exposed. User code writes `delta` under the ring
//! lock; the engine merges it into `state` exactly once per cycle.

use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Flags: u32 {
        /// Set for input (receiving) channels.
        const POLARITY = 1 << 0;
        /// Kernel subscription pending.
        const CONNECT = 1 << 1;
        /// Synthesize a transfer attempt on the next cycle.
        const FORCE = 1 << 2;
        /// Never subscribe or cancel; the channel is always transferable.
        const REQUEUE = 1 << 3;

        /// Transfer qualification known from the process (resource held).
        const ITEQ_TRANSFER = 1 << 4;
        /// Termination requested by the process.
        const ITEQ_TERMINATE = 1 << 5;
        /// Transfer qualification known from the kernel (readiness).
        const XTEQ_TRANSFER = 1 << 6;
        /// Termination observed from the kernel (EOF, hangup, error).
        const XTEQ_TERMINATE = 1 << 7;

        /// A transfer attempt ran this cycle.
        const TEV_TRANSFER = 1 << 8;
        /// Termination became observable this cycle.
        const TEV_TERMINATE = 1 << 9;
    }
}

impl Flags {
    pub(crate) fn should_terminate(self) -> bool {
        self.intersects(Flags::ITEQ_TERMINATE | Flags::XTEQ_TERMINATE)
    }

    pub(crate) fn should_transfer(self) -> bool {
        self.contains(Flags::ITEQ_TRANSFER | Flags::XTEQ_TRANSFER)
    }

    /// Whether the channel belongs on the transfer list at all.
    pub(crate) fn actionable(self) -> bool {
        self.should_terminate() || self.should_transfer()
    }
}

pub(crate) struct AtomicFlags(AtomicU32);

impl AtomicFlags {
    pub(crate) fn new(flags: Flags) -> AtomicFlags {
        AtomicFlags(AtomicU32::new(flags.bits()))
    }

    pub(crate) fn load(&self) -> Flags {
        Flags::from_bits_retain(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn insert(&self, flags: Flags) {
        self.0.fetch_or(flags.bits(), Ordering::SeqCst);
    }

    pub(crate) fn remove(&self, flags: Flags) {
        self.0.fetch_and(!flags.bits(), Ordering::SeqCst);
    }

    /// Drain: return the current bits and clear the word.
    pub(crate) fn take(&self) -> Flags {
        Flags::from_bits_retain(self.0.swap(0, Ordering::SeqCst))
    }
}
