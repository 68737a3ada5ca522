//! The cycle engine.
//!
//! A [`Junction`] owns a ring of channels, the kernel notification handle,
//! and the per-cycle transfer list. Each [`enter`]/[`exit`] bracket drives
//! one cycle: pending user deltas merge into channel state, kernel
//! subscriptions reconcile, readiness is collected (blocking only when no
//! work is immediately actionable), transfers are attempted, and the
//! resulting events are exposed through the transfer iterator.
//!
//! A junction is single-owner: one thread drives cycles. Other threads may
//! call `acquire`, `terminate`, and `force` on its channels at any time;
//! [`force`] aborts a blocked wait.
//!
//! [`enter`]: Junction::enter
//! [`exit`]: Junction::exit
//! [`force`]: Junction::force

mod alloc;
pub(crate) mod notify;
pub(crate) mod ring;

pub use alloc::{Allocation, Param};

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, trace};

use crate::channel::{AtomicFlags, Channel, ChannelCore, Flags};
use crate::error::Violation;
use crate::port::{IoStatus, Kcall, Polarity, Port};
use notify::{Change, Notifier, RawEvent};
use ring::{Ring, NIL, SELF};

/// Default capacity of the kernel event scratch array.
const DEFAULT_EXORESOURCE: usize = 16;

struct Engine {
    /// Kernel event slots per collect; also bounds staged changes.
    scratch: usize,
    raw: Vec<RawEvent>,
    changes: Vec<Change>,
    failures: Vec<(usize, i32)>,
    /// Channels whose subscription failed; enqueued onto the transfer list
    /// only after the current list walk completes.
    deferred: Vec<usize>,
}

impl Engine {
    fn new() -> Engine {
        Engine {
            scratch: DEFAULT_EXORESOURCE,
            raw: Vec::new(),
            changes: Vec::new(),
            failures: Vec::new(),
            deferred: Vec::new(),
        }
    }
}

pub(crate) struct JunctionCore {
    ring: Mutex<Ring>,
    engine: Mutex<Engine>,
    notify: Notifier,
    pub(crate) port: Arc<Port>,
    state: AtomicFlags,
    delta: AtomicFlags,
    events: AtomicFlags,
    will_wait: AtomicBool,
    ntransfers: AtomicUsize,
}

impl JunctionCore {
    fn terminating(&self) -> bool {
        (self.state.load() | self.delta.load()).should_terminate()
    }

    /// Splice a channel with pending delta to just before the sentinel so
    /// the next cycle's backward drain picks it up, and wake a blocked wait.
    pub(crate) fn enqueue_delta(&self, chan: &ChannelCore) {
        let mut ring = self.ring.lock().expect("ring poisoned");
        let slot = chan.slot();
        if slot == NIL || !ring.contains(slot) {
            return;
        }
        if !chan.delta.load().is_empty() {
            ring.move_before_self(slot);
            drop(ring);
            self.fall(false);
        }
    }

    /// Cancel a blocked wait. Without `force`, a no-op unless the engine
    /// announced it would wait.
    pub(crate) fn fall(&self, force: bool) -> bool {
        if !force && !self.will_wait.load(Ordering::SeqCst) {
            return false;
        }
        self.notify.wake(&self.port)
    }
}

pub struct Junction {
    core: Arc<JunctionCore>,
}

impl Junction {
    pub fn new() -> io::Result<Junction> {
        let core = Arc::new(JunctionCore {
            ring: Mutex::new(Ring::new()),
            engine: Mutex::new(Engine::new()),
            notify: Notifier::new(),
            port: Arc::new(Port::untethered()),
            state: AtomicFlags::new(Flags::POLARITY | Flags::XTEQ_TRANSFER),
            delta: AtomicFlags::new(Flags::empty()),
            events: AtomicFlags::new(Flags::empty()),
            will_wait: AtomicBool::new(false),
            ntransfers: AtomicUsize::new(0),
        });

        core.notify.open(&core.port);
        core.port.latch(Polarity::Input);
        core.port.raised()?;

        Ok(Junction { core })
    }

    /// Resolve an allocation request addressed by its token tuple.
    pub fn rallocate(request: &[&str], param: Param) -> Result<Allocation, Violation> {
        alloc::rallocate(request, param)
    }

    /// Resolve an allocation request in IRI form, e.g. `"octets://ip4:tcp"`.
    pub fn rallocate_iri(request: &str, param: Param) -> Result<Allocation, Violation> {
        let tokens = alloc::iri_tokens(request)?;
        alloc::rallocate(&tokens, param)
    }

    /// Attach a channel to the ring. Channels belong to at most one junction
    /// for their lifetime; re-acquiring by the same junction is a no-op.
    pub fn acquire(&self, channel: &Channel) -> Result<(), Violation> {
        let core = &self.core;
        if core.terminating() {
            return Err(Violation::Terminated);
        }

        let mut ring = core.ring.lock().expect("ring poisoned");
        let chan = &channel.core;

        if chan.slot() != NIL {
            return chan.bind_junction(core);
        }
        if chan.terminating() {
            return Err(Violation::Terminated);
        }

        chan.bind_junction(core)?;
        chan.delta.insert(Flags::CONNECT);
        let slot = ring.attach(Arc::clone(chan));
        chan.set_slot(slot);
        Ok(())
    }

    /// Open a cycle: merge deltas, reconcile subscriptions, collect
    /// readiness, and attempt transfers. The caller observes the results
    /// through [`transfer`](Junction::transfer) and closes the cycle with
    /// [`exit`](Junction::exit).
    pub fn enter(&self) -> Result<(), Violation> {
        let core = &self.core;
        let mut engine = core.engine.lock().expect("engine poisoned");
        engine.changes.clear();

        let terminating;
        {
            let mut ring = core.ring.lock().expect("ring poisoned");

            if core.terminating() && !core.port.latched() {
                return Err(Violation::Terminated);
            }
            if ring.cycling() {
                return Err(Violation::CycleOpen);
            }

            ring.lltransfer = SELF;
            core.ntransfers.store(0, Ordering::SeqCst);

            terminating = core.terminating();
            if terminating {
                core.state.insert(Flags::ITEQ_TERMINATE);
                let mut idx = ring.first();
                while idx != SELF {
                    ring.chan(idx).delta.insert(Flags::ITEQ_TERMINATE);
                    idx = ring.next_of(idx);
                }
                core.port.unlatch(None);
                core.notify.close_auxiliary();
            } else if !core.port.latched() {
                // Post-fork or user-closed notification handle.
                debug!("notification handle unusable; re-initializing");
                core.notify.open(&core.port);
                core.port.latch(Polarity::Input);
                let mut idx = ring.first();
                while idx != SELF {
                    ring.chan(idx).delta.insert(Flags::CONNECT);
                    idx = ring.next_of(idx);
                }
            }
            core.delta.take();

            // Drain the delta queue: walk the ring backward from the
            // sentinel; enqueuers splice themselves immediately before it,
            // so the walk ends at the first member with no pending delta.
            let mut idx = ring.last();
            while idx != SELF {
                let chan = Arc::clone(ring.chan(idx));
                if chan.delta.load().is_empty() {
                    break;
                }
                chan.merge_delta();
                ring.add_transfer(idx);
                idx = ring.prev_of(idx);
            }

            // Block in the kernel only when nothing is actionable already.
            core.will_wait
                .store(ring.lltransfer == SELF, Ordering::SeqCst);

            self.apply_delta(&mut ring, &mut engine);
            self.flush_changes(&mut ring, &mut engine);
            while let Some(token) = engine.deferred.pop() {
                if ring.contains(token) {
                    ring.add_transfer(token);
                }
            }
        }

        if !terminating {
            let wait = core.will_wait.load(Ordering::SeqCst);
            let mut collected = self.collect_transform(&mut engine, wait);
            core.will_wait.store(false, Ordering::SeqCst);

            // Re-collect without waiting while more events may be pending.
            let mut countdown = 3u32;
            while countdown > 0 && (Notifier::RETRY_UNCONDITIONAL || collected == engine.scratch)
            {
                collected = self.collect_transform(&mut engine, false);
                countdown -= 1;
            }
        }

        {
            let mut ring = core.ring.lock().expect("ring poisoned");
            self.attempt_io(&mut ring, &mut engine);
            if !terminating {
                self.flush_changes(&mut ring, &mut engine);
            } else {
                engine.changes.clear();
            }
            // Only filter cancellations are staged here; their failures are
            // not reported, so nothing defers.
            engine.deferred.clear();
        }

        Ok(())
    }

    /// Reconcile kernel subscriptions for every channel the delta drain
    /// enqueued, and drop channels with no actionable state off the list.
    fn apply_delta(&self, ring: &mut Ring, engine: &mut Engine) {
        let mut prev = SELF;
        let mut idx = ring.lltransfer;

        while idx != SELF {
            let chan = Arc::clone(ring.chan(idx));
            let next = ring.transfer_next(idx);
            let state = chan.state.load();

            if state.contains(Flags::CONNECT) {
                if chan.port.errored() || !chan.port.latched() {
                    // Inherit the creation error instead of subscribing.
                    chan.state.insert(Flags::XTEQ_TERMINATE);
                } else if !state.contains(Flags::REQUEUE) {
                    let change = Change {
                        fd: chan.port.id(),
                        token: idx,
                        input: chan.polarity() == Polarity::Input,
                        attach: true,
                    };
                    self.stage(ring, engine, change);
                }
                chan.state.remove(Flags::CONNECT);
            }

            if chan.state.load().contains(Flags::FORCE) {
                chan.state.remove(Flags::FORCE);
                // The transfer attempt runs even with nothing pending,
                // yielding a zero-length transfer event.
                chan.state.insert(Flags::XTEQ_TRANSFER);
            }

            if chan.state.load().actionable() {
                prev = idx;
            } else {
                ring.set_transfer_next(prev, next);
                ring.set_transfer_next(idx, NIL);
            }
            idx = next;
        }
    }

    fn stage(&self, ring: &mut Ring, engine: &mut Engine, change: Change) {
        if engine.changes.len() >= engine.scratch {
            self.flush_changes(ring, engine);
        }
        engine.changes.push(change);
    }

    /// Submit staged subscription changes; a failed subscription terminates
    /// only its channel.
    fn flush_changes(&self, ring: &mut Ring, engine: &mut Engine) {
        if engine.changes.is_empty() {
            return;
        }
        let mut changes = std::mem::take(&mut engine.changes);
        engine.failures.clear();
        self.core
            .notify
            .apply(&changes, &self.core.port, &mut engine.failures);

        for (token, err) in engine.failures.drain(..) {
            if !ring.contains(token) {
                continue;
            }
            let chan = Arc::clone(ring.chan(token));
            debug!("subscription failed for slot {token}: errno {err}");
            chan.port.record(Notifier::SUBSCRIBE_CALL, err);
            chan.state.insert(Flags::XTEQ_TERMINATE);
            engine.deferred.push(token);
        }

        changes.clear();
        engine.changes = changes;
    }

    /// Collect kernel events and transform them into channel state,
    /// splicing actionable channels onto the transfer list.
    fn collect_transform(&self, engine: &mut Engine, wait: bool) -> usize {
        let core = &self.core;
        engine.raw.clear();
        let scratch = engine.scratch;
        let collected = core
            .notify
            .collect(scratch, wait, &core.port, &mut engine.raw);

        if engine.raw.is_empty() {
            return collected;
        }

        let mut ring = core.ring.lock().expect("ring poisoned");
        for event in &engine.raw {
            if !ring.contains(event.token) {
                continue;
            }
            let chan = Arc::clone(ring.chan(event.token));
            trace!(
                "kernel event: slot {} transfer={} terminate={}",
                event.token,
                event.transfer,
                event.terminate
            );

            if event.transfer {
                chan.state.insert(Flags::XTEQ_TRANSFER);
                // The kernel can transfer; enqueue only if the process can too.
                if chan.state.load().contains(Flags::ITEQ_TRANSFER) {
                    ring.add_transfer(event.token);
                }
            }
            if event.terminate {
                if !chan.port.errored() {
                    chan.port.record(Kcall::Eof, event.errno);
                }
                chan.state.insert(Flags::XTEQ_TERMINATE);
                ring.add_transfer(event.token);
            }
        }

        collected
    }

    /// Walk the transfer list: termination preempts transfer; transfer
    /// attempts extend the window and map their status onto the state bits.
    fn attempt_io(&self, ring: &mut Ring, engine: &mut Engine) {
        let core = &self.core;
        let mut idx = ring.lltransfer;

        while idx != SELF {
            let chan = Arc::clone(ring.chan(idx));
            core.ntransfers.fetch_add(1, Ordering::SeqCst);
            let state = chan.state.load();

            if state.should_terminate() {
                if !state.contains(Flags::REQUEUE) {
                    let change = Change {
                        fd: chan.port.id(),
                        token: idx,
                        input: chan.polarity() == Polarity::Input,
                        attach: false,
                    };
                    self.stage(ring, engine, change);
                }
                chan.events.insert(Flags::TEV_TERMINATE);
            } else if state.should_transfer() {
                chan.events.insert(Flags::TEV_TRANSFER);
                match chan.run_transfer() {
                    IoStatus::Flow => {
                        // Buffer exhausted; the process must re-acquire.
                        chan.state.remove(Flags::ITEQ_TRANSFER);
                    }
                    IoStatus::Stop => {
                        // Kernel blocked; wait for the next readiness event.
                        chan.state.remove(Flags::XTEQ_TRANSFER);
                    }
                    IoStatus::Terminate => {
                        chan.state.insert(Flags::XTEQ_TERMINATE);
                        chan.events.insert(Flags::TEV_TERMINATE);
                        if !state.contains(Flags::REQUEUE) {
                            let change = Change {
                                fd: chan.port.id(),
                                token: idx,
                                input: chan.polarity() == Polarity::Input,
                                attach: false,
                            };
                            self.stage(ring, engine, change);
                        }
                    }
                }
            }

            idx = ring.transfer_next(idx);
        }
    }

    /// Close the cycle: collapse windows, release exhausted resources,
    /// detach terminated channels, and clear per-cycle events.
    pub fn exit(&self) {
        let core = &self.core;
        let mut ring = core.ring.lock().expect("ring poisoned");
        if !ring.cycling() {
            return;
        }

        let mut idx = ring.lltransfer;
        while idx != SELF {
            let next = ring.transfer_next(idx);
            ring.set_transfer_next(idx, NIL);
            let chan = Arc::clone(ring.chan(idx));

            chan.collapse_window();

            if chan.events.load().contains(Flags::TEV_TERMINATE) {
                chan.release_resource();
                chan.release_link();
                chan.port.unlatch(Some(chan.polarity()));
                chan.set_slot(NIL);
                chan.events.take();
                ring.detach(idx);
            } else {
                if chan.exhausted_in_cycle() {
                    // Consumed without a replacement acquired in-cycle.
                    chan.release_resource();
                }
                chan.events.take();
            }

            idx = next;
        }

        ring.lltransfer = NIL;
        core.ntransfers.store(0, Ordering::SeqCst);

        // The junction's own termination is observable last, once the ring
        // has emptied.
        if core.state.load().should_terminate() && ring.is_empty() {
            core.events.insert(Flags::TEV_TERMINATE);
        }
    }

    /// Iterate the channels with events this cycle. Outside a cycle the
    /// iterator is empty; an iterator carried across `exit` panics.
    pub fn transfer(&self) -> Transfers<'_> {
        let ring = self.core.ring.lock().expect("ring poisoned");
        let cursor = if ring.cycling() { ring.lltransfer } else { NIL };
        Transfers {
            core: &self.core,
            cursor,
        }
    }

    /// Channels enumerated on the transfer list this cycle.
    pub fn sizeof_transfer(&self) -> usize {
        let ring = self.core.ring.lock().expect("ring poisoned");
        if ring.cycling() {
            self.core.ntransfers.load(Ordering::SeqCst)
        } else {
            0
        }
    }

    /// Abort a blocked wait from any thread. Returns whether a wake was
    /// issued.
    pub fn force(&self) -> bool {
        if self.core.terminating() {
            return false;
        }
        self.core.fall(true)
    }

    /// Request junction shutdown: every attached channel terminates over
    /// the following cycles, the junction itself last.
    pub fn terminate(&self) {
        if !self.core.terminating() {
            self.core.delta.insert(Flags::ITEQ_TERMINATE);
            self.core.fall(false);
        }
    }

    /// Disclaim the entire ring without emitting events; for forked
    /// children that must not touch the parent's kernel streams.
    pub fn void(&self) {
        let core = &self.core;
        let mut ring = core.ring.lock().expect("ring poisoned");

        for chan in ring.channels() {
            chan.state.insert(Flags::ITEQ_TERMINATE);
            chan.set_slot(NIL);
            crate::channel::void_port(&chan.port);
        }
        ring.clear();

        core.ntransfers.store(0, Ordering::SeqCst);
        core.will_wait.store(false, Ordering::SeqCst);
        core.port.unlatch(None);
        core.notify.close_auxiliary();
    }

    /// Resize the kernel event scratch array; refused inside a cycle.
    pub fn resize_exoresource(&self, size: usize) -> Result<usize, Violation> {
        let mut engine = self.core.engine.lock().expect("engine poisoned");
        let ring = self.core.ring.lock().expect("ring poisoned");
        if ring.cycling() {
            return Err(Violation::Cycling);
        }
        engine.scratch = size.max(1);
        Ok(engine.scratch)
    }

    /// Every channel currently attached to the ring.
    pub fn resource(&self) -> Vec<Channel> {
        let ring = self.core.ring.lock().expect("ring poisoned");
        ring.channels()
            .into_iter()
            .map(Channel::from_core)
            .collect()
    }

    pub fn port(&self) -> &Port {
        &self.core.port
    }

    pub fn terminating(&self) -> bool {
        self.core.terminating()
    }

    pub fn terminated(&self) -> bool {
        self.core.terminating() && !self.core.port.latched()
    }

    /// The junction's own termination event, noted after the ring empties.
    pub fn event_terminate(&self) -> bool {
        self.core.events.load().contains(Flags::TEV_TERMINATE)
    }
}

impl std::fmt::Debug for Junction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ring = self.core.ring.lock().expect("ring poisoned");
        f.debug_struct("Junction")
            .field("channels", &ring.len())
            .field("cycling", &ring.cycling())
            .field("terminating", &self.core.terminating())
            .finish()
    }
}

/// Iterator over the channels with observable events this cycle.
pub struct Transfers<'a> {
    core: &'a Arc<JunctionCore>,
    cursor: usize,
}

impl Iterator for Transfers<'_> {
    type Item = Channel;

    fn next(&mut self) -> Option<Channel> {
        if self.cursor == NIL {
            return None;
        }

        let ring = self.core.ring.lock().expect("ring poisoned");
        assert!(
            ring.cycling(),
            "junction transfer iterator used outside of cycle"
        );

        let mut idx = self.cursor;
        while idx != SELF && ring.chan(idx).events.load().is_empty() {
            idx = ring.transfer_next(idx);
        }

        if idx == SELF {
            self.cursor = NIL;
            return None;
        }

        self.cursor = ring.transfer_next(idx);
        Some(Channel::from_core(Arc::clone(ring.chan(idx))))
    }
}
