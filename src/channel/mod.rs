//! Transfer participants.
//!
//! A [`Channel`] is one unidirectional side of a kernel descriptor: it binds
//! a [`Port`], a freight kind, a user-supplied resource buffer, and the
//! three state bitmaps the cycle engine drives. Channels are created by
//! allocation requests (see [`Junction::rallocate`]), attached with
//! [`Junction::acquire`], and observed through the per-cycle transfer list.
//!
//! [`Junction::rallocate`]: crate::Junction::rallocate
//! [`Junction::acquire`]: crate::Junction::acquire

mod freight;
mod state;

pub(crate) use freight::Freight;
pub(crate) use state::{AtomicFlags, Flags};

use std::any::Any;
use std::ops::Range;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::datagram::DatagramArray;
use crate::endpoint::Endpoint;
use crate::error::Violation;
use crate::junction::ring::NIL;
use crate::junction::JunctionCore;
use crate::port::{IoStatus, Kcall, Polarity, Port};

/// A buffer given to a channel for transfer.
#[derive(Debug)]
pub enum Resource {
    /// Writable byte buffer for octets channels.
    Octets(Vec<u8>),
    /// Descriptor slots for sockets (accept) and ports (passing) channels.
    Fds(Vec<RawFd>),
    /// Record buffer for datagrams channels.
    Datagrams(DatagramArray),
}

impl Resource {
    fn byte_len(&self) -> usize {
        match self {
            Resource::Octets(buf) => buf.len(),
            Resource::Fds(fds) => fds.len() * std::mem::size_of::<RawFd>(),
            Resource::Datagrams(dga) => dga.byte_len(),
        }
    }

    fn unit(&self) -> usize {
        match self {
            Resource::Octets(_) => 1,
            Resource::Fds(_) => std::mem::size_of::<RawFd>(),
            Resource::Datagrams(dga) => dga.unit().max(1),
        }
    }
}

/// The region of a channel's resource covered by this cycle's transfer.
#[derive(Debug)]
pub enum Transfer {
    Octets(Vec<u8>),
    Fds(Vec<RawFd>),
    Datagrams(DatagramArray),
}

impl Transfer {
    pub fn octets(self) -> Option<Vec<u8>> {
        match self {
            Transfer::Octets(buf) => Some(buf),
            _ => None,
        }
    }

    pub fn fds(self) -> Option<Vec<RawFd>> {
        match self {
            Transfer::Fds(fds) => Some(fds),
            _ => None,
        }
    }

    pub fn datagrams(self) -> Option<DatagramArray> {
        match self {
            Transfer::Datagrams(dga) => Some(dga),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Window {
    pub(crate) start: usize,
    pub(crate) stop: usize,
}

impl Window {
    pub(crate) fn clear(&mut self) {
        self.start = 0;
        self.stop = 0;
    }

    /// Fold this cycle's transfer into the consumed region; the next
    /// transfer begins where this one stopped.
    pub(crate) fn collapse(&mut self) {
        self.start = self.stop;
    }
}

pub(crate) struct Body {
    pub(crate) resource: Option<Resource>,
    pub(crate) window: Window,
    pub(crate) link: Option<Box<dyn Any + Send>>,
}

pub(crate) struct ChannelCore {
    pub(crate) state: AtomicFlags,
    pub(crate) delta: AtomicFlags,
    pub(crate) events: AtomicFlags,
    pub(crate) port: Arc<Port>,
    pub(crate) freight: Freight,
    pub(crate) body: Mutex<Body>,
    junction: OnceLock<Weak<JunctionCore>>,
    slot: AtomicUsize,
}

impl ChannelCore {
    pub(crate) fn new(polarity: Polarity, port: Arc<Port>, freight: Freight) -> Arc<ChannelCore> {
        let initial = match polarity {
            Polarity::Input => Flags::POLARITY,
            Polarity::Output => Flags::empty(),
        };
        Arc::new(ChannelCore {
            state: AtomicFlags::new(initial),
            delta: AtomicFlags::new(Flags::empty()),
            events: AtomicFlags::new(Flags::empty()),
            port,
            freight,
            body: Mutex::new(Body {
                resource: None,
                window: Window::default(),
                link: None,
            }),
            junction: OnceLock::new(),
            slot: AtomicUsize::new(NIL),
        })
    }

    pub(crate) fn polarity(&self) -> Polarity {
        if self.state.load().contains(Flags::POLARITY) {
            Polarity::Input
        } else {
            Polarity::Output
        }
    }

    /// File-backed channels transfer without kernel events.
    pub(crate) fn prime_requeue(&self) {
        self.state.insert(Flags::XTEQ_TRANSFER | Flags::REQUEUE);
    }

    pub(crate) fn terminating(&self) -> bool {
        (self.state.load() | self.delta.load()).should_terminate()
    }

    /// Bind to a junction on first acquisition. Fails if already bound to a
    /// different one; a channel never migrates between junctions.
    pub(crate) fn bind_junction(&self, junction: &Arc<JunctionCore>) -> Result<(), Violation> {
        let weak = self.junction.get_or_init(|| Arc::downgrade(junction));
        match weak.upgrade() {
            Some(bound) if Arc::ptr_eq(&bound, junction) => Ok(()),
            _ => Err(Violation::ForeignChannel),
        }
    }

    pub(crate) fn attached_junction(&self) -> Option<Arc<JunctionCore>> {
        if self.slot.load(Ordering::SeqCst) == NIL {
            return None;
        }
        self.junction.get().and_then(Weak::upgrade)
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot.load(Ordering::SeqCst)
    }

    pub(crate) fn set_slot(&self, slot: usize) {
        self.slot.store(slot, Ordering::SeqCst);
    }

    pub(crate) fn merge_delta(&self) {
        let pending = self.delta.take();
        self.state.insert(pending);
    }

    /// One transfer attempt over `[stop, resource end)`; extends the window
    /// by the bytes moved.
    pub(crate) fn run_transfer(&self) -> IoStatus {
        let mut body = self.body.lock().expect("channel body poisoned");
        let polarity = self.polarity();
        let Body {
            resource, window, ..
        } = &mut *body;
        let Some(resource) = resource.as_mut() else {
            return IoStatus::Flow;
        };

        let stop = window.stop.min(resource.byte_len());
        let (moved, status) = self.freight.attempt(&self.port, polarity, resource, stop);
        window.stop = stop + moved;
        status
    }

    pub(crate) fn collapse_window(&self) {
        self.body
            .lock()
            .expect("channel body poisoned")
            .window
            .collapse();
    }

    pub(crate) fn release_resource(&self) {
        let mut body = self.body.lock().expect("channel body poisoned");
        body.resource = None;
        body.window.clear();
    }

    pub(crate) fn release_link(&self) {
        self.body.lock().expect("channel body poisoned").link = None;
    }

    /// Exhaustion check at flush: the transfer qualification is gone and no
    /// replacement resource arrived during the cycle.
    pub(crate) fn exhausted_in_cycle(&self) -> bool {
        !self.delta.load().contains(Flags::ITEQ_TRANSFER)
            && !self.state.load().contains(Flags::ITEQ_TRANSFER)
    }
}

impl Drop for ChannelCore {
    fn drop(&mut self) {
        let polarity = self.polarity();
        if self.port.latched_for(polarity) {
            self.port.unlatch(Some(polarity));
        }
    }
}

/// A cheap clonable handle to one transfer participant.
#[derive(Clone)]
pub struct Channel {
    pub(crate) core: Arc<ChannelCore>,
}

impl PartialEq for Channel {
    fn eq(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl Eq for Channel {}

impl Channel {
    pub(crate) fn from_core(core: Arc<ChannelCore>) -> Channel {
        Channel { core }
    }

    /// Bind a resource buffer and qualify the channel for transfers.
    ///
    /// A terminating channel ignores the acquisition silently; the resource
    /// is dropped. Acquiring while the previous buffer is still transferable
    /// (no exhaust event observed yet) is refused.
    pub fn acquire(&self, resource: Resource) -> Result<(), Violation> {
        let core = &self.core;

        if core.terminating() {
            return Ok(());
        }
        // The previous acquisition may still sit on the delta, undrained
        // until the next cycle.
        if (core.state.load() | core.delta.load()).contains(Flags::ITEQ_TRANSFER) {
            return Err(Violation::ResourceHeld);
        }

        {
            let mut body = core.body.lock().expect("channel body poisoned");
            body.resource = Some(resource);
            body.window.clear();
        }

        match core.attached_junction() {
            Some(junction) => {
                core.delta.insert(Flags::ITEQ_TRANSFER);
                junction.enqueue_delta(core);
            }
            None => core.state.insert(Flags::ITEQ_TRANSFER),
        }
        Ok(())
    }

    /// Request shutdown. Unattached channels terminate immediately; attached
    /// ones emit a termination event within the next cycles.
    pub fn terminate(&self) {
        let core = &self.core;

        match core.attached_junction() {
            None => {
                if !core.terminating() {
                    core.state.insert(Flags::ITEQ_TERMINATE);
                    core.release_resource();
                    core.release_link();
                    core.port.unlatch(Some(core.polarity()));
                }
            }
            Some(junction) => {
                if !core.terminating() {
                    core.delta.insert(Flags::ITEQ_TERMINATE);
                    junction.enqueue_delta(core);
                }
            }
        }
    }

    /// Request a transfer attempt on the next cycle even without kernel
    /// readiness, yielding a zero-length transfer when nothing is pending.
    pub fn force(&self) {
        let core = &self.core;
        core.delta.insert(Flags::FORCE);

        if let Some(junction) = core.attached_junction() {
            if core.state.load().contains(Flags::ITEQ_TRANSFER) {
                junction.enqueue_delta(core);
            }
        }
    }

    /// This cycle's transfer, or `None` when no transfer event is set.
    pub fn transfer(&self) -> Option<Transfer> {
        let core = &self.core;
        if !core.events.load().contains(Flags::TEV_TRANSFER) {
            return None;
        }

        let body = core.body.lock().expect("channel body poisoned");
        let resource = body.resource.as_ref()?;
        let unit = resource.unit();
        let start = body.window.start / unit;
        let stop = body.window.stop / unit;

        Some(match resource {
            Resource::Octets(buf) => Transfer::Octets(buf[start..stop].to_vec()),
            Resource::Fds(fds) => Transfer::Fds(fds[start..stop].to_vec()),
            Resource::Datagrams(dga) => Transfer::Datagrams(dga.slice(start..stop)),
        })
    }

    /// The current window in unit indices, if a resource is held.
    pub fn slice(&self) -> Option<Range<usize>> {
        let body = self.core.body.lock().expect("channel body poisoned");
        let resource = body.resource.as_ref()?;
        let unit = resource.unit();
        Some(body.window.start / unit..body.window.stop / unit)
    }

    /// Units covered by this cycle's transfer event; zero outside one.
    pub fn sizeof_transfer(&self) -> usize {
        if !self.core.events.load().contains(Flags::TEV_TRANSFER) {
            return 0;
        }
        self.slice().map(|r| r.len()).unwrap_or(0)
    }

    /// The relevant address: peer for output channels, local for input.
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.core.port.endpoint(self.core.polarity())
    }

    pub fn port(&self) -> &Port {
        &self.core.port
    }

    pub fn polarity(&self) -> Polarity {
        self.core.polarity()
    }

    pub fn event_transfer(&self) -> bool {
        self.core.events.load().contains(Flags::TEV_TRANSFER)
    }

    pub fn event_terminate(&self) -> bool {
        self.core.events.load().contains(Flags::TEV_TERMINATE)
    }

    pub fn terminating(&self) -> bool {
        self.core.terminating()
    }

    /// Fully terminated: shutdown requested and no longer ring-attached.
    pub fn terminated(&self) -> bool {
        self.core.terminating() && self.core.attached_junction().is_none()
    }

    /// The previous resource was consumed and no replacement acquired.
    pub fn exhausted(&self) -> bool {
        !(self.core.state.load() | self.core.delta.load()).contains(Flags::ITEQ_TRANSFER)
    }

    /// Store an arbitrary user value on the channel; released at termination.
    pub fn set_link(&self, link: Box<dyn Any + Send>) {
        self.core.body.lock().expect("channel body poisoned").link = Some(link);
    }

    pub fn take_link(&self) -> Option<Box<dyn Any + Send>> {
        self.core
            .body
            .lock()
            .expect("channel body poisoned")
            .link
            .take()
    }

    /// Adjust the external resource behind the channel: socket buffer sizes
    /// for octets channels, the listen backlog for sockets channels. Other
    /// freights have no external resource to adjust.
    pub fn resize_exoresource(&self, size: usize) {
        if !self.core.port.latched() {
            return;
        }
        match self.core.freight {
            Freight::Octets => self
                .core
                .port
                .set_socket_buffer(self.core.polarity(), size as libc::c_int),
            Freight::Sockets => {
                self.core.port.listen(size as libc::c_int);
            }
            _ => {}
        }
    }

    /// Install an accept filter on a listening socket, where supported.
    #[cfg(target_os = "freebsd")]
    pub fn set_accept_filter(&self, name: &str) {
        use std::mem;

        if !self.core.port.latched() || name.len() >= 16 {
            return;
        }
        let mut afa: libc::accept_filter_arg = unsafe { mem::zeroed() };
        for (dst, src) in afa.af_name.iter_mut().zip(name.bytes()) {
            *dst = src as libc::c_char;
        }
        unsafe {
            libc::setsockopt(
                self.core.port.id(),
                libc::SOL_SOCKET,
                libc::SO_ACCEPTFILTER,
                &afa as *const libc::accept_filter_arg as *const libc::c_void,
                mem::size_of::<libc::accept_filter_arg>() as libc::socklen_t,
            );
        }
    }

    #[cfg(not(target_os = "freebsd"))]
    pub fn set_accept_filter(&self, _name: &str) {}
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("freight", &self.core.freight.identifier())
            .field("polarity", &self.core.polarity())
            .field("state", &self.core.state.load())
            .field("port", &*self.core.port)
            .finish()
    }
}

// Termination cause for channels torn down without events.
pub(crate) fn void_port(port: &Port) {
    port.unlatch(None);
    port.set_cause(Kcall::Void);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::Kind;

    fn pipe_pair() -> (Channel, Channel) {
        let input_port = Arc::new(Port::untethered());
        let output_port = Arc::new(Port::untethered());
        assert!(Port::pipe(&input_port, &output_port));
        input_port.latch(Polarity::Input);
        output_port.latch(Polarity::Output);

        (
            Channel::from_core(ChannelCore::new(
                Polarity::Input,
                input_port,
                Freight::Octets,
            )),
            Channel::from_core(ChannelCore::new(
                Polarity::Output,
                output_port,
                Freight::Octets,
            )),
        )
    }

    #[test]
    fn unattached_acquire_qualifies_state_directly() {
        let (input, _output) = pipe_pair();
        input.acquire(Resource::Octets(vec![0u8; 8])).expect("acquire");
        assert!(input.core.state.load().contains(Flags::ITEQ_TRANSFER));
        assert!(!input.exhausted());
    }

    #[test]
    fn double_acquire_is_refused_until_exhaust() {
        let (input, _output) = pipe_pair();
        input.acquire(Resource::Octets(vec![0u8; 8])).expect("first");
        assert_eq!(
            input.acquire(Resource::Octets(vec![0u8; 8])),
            Err(Violation::ResourceHeld)
        );
    }

    #[test]
    fn unattached_terminate_releases_everything() {
        let (input, output) = pipe_pair();
        input.acquire(Resource::Octets(vec![0u8; 8])).expect("acquire");
        input.set_link(Box::new(7u32));

        input.terminate();
        assert!(input.terminated());
        assert!(!input.port().latched());
        assert!(input.take_link().is_none());

        // Acquire after terminate is silently ignored.
        input.acquire(Resource::Octets(vec![0u8; 8])).expect("ignored");
        assert!(input.transfer().is_none());

        output.terminate();
        assert_eq!(input.port().kind(), Kind::Pipe);
    }

    #[test]
    fn window_collapse_advances_the_transfer_origin() {
        let mut window = Window::default();
        window.stop = 5;
        window.collapse();
        assert_eq!((window.start, window.stop), (5, 5));
        window.clear();
        assert_eq!((window.start, window.stop), (0, 0));
    }
}
