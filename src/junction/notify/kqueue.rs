//! kqueue backend.
//!
//! A single queue descriptor carries every filter. Subscription changes are
//! submitted with `EV_RECEIPT` so per-change errors come back as receipts
//! instead of failing the whole batch; filters are edge-triggered with
//! `EV_CLEAR`. The wake mechanism is an `EVFILT_USER` filter triggered with
//! `NOTE_TRIGGER`.

use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};

use log::debug;

use super::{Change, RawEvent, WAIT_SECONDS, WAKE_TOKEN};
use crate::port::{errno, Kcall, Port};

const WAKE_IDENT: usize = 1;

fn kev(
    ident: usize,
    filter: i16,
    flags: u16,
    fflags: u32,
    udata: usize,
) -> libc::kevent {
    libc::kevent {
        ident: ident as _,
        filter: filter as _,
        flags: flags as _,
        fflags: fflags as _,
        data: 0,
        udata: udata as *mut libc::c_void,
    }
}

fn timeout(wait: bool) -> libc::timespec {
    libc::timespec {
        tv_sec: if wait { WAIT_SECONDS as _ } else { 0 },
        tv_nsec: 0,
    }
}

pub(crate) struct Notifier {
    queue: AtomicI32,
}

impl Notifier {
    /// Collect retries run only while the scratch array keeps filling.
    pub(crate) const RETRY_UNCONDITIONAL: bool = false;
    /// The call recorded when a subscription fails.
    pub(crate) const SUBSCRIBE_CALL: Kcall = Kcall::Kevent;

    pub(crate) fn new() -> Notifier {
        Notifier {
            queue: AtomicI32::new(-1),
        }
    }

    fn id(&self) -> libc::c_int {
        self.queue.load(Ordering::SeqCst)
    }

    /// Open (or re-open after a fork) the queue; the junction port adopts
    /// the descriptor.
    pub(crate) fn open(&self, port: &Port) -> bool {
        let queue = unsafe { libc::kqueue() };
        if queue < 0 {
            port.record(Kcall::Kqueue, errno());
            return false;
        }
        port.adopt_queue(queue);
        self.queue.store(queue, Ordering::SeqCst);

        let change = kev(
            WAKE_IDENT,
            libc::EVFILT_USER,
            libc::EV_ADD | libc::EV_CLEAR,
            0,
            WAKE_TOKEN,
        );
        let ts = timeout(false);
        if unsafe { libc::kevent(queue, &change, 1, ptr::null_mut(), 0, &ts) } < 0 {
            port.record(Kcall::Kevent, errno());
            return false;
        }
        true
    }

    /// Nothing beyond the port-owned queue descriptor.
    pub(crate) fn close_auxiliary(&self) {
        self.queue.store(-1, Ordering::SeqCst);
    }

    /// Submit staged filter changes; attach errors surface per token.
    pub(crate) fn apply(
        &self,
        changes: &[Change],
        port: &Port,
        failures: &mut Vec<(usize, i32)>,
    ) {
        if changes.is_empty() {
            return;
        }

        let kevs: Vec<libc::kevent> = changes
            .iter()
            .map(|c| {
                let filter = if c.input {
                    libc::EVFILT_READ
                } else {
                    libc::EVFILT_WRITE
                };
                let flags = if c.attach {
                    libc::EV_ADD | libc::EV_CLEAR | libc::EV_RECEIPT
                } else {
                    libc::EV_DELETE | libc::EV_CLEAR | libc::EV_RECEIPT
                };
                kev(c.fd as usize, filter as i16, flags as u16, 0, c.token)
            })
            .collect();
        let mut receipts: Vec<libc::kevent> = vec![kev(0, 0, 0, 0, 0); changes.len()];

        // Changes must land; EINTR retries the submission.
        let ts = timeout(false);
        let n = loop {
            let n = unsafe {
                libc::kevent(
                    self.id(),
                    kevs.as_ptr(),
                    kevs.len() as _,
                    receipts.as_mut_ptr(),
                    receipts.len() as _,
                    &ts,
                )
            };
            if n >= 0 {
                break n as usize;
            }
            let err = errno();
            if err == libc::EINTR {
                continue;
            }
            port.record(Kcall::Kevent, err);
            if err == libc::EBADF {
                // Queue descriptor went bad; the next cycle re-initializes.
                port.unlatch(None);
            }
            return;
        };

        for (change, receipt) in changes.iter().zip(&receipts[..n]) {
            if receipt.flags & libc::EV_ERROR != 0 && receipt.data != 0 && change.attach {
                failures.push((change.token, receipt.data as i32));
            }
        }
    }

    /// One `kevent` collection into `out`; returns the raw event count.
    pub(crate) fn collect(
        &self,
        capacity: usize,
        wait: bool,
        port: &Port,
        out: &mut Vec<RawEvent>,
    ) -> usize {
        let mut events: Vec<libc::kevent> = Vec::with_capacity(capacity);
        let ts = timeout(wait);

        let n = unsafe {
            libc::kevent(
                self.id(),
                ptr::null(),
                0,
                events.as_mut_ptr(),
                capacity as _,
                &ts,
            )
        };
        if n < 0 {
            let err = errno();
            if err != libc::EINTR {
                port.record(Kcall::Kevent, err);
                if err == libc::EBADF {
                    port.unlatch(None);
                    debug!("kqueue descriptor unusable; junction will re-initialize");
                }
            }
            return 0;
        }
        unsafe { events.set_len(n as usize) };

        for event in &events {
            if event.filter == libc::EVFILT_USER {
                continue;
            }
            let write_eof =
                event.filter == libc::EVFILT_WRITE && event.flags & libc::EV_EOF != 0;
            out.push(RawEvent {
                token: event.udata as usize,
                // Read-side EOF still transfers: pending bytes drain first
                // and the zero-length read terminates.
                transfer: !write_eof,
                terminate: write_eof,
                errno: event.fflags as i32,
            });
        }

        n as usize
    }

    /// Trip a blocked collect from another thread.
    pub(crate) fn wake(&self, _port: &Port) -> bool {
        let mut change = kev(WAKE_IDENT, libc::EVFILT_USER, 0, 0, WAKE_TOKEN);
        change.fflags = libc::NOTE_TRIGGER;
        let ts = timeout(false);
        unsafe { libc::kevent(self.id(), &change, 1, ptr::null_mut(), 0, &ts) == 0 }
    }
}
