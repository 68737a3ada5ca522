//! epoll backend.
//!
//! Two epoll instances: the junction port owns the read instance and a
//! second instance carries only write filters. epoll reports readable
//! readiness far more often than writable at scale, so collects alternate
//! between the instances while the write instance has pending events. The
//! write instance itself is registered in the read instance as a readiness
//! hint, and an `eventfd` registered level-triggered provides the wake
//! mechanism.

use std::mem;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};

use log::debug;

use super::{Change, RawEvent, HINT_TOKEN, WAIT_SECONDS, WAKE_TOKEN};
use crate::port::{errno, Kcall, Port};

const TERMINATE_MASK: u32 =
    (libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32;
const TRANSFER_MASK: u32 = (libc::EPOLLIN | libc::EPOLLOUT) as u32;

fn event(events: u32, token: usize) -> libc::epoll_event {
    libc::epoll_event {
        events,
        u64: token as u64,
    }
}

pub(crate) struct Notifier {
    wfd: AtomicI32,
    efd: AtomicI32,
    /// 0: no writes pending; 1: collect from the write instance next;
    /// 2: just collected writes, take the read instance then alternate back.
    haswrites: AtomicU8,
}

impl Notifier {
    /// epoll retries its no-wait collects unconditionally.
    pub(crate) const RETRY_UNCONDITIONAL: bool = true;
    /// The call recorded when a subscription fails.
    pub(crate) const SUBSCRIBE_CALL: Kcall = Kcall::EpollCtl;

    pub(crate) fn new() -> Notifier {
        Notifier {
            wfd: AtomicI32::new(-1),
            efd: AtomicI32::new(-1),
            haswrites: AtomicU8::new(0),
        }
    }

    /// Open (or re-open after a fork) the instances; the junction port
    /// adopts the read instance.
    pub(crate) fn open(&self, port: &Port) -> bool {
        self.close_auxiliary();

        let rfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if rfd < 0 {
            port.record(Kcall::EpollCreate, errno());
            return false;
        }
        port.adopt_queue(rfd);

        let wfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if wfd < 0 {
            port.record(Kcall::EpollCreate, errno());
            return false;
        }
        let efd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if efd < 0 {
            port.record(Kcall::Eventfd, errno());
            unsafe { libc::close(wfd) };
            return false;
        }
        self.wfd.store(wfd, Ordering::SeqCst);
        self.efd.store(efd, Ordering::SeqCst);
        self.haswrites.store(0, Ordering::SeqCst);

        let mut wake = event(
            (libc::EPOLLIN | libc::EPOLLERR | libc::EPOLLHUP) as u32,
            WAKE_TOKEN,
        );
        if unsafe { libc::epoll_ctl(rfd, libc::EPOLL_CTL_ADD, efd, &mut wake) } < 0 {
            port.record(Kcall::EpollCtl, errno());
            return false;
        }

        let mut hint = event(
            (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLERR | libc::EPOLLHUP) as u32,
            HINT_TOKEN,
        );
        if unsafe { libc::epoll_ctl(rfd, libc::EPOLL_CTL_ADD, wfd, &mut hint) } < 0 {
            port.record(Kcall::EpollCtl, errno());
            return false;
        }

        true
    }

    pub(crate) fn close_auxiliary(&self) {
        for fd in [&self.wfd, &self.efd] {
            let fd = fd.swap(-1, Ordering::SeqCst);
            if fd >= 0 {
                unsafe { libc::close(fd) };
            }
        }
    }

    /// Apply staged filter changes with repeated `epoll_ctl`; attach errors
    /// surface per token.
    pub(crate) fn apply(
        &self,
        changes: &[Change],
        port: &Port,
        failures: &mut Vec<(usize, i32)>,
    ) {
        for change in changes {
            let instance = if change.input {
                port.id()
            } else {
                self.wfd.load(Ordering::SeqCst)
            };
            let interest = if change.input {
                libc::EPOLLIN
            } else {
                libc::EPOLLOUT
            };
            let mut ev = event(
                (interest | libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR | libc::EPOLLET)
                    as u32,
                change.token,
            );
            let op = if change.attach {
                libc::EPOLL_CTL_ADD
            } else {
                libc::EPOLL_CTL_DEL
            };

            if unsafe { libc::epoll_ctl(instance, op, change.fd, &mut ev) } < 0 {
                let err = errno();
                if change.attach && err != libc::EEXIST {
                    failures.push((change.token, err));
                }
            }
        }
    }

    fn wait_on(
        &self,
        instance: libc::c_int,
        capacity: usize,
        wait: bool,
        port: &Port,
        out: &mut Vec<RawEvent>,
    ) -> usize {
        let mut events: Vec<libc::epoll_event> =
            vec![unsafe { mem::zeroed() }; capacity.max(1)];
        let timeout = if wait { (WAIT_SECONDS * 1000) as libc::c_int } else { 0 };

        let n = unsafe {
            libc::epoll_wait(instance, events.as_mut_ptr(), events.len() as _, timeout)
        };
        if n < 0 {
            let err = errno();
            if err != libc::EINTR {
                port.record(Kcall::EpollWait, err);
                if err == libc::EBADF {
                    port.unlatch(None);
                    debug!("epoll descriptor unusable; junction will re-initialize");
                }
            }
            return 0;
        }

        for ev in &events[..n as usize] {
            match ev.u64 as usize {
                WAKE_TOKEN => {
                    let efd = self.efd.load(Ordering::SeqCst);
                    let mut buf = [0u8; 8];
                    unsafe {
                        libc::read(efd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                    };
                }
                HINT_TOKEN => {
                    self.haswrites.store(1, Ordering::SeqCst);
                }
                token => out.push(RawEvent {
                    token,
                    transfer: ev.events & TRANSFER_MASK != 0,
                    terminate: ev.events & TERMINATE_MASK != 0,
                    errno: 0,
                }),
            }
        }

        n as usize
    }

    /// One collection into `out`, alternating instances while writes are
    /// pending; returns the raw event count.
    pub(crate) fn collect(
        &self,
        capacity: usize,
        wait: bool,
        port: &Port,
        out: &mut Vec<RawEvent>,
    ) -> usize {
        // Blocking waits always land on the read instance: the wake
        // eventfd lives there, and pending write readiness still trips the
        // level-triggered hint filter. The write instance itself drains in
        // the no-wait collects.
        if wait {
            return self.wait_on(port.id(), capacity, true, port, out);
        }

        match self.haswrites.load(Ordering::SeqCst) {
            1 => {
                let wfd = self.wfd.load(Ordering::SeqCst);
                let n = self.wait_on(wfd, capacity, false, port, out);
                let next = if n < capacity { 0 } else { 2 };
                self.haswrites.store(next, Ordering::SeqCst);
                n
            }
            2 => {
                self.haswrites.store(1, Ordering::SeqCst);
                self.wait_on(port.id(), capacity, false, port, out)
            }
            _ => self.wait_on(port.id(), capacity, false, port, out),
        }
    }

    /// Trip a blocked collect from another thread.
    pub(crate) fn wake(&self, _port: &Port) -> bool {
        let efd = self.efd.load(Ordering::SeqCst);
        if efd < 0 {
            return false;
        }
        let one: u64 = 1;
        let r = unsafe {
            libc::write(
                efd,
                &one as *const u64 as *const libc::c_void,
                mem::size_of::<u64>(),
            )
        };
        r == mem::size_of::<u64>() as isize
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.close_auxiliary();
    }
}
