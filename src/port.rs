//! Kernel descriptor ownership and the syscall layer.
//!
//! A [`Port`] owns exactly one kernel descriptor together with the record of
//! the last failing call against it. Ports never raise out of the cycle
//! engine: a failed call stores `(Kcall, errno)` and the owning channel
//! observes it as a termination event. The latch bits track per-direction
//! liveness so a descriptor shared by an input and an output channel closes
//! exactly once, when both halves have unlatched.

use std::fmt;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};

use crate::endpoint::{Endpoint, SockAddr};

pub(crate) const INVALID: RawFd = -1;

const LATCH_INPUT: u8 = 0x01;
const LATCH_OUTPUT: u8 = 0x10;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

pub(crate) fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Transfer direction of a channel over its port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Input,
    Output,
}

impl Polarity {
    fn latch_bit(self) -> u8 {
        match self {
            Polarity::Input => LATCH_INPUT,
            Polarity::Output => LATCH_OUTPUT,
        }
    }
}

/// Descriptor classification, assigned by [`Port::identify`] or at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Kind {
    Unknown = 0,
    Bad,
    Pipe,
    Fifo,
    Device,
    Tty,
    Socket,
    File,
    Kqueue,
}

impl Kind {
    fn from_repr(v: u8) -> Kind {
        match v {
            1 => Kind::Bad,
            2 => Kind::Pipe,
            3 => Kind::Fifo,
            4 => Kind::Device,
            5 => Kind::Tty,
            6 => Kind::Socket,
            7 => Kind::File,
            8 => Kind::Kqueue,
            _ => Kind::Unknown,
        }
    }

    pub fn identifier(self) -> &'static str {
        match self {
            Kind::Unknown => "unknown",
            Kind::Bad => "bad",
            Kind::Pipe => "pipe",
            Kind::Fifo => "fifo",
            Kind::Device => "device",
            Kind::Tty => "tty",
            Kind::Socket => "socket",
            Kind::File => "file",
            Kind::Kqueue => "kqueue",
        }
    }
}

/// The syscall recorded as the cause of a port's last error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Kcall {
    None = 0,
    Socket,
    Socketpair,
    Pipe,
    Bind,
    Connect,
    Listen,
    Accept,
    Open,
    Read,
    Write,
    Recv,
    Send,
    Recvmsg,
    Sendmsg,
    Fstat,
    Fcntl,
    Setsockopt,
    Getsockname,
    Getpeername,
    Shutdown,
    Close,
    Kqueue,
    Kevent,
    EpollCreate,
    EpollCtl,
    EpollWait,
    Eventfd,
    Identify,
    Eof,
    Shatter,
    Leak,
    Void,
}

impl Kcall {
    fn from_repr(v: u8) -> Kcall {
        const TABLE: [Kcall; 32] = [
            Kcall::None,
            Kcall::Socket,
            Kcall::Socketpair,
            Kcall::Pipe,
            Kcall::Bind,
            Kcall::Connect,
            Kcall::Listen,
            Kcall::Accept,
            Kcall::Open,
            Kcall::Read,
            Kcall::Write,
            Kcall::Recv,
            Kcall::Send,
            Kcall::Recvmsg,
            Kcall::Sendmsg,
            Kcall::Fstat,
            Kcall::Fcntl,
            Kcall::Setsockopt,
            Kcall::Getsockname,
            Kcall::Getpeername,
            Kcall::Shutdown,
            Kcall::Close,
            Kcall::Kqueue,
            Kcall::Kevent,
            Kcall::EpollCreate,
            Kcall::EpollCtl,
            Kcall::EpollWait,
            Kcall::Eventfd,
            Kcall::Identify,
            Kcall::Eof,
            Kcall::Shatter,
            Kcall::Leak,
        ];
        if (v as usize) < TABLE.len() {
            TABLE[v as usize]
        } else {
            Kcall::Void
        }
    }

    pub fn identifier(self) -> &'static str {
        match self {
            Kcall::None => "none",
            Kcall::Socket => "socket",
            Kcall::Socketpair => "socketpair",
            Kcall::Pipe => "pipe",
            Kcall::Bind => "bind",
            Kcall::Connect => "connect",
            Kcall::Listen => "listen",
            Kcall::Accept => "accept",
            Kcall::Open => "open",
            Kcall::Read => "read",
            Kcall::Write => "write",
            Kcall::Recv => "recv",
            Kcall::Send => "send",
            Kcall::Recvmsg => "recvmsg",
            Kcall::Sendmsg => "sendmsg",
            Kcall::Fstat => "fstat",
            Kcall::Fcntl => "fcntl",
            Kcall::Setsockopt => "setsockopt",
            Kcall::Getsockname => "getsockname",
            Kcall::Getpeername => "getpeername",
            Kcall::Shutdown => "shutdown",
            Kcall::Close => "close",
            Kcall::Kqueue => "kqueue",
            Kcall::Kevent => "kevent",
            Kcall::EpollCreate => "epoll_create",
            Kcall::EpollCtl => "epoll_ctl",
            Kcall::EpollWait => "epoll_wait",
            Kcall::Eventfd => "eventfd",
            Kcall::Identify => "identify",
            Kcall::Eof => "eof",
            Kcall::Shatter => "shatter",
            Kcall::Leak => "leak",
            Kcall::Void => "void",
        }
    }
}

/// Outcome of a transfer attempt against a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoStatus {
    /// The window was exhausted without the kernel blocking.
    Flow,
    /// The kernel would block; wait for the next readiness event.
    Stop,
    /// EOF or a fatal error; the cause is recorded on the port.
    Terminate,
}

/// Name an errno constant for human consumption.
pub(crate) fn errno_name(err: i32) -> &'static str {
    match err {
        0 => "OK",
        libc::EPERM => "EPERM",
        libc::ENOENT => "ENOENT",
        libc::EINTR => "EINTR",
        libc::EIO => "EIO",
        libc::EBADF => "EBADF",
        libc::EAGAIN => "EAGAIN",
        libc::ENOMEM => "ENOMEM",
        libc::EACCES => "EACCES",
        libc::EFAULT => "EFAULT",
        libc::ENOTDIR => "ENOTDIR",
        libc::EISDIR => "EISDIR",
        libc::EINVAL => "EINVAL",
        libc::ENFILE => "ENFILE",
        libc::EMFILE => "EMFILE",
        libc::ESPIPE => "ESPIPE",
        libc::EPIPE => "EPIPE",
        libc::EEXIST => "EEXIST",
        libc::EMSGSIZE => "EMSGSIZE",
        libc::EPROTOTYPE => "EPROTOTYPE",
        libc::ENOTSOCK => "ENOTSOCK",
        libc::EDESTADDRREQ => "EDESTADDRREQ",
        libc::EADDRINUSE => "EADDRINUSE",
        libc::EADDRNOTAVAIL => "EADDRNOTAVAIL",
        libc::ENETUNREACH => "ENETUNREACH",
        libc::ECONNABORTED => "ECONNABORTED",
        libc::ECONNRESET => "ECONNRESET",
        libc::ENOBUFS => "ENOBUFS",
        libc::EISCONN => "EISCONN",
        libc::ENOTCONN => "ENOTCONN",
        libc::ETIMEDOUT => "ETIMEDOUT",
        libc::ECONNREFUSED => "ECONNREFUSED",
        libc::EHOSTUNREACH => "EHOSTUNREACH",
        libc::EINPROGRESS => "EINPROGRESS",
        _ => "ENOTDEFINED",
    }
}

/// One kernel descriptor and its error record.
pub struct Port {
    point: AtomicI32,
    kind: AtomicU8,
    cause: AtomicU8,
    error: AtomicI32,
    latches: AtomicU8,
    leaked: AtomicBool,
}

impl Port {
    pub(crate) fn untethered() -> Port {
        Port {
            point: AtomicI32::new(INVALID),
            kind: AtomicU8::new(Kind::Unknown as u8),
            cause: AtomicU8::new(Kcall::None as u8),
            error: AtomicI32::new(0),
            latches: AtomicU8::new(0),
            leaked: AtomicBool::new(false),
        }
    }

    /// The kernel descriptor, `-1` once closed.
    pub fn id(&self) -> RawFd {
        self.point.load(Ordering::SeqCst)
    }

    pub fn kind(&self) -> Kind {
        Kind::from_repr(self.kind.load(Ordering::SeqCst))
    }

    pub fn call(&self) -> Kcall {
        Kcall::from_repr(self.cause.load(Ordering::SeqCst))
    }

    pub fn error_code(&self) -> i32 {
        self.error.load(Ordering::SeqCst)
    }

    pub fn error_name(&self) -> &'static str {
        errno_name(self.error_code())
    }

    pub fn error_description(&self) -> String {
        match self.error_code() {
            0 => String::from("no error"),
            err => io::Error::from_raw_os_error(err).to_string(),
        }
    }

    /// Raise the recorded error synchronously, if any.
    pub fn raised(&self) -> io::Result<()> {
        match self.error_code() {
            0 => Ok(()),
            err => Err(io::Error::from_raw_os_error(err)),
        }
    }

    pub(crate) fn record(&self, call: Kcall, err: i32) {
        self.cause.store(call as u8, Ordering::SeqCst);
        self.error.store(err, Ordering::SeqCst);
    }

    pub(crate) fn set_cause(&self, call: Kcall) {
        self.cause.store(call as u8, Ordering::SeqCst);
    }

    pub(crate) fn set_kind(&self, kind: Kind) {
        self.kind.store(kind as u8, Ordering::SeqCst);
    }

    pub fn errored(&self) -> bool {
        self.error_code() != 0
    }

    pub fn latched(&self) -> bool {
        self.latches.load(Ordering::SeqCst) != 0
    }

    pub(crate) fn latched_for(&self, polarity: Polarity) -> bool {
        self.latches.load(Ordering::SeqCst) & polarity.latch_bit() != 0
    }

    pub(crate) fn latch(&self, polarity: Polarity) {
        self.latches.fetch_or(polarity.latch_bit(), Ordering::SeqCst);
    }

    pub(crate) fn latch_both(&self) {
        self.latches
            .fetch_or(LATCH_INPUT | LATCH_OUTPUT, Ordering::SeqCst);
    }

    fn adopt(&self, fd: RawFd) {
        self.point.store(fd, Ordering::SeqCst);
    }

    /// Adopt a readiness-queue descriptor (kqueue or epoll instance).
    pub(crate) fn adopt_queue(&self, fd: RawFd) {
        self.adopt(fd);
        self.set_kind(Kind::Kqueue);
        self.record(Kcall::None, 0);
    }

    fn is_socket(&self) -> bool {
        self.kind() == Kind::Socket
    }

    /// Release one direction's claim on the descriptor.
    ///
    /// Releasing one half of a still-shared socket issues the matching
    /// `shutdown`; releasing the last latch closes the descriptor. Passing
    /// `None` drops both latches at once and closes without `shutdown`.
    pub(crate) fn unlatch(&self, polarity: Option<Polarity>) {
        let mask = match polarity {
            Some(p) => !p.latch_bit(),
            None => 0,
        };
        let prev = self.latches.fetch_and(mask, Ordering::SeqCst);
        let now = prev & mask;

        if prev == 0 {
            return;
        }

        if now != 0 {
            if self.is_socket() {
                let how = match polarity {
                    Some(Polarity::Input) => libc::SHUT_RD,
                    Some(Polarity::Output) => libc::SHUT_WR,
                    None => return,
                };
                let fd = self.id();
                if fd != INVALID && unsafe { libc::shutdown(fd, how) } < 0 {
                    // ENOTCONN here is ordinary; anything else is recorded.
                    let err = errno();
                    if err != libc::ENOTCONN {
                        self.record(Kcall::Shutdown, err);
                    }
                }
            }
            return;
        }

        self.close_point();
    }

    fn close_point(&self) {
        let fd = self.point.swap(INVALID, Ordering::SeqCst);
        if fd != INVALID && !self.leaked.load(Ordering::SeqCst) {
            unsafe { libc::close(fd) };
        }
    }

    /// Disclaim the descriptor without closing it; the caller owns it now.
    pub fn leak(&self) -> bool {
        let had = self.latches.swap(0, Ordering::SeqCst) != 0;
        self.leaked.store(true, Ordering::SeqCst);
        self.set_cause(Kcall::Leak);
        had
    }

    /// Drop the claim without issuing representation shutdowns.
    ///
    /// A port backing a subscribed channel should never be shattered, as the
    /// kernel subscription is lost with the descriptor; the channel then
    /// stays in its ring until user code terminates it.
    pub fn shatter(&self) -> bool {
        let had = self.latched();
        self.unlatch(None);
        self.set_cause(Kcall::Shatter);
        had
    }

    pub(crate) fn set_nonblocking(&self) {
        let fd = self.id();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            self.record(Kcall::Fcntl, errno());
        }
    }

    #[cfg(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))]
    fn suppress_sigpipe(&self) {
        let on: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                self.id(),
                libc::SOL_SOCKET,
                libc::SO_NOSIGPIPE,
                &on as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }

    #[cfg(not(any(
        target_os = "macos",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    )))]
    fn suppress_sigpipe(&self) {}

    // Constructors. Failures record (cause, errno) and leave the port in
    // place; the owning channel terminates through its first cycle.

    pub(crate) fn open_socket(&self, domain: libc::c_int, typ: libc::c_int, proto: libc::c_int) -> bool {
        let fd = unsafe { libc::socket(domain, typ, proto) };
        if fd < 0 {
            self.record(Kcall::Socket, errno());
            return false;
        }
        self.adopt(fd);
        self.set_kind(Kind::Socket);
        self.set_nonblocking();
        self.suppress_sigpipe();
        true
    }

    pub(crate) fn bind(&self, addr: &SockAddr) -> bool {
        if unsafe { libc::bind(self.id(), addr.as_ptr(), addr.len) } < 0 {
            self.record(Kcall::Bind, errno());
            return false;
        }
        true
    }

    /// Begin a non-blocking connect; completion is signalled by writability.
    pub(crate) fn connect(&self, addr: &SockAddr) -> bool {
        loop {
            if unsafe { libc::connect(self.id(), addr.as_ptr(), addr.len) } == 0 {
                return true;
            }
            match errno() {
                libc::EINTR => continue,
                libc::EINPROGRESS | libc::EAGAIN | libc::EALREADY | libc::EISCONN => return true,
                err => {
                    self.record(Kcall::Connect, err);
                    return false;
                }
            }
        }
    }

    pub(crate) fn bind_connect(&self, connect: &SockAddr, bind: &SockAddr) -> bool {
        self.bind(bind) && self.connect(connect)
    }

    pub(crate) fn listen(&self, backlog: libc::c_int) -> bool {
        if unsafe { libc::listen(self.id(), backlog) } < 0 {
            self.record(Kcall::Listen, errno());
            return false;
        }
        true
    }

    pub(crate) fn open_file(&self, path: &Path, flags: libc::c_int) -> bool {
        use std::os::unix::ffi::OsStrExt;

        let mut bytes = path.as_os_str().as_bytes().to_vec();
        bytes.push(0);

        let fd = unsafe { libc::open(bytes.as_ptr() as *const libc::c_char, flags, 0o666) };
        if fd < 0 {
            self.record(Kcall::Open, errno());
            return false;
        }
        self.adopt(fd);
        self.identify();
        true
    }

    pub(crate) fn pipe(input: &Port, output: &Port) -> bool {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            let err = errno();
            input.record(Kcall::Pipe, err);
            output.record(Kcall::Pipe, err);
            return false;
        }
        input.adopt(fds[0]);
        output.adopt(fds[1]);
        for p in [input, output] {
            p.set_kind(Kind::Pipe);
            p.set_nonblocking();
        }
        true
    }

    pub(crate) fn socketpair(first: &Port, second: &Port) -> bool {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) } < 0 {
            let err = errno();
            first.record(Kcall::Socketpair, err);
            second.record(Kcall::Socketpair, err);
            return false;
        }
        first.adopt(fds[0]);
        second.adopt(fds[1]);
        for p in [first, second] {
            p.set_kind(Kind::Socket);
            p.set_nonblocking();
            p.suppress_sigpipe();
        }
        true
    }

    /// Adopt and classify a descriptor acquired from user code.
    pub(crate) fn acquire(&self, fd: RawFd) {
        self.adopt(fd);
        self.identify();
    }

    /// Classify the descriptor with `fstat`; non-files become non-blocking.
    pub(crate) fn identify(&self) {
        let fd = self.id();
        let mut st: libc::stat = unsafe { mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut st) } < 0 {
            self.set_kind(Kind::Bad);
            self.record(Kcall::Fstat, errno());
            return;
        }

        let kind = match st.st_mode & libc::S_IFMT {
            libc::S_IFIFO => Kind::Fifo,
            libc::S_IFSOCK => Kind::Socket,
            libc::S_IFREG => Kind::File,
            libc::S_IFCHR => {
                if unsafe { libc::isatty(fd) } == 1 {
                    Kind::Tty
                } else {
                    Kind::Device
                }
            }
            _ => Kind::Unknown,
        };
        self.set_kind(kind);

        if kind != Kind::File {
            self.set_nonblocking();
        }
        if kind == Kind::Socket {
            self.suppress_sigpipe();
        }
    }

    pub(crate) fn set_socket_buffer(&self, polarity: Polarity, size: libc::c_int) {
        let opt = match polarity {
            Polarity::Input => libc::SO_RCVBUF,
            Polarity::Output => libc::SO_SNDBUF,
        };
        let r = unsafe {
            libc::setsockopt(
                self.id(),
                libc::SOL_SOCKET,
                opt,
                &size as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if r < 0 {
            self.record(Kcall::Setsockopt, errno());
        }
    }

    // Address projections.

    pub(crate) fn endpoint(&self, polarity: Polarity) -> Option<Endpoint> {
        if !self.latched() {
            return None;
        }

        let fd = self.id();
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let sa = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr;

        let r = match polarity {
            Polarity::Output => unsafe { libc::getpeername(fd, sa, &mut len) },
            Polarity::Input => unsafe { libc::getsockname(fd, sa, &mut len) },
        };
        if r < 0 {
            return None;
        }

        if storage.ss_family as libc::c_int == libc::AF_UNIX {
            let sun = &storage as *const libc::sockaddr_storage as *const libc::sockaddr_un;
            if unsafe { (*sun).sun_path[0] } == 0 {
                // Anonymous pair; report the peer credentials instead.
                return self.peer_credentials();
            }
        }

        Endpoint::from_sockaddr(&storage)
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn peer_credentials(&self) -> Option<Endpoint> {
        let mut cred: libc::ucred = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::ucred>() as libc::socklen_t;
        let r = unsafe {
            libc::getsockopt(
                self.id(),
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                &mut cred as *mut libc::ucred as *mut libc::c_void,
                &mut len,
            )
        };
        if r < 0 {
            return None;
        }
        Some(Endpoint::Credentials {
            uid: cred.uid,
            gid: cred.gid,
        })
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn peer_credentials(&self) -> Option<Endpoint> {
        let mut uid: libc::uid_t = 0;
        let mut gid: libc::gid_t = 0;
        if unsafe { libc::getpeereid(self.id(), &mut uid, &mut gid) } < 0 {
            return None;
        }
        Some(Endpoint::Credentials {
            uid: uid as u32,
            gid: gid as u32,
        })
    }

    // Transfer drivers. Every driver loops until the window is exhausted
    // (`Flow`), the kernel blocks (`Stop`), or EOF/error ends the channel
    // (`Terminate`). EINTR retries in place. The returned count is in bytes.

    pub(crate) fn input_octets(&self, buf: &mut [u8]) -> (usize, IoStatus) {
        if buf.is_empty() {
            return (0, IoStatus::Flow);
        }
        let fd = self.id();
        let socket = self.is_socket();
        let mut total = 0usize;

        while total < buf.len() {
            let rest = &mut buf[total..];
            let r = if socket {
                unsafe { libc::recv(fd, rest.as_mut_ptr() as *mut libc::c_void, rest.len(), 0) }
            } else {
                unsafe { libc::read(fd, rest.as_mut_ptr() as *mut libc::c_void, rest.len()) }
            };

            if r > 0 {
                total += r as usize;
                continue;
            }
            if r == 0 {
                self.record(Kcall::Eof, 0);
                return (total, IoStatus::Terminate);
            }
            match errno() {
                libc::EINTR => continue,
                libc::EAGAIN => return (total, IoStatus::Stop),
                err => {
                    self.record(if socket { Kcall::Recv } else { Kcall::Read }, err);
                    return (total, IoStatus::Terminate);
                }
            }
        }

        (total, IoStatus::Flow)
    }

    pub(crate) fn output_octets(&self, buf: &[u8]) -> (usize, IoStatus) {
        if buf.is_empty() {
            return (0, IoStatus::Flow);
        }
        let fd = self.id();
        let socket = self.is_socket();
        let mut total = 0usize;

        while total < buf.len() {
            let rest = &buf[total..];
            let r = if socket {
                unsafe { libc::send(fd, rest.as_ptr() as *const libc::c_void, rest.len(), SEND_FLAGS) }
            } else {
                unsafe { libc::write(fd, rest.as_ptr() as *const libc::c_void, rest.len()) }
            };

            if r >= 0 {
                total += r as usize;
                continue;
            }
            match errno() {
                libc::EINTR => continue,
                libc::EAGAIN => return (total, IoStatus::Stop),
                err => {
                    self.record(if socket { Kcall::Send } else { Kcall::Write }, err);
                    return (total, IoStatus::Terminate);
                }
            }
        }

        (total, IoStatus::Flow)
    }

    /// Accept connections into the descriptor slots.
    pub(crate) fn input_sockets(&self, fds: &mut [RawFd]) -> (usize, IoStatus) {
        if fds.is_empty() {
            return (0, IoStatus::Flow);
        }
        let fd = self.id();
        let mut count = 0usize;

        while count < fds.len() {
            let accepted =
                unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) };
            if accepted >= 0 {
                let flags = unsafe { libc::fcntl(accepted, libc::F_GETFL) };
                unsafe { libc::fcntl(accepted, libc::F_SETFL, flags | libc::O_NONBLOCK) };
                fds[count] = accepted;
                count += 1;
                continue;
            }
            match errno() {
                libc::EINTR | libc::ECONNABORTED => continue,
                // Transient descriptor exhaustion; retry on the next event.
                libc::EAGAIN | libc::EMFILE | libc::ENFILE => {
                    return (count * mem::size_of::<RawFd>(), IoStatus::Stop)
                }
                err => {
                    self.record(Kcall::Accept, err);
                    return (count * mem::size_of::<RawFd>(), IoStatus::Terminate);
                }
            }
        }

        (count * mem::size_of::<RawFd>(), IoStatus::Flow)
    }

    /// Receive descriptors over `SCM_RIGHTS`, one per message.
    pub(crate) fn input_ports(&self, fds: &mut [RawFd]) -> (usize, IoStatus) {
        if fds.is_empty() {
            return (0, IoStatus::Flow);
        }
        let fd = self.id();
        let mut count = 0usize;

        while count < fds.len() {
            let mut payload = [0u8; 1];
            let mut iov = libc::iovec {
                iov_base: payload.as_mut_ptr() as *mut libc::c_void,
                iov_len: 1,
            };
            let mut control = [0u8; 64];
            let mut msg: libc::msghdr = unsafe { mem::zeroed() };
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1 as _;
            msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = control.len() as _;

            let r = unsafe { libc::recvmsg(fd, &mut msg, 0) };
            if r == 0 {
                self.record(Kcall::Eof, 0);
                return (count * mem::size_of::<RawFd>(), IoStatus::Terminate);
            }
            if r < 0 {
                match errno() {
                    libc::EINTR => continue,
                    libc::EAGAIN => return (count * mem::size_of::<RawFd>(), IoStatus::Stop),
                    err => {
                        self.record(Kcall::Recvmsg, err);
                        return (count * mem::size_of::<RawFd>(), IoStatus::Terminate);
                    }
                }
            }

            let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
            if !cmsg.is_null() {
                let cmsg = unsafe { &*cmsg };
                if cmsg.cmsg_level == libc::SOL_SOCKET && cmsg.cmsg_type == libc::SCM_RIGHTS {
                    let mut passed: RawFd = INVALID;
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            libc::CMSG_DATA(cmsg) as *const u8,
                            &mut passed as *mut RawFd as *mut u8,
                            mem::size_of::<RawFd>(),
                        );
                    }
                    fds[count] = passed;
                    count += 1;
                }
            }
        }

        (count * mem::size_of::<RawFd>(), IoStatus::Flow)
    }

    /// Send descriptors over `SCM_RIGHTS`, one per message.
    pub(crate) fn output_ports(&self, fds: &[RawFd]) -> (usize, IoStatus) {
        if fds.is_empty() {
            return (0, IoStatus::Flow);
        }
        let fd = self.id();
        let mut count = 0usize;

        while count < fds.len() {
            let mut payload = [0u8; 1];
            let mut iov = libc::iovec {
                iov_base: payload.as_mut_ptr() as *mut libc::c_void,
                iov_len: 1,
            };
            let mut control = [0u8; 64];
            let mut msg: libc::msghdr = unsafe { mem::zeroed() };
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1 as _;
            msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as _;

            let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
            unsafe {
                (*cmsg).cmsg_level = libc::SOL_SOCKET;
                (*cmsg).cmsg_type = libc::SCM_RIGHTS;
                (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
                std::ptr::copy_nonoverlapping(
                    &fds[count] as *const RawFd as *const u8,
                    libc::CMSG_DATA(cmsg),
                    mem::size_of::<RawFd>(),
                );
            }

            let r = unsafe { libc::sendmsg(fd, &msg, SEND_FLAGS) };
            if r < 0 {
                match errno() {
                    libc::EINTR => continue,
                    libc::EAGAIN => return (count * mem::size_of::<RawFd>(), IoStatus::Stop),
                    err => {
                        self.record(Kcall::Sendmsg, err);
                        return (count * mem::size_of::<RawFd>(), IoStatus::Terminate);
                    }
                }
            }
            count += 1;
        }

        (count * mem::size_of::<RawFd>(), IoStatus::Flow)
    }

    /// Receive one datagram: the source address lands in `addr`, the payload
    /// in `payload`. Returns `Ok(addrlen)`; a zero-length datagram is valid.
    pub(crate) fn input_datagram(
        &self,
        addr: &mut [u8],
        payload: &mut [u8],
    ) -> Result<usize, IoStatus> {
        let fd = self.id();
        loop {
            let mut iov = libc::iovec {
                iov_base: payload.as_mut_ptr() as *mut libc::c_void,
                iov_len: payload.len(),
            };
            let mut msg: libc::msghdr = unsafe { mem::zeroed() };
            msg.msg_name = addr.as_mut_ptr() as *mut libc::c_void;
            msg.msg_namelen = addr.len() as libc::socklen_t;
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1 as _;

            let r = unsafe { libc::recvmsg(fd, &mut msg, 0) };
            if r >= 0 {
                return Ok(msg.msg_namelen as usize);
            }
            match errno() {
                libc::EINTR => continue,
                libc::EAGAIN => return Err(IoStatus::Stop),
                err => {
                    self.record(Kcall::Recvmsg, err);
                    return Err(IoStatus::Terminate);
                }
            }
        }
    }

    /// Send one datagram to the address stored in `addr[..addrlen]`.
    pub(crate) fn output_datagram(
        &self,
        addr: &[u8],
        addrlen: usize,
        payload: &[u8],
    ) -> Result<(), IoStatus> {
        let fd = self.id();
        loop {
            let mut iov = libc::iovec {
                iov_base: payload.as_ptr() as *mut libc::c_void,
                iov_len: payload.len(),
            };
            let mut msg: libc::msghdr = unsafe { mem::zeroed() };
            msg.msg_name = addr.as_ptr() as *mut libc::c_void;
            msg.msg_namelen = addrlen as libc::socklen_t;
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1 as _;

            let r = unsafe { libc::sendmsg(fd, &msg, SEND_FLAGS) };
            if r >= 0 {
                return Ok(());
            }
            match errno() {
                libc::EINTR => continue,
                libc::EAGAIN => return Err(IoStatus::Stop),
                err => {
                    self.record(Kcall::Sendmsg, err);
                    return Err(IoStatus::Terminate);
                }
            }
        }
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        self.close_point();
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}: {}",
            self.kind().identifier(),
            self.call().identifier(),
            self.error_name(),
            self.error_description()
        )
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("call", &self.call())
            .field("error", &self.error_code())
            .field("latched", &self.latched())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fd_is_open(fd: RawFd) -> bool {
        (unsafe { libc::fcntl(fd, libc::F_GETFD) }) != -1
    }

    #[test]
    fn pipe_ports_classify_and_close_once() {
        let input = Port::untethered();
        let output = Port::untethered();
        assert!(Port::pipe(&input, &output));
        input.latch(Polarity::Input);
        output.latch(Polarity::Output);

        assert_eq!(input.kind(), Kind::Pipe);
        let rfd = input.id();
        assert!(fd_is_open(rfd));

        input.unlatch(Some(Polarity::Input));
        assert!(!input.latched());
        assert!(!fd_is_open(rfd));
        assert_eq!(input.id(), INVALID);

        // Second unlatch is inert.
        input.unlatch(Some(Polarity::Input));
        output.unlatch(Some(Polarity::Output));
    }

    #[test]
    fn shared_port_closes_when_both_halves_unlatch() {
        let port = Port::untethered();
        let other = Port::untethered();
        assert!(Port::socketpair(&port, &other));
        port.latch_both();
        other.latch_both();

        let fd = port.id();
        port.unlatch(Some(Polarity::Input));
        assert!(port.latched());
        assert!(fd_is_open(fd));

        port.unlatch(Some(Polarity::Output));
        assert!(!port.latched());
        assert!(!fd_is_open(fd));

        other.unlatch(None);
    }

    #[test]
    fn leak_disclaims_without_closing() {
        let input = Port::untethered();
        let output = Port::untethered();
        assert!(Port::pipe(&input, &output));
        input.latch(Polarity::Input);

        let fd = input.id();
        assert!(input.leak());
        assert_eq!(input.call(), Kcall::Leak);
        input.unlatch(None);
        assert!(fd_is_open(fd));

        unsafe { libc::close(fd) };
        output.unlatch(None);
    }

    #[test]
    fn octets_round_trip_over_pipe() {
        let input = Port::untethered();
        let output = Port::untethered();
        assert!(Port::pipe(&input, &output));
        input.latch(Polarity::Input);
        output.latch(Polarity::Output);

        let (sent, status) = output.output_octets(b"ping");
        assert_eq!((sent, status), (4, IoStatus::Flow));

        let mut buf = [0u8; 4];
        let (received, status) = input.input_octets(&mut buf);
        assert_eq!((received, status), (4, IoStatus::Flow));
        assert_eq!(&buf, b"ping");

        // Nothing pending: the read stops rather than terminating.
        let (received, status) = input.input_octets(&mut buf);
        assert_eq!((received, status), (0, IoStatus::Stop));

        output.unlatch(None);
        let (received, status) = input.input_octets(&mut buf);
        assert_eq!((received, status), (0, IoStatus::Terminate));
        assert_eq!(input.call(), Kcall::Eof);

        input.unlatch(None);
    }

    #[test]
    fn identify_classifies_an_acquired_descriptor() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let port = Port::untethered();
        port.acquire(fds[0]);
        port.latch(Polarity::Input);
        assert_eq!(port.kind(), Kind::Fifo);

        port.unlatch(None);
        unsafe { libc::close(fds[1]) };
    }
}
