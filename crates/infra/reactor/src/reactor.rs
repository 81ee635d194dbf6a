//! The event loop: session table, dispatch, read/write primitives
//!
//! Dispatch discipline: sessions live behind `Rc<RefCell<_>>` so a
//! callback holding `&mut Reactor` can write to, register, or remove any
//! session — including its own — while the loop is mid-dispatch. Every
//! step that re-enters the table re-validates the `(fd, instance)` pair
//! first; a callback that tears its own session down signals it through
//! its return value and the loop never touches the record again.

use crate::buffer::IoBuffer;
use crate::error::ReactorError;
use crate::handler::{
    ConnectCb, ErrorCb, Handler, IoVerdict, RecvEvent, SignalCb, TimerCb,
};
use crate::ktls;
use crate::net;
use crate::session::{FdSession, SessionHandle, SessionOptions, TlsState};
use crate::tls::FdIo;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use peregrine_common::Ts;
use rustc_hash::FxHashMap;
use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::SocketAddrV4;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Read chunk hint for buffer growth
const READ_CHUNK: usize = 16 * 1024;
/// Chunk size for unbuffered raw-input delivery
const RAW_CHUNK: usize = 64 * 1024;

/// How a completed `run` ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopControl {
    /// Single-shot batch dispatched, loop may be re-entered
    Continue,
    /// `exit_immediately` was called with this reason
    ExitRequested(String),
}

/// Reactor tuning
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Session table capacity; registration beyond this fails
    pub max_sessions: usize,
    /// OS wait bound when not busy-waiting (keeps exit requests prompt)
    pub poll_timeout: Duration,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            max_sessions: 1024,
            poll_timeout: Duration::from_millis(100),
        }
    }
}

/// Single-threaded edge-triggered I/O reactor
pub struct Reactor {
    poll: Poll,
    sessions: FxHashMap<RawFd, Rc<RefCell<FdSession>>>,
    capacity: usize,
    poll_timeout: Duration,
    next_instance: u64,
    exit: Option<String>,
}

impl Reactor {
    /// Create a reactor with the given configuration.
    pub fn new(config: ReactorConfig) -> Result<Self, ReactorError> {
        Ok(Self {
            poll: Poll::new()?,
            sessions: FxHashMap::default(),
            capacity: config.max_sessions,
            poll_timeout: config.poll_timeout,
            next_instance: 1,
            exit: None,
        })
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// True if `handle` still refers to a live session.
    #[must_use]
    pub fn is_live(&self, handle: SessionHandle) -> bool {
        self.sessions
            .get(&handle.fd)
            .is_some_and(|rc| rc.borrow().instance == handle.instance)
    }

    fn session_rc(&self, handle: SessionHandle) -> Result<Rc<RefCell<FdSession>>, ReactorError> {
        match self.sessions.get(&handle.fd) {
            Some(rc) if rc.borrow().instance == handle.instance => Ok(Rc::clone(rc)),
            _ => Err(ReactorError::StaleHandle {
                fd: handle.fd,
                instance: handle.instance,
            }),
        }
    }

    /// Bind a session record to an already-created FD. The reactor takes
    /// ownership of the FD and closes it on removal.
    pub fn register(
        &mut self,
        fd: RawFd,
        handler: Handler,
        opts: SessionOptions,
    ) -> Result<SessionHandle, ReactorError> {
        if self.sessions.len() >= self.capacity {
            return Err(ReactorError::TooManySessions {
                capacity: self.capacity,
            });
        }
        if self.sessions.contains_key(&fd) {
            return Err(ReactorError::AlreadyRegistered(fd));
        }
        if opts.rd_buf_max == 0 {
            return Err(ReactorError::InvalidConfig(
                "rd_buf_max must be non-zero".into(),
            ));
        }
        let instance = self.next_instance;
        self.next_instance += 1;
        let mut sess = FdSession::new(fd, instance, handler, &opts);
        if let Some(setup) = &opts.tls {
            let tls = crate::tls::TlsSession::new(
                Arc::clone(&setup.config),
                &setup.server_name,
                setup.kernel_offload,
            )?;
            sess.tls = TlsState::UserSpace(Box::new(tls));
        }
        self.poll.registry().register(
            &mut SourceFd(&fd),
            Token(fd as usize),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        let handle = sess.handle();
        debug!(%handle, kind = sess.handler.kind(), "session registered");
        self.sessions.insert(fd, Rc::new(RefCell::new(sess)));
        Ok(handle)
    }

    /// Install the error callback for a session.
    pub fn set_error_handler(
        &mut self,
        handle: SessionHandle,
        cb: ErrorCb,
    ) -> Result<(), ReactorError> {
        let rc = self.session_rc(handle)?;
        rc.borrow_mut().on_error = Some(cb);
        Ok(())
    }

    /// Create a non-blocking TCP socket, start connecting, and register it.
    /// `then` becomes the active handler once the connection (and TLS
    /// handshake, if configured) completes.
    pub fn connect_tcp(
        &mut self,
        addr: SocketAddrV4,
        opts: SessionOptions,
        on_connect: ConnectCb,
        then: Handler,
    ) -> Result<SessionHandle, ReactorError> {
        let fd = net::tcp_socket()?;
        if let Err(e) = net::start_connect(fd, addr) {
            net::close_fd(fd);
            return Err(e.into());
        }
        let handler = Handler::Connect {
            on_connect,
            then: Box::new(then),
        };
        let handle = match self.register(fd, handler, opts) {
            Ok(h) => h,
            Err(e) => {
                net::close_fd(fd);
                return Err(e);
            }
        };
        if let Some(rc) = self.sessions.get(&fd) {
            rc.borrow_mut().connecting = true;
        }
        Ok(handle)
    }

    /// Register a periodic timer backed by a monotonic timerfd.
    pub fn add_timer(&mut self, period: Duration, cb: TimerCb) -> Result<SessionHandle, ReactorError> {
        if period.is_zero() {
            return Err(ReactorError::InvalidConfig("timer period must be non-zero".into()));
        }
        // SAFETY: plain timerfd syscalls; spec is a valid itimerspec.
        let fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let ts = libc::timespec {
            tv_sec: period.as_secs() as libc::time_t,
            tv_nsec: libc::c_long::from(period.subsec_nanos()),
        };
        let spec = libc::itimerspec {
            it_interval: ts,
            it_value: ts,
        };
        // SAFETY: fd is a fresh timerfd, spec outlives the call.
        let rc = unsafe { libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut()) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            net::close_fd(fd);
            return Err(err.into());
        }
        match self.register(fd, Handler::Timer(cb), SessionOptions::default()) {
            Ok(h) => Ok(h),
            Err(e) => {
                net::close_fd(fd);
                Err(e)
            }
        }
    }

    /// Register a signalfd for the given signals; the signals are blocked
    /// for normal delivery on this thread first.
    pub fn add_signal(&mut self, signals: &[i32], cb: SignalCb) -> Result<SessionHandle, ReactorError> {
        // SAFETY: set is a valid sigset for the duration of these calls.
        let fd = unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            for &s in signals {
                libc::sigaddset(&mut set, s);
            }
            libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
            libc::signalfd(-1, &set, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC)
        };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        match self.register(fd, Handler::Signal(cb), SessionOptions::default()) {
            Ok(h) => Ok(h),
            Err(e) => {
                net::close_fd(fd);
                Err(e)
            }
        }
    }

    /// Tear a session down: deregister, close the FD, release buffers and
    /// TLS state. Safe to call from within that session's own callback —
    /// the callback must then report the session as abandoned.
    pub fn remove(&mut self, handle: SessionHandle) -> Result<(), ReactorError> {
        self.session_rc(handle)?;
        let rc = self
            .sessions
            .remove(&handle.fd)
            .expect("validated just above");
        let _ = self.poll.registry().deregister(&mut SourceFd(&handle.fd));
        net::close_fd(handle.fd);
        debug!(%handle, "session removed");
        drop(rc);
        Ok(())
    }

    /// Request loop termination after the current dispatch batch.
    /// Idempotent; safe to call from within a callback.
    pub fn exit_immediately(&mut self, reason: &str) {
        if self.exit.is_none() {
            info!(reason, "reactor exit requested");
            self.exit = Some(reason.to_owned());
        }
    }

    /// Enter the wait loop. With `single_shot` the loop dispatches one
    /// readiness batch and returns; with `busy_wait` the OS wait spins with
    /// a zero timeout, trading CPU for latency.
    pub fn run(&mut self, single_shot: bool, busy_wait: bool) -> Result<LoopControl, ReactorError> {
        let mut events = Events::with_capacity(1024);
        let timeout = if busy_wait {
            Duration::ZERO
        } else {
            self.poll_timeout
        };
        loop {
            match self.poll.poll(&mut events, Some(timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            let batch: Vec<(RawFd, bool, bool)> = events
                .iter()
                .map(|e| (e.token().0 as RawFd, e.is_readable(), e.is_writable()))
                .collect();
            for (fd, readable, writable) in batch {
                self.dispatch(fd, readable, writable);
            }
            if let Some(reason) = self.exit.take() {
                return Ok(LoopControl::ExitRequested(reason));
            }
            if single_shot {
                return Ok(LoopControl::Continue);
            }
        }
    }

    fn dispatch(&mut self, fd: RawFd, readable: bool, writable: bool) {
        let Some(rc) = self.sessions.get(&fd).map(Rc::clone) else {
            return;
        };
        let handle = rc.borrow().handle();
        if writable {
            if let Err(e) = self.handle_writable(&rc, handle) {
                self.report_error(&rc, handle, &e);
                return;
            }
            if !self.is_live(handle) {
                return;
            }
        }
        if readable {
            if let Err(e) = self.handle_readable(&rc, handle) {
                self.report_error(&rc, handle, &e);
            }
        }
    }

    fn report_error(&mut self, rc: &Rc<RefCell<FdSession>>, handle: SessionHandle, err: &ReactorError) {
        warn!(%handle, error = %err, "session error");
        let cb = rc.borrow().on_error.clone();
        if let Some(cb) = cb {
            (cb.borrow_mut())(self, handle, err);
        }
    }

    // ------------------------------------------------------------------
    // Writable path
    // ------------------------------------------------------------------

    fn handle_writable(
        &mut self,
        rc: &Rc<RefCell<FdSession>>,
        handle: SessionHandle,
    ) -> Result<(), ReactorError> {
        let connect_pending = {
            let s = rc.borrow();
            s.connecting && !s.connected
        };
        if connect_pending {
            net::take_socket_error(handle.fd)?;
            {
                let mut s = rc.borrow_mut();
                s.connecting = false;
                s.connected = true;
                if matches!(s.tls, TlsState::UserSpace(_)) {
                    s.handshaking = true;
                }
            }
            if rc.borrow().handshaking {
                return self.drive_handshake(rc, handle);
            }
            self.finish_connect(rc, handle);
            return Ok(());
        }
        if rc.borrow().handshaking {
            return self.drive_handshake(rc, handle);
        }
        let mut s = rc.borrow_mut();
        let fd = s.fd;
        match &mut s.tls {
            TlsState::UserSpace(tls) => {
                tls.flush_tls(fd)?;
            }
            _ => Self::drain_pending(&mut s)?,
        }
        Ok(())
    }

    fn drain_pending(s: &mut FdSession) -> Result<(), ReactorError> {
        let fd = s.fd;
        while !s.wr_pending.is_empty() {
            match sys_write(fd, &s.wr_pending)? {
                None => break,
                Some(n) => {
                    s.wr_pending.drain(..n);
                }
            }
        }
        Ok(())
    }

    /// Send bytes on a session. Returns the completion timestamp when every
    /// byte reached the OS, or `None` when a remainder was staged in the
    /// outbound buffer. Buffered bytes always drain before new submissions
    /// so wire order is byte-exact FIFO.
    pub fn send(&mut self, handle: SessionHandle, data: &[u8]) -> Result<Option<Ts>, ReactorError> {
        let rc = self.session_rc(handle)?;
        let mut s = rc.borrow_mut();
        let fd = s.fd;
        if let TlsState::UserSpace(tls) = &mut s.tls {
            tls.conn
                .writer()
                .write_all(data)
                .map_err(ReactorError::Io)?;
            let flushed = tls.flush_tls(fd)?;
            return Ok(flushed.then(Ts::now));
        }
        if !s.wr_pending.is_empty() {
            Self::stage(&mut s, data)?;
            Self::drain_pending(&mut s)?;
            return Ok(s.wr_pending.is_empty().then(Ts::now));
        }
        let mut off = 0usize;
        while off < data.len() {
            match sys_write(fd, &data[off..])? {
                Some(n) => off += n,
                None => {
                    Self::stage(&mut s, &data[off..])?;
                    return Ok(None);
                }
            }
        }
        Ok(Some(Ts::now()))
    }

    fn stage(s: &mut FdSession, data: &[u8]) -> Result<(), ReactorError> {
        if s.wr_buf_max == 0 {
            return Err(ReactorError::WouldBlockUnbuffered(s.fd));
        }
        if s.wr_pending.len() + data.len() > s.wr_buf_max {
            return Err(ReactorError::BufferOverflow {
                fd: s.fd,
                capacity: s.wr_buf_max,
            });
        }
        s.wr_pending.extend_from_slice(data);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Readable path
    // ------------------------------------------------------------------

    fn handle_readable(
        &mut self,
        rc: &Rc<RefCell<FdSession>>,
        handle: SessionHandle,
    ) -> Result<(), ReactorError> {
        if rc.borrow().handshaking {
            return self.drive_handshake(rc, handle);
        }
        let handler = rc.borrow().handler.clone();
        match handler {
            Handler::Read(cb) => self.readable_stream(rc, handle, &cb),
            Handler::Recv(cb) => self.readable_datagram(rc, handle, &cb),
            Handler::RawInput(cb) => self.readable_raw(rc, handle, &cb),
            Handler::Timer(cb) => self.readable_timer(rc, handle, &cb),
            Handler::Signal(cb) => self.readable_signal(rc, handle, &cb),
            Handler::Accept(cb) => self.readable_accept(rc, handle, &cb),
            // Spurious readable while the connect is still in flight
            Handler::Connect { .. } => Ok(()),
        }
    }

    fn readable_stream(
        &mut self,
        rc: &Rc<RefCell<FdSession>>,
        handle: SessionHandle,
        cb: &crate::handler::ReadCb,
    ) -> Result<(), ReactorError> {
        {
            let mut s = rc.borrow_mut();
            if matches!(s.tls, TlsState::UserSpace(_)) {
                Self::read_tls_until_eagain(&mut s)?;
            } else {
                Self::read_plain_until_eagain(&mut s)?;
            }
        }
        if rc.borrow().rd_buf.is_empty() {
            return Ok(());
        }
        let ts = Ts::now();
        // The buffer is lifted out of the session for the callback so the
        // callback can freely write to / remove this session meanwhile.
        let mut buf = std::mem::replace(&mut rc.borrow_mut().rd_buf, IoBuffer::new(1, 1));
        let consumed = (cb.borrow_mut())(self, handle, buf.filled(), ts);
        if consumed < 0 {
            // Session abandoned by the callback; its buffer dies here.
            return Ok(());
        }
        #[allow(clippy::cast_sign_loss)]
        let consumed = (consumed as usize).min(buf.len());
        buf.consume_and_crunch(consumed);
        if self.is_live(handle) {
            rc.borrow_mut().rd_buf = buf;
        }
        Ok(())
    }

    fn read_plain_until_eagain(s: &mut FdSession) -> Result<(), ReactorError> {
        let fd = s.fd;
        loop {
            let max = s.rd_buf.max_capacity();
            let spare = s.rd_buf.spare(READ_CHUNK);
            if spare.is_empty() {
                return Err(ReactorError::BufferOverflow { fd, capacity: max });
            }
            match sys_read(fd, spare)? {
                None => break,
                Some(0) => return Err(ReactorError::PeerClosed(fd)),
                Some(n) => s.rd_buf.commit(n),
            }
        }
        Ok(())
    }

    fn read_tls_until_eagain(s: &mut FdSession) -> Result<(), ReactorError> {
        let fd = s.fd;
        let max = s.rd_buf.max_capacity();
        let TlsState::UserSpace(tls) = &mut s.tls else {
            return Ok(());
        };
        let mut io = FdIo(fd);
        loop {
            match tls.conn.read_tls(&mut io) {
                Ok(0) => return Err(ReactorError::PeerClosed(fd)),
                Ok(_) => {
                    let state = tls
                        .conn
                        .process_new_packets()
                        .map_err(ReactorError::Tls)?;
                    let mut remaining = state.plaintext_bytes_to_read();
                    while remaining > 0 {
                        let spare = s.rd_buf.spare(READ_CHUNK.min(remaining));
                        if spare.is_empty() {
                            return Err(ReactorError::BufferOverflow { fd, capacity: max });
                        }
                        let n = tls.conn.reader().read(spare).map_err(ReactorError::Io)?;
                        s.rd_buf.commit(n);
                        remaining = remaining.saturating_sub(n);
                    }
                    if state.peer_has_closed() {
                        return Err(ReactorError::PeerClosed(fd));
                    }
                    // Handshake follow-ups (key updates, session tickets)
                    tls.flush_tls(fd)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn readable_raw(
        &mut self,
        rc: &Rc<RefCell<FdSession>>,
        handle: SessionHandle,
        cb: &crate::handler::RawInputCb,
    ) -> Result<(), ReactorError> {
        let fd = rc.borrow().fd;
        let mut chunk = vec![0u8; RAW_CHUNK];
        loop {
            match sys_read(fd, &mut chunk)? {
                None => break,
                Some(0) => return Err(ReactorError::PeerClosed(fd)),
                Some(n) => {
                    let verdict = (cb.borrow_mut())(self, handle, &chunk[..n], Ts::now());
                    if verdict == IoVerdict::Abandon {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    fn readable_datagram(
        &mut self,
        rc: &Rc<RefCell<FdSession>>,
        handle: SessionHandle,
        cb: &crate::handler::RecvCb,
    ) -> Result<(), ReactorError> {
        let (fd, burst, max_size) = {
            let s = rc.borrow();
            (s.fd, s.datagram_burst, s.max_datagram_size)
        };
        let mut grams: Vec<(Vec<u8>, Ts)> = Vec::new();
        let mut exhausted = false;
        loop {
            let mut gram = vec![0u8; max_size];
            match sys_recv(fd, &mut gram)? {
                None => break,
                Some(n) => {
                    gram.truncate(n);
                    grams.push((gram, Ts::now()));
                    // a full pool is only an overflow once a datagram
                    // actually lands beyond it; EAGAIN at capacity is a
                    // clean batch end
                    if grams.len() > burst {
                        exhausted = true;
                        break;
                    }
                }
            }
        }
        if !grams.is_empty() {
            for (gram, ts) in &grams {
                let verdict = (cb.borrow_mut())(self, handle, RecvEvent::Datagram(gram), *ts);
                if verdict == IoVerdict::Abandon {
                    return Ok(());
                }
            }
            let verdict = (cb.borrow_mut())(self, handle, RecvEvent::EndOfBatch, Ts::now());
            if verdict == IoVerdict::Abandon {
                return Ok(());
            }
        }
        if exhausted {
            return Err(ReactorError::DatagramBurstExceeded {
                fd,
                capacity: burst,
            });
        }
        Ok(())
    }

    fn readable_timer(
        &mut self,
        rc: &Rc<RefCell<FdSession>>,
        handle: SessionHandle,
        cb: &TimerCb,
    ) -> Result<(), ReactorError> {
        let fd = rc.borrow().fd;
        let mut ticks = 0u64;
        loop {
            let mut raw = [0u8; 8];
            match sys_read(fd, &mut raw)? {
                None => break,
                Some(8) => ticks += u64::from_ne_bytes(raw),
                Some(_) => break,
            }
        }
        if ticks > 0 {
            let _ = (cb.borrow_mut())(self, handle, ticks);
        }
        Ok(())
    }

    fn readable_signal(
        &mut self,
        rc: &Rc<RefCell<FdSession>>,
        handle: SessionHandle,
        cb: &SignalCb,
    ) -> Result<(), ReactorError> {
        let fd = rc.borrow().fd;
        let size = std::mem::size_of::<libc::signalfd_siginfo>();
        loop {
            // SAFETY: signalfd_siginfo is plain-old-data; the kernel fills
            // exactly `size` bytes on a successful read.
            let mut si: libc::signalfd_siginfo = unsafe { std::mem::zeroed() };
            let n = {
                let buf = unsafe {
                    std::slice::from_raw_parts_mut(std::ptr::addr_of_mut!(si).cast::<u8>(), size)
                };
                sys_read(fd, buf)?
            };
            match n {
                None => break,
                Some(m) if m == size => {
                    #[allow(clippy::cast_possible_wrap)]
                    let verdict = (cb.borrow_mut())(self, handle, si.ssi_signo as i32);
                    if verdict == IoVerdict::Abandon {
                        return Ok(());
                    }
                }
                Some(_) => break,
            }
        }
        Ok(())
    }

    fn readable_accept(
        &mut self,
        rc: &Rc<RefCell<FdSession>>,
        handle: SessionHandle,
        cb: &crate::handler::AcceptCb,
    ) -> Result<(), ReactorError> {
        let fd = rc.borrow().fd;
        loop {
            // SAFETY: plain accept4(2); peer address is not captured here.
            let newfd = unsafe {
                libc::accept4(
                    fd,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if newfd < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock => break,
                    io::ErrorKind::Interrupted => continue,
                    _ => return Err(err.into()),
                }
            }
            let verdict = (cb.borrow_mut())(self, handle, newfd);
            if verdict == IoVerdict::Abandon {
                return Ok(());
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // TLS handshake
    // ------------------------------------------------------------------

    fn drive_handshake(
        &mut self,
        rc: &Rc<RefCell<FdSession>>,
        handle: SessionHandle,
    ) -> Result<(), ReactorError> {
        let fd = rc.borrow().fd;
        let done = {
            let mut s = rc.borrow_mut();
            let TlsState::UserSpace(tls) = &mut s.tls else {
                return Ok(());
            };
            tls.flush_tls(fd)?;
            let mut io = FdIo(fd);
            while tls.conn.is_handshaking() {
                match tls.conn.read_tls(&mut io) {
                    Ok(0) => return Err(ReactorError::PeerClosed(fd)),
                    Ok(_) => {
                        tls.conn
                            .process_new_packets()
                            .map_err(ReactorError::Tls)?;
                        tls.flush_tls(fd)?;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e.into()),
                }
            }
            !tls.conn.is_handshaking()
        };
        if !done {
            return Ok(());
        }
        let offload = {
            let mut s = rc.borrow_mut();
            s.handshaking = false;
            s.handshaken = true;
            matches!(&s.tls, TlsState::UserSpace(t) if t.offload_when_ready)
        };
        if offload {
            let tls = {
                let mut s = rc.borrow_mut();
                match std::mem::replace(&mut s.tls, TlsState::KernelOffloaded) {
                    TlsState::UserSpace(t) => t,
                    other => {
                        s.tls = other;
                        return Ok(());
                    }
                }
            };
            ktls::offload(fd, tls.conn)?;
        }
        info!(%handle, "TLS handshake complete");
        self.finish_connect(rc, handle);
        Ok(())
    }

    fn finish_connect(&mut self, rc: &Rc<RefCell<FdSession>>, handle: SessionHandle) {
        let on_connect: Option<ConnectCb> = {
            let mut s = rc.borrow_mut();
            if let Handler::Connect { on_connect, then } = s.handler.clone() {
                s.handler = *then;
                Some(on_connect)
            } else {
                None
            }
        };
        if let Some(cb) = on_connect {
            let _ = (cb.borrow_mut())(self, handle);
        }
    }
}

/// Non-blocking read with EINTR retry. `None` means the FD would block.
fn sys_read(fd: RawFd, buf: &mut [u8]) -> Result<Option<usize>, ReactorError> {
    loop {
        // SAFETY: buf is valid for writes of buf.len() bytes.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n >= 0 {
            #[allow(clippy::cast_sign_loss)]
            return Ok(Some(n as usize));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => return Ok(None),
            io::ErrorKind::Interrupted => {}
            _ => return Err(err.into()),
        }
    }
}

/// Non-blocking recv for datagram sockets; same contract as [`sys_read`].
fn sys_recv(fd: RawFd, buf: &mut [u8]) -> Result<Option<usize>, ReactorError> {
    loop {
        // SAFETY: buf is valid for writes of buf.len() bytes.
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
        if n >= 0 {
            #[allow(clippy::cast_sign_loss)]
            return Ok(Some(n as usize));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => return Ok(None),
            io::ErrorKind::Interrupted => {}
            _ => return Err(err.into()),
        }
    }
}

/// Non-blocking write with EINTR retry. `None` means the FD would block.
fn sys_write(fd: RawFd, buf: &[u8]) -> Result<Option<usize>, ReactorError> {
    loop {
        // SAFETY: buf is valid for reads of buf.len() bytes.
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n >= 0 {
            #[allow(clippy::cast_sign_loss)]
            return Ok(Some(n as usize));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => return Ok(None),
            io::ErrorKind::Interrupted => {}
            _ => return Err(err.into()),
        }
    }
}
