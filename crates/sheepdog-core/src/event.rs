//! Readiness hooks between connections and the epoll-based event loop.
//!
//! A [`Connection`] owns its descriptor and remembers the interest set last
//! published to its [`Multiplexer`]. The `rx_*`/`tx_*` toggles only update
//! the in-memory set after the multiplexer accepted the change, so the two
//! never drift apart. Registrations are edge-triggered.

use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

use bitflags::bitflags;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use sheepdog_proto::defaults::DEFAULT_EVENT_BATCH;
use tracing::{debug, error};

bitflags! {
    /// Readiness edges a connection subscribes to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Interest: u8 {
        const READABLE = 0x01;
        const WRITABLE = 0x02;
    }
}

impl Interest {
    fn to_epoll(self) -> EpollFlags {
        let mut flags = EpollFlags::EPOLLET | EpollFlags::EPOLLRDHUP;
        if self.contains(Interest::READABLE) {
            flags |= EpollFlags::EPOLLIN;
        }
        if self.contains(Interest::WRITABLE) {
            flags |= EpollFlags::EPOLLOUT;
        }
        flags
    }
}

/// An external readiness multiplexer.
///
/// `token` is the opaque back-reference handed back with every event.
pub trait Multiplexer {
    fn register(&self, fd: BorrowedFd<'_>, interest: Interest, token: u64) -> nix::Result<()>;
    fn modify(&self, fd: BorrowedFd<'_>, interest: Interest, token: u64) -> nix::Result<()>;
    fn unregister(&self, fd: BorrowedFd<'_>) -> nix::Result<()>;
}

/// One readiness report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub token: u64,
    pub readable: bool,
    pub writable: bool,
    /// Peer hung up or the descriptor is in error.
    pub closed: bool,
}

impl From<&EpollEvent> for Event {
    fn from(ev: &EpollEvent) -> Self {
        let flags = ev.events();
        Self {
            token: ev.data(),
            readable: flags.contains(EpollFlags::EPOLLIN),
            writable: flags.contains(EpollFlags::EPOLLOUT),
            closed: flags.intersects(
                EpollFlags::EPOLLHUP | EpollFlags::EPOLLRDHUP | EpollFlags::EPOLLERR,
            ),
        }
    }
}

/// Edge-triggered epoll instance.
pub struct EventLoop {
    epoll: Epoll,
    events: Vec<EpollEvent>,
}

impl EventLoop {
    pub fn new() -> nix::Result<Self> {
        Self::with_capacity(DEFAULT_EVENT_BATCH)
    }

    /// `batch` bounds the events returned by one [`wait`](Self::wait).
    pub fn with_capacity(batch: usize) -> nix::Result<Self> {
        Ok(Self {
            epoll: Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?,
            events: vec![EpollEvent::empty(); batch.max(1)],
        })
    }

    /// Block until at least one registered descriptor is ready or the
    /// timeout expires. `None` waits indefinitely.
    pub fn wait(&mut self, timeout: Option<Duration>) -> nix::Result<Vec<Event>> {
        let timeout = match timeout {
            None => EpollTimeout::NONE,
            Some(d) => EpollTimeout::from(d.as_millis().min(u16::MAX as u128) as u16),
        };
        let n = loop {
            match self.epoll.wait(&mut self.events, timeout) {
                Err(nix::errno::Errno::EINTR) => continue,
                res => break res?,
            }
        };
        Ok(self.events[..n].iter().map(Event::from).collect())
    }
}

impl Multiplexer for EventLoop {
    fn register(&self, fd: BorrowedFd<'_>, interest: Interest, token: u64) -> nix::Result<()> {
        self.epoll.add(fd, EpollEvent::new(interest.to_epoll(), token))
    }

    fn modify(&self, fd: BorrowedFd<'_>, interest: Interest, token: u64) -> nix::Result<()> {
        let mut ev = EpollEvent::new(interest.to_epoll(), token);
        self.epoll.modify(fd, &mut ev)
    }

    fn unregister(&self, fd: BorrowedFd<'_>) -> nix::Result<()> {
        self.epoll.delete(fd)
    }
}

/// A stream endpoint registered with a multiplexer.
#[derive(Debug)]
pub struct Connection<T: AsFd> {
    io: T,
    interest: Interest,
    token: u64,
    registered: bool,
}

impl<T: AsFd> Connection<T> {
    pub fn new(io: T, token: u64) -> Self {
        Self {
            io,
            interest: Interest::empty(),
            token,
            registered: false,
        }
    }

    /// Publish the initial interest set.
    pub fn register<M: Multiplexer + ?Sized>(&mut self, mux: &M, interest: Interest) -> nix::Result<()> {
        if self.registered {
            return self.publish(mux, interest);
        }
        mux.register(self.io.as_fd(), interest, self.token)?;
        self.interest = interest;
        self.registered = true;
        Ok(())
    }

    pub fn rx_on<M: Multiplexer + ?Sized>(&mut self, mux: &M) -> nix::Result<()> {
        self.publish(mux, self.interest | Interest::READABLE)
    }

    pub fn rx_off<M: Multiplexer + ?Sized>(&mut self, mux: &M) -> nix::Result<()> {
        self.publish(mux, self.interest - Interest::READABLE)
    }

    pub fn tx_on<M: Multiplexer + ?Sized>(&mut self, mux: &M) -> nix::Result<()> {
        self.publish(mux, self.interest | Interest::WRITABLE)
    }

    pub fn tx_off<M: Multiplexer + ?Sized>(&mut self, mux: &M) -> nix::Result<()> {
        self.publish(mux, self.interest - Interest::WRITABLE)
    }

    fn publish<M: Multiplexer + ?Sized>(&mut self, mux: &M, interest: Interest) -> nix::Result<()> {
        if !self.registered {
            return Err(nix::errno::Errno::ENOENT);
        }
        if interest == self.interest {
            return Ok(());
        }
        if let Err(e) = mux.modify(self.io.as_fd(), interest, self.token) {
            error!("failed to update interest for token {}: {}", self.token, e);
            return Err(e);
        }
        self.interest = interest;
        Ok(())
    }

    /// Remove the descriptor from the multiplexer, then close it.
    pub fn close<M: Multiplexer + ?Sized>(self, mux: &M) -> nix::Result<()> {
        let res = if self.registered {
            mux.unregister(self.io.as_fd())
        } else {
            Ok(())
        };
        if let Err(e) = &res {
            debug!("failed to unregister token {}: {}", self.token, e);
        }
        drop(self.io);
        res
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn get_ref(&self) -> &T {
        &self.io
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.io
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::net::UnixStream;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Register(Interest),
        Modify(Interest),
        Unregister,
    }

    #[derive(Default)]
    struct Recorder {
        calls: RefCell<Vec<Call>>,
        fail_modify: Cell<bool>,
    }

    impl Multiplexer for Recorder {
        fn register(&self, _fd: BorrowedFd<'_>, interest: Interest, _token: u64) -> nix::Result<()> {
            self.calls.borrow_mut().push(Call::Register(interest));
            Ok(())
        }

        fn modify(&self, _fd: BorrowedFd<'_>, interest: Interest, _token: u64) -> nix::Result<()> {
            if self.fail_modify.get() {
                return Err(nix::errno::Errno::EBADF);
            }
            self.calls.borrow_mut().push(Call::Modify(interest));
            Ok(())
        }

        fn unregister(&self, _fd: BorrowedFd<'_>) -> nix::Result<()> {
            self.calls.borrow_mut().push(Call::Unregister);
            Ok(())
        }
    }

    #[test]
    fn test_toggles_are_idempotent() {
        let mux = Recorder::default();
        let (a, _b) = UnixStream::pair().unwrap();
        let mut conn = Connection::new(a, 1);

        conn.register(&mux, Interest::READABLE).unwrap();
        conn.rx_on(&mux).unwrap();
        conn.tx_on(&mux).unwrap();
        conn.tx_on(&mux).unwrap();
        conn.tx_off(&mux).unwrap();
        conn.rx_off(&mux).unwrap();
        conn.rx_off(&mux).unwrap();
        assert_eq!(conn.interest(), Interest::empty());
        conn.close(&mux).unwrap();

        assert_eq!(
            *mux.calls.borrow(),
            vec![
                Call::Register(Interest::READABLE),
                Call::Modify(Interest::READABLE | Interest::WRITABLE),
                Call::Modify(Interest::READABLE),
                Call::Modify(Interest::empty()),
                Call::Unregister,
            ]
        );
    }

    #[test]
    fn test_failed_publish_keeps_interest() {
        let mux = Recorder::default();
        let (a, _b) = UnixStream::pair().unwrap();
        let mut conn = Connection::new(a, 2);
        conn.register(&mux, Interest::READABLE).unwrap();

        mux.fail_modify.set(true);
        assert_eq!(conn.tx_on(&mux), Err(nix::errno::Errno::EBADF));
        assert_eq!(conn.interest(), Interest::READABLE);
    }

    #[test]
    fn test_toggle_before_register() {
        let mux = Recorder::default();
        let (a, _b) = UnixStream::pair().unwrap();
        let mut conn = Connection::new(a, 3);
        assert!(conn.rx_on(&mux).is_err());
        conn.close(&mux).unwrap();
        assert!(mux.calls.borrow().is_empty());
    }

    #[test]
    fn test_epoll_readiness() {
        let mut ev = EventLoop::new().unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        let mut conn = Connection::new(a, 42);
        conn.register(&ev, Interest::READABLE).unwrap();

        assert!(ev.wait(Some(Duration::from_millis(10))).unwrap().is_empty());

        b.write_all(b"ping").unwrap();
        let events = ev.wait(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token, 42);
        assert!(events[0].readable);

        conn.tx_on(&ev).unwrap();
        let events = ev.wait(Some(Duration::from_secs(1))).unwrap();
        assert!(events.iter().any(|e| e.token == 42 && e.writable));

        conn.close(&ev).unwrap();
    }

    #[test]
    fn test_listener_is_readable_on_connect() {
        let mut ev = EventLoop::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        ev.register(listener.as_fd(), Interest::READABLE, 7).unwrap();

        let _client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let events = ev.wait(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].readable);
        assert_eq!(events[0].token, 7);
        ev.unregister(listener.as_fd()).unwrap();
    }

    #[test]
    fn test_hangup_reported() {
        let mut ev = EventLoop::new().unwrap();
        let (a, b) = UnixStream::pair().unwrap();
        let mut conn = Connection::new(a, 5);
        conn.register(&ev, Interest::READABLE).unwrap();
        drop(b);
        let events = ev.wait(Some(Duration::from_secs(1))).unwrap();
        assert!(events[0].closed);
        conn.close(&ev).unwrap();
    }
}
