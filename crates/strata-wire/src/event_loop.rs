//! Single-threaded event loop
//!
//! Multiplexes readiness on registered file descriptors (level-triggered,
//! via `poll(2)`) and runs one-shot idle callbacks after each batch of
//! ready sources. Callbacks get the shared state and the loop itself, so
//! they can add, update or remove sources while running.
//!
//! A [`ShutdownToken`] wakes a blocked `wait` from another thread.

use std::collections::{BTreeMap, VecDeque};
use std::io::{Read, Write};
use std::os::fd::{AsFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use tracing::{debug, trace};

use crate::error::LoopError;
use crate::Readiness;

/// Callback for a ready file descriptor
pub type SourceCallback<S> = Box<dyn FnMut(&mut S, &mut EventLoop<S>, Readiness)>;

/// One-shot deferred callback
pub type IdleCallback<S> = Box<dyn FnOnce(&mut S, &mut EventLoop<S>)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

struct Source<S> {
    fd: RawFd,
    mask: Readiness,
    /// `None` while the callback is running
    callback: Option<SourceCallback<S>>,
}

/// Cancellation flag shared with the thread that asks the loop to stop.
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug)]
struct TokenInner {
    cancelled: AtomicBool,
    waker: UnixStream,
}

impl ShutdownToken {
    /// Request shutdown and wake the loop if it is blocked.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            // A full wake socket already guarantees a wake-up.
            let _ = (&self.inner.waker).write(&[1]);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }
}

pub struct EventLoop<S> {
    sources: BTreeMap<SourceId, Source<S>>,
    idles: VecDeque<IdleCallback<S>>,
    next_id: u64,
    wake: UnixStream,
    token: ShutdownToken,
}

impl<S> EventLoop<S> {
    pub fn new() -> Result<Self, LoopError> {
        let (rx, tx) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        )
        .map_err(LoopError::Wake)?;

        Ok(Self {
            sources: BTreeMap::new(),
            idles: VecDeque::new(),
            next_id: 0,
            wake: UnixStream::from(rx),
            token: ShutdownToken {
                inner: Arc::new(TokenInner {
                    cancelled: AtomicBool::new(false),
                    waker: UnixStream::from(tx),
                }),
            },
        })
    }

    /// Token that stops [`wait`](Self::wait) loops driven by this event loop.
    pub fn shutdown_token(&self) -> ShutdownToken {
        self.token.clone()
    }

    /// Watch `fd` for `mask`.
    ///
    /// The descriptor must stay open until the source is removed.
    pub fn add_source<F>(&mut self, fd: RawFd, mask: Readiness, callback: F) -> SourceId
    where
        F: FnMut(&mut S, &mut EventLoop<S>, Readiness) + 'static,
    {
        let id = SourceId(self.next_id);
        self.next_id += 1;
        self.sources.insert(
            id,
            Source {
                fd,
                mask,
                callback: Some(Box::new(callback)),
            },
        );
        trace!("added source {:?} for fd {} ({:?})", id, fd, mask);
        id
    }

    /// Change the readiness a source waits for. Returns false for unknown sources.
    pub fn update_source(&mut self, id: SourceId, mask: Readiness) -> bool {
        match self.sources.get_mut(&id) {
            Some(source) => {
                source.mask = mask;
                true
            }
            None => false,
        }
    }

    /// Stop watching a source. Its callback will not run again, even if it
    /// was already reported ready in the current batch.
    pub fn remove_source(&mut self, id: SourceId) -> bool {
        let removed = self.sources.remove(&id).is_some();
        if removed {
            trace!("removed source {:?}", id);
        }
        removed
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Queue a callback to run after the current (or next) batch of sources.
    pub fn add_idle<F>(&mut self, callback: F)
    where
        F: FnOnce(&mut S, &mut EventLoop<S>) + 'static,
    {
        self.idles.push_back(Box::new(callback));
    }

    pub fn has_pending_idle(&self) -> bool {
        !self.idles.is_empty()
    }

    /// Block until a source is ready, an idle is pending, the timeout
    /// expires or the shutdown token fires; then run ready callbacks
    /// followed by pending idles.
    ///
    /// Returns the number of callbacks invoked. `None` waits indefinitely.
    pub fn wait(&mut self, state: &mut S, timeout: Option<Duration>) -> Result<usize, LoopError> {
        let ready = self.poll_ready(timeout)?;

        let mut dispatched = 0;
        for (id, readiness) in ready {
            // Removed by an earlier callback in this batch
            let Some(mut callback) = self.sources.get_mut(&id).and_then(|s| s.callback.take()) else {
                continue;
            };
            callback(state, self, readiness);
            if let Some(source) = self.sources.get_mut(&id) {
                source.callback = Some(callback);
            }
            dispatched += 1;
        }

        // Idles queued while the idles themselves run wait for the next batch.
        let idles = std::mem::take(&mut self.idles);
        for idle in idles {
            idle(state, self);
            dispatched += 1;
        }

        Ok(dispatched)
    }

    /// Loop on [`wait`](Self::wait) until the shutdown token is cancelled.
    pub fn run(&mut self, state: &mut S) -> Result<(), LoopError> {
        while !self.token.is_cancelled() {
            self.wait(state, None)?;
        }
        debug!("event loop stopped");
        Ok(())
    }

    fn poll_ready(&mut self, timeout: Option<Duration>) -> Result<Vec<(SourceId, Readiness)>, LoopError> {
        let timeout = if !self.idles.is_empty() || self.token.is_cancelled() {
            PollTimeout::ZERO
        } else {
            match timeout {
                None => PollTimeout::NONE,
                Some(duration) => {
                    let millis = duration.as_millis().min(i32::MAX as u128) as i32;
                    PollTimeout::try_from(millis).unwrap_or(PollTimeout::NONE)
                }
            }
        };

        let ids: Vec<SourceId> = self.sources.keys().copied().collect();
        let mut fds = Vec::with_capacity(ids.len() + 1);
        fds.push(PollFd::new(self.wake.as_fd(), PollFlags::POLLIN));
        for source in self.sources.values() {
            // SAFETY: callers keep registered descriptors open until the
            // source is removed, and the borrow ends before this returns.
            let fd = unsafe { BorrowedFd::borrow_raw(source.fd) };
            fds.push(PollFd::new(fd, poll_flags(source.mask)));
        }

        match poll(&mut fds, timeout) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(Vec::new()),
            Err(e) => return Err(LoopError::Poll(e)),
        }

        let woken = fds[0]
            .revents()
            .is_some_and(|revents| revents.contains(PollFlags::POLLIN));

        let ready = ids
            .into_iter()
            .zip(fds.iter().skip(1))
            .filter_map(|(id, fd)| {
                let readiness = readiness(fd.revents()?);
                (!readiness.is_empty()).then_some((id, readiness))
            })
            .collect();

        drop(fds);
        if woken {
            self.drain_wake();
        }
        Ok(ready)
    }

    fn drain_wake(&mut self) {
        let mut buf = [0u8; 64];
        while let Ok(n) = (&self.wake).read(&mut buf) {
            if n == 0 {
                break;
            }
        }
    }
}

fn poll_flags(mask: Readiness) -> PollFlags {
    let mut flags = PollFlags::empty();
    if mask.contains(Readiness::READABLE) {
        flags |= PollFlags::POLLIN;
    }
    if mask.contains(Readiness::WRITABLE) {
        flags |= PollFlags::POLLOUT;
    }
    flags
}

/// Hang-ups and errors are reported as readable so the owner's next read
/// observes end of stream or the error.
fn readiness(revents: PollFlags) -> Readiness {
    let mut readiness = Readiness::empty();
    if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
        readiness |= Readiness::READABLE;
    }
    if revents.contains(PollFlags::POLLOUT) {
        readiness |= Readiness::WRITABLE;
    }
    readiness
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[derive(Default)]
    struct Log {
        entries: Vec<String>,
    }

    #[test]
    fn test_ready_source_then_idles() {
        let mut event_loop: EventLoop<Log> = EventLoop::new().unwrap();
        let mut log = Log::default();
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.write_all(b"x").unwrap();

        event_loop.add_source(a.as_raw_fd(), Readiness::READABLE, move |log: &mut Log, event_loop, mask| {
            let mut buf = [0u8; 8];
            let _ = (&a).read(&mut buf);
            assert_eq!(mask, Readiness::READABLE);
            log.entries.push("source".into());
            event_loop.add_idle(|log: &mut Log, _| log.entries.push("repaint".into()));
        });

        let dispatched = event_loop.wait(&mut log, Some(Duration::from_secs(1))).unwrap();
        assert_eq!(dispatched, 2);
        assert_eq!(log.entries, vec!["source".to_string(), "repaint".to_string()]);
    }

    #[test]
    fn test_pending_idle_does_not_block() {
        let mut event_loop: EventLoop<Log> = EventLoop::new().unwrap();
        let mut log = Log::default();
        event_loop.add_idle(|log: &mut Log, event_loop| {
            log.entries.push("first".into());
            // Runs on the next wait, never nested in this one
            event_loop.add_idle(|log: &mut Log, _| log.entries.push("second".into()));
        });

        assert_eq!(event_loop.wait(&mut log, None).unwrap(), 1);
        assert_eq!(log.entries, vec!["first".to_string()]);
        assert!(event_loop.has_pending_idle());
        assert_eq!(event_loop.wait(&mut log, None).unwrap(), 1);
        assert_eq!(log.entries.len(), 2);
    }

    #[test]
    fn test_removed_source_is_not_called() {
        let mut event_loop: EventLoop<Log> = EventLoop::new().unwrap();
        let mut log = Log::default();

        let (a, mut a_peer) = UnixStream::pair().unwrap();
        let (b, mut b_peer) = UnixStream::pair().unwrap();
        a_peer.write_all(b"1").unwrap();
        b_peer.write_all(b"2").unwrap();

        // The first source removes the second before the second runs.
        let second = std::rc::Rc::new(std::cell::Cell::new(None));
        let handle = second.clone();
        event_loop.add_source(a.as_raw_fd(), Readiness::READABLE, move |log: &mut Log, event_loop, _| {
            log.entries.push("first".into());
            if let Some(id) = handle.get() {
                event_loop.remove_source(id);
            }
        });
        let id = event_loop.add_source(b.as_raw_fd(), Readiness::READABLE, |log: &mut Log, _, _| {
            log.entries.push("second".into());
        });
        second.set(Some(id));

        event_loop.wait(&mut log, Some(Duration::from_secs(1))).unwrap();
        assert_eq!(log.entries, vec!["first".to_string()]);
        assert_eq!(event_loop.source_count(), 1);
        drop((a, b));
    }

    #[test]
    fn test_timeout_with_nothing_ready() {
        let mut event_loop: EventLoop<Log> = EventLoop::new().unwrap();
        let mut log = Log::default();
        let (a, _peer) = UnixStream::pair().unwrap();
        let id = event_loop.add_source(a.as_raw_fd(), Readiness::READABLE, |_: &mut Log, _, _| {});
        assert!(event_loop.update_source(id, Readiness::READABLE));
        assert_eq!(event_loop.wait(&mut log, Some(Duration::from_millis(10))).unwrap(), 0);
    }

    #[test]
    fn test_shutdown_token_stops_run() {
        let mut event_loop: EventLoop<Log> = EventLoop::new().unwrap();
        let mut log = Log::default();
        let token = event_loop.shutdown_token();

        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            token.cancel();
        });
        event_loop.run(&mut log).unwrap();
        canceller.join().unwrap();
        assert!(event_loop.shutdown_token().is_cancelled());
    }
}
