//! Event loop integration
//!
//! The driver does its own I/O multiplexing internally; to fold that into a
//! caller-owned event loop, the driver's poll descriptor set is mirrored into
//! an [`EventPoller`] and the driver's internal deadline is folded into the
//! poll timeout. [`FdPoller`] is a ready-made poller over `poll(2)`; anything
//! implementing the trait (epoll wrappers, test doubles) works the same way.

use crate::context::{Context, FdChange};
use crate::error::{Error, Result};
use libc::c_short;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::collections::HashSet;
use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::time::Duration;
use tracing::debug;

/// A poller the event loop keeps in sync with the driver's descriptor set.
pub trait EventPoller {
    /// Start watching `fd` for `events` (poll(2) event bits). Registering an
    /// already-registered descriptor replaces its interest mask.
    fn register(&mut self, fd: RawFd, events: c_short);

    /// Stop watching `fd`.
    fn unregister(&mut self, fd: RawFd);

    /// Wait for readiness, returning (descriptor, revents) pairs. `None`
    /// means no timeout.
    fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<(RawFd, c_short)>>;
}

/// [`EventPoller`] implementation over `poll(2)`.
#[derive(Debug, Default)]
pub struct FdPoller {
    fds: Vec<(RawFd, c_short)>,
}

impl FdPoller {
    pub fn new() -> FdPoller {
        FdPoller::default()
    }
}

impl EventPoller for FdPoller {
    fn register(&mut self, fd: RawFd, events: c_short) {
        if let Some(entry) = self.fds.iter_mut().find(|(existing, _)| *existing == fd) {
            entry.1 = events;
        } else {
            self.fds.push((fd, events));
        }
    }

    fn unregister(&mut self, fd: RawFd) {
        self.fds.retain(|(existing, _)| *existing != fd);
    }

    fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<(RawFd, c_short)>> {
        let timeout = match timeout {
            None => PollTimeout::NONE,
            Some(duration) => {
                let millis = duration.as_millis().min(i32::MAX as u128) as i32;
                PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX)
            }
        };
        let mut poll_fds: Vec<PollFd> = self
            .fds
            .iter()
            .map(|&(fd, events)| {
                // SAFETY: registered descriptors are owned by the caller (or
                // the driver) and outlive this call.
                PollFd::new(
                    unsafe { BorrowedFd::borrow_raw(fd) },
                    PollFlags::from_bits_truncate(events),
                )
            })
            .collect();

        match poll(&mut poll_fds, timeout) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => return Err(Error::Interrupted),
            Err(e) => {
                debug!("poll failed: {}", e);
                return Err(Error::Io);
            }
        }

        Ok(self
            .fds
            .iter()
            .zip(&poll_fds)
            .filter_map(|(&(fd, _), poll_fd)| {
                let revents = poll_fd.revents().unwrap_or(PollFlags::empty());
                if revents.is_empty() {
                    None
                } else {
                    Some((fd, revents.bits()))
                }
            })
            .collect())
    }
}

/// Keeps an external poller synchronized with the driver's poll descriptor
/// set and drives event handling around it.
///
/// One event loop per context: the fd change notifications are consumed
/// destructively, so a second adapter on the same context would see an
/// incomplete set.
pub struct EventLoop<P: EventPoller> {
    context: Context,
    poller: P,
    usb_fds: HashSet<RawFd>,
}

impl<P: EventPoller> EventLoop<P> {
    /// Wrap `poller` around `context`, registering the driver's current
    /// descriptor set.
    pub fn new(context: Context, poller: P) -> Result<EventLoop<P>> {
        let mut event_loop = EventLoop {
            context,
            poller,
            usb_fds: HashSet::new(),
        };
        for (fd, events) in event_loop.context.pollfds()? {
            event_loop.poller.register(fd, events);
            event_loop.usb_fds.insert(fd);
        }
        event_loop.sync();
        Ok(event_loop)
    }

    /// Apply queued descriptor-set change notifications to the poller.
    fn sync(&mut self) {
        for change in self.context.take_fd_changes() {
            match change {
                FdChange::Added(fd, events) => {
                    debug!("driver added poll descriptor {}", fd);
                    self.poller.register(fd, events);
                    self.usb_fds.insert(fd);
                }
                FdChange::Removed(fd) => {
                    debug!("driver removed poll descriptor {}", fd);
                    self.poller.unregister(fd);
                    self.usb_fds.remove(&fd);
                }
            }
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Watch a caller-owned descriptor alongside the driver's set.
    pub fn register(&mut self, fd: RawFd, events: c_short) -> Result<()> {
        if self.usb_fds.contains(&fd) {
            return Err(Error::InvalidArgument(format!(
                "descriptor {} belongs to the driver and cannot be registered",
                fd
            )));
        }
        self.poller.register(fd, events);
        Ok(())
    }

    /// Stop watching a caller-owned descriptor.
    pub fn unregister(&mut self, fd: RawFd) -> Result<()> {
        if self.usb_fds.contains(&fd) {
            return Err(Error::InvalidArgument(format!(
                "descriptor {} belongs to the driver and must stay registered",
                fd
            )));
        }
        self.poller.unregister(fd);
        Ok(())
    }

    /// Deadline of the next event the driver must handle itself.
    pub fn next_timeout(&self) -> Result<Option<Duration>> {
        self.context.next_timeout()
    }

    /// Poll for readiness and dispatch driver events.
    ///
    /// The wait uses the shorter of `timeout` and the driver's own deadline
    /// (whichever of the two exists). After the wait, the driver always gets
    /// a zero-timeout drain: its internal timeouts must fire even when no
    /// descriptor became ready, and readiness on its own descriptors is only
    /// consumed by the event-handling call itself. Only readiness on
    /// caller-registered descriptors is returned.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<(RawFd, c_short)>> {
        self.sync();
        let driver_timeout = self.context.next_timeout()?;
        let events = self.poller.poll(effective_timeout(timeout, driver_timeout))?;
        let external: Vec<(RawFd, c_short)> = events
            .into_iter()
            .filter(|(fd, _)| !self.usb_fds.contains(fd))
            .collect();
        self.context.handle_events_timeout(Duration::ZERO)?;
        self.sync();
        Ok(external)
    }

    /// Repeatedly run the driver's blocking event call until `until` holds,
    /// retrying when the call is interrupted by a signal.
    pub fn drive_blocking(&self, until: impl FnMut() -> bool) -> Result<()> {
        self.context.drive_events_until(until)
    }
}

/// Shorter of the caller's timeout and the driver's internal deadline, when
/// both exist; the one that exists otherwise; no timeout when neither does.
fn effective_timeout(external: Option<Duration>, driver: Option<Duration>) -> Option<Duration> {
    match (external, driver) {
        (Some(external), Some(driver)) => Some(external.min(driver)),
        (None, Some(driver)) => Some(driver),
        (external, None) => external,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_timeout() {
        let short = Duration::from_millis(10);
        let long = Duration::from_millis(500);
        assert_eq!(effective_timeout(Some(long), Some(short)), Some(short));
        assert_eq!(effective_timeout(Some(short), Some(long)), Some(short));
        assert_eq!(effective_timeout(None, Some(short)), Some(short));
        assert_eq!(effective_timeout(Some(long), None), Some(long));
        assert_eq!(effective_timeout(None, None), None);
    }

    #[test]
    fn test_fd_poller_bookkeeping() {
        let mut poller = FdPoller::new();
        poller.register(3, libc::POLLIN);
        poller.register(4, libc::POLLIN);
        poller.register(3, libc::POLLOUT);
        assert_eq!(poller.fds, vec![(3, libc::POLLOUT), (4, libc::POLLIN)]);
        poller.unregister(3);
        assert_eq!(poller.fds, vec![(4, libc::POLLIN)]);
        poller.unregister(17);
        assert_eq!(poller.fds, vec![(4, libc::POLLIN)]);
    }

    #[test]
    fn test_fd_poller_empty_set_times_out() {
        let mut poller = FdPoller::new();
        let events = poller.poll(Some(Duration::from_millis(1))).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_fd_poller_reports_readable_pipe() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let [read_fd, write_fd] = fds;

        let mut poller = FdPoller::new();
        poller.register(read_fd, libc::POLLIN);

        // Nothing written yet: a zero-ish timeout elapses quietly.
        let events = poller.poll(Some(Duration::from_millis(1))).unwrap();
        assert!(events.is_empty());

        assert_eq!(unsafe { libc::write(write_fd, b"x".as_ptr().cast(), 1) }, 1);
        let events = poller.poll(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, read_fd);
        assert!(events[0].1 & libc::POLLIN != 0);

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}
