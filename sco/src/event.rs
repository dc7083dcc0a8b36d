//! Readiness dispatch for SCO sockets.
//!
//! The audio thread owns a [`PollLoop`]; anything with a descriptor to watch
//! implements [`EventSource`] and is registered with the loop under that fd.
//! The loop hands each source the events that fired and drops the
//! registration when the source answers [`Dispatch::Remove`].

use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bitflags::bitflags;
use tracing::{debug, warn};

bitflags! {
    /// `poll(2)` event bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PollEvents: i16 {
        const IN = libc::POLLIN;
        const OUT = libc::POLLOUT;
        const ERR = libc::POLLERR;
        const HUP = libc::POLLHUP;
    }
}

impl PollEvents {
    // ---
    /// What a SCO socket is watched for. Write readiness is assumed for a
    /// connected socket and never polled.
    pub fn sco_interest() -> Self {
        PollEvents::IN | PollEvents::ERR | PollEvents::HUP
    }
}

/// What the loop should do with a source after dispatching it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Keep the registration.
    Continue,
    /// Unregister; the source will not be called again.
    Remove,
}

/// Something that reacts to readiness on a descriptor.
pub trait EventSource {
    // ---
    fn on_ready(&mut self, events: PollEvents) -> Dispatch;
}

/// Shared handle the loop keeps per descriptor.
pub type SharedSource = Arc<Mutex<dyn EventSource + Send>>;

struct Registration {
    fd: RawFd,
    interest: PollEvents,
    source: SharedSource,
}

/// `poll(2)` loop over registered sources.
#[derive(Default)]
pub struct PollLoop {
    // ---
    registrations: Vec<Registration>,
}

impl PollLoop {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `source` for `interest` on `fd`, replacing any previous
    /// registration of the same fd.
    pub fn add(&mut self, fd: RawFd, interest: PollEvents, source: SharedSource) {
        // ---
        self.remove(fd);
        debug!(fd, ?interest, "registering event source");
        self.registrations.push(Registration {
            fd,
            interest,
            source,
        });
    }

    /// Drops the registration for `fd`. Returns whether there was one.
    pub fn remove(&mut self, fd: RawFd) -> bool {
        // ---
        let before = self.registrations.len();
        self.registrations.retain(|r| r.fd != fd);
        before != self.registrations.len()
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.registrations.iter().any(|r| r.fd == fd)
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Delivers `events` to the source registered on `fd` without polling.
    ///
    /// Returns `None` when nothing is registered there.
    pub fn dispatch(&mut self, fd: RawFd, events: PollEvents) -> Option<Dispatch> {
        // ---
        let idx = self.registrations.iter().position(|r| r.fd == fd)?;
        let verdict = Self::call(&self.registrations[idx].source, events);
        if verdict == Dispatch::Remove {
            self.registrations.remove(idx);
        }
        Some(verdict)
    }

    /// Waits once for readiness and dispatches every source that fired.
    ///
    /// `None` waits indefinitely. Returns the number of sources dispatched;
    /// an interrupted wait counts as zero.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        // ---
        if self.registrations.is_empty() {
            return Ok(0);
        }

        let mut fds: Vec<libc::pollfd> = self
            .registrations
            .iter()
            .map(|r| libc::pollfd {
                fd: r.fd,
                events: r.interest.bits(),
                revents: 0,
            })
            .collect();

        let timeout_ms = match timeout {
            Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
            None => -1,
        };

        // SAFETY: fds is a live, correctly sized array of pollfd.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        let mut dispatched = 0;
        let mut finished = Vec::new();
        for (reg, pfd) in self.registrations.iter().zip(fds.iter()) {
            let events = PollEvents::from_bits_truncate(pfd.revents);
            if events.is_empty() {
                continue;
            }
            dispatched += 1;
            if Self::call(&reg.source, events) == Dispatch::Remove {
                finished.push(reg.fd);
            }
        }
        for fd in finished {
            self.remove(fd);
        }

        Ok(dispatched)
    }

    /// Polls until every source has unregistered itself.
    pub fn run(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        // ---
        while !self.is_empty() {
            self.poll_once(timeout)?;
        }
        Ok(())
    }

    fn call(source: &SharedSource, events: PollEvents) -> Dispatch {
        // ---
        let mut guard = match source.lock() {
            Ok(g) => g,
            Err(poisoned) => {
                warn!("event source lock poisoned, continuing");
                poisoned.into_inner()
            }
        };
        guard.on_ready(events)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[derive(Default)]
    struct Recorder {
        seen: Vec<PollEvents>,
        stop_after: usize,
    }

    impl EventSource for Recorder {
        fn on_ready(&mut self, events: PollEvents) -> Dispatch {
            // ---
            self.seen.push(events);
            if self.seen.len() >= self.stop_after {
                Dispatch::Remove
            } else {
                Dispatch::Continue
            }
        }
    }

    #[test]
    fn dispatch_removes_finished_sources() {
        // ---
        let rec = Arc::new(Mutex::new(Recorder {
            stop_after: 2,
            ..Default::default()
        }));
        let mut ev = PollLoop::new();
        ev.add(7, PollEvents::sco_interest(), rec.clone());

        assert_eq!(ev.dispatch(7, PollEvents::IN), Some(Dispatch::Continue));
        assert_eq!(ev.dispatch(7, PollEvents::HUP), Some(Dispatch::Remove));
        assert!(!ev.contains(7));
        assert_eq!(ev.dispatch(7, PollEvents::IN), None);
        assert_eq!(rec.lock().unwrap().seen, vec![PollEvents::IN, PollEvents::HUP]);
    }

    #[test]
    fn poll_reports_readable_socket() {
        // ---
        let (a, b) = UnixStream::pair().unwrap();
        let rec = Arc::new(Mutex::new(Recorder {
            stop_after: 1,
            ..Default::default()
        }));
        let mut ev = PollLoop::new();
        ev.add(b.as_raw_fd(), PollEvents::IN, rec.clone());

        assert_eq!(ev.poll_once(Some(Duration::from_millis(0))).unwrap(), 0);

        std::io::Write::write_all(&mut &a, b"x").unwrap();
        ev.run(Some(Duration::from_millis(100))).unwrap();
        assert!(ev.is_empty());
        assert!(rec.lock().unwrap().seen[0].contains(PollEvents::IN));
    }
}
