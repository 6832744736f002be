//! Thin portable wrapper over the OS readiness primitive (`SPEC_FULL.md`
//! §4.3), realized with `mio` the way the teacher realizes its own
//! hardware-facing HIL wrappers: one narrow type hides everything
//! platform-specific behind a handful of methods the rest of the kernel
//! calls without caring whether the backend is epoll, kqueue, or IOCP.
//!
//! Registration is per-fd, per-direction, and the kernel enforces at most
//! one reader and one writer per fd (`ResourceBusy` otherwise) one layer up
//! in `Kernel`; this module only tracks which `Token` maps to which raw fd
//! and which interest set is currently registered for it.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::error::Direction;

const WAKE_TOKEN: Token = Token(usize::MAX);

struct Registration {
    interest: Interest,
}

/// Readiness events returned by one [`ReadinessSelector::wait`] call.
pub struct ReadyEvent {
    pub fd: RawFd,
    pub direction: Direction,
}

pub struct ReadinessSelector {
    poll: Poll,
    events: Events,
    registered: HashMap<RawFd, Registration>,
}

impl ReadinessSelector {
    pub fn new() -> std::io::Result<ReadinessSelector> {
        Ok(ReadinessSelector {
            poll: Poll::new()?,
            events: Events::with_capacity(256),
            registered: HashMap::new(),
        })
    }

    /// A `mio::Waker` that lets a foreign OS thread interrupt a pending
    /// `wait` call — the sole mechanism by which off-thread activity
    /// (worker pools, `UniversalQueue`) reaches this kernel (`SPEC_FULL.md`
    /// §5 "Foreign threads").
    pub fn make_waker(&self) -> std::io::Result<Waker> {
        Waker::new(self.poll.registry(), WAKE_TOKEN)
    }

    fn token_for(fd: RawFd) -> Token {
        Token(fd as usize)
    }

    pub fn register(&mut self, fd: RawFd, direction: Direction) -> std::io::Result<()> {
        let token = Self::token_for(fd);
        let want = match direction {
            Direction::Read => Interest::READABLE,
            Direction::Write => Interest::WRITABLE,
        };
        match self.registered.get_mut(&fd) {
            Some(existing) => {
                let combined = existing.interest.add(want);
                if combined != existing.interest {
                    self.poll
                        .registry()
                        .reregister(&mut SourceFd(&fd), token, combined)?;
                    existing.interest = combined;
                }
            }
            None => {
                self.poll
                    .registry()
                    .register(&mut SourceFd(&fd), token, want)?;
                self.registered.insert(fd, Registration { interest: want });
            }
        }
        Ok(())
    }

    /// Drop interest in one direction; fully deregisters once neither
    /// direction is wanted any more.
    pub fn unregister(&mut self, fd: RawFd, direction: Direction) -> std::io::Result<()> {
        let remove = match direction {
            Direction::Read => Interest::READABLE,
            Direction::Write => Interest::WRITABLE,
        };
        if let Some(existing) = self.registered.get_mut(&fd) {
            let remaining = remaining_interest(existing.interest, remove);
            match remaining {
                Some(interest) => {
                    self.poll.registry().reregister(
                        &mut SourceFd(&fd),
                        Self::token_for(fd),
                        interest,
                    )?;
                    existing.interest = interest;
                }
                None => {
                    self.poll.registry().deregister(&mut SourceFd(&fd))?;
                    self.registered.remove(&fd);
                }
            }
        }
        Ok(())
    }

    /// Block for at most `timeout` (`None` = forever, matching the run
    /// loop's "nearest live TimerHeap entry, else block" bound) and return
    /// every `(fd, direction)` that became ready.
    pub fn wait(&mut self, timeout: Option<Duration>) -> std::io::Result<Vec<ReadyEvent>> {
        self.events.clear();
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }
        let mut ready = Vec::new();
        for event in self.events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            let fd = event.token().0 as RawFd;
            if event.is_readable() {
                ready.push(ReadyEvent {
                    fd,
                    direction: Direction::Read,
                });
            }
            if event.is_writable() {
                ready.push(ReadyEvent {
                    fd,
                    direction: Direction::Write,
                });
            }
        }
        Ok(ready)
    }
}

/// `Interest` has no subtraction; reconstruct what remains after removing
/// one direction by checking the flag that would survive.
fn remaining_interest(current: Interest, remove: Interest) -> Option<Interest> {
    let keep_read = current.is_readable() && remove != Interest::READABLE;
    let keep_write = current.is_writable() && remove != Interest::WRITABLE;
    match (keep_read, keep_write) {
        (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_interest_drops_one_direction() {
        let both = Interest::READABLE.add(Interest::WRITABLE);
        assert_eq!(
            remaining_interest(both, Interest::READABLE),
            Some(Interest::WRITABLE)
        );
        assert_eq!(
            remaining_interest(Interest::WRITABLE, Interest::WRITABLE),
            None
        );
    }
}
