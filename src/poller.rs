use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::Duration;

use ahash::AHashMap;
use tracing::{error, warn};

use crate::channel::{Channel, EventSet};
use crate::error::{Error, Result};

const INITIAL_EVENT_CAPACITY: usize = 1024;

/// Readiness multiplexer over epoll.
///
/// Owns the epoll fd and the fd-to-Channel map. Every fd present in the
/// kernel interest set has an entry in the map; removing an entry removes
/// the kernel registration.
pub(crate) struct Poller {
    epoll_fd: OwnedFd,
    events: Vec<libc::epoll_event>,
    channels: AHashMap<RawFd, Weak<Channel>>,
}

impl Poller {
    pub(crate) fn new() -> Result<Poller> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(Poller {
            epoll_fd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![libc::epoll_event { events: 0, u64: 0 }; INITIAL_EVENT_CAPACITY],
            channels: AHashMap::new(),
        })
    }

    /// Sync a channel's interest mask into the kernel set, adding the fd on
    /// first sight.
    pub(crate) fn update(&mut self, channel: &Channel) -> io::Result<()> {
        let fd = channel.fd();
        if self.channels.contains_key(&fd) {
            self.epoll_op(libc::EPOLL_CTL_MOD, fd, channel.events())
        } else {
            self.epoll_op(libc::EPOLL_CTL_ADD, fd, channel.events())?;
            self.channels.insert(fd, channel.weak());
            Ok(())
        }
    }

    /// Drop an fd from both the map and the kernel set.
    pub(crate) fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        if self.channels.remove(&fd).is_some() {
            self.epoll_op(libc::EPOLL_CTL_DEL, fd, EventSet::NONE)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn has_channel(&self, fd: RawFd) -> bool {
        self.channels.contains_key(&fd)
    }

    /// Block until readiness or `timeout` (None blocks forever). Ready
    /// channels are stamped with the observed events and pinned into
    /// `active`. An interrupted wait returns with `active` empty.
    pub(crate) fn poll(
        &mut self,
        timeout: Option<Duration>,
        active: &mut Vec<Rc<Channel>>,
    ) -> Result<()> {
        let timeout_ms: libc::c_int = match timeout {
            Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
            None => -1,
        };
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                warn!("epoll wait interrupted by signal");
                return Ok(());
            }
            return Err(Error::Io(err));
        }

        let n = n as usize;
        for i in 0..n {
            let event = self.events[i];
            let fd = event.u64 as RawFd;
            let channel = match self.channels.get(&fd) {
                Some(weak) => weak.upgrade(),
                None => {
                    error!(fd, "ready fd has no registered channel");
                    return Err(Error::ChannelMissing(fd));
                }
            };
            match channel {
                Some(channel) => {
                    channel.set_revents(EventSet::from_bits(event.events));
                    active.push(channel);
                }
                None => {
                    error!(fd, "ready fd's channel was dropped without removal");
                    return Err(Error::ChannelMissing(fd));
                }
            }
        }

        // A full return suggests more fds were ready than we had room for.
        if n == self.events.len() {
            let grown = self.events.len() * 2;
            self.events
                .resize(grown, libc::epoll_event { events: 0, u64: 0 });
        }
        Ok(())
    }

    fn epoll_op(&self, op: libc::c_int, fd: RawFd, events: EventSet) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: events.bits(),
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd.as_raw_fd(), op, fd, &mut event) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
