use std::cell::RefCell;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use ahash::AHashMap;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::channel::Channel;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::poller::Poller;
use crate::timer::{TimerWheel, WHEEL_SLOTS};

type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    /// The loop currently running on this thread, installed for the duration
    /// of `start()`. Queued cross-thread tasks use it to resolve loop-owned
    /// state without capturing non-Send handles.
    static CURRENT: RefCell<Option<Rc<LoopCore>>> = const { RefCell::new(None) };
}

/// Shared interior of an event loop. Thread-confined except for the pending
/// task queue and the wake fd, which are the only cross-thread entry points.
pub(crate) struct LoopCore {
    poller: RefCell<Poller>,
    pub(crate) wheel: TimerWheel,
    wake_fd: Arc<OwnedFd>,
    wake_channel: Rc<Channel>,
    pending: Arc<Mutex<Vec<Task>>>,
    thread: ThreadId,
    quit: Arc<AtomicBool>,
    fault: RefCell<Option<Error>>,
    /// Non-owning id registry so cross-thread sends can be routed by id.
    /// Strong references live outside, typically in a server table.
    connections: RefCell<AHashMap<u64, Weak<Connection>>>,
}

impl LoopCore {
    pub(crate) fn current() -> Option<Rc<LoopCore>> {
        CURRENT.with(|current| current.borrow().clone())
    }

    pub(crate) fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    pub(crate) fn update_channel(&self, channel: &Channel) {
        if let Err(e) = self.poller.borrow_mut().update(channel) {
            error!(fd = channel.fd(), error = %e, "poller registration update failed");
        }
    }

    pub(crate) fn remove_channel(&self, fd: std::os::fd::RawFd) {
        if let Err(e) = self.poller.borrow_mut().remove(fd) {
            error!(fd, error = %e, "poller removal failed");
        }
    }

    /// Record a fatal condition raised from a callback; the cycle stops and
    /// `start()` returns the error.
    pub(crate) fn fail(&self, err: Error) {
        error!(error = %err, "event loop fault");
        *self.fault.borrow_mut() = Some(err);
        self.quit.store(true, Ordering::Release);
    }

    pub(crate) fn make_handle(&self) -> LoopHandle {
        LoopHandle {
            pending: self.pending.clone(),
            wake_fd: self.wake_fd.clone(),
            thread: self.thread,
            quit: self.quit.clone(),
        }
    }

    pub(crate) fn register_connection(&self, id: u64, conn: Weak<Connection>) {
        self.connections.borrow_mut().insert(id, conn);
    }

    pub(crate) fn unregister_connection(&self, id: u64) {
        self.connections.borrow_mut().remove(&id);
    }

    pub(crate) fn connection(&self, id: u64) -> Option<Rc<Connection>> {
        self.connections
            .borrow()
            .get(&id)
            .and_then(|weak| weak.upgrade())
    }

    fn drain_wake(&self) {
        let mut buf = [0u8; 8];
        let n = unsafe {
            libc::read(
                self.wake_fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n == buf.len() as isize {
            return;
        }
        if n < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => return,
                _ => {
                    self.fail(Error::Io(err));
                    return;
                }
            }
        }
        self.fail(Error::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "short read from wake eventfd",
        )));
    }
}

pub(crate) fn validate_timeout(secs: u64) -> Result<()> {
    if secs == 0 || secs >= WHEEL_SLOTS {
        return Err(Error::InvalidTimeout(secs));
    }
    Ok(())
}

fn wake(fd: &OwnedFd) {
    let one: u64 = 1;
    let n = unsafe {
        libc::write(
            fd.as_raw_fd(),
            &one as *const u64 as *const libc::c_void,
            std::mem::size_of::<u64>(),
        )
    };
    if n != std::mem::size_of::<u64>() as isize {
        error!("wake eventfd write failed");
    }
}

/// Cloneable, thread-safe handle to an event loop: the only cross-thread
/// entry point. Tasks enqueued here run on the loop thread after the
/// current iteration's event dispatch.
#[derive(Clone)]
pub struct LoopHandle {
    pending: Arc<Mutex<Vec<Task>>>,
    wake_fd: Arc<OwnedFd>,
    thread: ThreadId,
    quit: Arc<AtomicBool>,
}

impl LoopHandle {
    pub fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.thread
    }

    /// Run `task` on the loop thread: inline when already there, otherwise
    /// enqueue and wake the poller. Multiple wakes between polls coalesce
    /// into a single readiness notification.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_loop_thread() {
            task();
            return;
        }
        {
            let mut pending = self.pending.lock();
            pending.push(Box::new(task));
        }
        wake(&self.wake_fd);
    }

    /// Schedule `action` to run after `secs` seconds of no refresh.
    ///
    /// The timer ops on this handle resolve against the loop that is
    /// running when the queued task drains; on the loop thread itself,
    /// prefer the `EventLoop` methods.
    pub fn run_after(&self, id: u64, secs: u64, action: impl FnOnce() + Send + 'static) -> Result<()> {
        validate_timeout(secs)?;
        self.run_in_loop(move || {
            if let Some(core) = LoopCore::current() {
                core.wheel.add(id, secs, Box::new(action));
            }
        });
        Ok(())
    }

    /// Push a timer task's deadline out by its original timeout.
    pub fn refresh_after(&self, id: u64) {
        self.run_in_loop(move || {
            if let Some(core) = LoopCore::current() {
                core.wheel.refresh(id);
            }
        });
    }

    /// Cancel a timer task; its action will not run.
    pub fn remove_after(&self, id: u64) {
        self.run_in_loop(move || {
            if let Some(core) = LoopCore::current() {
                core.wheel.cancel(id);
            }
        });
    }

    /// Ask the loop to stop after the current iteration.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        wake(&self.wake_fd);
    }
}

/// A single-threaded reactor: one poller, one time wheel, one cross-thread
/// task queue, owned by the thread that constructed it.
///
/// The wake eventfd and the wheel's timerfd are registered as ordinary
/// channels, so timer ticks and wakeups share the dispatch discipline of
/// user sockets. Each iteration polls, dispatches ready channels in order,
/// then drains queued tasks.
pub struct EventLoop {
    core: Rc<LoopCore>,
}

impl EventLoop {
    pub fn new() -> Result<EventLoop> {
        let poller = Poller::new()?;
        let timer_fd = TimerWheel::create_timer_fd()?;

        let raw = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if raw < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let wake_fd = Arc::new(unsafe { OwnedFd::from_raw_fd(raw) });

        let core = Rc::new_cyclic(|me: &Weak<LoopCore>| LoopCore {
            poller: RefCell::new(poller),
            wheel: TimerWheel::assemble(timer_fd, me.clone()),
            wake_channel: Channel::with_core(raw, me.clone()),
            wake_fd,
            pending: Arc::new(Mutex::new(Vec::new())),
            thread: thread::current().id(),
            quit: Arc::new(AtomicBool::new(false)),
            fault: RefCell::new(None),
            connections: RefCell::new(AHashMap::new()),
        });

        // Wire the internal channels now that the core exists; enabling read
        // interest registers them with the poller.
        {
            let weak = Rc::downgrade(&core);
            core.wake_channel.set_read_callback(move || {
                if let Some(core) = weak.upgrade() {
                    core.drain_wake();
                }
            });
            core.wake_channel.enable_read();
        }
        {
            let weak = Rc::downgrade(&core);
            core.wheel.channel().set_read_callback(move || {
                if let Some(core) = weak.upgrade() {
                    core.wheel.on_timer(&core);
                }
            });
            core.wheel.channel().enable_read();
        }

        Ok(EventLoop { core })
    }

    pub(crate) fn core(&self) -> &Rc<LoopCore> {
        &self.core
    }

    /// A `Send + Sync` handle for foreign threads.
    pub fn handle(&self) -> LoopHandle {
        self.core.make_handle()
    }

    pub fn is_loop_thread(&self) -> bool {
        self.core.is_loop_thread()
    }

    /// Run `task` on the loop thread; see `LoopHandle::run_in_loop`.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.handle().run_in_loop(task);
    }

    /// Sync a channel's interest mask with the poller.
    pub fn update_event(&self, channel: &Channel) {
        self.core.update_channel(channel);
    }

    /// Remove a channel from the poller.
    pub fn remove_event(&self, channel: &Channel) {
        self.core.remove_channel(channel.fd());
    }

    /// Schedule `action` under `id` to fire after `secs` seconds.
    pub fn run_after(&self, id: u64, secs: u64, action: impl FnOnce() + 'static) -> Result<()> {
        validate_timeout(secs)?;
        self.core.wheel.add(id, secs, Box::new(action));
        Ok(())
    }

    pub fn refresh_after(&self, id: u64) {
        self.core.wheel.refresh(id);
    }

    pub fn remove_after(&self, id: u64) {
        self.core.wheel.cancel(id);
    }

    pub fn has_after(&self, id: u64) -> bool {
        self.core.wheel.has(id)
    }

    pub fn quit(&self) {
        self.core.quit.store(true, Ordering::Release);
        wake(&self.core.wake_fd);
    }

    /// Run the reactor cycle until `quit` or a fault.
    ///
    /// Per iteration: block in the poller (the sole suspension point),
    /// dispatch ready channels in the order the kernel reported them, then
    /// drain the cross-thread task queue.
    pub fn start(&self) -> Result<()> {
        debug_assert!(self.is_loop_thread());
        CURRENT.with(|current| *current.borrow_mut() = Some(self.core.clone()));
        let result = self.cycle();
        CURRENT.with(|current| *current.borrow_mut() = None);
        result
    }

    fn cycle(&self) -> Result<()> {
        let mut active: Vec<Rc<Channel>> = Vec::new();
        while !self.core.quit.load(Ordering::Acquire) {
            {
                let mut poller = self.core.poller.borrow_mut();
                poller.poll(None, &mut active)?;
            }
            for channel in active.drain(..) {
                channel.handle_event();
            }
            self.run_pending_tasks();
            if let Some(err) = self.core.fault.borrow_mut().take() {
                return Err(err);
            }
        }
        debug!("event loop stopped");
        Ok(())
    }

    /// Swap the queue out under the lock, then run the tasks unlocked.
    fn run_pending_tasks(&self) {
        let tasks = {
            let mut pending = self.core.pending.lock();
            std::mem::take(&mut *pending)
        };
        for task in tasks {
            task();
        }
    }
}
