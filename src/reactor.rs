//! Event-loop primitives shared by every subsystem.
//!
//! Everything that waits on an fd goes through calloop. This module adds the
//! two pieces calloop does not hand us directly: a cross-thread nudge that can
//! be cloned into commits and protocol handlers, and a dedicated thread that
//! blocks on acquire fences and runs a callback once they signal.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::thread::JoinHandle;

use anyhow::Context;
use calloop::channel::{self, Channel};
use calloop::generic::Generic;
use calloop::ping::{make_ping, Ping, PingSource};
use calloop::{EventLoop, Interest, LoopHandle, Mode, PostAction, RegistrationToken};

// =============================================================================
// Nudge
// =============================================================================

/// Wakes up the compositor loop from any thread.
#[derive(Debug, Clone)]
pub struct Nudge(Ping);

impl Nudge {
    /// Creates the nudge and the source to insert into the woken loop.
    pub fn new() -> anyhow::Result<(Self, PingSource)> {
        let (ping, source) = make_ping().context("error creating a ping")?;
        Ok((Self(ping), source))
    }

    pub fn nudge(&self) {
        self.0.ping();
    }
}

// =============================================================================
// FenceWaiter
// =============================================================================

pub type ReadyCallback = Box<dyn FnOnce() + Send>;

enum WaiterMsg {
    Watch {
        key: u64,
        fd: OwnedFd,
        on_ready: ReadyCallback,
    },
    Cancel {
        key: u64,
    },
}

struct WaiterState {
    handle: LoopHandle<'static, WaiterState>,
    watches: HashMap<u64, RegistrationToken>,
    callbacks: HashMap<u64, ReadyCallback>,
    stop: bool,
}

impl WaiterState {
    fn watch(&mut self, key: u64, fd: OwnedFd, on_ready: ReadyCallback) {
        let source = Generic::new(fd, Interest::READ, Mode::Level);
        let token = match self.handle.insert_source(source, move |_, _, state| {
            state.fire(key);
            Ok(PostAction::Remove)
        }) {
            Ok(token) => token,
            Err(err) => {
                // A dead fd counts as signalled; dropping the commit on the
                // floor would wedge its surface forever.
                warn!("error watching acquire fence: {err}");
                on_ready();
                return;
            }
        };

        self.watches.insert(key, token);
        self.callbacks.insert(key, on_ready);
    }

    fn fire(&mut self, key: u64) {
        self.watches.remove(&key);
        if let Some(on_ready) = self.callbacks.remove(&key) {
            on_ready();
        }
    }

    fn cancel(&mut self, key: u64) {
        if let Some(token) = self.watches.remove(&key) {
            self.handle.remove(token);
        }
        self.callbacks.remove(&key);
    }
}

/// A thread parked in epoll on the acquire fences of pending commits.
///
/// On readiness the registered callback runs on the waiter thread; callbacks
/// are expected to mark the commit ready, queue it, and nudge the compositor.
pub struct FenceWaiter {
    sender: channel::Sender<WaiterMsg>,
    thread: Option<JoinHandle<()>>,
}

impl FenceWaiter {
    pub fn spawn() -> anyhow::Result<Self> {
        let (sender, receiver) = channel::channel();

        let thread = std::thread::Builder::new()
            .name("monocle-fence".to_owned())
            .spawn(move || run_waiter(receiver))
            .context("error spawning the fence-wait thread")?;

        Ok(Self {
            sender,
            thread: Some(thread),
        })
    }

    /// Registers `fd` for a one-shot readiness callback keyed by `key`.
    pub fn watch(&self, key: u64, fd: OwnedFd, on_ready: ReadyCallback) {
        let _ = self.sender.send(WaiterMsg::Watch { key, fd, on_ready });
    }

    /// Drops the registration for `key`, if it is still pending.
    pub fn cancel(&self, key: u64) {
        let _ = self.sender.send(WaiterMsg::Cancel { key });
    }
}

impl Drop for FenceWaiter {
    fn drop(&mut self) {
        // Closing the channel stops the loop.
        let (sender, _) = channel::channel();
        self.sender = sender;
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run_waiter(receiver: Channel<WaiterMsg>) {
    let mut event_loop: EventLoop<WaiterState> = match EventLoop::try_new() {
        Ok(event_loop) => event_loop,
        Err(err) => {
            error!("error creating the fence-wait event loop: {err}");
            return;
        }
    };

    let handle = event_loop.handle();
    let mut state = WaiterState {
        handle: handle.clone(),
        watches: HashMap::new(),
        callbacks: HashMap::new(),
        stop: false,
    };

    handle
        .insert_source(receiver, |event, _, state| match event {
            channel::Event::Msg(WaiterMsg::Watch { key, fd, on_ready }) => {
                state.watch(key, fd, on_ready);
            }
            channel::Event::Msg(WaiterMsg::Cancel { key }) => state.cancel(key),
            channel::Event::Closed => state.stop = true,
        })
        .unwrap();

    while !state.stop {
        if let Err(err) = event_loop.dispatch(None, &mut state) {
            error!("error dispatching the fence-wait loop: {err}");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::fd::FromRawFd;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use super::*;

    fn eventfd_pair() -> (OwnedFd, std::fs::File) {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        assert!(fd >= 0);
        let dup = unsafe { libc::dup(fd) };
        assert!(dup >= 0);
        let read = unsafe { OwnedFd::from_raw_fd(fd) };
        let write = unsafe { std::fs::File::from_raw_fd(dup) };
        (read, write)
    }

    fn wait_for(flag: &AtomicBool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(2) {
            if flag.load(Ordering::SeqCst) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn fires_on_signal() {
        let waiter = FenceWaiter::spawn().unwrap();
        let (read, mut write) = eventfd_pair();

        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        waiter.watch(1, read, Box::new(move || flag.store(true, Ordering::SeqCst)));

        std::thread::sleep(Duration::from_millis(10));
        assert!(!fired.load(Ordering::SeqCst));

        write.write_all(&1u64.to_ne_bytes()).unwrap();
        assert!(wait_for(&fired));
    }

    #[test]
    fn cancel_prevents_fire() {
        let waiter = FenceWaiter::spawn().unwrap();
        let (read, mut write) = eventfd_pair();

        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        waiter.watch(7, read, Box::new(move || flag.store(true, Ordering::SeqCst)));
        waiter.cancel(7);

        write.write_all(&1u64.to_ne_bytes()).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn pre_signalled_fd_fires_immediately() {
        let waiter = FenceWaiter::spawn().unwrap();
        let (read, mut write) = eventfd_pair();
        write.write_all(&1u64.to_ne_bytes()).unwrap();

        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        waiter.watch(2, read, Box::new(move || flag.store(true, Ordering::SeqCst)));
        assert!(wait_for(&fired));
    }
}
