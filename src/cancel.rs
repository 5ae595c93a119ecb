//! Cooperative cancellation of a capture.
//!
//! The interrupt side only flips atomics and unparks the capture thread, so
//! a capture sleeping between polls notices the cancel right away.

use std::io::{self, BufRead};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::tracefs::StopHandle;

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Sleeps for `interval` unless the token is set first. Must be called
    /// from the thread an [`Interrupt`] was built on to be woken early.
    pub fn sleep(&self, interval: Duration) {
        let deadline = Instant::now() + interval;
        while !self.is_set() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::park_timeout(deadline - now);
        }
    }

    /// Reads one line from `input`, giving up as soon as the token is set.
    /// Returns `None` when cancelled.
    ///
    /// Signal handlers restart blocking reads, so the read happens on a
    /// helper thread and this thread parks until either side wakes it. Like
    /// [`CancelToken::sleep`], it must run on the thread the [`Interrupt`]
    /// was built on. A cancelled read is left behind on its thread.
    pub fn read_line<R>(&self, mut input: R) -> io::Result<Option<String>>
    where
        R: BufRead + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let waiter = thread::current();
        thread::Builder::new()
            .name("opensnoop-stdin".to_string())
            .spawn(move || {
                let mut line = String::new();
                let res = input.read_line(&mut line).map(|_| line);
                // The receiver is gone if the wait was cancelled.
                let _ = tx.send(res);
                waiter.unpark();
            })?;

        loop {
            if self.is_set() {
                return Ok(None);
            }
            match rx.try_recv() {
                Ok(res) => return res.map(Some),
                Err(mpsc::TryRecvError::Empty) => thread::park(),
                Err(mpsc::TryRecvError::Disconnected) => {
                    return Err(io::Error::other("line reader thread exited"))
                }
            }
        }
    }
}

/// Everything the interrupt path may touch.
#[derive(Debug, Clone)]
pub struct Interrupt {
    token: CancelToken,
    stop: StopHandle,
    waiter: Thread,
}

impl Interrupt {
    /// Binds the interrupt to the calling thread, which is the one that
    /// iterates and sleeps.
    pub fn new(token: CancelToken, stop: StopHandle) -> Self {
        Interrupt {
            token,
            stop,
            waiter: thread::current(),
        }
    }

    /// Cancels the capture. Repeated calls are harmless.
    pub fn fire(&self) {
        self.token.set();
        self.stop.stop();
        self.waiter.unpark();
    }

    /// Routes SIGINT to [`Interrupt::fire`].
    pub fn install(self) -> Result<()> {
        ctrlc::set_handler(move || self.fire()).context("Error setting Ctrl-C handler")
    }
}
