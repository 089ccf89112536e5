//! Deadline-bounded waiting on the display connection.
//!
//! Frame pacing and general event waiting share [`DisplayPoller::dispatch`]:
//! flush outgoing requests, poll the display fd (and optionally the wakeup
//! pipe) until the timeout, read what arrived and dispatch it.

use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::time::{Duration, Instant};

use rustix::event::{poll, PollFd, PollFlags};
use rustix::io::Errno;
use rustix::pipe::{pipe_with, PipeFlags};
use tracing::error;
use wayland_backend::client::WaylandError;
use wayland_client::EventQueue;

use crate::error::SessionError;

/// Longest single wait in [`crate::OutputSession::wait_events`].
pub const MAX_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    /// POLLERR, POLLHUP or POLLNVAL on the display fd.
    pub error: bool,
    pub woken: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    Dispatched(usize),
    Closed,
}

#[derive(Debug)]
pub struct DisplayPoller {
    wakeup_read: OwnedFd,
    wakeup_write: OwnedFd,
    closed: bool,
}

impl DisplayPoller {
    pub fn new() -> io::Result<Self> {
        let (wakeup_read, wakeup_write) = pipe_with(PipeFlags::CLOEXEC | PipeFlags::NONBLOCK)?;
        Ok(Self {
            wakeup_read,
            wakeup_write,
            closed: false,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Interrupts a concurrent or the next `dispatch` that watches the pipe.
    pub fn wakeup(&self) {
        match rustix::io::write(&self.wakeup_write, &[0u8]) {
            Ok(_) | Err(Errno::AGAIN) => {}
            Err(err) => error!("failed to write to the wakeup pipe: {err}"),
        }
    }

    fn drain_wakeup(&self) {
        let mut buf = [0u8; 64];
        while let Ok(n) = rustix::io::read(&self.wakeup_read, &mut buf) {
            if n == 0 {
                break;
            }
        }
    }

    /// Polls `display` and, if asked, the wakeup pipe. `None` waits forever.
    pub fn poll(
        &self,
        display: BorrowedFd<'_>,
        timeout: Option<Duration>,
        watch_wakeup: bool,
    ) -> io::Result<Readiness> {
        let mut fds = [
            PollFd::from_borrowed_fd(display, PollFlags::IN),
            PollFd::new(&self.wakeup_read, PollFlags::IN),
        ];
        let nfds = if watch_wakeup { 2 } else { 1 };
        match poll(&mut fds[..nfds], timeout_ms(timeout)) {
            Ok(_) | Err(Errno::INTR) => {}
            Err(err) => return Err(err.into()),
        }

        let display_events = fds[0].revents();
        let readiness = Readiness {
            readable: display_events.contains(PollFlags::IN),
            error: display_events.intersects(PollFlags::ERR | PollFlags::HUP | PollFlags::NVAL),
            woken: watch_wakeup && fds[1].revents().contains(PollFlags::IN),
        };
        if readiness.woken {
            self.drain_wakeup();
        }
        Ok(readiness)
    }

    pub fn dispatch<D>(
        &mut self,
        queue: &mut EventQueue<D>,
        state: &mut D,
        timeout: Option<Duration>,
        watch_wakeup: bool,
    ) -> Result<PollStatus, SessionError> {
        if self.closed {
            return Ok(PollStatus::Closed);
        }
        profiling::scope!("DisplayPoller::dispatch");

        let guard = loop {
            match queue.prepare_read() {
                Some(guard) => break guard,
                None => {
                    queue.dispatch_pending(state)?;
                }
            }
        };
        match queue.flush() {
            Ok(()) => {}
            Err(WaylandError::Io(err)) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => return Err(err.into()),
        }

        let readiness = self.poll(guard.connection_fd().as_fd(), timeout, watch_wakeup)?;

        if readiness.readable {
            match guard.read() {
                Ok(_) => {}
                Err(WaylandError::Io(err)) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(err.into()),
            }
        } else {
            drop(guard);
        }

        if readiness.error {
            error!("Error occurred on the display fd, closing");
            self.closed = true;
            return Ok(PollStatus::Closed);
        }

        Ok(PollStatus::Dispatched(queue.dispatch_pending(state)?))
    }
}

fn timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(timeout) => {
            let ms = timeout.as_micros().div_ceil(1000);
            ms.min(i32::MAX as u128) as i32
        }
    }
}

/// Time left until `until`, rounded up to whole milliseconds and clamped to
/// [`MAX_WAIT`].
pub fn clamp_wait(until: Instant, now: Instant) -> Duration {
    let left = until.saturating_duration_since(now);
    let ms = left.as_micros().div_ceil(1000).min(MAX_WAIT.as_millis());
    Duration::from_millis(ms as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn display_pipe() -> (OwnedFd, OwnedFd) {
        pipe_with(PipeFlags::CLOEXEC | PipeFlags::NONBLOCK).unwrap()
    }

    #[test]
    fn wait_is_clamped_to_ten_seconds() {
        let now = Instant::now();
        assert_eq!(clamp_wait(now + Duration::from_secs(60), now), MAX_WAIT);
        assert_eq!(clamp_wait(now, now + Duration::from_secs(1)), Duration::ZERO);
        assert_eq!(
            clamp_wait(now + Duration::from_micros(1_500), now),
            Duration::from_millis(2)
        );
    }

    #[test]
    fn timeouts_round_up_to_milliseconds() {
        assert_eq!(timeout_ms(None), -1);
        assert_eq!(timeout_ms(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_ms(Some(Duration::from_micros(1))), 1);
        assert_eq!(timeout_ms(Some(Duration::from_millis(17))), 17);
    }

    #[test]
    #[serial]
    fn times_out_without_activity() {
        let poller = DisplayPoller::new().unwrap();
        let (display, _writer) = display_pipe();
        let started = Instant::now();
        let readiness = poller
            .poll(display.as_fd(), Some(Duration::from_millis(20)), true)
            .unwrap();
        assert_eq!(readiness, Readiness::default());
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    #[serial]
    fn wakeup_interrupts_the_wait_and_is_drained() {
        let poller = DisplayPoller::new().unwrap();
        let (display, _writer) = display_pipe();
        poller.wakeup();
        poller.wakeup();

        let readiness = poller
            .poll(display.as_fd(), Some(Duration::from_secs(5)), true)
            .unwrap();
        assert!(readiness.woken);
        assert!(!readiness.readable);

        let readiness = poller
            .poll(display.as_fd(), Some(Duration::ZERO), true)
            .unwrap();
        assert!(!readiness.woken);
    }

    #[test]
    #[serial]
    fn wakeup_is_ignored_when_not_watched() {
        let poller = DisplayPoller::new().unwrap();
        let (display, _writer) = display_pipe();
        poller.wakeup();
        let readiness = poller
            .poll(display.as_fd(), Some(Duration::ZERO), false)
            .unwrap();
        assert!(!readiness.woken);
    }

    #[test]
    #[serial]
    fn display_data_is_readable() {
        let poller = DisplayPoller::new().unwrap();
        let (display, writer) = display_pipe();
        rustix::io::write(&writer, b"x").unwrap();
        let readiness = poller
            .poll(display.as_fd(), Some(Duration::from_secs(1)), false)
            .unwrap();
        assert!(readiness.readable);
        assert!(!readiness.error);
    }

    #[test]
    #[serial]
    fn hangup_is_reported_as_error() {
        let poller = DisplayPoller::new().unwrap();
        let (display, writer) = display_pipe();
        drop(writer);
        let readiness = poller
            .poll(display.as_fd(), Some(Duration::from_secs(1)), false)
            .unwrap();
        assert!(readiness.error);
    }
}
