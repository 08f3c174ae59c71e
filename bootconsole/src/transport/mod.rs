//! Transport abstraction: non-blocking read/write, blocking safe-write,
//! a poll handle, and baud/flow-control mutation, with ordered disposal.
//! Modeled on `up_bio_serial.c`'s capability table.

mod serial;
mod tty_io;

pub use serial::SerialTransport;
pub use tty_io::TtyIo;

use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::error::{BootError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    None,
    RtsCts,
}

/// A byte-stream device the console reads from and writes to. Exactly one
/// reader and one writer use a given transport at a time; it is owned by
/// the session's `Context` and disposed exactly once.
pub trait Transport {
    /// Raw fd suitable for `poll(2)`. Used only to park until readable.
    fn poll_handle(&self) -> RawFd;

    /// Non-blocking read. `Ok(0)` means "no data right now", not EOF.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Non-blocking write; short writes are permitted.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Blocking write: loops, polling for writability, until every byte
    /// has gone out or a fatal error occurs.
    fn safe_write(&mut self, buf: &[u8]) -> Result<()> {
        let mut remaining = buf;
        while !remaining.is_empty() {
            match self.write(remaining) {
                Ok(0) => {
                    poll_writable(self.poll_handle(), Duration::from_secs(1))?;
                }
                Ok(n) => remaining = &remaining[n..],
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Changes baud rate and/or flow control. Drains outstanding output
    /// first. `baud == 0` leaves the baud rate unchanged (a pure
    /// flow-control update).
    fn set_baud(&mut self, baud: u32, flow_control: FlowControl) -> Result<()>;

    /// Restores the prior line discipline (if any) and releases the
    /// underlying resource. Idempotent.
    fn dispose(&mut self);
}

fn poll_writable(fd: RawFd, timeout: Duration) -> Result<()> {
    let mut pfd = libc::pollfd { fd, events: libc::POLLOUT, revents: 0 };
    let rv = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as libc::c_int) };
    if rv < 0 && !is_eintr() {
        return Err(BootError::Transport(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Polls a set of raw fds for readability with the given timeout, used by
/// the console reactor to wait on {transport, tty} simultaneously. A
/// signal interrupting the syscall is reported as "nothing ready yet",
/// not a fatal error.
pub fn poll_readable(fds: &[RawFd], timeout: Duration) -> Result<Vec<bool>> {
    let mut pfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd { fd, events: libc::POLLIN, revents: 0 })
        .collect();
    let rv = unsafe {
        libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout.as_millis() as libc::c_int)
    };
    if rv < 0 {
        if is_eintr() {
            return Ok(vec![false; fds.len()]);
        }
        return Err(BootError::Transport(std::io::Error::last_os_error()));
    }
    Ok(pfds.iter().map(|p| p.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0).collect())
}

fn is_eintr() -> bool {
    std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted
}
