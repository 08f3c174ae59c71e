use std::os::unix::io::RawFd;

use crate::error::{BootError, Result};

use super::{FlowControl, Transport};

/// Wraps the local terminal's raw fd (already placed in raw, non-blocking
/// mode by [`crate::tty::RawTty`]) as a [`Transport`], so the console
/// reactor and the protocol send loops can poll/read/write it with the
/// same machinery used for the serial link.
pub struct TtyIo {
    fd: RawFd,
}

impl TtyIo {
    pub fn new(fd: RawFd) -> Self {
        TtyIo { fd }
    }
}

impl Transport for TtyIo {
    fn poll_handle(&self) -> RawFd {
        self.fd
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let rv = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut _, buf.len()) };
        if rv < 0 {
            let err = std::io::Error::last_os_error();
            return match err.kind() {
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted => Ok(0),
                _ => Err(BootError::Transport(err)),
            };
        }
        Ok(rv as usize)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let rv = unsafe { libc::write(self.fd, buf.as_ptr() as *const _, buf.len()) };
        if rv < 0 {
            let err = std::io::Error::last_os_error();
            return match err.kind() {
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted => Ok(0),
                _ => Err(BootError::Transport(err)),
            };
        }
        Ok(rv as usize)
    }

    fn set_baud(&mut self, _baud: u32, _flow_control: FlowControl) -> Result<()> {
        Ok(())
    }

    fn dispose(&mut self) {}
}
