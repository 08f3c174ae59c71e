//! Raw-mode guard for the local controlling tty (C10). Grounded on
//! `up_start_console`/`up_finish_console`: capture the current line
//! discipline, switch to raw mode with `ISIG` cleared and `OPOST` kept
//! set (so `\n` still becomes `\r\n` on output), make the fd
//! non-blocking, and restore everything on drop.

use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;

use crate::error::{BootError, Result};

/// RAII guard owning the tty's saved termios and `fcntl` flags. The console
/// holds this for as long as it owns the tty; dropping it restores the
/// original line discipline and blocking mode.
pub struct RawTty {
    fd: RawFd,
    saved_termios: libc::termios,
    saved_flags: libc::c_int,
    restored: bool,
}

impl RawTty {
    /// Puts `fd` into raw, non-blocking mode, saving what was there before.
    pub fn enable(fd: RawFd) -> Result<Self> {
        let mut term = MaybeUninit::<libc::termios>::uninit();
        if unsafe { libc::tcgetattr(fd, term.as_mut_ptr()) } < 0 {
            return Err(BootError::Transport(std::io::Error::last_os_error()));
        }
        let saved_termios = unsafe { term.assume_init() };

        let mut raw = saved_termios;
        unsafe { libc::cfmakeraw(&mut raw) };
        // Don't generate SIGINT: it's normal input for the device on the
        // other end of the serial link, not a request to kill us.
        raw.c_lflag &= !(libc::ISIG as libc::tcflag_t);
        // Keep \n -> \r\n translation on output, or the console is
        // unreadable.
        raw.c_oflag |= libc::OPOST as libc::tcflag_t;
        if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &raw) } < 0 {
            return Err(BootError::Transport(std::io::Error::last_os_error()));
        }

        let saved_flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        if saved_flags < 0 {
            return Err(BootError::Transport(std::io::Error::last_os_error()));
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFL, saved_flags | libc::O_NONBLOCK) } < 0 {
            return Err(BootError::Transport(std::io::Error::last_os_error()));
        }

        Ok(RawTty { fd, saved_termios, saved_flags, restored: false })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Restores the saved line discipline and blocking mode. Idempotent.
    pub fn restore(&mut self) {
        if self.restored {
            return;
        }
        self.restored = true;
        unsafe {
            libc::tcsetattr(self.fd, libc::TCSANOW, &self.saved_termios);
            libc::fcntl(self.fd, libc::F_SETFL, self.saved_flags);
        }
    }
}

impl Drop for RawTty {
    fn drop(&mut self) {
        self.restore();
    }
}
