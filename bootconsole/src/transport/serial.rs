use std::io::{Read as _, Write as _};
use std::os::unix::io::{AsRawFd, RawFd};
use std::thread;
use std::time::Duration;

use log::info;
use serialport::TTYPort;

use crate::error::{BootError, Result};

use super::{FlowControl, Transport};

/// Serial-port backend, mirroring `up_bio_serial.c`: opened non-blocking
/// and raw, with CLOCAL/CREAD set and hardware/software flow control
/// disabled until explicitly requested.
pub struct SerialTransport {
    port: TTYPort,
    last_flow_control: FlowControl,
    disposed: bool,
}

impl SerialTransport {
    pub fn open(path: &str, initial_baud: u32) -> Result<Self> {
        let mut port = serialport::new(path, initial_baud)
            .open_native()
            .map_err(|e| BootError::Transport(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        port.set_timeout(Duration::from_millis(0))
            .map_err(|e| BootError::Transport(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        port.set_flow_control(serialport::FlowControl::None)
            .map_err(|e| BootError::Transport(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        unsafe {
            set_nonblocking(port.as_raw_fd())?;
        }
        Ok(SerialTransport { port, last_flow_control: FlowControl::None, disposed: false })
    }
}

unsafe fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = libc::fcntl(fd, libc::F_GETFL, 0);
    if flags < 0 {
        return Err(BootError::Transport(std::io::Error::last_os_error()));
    }
    if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
        return Err(BootError::Transport(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn absorb_would_block(e: std::io::Error) -> Result<usize> {
    match e.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted => Ok(0),
        _ => Err(BootError::Transport(e)),
    }
}

impl Transport for SerialTransport {
    fn poll_handle(&self) -> RawFd {
        self.port.as_raw_fd()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) => absorb_would_block(e),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        match self.port.write(buf) {
            Ok(n) => Ok(n),
            Err(e) => absorb_would_block(e),
        }
    }

    fn set_baud(&mut self, baud: u32, flow_control: FlowControl) -> Result<()> {
        if baud == 0 && flow_control == self.last_flow_control {
            return Ok(());
        }
        info!("[[ Changing baud rate to {} / {:?} ]]", baud, flow_control);
        // Allow drainage, matching up_bio_serial.c's `sleep(1)` before
        // applying the new line settings.
        thread::sleep(Duration::from_secs(1));

        let sp_flow = match flow_control {
            FlowControl::None => serialport::FlowControl::None,
            FlowControl::RtsCts => serialport::FlowControl::Hardware,
        };
        self.port
            .set_flow_control(sp_flow)
            .map_err(|e| BootError::Transport(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        self.last_flow_control = flow_control;

        if baud != 0 {
            self.port
                .set_baud_rate(baud)
                .map_err(|e| BootError::Transport(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        }
        Ok(())
    }

    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        // TTYPort's Drop already restores the captured termios and closes
        // the fd; nothing further to release here.
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_control_mapping_is_total() {
        // Every FlowControl variant must map to a serialport variant; this
        // exercises the match arms without touching real hardware.
        for fc in [FlowControl::None, FlowControl::RtsCts] {
            let mapped = match fc {
                FlowControl::None => serialport::FlowControl::None,
                FlowControl::RtsCts => serialport::FlowControl::Hardware,
            };
            let _ = mapped;
        }
    }
}
