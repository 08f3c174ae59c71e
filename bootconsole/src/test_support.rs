//! Shared test-only `Transport` mock: an in-memory byte queue standing in
//! for a real serial link or tty, so protocol engines can be driven
//! end-to-end against the exact byte sequences the spec calls out without
//! touching any real fd.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;

use crate::error::Result;
use crate::transport::{FlowControl, Transport};

/// Turns on `log` output for a test run under `cargo test -- --nocapture`
/// (harmless, and a no-op, if some other test already initialized it).
pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct VecTransport {
    pub out: Vec<u8>,
    pub inbound: VecDeque<u8>,
}

impl VecTransport {
    pub fn new() -> Self {
        VecTransport { out: Vec::new(), inbound: VecDeque::new() }
    }

    pub fn with_inbound(bytes: &[u8]) -> Self {
        VecTransport { out: Vec::new(), inbound: bytes.iter().copied().collect() }
    }

    pub fn push_inbound(&mut self, bytes: &[u8]) {
        self.inbound.extend(bytes.iter().copied());
    }
}

impl Default for VecTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for VecTransport {
    fn poll_handle(&self) -> RawFd {
        -1
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut n = 0;
        while n < buf.len() {
            match self.inbound.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.out.extend_from_slice(buf);
        Ok(buf.len())
    }

    /// Overridden (rather than relying on the trait's default loop) so
    /// tests never hit the real `poll(2)` syscall via the `-1` sentinel
    /// fd above.
    fn safe_write(&mut self, buf: &[u8]) -> Result<()> {
        self.out.extend_from_slice(buf);
        Ok(())
    }

    fn set_baud(&mut self, _baud: u32, _flow_control: FlowControl) -> Result<()> {
        Ok(())
    }

    fn dispose(&mut self) {}
}
