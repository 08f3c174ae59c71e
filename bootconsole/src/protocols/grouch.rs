//! "grouch" protocol (C4): a length-prefixed blob watched for inline,
//! mid-stream, on any serial traffic, rather than negotiated up front.
//! Grounded on grouch.c's `maybe_grouch`/`grouch`.

use std::io::{Read, Seek, SeekFrom};

use byteorder::{BigEndian, ByteOrder};

use crate::control::CriticalControl;
use crate::error::{BootError, Result};
use crate::stage::{StageSpec, TransferOutcome};
use crate::transport::Transport;

const CUE: &[u8] = b"*LOAD*";

/// Cue-hunting state; once the whole cue has been seen in the serial
/// stream, the blocking send runs to completion inline.
pub struct GrouchState {
    cue_index: usize,
}

impl GrouchState {
    pub fn new() -> Self {
        GrouchState { cue_index: 0 }
    }

    pub fn transfer(
        &mut self,
        transport: &mut dyn Transport,
        tty: &mut dyn Transport,
        spec: &mut StageSpec,
        buf: &[u8],
    ) -> Result<TransferOutcome> {
        if !scan_cue(&mut self.cue_index, buf) {
            return Ok(0);
        }
        match send(transport, tty, spec) {
            Ok(()) => Ok(1),
            Err(BootError::UserAbort) => Ok(-2),
            Err(e) => Err(e),
        }
    }
}

/// Scans `buf` for the `*LOAD*` cue, advancing `cue_index` across calls.
/// Returns `true` the moment the full cue has been seen.
fn scan_cue(cue_index: &mut usize, buf: &[u8]) -> bool {
    for &c in buf {
        // Stray NULs show up on some links; ignore them as the original does.
        if c == 0 {
            continue;
        }
        if CUE[*cue_index] == c {
            *cue_index += 1;
            if *cue_index == CUE.len() {
                *cue_index = 0;
                return true;
            }
        } else {
            *cue_index = if CUE[0] == c { 1 } else { 0 };
        }
    }
    false
}

impl Default for GrouchState {
    fn default() -> Self {
        Self::new()
    }
}

/// The blocking send proper. Maintains one 4096-byte staging buffer
/// exactly as grouch.c does: bytes are appended to it (file data, then
/// finally the running sum) and drained to the transport as capacity
/// allows, so a slow link never loses anything to a single short write.
fn send(transport: &mut dyn Transport, tty: &mut dyn Transport, spec: &mut StageSpec) -> Result<()> {
    let file = spec
        .file
        .as_mut()
        .ok_or_else(|| BootError::Config("grouch stage has no file".into()))?;

    let len = file.seek(SeekFrom::End(0)).map_err(BootError::File)?;
    file.seek(SeekFrom::Start(0)).map_err(BootError::File)?;

    let mut buf = vec![0u8; 4096];
    buf[0] = b'*';
    BigEndian::write_u32(&mut buf[1..5], len as u32);
    let mut in_buf: usize = 5;

    let mut critical = CriticalControl::new();
    let mut sum: u32 = 0;
    let mut wrote_sum = false;
    let mut done = false;

    while !done || in_buf > 0 {
        if critical.poll_abort(tty)? {
            return Err(BootError::UserAbort);
        }

        // Echo any serial chatter straight back to the console.
        let n = transport.read(&mut buf[in_buf..])?;
        if n > 0 {
            tty.safe_write(&buf[in_buf..in_buf + n])?;
        }

        let n = file.read(&mut buf[in_buf..]).map_err(BootError::File)?;
        if n == 0 {
            if wrote_sum {
                done = true;
            } else if in_buf < buf.len() - 4 {
                BigEndian::write_u32(&mut buf[in_buf..in_buf + 4], sum);
                in_buf += 4;
                log::info!("grouch complete: host sum = 0x{sum:08x}");
                wrote_sum = true;
            }
        } else {
            for &b in &buf[in_buf..in_buf + n] {
                sum = sum.wrapping_add(b as u32);
            }
            in_buf += n;
        }

        transport.safe_write(&buf[..in_buf])?;
        in_buf = 0;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_cue_followed_by_garbage_resets_the_hunt() {
        let mut cue_index = 0;
        assert!(!scan_cue(&mut cue_index, b"*LOX"));
        assert_eq!(cue_index, 0);
    }

    #[test]
    fn cue_detected_across_calls() {
        let mut cue_index = 0;
        assert!(!scan_cue(&mut cue_index, b"junk*LO"));
        assert!(scan_cue(&mut cue_index, b"AD*more"));
    }

    #[test]
    fn stray_nul_bytes_are_ignored() {
        let mut cue_index = 0;
        assert!(scan_cue(&mut cue_index, b"*\0L\0O\0A\0D\0*"));
    }

    #[test]
    fn send_matches_the_worked_example() {
        use std::io::Write;

        use crate::test_support::{init_test_logging, VecTransport};

        init_test_logging();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0x01, 0x02, 0x03]).unwrap();
        let mut spec = StageSpec::new(crate::stage::ProtocolKind::Grouch);
        spec.file = Some(file.reopen().unwrap());

        let mut serial = VecTransport::new();
        let mut tty = VecTransport::new();
        send(&mut serial, &mut tty, &mut spec).unwrap();

        assert_eq!(serial.out, vec![0x2a, 0x00, 0x00, 0x00, 0x03, 0x01, 0x02, 0x03, 0x00, 0x00, 0x00, 0x06]);
    }
}
