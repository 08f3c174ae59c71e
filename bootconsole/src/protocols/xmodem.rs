//! XMODEM protocol (C5): CRC-16 or 8-bit-sum block transfer, negotiated
//! by the first byte the receiver sends. Grounded on xmodem.c's
//! `xmodem_go`/`load_buffer`/`send_buffer`.

use std::collections::VecDeque;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::io::RawFd;

use crate::control::CriticalControl;
use crate::crc::CrcTable;
use crate::error::{BootError, Result};
use crate::protocols::wait_byte;
use crate::stage::{StageSpec, TransferOutcome};
use crate::transport::{FlowControl, Transport};

const PAD: u8 = 0x1a;
const TYPE_SHORT: u8 = 0x01;
const TYPE_LONG: u8 = 0x02;
const ACK: u8 = 0x06;
const NAK: u8 = 0x15;
const USE_CRC16: u8 = 0x43;
const EOT: u8 = 0x04;

const HEADER_BYTES: usize = 3;
const SHORT_DATA_BYTES: usize = 128;
const LONG_DATA_BYTES: usize = 1024;

/// Whether this stage is pinned to 128-byte blocks (`xmodem128`) or may
/// grow to 1024-byte blocks once the image no longer fits in one short
/// block (plain `xmodem`), matching `load_buffer`'s block-size policy.
pub struct XmodemState {
    force_128: bool,
}

impl XmodemState {
    pub fn new(force_128: bool) -> Self {
        XmodemState { force_128 }
    }

    pub fn transfer(
        &mut self,
        transport: &mut dyn Transport,
        tty: &mut dyn Transport,
        spec: &mut StageSpec,
        buf: &[u8],
    ) -> Result<TransferOutcome> {
        // xmodem_go takes over the byte stream entirely from here: it
        // drives its own blocking read loop rather than being fed one
        // tick's worth of bytes at a time. The bytes the reactor already
        // pulled off the wire this tick (typically the receiver's
        // opening NAK/'C') mustn't be lost, so they're replayed first.
        let file = spec
            .file
            .as_mut()
            .ok_or_else(|| BootError::Config("xmodem stage has no file".into()))?;
        let len = file.seek(SeekFrom::End(0)).map_err(BootError::File)?;
        file.seek(SeekFrom::Start(0)).map_err(BootError::File)?;
        let mut image = vec![0u8; len as usize];
        file.read_exact(&mut image).map_err(BootError::File)?;

        let mut prefixed = PrefixedTransport::new(transport, buf);
        match go(&mut prefixed, tty, &image, self.force_128) {
            Ok(()) => Ok(1),
            Err(BootError::UserAbort) => Ok(-2),
            Err(e) => Err(e),
        }
    }
}

/// Replays a handful of already-read bytes ahead of an inner transport's
/// own reads, so a protocol engine that owns its blocking read loop
/// doesn't lose bytes the reactor drained before handing control over.
struct PrefixedTransport<'a> {
    pending: VecDeque<u8>,
    inner: &'a mut dyn Transport,
}

impl<'a> PrefixedTransport<'a> {
    fn new(inner: &'a mut dyn Transport, prefix: &[u8]) -> Self {
        PrefixedTransport { pending: prefix.iter().copied().collect(), inner }
    }
}

impl<'a> Transport for PrefixedTransport<'a> {
    fn poll_handle(&self) -> RawFd {
        self.inner.poll_handle()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.pending.is_empty() {
            return self.inner.read(buf);
        }
        let mut n = 0;
        while n < buf.len() {
            match self.pending.pop_front() {
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
        self.inner.write(buf)
    }

    fn safe_write(&mut self, buf: &[u8]) -> Result<()> {
        self.inner.safe_write(buf)
    }

    fn set_baud(&mut self, baud: u32, flow_control: FlowControl) -> Result<()> {
        self.inner.set_baud(baud, flow_control)
    }

    fn dispose(&mut self) {
        self.inner.dispose()
    }
}

/// One outgoing block: header, padded data, and (once negotiated) its
/// checksum trailer.
struct Block {
    is_short: bool,
    header: [u8; HEADER_BYTES],
    data: Vec<u8>,
    check: Vec<u8>,
}

impl Block {
    fn load(image: &[u8], blk: u8, force_128: bool) -> (Self, usize) {
        let is_short = force_128 || image.len() <= SHORT_DATA_BYTES;
        let cap = if is_short { SHORT_DATA_BYTES } else { LONG_DATA_BYTES };
        let take = image.len().min(cap);
        let mut data = Vec::with_capacity(cap);
        data.extend_from_slice(&image[..take]);
        data.resize(cap, PAD);
        let header = [if is_short { TYPE_SHORT } else { TYPE_LONG }, blk, 255u8.wrapping_sub(blk)];
        (Block { is_short, header, data, check: Vec::new() }, take)
    }

    fn apply_check(&mut self, use_crc16: bool, crc: &CrcTable) {
        self.check = if use_crc16 {
            let c = crc.of(&self.data);
            vec![(c >> 8) as u8, (c & 0xff) as u8]
        } else {
            vec![self.data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))]
        };
    }

    fn bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header.len() + self.data.len() + self.check.len());
        out.extend_from_slice(&self.header);
        out.extend_from_slice(&self.data);
        out.extend_from_slice(&self.check);
        out
    }
}

fn go(transport: &mut dyn Transport, tty: &mut dyn Transport, image: &[u8], force_128: bool) -> Result<()> {
    let crc = CrcTable::new();
    let mut critical = CriticalControl::new();

    let mut blk: u8 = 1;
    let (mut block, taken) = Block::load(image, blk, force_128);
    let mut remaining = &image[taken..];

    // Wait for the receiver to announce which checksum it wants.
    let use_crc16 = loop {
        match wait_byte(transport, tty, &mut critical)? {
            None => return Err(BootError::UserAbort),
            Some(NAK) => break false,
            Some(USE_CRC16) => break true,
            Some(other) => {
                tty.safe_write(&[other])?;
            }
        }
    };
    block.apply_check(use_crc16, &crc);
    log::info!("XMODEM start detected, uploading {} bytes", image.len());

    loop {
        if critical.poll_abort(tty)? {
            return Err(BootError::UserAbort);
        }
        transport.safe_write(&block.bytes())?;

        let ack = wait_byte(transport, tty, &mut critical)?;
        match ack {
            None => return Err(BootError::UserAbort),
            Some(ACK) => {
                if remaining.is_empty() {
                    break;
                }
                blk = blk.wrapping_add(1);
                let (next, taken) = Block::load(remaining, blk, force_128);
                remaining = &remaining[taken..];
                block = next;
                block.apply_check(use_crc16, &crc);
            }
            Some(_) => {
                // Anything but ACK means resend the same block.
            }
        }
    }

    transport.safe_write(&[EOT])?;
    log::info!("XMODEM complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_replays_bytes_the_reactor_already_read() {
        use crate::test_support::VecTransport;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"HI").unwrap();
        let mut spec = StageSpec::new(crate::stage::ProtocolKind::Xmodem);
        spec.file = Some(file.reopen().unwrap());

        // Nothing further is queued on the transport: the only NAK byte
        // this run will ever see is the one the reactor already drained
        // into `tick_bytes` before calling `transfer`.
        let mut serial = VecTransport::with_inbound(&[ACK]);
        let mut tty = VecTransport::new();
        let tick_bytes = [NAK];

        let mut state = XmodemState::new(false);
        let rv = state.transfer(&mut serial, &mut tty, &mut spec, &tick_bytes).unwrap();
        assert_eq!(rv, 1, "the replayed NAK must still select the checksum variant and proceed");
        assert_eq!(*serial.out.last().unwrap(), EOT);
    }

    #[test]
    fn short_block_always_used_when_forced() {
        let image = vec![1u8; 500];
        let (block, taken) = Block::load(&image, 1, true);
        assert!(block.is_short);
        assert_eq!(taken, SHORT_DATA_BYTES);
        assert_eq!(block.data.len(), SHORT_DATA_BYTES);
    }

    #[test]
    fn small_image_fits_in_one_short_block_unforced() {
        let image = vec![1u8; 40];
        let (block, taken) = Block::load(&image, 1, false);
        assert!(block.is_short);
        assert_eq!(taken, 40);
        assert_eq!(block.data[39], 1);
        assert_eq!(block.data[40], PAD);
    }

    #[test]
    fn large_image_uses_long_block_unforced() {
        let image = vec![2u8; 2048];
        let (block, taken) = Block::load(&image, 1, false);
        assert!(!block.is_short);
        assert_eq!(taken, LONG_DATA_BYTES);
    }

    #[test]
    fn crc16_checksum_matches_shared_table() {
        let mut block = Block { is_short: true, header: [TYPE_SHORT, 1, 254], data: b"123456789".to_vec(), check: vec![] };
        block.data.resize(SHORT_DATA_BYTES, PAD);
        let crc = CrcTable::new();
        block.apply_check(true, &crc);
        assert_eq!(block.check.len(), 2);
    }

    #[test]
    fn sum_checksum_is_one_byte() {
        let mut block = Block { is_short: true, header: [TYPE_SHORT, 1, 254], data: vec![1, 2, 3], check: vec![] };
        let crc = CrcTable::new();
        block.apply_check(false, &crc);
        assert_eq!(block.check, vec![6u8]);
    }

    #[test]
    fn single_block_crc16_transfer_matches_the_worked_example() {
        use crate::test_support::{init_test_logging, VecTransport};

        init_test_logging();
        let image = b"HELLO\n".to_vec();
        let mut serial = VecTransport::with_inbound(&[USE_CRC16, ACK]);
        let mut tty = VecTransport::new();

        go(&mut serial, &mut tty, &image, false).unwrap();

        let crc = CrcTable::new();
        let mut expected = vec![TYPE_SHORT, 1, 254];
        expected.extend_from_slice(&image);
        expected.resize(3 + SHORT_DATA_BYTES, PAD);
        let check = crc.of(&expected[3..]);
        expected.push((check >> 8) as u8);
        expected.push((check & 0xff) as u8);
        expected.push(EOT);

        assert_eq!(serial.out, expected);
    }

    #[test]
    fn two_hundred_byte_image_splits_into_two_short_blocks() {
        use crate::test_support::VecTransport;

        let image = vec![0x42u8; 200];
        // C (crc16), then ACK after block 1, then ACK after block 2.
        let mut serial = VecTransport::with_inbound(&[USE_CRC16, ACK, ACK]);
        let mut tty = VecTransport::new();

        go(&mut serial, &mut tty, &image, true).unwrap();

        // header(3) + data(128) + crc(2) per block, twice, then EOT.
        let block_len = HEADER_BYTES + SHORT_DATA_BYTES + 2;
        assert_eq!(serial.out.len(), 2 * block_len + 1);
        assert_eq!(serial.out[0], TYPE_SHORT);
        assert_eq!(serial.out[1], 1);
        assert_eq!(serial.out[block_len], TYPE_SHORT);
        assert_eq!(serial.out[block_len + 1], 2);
        assert_eq!(*serial.out.last().unwrap(), EOT);
    }

    #[test]
    fn garbage_byte_during_ack_wait_triggers_a_resend() {
        use crate::test_support::VecTransport;

        let image = vec![0xAAu8; 10];
        // 'C', then a garbage byte instead of ACK, then ACK.
        let mut serial = VecTransport::with_inbound(&[USE_CRC16, 0x00, ACK]);
        let mut tty = VecTransport::new();

        go(&mut serial, &mut tty, &image, false).unwrap();

        let block_len = HEADER_BYTES + SHORT_DATA_BYTES + 2;
        // The same block went out twice before the EOT.
        assert_eq!(serial.out.len(), 2 * block_len + 1);
        assert_eq!(&serial.out[..block_len], &serial.out[block_len..2 * block_len]);
    }
}
