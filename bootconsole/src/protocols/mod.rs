//! Upload protocol engines (C4-C6): grouch, XMODEM and the Kinetis
//! bootloader protocol. The original C dispatched through a function
//! pointer table (`up_protocol_t`); here a closed `ProtocolState` enum
//! holds each engine's own typed state and the reactor dispatches by
//! matching on it directly.

mod grouch;
mod kinetis;
mod xmodem;

use std::time::Duration;

use crate::control::CriticalControl;
use crate::error::Result;
use crate::stage::{ProtocolKind, StageSpec, TransferOutcome};
use crate::transport::{poll_readable, Transport};

pub use kinetis::KinetisVariant;

/// The live state of whichever protocol a stage was built for.
pub enum ProtocolState {
    Grouch(grouch::GrouchState),
    Xmodem(xmodem::XmodemState),
    Kinetis(kinetis::KinetisState),
}

impl ProtocolState {
    pub fn new(kind: ProtocolKind) -> Self {
        match kind {
            ProtocolKind::Grouch => ProtocolState::Grouch(grouch::GrouchState::new()),
            ProtocolKind::Xmodem => ProtocolState::Xmodem(xmodem::XmodemState::new(false)),
            ProtocolKind::Xmodem128 => ProtocolState::Xmodem(xmodem::XmodemState::new(true)),
            ProtocolKind::Kinetis => {
                ProtocolState::Kinetis(kinetis::KinetisState::new(KinetisVariant::Bin))
            }
            ProtocolKind::KinetisSrec => {
                ProtocolState::Kinetis(kinetis::KinetisState::new(KinetisVariant::Srec))
            }
        }
    }

    /// Protocol-specific setup beyond the common baud/flow-control
    /// change, run once when a stage is entered. Only Kinetis needs
    /// this (it disables echo and sends the autobaud ping).
    pub fn prepare(&mut self, transport: &mut dyn Transport, spec: &mut StageSpec) -> Result<()> {
        match self {
            ProtocolState::Grouch(_) | ProtocolState::Xmodem(_) => Ok(()),
            ProtocolState::Kinetis(k) => k.prepare(transport, spec),
        }
    }

    /// Offers newly-read serial bytes to the active protocol. Returns
    /// the C-style outcome code: negative is fatal, zero means keep
    /// going, positive means the stage completed successfully.
    pub fn transfer(
        &mut self,
        transport: &mut dyn Transport,
        tty: &mut dyn Transport,
        spec: &mut StageSpec,
        buf: &[u8],
    ) -> Result<TransferOutcome> {
        match self {
            ProtocolState::Grouch(g) => g.transfer(transport, tty, spec, buf),
            ProtocolState::Xmodem(x) => x.transfer(transport, tty, spec, buf),
            ProtocolState::Kinetis(k) => k.transfer(transport, buf),
        }
    }
}

/// Blocks (politely) until a byte arrives from `transport`, or until a
/// `C-a x` is seen on `tty`. Mirrors `get_byte()` from xmodem.c and the
/// inline critical-control check in grouch.c's send loop, but polls
/// instead of busy-spinning.
pub(crate) fn wait_byte(
    transport: &mut dyn Transport,
    tty: &mut dyn Transport,
    critical: &mut CriticalControl,
) -> Result<Option<u8>> {
    loop {
        if critical.poll_abort(tty)? {
            return Ok(None);
        }
        let mut b = [0u8; 1];
        let n = transport.read(&mut b)?;
        if n == 1 {
            return Ok(Some(b[0]));
        }
        poll_readable(&[transport.poll_handle()], Duration::from_millis(200))?;
    }
}
