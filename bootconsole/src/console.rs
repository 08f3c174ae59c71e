//! The interactive console reactor (C7): a single-threaded loop that polls
//! the serial transport and the local tty together, feeding bytes through
//! the active protocol or the control-key keymap depending on mode.
//! Grounded on `up_operate_console`/`up_become_console`.

use std::fs::File;
use std::io::Write as _;
use std::time::Duration;

use crate::control::{ControlAction, ControlKeyFsm};
use crate::error::{BootError, Result};
use crate::lineend::{self, TranslationRow};
use crate::stage::{StageSequencer, TransferOutcome};
use crate::transport::{poll_readable, Transport, TtyIo};
use crate::tty::RawTty;

const GROANS: &[&str] = &[
    "Did your mother not warn you about strange escape codes?\n",
    "War never changes\n",
    "You are in a maze of twisty IPv6 addresses, all the same\n",
    "The only way to win is not to invoke escape codes at random\n",
    "Right on, Commander!\n",
];

const HELP_TEXT: &str = "\n\
bootconsole (C) Kynesim Ltd 2012-5\n\
\n\
Console help\n\
\n\
C-a h                This help message\n\
C-a l                List the boot stages\n\
C-a c                Continue paused boot\n\
C-a <digit>          Select boot stage <digit>\n\
C-a n                Select next boot stage\n\
C-a p                Select previous boot stage\n\
C-a e <c1> <c2>      Change line endings\n\
C-a x                Quit.\n\
C-a C-a              Literal C-a\n\
C-a <anything else>  Spiders?\n\
\n\
The C-a e sequence changes the line end encoding in use.  The two following\n\
characters must be 'l' for LF, 'c' for CR, or 'n' for a CRLF sequence.\n\
<c1> represents the encoding at the host end, and <c2> represents the\n\
encoding at the remote end.  For no encoding, use 'C-a e n n'.\n\n";

/// Live session state: the transport under upload, the raw-mode local
/// tty, an optional raw-capture log, the boot-stage sequencer, and
/// everything the control-key keymap needs to remember between ticks.
pub struct Context {
    transport: Box<dyn Transport>,
    tty: TtyIo,
    _raw_tty: RawTty,
    log: Option<File>,
    sequencer: StageSequencer,
    console_mode: bool,
    control_fsm: ControlKeyFsm,
    row: TranslationRow,
    hex_mode: bool,
    hexdump_scratch: Vec<u8>,
    groan_index: usize,
    /// Baud to switch to once the stage list is exhausted and the
    /// session settles into plain console mode; the trailing positional
    /// CLI argument, applied exactly once.
    final_baud: Option<u32>,
}

impl Context {
    pub fn new(
        mut transport: Box<dyn Transport>,
        raw_tty: RawTty,
        log: Option<File>,
        mut sequencer: StageSequencer,
        lineend_name: &str,
        final_baud: Option<u32>,
    ) -> Result<Self> {
        let tty = TtyIo::new(raw_tty.fd());
        let row = lineend::by_name(lineend_name)
            .ok_or_else(|| BootError::Config(format!("unknown line-end mapping '{lineend_name}'")))?;

        let console_mode = sequencer.current_enters_console();
        sequencer.current_mut().enter(&mut *transport)?;

        let mut ctx = Context {
            transport,
            tty,
            _raw_tty: raw_tty,
            log,
            sequencer,
            console_mode,
            control_fsm: ControlKeyFsm::new(),
            row,
            hex_mode: false,
            hexdump_scratch: Vec::new(),
            groan_index: 0,
            final_baud,
        };
        ctx.announce_stage(0);
        ctx.tty.safe_write(b"bootconsole: Starting terminal. C-a h for help\n")?;
        if ctx.console_mode {
            ctx.tty.safe_write(b"[[ Entering Console Mode ]]\n")?;
        }
        Ok(ctx)
    }

    pub fn set_hex_mode(&mut self, hex_mode: bool) {
        self.hex_mode = hex_mode;
    }

    /// Runs the reactor to completion, returning the final tick's
    /// outcome code (negative on termination) once one is negative.
    pub fn run(&mut self) -> Result<TransferOutcome> {
        loop {
            let rv = self.tick()?;
            if rv < 0 {
                return Ok(rv);
            }
        }
    }

    /// One reactor iteration: poll both fds (~1s), service the serial
    /// side (echo/log/protocol), then the tty side (control keys or
    /// translated passthrough). A fd that poll reports ready but then
    /// yields zero bytes has hung up (a non-blocking read can only come
    /// back empty on a truly readable fd if the peer went away).
    fn tick(&mut self) -> Result<TransferOutcome> {
        let ready = poll_readable(
            &[self.transport.poll_handle(), self.tty.poll_handle()],
            Duration::from_secs(1),
        )?;
        let (serial_ready, tty_ready) = (ready[0], ready[1]);

        if serial_ready {
            let mut buf = [0u8; 32];
            let n = self.transport.read(&mut buf)?;
            if n == 0 {
                return Ok(-1);
            }
            self.handle_serial_input(&buf[..n])?;

            if !self.console_mode {
                let rv = {
                    let stage = self.sequencer.current_mut();
                    stage.protocol_state.transfer(
                        &mut *self.transport,
                        &mut self.tty,
                        &mut stage.spec,
                        &buf[..n],
                    )?
                };
                if rv < 0 {
                    return Ok(rv);
                }
                if rv > 0 {
                    self.advance_stage()?;
                }
            }
        }

        if tty_ready {
            let mut tbuf = [0u8; 32];
            let tn = self.tty.read(&mut tbuf)?;
            if tn == 0 {
                return Ok(-1);
            }
            return self.handle_tty_input(&tbuf[..tn]);
        }

        Ok(0)
    }

    fn handle_serial_input(&mut self, raw: &[u8]) -> Result<()> {
        if !self.console_mode {
            // Downloads run byte-for-byte; no echo/hex/translation noise.
            if let Some(log) = self.log.as_mut() {
                log.write_all(raw).map_err(BootError::File)?;
            }
            return Ok(());
        }

        let hexed;
        let staged: &[u8] = if self.hex_mode {
            hexdump(raw, &mut self.hexdump_scratch);
            hexed = self.hexdump_scratch.clone();
            &hexed
        } else {
            raw
        };
        let translated = self.row.from_serial.translate_buffer(staged);

        let echo = self.sequencer.current().spec.echo;
        if echo {
            self.tty.safe_write(&translated)?;
        }
        if let Some(log) = self.log.as_mut() {
            log.write_all(&translated).map_err(BootError::File)?;
        }
        Ok(())
    }

    fn handle_tty_input(&mut self, raw: &[u8]) -> Result<TransferOutcome> {
        let mut out_buf = Vec::new();
        for &byte in raw {
            match self.control_fsm.feed(byte) {
                ControlAction::Literal(b) => {
                    out_buf.extend(self.row.to_serial.translate_buffer(&[b]));
                }
                ControlAction::Pending => {}
                ControlAction::Help => self.tty.safe_write(HELP_TEXT.as_bytes())?,
                ControlAction::EasterEgg => self.tty.safe_write(b"Oh no! Spiders!\n")?,
                ControlAction::CycleGroan => {
                    let g = GROANS[self.groan_index % GROANS.len()];
                    self.groan_index += 1;
                    self.tty.safe_write(g.as_bytes())?;
                }
                ControlAction::ListStages => self.list_stages()?,
                ControlAction::Continue => self.continue_boot()?,
                ControlAction::Terminate => return Ok(-1),
                ControlAction::Next => self.step_stage(1)?,
                ControlAction::Previous => self.step_stage(-1)?,
                ControlAction::Select(n) => self.select_stage(n as usize)?,
                ControlAction::LineEnd(tag, final_byte) => {
                    if let Some(row) = lineend::by_escape(tag, final_byte) {
                        self.row = row;
                        self.tty.safe_write(b"! bootconsole: Line end sequence changed.\n")?;
                    }
                }
                ControlAction::LineEndUnknown(tag, final_byte) => {
                    self.tty.safe_write(
                        format!(
                            "! bootconsole: Unknown line end sequence {}{}\n",
                            tag as char, final_byte as char
                        )
                        .as_bytes(),
                    )?;
                }
            }
        }
        if !out_buf.is_empty() {
            // A single best-effort write, matching the original's
            // un-retried `bio->write()` here: host keystrokes are not
            // worth stalling the reactor over.
            self.transport.write(&out_buf)?;
        }
        Ok(0)
    }

    fn advance_stage(&mut self) -> Result<()> {
        if !self.sequencer.advance() {
            self.console_mode = true;
            if let Some(baud) = self.final_baud.take() {
                self.transport.set_baud(baud, crate::transport::FlowControl::None)?;
            }
            self.tty.safe_write(b"[[ No further boot stages; entering console mode ]]\n")?;
            return Ok(());
        }
        let idx = self.sequencer.current_index();
        self.announce_stage(idx);
        self.console_mode = self.sequencer.current_enters_console();
        if self.console_mode {
            self.tty.safe_write(b"[[ Entering Console Mode ]]\n")?;
        }
        let stage = self.sequencer.current_mut();
        stage.enter(&mut *self.transport)
    }

    fn announce_stage(&mut self, idx: usize) {
        let stage = self.sequencer.current();
        let _ = self.tty.safe_write(
            format!(
                "[[ Boot stage {idx}: {} @ {} ]]\n",
                stage.spec.file_name.as_deref().unwrap_or("(no file name)"),
                stage.spec.baud
            )
            .as_bytes(),
        );
    }

    fn list_stages(&mut self) -> Result<()> {
        self.tty.safe_write(b"\n")?;
        let cur = self.sequencer.current_index();
        let mut lines = Vec::new();
        for (i, stage) in self.sequencer.list() {
            lines.push(format!(
                "[[ {} Boot stage {}: {} @ {} off {:#x} ]]\n",
                if i == cur { '*' } else { ' ' },
                i,
                stage.spec.file_name.as_deref().unwrap_or("(no file name)"),
                stage.spec.baud,
                stage.spec.offset,
            ));
        }
        self.tty.safe_write(lines.concat().as_bytes())
    }

    fn continue_boot(&mut self) -> Result<()> {
        if !self.console_mode {
            return Ok(());
        }
        // `spec.file` is consumed by protocol `prepare` (e.g. Kinetis
        // reads it into an in-memory payload at stage entry), so it is
        // gone by the time a deferred stage reaches this point; whether
        // the stage ever had an upload source at all is tracked by the
        // name instead, which outlives the handle.
        if self.sequencer.current().spec.file_name.is_none() {
            self.tty.safe_write(b"[[ No upload to continue ]]\n")
        } else {
            self.console_mode = false;
            self.tty.safe_write(b"[[ Continuing ]]\n")
        }
    }

    fn step_stage(&mut self, delta: i32) -> Result<()> {
        if !self.console_mode {
            return Ok(());
        }
        let cur = self.sequencer.current_index();
        if delta > 0 {
            if self.sequencer.at_last() {
                return self.tty.safe_write(b"[[ No next boot stage ]]\n");
            }
            self.select_stage(cur + 1)
        } else {
            if cur == 0 {
                return self.tty.safe_write(b"[[ No previous boot stage ]]\n");
            }
            self.select_stage(cur - 1)
        }
    }

    fn select_stage(&mut self, index: usize) -> Result<()> {
        if !self.console_mode {
            return Ok(());
        }
        let cur = self.sequencer.current_index();
        if index == cur {
            self.announce_stage(cur);
            return Ok(());
        }
        if !self.sequencer.select(index) {
            return Ok(());
        }
        let idx = self.sequencer.current_index();
        self.announce_stage(idx);
        let stage = self.sequencer.current_mut();
        stage.enter(&mut *self.transport)
    }

    /// Tears down the session in dependency order: transport, then the
    /// tty's raw-mode restoration (via `RawTty`'s `Drop`), then the log.
    pub fn dispose(&mut self) {
        self.transport.dispose();
    }
}

/// Rewrites non-printable bytes as bracketed hex literals (`[hh]`) into
/// an explicit scratch buffer, rather than aliasing regions of the same
/// read buffer the way the original's `hex_of` does.
fn hexdump(data: &[u8], scratch: &mut Vec<u8>) {
    scratch.clear();
    for &b in data {
        if b == b'\n' || b == b'\r' || (0x20..0x7e).contains(&b) {
            scratch.push(b);
        } else {
            scratch.push(b'[');
            scratch.extend_from_slice(format!("{b:02x}").as_bytes());
            scratch.push(b']');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hexdump_passes_printable_bytes_through() {
        let mut scratch = Vec::new();
        hexdump(b"hi\n", &mut scratch);
        assert_eq!(scratch, b"hi\n");
    }

    #[test]
    fn hexdump_escapes_control_bytes() {
        let mut scratch = Vec::new();
        hexdump(&[0x01, b'A', 0x7f], &mut scratch);
        assert_eq!(scratch, b"[01]A[7f]");
    }
}
