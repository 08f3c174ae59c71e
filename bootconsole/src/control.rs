//! In-band `C-a` control-key handling shared by the protocol send loops
//! (which only care about the abort sequence) and the full console
//! keymap (which handles the whole command set in console mode).

use crate::error::Result;
use crate::transport::Transport;

/// The reduced control-sequence watcher used while a protocol's own
/// blocking send loop is running. Mirrors `utils_check_critical_control`:
/// only `C-a x` is honored, every other suffix is silently dropped.
#[derive(Default)]
pub struct CriticalControl {
    armed: bool,
}

impl CriticalControl {
    pub fn new() -> Self {
        CriticalControl { armed: false }
    }

    /// Reads at most one byte from the local tty (non-blocking) and
    /// reports whether this call just observed `C-a x`.
    pub fn poll_abort(&mut self, tty: &mut dyn Transport) -> Result<bool> {
        let mut byte = [0u8; 1];
        let n = tty.read(&mut byte)?;
        if n != 1 {
            return Ok(false);
        }
        if !self.armed && byte[0] == 0x01 {
            self.armed = true;
            return Ok(false);
        }
        if self.armed {
            self.armed = false;
            if byte[0] == b'x' {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// States of the full console control-key keymap (`C-a` prefix, then a
/// command byte, with `e` additionally reading a two-character line-end
/// escape sequence).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Ground,
    Armed,
    LineEndPrefix,
    LineEndFinal { tag: u8 },
}

/// One decoded action from the control-key keymap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    /// Byte should be passed through the translator to the serial link.
    Literal(u8),
    Help,
    EasterEgg,
    CycleGroan,
    ListStages,
    Continue,
    Terminate,
    Next,
    Previous,
    Select(u8),
    LineEnd(u8, u8),
    LineEndUnknown(u8, u8),
    /// Still inside the `C-a` prefix protocol; nothing to do yet.
    Pending,
}

/// Drives `ControlState` over one input byte, returning the action to
/// take and the next state.
pub struct ControlKeyFsm {
    state: ControlState,
}

impl ControlKeyFsm {
    pub fn new() -> Self {
        ControlKeyFsm { state: ControlState::Ground }
    }

    pub fn feed(&mut self, byte: u8) -> ControlAction {
        match self.state {
            ControlState::Ground => {
                if byte == 0x01 {
                    self.state = ControlState::Armed;
                    ControlAction::Pending
                } else {
                    ControlAction::Literal(byte)
                }
            }
            ControlState::Armed => {
                self.state = ControlState::Ground;
                match byte {
                    b'h' => ControlAction::Help,
                    b's' => ControlAction::EasterEgg,
                    b'g' => ControlAction::CycleGroan,
                    b'l' => ControlAction::ListStages,
                    b'c' => ControlAction::Continue,
                    b'x' => ControlAction::Terminate,
                    b'n' => ControlAction::Next,
                    b'p' => ControlAction::Previous,
                    b'0'..=b'9' => ControlAction::Select(byte - b'0'),
                    b'e' => {
                        self.state = ControlState::LineEndPrefix;
                        ControlAction::Pending
                    }
                    0x01 => ControlAction::Literal(0x01),
                    other => ControlAction::Literal(other),
                }
            }
            ControlState::LineEndPrefix => {
                self.state = ControlState::LineEndFinal { tag: byte };
                ControlAction::Pending
            }
            ControlState::LineEndFinal { tag } => {
                self.state = ControlState::Ground;
                if crate::lineend::by_escape(tag, byte).is_some() {
                    ControlAction::LineEnd(tag, byte)
                } else {
                    ControlAction::LineEndUnknown(tag, byte)
                }
            }
        }
    }
}

impl Default for ControlKeyFsm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_byte_passes_through() {
        let mut fsm = ControlKeyFsm::new();
        assert_eq!(fsm.feed(b'A'), ControlAction::Literal(b'A'));
    }

    #[test]
    fn terminate_sequence() {
        let mut fsm = ControlKeyFsm::new();
        assert_eq!(fsm.feed(0x01), ControlAction::Pending);
        assert_eq!(fsm.feed(b'x'), ControlAction::Terminate);
    }

    #[test]
    fn select_stage_digit() {
        let mut fsm = ControlKeyFsm::new();
        fsm.feed(0x01);
        assert_eq!(fsm.feed(b'7'), ControlAction::Select(7));
    }

    #[test]
    fn lineend_escape_round_trip() {
        let mut fsm = ControlKeyFsm::new();
        fsm.feed(0x01);
        assert_eq!(fsm.feed(b'e'), ControlAction::Pending);
        assert_eq!(fsm.feed(b'n'), ControlAction::Pending);
        assert_eq!(fsm.feed(b'l'), ControlAction::LineEnd(b'n', b'l'));
    }

    #[test]
    fn unknown_lineend_escape_is_reported() {
        let mut fsm = ControlKeyFsm::new();
        fsm.feed(0x01);
        fsm.feed(b'e');
        fsm.feed(b'z');
        assert_eq!(fsm.feed(b'z'), ControlAction::LineEndUnknown(b'z', b'z'));
    }

    #[test]
    fn returns_to_ground_after_any_command() {
        let mut fsm = ControlKeyFsm::new();
        fsm.feed(0x01);
        fsm.feed(b'h');
        assert_eq!(fsm.feed(b'B'), ControlAction::Literal(b'B'));
    }
}
