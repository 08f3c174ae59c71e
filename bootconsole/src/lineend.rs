//! Bidirectional line-end translation between LF/CR/CRLF byte streams.
//!
//! Each direction is a tiny one-byte-in state machine. A step can ask the
//! driver to call it again with a synthetic drain byte (`again`) before
//! consuming the next real input byte, and can suppress producing any
//! output at all (`output: None`).

/// Result of a single translation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub output: Option<u8>,
    pub again: bool,
}

impl Step {
    fn emit(byte: u8) -> Self {
        Step { output: Some(byte), again: false }
    }
    fn suppress() -> Self {
        Step { output: None, again: false }
    }
    fn emit_and_call_again(byte: u8) -> Self {
        Step { output: Some(byte), again: true }
    }
}

/// One direction of one line-end mapping: a pure step function plus its
/// 32-bit state word, mirroring the original single-state-word FSMs.
#[derive(Clone, Copy)]
pub struct Translator {
    state: u32,
    step: fn(u8, &mut u32) -> Step,
}

impl Translator {
    fn new(step: fn(u8, &mut u32) -> Step) -> Self {
        Translator { state: 0, step }
    }

    pub fn reset(&mut self) {
        self.state = 0;
    }

    pub fn step(&mut self, byte: u8) -> Step {
        (self.step)(byte, &mut self.state)
    }

    /// Fold this translator over a buffer, honoring the call-again drain
    /// protocol by feeding a synthetic `0` byte on each redo.
    pub fn translate_buffer(&mut self, input: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(input.len());
        for &byte in input {
            let mut result = self.step(byte);
            while result.again {
                if let Some(b) = result.output {
                    out.push(b);
                }
                result = self.step(0);
            }
            if let Some(b) = result.output {
                out.push(b);
            }
        }
        out
    }
}

fn tn_none(byte: u8, _state: &mut u32) -> Step {
    Step::emit(byte)
}

const SEEN_CR: u32 = 1;

fn tn_cr_to_crlf(byte: u8, state: &mut u32) -> Step {
    if *state == SEEN_CR {
        *state = 0;
        Step::emit(b'\n')
    } else if byte == b'\r' {
        *state = SEEN_CR;
        Step::emit_and_call_again(b'\r')
    } else {
        Step::emit(byte)
    }
}

const SEEN_LF: u32 = 1;

fn tn_lf_to_crlf(byte: u8, state: &mut u32) -> Step {
    if *state == SEEN_LF {
        *state = 0;
        Step::emit(b'\n')
    } else if byte == b'\n' {
        *state = SEEN_LF;
        Step::emit_and_call_again(b'\r')
    } else {
        Step::emit(byte)
    }
}

fn tn_crlf_to_cr(byte: u8, state: &mut u32) -> Step {
    if *state == SEEN_CR {
        *state = 0;
        if byte == b'\n' {
            Step::suppress()
        } else {
            Step::emit(byte)
        }
    } else {
        if byte == b'\r' {
            *state = SEEN_CR;
        }
        Step::emit(byte)
    }
}

fn tn_lf_to_cr(byte: u8, _state: &mut u32) -> Step {
    if byte == b'\n' {
        Step::emit(b'\r')
    } else {
        Step::emit(byte)
    }
}

const SEEN_BARE_CR: u32 = 0x8000_0000;

fn tn_crlf_to_lf(byte: u8, state: &mut u32) -> Step {
    if *state & SEEN_BARE_CR != 0 {
        let pending = (*state & 0xff) as u8;
        *state = 0;
        Step::emit(pending)
    } else if *state == SEEN_CR {
        if byte != b'\n' {
            *state = SEEN_BARE_CR | byte as u32;
            Step::emit_and_call_again(b'\r')
        } else {
            *state = 0;
            Step::emit(byte)
        }
    } else if byte == b'\r' {
        *state = SEEN_CR;
        Step::suppress()
    } else {
        Step::emit(byte)
    }
}

fn tn_cr_to_lf(byte: u8, _state: &mut u32) -> Step {
    if byte == b'\r' {
        Step::emit(b'\n')
    } else {
        Step::emit(byte)
    }
}

/// One row of the line-end translation table: a command-line name, its
/// two-character `C-a l` escape sequence, and the serial->host /
/// host->serial translator pair.
pub struct TranslationRow {
    pub name: &'static str,
    pub escape: (u8, u8),
    /// Applied to bytes arriving from the serial link before they reach
    /// the local terminal / log.
    pub from_serial: Translator,
    /// Applied to bytes typed locally before they go to the serial link.
    pub to_serial: Translator,
}

pub fn table() -> Vec<TranslationRow> {
    vec![
        TranslationRow {
            name: "crlf2cr",
            escape: (b'n', b'c'),
            from_serial: Translator::new(tn_cr_to_crlf),
            to_serial: Translator::new(tn_crlf_to_cr),
        },
        TranslationRow {
            name: "crlf2lf",
            escape: (b'n', b'l'),
            from_serial: Translator::new(tn_lf_to_crlf),
            to_serial: Translator::new(tn_crlf_to_lf),
        },
        TranslationRow {
            name: "cr2crlf",
            escape: (b'c', b'n'),
            from_serial: Translator::new(tn_crlf_to_cr),
            to_serial: Translator::new(tn_cr_to_crlf),
        },
        TranslationRow {
            name: "cr2lf",
            escape: (b'c', b'l'),
            from_serial: Translator::new(tn_lf_to_cr),
            to_serial: Translator::new(tn_cr_to_lf),
        },
        TranslationRow {
            name: "lf2crlf",
            escape: (b'l', b'n'),
            from_serial: Translator::new(tn_crlf_to_lf),
            to_serial: Translator::new(tn_lf_to_crlf),
        },
        TranslationRow {
            name: "lf2cr",
            escape: (b'l', b'c'),
            from_serial: Translator::new(tn_cr_to_lf),
            to_serial: Translator::new(tn_lf_to_cr),
        },
        TranslationRow {
            name: "none",
            escape: (b'n', b'n'),
            from_serial: Translator::new(tn_none),
            to_serial: Translator::new(tn_none),
        },
    ]
}

pub fn by_name(name: &str) -> Option<TranslationRow> {
    table().into_iter().find(|row| row.name == name)
}

pub fn by_escape(first: u8, second: u8) -> Option<TranslationRow> {
    table().into_iter().find(|row| row.escape == (first, second))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_is_identity() {
        let row = by_name("none").unwrap();
        let mut from_serial = row.from_serial;
        let mut to_serial = row.to_serial;
        let data = b"hello\r\nworld";
        assert_eq!(from_serial.translate_buffer(data), data);
        assert_eq!(to_serial.translate_buffer(data), data);
    }

    #[test]
    fn crlf2lf_serial_to_host_expands_lf() {
        let row = by_name("crlf2lf").unwrap();
        let mut from_serial = row.from_serial;
        assert_eq!(from_serial.translate_buffer(b"a\nb"), b"a\r\nb");
    }

    #[test]
    fn crlf2lf_host_to_serial_collapses_crlf() {
        let row = by_name("crlf2lf").unwrap();
        let mut to_serial = row.to_serial;
        assert_eq!(to_serial.translate_buffer(b"ABC\r\n"), b"ABC\n");
    }

    #[test]
    fn crlf2lf_round_trip_on_crlf_stream() {
        let row = by_name("crlf2lf").unwrap();
        let mut to_serial = row.to_serial;
        let mut from_serial = row.from_serial;
        let original = b"line one\r\nline two\r\n";
        let serial_form = to_serial.translate_buffer(original);
        let back = from_serial.translate_buffer(&serial_form);
        assert_eq!(back, original);
    }

    #[test]
    fn crlf_to_lf_bare_cr_is_recovered() {
        let row = by_name("crlf2lf").unwrap();
        let mut to_serial = row.to_serial;
        // A bare CR not followed by LF must still surface, followed by
        // whatever byte came next.
        assert_eq!(to_serial.translate_buffer(b"\rX"), b"\rX");
    }

    #[test]
    fn by_escape_finds_matching_row() {
        let row = by_escape(b'n', b'l').unwrap();
        assert_eq!(row.name, "crlf2lf");
        assert!(by_escape(b'z', b'z').is_none());
    }
}
