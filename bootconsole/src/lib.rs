//! Core library for the multi-protocol serial firmware upload console:
//! wire protocols, boot-stage sequencing, line-end/control-key handling,
//! and the interactive reactor that ties them together. The CLI crate
//! is a thin argument-parsing shell over this crate.

pub mod console;
pub mod control;
pub mod crc;
pub mod error;
pub mod lineend;
pub mod protocols;
pub mod srec;
pub mod stage;
#[cfg(test)]
mod test_support;
pub mod transport;
pub mod tty;

pub use console::Context;
pub use error::{BootError, Result};
pub use stage::{ProtocolKind, Stage, StageSequencer, StageSpec};
pub use transport::{FlowControl, SerialTransport, Transport, TtyIo};
pub use tty::RawTty;
