//! Command-line entry point: parses options into a stage list, opens the
//! serial transport and local tty, and runs the console reactor.

mod args;

use std::fs::OpenOptions;
use std::os::unix::io::RawFd;

use bootconsole::stage::{ProtocolKind, Stage, StageSequencer, StageSpec};
use bootconsole::{Context, RawTty, SerialTransport};

const STDIN_FD: RawFd = 0;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let argv: Vec<String> = std::env::args().skip(1).collect();
    let mut parsed = args::parse(argv)?;

    if parsed.stages.is_empty() {
        let mut spec = StageSpec::new(ProtocolKind::Grouch);
        spec.baud = parsed.final_baud.take().unwrap_or(0);
        parsed.stages.push(spec);
    }

    let initial_baud = parsed.stages[0].baud;
    let transport = SerialTransport::open(&parsed.serial_path, initial_baud)?;
    log::info!("opened serial transport {}", parsed.serial_path);

    let log_file = match parsed.log_path {
        Some(path) => Some(OpenOptions::new().create(true).append(true).open(&path)?),
        None => None,
    };

    let raw_tty = RawTty::enable(STDIN_FD)?;

    let stages: Vec<Stage> = parsed.stages.into_iter().map(Stage::new).collect();
    let sequencer = StageSequencer::new(stages)?;

    let mut ctx = Context::new(Box::new(transport), raw_tty, log_file, sequencer, &parsed.lineend, parsed.final_baud)?;

    let rv = ctx.run()?;
    ctx.dispose();

    if rv < 0 {
        std::process::exit(1);
    }
    Ok(())
}
