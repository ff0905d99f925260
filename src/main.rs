mod chip8;
mod driver;
mod emulator;
mod errors;
mod rom;

use std::cell::RefCell;
use std::error::Error;
use std::process::ExitCode;

use driver::termion::Termion;
use emulator::Emulator;

// Command line arguments
struct Args {
    rom: String,
    diagnostics: bool,
    emu_clock_hz: u32,
}

fn parse_args() -> Result<Args, lexopt::Error> {
    use lexopt::prelude::*;

    let help_msg = "\
USAGE:
    crisp8 [OPTIONS] <ROM>

ARGS:
    <ROM>    Filepath to the CHIP-8 ROM to be read by the interpreter. A
             list of ROMs released to the public domain can be found at:
                 - https://zophar.net/pdroms/chip8/chip-8-games-pack.html
                 - https://johnearnest.github.io/chip8Archive/?sort=platform

OPTIONS:
    -h, --help          Print this help message.
    -d, --debug         Show the diagnostic panel: ticks, current opcode and
                          mnemonic, PC, I, V0-V2, stack top, and key states.
    -f, --freq=NUM      Set the instruction rate of the interpreter (Hz) to
                          uint NUM in the range 1-2000. (default: 600)

KEYMAP:
    +---+---+---+---+
    | 1 | 2 | 3 | 4 |
    +---+---+---+---+
    | Q | W | E | R |
    +---+---+---+---+
    | A | S | D | F |
    +---+---+---+---+
    | Z | X | C | V |
    +---+---+---+---+    Esc or ^C quits.";

    let mut rom = None;
    let mut diagnostics = false;
    let mut emu_clock_hz = emulator::DEFAULT_CLOCK_FREQ as u32;

    let mut parser = lexopt::Parser::from_env();

    while let Some(arg) = parser.next()? {
        match arg {
            Short('d') | Long("debug") => {
                diagnostics = true;
            }
            Short('f') | Long("freq") => {
                emu_clock_hz = parser.value()?.parse()?;
                if !(1..=2000).contains(&emu_clock_hz) {
                    return Err("out of bounds value for option '--freq'".into());
                }
            }
            Value(path) if rom.is_none() => {
                rom = Some(path.string()?);
            }

            Short('h') | Long("help") => {
                println!("{}", help_msg);
                std::process::exit(0);
            }
            _ => return Err(arg.unexpected()),
        }
    }

    Ok(Args {
        rom: rom.ok_or(
            "missing argument <ROM>\n
  Refer to --help for more information",
        )?,
        diagnostics,
        emu_clock_hz,
    })
}

// The terminal is only borrowed for the interpreter's lifetime: the
// alternate screen is restored when `tui` drops at the end of this scope,
// so callers can print errors to a sane terminal afterwards.
fn interpret(args: &Args) -> Result<(), Box<dyn Error>> {
    let tui = RefCell::new(Termion::new());
    let mut emu = Emulator::with_peripherals(&tui, &tui, &tui);
    emu.set_clock_speed(args.emu_clock_hz as f32);
    emu.set_diagnostics(args.diagnostics);
    emu.load_program(&args.rom)?;
    emu.run()?;

    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(err) => {
            eprintln!("error: {err}\n  Refer to --help for more information");
            return ExitCode::FAILURE;
        }
    };

    match interpret(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("fatal: {err}");
            ExitCode::FAILURE
        }
    }
}
