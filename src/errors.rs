use std::io;

use thiserror::Error;

/// Reasons a ROM image is rejected before the machine is ever constructed.
#[derive(Debug, Error)]
pub enum RomError {
    #[error("failed to read ROM: {0}")]
    Io(#[from] io::Error),
    #[error("ROM is {size} bytes; at most {max} fit above 0x200")]
    TooLarge { size: usize, max: usize },
}

/// Unrecoverable machine faults. The interpreter halts on any of these;
/// there is no partial-failure state to resume from.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    #[error("unrecognized opcode {0:#06X}")]
    UnknownOpcode(u16),
    #[error("CALL with all {0} stack frames in use")]
    StackOverflow(usize),
    #[error("RET with an empty call stack")]
    StackUnderflow,
}
