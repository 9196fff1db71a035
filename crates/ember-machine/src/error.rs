use crate::trap::TrapCause;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("memory access out of bounds: {0:#x}")]
    OutOfBounds(u64),

    #[error("no device mapped at {0:#x}")]
    Unmapped(u64),

    #[error("misaligned access: addr={addr:#x}, align={alignment}")]
    Misaligned { addr: u64, alignment: u64 },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid opcode in instruction {0:#010x}")]
    InvalidOpcode(u32),

    #[error("invalid instruction encoding {0:#010x}")]
    InvalidEncoding(u32),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrapError {
    #[error("machine halted")]
    Halt,

    #[error("unhandled trap: {0:?}")]
    Unhandled(TrapCause),

    #[error("trap handler failed: {0}")]
    HandlerPanic(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MachineError {
    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("trap error: {0}")]
    Trap(#[from] TrapError),
}
