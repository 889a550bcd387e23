pub mod asm;
pub mod bus;
pub mod control;
pub mod cosim;
pub mod cpu;
pub mod decoder;
pub mod devices;
pub mod dram;
pub mod emulator;
pub mod interrupt_pipe;
pub mod loader;
pub mod mmu;
pub mod scheduler;
pub mod trace;

use thiserror::Error;

pub use cpu::{FaultReason, FaultRecord, HardwareThread};
pub use emulator::{Core, CoreConfig, RunOutcome};
pub use trace::CommitEvent;

/// Host-fatal conditions.
///
/// Guest-visible faults never show up here; they are dispatched to the
/// guest's handlers. Anything in this enum ends the simulation session.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("Invalid memory access: {0}")]
    Memory(#[from] dram::MemoryError),

    #[error("Unsupported {width}-byte access to I/O region at {address:#010x}")]
    UnsupportedIoAccess { address: u32, width: u32 },

    #[error("Thread {thread}: {reason} at pc {pc:#010x} (address {address:#010x}) with no fault handler registered")]
    NoFaultHandler {
        thread: usize,
        pc: u32,
        reason: FaultReason,
        address: u32,
    },

    #[error("Thread {thread}: TLB miss at pc {pc:#010x} for address {address:#010x} with no TLB miss handler registered")]
    NoTlbMissHandler { thread: usize, pc: u32, address: u32 },

    #[error("COSIM MISMATCH, thread {thread} pc {pc:#010x}\nReference: {expected}\nEmulator:  {actual}")]
    CosimMismatch {
        thread: usize,
        pc: u32,
        expected: String,
        actual: String,
    },

    #[error("Thread {thread} produced no event, was expecting: {expected}")]
    CosimNoEvent { thread: usize, expected: String },

    #[error("Reference halted, but emulator thread {thread} is still running: {event}")]
    CosimStillRunning { thread: usize, event: String },

    #[error("Reference store at pc {pc:#010x} has unsupported width {size}")]
    CosimBadStore { pc: u32, size: u32 },

    #[error("Malformed cosimulation line {line}: {text}")]
    CosimParse { line: usize, text: String },

    #[error("No schedulable thread, blocked thread mask {blocked:#x}")]
    Deadlock { blocked: u32 },

    #[error("Invalid hardware thread {0}")]
    InvalidThread(usize),

    #[error(transparent)]
    Load(#[from] loader::LoadError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
