//! Hardware thread model: register file, exception controller, ALU and the
//! fetch/decode/execute step.

mod alu;
mod execution;
mod fault;
mod thread;

pub use execution::ExecContext;
pub use fault::{ExceptionState, FaultReason, FaultRecord};
pub use thread::{HardwareThread, ThreadState, NUM_REGISTERS, REG_LINK, REG_PC};
