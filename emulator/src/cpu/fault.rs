use super::HardwareThread;
use crate::control::{FLAG_INTERRUPT_EN, FLAG_MMU_EN, FLAG_SUPERVISOR_EN};
use crate::SimError;
use std::fmt;

/// Reason codes reported in the fault reason control register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FaultReason {
    IllegalInstruction = 1,
    DataAlignment = 2,
    Interrupt = 3,
    IfetchAlignment = 4,
    ItlbMiss = 5,
    DtlbMiss = 6,
    IllegalWrite = 7,
    DataSupervisor = 8,
    IfetchSupervisor = 9,
    PrivilegedOp = 10,
    Syscall = 11,
    NotExecutable = 12,
}

impl FaultReason {
    pub fn code(self) -> u32 {
        self as u32
    }

    /// TLB misses go to their own handler with translation switched off.
    pub fn is_tlb_miss(self) -> bool {
        matches!(self, FaultReason::ItlbMiss | FaultReason::DtlbMiss)
    }
}

impl fmt::Display for FaultReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultReason::IllegalInstruction => "illegal instruction",
            FaultReason::DataAlignment => "data alignment fault",
            FaultReason::Interrupt => "interrupt",
            FaultReason::IfetchAlignment => "instruction fetch alignment fault",
            FaultReason::ItlbMiss => "ITLB miss",
            FaultReason::DtlbMiss => "DTLB miss",
            FaultReason::IllegalWrite => "write to read-only page",
            FaultReason::DataSupervisor => "supervisor data access",
            FaultReason::IfetchSupervisor => "supervisor instruction fetch",
            FaultReason::PrivilegedOp => "privileged operation",
            FaultReason::Syscall => "syscall",
            FaultReason::NotExecutable => "fetch from non-executable page",
        };
        write!(f, "{} ({})", name, self.code())
    }
}

/// Where a thread stands with respect to fault handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionState {
    Normal,
    /// A handler has been entered and has not yet executed `eret`.
    FaultDispatch,
}

/// One guest-visible fault.
///
/// The executor fills in the reason, PC, address and lane; `flags` and
/// `previous_flags` are filled in by dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRecord {
    pub reason: FaultReason,
    /// Value loaded into the fault PC register.
    pub pc: u32,
    pub address: u32,
    /// Lane that faulted in a multi-lane memory access.
    pub subcycle: u32,
    /// Flags the handler starts with.
    pub flags: u32,
    /// Flags in effect when the fault was raised.
    pub previous_flags: u32,
}

impl FaultRecord {
    pub fn new(reason: FaultReason, pc: u32, address: u32) -> Self {
        Self {
            reason,
            pc,
            address,
            subcycle: 0,
            flags: 0,
            previous_flags: 0,
        }
    }

    pub fn with_subcycle(mut self, lane: usize) -> Self {
        self.subcycle = lane as u32;
        self
    }
}

impl HardwareThread {
    /// Enter the handler registered for `record.reason`.
    ///
    /// A fault with no registered handler is host-fatal and leaves the
    /// thread untouched.
    pub(crate) fn dispatch_fault(&mut self, mut record: FaultRecord) -> Result<(), SimError> {
        let tlb_miss = record.reason.is_tlb_miss();
        let handler = if tlb_miss {
            self.cr.tlb_miss_handler.ok_or(SimError::NoTlbMissHandler {
                thread: self.id,
                pc: record.pc,
                address: record.address,
            })?
        } else {
            self.cr.fault_handler.ok_or(SimError::NoFaultHandler {
                thread: self.id,
                pc: record.pc,
                reason: record.reason,
                address: record.address,
            })?
        };

        let cr = &mut self.cr;
        cr.saved_flags = cr.flags;
        let mut flags = (cr.flags | FLAG_SUPERVISOR_EN) & !FLAG_INTERRUPT_EN;
        if tlb_miss {
            flags &= !FLAG_MMU_EN;
        }
        cr.flags = flags;
        cr.fault_pc = record.pc;
        cr.fault_reason = record.reason.code();
        cr.fault_address = record.address;
        cr.subcycle = record.subcycle;

        record.flags = flags;
        record.previous_flags = cr.saved_flags;

        log::debug!(
            "thread {}: {} at pc {:#010x} address {:#010x}, entering handler {:#010x} (flags {:02x} -> {:02x})",
            self.id,
            record.reason,
            record.pc,
            record.address,
            handler,
            record.previous_flags,
            record.flags
        );

        self.pc = handler;
        self.exception = ExceptionState::FaultDispatch;
        self.last_fault = Some(record);
        Ok(())
    }

    /// `eret`: restore the pre-fault flags and resume at the fault PC.
    pub(crate) fn return_from_fault(&mut self) {
        self.cr.flags = self.cr.saved_flags;
        self.pc = self.cr.fault_pc;
        self.exception = ExceptionState::Normal;
    }
}
