use super::{ExceptionState, FaultRecord};
use crate::bus::NUM_VECTOR_LANES;
use crate::control::ControlRegisters;
use std::fmt::Write as _;

pub const NUM_REGISTERS: usize = 32;
/// Scalar register that aliases the program counter.
pub const REG_PC: u8 = 31;
/// Scalar register `call` writes the return address into.
pub const REG_LINK: u8 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Running,
    Halted,
    /// Parked at a barrier until enough threads arrive.
    BarrierWait,
}

/// Architectural state of one hardware thread.
pub struct HardwareThread {
    pub id: usize,
    scalar: [u32; NUM_REGISTERS],
    vector: [[u32; NUM_VECTOR_LANES]; NUM_REGISTERS],
    pub pc: u32,
    pub cr: ControlRegisters,
    pub state: ThreadState,
    pub exception: ExceptionState,
    pub interrupt_pending: bool,
    /// Most recent fault dispatched on this thread.
    pub last_fault: Option<FaultRecord>,
    pub retired: u64,
}

impl HardwareThread {
    pub fn new(id: usize, pc: u32) -> Self {
        Self {
            id,
            scalar: [0; NUM_REGISTERS],
            vector: [[0; NUM_VECTOR_LANES]; NUM_REGISTERS],
            pc,
            cr: ControlRegisters::new(),
            state: ThreadState::Halted,
            exception: ExceptionState::Normal,
            interrupt_pending: false,
            last_fault: None,
            retired: 0,
        }
    }

    pub fn is_runnable(&self) -> bool {
        self.state == ThreadState::Running
    }

    /// Read a scalar register. While an instruction executes the PC has
    /// already advanced, so reading `pc` yields the next instruction.
    pub fn scalar(&self, reg: u8) -> u32 {
        let reg = reg as usize % NUM_REGISTERS;
        if reg == REG_PC as usize {
            self.pc
        } else {
            self.scalar[reg]
        }
    }

    /// Write a scalar register. Writing `pc` is a jump.
    pub fn set_scalar(&mut self, reg: u8, value: u32) {
        let reg = reg as usize % NUM_REGISTERS;
        if reg == REG_PC as usize {
            self.pc = value;
        } else {
            self.scalar[reg] = value;
        }
    }

    pub fn vector(&self, reg: u8) -> [u32; NUM_VECTOR_LANES] {
        self.vector[reg as usize % NUM_REGISTERS]
    }

    /// Write the lanes selected by `mask`; other lanes keep their value.
    /// Returns the full register contents after the write.
    pub fn set_vector(
        &mut self,
        reg: u8,
        values: &[u32; NUM_VECTOR_LANES],
        mask: u32,
    ) -> [u32; NUM_VECTOR_LANES] {
        let lanes = &mut self.vector[reg as usize % NUM_REGISTERS];
        for (lane, value) in lanes.iter_mut().enumerate() {
            if mask & (1 << lane) != 0 {
                *value = values[lane];
            }
        }
        *lanes
    }

    /// Human-readable register dump for fatal error reports.
    pub fn dump_registers(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "thread {} pc {:08x} flags {:02x} saved flags {:02x} state {:?}",
            self.id, self.pc, self.cr.flags, self.cr.saved_flags, self.state
        );
        for row in 0..NUM_REGISTERS / 8 {
            for col in 0..8 {
                let reg = row * 8 + col;
                let _ = write!(out, "s{:<2} {:08x} ", reg, self.scalar(reg as u8));
            }
            out.push('\n');
        }
        for reg in 0..NUM_REGISTERS {
            let _ = write!(out, "v{:<2}", reg);
            for lane in self.vector[reg].iter() {
                let _ = write!(out, " {:08x}", lane);
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pc_is_a_scalar_register() {
        let mut thread = HardwareThread::new(0, 0x100);
        assert_eq!(thread.scalar(REG_PC), 0x100);
        thread.set_scalar(REG_PC, 0x200);
        assert_eq!(thread.pc, 0x200);
        thread.set_scalar(3, 7);
        assert_eq!(thread.scalar(3), 7);
    }

    #[test]
    fn masked_vector_write_keeps_other_lanes() {
        let mut thread = HardwareThread::new(0, 0);
        thread.set_vector(2, &[5; NUM_VECTOR_LANES], 0xffff);
        let after = thread.set_vector(2, &[9; NUM_VECTOR_LANES], 0x8001);
        assert_eq!(after[0], 9);
        assert_eq!(after[1], 5);
        assert_eq!(after[14], 5);
        assert_eq!(after[15], 9);
        assert_eq!(thread.vector(2), after);
    }

    #[test]
    fn threads_start_halted_with_reset_flags() {
        let thread = HardwareThread::new(3, 0);
        assert!(!thread.is_runnable());
        assert!(thread.cr.supervisor());
        assert!(!thread.cr.mmu_enabled());
        assert!(thread.dump_registers().starts_with("thread 3 pc 00000000"));
    }
}
