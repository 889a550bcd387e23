//! Per-thread control registers and flag bits.

// Control register indices as seen by getcr/setcr.
pub const CR_THREAD_ID: u32 = 0;
pub const CR_FAULT_HANDLER: u32 = 1;
pub const CR_FAULT_PC: u32 = 2;
pub const CR_FAULT_REASON: u32 = 3;
pub const CR_FLAGS: u32 = 4;
pub const CR_FAULT_ADDRESS: u32 = 5;
pub const CR_CYCLE_COUNT: u32 = 6;
pub const CR_TLB_MISS_HANDLER: u32 = 7;
pub const CR_SAVED_FLAGS: u32 = 8;
pub const CR_CURRENT_ASID: u32 = 9;
pub const CR_SCRATCHPAD0: u32 = 11;
pub const CR_SCRATCHPAD1: u32 = 12;
pub const CR_SUBCYCLE: u32 = 13;

pub const FLAG_INTERRUPT_EN: u32 = 1 << 0;
pub const FLAG_MMU_EN: u32 = 1 << 1;
pub const FLAG_SUPERVISOR_EN: u32 = 1 << 2;
const FLAG_MASK: u32 = FLAG_INTERRUPT_EN | FLAG_MMU_EN | FLAG_SUPERVISOR_EN;

/// Flags a thread comes out of reset with.
pub const RESET_FLAGS: u32 = FLAG_SUPERVISOR_EN;

/// Control register bank owned by one hardware thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRegisters {
    pub flags: u32,
    pub saved_flags: u32,
    pub fault_handler: Option<u32>,
    pub tlb_miss_handler: Option<u32>,
    pub fault_pc: u32,
    pub fault_reason: u32,
    pub fault_address: u32,
    pub asid: u32,
    pub scratchpad: [u32; 2],
    /// Lane index of the last multi-lane memory fault.
    pub subcycle: u32,
}

impl ControlRegisters {
    pub fn new() -> Self {
        Self {
            flags: RESET_FLAGS,
            saved_flags: 0,
            fault_handler: None,
            tlb_miss_handler: None,
            fault_pc: 0,
            fault_reason: 0,
            fault_address: 0,
            asid: 0,
            scratchpad: [0; 2],
            subcycle: 0,
        }
    }

    pub fn supervisor(&self) -> bool {
        self.flags & FLAG_SUPERVISOR_EN != 0
    }

    pub fn mmu_enabled(&self) -> bool {
        self.flags & FLAG_MMU_EN != 0
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.flags & FLAG_INTERRUPT_EN != 0
    }

    /// Read a control register. `thread_id` and `cycle` back the read-only
    /// registers that are not stored per thread.
    pub fn read(&self, index: u32, thread_id: u32, cycle: u64) -> u32 {
        match index {
            CR_THREAD_ID => thread_id,
            CR_FAULT_HANDLER => self.fault_handler.unwrap_or(0),
            CR_FAULT_PC => self.fault_pc,
            CR_FAULT_REASON => self.fault_reason,
            CR_FLAGS => self.flags,
            CR_FAULT_ADDRESS => self.fault_address,
            CR_CYCLE_COUNT => cycle as u32,
            CR_TLB_MISS_HANDLER => self.tlb_miss_handler.unwrap_or(0),
            CR_SAVED_FLAGS => self.saved_flags,
            CR_CURRENT_ASID => self.asid,
            CR_SCRATCHPAD0 => self.scratchpad[0],
            CR_SCRATCHPAD1 => self.scratchpad[1],
            CR_SUBCYCLE => self.subcycle,
            _ => {
                log::warn!("read of unknown control register {}", index);
                0
            }
        }
    }

    pub fn write(&mut self, index: u32, value: u32) {
        match index {
            CR_FAULT_HANDLER => self.fault_handler = Some(value),
            CR_FAULT_PC => self.fault_pc = value,
            CR_FAULT_REASON => self.fault_reason = value,
            CR_FLAGS => self.flags = value & FLAG_MASK,
            CR_FAULT_ADDRESS => self.fault_address = value,
            CR_TLB_MISS_HANDLER => self.tlb_miss_handler = Some(value),
            CR_SAVED_FLAGS => self.saved_flags = value & FLAG_MASK,
            CR_CURRENT_ASID => self.asid = value,
            CR_SCRATCHPAD0 => self.scratchpad[0] = value,
            CR_SCRATCHPAD1 => self.scratchpad[1] = value,
            CR_SUBCYCLE => self.subcycle = value,
            CR_THREAD_ID | CR_CYCLE_COUNT => {}
            _ => log::warn!("write of unknown control register {}", index),
        }
    }
}

impl Default for ControlRegisters {
    fn default() -> Self {
        Self::new()
    }
}
