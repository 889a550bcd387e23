use crate::dram::Dram;
use crate::SimError;

/// Start of the memory-mapped I/O window. Everything from here to the top
/// of the 32-bit space is dispatched to the attached [`IoDevice`].
pub const IO_REGION_BASE: u32 = 0xffff_0000;

/// Base of the framebuffer region used by display-producing workloads.
/// The emulator treats it as ordinary memory.
pub const FRAMEBUFFER_BASE: u32 = 0x0020_0000;

/// Size of a cache line, which is also the width of a vector register.
pub const CACHE_LINE_SIZE: u32 = 64;

pub const NUM_VECTOR_LANES: usize = 16;

/// Side effects a device write can request from the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEffect {
    /// Start every thread whose bit is set.
    ResumeThreads(u32),
    /// Stop every thread whose bit is set.
    HaltThreads(u32),
    /// The writing thread waits until `participants` threads have arrived.
    BarrierWait { participants: u32 },
}

/// Capability interface for the I/O window.
///
/// Offsets are relative to [`IO_REGION_BASE`]. Accesses are always 32 bits
/// wide by the time they get here.
pub trait IoDevice {
    fn read(&mut self, offset: u32) -> u32;

    fn write(&mut self, offset: u32, value: u32) -> Option<IoEffect>;

    /// Next byte the guest sent to the serial port, if any.
    fn pop_serial(&mut self) -> Option<u8> {
        None
    }

    /// Next byte the guest sent to the host-interrupt register, if any.
    fn pop_host_interrupt(&mut self) -> Option<u8> {
        None
    }
}

/// Per-thread link addresses for `load_sync` / `store_sync`.
pub struct SyncMonitor {
    links: Vec<Option<u32>>,
}

impl SyncMonitor {
    pub fn new(threads: usize) -> Self {
        Self {
            links: vec![None; threads],
        }
    }

    fn line(addr: u32) -> u32 {
        addr & !(CACHE_LINE_SIZE - 1)
    }

    pub fn link(&mut self, thread: usize, addr: u32) {
        self.links[thread] = Some(Self::line(addr));
    }

    pub fn is_linked(&self, thread: usize, addr: u32) -> bool {
        self.links[thread] == Some(Self::line(addr))
    }

    /// Break every link that covers `addr`.
    pub fn invalidate(&mut self, addr: u32) {
        let line = Self::line(addr);
        for link in self.links.iter_mut() {
            if *link == Some(line) {
                *link = None;
            }
        }
    }

    pub fn clear(&mut self, thread: usize) {
        self.links[thread] = None;
    }
}

/// Physical address space shared by every hardware thread.
///
/// Memory below the I/O window is backed by [`Dram`]; the window itself is
/// delegated to the attached device. An access that hits neither is a
/// host-fatal error, not a guest fault.
pub struct AddressSpace {
    pub dram: Dram,
    pub sync: SyncMonitor,
    io: Box<dyn IoDevice>,
    effects: Vec<IoEffect>,
}

impl AddressSpace {
    pub fn new(memory_size: usize, threads: usize, io: Box<dyn IoDevice>) -> Self {
        Self {
            dram: Dram::new(memory_size),
            sync: SyncMonitor::new(threads),
            io,
            effects: Vec::new(),
        }
    }

    pub fn is_io(addr: u32) -> bool {
        addr >= IO_REGION_BASE
    }

    pub fn io_mut(&mut self) -> &mut dyn IoDevice {
        self.io.as_mut()
    }

    /// Drain the device side effects produced since the last call.
    pub fn take_effects(&mut self) -> Vec<IoEffect> {
        std::mem::take(&mut self.effects)
    }

    fn io_read(&mut self, addr: u32, width: u32) -> u32 {
        let offset = (addr - IO_REGION_BASE) & !3;
        let word = self.io.read(offset);
        let shift = (addr & 3) * 8;
        match width {
            1 => (word >> shift) & 0xff,
            2 => (word >> shift) & 0xffff,
            _ => word,
        }
    }

    fn io_write(&mut self, addr: u32, value: u32) {
        let offset = (addr - IO_REGION_BASE) & !3;
        if let Some(effect) = self.io.write(offset, value) {
            self.effects.push(effect);
        }
    }

    pub fn read8(&mut self, addr: u32) -> Result<u32, SimError> {
        if Self::is_io(addr) {
            return Ok(self.io_read(addr, 1));
        }
        Ok(self.dram.load_8(addr)? as u32)
    }

    pub fn read16(&mut self, addr: u32) -> Result<u32, SimError> {
        if Self::is_io(addr) {
            return Ok(self.io_read(addr, 2));
        }
        Ok(self.dram.load_16(addr)? as u32)
    }

    pub fn read32(&mut self, addr: u32) -> Result<u32, SimError> {
        if Self::is_io(addr) {
            return Ok(self.io_read(addr, 4));
        }
        Ok(self.dram.load_32(addr)?)
    }

    pub fn write8(&mut self, addr: u32, value: u32) -> Result<(), SimError> {
        self.sync.invalidate(addr);
        if Self::is_io(addr) {
            self.io_write(addr, value & 0xff);
            return Ok(());
        }
        Ok(self.dram.store_8(addr, value as u8)?)
    }

    pub fn write16(&mut self, addr: u32, value: u32) -> Result<(), SimError> {
        self.sync.invalidate(addr);
        if Self::is_io(addr) {
            self.io_write(addr, value & 0xffff);
            return Ok(());
        }
        Ok(self.dram.store_16(addr, value as u16)?)
    }

    pub fn write32(&mut self, addr: u32, value: u32) -> Result<(), SimError> {
        self.sync.invalidate(addr);
        if Self::is_io(addr) {
            self.io_write(addr, value);
            return Ok(());
        }
        Ok(self.dram.store_32(addr, value)?)
    }

    /// Read a full cache line. `addr` must be line aligned.
    pub fn read_line(&mut self, addr: u32) -> Result<[u32; NUM_VECTOR_LANES], SimError> {
        if Self::is_io(addr) {
            return Err(SimError::UnsupportedIoAccess {
                address: addr,
                width: CACHE_LINE_SIZE,
            });
        }
        let mut values = [0u32; NUM_VECTOR_LANES];
        for (lane, value) in values.iter_mut().enumerate() {
            *value = self.dram.load_32(addr + lane as u32 * 4)?;
        }
        Ok(values)
    }

    /// Write the lanes of a cache line selected by `mask`.
    pub fn write_line(
        &mut self,
        addr: u32,
        mask: u32,
        values: &[u32; NUM_VECTOR_LANES],
    ) -> Result<(), SimError> {
        if Self::is_io(addr) {
            return Err(SimError::UnsupportedIoAccess {
                address: addr,
                width: CACHE_LINE_SIZE,
            });
        }
        if !self.dram.contains(addr, CACHE_LINE_SIZE as usize) {
            return Err(crate::dram::MemoryError::OutOfBounds(addr).into());
        }
        self.sync.invalidate(addr);
        for (lane, value) in values.iter().enumerate() {
            if mask & (1 << lane) != 0 {
                self.dram.store_32(addr + lane as u32 * 4, *value)?;
            }
        }
        Ok(())
    }
}
