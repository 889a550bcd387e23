use thiserror::Error;

/// Host-side memory access errors.
///
/// These never reach the guest: the address space turns them into
/// host-fatal `SimError`s.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Out-of-bounds memory access at {0:#010x}")]
    OutOfBounds(u32),

    #[error("Misaligned access at {0:#010x}")]
    InvalidAlignment(u32),
}

/// Flat byte-addressable physical memory starting at address zero.
pub struct Dram {
    pub data: Vec<u8>,
}

impl Dram {
    /// Create a zero-initialised memory image of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self { data: vec![0; size] }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn contains(&self, addr: u32, len: usize) -> bool {
        (addr as usize)
            .checked_add(len)
            .map_or(false, |end| end <= self.data.len())
    }

    fn check_bounds(&self, addr: u32, size: usize) -> Result<usize, MemoryError> {
        if !self.contains(addr, size) {
            return Err(MemoryError::OutOfBounds(addr));
        }
        Ok(addr as usize)
    }

    fn check_aligned(addr: u32, size: u32) -> Result<(), MemoryError> {
        if addr % size != 0 {
            return Err(MemoryError::InvalidAlignment(addr));
        }
        Ok(())
    }

    pub fn load_8(&self, addr: u32) -> Result<u8, MemoryError> {
        let off = self.check_bounds(addr, 1)?;
        Ok(self.data[off])
    }

    pub fn load_16(&self, addr: u32) -> Result<u16, MemoryError> {
        Self::check_aligned(addr, 2)?;
        let off = self.check_bounds(addr, 2)?;
        Ok(u16::from_le_bytes([self.data[off], self.data[off + 1]]))
    }

    pub fn load_32(&self, addr: u32) -> Result<u32, MemoryError> {
        Self::check_aligned(addr, 4)?;
        let off = self.check_bounds(addr, 4)?;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.data[off..off + 4]);
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn store_8(&mut self, addr: u32, value: u8) -> Result<(), MemoryError> {
        let off = self.check_bounds(addr, 1)?;
        self.data[off] = value;
        Ok(())
    }

    pub fn store_16(&mut self, addr: u32, value: u16) -> Result<(), MemoryError> {
        Self::check_aligned(addr, 2)?;
        let off = self.check_bounds(addr, 2)?;
        self.data[off..off + 2].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn store_32(&mut self, addr: u32, value: u32) -> Result<(), MemoryError> {
        Self::check_aligned(addr, 4)?;
        let off = self.check_bounds(addr, 4)?;
        self.data[off..off + 4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Write an arbitrary slice starting at `addr`.
    pub fn write_bytes(&mut self, addr: u32, data: &[u8]) -> Result<(), MemoryError> {
        let off = self.check_bounds(addr, data.len())?;
        self.data[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn read_bytes(&self, addr: u32, len: usize) -> Result<&[u8], MemoryError> {
        let off = self.check_bounds(addr, len)?;
        Ok(&self.data[off..off + len])
    }

    pub fn zero_range(&mut self, addr: u32, len: usize) -> Result<(), MemoryError> {
        let off = self.check_bounds(addr, len)?;
        self.data[off..off + len].fill(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_endian_word_access() {
        let mut dram = Dram::new(64);
        dram.store_32(8, 0x1122_3344).unwrap();
        assert_eq!(dram.load_8(8).unwrap(), 0x44);
        assert_eq!(dram.load_16(10).unwrap(), 0x1122);
        assert_eq!(dram.load_32(8).unwrap(), 0x1122_3344);
    }

    #[test]
    fn rejects_out_of_bounds_and_misaligned() {
        let mut dram = Dram::new(16);
        assert_eq!(dram.load_32(16), Err(MemoryError::OutOfBounds(16)));
        assert_eq!(dram.store_16(3, 1), Err(MemoryError::InvalidAlignment(3)));
        assert_eq!(dram.write_bytes(14, &[0; 4]), Err(MemoryError::OutOfBounds(14)));
        assert!(!dram.contains(u32::MAX, 2));
    }
}
