use crate::bus::{IoDevice, IoEffect};
use std::collections::VecDeque;

// Register offsets inside the I/O window.
pub const REG_SERIAL_STATUS: u32 = 0x18;
pub const REG_HOST_INTERRUPT: u32 = 0x1c;
pub const REG_SERIAL_OUTPUT: u32 = 0x20;
pub const REG_THREAD_RESUME: u32 = 0x60;
pub const REG_THREAD_HALT: u32 = 0x64;
pub const REG_BARRIER_WAIT: u32 = 0x70;

/// Undrained host-interrupt bytes kept before the oldest are dropped.
pub const HOST_INTERRUPT_QUEUE_LIMIT: usize = 4096;

/// Default device behind the I/O window: a write-only serial port, the
/// host-interrupt mailbox and the thread start/stop/barrier registers.
pub struct SystemDevice {
    pub serial_output: VecDeque<u8>,
    pub host_interrupts: VecDeque<u8>,
}

impl SystemDevice {
    pub fn new() -> Self {
        Self {
            serial_output: VecDeque::new(),
            host_interrupts: VecDeque::new(),
        }
    }
}

impl Default for SystemDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl IoDevice for SystemDevice {
    fn read(&mut self, offset: u32) -> u32 {
        match offset {
            // Transmitter is always ready.
            REG_SERIAL_STATUS => 1,
            _ => {
                log::warn!("read from unknown device register {:#x}", offset);
                0
            }
        }
    }

    fn write(&mut self, offset: u32, value: u32) -> Option<IoEffect> {
        match offset {
            REG_SERIAL_OUTPUT => {
                self.serial_output.push_back(value as u8);
                None
            }
            REG_HOST_INTERRUPT => {
                if self.host_interrupts.len() >= HOST_INTERRUPT_QUEUE_LIMIT {
                    self.host_interrupts.pop_front();
                }
                self.host_interrupts.push_back(value as u8);
                None
            }
            REG_THREAD_RESUME => Some(IoEffect::ResumeThreads(value)),
            REG_THREAD_HALT => Some(IoEffect::HaltThreads(value)),
            REG_BARRIER_WAIT => Some(IoEffect::BarrierWait {
                participants: value,
            }),
            _ => {
                log::warn!(
                    "write to unknown device register {:#x} value {:#010x}",
                    offset,
                    value
                );
                None
            }
        }
    }

    fn pop_serial(&mut self) -> Option<u8> {
        self.serial_output.pop_front()
    }

    fn pop_host_interrupt(&mut self) -> Option<u8> {
        self.host_interrupts.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_bytes_queue_in_order() {
        let mut dev = SystemDevice::new();
        assert_eq!(dev.write(REG_SERIAL_OUTPUT, b'o' as u32), None);
        assert_eq!(dev.write(REG_SERIAL_OUTPUT, 0x100 | b'k' as u32), None);
        assert_eq!(dev.pop_serial(), Some(b'o'));
        assert_eq!(dev.pop_serial(), Some(b'k'));
        assert_eq!(dev.pop_serial(), None);
        assert_eq!(dev.read(REG_SERIAL_STATUS), 1);
    }

    #[test]
    fn thread_control_registers_request_effects() {
        let mut dev = SystemDevice::new();
        assert_eq!(
            dev.write(REG_THREAD_RESUME, 0b1110),
            Some(IoEffect::ResumeThreads(0b1110))
        );
        assert_eq!(dev.write(REG_THREAD_HALT, 1), Some(IoEffect::HaltThreads(1)));
        assert_eq!(
            dev.write(REG_BARRIER_WAIT, 4),
            Some(IoEffect::BarrierWait { participants: 4 })
        );
        dev.write(REG_HOST_INTERRUPT, 5);
        assert_eq!(dev.pop_host_interrupt(), Some(5));
    }

    #[test]
    fn undrained_host_interrupts_are_bounded() {
        let mut dev = SystemDevice::new();
        for i in 0..HOST_INTERRUPT_QUEUE_LIMIT + 3 {
            dev.write(REG_HOST_INTERRUPT, i as u32);
        }
        assert_eq!(dev.host_interrupts.len(), HOST_INTERRUPT_QUEUE_LIMIT);
        assert_eq!(dev.pop_host_interrupt(), Some(3));
    }
}
