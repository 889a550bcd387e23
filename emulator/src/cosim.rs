//! Lock-step comparison against an external reference model.
//!
//! The reference reports each committed state change with the PC and
//! thread that produced it. For every report the emulator runs that thread
//! until it commits its own next change, and the two must agree. Threads
//! are stepped in the order the reference names them, so both models see
//! the same interleaving.

use crate::emulator::Core;
use crate::trace::{lane_mask_to_byte_mask, CommitEvent, Lanes};
use crate::SimError;
use std::collections::VecDeque;
use std::io::{BufRead, Write};

/// Instructions a thread may retire without committing anything before the
/// reference event is declared missing.
pub const MAX_STEPS_PER_EVENT: usize = 500;

/// Reference line that ends a session.
pub const HALTED_MARKER: &str = "***HALTED***";

pub struct Cosimulation<'a> {
    core: &'a mut Core,
    pending: Vec<VecDeque<CommitEvent>>,
    checked: u64,
}

impl<'a> Cosimulation<'a> {
    pub fn new(core: &'a mut Core) -> Self {
        core.set_record_events(true);
        let pending = vec![VecDeque::new(); core.thread_count()];
        Self {
            core,
            pending,
            checked: 0,
        }
    }

    /// Number of reference events matched so far.
    pub fn checked(&self) -> u64 {
        self.checked
    }

    fn collect(&mut self) {
        for event in self.core.take_events() {
            if let Some(queue) = self.pending.get_mut(event.thread()) {
                queue.push_back(event);
            }
        }
    }

    /// Next state change from `thread`, running it if nothing is queued.
    fn next_event(&mut self, thread: usize) -> Result<Option<CommitEvent>, SimError> {
        if thread >= self.pending.len() {
            return Err(SimError::InvalidThread(thread));
        }
        for _ in 0..MAX_STEPS_PER_EVENT {
            if let Some(event) = self.pending[thread].pop_front() {
                return Ok(Some(event));
            }
            if !self.core.thread(thread)?.is_runnable() {
                break;
            }
            self.core.step_thread(thread)?;
            self.collect();
        }
        Ok(self.pending[thread].pop_front())
    }

    fn check(&mut self, expected: CommitEvent) -> Result<(), SimError> {
        let thread = expected.thread();
        match self.next_event(thread)? {
            None => Err(SimError::CosimNoEvent {
                thread,
                expected: expected.to_string(),
            }),
            Some(actual) if actual.matches(&expected) => {
                self.checked += 1;
                Ok(())
            }
            Some(actual) => Err(SimError::CosimMismatch {
                thread,
                pc: expected.pc(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            }),
        }
    }

    pub fn assert_scalar_write(
        &mut self,
        pc: u32,
        thread: usize,
        reg: u8,
        value: u32,
    ) -> Result<(), SimError> {
        self.check(CommitEvent::ScalarWrite {
            pc,
            thread,
            reg,
            value,
        })
    }

    pub fn assert_vector_write(
        &mut self,
        pc: u32,
        thread: usize,
        reg: u8,
        mask: u16,
        values: &Lanes,
    ) -> Result<(), SimError> {
        self.check(CommitEvent::VectorWrite {
            pc,
            thread,
            reg,
            mask,
            values: *values,
        })
    }

    /// `mask` selects lanes of the line at `address`.
    pub fn assert_vector_store(
        &mut self,
        pc: u32,
        thread: usize,
        address: u32,
        mask: u16,
        values: &Lanes,
    ) -> Result<(), SimError> {
        self.check(CommitEvent::Store {
            pc,
            thread,
            address,
            mask: lane_mask_to_byte_mask(mask),
            values: *values,
        })
    }

    pub fn assert_scalar_store(
        &mut self,
        pc: u32,
        thread: usize,
        address: u32,
        size: u32,
        value: u32,
    ) -> Result<(), SimError> {
        if !matches!(size, 1 | 2 | 4) {
            return Err(SimError::CosimBadStore { pc, size });
        }
        self.check(CommitEvent::scalar_store(pc, thread, address, size, value))
    }

    /// The reference took an interrupt on `thread` before executing `pc`.
    pub fn assert_interrupt(&mut self, thread: usize, pc: u32) -> Result<(), SimError> {
        let current = self.core.thread(thread)?.pc;
        if current != pc {
            return Err(SimError::CosimMismatch {
                thread,
                pc,
                expected: format!("interrupt {} {:08x}", thread, pc),
                actual: format!("thread {} at {:08x}", thread, current),
            });
        }
        self.core.raise_interrupt(thread)
    }

    /// The reference has halted. Anything the emulator still has to commit
    /// is a divergence.
    pub fn finish(&mut self) -> Result<(), SimError> {
        for thread in 0..self.pending.len() {
            if let Some(event) = self.next_event(thread)? {
                return Err(SimError::CosimStillRunning {
                    thread,
                    event: event.to_string(),
                });
            }
        }
        log::info!("cosimulation passed, {} events checked", self.checked);
        Ok(())
    }

    fn handle_line(&mut self, number: usize, line: &str) -> Result<bool, SimError> {
        let parse_error = |detail: String| SimError::CosimParse {
            line: number,
            text: format!("{} ({})", line, detail),
        };

        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some("swriteback") | Some("vwriteback") | Some("store") => {
                let event = line
                    .parse::<CommitEvent>()
                    .map_err(|e| parse_error(e.to_string()))?;
                self.check(event)?;
                Ok(true)
            }
            Some("interrupt") => {
                let thread = tokens
                    .next()
                    .and_then(|t| t.parse::<usize>().ok())
                    .ok_or_else(|| parse_error("bad thread".to_string()))?;
                let pc = tokens
                    .next()
                    .and_then(|t| u32::from_str_radix(t, 16).ok())
                    .ok_or_else(|| parse_error("bad pc".to_string()))?;
                self.assert_interrupt(thread, pc)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Copy guest serial output to `out`. Host interrupt bytes have no
    /// listener during cosimulation and are dropped.
    fn drain_console<W: Write>(&mut self, out: &mut W) -> Result<(), SimError> {
        let serial = self.core.take_serial_output();
        if !serial.is_empty() {
            out.write_all(&serial)?;
            out.flush()?;
        }
        let dropped = self.core.take_host_interrupts();
        if !dropped.is_empty() {
            log::debug!("dropped {} host interrupt bytes", dropped.len());
        }
        Ok(())
    }

    /// Consume a reference trace. Lines that are not events are copied to
    /// `echo` unchanged, and so is everything the guest prints.
    pub fn run<R: BufRead, W: Write>(&mut self, input: R, mut echo: W) -> Result<(), SimError> {
        for (index, line) in input.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed == HALTED_MARKER {
                let result = self.finish();
                self.drain_console(&mut echo)?;
                return result;
            }
            let handled = self.handle_line(index + 1, trimmed);
            self.drain_console(&mut echo)?;
            if !handled? {
                writeln!(echo, "{}", line)?;
            }
        }
        log::warn!("reference trace ended without {}", HALTED_MARKER);
        let result = self.finish();
        self.drain_console(&mut echo)?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm;
    use crate::decoder::{ArithOp, MemOp};
    use crate::emulator::CoreConfig;
    use crate::loader::{Image, Segment};

    fn core_with(words: &[u32]) -> Core {
        let mut core = Core::new(CoreConfig {
            memory_size: 0x10000,
            threads: 1,
            ..CoreConfig::default()
        });
        let image = Image {
            entry: 0,
            segments: vec![Segment {
                address: 0,
                data: words.iter().flat_map(|w| w.to_le_bytes()).collect(),
                mem_size: words.len() * 4,
            }],
        };
        core.load_image(&image).unwrap();
        core
    }

    #[test]
    fn matching_trace_passes_and_echoes_other_lines() {
        let mut core = core_with(&[asm::addi(1, 0, 5), asm::addi(2, 1, 1), asm::b(-1)]);
        let mut cosim = Cosimulation::new(&mut core);
        let trace = "hello\nswriteback 00000000 0 1 00000005\nswriteback 00000004 0 2 00000006\n***HALTED***\n";
        let mut echo = Vec::new();
        cosim.run(trace.as_bytes(), &mut echo).unwrap();
        assert_eq!(echo, b"hello\n");
        assert_eq!(cosim.checked(), 2);
    }

    #[test]
    fn wrong_value_is_reported_with_pc() {
        let mut core = core_with(&[asm::addi(1, 0, 5), asm::addi(2, 1, 1)]);
        let mut cosim = Cosimulation::new(&mut core);
        cosim.assert_scalar_write(0, 0, 1, 5).unwrap();
        let err = cosim.assert_scalar_write(4, 0, 2, 7).unwrap_err();
        match err {
            SimError::CosimMismatch {
                pc,
                expected,
                actual,
                ..
            } => {
                assert_eq!(pc, 4);
                assert!(expected.ends_with("00000007"));
                assert!(actual.ends_with("00000006"));
            }
            other => panic!("unexpected error {}", other),
        }
    }

    #[test]
    fn missing_event_and_extra_event() {
        let mut core = core_with(&[asm::b(-1)]);
        let mut cosim = Cosimulation::new(&mut core);
        assert!(matches!(
            cosim.assert_scalar_write(0, 0, 1, 1),
            Err(SimError::CosimNoEvent { thread: 0, .. })
        ));

        let mut core = core_with(&[asm::addi(1, 0, 5), asm::addi(2, 0, 6)]);
        let mut cosim = Cosimulation::new(&mut core);
        let err = cosim
            .run("swriteback 00000000 0 1 00000005\n***HALTED***\n".as_bytes(), std::io::sink())
            .unwrap_err();
        assert!(matches!(err, SimError::CosimStillRunning { thread: 0, .. }));
    }

    #[test]
    fn guest_console_output_reaches_echo() {
        let mut words = asm::li(1, 0xffff_0020).to_vec();
        for byte in b"hi" {
            words.push(asm::arith_imm(ArithOp::Move, 2, 0, *byte as i32));
            words.push(asm::store(MemOp::Word, 2, 1, 0));
        }
        words.push(asm::addi(3, 0, 7));
        words.push(asm::b(-1));

        let mut reference = core_with(&words);
        reference.set_record_events(true);
        reference.run(Some(12)).unwrap();
        let mut trace: String = reference
            .take_events()
            .iter()
            .map(|e| format!("{}\n", e))
            .collect();
        trace.push_str("***HALTED***\n");

        let mut core = core_with(&words);
        let mut echo = Vec::new();
        Cosimulation::new(&mut core)
            .run(trace.as_bytes(), &mut echo)
            .unwrap();
        assert_eq!(echo, b"hi");
        assert!(core.take_serial_output().is_empty());
    }

    #[test]
    fn scalar_store_width_is_checked() {
        let mut core = core_with(&[asm::b(-1)]);
        let mut cosim = Cosimulation::new(&mut core);
        assert!(matches!(
            cosim.assert_scalar_store(0, 0, 0x40, 8, 0x1234),
            Err(SimError::CosimBadStore { pc: 0, size: 8 })
        ));
    }

    #[test]
    fn vector_store_takes_a_lane_mask() {
        let program = [asm::vaddi(1, 0, 5), asm::store_v(1, 0, 0x40), asm::b(-1)];

        let mut core = core_with(&program);
        let mut cosim = Cosimulation::new(&mut core);
        cosim.assert_vector_write(0, 0, 1, 0xffff, &[5; 16]).unwrap();
        cosim.assert_vector_store(4, 0, 0x40, 0xffff, &[5; 16]).unwrap();

        let mut core = core_with(&program);
        let mut cosim = Cosimulation::new(&mut core);
        cosim.assert_vector_write(0, 0, 1, 0xffff, &[5; 16]).unwrap();
        match cosim.assert_vector_store(4, 0, 0x40, 0x000f, &[5; 16]) {
            Err(SimError::CosimMismatch { expected, .. }) => {
                assert!(expected.contains(" 000000000000ffff "));
            }
            other => panic!("expected mismatch, got {:?}", other),
        }
    }

    #[test]
    fn malformed_event_line() {
        let mut core = core_with(&[asm::b(-1)]);
        let mut cosim = Cosimulation::new(&mut core);
        let err = cosim
            .run("store 0 0\n".as_bytes(), std::io::sink())
            .unwrap_err();
        assert!(matches!(err, SimError::CosimParse { line: 1, .. }));
    }
}
