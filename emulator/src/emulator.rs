use crate::bus::{AddressSpace, IoDevice, IoEffect};
use crate::cpu::{ExecContext, HardwareThread, ThreadState};
use crate::devices::SystemDevice;
use crate::loader::Image;
use crate::mmu::{Mmu, DEFAULT_TLB_SETS, DEFAULT_TLB_WAYS};
use crate::scheduler::{SchedulePolicy, Scheduler};
use crate::trace::CommitEvent;
use crate::SimError;

/// Default physical memory size.
pub const DEFAULT_MEMORY_SIZE: usize = 16 * 1024 * 1024;

/// Default number of hardware threads.
pub const DEFAULT_THREADS: usize = 4;

/// Core construction parameters.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub memory_size: usize,
    pub threads: usize,
    /// Threads running at reset, one bit per thread.
    pub initial_running: u32,
    pub schedule: SchedulePolicy,
    pub tlb_sets: usize,
    pub tlb_ways: usize,
    /// Collect commit events for tracing or cosimulation.
    pub record_events: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            memory_size: DEFAULT_MEMORY_SIZE,
            threads: DEFAULT_THREADS,
            initial_running: 1,
            schedule: SchedulePolicy::RoundRobin,
            tlb_sets: DEFAULT_TLB_SETS,
            tlb_ways: DEFAULT_TLB_WAYS,
            record_events: false,
        }
    }
}

/// How a bounded run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every thread halted.
    AllHalted,
    /// The step budget ran out first.
    StepLimit,
}

/// The whole emulated machine: hardware threads sharing one address space
/// and one pair of TLBs, stepped one instruction at a time.
///
/// ```ignore
/// let mut core = Core::new(CoreConfig::default());
/// core.load_image(&loader::load_file(path)?)?;
/// core.run(None)?;
/// ```
pub struct Core {
    threads: Vec<HardwareThread>,
    pub memory: AddressSpace,
    pub mmu: Mmu,
    scheduler: Scheduler,
    cycle: u64,
    events: Vec<CommitEvent>,
    record_events: bool,
}

impl Core {
    pub fn new(config: CoreConfig) -> Self {
        Self::with_device(config, Box::new(SystemDevice::new()))
    }

    /// Build a core whose I/O window is served by `device`.
    pub fn with_device(config: CoreConfig, device: Box<dyn IoDevice>) -> Self {
        let count = config.threads.clamp(1, 32);
        let threads = (0..count)
            .map(|id| {
                let mut thread = HardwareThread::new(id, 0);
                if config.initial_running & (1 << id) != 0 {
                    thread.state = ThreadState::Running;
                }
                thread
            })
            .collect();

        Self {
            threads,
            memory: AddressSpace::new(config.memory_size, count, device),
            mmu: Mmu::new(config.tlb_sets, config.tlb_ways),
            scheduler: Scheduler::new(config.schedule),
            cycle: 0,
            events: Vec::new(),
            record_events: config.record_events,
        }
    }

    /// Copy an image into memory and point every thread at its entry.
    pub fn load_image(&mut self, image: &Image) -> Result<(), SimError> {
        image.load_into(&mut self.memory.dram)?;
        for thread in self.threads.iter_mut() {
            thread.pc = image.entry;
        }
        Ok(())
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn threads(&self) -> &[HardwareThread] {
        &self.threads
    }

    pub fn thread(&self, id: usize) -> Result<&HardwareThread, SimError> {
        self.threads.get(id).ok_or(SimError::InvalidThread(id))
    }

    pub fn thread_mut(&mut self, id: usize) -> Result<&mut HardwareThread, SimError> {
        self.threads.get_mut(id).ok_or(SimError::InvalidThread(id))
    }

    pub fn schedule(&self) -> &SchedulePolicy {
        self.scheduler.policy()
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycle
    }

    pub fn set_record_events(&mut self, record: bool) {
        self.record_events = record;
    }

    /// Drain the commit events produced since the last call.
    pub fn take_events(&mut self) -> Vec<CommitEvent> {
        std::mem::take(&mut self.events)
    }

    /// Drain bytes the guest wrote to the serial port.
    pub fn take_serial_output(&mut self) -> Vec<u8> {
        let io = self.memory.io_mut();
        std::iter::from_fn(|| io.pop_serial()).collect()
    }

    /// Drain bytes the guest wrote to the host-interrupt register.
    pub fn take_host_interrupts(&mut self) -> Vec<u8> {
        let io = self.memory.io_mut();
        std::iter::from_fn(|| io.pop_host_interrupt()).collect()
    }

    /// Mark an interrupt pending; it is taken once the thread enables
    /// interrupts.
    pub fn raise_interrupt(&mut self, id: usize) -> Result<(), SimError> {
        let thread = self.thread_mut(id)?;
        thread.interrupt_pending = true;
        log::debug!("thread {}: interrupt raised", id);
        Ok(())
    }

    pub fn all_halted(&self) -> bool {
        self.threads.iter().all(|t| t.state == ThreadState::Halted)
    }

    fn blocked_mask(&self) -> u32 {
        self.threads
            .iter()
            .filter(|t| t.state != ThreadState::Halted)
            .fold(0, |mask, t| mask | (1 << t.id))
    }

    /// Run one instruction on `id`. A thread that is not running is left
    /// alone.
    pub fn step_thread(&mut self, id: usize) -> Result<(), SimError> {
        let thread = self
            .threads
            .get_mut(id)
            .ok_or(SimError::InvalidThread(id))?;
        if !thread.is_runnable() {
            return Ok(());
        }

        let mut ctx = ExecContext {
            memory: &mut self.memory,
            mmu: &mut self.mmu,
            events: &mut self.events,
            record: self.record_events,
            cycle: self.cycle,
        };
        let result = thread.step(&mut ctx);
        self.cycle += 1;
        if let Err(err) = result {
            log::error!("{}\n{}", err, thread.dump_registers());
            return Err(err);
        }

        self.apply_effects(id);
        Ok(())
    }

    /// Let the scheduler pick a thread and run one instruction on it.
    ///
    /// Returns the thread that ran, or `None` once every thread has halted.
    /// Threads that exist but can never be scheduled again are a deadlock.
    pub fn step(&mut self) -> Result<Option<usize>, SimError> {
        let threads = &self.threads;
        let next = self
            .scheduler
            .next(threads.len(), |id| threads[id].is_runnable());
        match next {
            Some(id) => {
                self.step_thread(id)?;
                Ok(Some(id))
            }
            None if self.all_halted() => Ok(None),
            None => Err(SimError::Deadlock {
                blocked: self.blocked_mask(),
            }),
        }
    }

    /// Step until every thread halts or `max_steps` instructions have run.
    pub fn run(&mut self, max_steps: Option<u64>) -> Result<RunOutcome, SimError> {
        let mut steps = 0u64;
        loop {
            if max_steps.map_or(false, |limit| steps >= limit) {
                return Ok(RunOutcome::StepLimit);
            }
            if self.step()?.is_none() {
                return Ok(RunOutcome::AllHalted);
            }
            steps += 1;
        }
    }

    fn apply_effects(&mut self, id: usize) {
        for effect in self.memory.take_effects() {
            match effect {
                IoEffect::ResumeThreads(mask) => {
                    for thread in self.threads.iter_mut() {
                        if mask & (1 << thread.id) != 0 && thread.state == ThreadState::Halted {
                            log::debug!("thread {}: resumed by thread {}", thread.id, id);
                            thread.state = ThreadState::Running;
                        }
                    }
                }
                IoEffect::HaltThreads(mask) => {
                    for thread in self.threads.iter_mut() {
                        if mask & (1 << thread.id) != 0 {
                            log::debug!("thread {}: halted by thread {}", thread.id, id);
                            thread.state = ThreadState::Halted;
                        }
                    }
                }
                IoEffect::BarrierWait { participants } => {
                    self.threads[id].state = ThreadState::BarrierWait;
                    let waiting = self
                        .threads
                        .iter()
                        .filter(|t| t.state == ThreadState::BarrierWait)
                        .count();
                    log::debug!(
                        "thread {}: barrier wait ({} of {})",
                        id,
                        waiting,
                        participants
                    );
                    if waiting >= participants as usize {
                        for thread in self.threads.iter_mut() {
                            if thread.state == ThreadState::BarrierWait {
                                thread.state = ThreadState::Running;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Register dump of every thread, for fatal error reports.
    pub fn dump_state(&self) -> String {
        self.threads
            .iter()
            .map(|t| t.dump_registers())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm;
    use crate::bus::IO_REGION_BASE;
    use crate::decoder::{ArithOp, MemOp};
    use crate::devices::{REG_BARRIER_WAIT, REG_SERIAL_OUTPUT, REG_THREAD_HALT, REG_THREAD_RESUME};
    use crate::loader::Segment;

    fn program(words: &[u32]) -> Image {
        Image {
            entry: 0,
            segments: vec![Segment {
                address: 0,
                data: words.iter().flat_map(|w| w.to_le_bytes()).collect(),
                mem_size: words.len() * 4,
            }],
        }
    }

    fn small_config(threads: usize) -> CoreConfig {
        CoreConfig {
            memory_size: 0x10000,
            threads,
            ..CoreConfig::default()
        }
    }

    /// s1 = I/O base, then halt the current thread.
    fn halt_self() -> Vec<u32> {
        let mut words = asm::li(1, IO_REGION_BASE).to_vec();
        words.push(asm::getcr(2, 0));
        words.push(asm::arith_imm(ArithOp::Move, 3, 0, 1));
        words.push(asm::arith(ArithOp::Shl, 3, 3, 2));
        words.push(asm::store(MemOp::Word, 3, 1, REG_THREAD_HALT as i32));
        words
    }

    #[test]
    fn serial_output_and_halt() {
        let mut words = asm::li(1, IO_REGION_BASE).to_vec();
        words.push(asm::addi(2, 0, b'h' as i32));
        words.push(asm::store(MemOp::Word, 2, 1, REG_SERIAL_OUTPUT as i32));
        words.push(asm::addi(2, 0, b'i' as i32));
        words.push(asm::store(MemOp::Word, 2, 1, REG_SERIAL_OUTPUT as i32));
        words.extend(halt_self());

        let mut core = Core::new(small_config(1));
        core.load_image(&program(&words)).unwrap();
        assert_eq!(core.run(Some(1000)).unwrap(), RunOutcome::AllHalted);
        assert_eq!(core.take_serial_output(), b"hi".to_vec());
        assert!(core.all_halted());
    }

    #[test]
    fn resumed_threads_interleave_round_robin() {
        // Thread 0 starts the others; every thread then halts itself.
        let mut words = asm::li(1, IO_REGION_BASE).to_vec();
        words.push(asm::getcr(2, 0));
        words.push(asm::bnz(2, 2));
        words.push(asm::addi(4, 0, 0xe));
        words.push(asm::store(MemOp::Word, 4, 1, REG_THREAD_RESUME as i32));
        words.extend(halt_self());

        let mut core = Core::new(small_config(4));
        core.set_record_events(true);
        core.load_image(&program(&words)).unwrap();
        assert_eq!(core.run(Some(10_000)).unwrap(), RunOutcome::AllHalted);

        let order: Vec<usize> = core.take_events().iter().map(|e| e.thread()).collect();
        assert!(order.contains(&3));
        let first_other = order.iter().position(|&t| t != 0).unwrap();
        assert_eq!(order[first_other], 1);
        assert!(core.threads().iter().all(|t| t.retired > 0));
    }

    #[test]
    fn barrier_releases_all_participants() {
        let mut words = asm::li(1, IO_REGION_BASE).to_vec();
        words.push(asm::addi(5, 0, 2));
        words.push(asm::store(MemOp::Word, 5, 1, REG_BARRIER_WAIT as i32));
        words.push(asm::addi(6, 0, 1));
        words.extend(halt_self());

        let mut core = Core::new(CoreConfig {
            initial_running: 0b11,
            ..small_config(2)
        });
        core.load_image(&program(&words)).unwrap();

        // Thread 0 reaches the barrier first and waits alone.
        for _ in 0..13 {
            core.step().unwrap();
        }
        assert_eq!(core.thread(0).unwrap().state, ThreadState::BarrierWait);
        core.step().unwrap();
        assert_eq!(core.thread(0).unwrap().state, ThreadState::Running);
        assert_eq!(core.thread(1).unwrap().state, ThreadState::Running);
        assert_eq!(core.run(Some(1000)).unwrap(), RunOutcome::AllHalted);
        assert_eq!(core.thread(0).unwrap().scalar(6), 1);
        assert_eq!(core.thread(1).unwrap().scalar(6), 1);
    }

    #[test]
    fn lone_barrier_wait_is_a_deadlock() {
        let mut words = asm::li(1, IO_REGION_BASE).to_vec();
        words.push(asm::addi(5, 0, 2));
        words.push(asm::store(MemOp::Word, 5, 1, REG_BARRIER_WAIT as i32));
        let mut core = Core::new(small_config(2));
        core.load_image(&program(&words)).unwrap();
        let err = core.run(Some(100)).unwrap_err();
        assert!(matches!(err, SimError::Deadlock { blocked: 0b1 }));
    }

    #[test]
    fn step_limit_and_invalid_thread() {
        let mut core = Core::new(small_config(1));
        core.load_image(&program(&[asm::b(-1)])).unwrap();
        assert_eq!(core.run(Some(50)).unwrap(), RunOutcome::StepLimit);
        assert_eq!(core.cycle_count(), 50);
        assert!(matches!(core.raise_interrupt(9), Err(SimError::InvalidThread(9))));
    }
}
