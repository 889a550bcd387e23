use super::alu::lane_op;
use super::{FaultReason, FaultRecord, HardwareThread, REG_LINK, REG_PC};
use crate::bus::{AddressSpace, CACHE_LINE_SIZE, NUM_VECTOR_LANES};
use crate::decoder::{
    self, ArithOp, BranchKind, CacheOp, ImmFormat, Instruction, MemOp, RegFormat,
};
use crate::dram::MemoryError;
use crate::mmu::{AccessKind, Mmu, TlbEntry};
use crate::trace::{lane_mask_to_byte_mask, CommitEvent, Lanes};
use crate::SimError;

const ALL_LANES: u32 = 0xffff;

/// Shared machine state a thread needs while executing one instruction.
pub struct ExecContext<'a> {
    pub memory: &'a mut AddressSpace,
    pub mmu: &'a mut Mmu,
    /// Committed state changes are appended here when `record` is set.
    pub events: &'a mut Vec<CommitEvent>,
    pub record: bool,
    pub cycle: u64,
}

impl ExecContext<'_> {
    fn emit(&mut self, event: CommitEvent) {
        if self.record {
            self.events.push(event);
        }
    }
}

/// Why an instruction did not retire.
enum Exception {
    Fault(FaultRecord),
    Fatal(SimError),
}

impl From<SimError> for Exception {
    fn from(err: SimError) -> Self {
        Exception::Fatal(err)
    }
}

impl From<MemoryError> for Exception {
    fn from(err: MemoryError) -> Self {
        Exception::Fatal(err.into())
    }
}

fn fault(reason: FaultReason, pc: u32, address: u32) -> Exception {
    Exception::Fault(FaultRecord::new(reason, pc, address))
}

fn broadcast(value: u32) -> Lanes {
    [value; NUM_VECTOR_LANES]
}

fn offset_address(base: u32, offset: i32) -> u32 {
    base.wrapping_add(offset as u32)
}

impl HardwareThread {
    /// Execute one instruction, or take a pending interrupt instead.
    ///
    /// Guest faults are dispatched here and count as a completed step. Only
    /// host-fatal conditions are returned as errors.
    pub fn step(&mut self, ctx: &mut ExecContext<'_>) -> Result<(), SimError> {
        let pc = self.pc;
        if self.interrupt_pending && self.cr.interrupts_enabled() {
            self.interrupt_pending = false;
            return self.dispatch_fault(FaultRecord::new(FaultReason::Interrupt, pc, 0));
        }

        match self.execute(ctx, pc) {
            Ok(()) => {
                self.retired += 1;
                Ok(())
            }
            Err(Exception::Fault(record)) => {
                self.pc = pc;
                self.dispatch_fault(record)
            }
            Err(Exception::Fatal(err)) => {
                self.pc = pc;
                Err(err)
            }
        }
    }

    fn translate(
        &self,
        ctx: &ExecContext<'_>,
        va: u32,
        kind: AccessKind,
    ) -> Result<u32, FaultReason> {
        ctx.mmu.translate(&self.cr, va, kind)
    }

    fn execute(&mut self, ctx: &mut ExecContext<'_>, pc: u32) -> Result<(), Exception> {
        if pc & 3 != 0 {
            return Err(fault(FaultReason::IfetchAlignment, pc, pc));
        }
        let phys = self
            .translate(ctx, pc, AccessKind::Fetch)
            .map_err(|reason| fault(reason, pc, pc))?;
        let word = ctx.memory.read32(phys)?;
        let instr = decoder::decode(word).map_err(|reason| fault(reason, pc, pc))?;
        log::trace!("thread {} {:08x}: {:08x} {}", self.id, pc, word, instr);

        self.pc = pc.wrapping_add(4);
        match instr {
            Instruction::RegArith {
                op,
                format,
                dest,
                src1,
                src2,
                mask,
            } => {
                let mask = self.lane_mask(mask);
                match format {
                    RegFormat::Scalar => {
                        let value = lane_op(op, self.scalar(src1), self.scalar(src2));
                        self.commit_scalar(ctx, pc, dest, value);
                    }
                    RegFormat::VectorScalar => {
                        let a = self.vector(src1);
                        let b = broadcast(self.scalar(src2));
                        self.vector_arith(ctx, pc, op, dest, &a, &b, mask);
                    }
                    RegFormat::VectorVector => {
                        let a = self.vector(src1);
                        let b = self.vector(src2);
                        self.vector_arith(ctx, pc, op, dest, &a, &b, mask);
                    }
                }
                Ok(())
            }
            Instruction::ImmArith {
                op,
                format,
                dest,
                src1,
                imm,
                mask,
            } => {
                let mask = self.lane_mask(mask);
                let b = broadcast(imm as u32);
                match format {
                    ImmFormat::Scalar => {
                        let value = lane_op(op, self.scalar(src1), imm as u32);
                        self.commit_scalar(ctx, pc, dest, value);
                    }
                    ImmFormat::Vector => {
                        let a = self.vector(src1);
                        self.vector_arith(ctx, pc, op, dest, &a, &b, mask);
                    }
                    ImmFormat::VectorFromScalar => {
                        let a = broadcast(self.scalar(src1));
                        self.vector_arith(ctx, pc, op, dest, &a, &b, mask);
                    }
                }
                Ok(())
            }
            Instruction::Memory {
                op,
                load,
                reg,
                ptr,
                offset,
                mask,
            } => {
                let mask = self.lane_mask(mask);
                match op {
                    MemOp::ControlReg => self.control_register(ctx, pc, load, reg, ptr),
                    MemOp::Block if load => self.block_load(ctx, pc, reg, ptr, offset, mask),
                    MemOp::Block => self.block_store(ctx, pc, reg, ptr, offset, mask),
                    MemOp::ScatterGather if load => self.gather(ctx, pc, reg, ptr, offset, mask),
                    MemOp::ScatterGather => self.scatter(ctx, pc, reg, ptr, offset, mask),
                    _ if load => self.scalar_load(ctx, pc, op, reg, ptr, offset),
                    _ => self.scalar_store(ctx, pc, op, reg, ptr, offset),
                }
            }
            Instruction::CacheControl {
                op,
                ptr,
                value,
                offset,
            } => self.cache_control(ctx, pc, op, ptr, value, offset),
            Instruction::Branch { kind, reg, offset } => {
                self.branch(ctx, pc, kind, reg, offset)
            }
            Instruction::Syscall => Err(fault(FaultReason::Syscall, self.pc, 0)),
        }
    }

    fn lane_mask(&self, mask: Option<u8>) -> u32 {
        mask.map_or(ALL_LANES, |reg| self.scalar(reg) & ALL_LANES)
    }

    fn commit_scalar(&mut self, ctx: &mut ExecContext<'_>, pc: u32, reg: u8, value: u32) {
        self.set_scalar(reg, value);
        if reg != REG_PC {
            ctx.emit(CommitEvent::ScalarWrite {
                pc,
                thread: self.id,
                reg,
                value,
            });
        }
    }

    fn commit_vector(
        &mut self,
        ctx: &mut ExecContext<'_>,
        pc: u32,
        reg: u8,
        values: &Lanes,
        mask: u32,
    ) {
        let values = self.set_vector(reg, values, mask);
        ctx.emit(CommitEvent::VectorWrite {
            pc,
            thread: self.id,
            reg,
            mask: mask as u16,
            values,
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn vector_arith(
        &mut self,
        ctx: &mut ExecContext<'_>,
        pc: u32,
        op: ArithOp,
        dest: u8,
        a: &Lanes,
        b: &Lanes,
        mask: u32,
    ) {
        if op == ArithOp::GetLane {
            let value = a[(b[0] as usize) % NUM_VECTOR_LANES];
            self.commit_scalar(ctx, pc, dest, value);
            return;
        }

        if op.is_compare() {
            let bits = (0..NUM_VECTOR_LANES)
                .filter(|&lane| lane_op(op, a[lane], b[lane]) != 0)
                .fold(0u32, |acc, lane| acc | (1 << lane));
            self.commit_scalar(ctx, pc, dest, bits & mask);
            return;
        }

        let mut result = [0u32; NUM_VECTOR_LANES];
        for (lane, value) in result.iter_mut().enumerate() {
            *value = if op == ArithOp::Shuffle {
                a[(b[lane] as usize) % NUM_VECTOR_LANES]
            } else {
                lane_op(op, a[lane], b[lane])
            };
        }
        self.commit_vector(ctx, pc, dest, &result, mask);
    }

    fn require_supervisor(&self, pc: u32, address: u32) -> Result<(), Exception> {
        if self.cr.supervisor() {
            Ok(())
        } else {
            Err(fault(FaultReason::PrivilegedOp, pc, address))
        }
    }

    fn control_register(
        &mut self,
        ctx: &mut ExecContext<'_>,
        pc: u32,
        load: bool,
        reg: u8,
        index: u8,
    ) -> Result<(), Exception> {
        self.require_supervisor(pc, 0)?;
        let index = index as u32;
        if load {
            let value = self.cr.read(index, self.id as u32, ctx.cycle);
            self.commit_scalar(ctx, pc, reg, value);
        } else {
            let value = self.scalar(reg);
            log::debug!("thread {}: setcr {} = {:#010x}", self.id, index, value);
            self.cr.write(index, value);
        }
        Ok(())
    }

    /// Translate a data address, raising alignment and MMU faults.
    fn data_address(
        &self,
        ctx: &ExecContext<'_>,
        pc: u32,
        va: u32,
        align: u32,
        kind: AccessKind,
    ) -> Result<u32, FaultRecord> {
        if va & (align - 1) != 0 {
            return Err(FaultRecord::new(FaultReason::DataAlignment, pc, va));
        }
        self.translate(ctx, va, kind)
            .map_err(|reason| FaultRecord::new(reason, pc, va))
    }

    fn scalar_load(
        &mut self,
        ctx: &mut ExecContext<'_>,
        pc: u32,
        op: MemOp,
        reg: u8,
        ptr: u8,
        offset: i32,
    ) -> Result<(), Exception> {
        let va = offset_address(self.scalar(ptr), offset);
        let width = match op {
            MemOp::Byte | MemOp::ByteSigned => 1,
            MemOp::Short | MemOp::ShortSigned => 2,
            _ => 4,
        };
        let phys = self
            .data_address(ctx, pc, va, width, AccessKind::Load)
            .map_err(Exception::Fault)?;
        let value = match op {
            MemOp::Byte => ctx.memory.read8(phys)?,
            MemOp::ByteSigned => ctx.memory.read8(phys)? as u8 as i8 as i32 as u32,
            MemOp::Short => ctx.memory.read16(phys)?,
            MemOp::ShortSigned => ctx.memory.read16(phys)? as u16 as i16 as i32 as u32,
            MemOp::Sync => {
                ctx.memory.sync.link(self.id, phys);
                ctx.memory.read32(phys)?
            }
            _ => ctx.memory.read32(phys)?,
        };
        self.commit_scalar(ctx, pc, reg, value);
        Ok(())
    }

    fn scalar_store(
        &mut self,
        ctx: &mut ExecContext<'_>,
        pc: u32,
        op: MemOp,
        reg: u8,
        ptr: u8,
        offset: i32,
    ) -> Result<(), Exception> {
        let va = offset_address(self.scalar(ptr), offset);
        let width = match op {
            MemOp::Byte | MemOp::ByteSigned => 1,
            MemOp::Short | MemOp::ShortSigned => 2,
            _ => 4,
        };
        let phys = self
            .data_address(ctx, pc, va, width, AccessKind::Store)
            .map_err(Exception::Fault)?;
        let value = self.scalar(reg);

        if op == MemOp::Sync {
            let linked = ctx.memory.sync.is_linked(self.id, phys);
            ctx.memory.sync.clear(self.id);
            if linked {
                ctx.memory.write32(phys, value)?;
                self.emit_store(ctx, pc, phys, width, value);
            }
            self.commit_scalar(ctx, pc, reg, linked as u32);
            return Ok(());
        }

        match width {
            1 => ctx.memory.write8(phys, value)?,
            2 => ctx.memory.write16(phys, value)?,
            _ => ctx.memory.write32(phys, value)?,
        }
        self.emit_store(ctx, pc, phys, width, value);
        Ok(())
    }

    fn emit_store(&self, ctx: &mut ExecContext<'_>, pc: u32, phys: u32, width: u32, value: u32) {
        // Device registers are not part of the memory trace.
        if !AddressSpace::is_io(phys) {
            ctx.emit(CommitEvent::scalar_store(pc, self.id, phys, width, value));
        }
    }

    fn block_address(
        &self,
        ctx: &ExecContext<'_>,
        pc: u32,
        ptr: u8,
        offset: i32,
        kind: AccessKind,
    ) -> Result<u32, Exception> {
        let va = offset_address(self.scalar(ptr), offset);
        self.data_address(ctx, pc, va, CACHE_LINE_SIZE, kind)
            .map_err(Exception::Fault)
    }

    fn block_load(
        &mut self,
        ctx: &mut ExecContext<'_>,
        pc: u32,
        reg: u8,
        ptr: u8,
        offset: i32,
        mask: u32,
    ) -> Result<(), Exception> {
        let phys = self.block_address(ctx, pc, ptr, offset, AccessKind::Load)?;
        let values = ctx.memory.read_line(phys)?;
        self.commit_vector(ctx, pc, reg, &values, mask);
        Ok(())
    }

    fn block_store(
        &mut self,
        ctx: &mut ExecContext<'_>,
        pc: u32,
        reg: u8,
        ptr: u8,
        offset: i32,
        mask: u32,
    ) -> Result<(), Exception> {
        let phys = self.block_address(ctx, pc, ptr, offset, AccessKind::Store)?;
        let values = self.vector(reg);
        ctx.memory.write_line(phys, mask, &values)?;
        ctx.emit(CommitEvent::Store {
            pc,
            thread: self.id,
            address: phys,
            mask: lane_mask_to_byte_mask(mask as u16),
            values,
        });
        Ok(())
    }

    /// Translate every active lane before touching memory so a fault in
    /// any lane leaves memory and registers unchanged.
    fn lane_addresses(
        &self,
        ctx: &ExecContext<'_>,
        pc: u32,
        ptr: u8,
        offset: i32,
        mask: u32,
        kind: AccessKind,
    ) -> Result<[Option<u32>; NUM_VECTOR_LANES], Exception> {
        let bases = self.vector(ptr);
        let mut addresses = [None; NUM_VECTOR_LANES];
        for (lane, slot) in addresses.iter_mut().enumerate() {
            if mask & (1 << lane) == 0 {
                continue;
            }
            let va = offset_address(bases[lane], offset);
            let phys = self
                .data_address(ctx, pc, va, 4, kind)
                .map_err(|record| Exception::Fault(record.with_subcycle(lane)))?;
            *slot = Some(phys);
        }
        Ok(addresses)
    }

    fn gather(
        &mut self,
        ctx: &mut ExecContext<'_>,
        pc: u32,
        reg: u8,
        ptr: u8,
        offset: i32,
        mask: u32,
    ) -> Result<(), Exception> {
        let addresses = self.lane_addresses(ctx, pc, ptr, offset, mask, AccessKind::Load)?;
        let mut values = [0u32; NUM_VECTOR_LANES];
        for (value, address) in values.iter_mut().zip(addresses.iter()) {
            if let Some(phys) = *address {
                *value = ctx.memory.read32(phys)?;
            }
        }
        self.commit_vector(ctx, pc, reg, &values, mask);
        Ok(())
    }

    fn scatter(
        &mut self,
        ctx: &mut ExecContext<'_>,
        pc: u32,
        reg: u8,
        ptr: u8,
        offset: i32,
        mask: u32,
    ) -> Result<(), Exception> {
        let addresses = self.lane_addresses(ctx, pc, ptr, offset, mask, AccessKind::Store)?;
        let values = self.vector(reg);
        for (value, address) in values.iter().zip(addresses.iter()) {
            if let Some(phys) = *address {
                ctx.memory.write32(phys, *value)?;
                self.emit_store(ctx, pc, phys, 4, *value);
            }
        }
        Ok(())
    }

    fn cache_control(
        &mut self,
        ctx: &mut ExecContext<'_>,
        pc: u32,
        op: CacheOp,
        ptr: u8,
        value: u8,
        offset: i32,
    ) -> Result<(), Exception> {
        let address = offset_address(self.scalar(ptr), offset);
        if op.is_privileged() {
            self.require_supervisor(pc, address)?;
        }

        match op {
            CacheOp::DtlbInsert | CacheOp::ItlbInsert => {
                let va = self.scalar(ptr);
                let entry = TlbEntry::from_insert(va, self.scalar(value), self.cr.asid);
                log::debug!(
                    "thread {}: {:?} {:#010x} -> {:#010x} flags {:#x} asid {}",
                    self.id,
                    op,
                    entry.vpage,
                    entry.ppage,
                    entry.flags,
                    entry.asid
                );
                if op == CacheOp::DtlbInsert {
                    ctx.mmu.dtlb.insert(entry);
                } else {
                    ctx.mmu.itlb.insert(entry);
                }
            }
            CacheOp::TlbInvalidate => {
                log::debug!("thread {}: tlbinval {:#010x}", self.id, address);
                ctx.mmu.invalidate_entry(address, self.cr.asid);
            }
            CacheOp::TlbInvalidateAll => {
                log::debug!("thread {}: tlbinvalall", self.id);
                ctx.mmu.invalidate_all();
            }
            // No cache is modelled; memory is always coherent.
            CacheOp::Dinvalidate | CacheOp::Dflush | CacheOp::Iinvalidate | CacheOp::Membar => {}
        }
        Ok(())
    }

    fn branch(
        &mut self,
        ctx: &mut ExecContext<'_>,
        pc: u32,
        kind: BranchKind,
        reg: u8,
        offset: i32,
    ) -> Result<(), Exception> {
        let next = self.pc;
        let target = next.wrapping_add(offset.wrapping_mul(4) as u32);
        let value = self.scalar(reg);
        match kind {
            BranchKind::All if value & ALL_LANES == ALL_LANES => self.pc = target,
            BranchKind::NotAll if value & ALL_LANES != ALL_LANES => self.pc = target,
            BranchKind::Zero if value == 0 => self.pc = target,
            BranchKind::NotZero if value != 0 => self.pc = target,
            BranchKind::Always => self.pc = target,
            BranchKind::Call => {
                self.commit_scalar(ctx, pc, REG_LINK, next);
                self.pc = target;
            }
            BranchKind::CallRegister => {
                self.commit_scalar(ctx, pc, REG_LINK, next);
                self.pc = value;
            }
            BranchKind::Eret => {
                self.require_supervisor(pc, 0)?;
                self.return_from_fault();
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm;
    use crate::control::{
        CR_FAULT_HANDLER, CR_FAULT_PC, CR_FLAGS, CR_SUBCYCLE, CR_TLB_MISS_HANDLER, FLAG_MMU_EN,
        FLAG_SUPERVISOR_EN,
    };
    use crate::cpu::ThreadState;
    use crate::devices::SystemDevice;
    use crate::mmu::{TLB_EXECUTABLE, TLB_PRESENT, TLB_WRITABLE};

    struct Machine {
        memory: AddressSpace,
        mmu: Mmu,
        events: Vec<CommitEvent>,
        thread: HardwareThread,
    }

    impl Machine {
        fn new(program: &[u32]) -> Self {
            let mut memory = AddressSpace::new(0x10000, 1, Box::new(SystemDevice::new()));
            for (i, word) in program.iter().enumerate() {
                memory.write32(i as u32 * 4, *word).unwrap();
            }
            let mut thread = HardwareThread::new(0, 0);
            thread.state = ThreadState::Running;
            Self {
                memory,
                mmu: Mmu::new(4, 2),
                events: Vec::new(),
                thread,
            }
        }

        fn step(&mut self) -> Result<(), SimError> {
            let mut ctx = ExecContext {
                memory: &mut self.memory,
                mmu: &mut self.mmu,
                events: &mut self.events,
                record: true,
                cycle: 0,
            };
            self.thread.step(&mut ctx)
        }

        fn run(&mut self, steps: usize) {
            for _ in 0..steps {
                self.step().unwrap();
            }
        }
    }

    #[test]
    fn scalar_arithmetic_and_trace() {
        let mut m = Machine::new(&[
            asm::addi(1, 0, 40),
            asm::addi(2, 0, 2),
            asm::arith(ArithOp::Add, 3, 1, 2),
            asm::arith(ArithOp::CmpGt, 4, 3, 1),
        ]);
        m.run(4);
        assert_eq!(m.thread.scalar(3), 42);
        assert_eq!(m.thread.scalar(4), 1);
        assert_eq!(m.thread.pc, 16);
        assert_eq!(
            m.events[2],
            CommitEvent::ScalarWrite {
                pc: 8,
                thread: 0,
                reg: 3,
                value: 42
            }
        );
    }

    #[test]
    fn masked_vector_ops_preserve_inactive_lanes() {
        let mut m = Machine::new(&[
            asm::vaddi(1, 1, 5),
            asm::addi(2, 0, 0x00ff),
            asm::vaddi_mask(1, 2, 1, 10),
            asm::vcompare(ArithOp::CmpGt, 3, 1, 9),
        ]);
        m.thread.set_scalar(9, 7);
        m.run(4);
        let v = m.thread.vector(1);
        assert_eq!(v[0], 15);
        assert_eq!(v[7], 15);
        assert_eq!(v[8], 5);
        // Only the lanes touched by the masked add exceed 7.
        assert_eq!(m.thread.scalar(3), 0x00ff);
    }

    #[test]
    fn loads_stores_and_sign_extension() {
        let mut m = Machine::new(&[
            asm::addi(1, 0, 0x0ff0),
            asm::addi(2, 0, -2),
            asm::store(MemOp::Word, 2, 1, 0),
            asm::load(MemOp::ByteSigned, 3, 1, 0),
            asm::load(MemOp::Short, 4, 1, 2),
        ]);
        m.run(5);
        assert_eq!(m.memory.read32(0x0ff0).unwrap(), 0xffff_fffe);
        assert_eq!(m.thread.scalar(3), 0xffff_fffe);
        assert_eq!(m.thread.scalar(4), 0xffff);
        assert!(matches!(
            m.events[2],
            CommitEvent::Store {
                address: 0x0fc0,
                mask: 0x000f_0000_0000_0000,
                ..
            }
        ));
    }

    #[test]
    fn misaligned_load_faults_without_writeback() {
        let mut m = Machine::new(&[asm::addi(1, 0, 0x101), asm::load(MemOp::Word, 2, 1, 0)]);
        m.thread.cr.write(CR_FAULT_HANDLER, 0x800);
        m.thread.set_scalar(2, 0x55);
        m.run(2);
        assert_eq!(m.thread.pc, 0x800);
        assert_eq!(m.thread.cr.fault_reason, FaultReason::DataAlignment.code());
        assert_eq!(m.thread.cr.fault_pc, 4);
        assert_eq!(m.thread.cr.fault_address, 0x101);
        assert_eq!(m.thread.scalar(2), 0x55);
    }

    #[test]
    fn sync_store_fails_after_intervening_store() {
        let mut m = Machine::new(&[
            asm::addi(1, 0, 0x200),
            asm::load(MemOp::Sync, 2, 1, 0),
            asm::addi(3, 0, 9),
            asm::store(MemOp::Sync, 3, 1, 0),
            asm::load(MemOp::Sync, 2, 1, 0),
            asm::store(MemOp::Word, 0, 1, 4),
            asm::addi(3, 0, 11),
            asm::store(MemOp::Sync, 3, 1, 0),
        ]);
        m.run(8);
        assert_eq!(m.memory.read32(0x200).unwrap(), 9);
        assert_eq!(m.thread.scalar(3), 0);
    }

    #[test]
    fn scatter_fault_leaves_memory_untouched() {
        let mut m = Machine::new(&[asm::scatter(2, 1, 0)]);
        m.thread.cr.write(CR_FAULT_HANDLER, 0x800);
        let mut addrs = [0u32; NUM_VECTOR_LANES];
        for (lane, a) in addrs.iter_mut().enumerate() {
            *a = 0x1000 + lane as u32 * 8;
        }
        addrs[5] = 0x1002;
        m.thread.set_vector(1, &addrs, 0xffff);
        m.thread.set_vector(2, &[0xaa; NUM_VECTOR_LANES], 0xffff);
        m.run(1);
        assert_eq!(m.thread.cr.fault_reason, FaultReason::DataAlignment.code());
        assert_eq!(m.thread.cr.read(CR_SUBCYCLE, 0, 0), 5);
        assert_eq!(m.memory.read32(0x1000).unwrap(), 0);
        assert!(m.events.is_empty());
    }

    #[test]
    fn call_and_return() {
        let mut m = Machine::new(&[
            asm::call(1),
            asm::addi(5, 0, 1),
            asm::addi(6, 0, 2),
            asm::ret(),
        ]);
        m.run(1);
        assert_eq!(m.thread.pc, 8);
        assert_eq!(m.thread.scalar(REG_LINK), 4);
        m.run(3);
        assert_eq!(m.thread.pc, 8);
        assert_eq!(m.thread.scalar(5), 1);
        assert_eq!(m.thread.scalar(6), 2);
    }

    #[test]
    fn user_mode_privileged_ops_fault() {
        let mut m = Machine::new(&[asm::tlbinvalall()]);
        m.thread.cr.write(CR_FAULT_HANDLER, 0x800);
        m.thread.cr.write(CR_FLAGS, 0);
        m.mmu.dtlb.insert(TlbEntry::from_insert(0x1000, 0x1000 | TLB_PRESENT, 0));
        m.run(1);
        assert_eq!(m.thread.cr.fault_reason, FaultReason::PrivilegedOp.code());
        assert_eq!(m.thread.cr.flags, FLAG_SUPERVISOR_EN);
        assert_eq!(m.thread.cr.saved_flags, 0);
        assert_eq!(m.mmu.dtlb.valid_entries(), 1);
    }

    #[test]
    fn tlb_miss_goes_to_miss_handler() {
        let mut m = Machine::new(&[asm::load(MemOp::Word, 1, 0, 0)]);
        m.thread.cr.write(CR_TLB_MISS_HANDLER, 0x900);
        m.thread.cr.write(CR_FLAGS, FLAG_MMU_EN | FLAG_SUPERVISOR_EN);
        m.mmu.itlb.insert(TlbEntry::from_insert(0, TLB_PRESENT | TLB_EXECUTABLE, 0));
        m.thread.set_scalar(0, 0x5000);
        m.run(1);
        assert_eq!(m.thread.pc, 0x900);
        assert_eq!(m.thread.cr.fault_reason, FaultReason::DtlbMiss.code());
        assert_eq!(m.thread.cr.fault_address, 0x5000);
        assert!(!m.thread.cr.mmu_enabled());

        m.mmu
            .dtlb
            .insert(TlbEntry::from_insert(0x5000, 0x3000 | TLB_PRESENT | TLB_WRITABLE, 0));
        m.memory.write32(0x3000, 0x1234).unwrap();
        m.thread.return_from_fault();
        m.run(1);
        assert_eq!(m.thread.scalar(1), 0x1234);
    }

    #[test]
    fn interrupt_taken_only_when_enabled() {
        let mut m = Machine::new(&[asm::addi(1, 1, 1), asm::addi(1, 1, 1)]);
        m.thread.cr.write(CR_FAULT_HANDLER, 0x800);
        m.thread.interrupt_pending = true;
        m.run(1);
        assert_eq!(m.thread.pc, 4);
        m.thread.cr.write(CR_FLAGS, FLAG_SUPERVISOR_EN | 1);
        m.run(1);
        assert_eq!(m.thread.pc, 0x800);
        assert_eq!(m.thread.cr.fault_pc, 4);
        assert_eq!(m.thread.cr.fault_reason, FaultReason::Interrupt.code());
        assert!(!m.thread.cr.interrupts_enabled());
    }

    #[test]
    fn undefined_instruction_faults() {
        let mut m = Machine::new(&[0xc020_0000]);
        m.thread.cr.write(CR_FAULT_HANDLER, 0x800);
        m.run(1);
        assert_eq!(m.thread.cr.fault_reason, FaultReason::IllegalInstruction.code());
        assert_eq!(m.thread.cr.fault_address, 0);
    }

    #[test]
    fn tlbinval_removes_only_the_named_page() {
        let mut m = Machine::new(&[asm::tlbinval(1), asm::load(MemOp::Word, 2, 1, 0)]);
        m.thread.cr.write(CR_TLB_MISS_HANDLER, 0x900);
        m.thread.cr.write(CR_FLAGS, FLAG_MMU_EN | FLAG_SUPERVISOR_EN);
        m.mmu.itlb.insert(TlbEntry::from_insert(0, TLB_PRESENT | TLB_EXECUTABLE, 0));
        m.mmu.dtlb.insert(TlbEntry::from_insert(0x5000, 0x3000 | TLB_PRESENT, 0));
        m.mmu.dtlb.insert(TlbEntry::from_insert(0x6000, 0x3000 | TLB_PRESENT, 0));
        m.thread.set_scalar(1, 0x5000);

        m.run(1);
        assert_eq!(m.mmu.dtlb.valid_entries(), 1);
        assert!(m.mmu.dtlb.lookup(0x6000, 0).is_some());

        m.run(1);
        assert_eq!(m.thread.pc, 0x900);
        assert_eq!(m.thread.cr.fault_reason, FaultReason::DtlbMiss.code());
        assert_eq!(m.thread.cr.fault_address, 0x5000);
    }

    #[test]
    fn tlbinval_from_user_mode_keeps_the_entry() {
        let mut m = Machine::new(&[asm::tlbinval(1)]);
        m.thread.cr.write(CR_FAULT_HANDLER, 0x800);
        m.thread.cr.write(CR_FLAGS, 0);
        m.mmu.dtlb.insert(TlbEntry::from_insert(0x5000, 0x3000 | TLB_PRESENT, 0));
        m.thread.set_scalar(1, 0x5000);
        m.run(1);
        assert_eq!(m.thread.cr.fault_reason, FaultReason::PrivilegedOp.code());
        assert_eq!(m.thread.cr.fault_address, 0x5000);
        assert_eq!(m.mmu.dtlb.valid_entries(), 1);
    }

    #[test]
    fn gather_and_block_load() {
        let mut m = Machine::new(&[asm::gather(2, 1, 0), asm::load_v(3, 4, 0)]);
        let mut addrs = [0u32; NUM_VECTOR_LANES];
        for (lane, a) in addrs.iter_mut().enumerate() {
            *a = 0x1000 + lane as u32 * 8;
            m.memory.write32(*a, 7 + 2 * lane as u32).unwrap();
            m.memory.write32(0x2000 + lane as u32 * 4, lane as u32 * 3).unwrap();
        }
        m.thread.set_vector(1, &addrs, 0xffff);
        m.thread.set_scalar(4, 0x2000);
        m.run(2);

        let gathered = m.thread.vector(2);
        assert_eq!(gathered[0], 7);
        assert_eq!(gathered[1], 9);
        assert_eq!(gathered[15], 37);
        let block = m.thread.vector(3);
        assert_eq!(block[0], 0);
        assert_eq!(block[15], 45);
        assert!(matches!(
            m.events[0],
            CommitEvent::VectorWrite { pc: 0, reg: 2, mask: 0xffff, .. }
        ));
    }

    #[test]
    fn syscall_resumes_after_the_instruction() {
        let mut m = Machine::new(&[asm::addi(1, 0, 1), asm::syscall()]);
        m.thread.cr.write(CR_FAULT_HANDLER, 0x800);
        m.run(2);
        assert_eq!(m.thread.pc, 0x800);
        assert_eq!(m.thread.cr.fault_reason, FaultReason::Syscall.code());
        assert_eq!(m.thread.cr.fault_pc, 8);
        assert_eq!(m.thread.scalar(1), 1);
    }

    #[test]
    fn eret_from_user_mode_faults() {
        let mut m = Machine::new(&[asm::eret()]);
        m.thread.cr.write(CR_FAULT_HANDLER, 0x800);
        m.thread.cr.write(CR_FAULT_PC, 0x40);
        m.thread.cr.write(CR_FLAGS, 0);
        m.run(1);
        assert_eq!(m.thread.pc, 0x800);
        assert_eq!(m.thread.cr.fault_reason, FaultReason::PrivilegedOp.code());
        assert_eq!(m.thread.cr.fault_pc, 0);
        assert_eq!(m.thread.cr.flags, FLAG_SUPERVISOR_EN);
    }

    #[test]
    fn misaligned_fetch_faults() {
        let mut m = Machine::new(&[asm::addi(1, 0, 2), asm::mov(31, 1)]);
        m.thread.cr.write(CR_FAULT_HANDLER, 0x800);
        m.run(2);
        assert_eq!(m.thread.pc, 2);
        m.run(1);
        assert_eq!(m.thread.pc, 0x800);
        assert_eq!(m.thread.cr.fault_reason, FaultReason::IfetchAlignment.code());
        assert_eq!(m.thread.cr.fault_pc, 2);
        assert_eq!(m.thread.cr.fault_address, 2);
    }

    #[test]
    fn memory_outside_dram_is_fatal() {
        let mut m = Machine::new(&[asm::load(MemOp::Word, 1, 0, 0)]);
        m.thread.set_scalar(0, 0x0100_0000);
        assert!(matches!(m.step(), Err(SimError::Memory(_))));
        assert_eq!(m.thread.pc, 0);
    }
}
