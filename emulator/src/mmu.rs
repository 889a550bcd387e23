use crate::control::ControlRegisters;
use crate::cpu::FaultReason;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AccessKind {
    Fetch,
    Load,
    Store,
}

pub const PAGE_SIZE: u32 = 0x1000;
const PAGE_MASK: u32 = !(PAGE_SIZE - 1);

// Permission bits carried in the low bits of a TLB insert operand.
pub const TLB_PRESENT: u32 = 1 << 0;
pub const TLB_WRITABLE: u32 = 1 << 1;
pub const TLB_EXECUTABLE: u32 = 1 << 2;
pub const TLB_SUPERVISOR: u32 = 1 << 3;
pub const TLB_GLOBAL: u32 = 1 << 4;
const TLB_FLAG_MASK: u32 = 0x1f;

pub const DEFAULT_TLB_SETS: usize = 16;
pub const DEFAULT_TLB_WAYS: usize = 4;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TlbEntry {
    pub vpage: u32,
    pub ppage: u32,
    pub flags: u32,
    pub asid: u32,
    pub valid: bool,
}

impl TlbEntry {
    /// Build an entry from the operands of a TLB insert instruction: the
    /// virtual address and the physical address with permission bits in
    /// its low bits.
    pub fn from_insert(va: u32, pa_and_flags: u32, asid: u32) -> Self {
        Self {
            vpage: va & PAGE_MASK,
            ppage: pa_and_flags & PAGE_MASK,
            flags: pa_and_flags & TLB_FLAG_MASK,
            asid,
            valid: true,
        }
    }

    pub fn global(&self) -> bool {
        self.flags & TLB_GLOBAL != 0
    }

    fn matches(&self, vpage: u32, asid: u32) -> bool {
        self.valid && self.vpage == vpage && (self.global() || self.asid == asid)
    }
}

/// Set-associative translation cache with round-robin replacement per set.
pub struct Tlb {
    sets: usize,
    ways: usize,
    entries: Vec<TlbEntry>,
    next_way: Vec<usize>,
}

impl Tlb {
    pub fn new(sets: usize, ways: usize) -> Self {
        let sets = sets.max(1);
        let ways = ways.max(1);
        Self {
            sets,
            ways,
            entries: vec![TlbEntry::default(); sets * ways],
            next_way: vec![0; sets],
        }
    }

    fn set_index(&self, vpage: u32) -> usize {
        ((vpage / PAGE_SIZE) as usize) % self.sets
    }

    fn set(&self, vpage: u32) -> &[TlbEntry] {
        let base = self.set_index(vpage) * self.ways;
        &self.entries[base..base + self.ways]
    }

    fn set_mut(&mut self, vpage: u32) -> &mut [TlbEntry] {
        let base = self.set_index(vpage) * self.ways;
        &mut self.entries[base..base + self.ways]
    }

    pub fn lookup(&self, va: u32, asid: u32) -> Option<&TlbEntry> {
        let vpage = va & PAGE_MASK;
        self.set(vpage).iter().find(|e| e.matches(vpage, asid))
    }

    /// Install a mapping. An existing mapping for the same page and address
    /// space is replaced in place.
    pub fn insert(&mut self, entry: TlbEntry) {
        let set = self.set_index(entry.vpage);
        let slots = self.set(entry.vpage);
        let existing = slots.iter().position(|e| {
            e.valid && e.vpage == entry.vpage && (e.asid == entry.asid || e.global())
        });
        let free = slots.iter().position(|e| !e.valid);
        let way = match existing.or(free) {
            Some(way) => way,
            None => {
                let way = self.next_way[set];
                self.next_way[set] = (way + 1) % self.ways;
                way
            }
        };
        self.set_mut(entry.vpage)[way] = entry;
    }

    pub fn invalidate_entry(&mut self, va: u32, asid: u32) {
        let vpage = va & PAGE_MASK;
        for entry in self.set_mut(vpage).iter_mut() {
            if entry.matches(vpage, asid) {
                entry.valid = false;
            }
        }
    }

    pub fn invalidate_all(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.valid = false;
        }
    }

    pub fn valid_entries(&self) -> usize {
        self.entries.iter().filter(|e| e.valid).count()
    }
}

/// Instruction and data TLBs shared by the threads of a core. Entries are
/// tagged with the address-space identifier that installed them.
pub struct Mmu {
    pub itlb: Tlb,
    pub dtlb: Tlb,
}

impl Mmu {
    pub fn new(sets: usize, ways: usize) -> Self {
        Self {
            itlb: Tlb::new(sets, ways),
            dtlb: Tlb::new(sets, ways),
        }
    }

    /// Translate `va` for the thread owning `cr`.
    ///
    /// With the MMU disabled this is the identity map and the TLBs are never
    /// consulted. A failed translation returns the fault reason; the caller
    /// owns dispatching it.
    pub fn translate(
        &self,
        cr: &ControlRegisters,
        va: u32,
        kind: AccessKind,
    ) -> Result<u32, FaultReason> {
        if !cr.mmu_enabled() {
            return Ok(va);
        }

        let tlb = match kind {
            AccessKind::Fetch => &self.itlb,
            AccessKind::Load | AccessKind::Store => &self.dtlb,
        };

        let entry = match tlb.lookup(va, cr.asid) {
            Some(entry) if entry.flags & TLB_PRESENT != 0 => entry,
            _ => {
                return Err(match kind {
                    AccessKind::Fetch => FaultReason::ItlbMiss,
                    _ => FaultReason::DtlbMiss,
                })
            }
        };

        if entry.flags & TLB_SUPERVISOR != 0 && !cr.supervisor() {
            return Err(match kind {
                AccessKind::Fetch => FaultReason::IfetchSupervisor,
                _ => FaultReason::DataSupervisor,
            });
        }

        match kind {
            AccessKind::Fetch if entry.flags & TLB_EXECUTABLE == 0 => {
                return Err(FaultReason::NotExecutable)
            }
            AccessKind::Store if entry.flags & TLB_WRITABLE == 0 => {
                return Err(FaultReason::IllegalWrite)
            }
            _ => {}
        }

        Ok(entry.ppage | (va & !PAGE_MASK))
    }

    pub fn invalidate_entry(&mut self, va: u32, asid: u32) {
        self.itlb.invalidate_entry(va, asid);
        self.dtlb.invalidate_entry(va, asid);
    }

    pub fn invalidate_all(&mut self) {
        self.itlb.invalidate_all();
        self.dtlb.invalidate_all();
    }
}
